//! A single client's session with the tracker: reads requests off the
//! connection one line at a time, runs them against the store, and writes
//! back framed responses. Responses are sent in request order.

use std::{net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::{codec::Framed, sync::CancellationToken};

use super::store::{SessionId, Store, UploadOutcome};
use crate::wire::{ProtocolError, Request, ServerCodec};

pub(super) struct Session {
    id: SessionId,
    framed: Framed<TcpStream, ServerCodec>,
    store: Arc<Store>,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(
        id: SessionId,
        socket: TcpStream,
        store: Arc<Store>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            framed: Framed::new(socket, ServerCodec),
            store,
            shutdown,
        }
    }

    /// Serves the session until the client disconnects, quits, or the
    /// tracker shuts down. Always performs disconnect cleanup on the way
    /// out.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    // push the shutdown line so interactive peers can exit
                    // cleanly before the socket closes
                    let _ = self.framed.send("shutdown".to_string()).await;
                    break;
                }
                request = self.framed.next() => match request {
                    Some(Ok(request)) => {
                        let (response, disconnect) = self.dispatch(request);
                        if self.framed.send(response).await.is_err() {
                            break;
                        }
                        if disconnect {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("Session {}: transport error: {}", self.id, e);
                        break;
                    }
                    // client closed the connection
                    None => break,
                }
            }
        }
        self.store.logout_session(self.id);
        log::info!("Session {} disconnected", self.id);
    }

    /// Runs one request and renders its response text. The second element is
    /// true when the session should disconnect after replying.
    fn dispatch(
        &self,
        request: Result<Request, ProtocolError>,
    ) -> (String, bool) {
        let request = match request {
            Ok(request) => request,
            Err(e) => return (format!("Error: {}", e), false),
        };
        log::debug!("Session {}: {}", self.id, request.verb());

        let store = &self.store;
        let session = self.id;
        use Request::*;
        let result = match request {
            CreateUser { user, password } => store
                .create_user(&user, &password)
                .map(|_| "User created successfully.".to_string()),
            Login {
                user,
                password,
                ip,
                port,
            } => store
                .login(session, &user, &password, SocketAddr::new(ip, port))
                .map(|_| "Login successful.".to_string()),
            CreateGroup { group } => store
                .create_group(session, &group)
                .map(|_| "Group created successfully.".to_string()),
            JoinGroup { group } => store
                .join_group(session, &group)
                .map(|_| "Join request sent to group owner.".to_string()),
            LeaveGroup { group } => store
                .leave_group(session, &group)
                .map(|_| "Left the group successfully.".to_string()),
            ListGroups => Ok(listing(
                "Available groups:",
                &store.list_groups(),
                "No groups available.",
            )),
            ListRequests { group } => {
                store.list_requests(session, &group).map(|requests| {
                    listing(
                        "Pending requests:",
                        &requests,
                        "No pending requests.",
                    )
                })
            }
            AcceptRequest { group, user } => store
                .accept_request(session, &group, &user)
                .map(|_| "User added to the group.".to_string()),
            ListFiles { group } => {
                store.list_files(session, &group).map(|files| {
                    listing(
                        &format!("Files in group {}:", group),
                        &files,
                        "No files available in the group.",
                    )
                })
            }
            UploadFile {
                name,
                len,
                file_sha1,
                group,
                chunk_sha1s,
            } => store
                .upload_file(
                    session,
                    &group,
                    &name,
                    len,
                    &file_sha1,
                    chunk_sha1s,
                )
                .map(|outcome| {
                    match outcome {
                        UploadOutcome::Created => {
                            "File uploaded successfully."
                        }
                        UploadOutcome::AddedAsSharer => {
                            "File already exists. Added you as a sharer."
                        }
                        UploadOutcome::AlreadySharing => {
                            "You are already sharing this file."
                        }
                    }
                    .to_string()
                }),
            DownloadFile { group, name } => store
                .download_file(session, &group, &name)
                .map(|plan| plan.to_string()),
            Quit => return ("Goodbye!".to_string(), true),
            // shutdown is an administrative operation; it is only accepted
            // on the tracker console, never from a client session
            Shutdown => {
                return (
                    "Error: Shutdown is only accepted on the tracker console."
                        .to_string(),
                    false,
                )
            }
        };

        match result {
            Ok(text) => (text, false),
            Err(e) => (format!("Error: {}", e), false),
        }
    }
}

/// Renders a list response: a header line followed by one item per line, or
/// the empty-case text when there are no items.
fn listing(header: &str, items: &[String], empty: &str) -> String {
    if items.is_empty() {
        empty.to_string()
    } else {
        let mut text = header.to_string();
        for item in items {
            text.push('\n');
            text.push_str(item);
        }
        text
    }
}
