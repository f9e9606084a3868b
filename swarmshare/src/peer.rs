//! The peer's side of the tracker protocol: a persistent session over which
//! commands are issued in order, plus the orchestration of the two commands
//! that are more than a round trip — `upload_file` (digest locally, ship
//! only the manifest) and `download_file` (fetch the plan, run the parallel
//! downloader).

use std::{net::SocketAddr, path::Path};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::{
    digest::FileManifest,
    downloader::{self, DownloadSummary},
    error::*,
    plan::DownloadPlan,
    registry::{FileRegistry, SharedFile},
    wire::{ClientCodec, Request},
};

/// What the tracker sent back for a single request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// The response text, with its trailing newline.
    Response(String),
    /// The tracker pushed its shutdown notice; the session is no longer
    /// usable.
    Shutdown,
}

impl Reply {
    /// Returns the response text, with surrounding whitespace trimmed, or
    /// a fixed notice for a shutdown push.
    pub fn text(&self) -> &str {
        match self {
            Self::Response(text) => text.trim(),
            Self::Shutdown => "Tracker is shutting down.",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Response(text) if text.starts_with("Error:"))
    }
}

/// How a `download_file` command ended.
#[derive(Debug)]
pub enum DownloadOutcome {
    /// All chunks fetched and reassembled; see the summary for the written
    /// path and whether the final digest matched.
    Complete(DownloadSummary),
    /// The tracker refused the request; holds the `Error:` response text.
    Refused(String),
    /// The tracker shut down before answering.
    Shutdown,
}

/// A peer's persistent session with the tracker, bound at login to one user.
pub struct TrackerSession {
    framed: Framed<TcpStream, ClientCodec>,
    /// The endpoint advertised at login: where this peer's chunk server
    /// listens.
    listen_addr: SocketAddr,
}

impl TrackerSession {
    /// Connects to the tracker. `listen_addr` is this peer's chunk server
    /// endpoint, sent along with every login.
    pub async fn connect(
        tracker_addr: SocketAddr,
        listen_addr: SocketAddr,
    ) -> Result<Self> {
        let socket = TcpStream::connect(tracker_addr).await?;
        log::info!("Connected to tracker at {}", tracker_addr);
        Ok(Self {
            framed: Framed::new(socket, ClientCodec),
            listen_addr,
        })
    }

    /// Issues one request and waits for its response. Responses arrive in
    /// request order.
    pub async fn request(&mut self, request: Request) -> Result<Reply> {
        self.framed.send(request).await?;
        self.next_reply().await
    }

    /// Waits for the next frame from the tracker without sending anything.
    /// This is how an unsolicited shutdown push is observed while idle.
    pub async fn next_reply(&mut self) -> Result<Reply> {
        match self.framed.next().await {
            Some(Ok(text)) => {
                if text.trim() == "shutdown" {
                    Ok(Reply::Shutdown)
                } else {
                    Ok(Reply::Response(text))
                }
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Logs in, advertising this peer's chunk server endpoint.
    pub async fn login(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<Reply> {
        let request = Request::Login {
            user: user.to_string(),
            password: password.to_string(),
            ip: self.listen_addr.ip(),
            port: self.listen_addr.port(),
        };
        self.request(request).await
    }

    /// Publishes a local file into a group: chunks and digests it locally,
    /// ships only the manifest to the tracker, and on acceptance registers
    /// the file so the chunk server will serve it.
    pub async fn upload_file(
        &mut self,
        registry: &FileRegistry,
        path: &Path,
        group: &str,
    ) -> Result<Reply> {
        let name = base_name(path)?;
        let manifest = match FileManifest::from_file(path) {
            Ok(manifest) => manifest,
            Err(e) => {
                log::error!(
                    "Cannot compute digest of {}: {}",
                    path.display(),
                    e
                );
                return Err(e.into());
            }
        };
        log::info!(
            "Uploading {} ({} bytes, {} chunk(s)) to group {}",
            name,
            manifest.len,
            manifest.chunk_count(),
            group
        );

        let request = Request::UploadFile {
            name: name.clone(),
            len: manifest.len,
            file_sha1: manifest.file_sha1.clone(),
            group: group.to_string(),
            chunk_sha1s: manifest.chunk_sha1s.clone(),
        };
        let reply = self.request(request).await?;

        // any non-error response means the tracker now lists us as a sharer,
        // so the chunk server must be able to answer for the file
        if let Reply::Response(_) = &reply {
            if !reply.is_error() {
                registry
                    .insert(SharedFile::new(name, path.to_path_buf(), manifest))
                    .await;
            }
        }
        Ok(reply)
    }

    /// Fetches the download plan for a file and reconstructs it under
    /// `dest_dir` with the parallel downloader.
    pub async fn download_file(
        &mut self,
        group: &str,
        file_name: &str,
        dest_dir: &Path,
        workers: usize,
    ) -> Result<DownloadOutcome> {
        let request = Request::DownloadFile {
            group: group.to_string(),
            name: file_name.to_string(),
        };
        let text = match self.request(request).await? {
            Reply::Shutdown => return Ok(DownloadOutcome::Shutdown),
            Reply::Response(text) if text.starts_with("Error:") => {
                return Ok(DownloadOutcome::Refused(text.trim().to_string()))
            }
            Reply::Response(text) => text,
        };

        let plan = DownloadPlan::parse(&text)?;
        let summary =
            downloader::download(&plan, file_name, dest_dir, workers).await?;
        Ok(DownloadOutcome::Complete(summary))
    }

    /// Ends the session at the tracker and returns its goodbye.
    pub async fn quit(&mut self) -> Result<Reply> {
        self.request(Request::Quit).await
    }
}

/// Returns the base file name a path is published under.
fn base_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            Error::Io(IoError::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no file name", path.display()),
            ))
        })
}
