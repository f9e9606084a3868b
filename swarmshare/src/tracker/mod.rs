//! The tracker: a metadata-only coordinator. It never sees file contents,
//! only manifests and ownership, and answers lookups with download plans.
//!
//! The tracker runs two loops: the accept loop, spawning one session task
//! per client connection, and the console loop, reading administrative
//! commands from standard input. Shutdown is signalled through a
//! cancellation token observed by every loop and session; each session
//! pushes a final `shutdown` line to its client before closing.

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::error::*;
use session::Session;
use store::SessionId;

mod session;
pub mod store;

pub use store::{Store, StoreError, UploadOutcome};

pub struct Tracker {
    listener: TcpListener,
    local_addr: SocketAddr,
    store: Arc<Store>,
    shutdown: CancellationToken,
}

impl Tracker {
    /// Binds the tracker's listener. Binding to port 0 is allowed; the
    /// actual address is available via [`Self::local_addr`].
    pub async fn bind(
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Tracker listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            store: Arc::new(Store::new()),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts and serves client sessions until the shutdown token fires,
    /// then waits for every session to push its shutdown line and close.
    pub async fn run(self) {
        let mut sessions = JoinSet::new();
        let mut next_id: SessionId = 1;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    log::info!("Tracker shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        log::info!(
                            "Session {}: connection accepted from {}",
                            next_id,
                            addr
                        );
                        let session = Session::new(
                            next_id,
                            socket,
                            Arc::clone(&self.store),
                            self.shutdown.clone(),
                        );
                        next_id += 1;
                        sessions.spawn(session.run());
                    }
                    Err(e) => log::warn!("Accept failed: {}", e),
                }
            }
        }
        while sessions.join_next().await.is_some() {}
        log::info!("Tracker closed");
    }
}

/// The tracker console: reads commands from standard input and cancels the
/// shutdown token when `shutdown` is typed. Anything else is rejected with a
/// hint.
pub async fn console_loop(shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "shutdown" => {
                        log::info!("Shutdown requested on console");
                        shutdown.cancel();
                        break;
                    }
                    "" => {}
                    _ => println!(
                        "Unknown command. Type 'shutdown' to stop the tracker."
                    ),
                },
                // console closed (EOF) or unreadable; the tracker keeps
                // serving and can still be stopped by signal
                Ok(None) | Err(_) => break,
            }
        }
    }
}
