//! The peer's chunk server.
//!
//! Serves one `get_chunk` request per accepted connection: on success the
//! raw chunk bytes are streamed with no framing, on failure a single ASCII
//! `Error: ...` line is sent. Either way the connection is closed afterwards.
//! Reads are idempotent and published files are treated as immutable, so
//! concurrent requests need no per-file locking.

use std::{fmt, io::SeekFrom, net::SocketAddr, sync::Arc};

use tokio::{
    fs,
    io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task,
};
use tokio_util::sync::CancellationToken;

use crate::{
    chunk_count, chunk_len, error::*, registry::FileRegistry, wire, ChunkIndex,
    CHUNK_LEN,
};

/// Serves chunks of locally published files to other peers until shut down.
pub struct ChunkServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<FileRegistry>,
    shutdown: CancellationToken,
}

impl ChunkServer {
    /// Binds the server. Binding to port 0 is allowed; the actual address is
    /// available via [`Self::local_addr`].
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<FileRegistry>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Chunk server listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            registry,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until the shutdown token fires, spawning one
    /// handler task per connection.
    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    log::info!("Chunk server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        log::debug!("Chunk request connection from {}", addr);
                        let registry = Arc::clone(&self.registry);
                        task::spawn(async move {
                            if let Err(e) = serve(socket, &registry).await {
                                log::warn!(
                                    "Failed to serve chunk request from {}: {}",
                                    addr,
                                    e
                                );
                            }
                        });
                    }
                    Err(e) => log::warn!("Chunk server accept failed: {}", e),
                }
            }
        }
    }
}

/// Why a chunk request could not be served. The variants map onto the error
/// lines sent back to the requesting peer.
#[derive(Debug)]
enum ServeError {
    /// The request line was not a valid `get_chunk` command.
    BadRequest,
    /// The file is not in the local registry.
    NotShared,
    /// The on-disk file could not be stat'd.
    Stat,
    /// The chunk index is out of range for the file's current size.
    BadIndex,
    Open,
    Seek,
    /// The read failed or hit end of file before the chunk was complete,
    /// which means the on-disk file is truncated.
    Read,
}

impl ServeError {
    fn wire_line(&self) -> &'static str {
        use ServeError::*;
        match self {
            BadRequest => "Error: Invalid command.\n",
            NotShared => "Error: File not found.\n",
            Stat => "Error: Cannot get file size.\n",
            BadIndex => "Error: Invalid chunk index.\n",
            Open => "Error: Cannot open file.\n",
            Seek => "Error: Cannot seek to chunk.\n",
            Read => "Error: Cannot read chunk.\n",
        }
    }
}

impl fmt::Display for ServeError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the wire line is a fine human readable description too
        write!(fmt, "{}", self.wire_line().trim_end())
    }
}

/// Reads the single request off the connection and answers it with either
/// the raw chunk bytes or an error line.
async fn serve(mut socket: TcpStream, registry: &FileRegistry) -> Result<()> {
    let (read_half, mut write_half) = socket.split();
    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await?;

    match load_chunk(&line, registry).await {
        Ok((name, index, data)) => {
            log::debug!(
                "Serving chunk {} of {} ({} bytes)",
                index,
                name,
                data.len()
            );
            write_half.write_all(&data).await?;
        }
        Err(e) => {
            write_half.write_all(e.wire_line().as_bytes()).await?;
        }
    }
    write_half.shutdown().await?;
    Ok(())
}

/// Resolves a request line to the requested chunk's bytes.
///
/// The whole chunk is read into memory and validated before anything is
/// written to the socket, so an error line is never preceded by payload
/// bytes.
async fn load_chunk(
    line: &str,
    registry: &FileRegistry,
) -> std::result::Result<(String, ChunkIndex, Vec<u8>), ServeError> {
    let (name, index) =
        wire::parse_get_chunk(line).map_err(|_| ServeError::BadRequest)?;
    let file = registry.get(&name).await.ok_or(ServeError::NotShared)?;

    // size the chunk off the file's current on-disk length; the index came
    // from a tracker plan but still has to be bounds checked
    let file_len = fs::metadata(&file.path)
        .await
        .map_err(|_| ServeError::Stat)?
        .len();
    if index >= chunk_count(file_len) {
        return Err(ServeError::BadIndex);
    }
    let expected_len = chunk_len(file_len, index);

    let mut handle =
        fs::File::open(&file.path).await.map_err(|_| ServeError::Open)?;
    handle
        .seek(SeekFrom::Start(index as u64 * CHUNK_LEN))
        .await
        .map_err(|_| ServeError::Seek)?;

    let mut data = vec![0; expected_len as usize];
    handle
        .read_exact(&mut data)
        .await
        .map_err(|_| ServeError::Read)?;

    Ok((name, index, data))
}
