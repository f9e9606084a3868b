//! The errors that may occur in the library's network-facing components.
//! Subsystems with richer failure modes (the downloader, the tracker store)
//! define their own error types and are re-exported here.

use std::fmt;

pub use crate::{downloader::DownloadError, wire::ProtocolError};
pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The channel on which some component was listening or sending died.
    Channel,
    /// The remote end closed the connection.
    ConnectionClosed,
    /// Holds IO related errors.
    Io(IoError),
    /// The remote end sent something that does not conform to the wire
    /// protocol.
    Protocol(ProtocolError),
    /// A download could not be completed.
    Download(DownloadError),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            Channel => write!(fmt, "channel error"),
            ConnectionClosed => write!(fmt, "connection closed"),
            Io(e) => e.fmt(fmt),
            Protocol(e) => e.fmt(fmt),
            Download(e) => e.fmt(fmt),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use Error::*;
        match self {
            Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<DownloadError> for Error {
    fn from(e: DownloadError) -> Self {
        Self::Download(e)
    }
}

impl<T> From<SendError<T>> for Error {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
