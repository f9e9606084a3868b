use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
};

/// The number of chunks a download fetches concurrently unless configured
/// otherwise.
pub const DEFAULT_DOWNLOAD_WORKERS: usize = 8;

/// Peer configuration.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The address the chunk server listens on and that is advertised to the
    /// tracker at login.
    pub listen_addr: SocketAddr,
    /// The tracker endpoint this peer connects to.
    pub tracker_addr: SocketAddr,
    /// Where downloaded files are placed when the user gives a relative
    /// destination.
    pub download_dir: PathBuf,
    pub download_workers: usize,
}

impl Conf {
    pub fn new(listen_addr: SocketAddr, tracker_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            tracker_addr,
            download_dir: PathBuf::from("."),
            download_workers: DEFAULT_DOWNLOAD_WORKERS,
        }
    }
}

/// The tracker endpoint file: two whitespace-separated `<ip> <port>` lines.
/// The tracker binds the line selected on its command line; peers connect to
/// the first line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackerInfo {
    pub primary: SocketAddr,
    pub secondary: SocketAddr,
}

impl TrackerInfo {
    pub fn load(path: &Path) -> io::Result<Self> {
        fs::read_to_string(path)?.parse()
    }

    /// Returns the endpoint for a 1-based tracker number, or `None` if the
    /// number is out of range.
    pub fn select(&self, tracker_no: usize) -> Option<SocketAddr> {
        match tracker_no {
            1 => Some(self.primary),
            2 => Some(self.secondary),
            _ => None,
        }
    }
}

impl std::str::FromStr for TrackerInfo {
    type Err = io::Error;

    fn from_str(s: &str) -> io::Result<Self> {
        let invalid = || {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "tracker info must hold two `<ip> <port>` lines",
            )
        };
        let mut tokens = s.split_whitespace();
        let mut endpoint = || -> io::Result<SocketAddr> {
            let ip = tokens.next().ok_or_else(invalid)?;
            let port = tokens.next().ok_or_else(invalid)?;
            Ok(SocketAddr::new(
                ip.parse().map_err(|_| invalid())?,
                port.parse().map_err(|_| invalid())?,
            ))
        };
        Ok(Self {
            primary: endpoint()?,
            secondary: endpoint()?,
        })
    }
}
