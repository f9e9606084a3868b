//! The download plan the tracker synthesizes for a `download_file` request.
//!
//! On the wire the plan is the `download_info` response: a single logical
//! line of whitespace-separated tokens enumerating, for every chunk, its
//! expected digest and the live endpoints of every logged-in user that owns
//! it.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use crate::{chunk_len, wire::ProtocolError, ChunkIndex, UserId, CHUNK_LEN};

/// A logged-in user known by the tracker to possess a particular chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Holder {
    pub user: UserId,
    pub addr: SocketAddr,
}

/// One chunk's entry in a download plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    pub index: ChunkIndex,
    /// The digest the downloaded chunk must hash to.
    pub sha1: String,
    /// Everyone the chunk can currently be fetched from, in the order the
    /// downloader should try them.
    pub holders: Vec<Holder>,
}

/// Everything a peer needs to reconstruct a file: sizes, digests, and per
/// chunk holder endpoints. Emitted by the tracker as an owned snapshot of its
/// state at the moment of the query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadPlan {
    pub file_len: u64,
    /// The chunk length the manifest was computed with, advertised so both
    /// sides agree on chunk boundaries.
    pub chunk_len: u64,
    pub file_sha1: String,
    /// Entries in ascending chunk index order.
    pub chunks: Vec<ChunkPlan>,
}

impl DownloadPlan {
    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Returns the exact byte length of the chunk at the given index.
    pub fn expected_len(&self, index: ChunkIndex) -> u64 {
        chunk_len(self.file_len, index)
    }

    /// Parses a `download_info` response.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut tokens = text.split_whitespace();
        let mut next = || tokens.next().ok_or(ProtocolError::InvalidPlan);

        if next()? != "download_info" {
            return Err(ProtocolError::InvalidPlan);
        }
        let file_len = parse_token(next()?)?;
        let total_chunks: usize = parse_token(next()?)?;
        let chunk_len = parse_token(next()?)?;
        let file_sha1 = next()?.to_string();

        let mut chunks = Vec::with_capacity(total_chunks);
        for _ in 0..total_chunks {
            let index = parse_token(next()?)?;
            let holder_count: usize = parse_token(next()?)?;
            let sha1 = next()?.to_string();
            let mut holders = Vec::with_capacity(holder_count);
            for _ in 0..holder_count {
                let user = next()?.to_string();
                let ip: IpAddr = parse_token(next()?)?;
                let port = parse_token(next()?)?;
                holders.push(Holder {
                    user,
                    addr: SocketAddr::new(ip, port),
                });
            }
            chunks.push(ChunkPlan {
                index,
                sha1,
                holders,
            });
        }

        Ok(Self {
            file_len,
            chunk_len,
            file_sha1,
            chunks,
        })
    }
}

impl fmt::Display for DownloadPlan {
    /// Encodes the plan as its `download_info` wire line, without the
    /// trailing newline.
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "download_info {} {} {} {}",
            self.file_len,
            self.chunks.len(),
            self.chunk_len,
            self.file_sha1
        )?;
        for chunk in &self.chunks {
            write!(
                fmt,
                " {} {} {}",
                chunk.index,
                chunk.holders.len(),
                chunk.sha1
            )?;
            for holder in &chunk.holders {
                write!(
                    fmt,
                    " {} {} {}",
                    holder.user,
                    holder.addr.ip(),
                    holder.addr.port()
                )?;
            }
        }
        Ok(())
    }
}

fn parse_token<T: std::str::FromStr>(
    token: &str,
) -> Result<T, ProtocolError> {
    token.parse().map_err(|_| ProtocolError::InvalidPlan)
}

/// Returns a plan skeleton for the given file, to be filled in with chunks.
pub fn plan_header(file_len: u64, file_sha1: String) -> DownloadPlan {
    DownloadPlan {
        file_len,
        chunk_len: CHUNK_LEN,
        file_sha1,
        chunks: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(user: &str, port: u16) -> Holder {
        Holder {
            user: user.into(),
            addr: SocketAddr::new("127.0.0.1".parse().unwrap(), port),
        }
    }

    // Tests that a plan with a mix of holder counts round-trips through the
    // wire encoding.
    #[test]
    fn test_plan_round_trip() {
        let mut plan = plan_header(CHUNK_LEN + 100, "ab".repeat(20));
        plan.chunks = vec![
            ChunkPlan {
                index: 0,
                sha1: "cd".repeat(20),
                holders: vec![holder("alice", 6001), holder("bob", 6002)],
            },
            ChunkPlan {
                index: 1,
                sha1: "ef".repeat(20),
                holders: vec![],
            },
        ];

        let encoded = plan.to_string();
        assert!(encoded.starts_with("download_info "));
        let parsed = DownloadPlan::parse(&encoded).unwrap();
        assert_eq!(parsed, plan);
    }

    // Tests that the expected chunk lengths follow the chunk size law.
    #[test]
    fn test_expected_len() {
        let mut plan = plan_header(CHUNK_LEN + 100, "ab".repeat(20));
        plan.chunks = vec![
            ChunkPlan {
                index: 0,
                sha1: String::new(),
                holders: vec![],
            },
            ChunkPlan {
                index: 1,
                sha1: String::new(),
                holders: vec![],
            },
        ];
        assert_eq!(plan.expected_len(0), CHUNK_LEN);
        assert_eq!(plan.expected_len(1), 100);
    }

    // Tests that truncated and garbled responses are rejected.
    #[test]
    fn test_parse_errors() {
        assert_eq!(
            DownloadPlan::parse("not_download_info 1 2 3"),
            Err(ProtocolError::InvalidPlan)
        );
        // holder count promises more tokens than are present
        assert_eq!(
            DownloadPlan::parse("download_info 100 1 524288 abcd 0 2 ef"),
            Err(ProtocolError::InvalidPlan)
        );
        assert_eq!(
            DownloadPlan::parse("download_info nonsense 1 524288 abcd"),
            Err(ProtocolError::InvalidPlan)
        );
    }
}
