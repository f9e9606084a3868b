//! SHA-1 digests over buffers and files. Digests travel on the wire as
//! 40 character lowercase hex strings, so that is the only form this module
//! produces.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use sha1::{Digest, Sha1};

use crate::{chunk_count, CHUNK_LEN};

// Files are hashed in reads of this size rather than loaded whole.
const READ_BUF_LEN: usize = 0x4000;

/// Returns the SHA-1 digest of the buffer as a lowercase hex string.
pub fn sha1_hex(buf: &[u8]) -> String {
    hex::encode(Sha1::digest(buf))
}

/// Returns the SHA-1 digest of the file's contents, streamed from disk in
/// fixed size reads.
pub fn file_sha1(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0; READ_BUF_LEN];
    loop {
        let read_count = file.read(&mut buf)?;
        if read_count == 0 {
            break;
        }
        hasher.update(&buf[..read_count]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// The full digest manifest of a local file: its length, whole-file SHA-1,
/// and the SHA-1 of each chunk, in chunk index order.
///
/// This is everything `upload_file` ships to the tracker; the file contents
/// themselves never leave the peer until another peer requests a chunk.
#[derive(Clone, Debug)]
pub struct FileManifest {
    pub len: u64,
    pub file_sha1: String,
    pub chunk_sha1s: Vec<String>,
}

impl FileManifest {
    /// Computes the manifest in a single streaming pass over the file.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut file_hasher = Sha1::new();
        let mut chunk_hasher = Sha1::new();
        let mut chunk_sha1s = Vec::new();
        // how many bytes of the current chunk have been hashed
        let mut chunk_fill: u64 = 0;
        let mut len: u64 = 0;

        let mut buf = [0; READ_BUF_LEN];
        loop {
            let read_count = file.read(&mut buf)?;
            if read_count == 0 {
                break;
            }
            file_hasher.update(&buf[..read_count]);
            len += read_count as u64;

            // a single read may straddle a chunk boundary
            let mut offset = 0;
            while offset < read_count {
                let take = (read_count - offset)
                    .min((CHUNK_LEN - chunk_fill) as usize);
                chunk_hasher.update(&buf[offset..offset + take]);
                chunk_fill += take as u64;
                offset += take;
                if chunk_fill == CHUNK_LEN {
                    chunk_sha1s.push(hex::encode(chunk_hasher.finalize_reset()));
                    chunk_fill = 0;
                }
            }
        }
        if chunk_fill > 0 {
            chunk_sha1s.push(hex::encode(chunk_hasher.finalize_reset()));
        }
        debug_assert_eq!(chunk_sha1s.len(), chunk_count(len));

        Ok(Self {
            len,
            file_sha1: hex::encode(file_hasher.finalize()),
            chunk_sha1s,
        })
    }

    /// Returns the number of chunks in the file.
    pub fn chunk_count(&self) -> usize {
        self.chunk_sha1s.len()
    }
}
