pub mod conf;
pub mod digest;
pub mod downloader;
pub mod error;
pub mod peer;
pub mod peer_server;
pub mod plan;
pub mod registry;
pub mod tracker;
pub mod wire;

/// The type of a chunk's index within a file.
pub type ChunkIndex = usize;

/// Users are identified by an arbitrary unique string chosen at registration.
pub type UserId = String;

/// Groups are identified by an arbitrary unique string chosen at creation.
pub type GroupId = String;

/// The length of a file chunk: 512 KiB. Every chunk of a shared file is
/// exactly this long, except possibly the last one.
pub const CHUNK_LEN: u64 = 512 * 1024;

/// Returns the number of chunks in a file of the given length.
pub fn chunk_count(file_len: u64) -> usize {
    // the last chunk may be shorter than the rest so we round up
    ((file_len + CHUNK_LEN - 1) / CHUNK_LEN) as usize
}

/// Returns the length of the chunk at the given index, for a file of the
/// given length.
///
/// # Panics
///
/// Panics if the index is out of range for the file.
pub fn chunk_len(file_len: u64, index: ChunkIndex) -> u64 {
    let count = chunk_count(file_len);
    assert!(index < count, "chunk index out of range");
    if index + 1 == count {
        file_len - (count as u64 - 1) * CHUNK_LEN
    } else {
        CHUNK_LEN
    }
}
