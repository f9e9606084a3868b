//! The parallel chunk downloader.
//!
//! Given a tracker-issued [`DownloadPlan`], fetches every chunk from the
//! peers that hold it and reassembles them into the destination file. Chunks
//! are scheduled rarest first: the fewer holders a chunk has, the sooner it
//! is fetched, which maximizes the chance that a scarce chunk still has a
//! live holder by the time it is needed. A bounded pool of workers consumes
//! the chunk queue; within a chunk, holders are tried sequentially and the
//! first verified fetch wins.
//!
//! Every received chunk is verified against its expected SHA-1 before being
//! accepted. This also rejects `Error: ...` lines a peer may answer with,
//! since their digest cannot match. After reassembly the whole file is
//! hashed once more and compared against the plan's file digest.

use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    task,
};

use crate::{
    digest,
    plan::{DownloadPlan, Holder},
    wire, ChunkIndex,
};

/// Why a download failed.
#[derive(Debug)]
pub enum DownloadError {
    /// Every holder of these chunks was tried and none produced a verified
    /// copy. The other chunks were still written to the destination file.
    MissingChunks(Vec<ChunkIndex>),
    /// The destination file could not be created, written, or re-read for
    /// verification.
    Io(io::Error),
}

impl fmt::Display for DownloadError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingChunks(indices) => {
                write!(fmt, "missing chunk(s): {:?}", indices)
            }
            Self::Io(e) => e.fmt(fmt),
        }
    }
}

impl std::error::Error for DownloadError {}

impl From<io::Error> for DownloadError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// A completed download.
#[derive(Debug)]
pub struct DownloadSummary {
    /// Where the reassembled file was written.
    pub path: PathBuf,
    /// Whether the reassembled file's SHA-1 matches the plan's. On mismatch
    /// the file is left in place regardless.
    pub verified: bool,
}

// One chunk's work order: everything a worker needs to fetch and verify it.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ChunkJob {
    index: ChunkIndex,
    len: u64,
    sha1: String,
    holders: Vec<Holder>,
}

/// Downloads the file described by the plan into `<dest_dir>/<file_name>`.
///
/// `workers` bounds how many chunks are fetched concurrently.
pub async fn download(
    plan: &DownloadPlan,
    file_name: &str,
    dest_dir: &Path,
    workers: usize,
) -> Result<DownloadSummary, DownloadError> {
    let total_chunks = plan.total_chunks();
    log::info!(
        "Downloading {} ({} bytes, {} chunk(s)) to {:?}",
        file_name,
        plan.file_len,
        total_chunks,
        dest_dir
    );

    let queue = Arc::new(Mutex::new(rarest_first(plan)));
    let (result_chan, mut result_port) = mpsc::unbounded_channel();

    let worker_count = workers.max(1).min(total_chunks.max(1));
    for _ in 0..worker_count {
        let queue = Arc::clone(&queue);
        let result_chan = result_chan.clone();
        let file_name = file_name.to_string();
        task::spawn(async move {
            run_worker(queue, result_chan, &file_name).await;
        });
    }
    // workers hold the remaining senders; the result port closes once they
    // are all done
    drop(result_chan);

    let mut chunks: HashMap<ChunkIndex, Vec<u8>> = HashMap::new();
    while let Some((index, data)) = result_port.recv().await {
        if let Some(data) = data {
            chunks.insert(index, data);
        }
    }

    reassemble(plan, file_name, dest_dir, &chunks).await
}

/// Returns the plan's chunks as work orders, scarcest holder set first.
/// Ties keep their original index order.
fn rarest_first(plan: &DownloadPlan) -> VecDeque<ChunkJob> {
    let mut jobs: Vec<ChunkJob> = plan
        .chunks
        .iter()
        .map(|chunk| ChunkJob {
            index: chunk.index,
            len: plan.expected_len(chunk.index),
            sha1: chunk.sha1.clone(),
            holders: chunk.holders.clone(),
        })
        .collect();
    jobs.sort_by_key(|job| job.holders.len());
    jobs.into()
}

/// Pulls chunk jobs off the queue until it is drained, publishing each
/// result on the channel.
async fn run_worker(
    queue: Arc<Mutex<VecDeque<ChunkJob>>>,
    results: mpsc::UnboundedSender<(ChunkIndex, Option<Vec<u8>>)>,
    file_name: &str,
) {
    loop {
        let job = queue.lock().expect("chunk queue poisoned").pop_front();
        let Some(job) = job else {
            break;
        };
        let index = job.index;
        let data = fetch_chunk(file_name, &job).await;
        if results.send((index, data)).is_err() {
            // the downloader is gone, no point fetching more
            break;
        }
    }
}

/// Tries each holder in the job's listed order until one produces a chunk
/// that hashes to the expected digest. Returns `None` if the holder list is
/// exhausted.
async fn fetch_chunk(file_name: &str, job: &ChunkJob) -> Option<Vec<u8>> {
    for holder in &job.holders {
        match fetch_from_holder(holder, file_name, job).await {
            Ok(data) => {
                log::debug!(
                    "Downloaded chunk {} of {} from {} ({})",
                    job.index,
                    file_name,
                    holder.user,
                    holder.addr
                );
                return Some(data);
            }
            Err(e) => {
                log::warn!(
                    "Failed to fetch chunk {} of {} from {} ({}): {}",
                    job.index,
                    file_name,
                    holder.user,
                    holder.addr,
                    e
                );
            }
        }
    }
    log::warn!(
        "No holder could provide chunk {} of {}",
        job.index,
        file_name
    );
    None
}

/// A single fetch attempt against one holder: connect, request, read the
/// exact chunk length, verify the digest.
async fn fetch_from_holder(
    holder: &Holder,
    file_name: &str,
    job: &ChunkJob,
) -> io::Result<Vec<u8>> {
    let mut socket = TcpStream::connect(holder.addr).await?;
    socket
        .write_all(wire::get_chunk_line(file_name, job.index).as_bytes())
        .await?;

    // a short read, an error line, or a closed connection all fail the
    // read_exact and with it the attempt
    let mut data = vec![0; job.len as usize];
    socket.read_exact(&mut data).await?;

    let actual = digest::sha1_hex(&data);
    if actual != job.sha1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("chunk digest mismatch: expected {}, got {}", job.sha1, actual),
        ));
    }
    Ok(data)
}

/// Writes the fetched chunks to the destination file in index order and
/// verifies the result against the plan's file digest.
async fn reassemble(
    plan: &DownloadPlan,
    file_name: &str,
    dest_dir: &Path,
    chunks: &HashMap<ChunkIndex, Vec<u8>>,
) -> Result<DownloadSummary, DownloadError> {
    let path = dest_dir.join(file_name);
    let mut out = fs::File::create(&path).await?;

    let mut missing = Vec::new();
    for index in 0..plan.total_chunks() {
        match chunks.get(&index) {
            Some(data) => out.write_all(data).await?,
            None => missing.push(index),
        }
    }
    out.flush().await?;
    drop(out);

    if !missing.is_empty() {
        log::warn!(
            "Download of {} is incomplete, missing chunk(s) {:?}",
            file_name,
            missing
        );
        return Err(DownloadError::MissingChunks(missing));
    }

    let actual = digest::file_sha1(&path)?;
    let verified = actual == plan.file_sha1;
    if verified {
        log::info!("Downloaded and verified {}", file_name);
    } else {
        log::warn!(
            "Verification failed for {:?}: expected {}, got {}",
            path,
            plan.file_sha1,
            actual
        );
    }
    Ok(DownloadSummary { path, verified })
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::plan::{plan_header, ChunkPlan};

    fn holder(user: &str, port: u16) -> Holder {
        Holder {
            user: user.into(),
            addr: SocketAddr::new("127.0.0.1".parse().unwrap(), port),
        }
    }

    fn plan_with_holder_counts(counts: &[usize]) -> DownloadPlan {
        let mut plan = plan_header(
            counts.len() as u64 * crate::CHUNK_LEN,
            "ab".repeat(20),
        );
        plan.chunks = counts
            .iter()
            .enumerate()
            .map(|(index, count)| ChunkPlan {
                index,
                sha1: format!("{:040}", index),
                holders: (0..*count)
                    .map(|h| holder(&format!("u{}", h), 6000 + h as u16))
                    .collect(),
            })
            .collect();
        plan
    }

    // Tests that chunks are ordered by ascending holder count, with ties
    // keeping their index order.
    #[test]
    fn test_rarest_first_ordering() {
        let plan = plan_with_holder_counts(&[3, 1, 2, 1, 3]);
        let order: Vec<ChunkIndex> =
            rarest_first(&plan).iter().map(|job| job.index).collect();
        assert_eq!(order, vec![1, 3, 2, 0, 4]);
    }

    // Tests that a plan whose chunks all have the same availability is
    // fetched in index order.
    #[test]
    fn test_rarest_first_is_stable() {
        let plan = plan_with_holder_counts(&[2, 2, 2, 2]);
        let order: Vec<ChunkIndex> =
            rarest_first(&plan).iter().map(|job| job.index).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    // Tests that jobs carry the exact expected chunk lengths, including the
    // short final chunk.
    #[test]
    fn test_jobs_carry_expected_lengths() {
        let mut plan = plan_header(crate::CHUNK_LEN + 100, "ab".repeat(20));
        plan.chunks = vec![
            ChunkPlan {
                index: 0,
                sha1: String::new(),
                holders: vec![holder("a", 6001)],
            },
            ChunkPlan {
                index: 1,
                sha1: String::new(),
                holders: vec![holder("a", 6001)],
            },
        ];
        let jobs = rarest_first(&plan);
        let job0 = jobs.iter().find(|j| j.index == 0).unwrap();
        let job1 = jobs.iter().find(|j| j.index == 1).unwrap();
        assert_eq!(job0.len, crate::CHUNK_LEN);
        assert_eq!(job1.len, 100);
    }

    // Tests that a holder answering with an error line instead of chunk
    // bytes fails the attempt, exhausting the holder list and leaving the
    // chunk missing.
    #[tokio::test]
    async fn test_error_line_fails_the_attempt() {
        use tokio::{io::AsyncWriteExt, net::TcpListener};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::task::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"Error: File not found.\n")
                .await
                .unwrap();
        });

        let mut plan = plan_header(crate::CHUNK_LEN, "ab".repeat(20));
        plan.chunks = vec![ChunkPlan {
            index: 0,
            sha1: "cd".repeat(20),
            holders: vec![Holder {
                user: "liar".into(),
                addr,
            }],
        }];

        let dest = std::env::temp_dir();
        match download(&plan, "downloader_test_error_line.bin", &dest, 1)
            .await
        {
            Err(DownloadError::MissingChunks(indices)) => {
                assert_eq!(indices, vec![0]);
            }
            other => panic!("expected missing chunks, got {:?}", other),
        }
        let _ = std::fs::remove_file(
            dest.join("downloader_test_error_line.bin"),
        );
    }

    // Tests that a chunk with no holders at all is reported missing while
    // the present chunks are still written.
    #[tokio::test]
    async fn test_no_holders_means_missing_chunk() {
        let plan = plan_with_holder_counts(&[0]);
        let dest = std::env::temp_dir();
        match download(&plan, "downloader_test_missing.bin", &dest, 4).await {
            Err(DownloadError::MissingChunks(indices)) => {
                assert_eq!(indices, vec![0]);
            }
            other => panic!("expected missing chunks, got {:?}", other),
        }
        let _ = std::fs::remove_file(
            dest.join("downloader_test_missing.bin"),
        );
    }
}
