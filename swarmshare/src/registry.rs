use std::{collections::HashMap, path::PathBuf, sync::Arc};

use tokio::sync::RwLock;

use crate::digest::FileManifest;

/// A locally published file, as the chunk server needs to see it: the name
/// it was announced under, where its bytes live on disk, and its digest
/// manifest.
#[derive(Clone, Debug)]
pub struct SharedFile {
    /// The base file name, which is the file's identity on the wire.
    pub name: String,
    /// The on-disk location chunks are served from. The file is treated as
    /// immutable once published.
    pub path: PathBuf,
    pub len: u64,
    pub file_sha1: String,
    pub chunk_sha1s: Vec<String>,
}

impl SharedFile {
    pub fn new(name: String, path: PathBuf, manifest: FileManifest) -> Self {
        Self {
            name,
            path,
            len: manifest.len,
            file_sha1: manifest.file_sha1,
            chunk_sha1s: manifest.chunk_sha1s,
        }
    }

    pub fn total_chunks(&self) -> usize {
        self.chunk_sha1s.len()
    }
}

/// The process-wide table of files this peer has published and will serve
/// chunks of. Entries are inserted after a successful `upload_file` and
/// never removed.
#[derive(Debug, Default)]
pub struct FileRegistry {
    files: RwLock<HashMap<String, Arc<SharedFile>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, file: SharedFile) {
        log::debug!("Registering shared file {} at {:?}", file.name, file.path);
        self.files
            .write()
            .await
            .insert(file.name.clone(), Arc::new(file));
    }

    pub async fn get(&self, name: &str) -> Option<Arc<SharedFile>> {
        self.files.read().await.get(name).cloned()
    }
}
