use async_trait::async_trait;
use fvr_lib::{BackendAdapter, BackendError, BackendResult, ChunkHasher, RemoteId};
use log::{debug, warn};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const CHUNK_DIR_NAME: &str = "chunks";
const CHUNK_FINAL_EXT: &str = "final";
const CHUNK_TMP_EXT: &str = "tmp";
const REMOTE_ID_LEN: usize = 64;

/// A "remote" kept in a local directory. Chunk files are named by the sha256
/// of their bytes, so re-uploading the same bytes lands on the same id.
pub struct LocalChunkBackend {
    chunk_dir: PathBuf,
    tmp_seq: AtomicU64,
}

impl LocalChunkBackend {
    pub fn new(root: PathBuf) -> Self {
        Self {
            chunk_dir: root.join(CHUNK_DIR_NAME),
            tmp_seq: AtomicU64::new(0),
        }
    }

    pub fn chunk_dir(&self) -> &PathBuf {
        &self.chunk_dir
    }

    fn remote_id_of(data: &[u8]) -> RemoteId {
        let hash = ChunkHasher::calc_from_bytes(data);
        match hash.split_once(':') {
            Some((_, hex)) => hex.to_string(),
            None => hash,
        }
    }

    fn check_remote_id(remote_id: &str) -> BackendResult<()> {
        if remote_id.len() != REMOTE_ID_LEN || !remote_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BackendError::Permanent(format!(
                "malformed remote id: {}",
                remote_id
            )));
        }
        Ok(())
    }

    pub fn get_chunk_final_path(&self, remote_id: &str) -> PathBuf {
        let file_name = format!("{}.{}", remote_id, CHUNK_FINAL_EXT);
        let prefix = &remote_id[0..2.min(remote_id.len())];
        self.chunk_dir.join(prefix).join(file_name)
    }

    fn get_chunk_tmp_path(&self, remote_id: &str) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let file_name = format!("{}.{}.{}", remote_id, seq, CHUNK_TMP_EXT);
        let prefix = &remote_id[0..2.min(remote_id.len())];
        self.chunk_dir.join(prefix).join(file_name)
    }
}

fn transient(op: &str, e: std::io::Error) -> BackendError {
    warn!("LocalChunkBackend: {} failed! {}", op, e);
    BackendError::Transient(format!("{}: {}", op, e))
}

#[async_trait]
impl BackendAdapter for LocalChunkBackend {
    fn backend_name(&self) -> &str {
        "local"
    }

    async fn upload(&self, data: &[u8]) -> BackendResult<RemoteId> {
        let remote_id = Self::remote_id_of(data);
        let final_path = self.get_chunk_final_path(&remote_id);
        match fs::read(&final_path).await {
            Ok(existing) if Self::remote_id_of(&existing) == remote_id => {
                debug!("LocalChunkBackend: chunk {} already stored", remote_id);
                return Ok(remote_id);
            }
            Ok(existing) => {
                warn!(
                    "LocalChunkBackend: chunk {} on disk is damaged ({} bytes), rewriting",
                    remote_id,
                    existing.len()
                );
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(transient("read stored chunk", e)),
        }

        let tmp_path = self.get_chunk_tmp_path(&remote_id);
        if let Some(parent) = tmp_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| transient("create chunk dir", e))?;
        }

        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| transient("create tmp chunk", e))?;
        let write_result = async {
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(transient("write tmp chunk", e));
        }

        if let Err(e) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(transient("rename chunk", e));
        }

        debug!(
            "LocalChunkBackend: stored chunk {} ({} bytes)",
            remote_id,
            data.len()
        );
        Ok(remote_id)
    }

    async fn download(&self, remote_id: &str) -> BackendResult<Vec<u8>> {
        Self::check_remote_id(remote_id)?;
        let final_path = self.get_chunk_final_path(remote_id);
        match fs::read(&final_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("LocalChunkBackend: chunk {} not found", remote_id);
                Err(BackendError::Permanent(format!(
                    "chunk not found: {}",
                    remote_id
                )))
            }
            Err(e) => Err(transient("read chunk", e)),
        }
    }
}
