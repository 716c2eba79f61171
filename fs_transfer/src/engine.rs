use crate::cancel::CancelToken;
use crate::report::{TransferKind, TransferReport};
use crate::retry::retry_backend;
use fs_meta::{register_complete_file, ChunkRecord, ChunkState, FileEntry, FileStatus, FsMetaDB};
use futures::stream::{self, StreamExt};
use fvr_lib::{
    BackendAdapter, BackendError, ChunkDesc, ChunkHasher, ChunkPlanner, ForeverConfig, FvrError,
    FvrPath, FvrResult, TransferConfig,
};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

enum ChunkOutcome {
    Uploaded(u64),
    Reused,
    Skipped,
}

/// Moves file content between local files and the backend, chunk by chunk,
/// and keeps the chunk records in the metadata store in step.
pub struct TransferEngine {
    planner: ChunkPlanner,
    transfer: TransferConfig,
    tmp_path: PathBuf,
    db: Arc<FsMetaDB>,
    backend: Arc<dyn BackendAdapter>,
    file_locks: Mutex<HashMap<FvrPath, Arc<AsyncMutex<()>>>>,
    staging_seq: AtomicU64,
}

impl TransferEngine {
    pub fn new(
        config: &ForeverConfig,
        db: Arc<FsMetaDB>,
        backend: Arc<dyn BackendAdapter>,
    ) -> FvrResult<Self> {
        config.validate()?;
        Ok(Self {
            planner: ChunkPlanner::new(config.chunk_size)?,
            transfer: config.transfer.clone(),
            tmp_path: config.tmp_path.clone(),
            db,
            backend,
            file_locks: Mutex::new(HashMap::new()),
            staging_seq: AtomicU64::new(0),
        })
    }

    pub fn db(&self) -> &Arc<FsMetaDB> {
        &self.db
    }

    /// Per-file serialization point, held for a whole put/get/cp of one path.
    async fn lock_file(&self, path: &FvrPath) -> FvrResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .file_locks
                .lock()
                .map_err(|e| FvrError::Internal(format!("file lock map poisoned: {}", e)))?;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(path.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        Ok(lock.lock_owned().await)
    }

    // ==================== put ====================

    /// Upload `local` as `remote`. Resumes a pending or failed entry and is a
    /// no-op on a complete one.
    pub async fn put(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancelToken,
    ) -> FvrResult<TransferReport> {
        let path = FvrPath::normalize(remote)?;
        if path.is_root() {
            return Err(FvrError::InvalidParam("cannot put to root".to_string()));
        }
        let _guard = self.lock_file(&path).await?;
        self.put_locked(local, &path, cancel).await
    }

    async fn put_locked(
        &self,
        local: &Path,
        path: &FvrPath,
        cancel: &CancelToken,
    ) -> FvrResult<TransferReport> {
        let previous = self.db.get_file(path)?;
        if let Some(entry) = previous.as_ref() {
            if entry.status == FileStatus::Complete {
                info!("TransferEngine: {} already complete, skip", path);
                let mut report =
                    TransferReport::new(TransferKind::Upload, path.clone(), entry.chunks.len());
                report.chunks_reused = entry.chunks.len();
                report.chunk_states = entry.chunks.iter().map(|c| c.state).collect();
                return Ok(report);
            }
        }

        let meta = fs::metadata(local).await.map_err(|e| {
            warn!("TransferEngine: stat {} failed! {}", local.display(), e);
            FvrError::IoError(format!("{}: {}", local.display(), e))
        })?;
        if !meta.is_file() {
            return Err(FvrError::InvalidParam(format!(
                "{} is not a regular file",
                local.display()
            )));
        }

        let plan = self.planner.plan(meta.len());
        let hashes = hash_local_chunks(local, &plan).await?;
        let entry = FileEntry::new_pending(
            path.clone(),
            meta.len(),
            reconcile_chunks(&plan, &hashes, previous.as_ref()),
        );

        self.db.transaction(|txn| {
            let parent = path
                .parent()
                .ok_or_else(|| FvrError::InvalidParam("cannot put to root".to_string()))?;
            if !txn.directory_exists(&parent)? {
                return Err(FvrError::ParentNotFound(parent.to_string()));
            }
            if txn.directory_exists(path)? {
                return Err(FvrError::AlreadyExists(format!("{} is a directory", path)));
            }
            txn.put_file(&entry)
        })?;

        let mut report = TransferReport::new(TransferKind::Upload, path.clone(), entry.chunks.len());
        report.chunks_reused = entry.stored_chunk_count();
        let todo: Vec<ChunkRecord> = entry
            .chunks
            .iter()
            .filter(|c| !c.state.is_stored())
            .cloned()
            .collect();
        info!(
            "TransferEngine: put {} -> {}: {} chunk(s), {} already stored",
            local.display(),
            path,
            entry.chunks.len(),
            report.chunks_reused
        );

        let halt = AtomicBool::new(false);
        let mut first_err: Option<FvrError> = None;
        let mut skipped = 0usize;
        let mut uploads = stream::iter(todo)
            .map(|chunk| self.upload_chunk(local, path, chunk, &halt, cancel))
            .buffer_unordered(self.transfer.fan_out);
        while let Some(result) = uploads.next().await {
            match result {
                Ok(ChunkOutcome::Uploaded(bytes)) => {
                    report.chunks_transferred += 1;
                    report.bytes_transferred += bytes;
                }
                Ok(ChunkOutcome::Reused) => report.chunks_reused += 1,
                Ok(ChunkOutcome::Skipped) => skipped += 1,
                Err(e) => {
                    halt.store(true, Ordering::SeqCst);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        drop(uploads);

        if let Some(err) = first_err {
            warn!("TransferEngine: put {} failed! {}", path, err);
            if let Err(e) = self.db.set_file_status(path, FileStatus::Failed, None) {
                warn!("TransferEngine: mark {} failed error! {}", path, e);
            }
            return Err(err);
        }
        if skipped > 0 {
            info!(
                "TransferEngine: put {} cancelled, {} chunk(s) left",
                path, skipped
            );
            return Err(FvrError::Cancelled(path.to_string()));
        }

        let stored = self
            .db
            .get_file(path)?
            .ok_or_else(|| FvrError::StoreInconsistency(format!("{} vanished", path)))?;
        if !stored.all_chunks_stored() {
            return Err(FvrError::StoreInconsistency(format!(
                "{} has unstored chunks after upload",
                path
            )));
        }
        let chunk_hashes: Vec<&str> = stored.chunks.iter().map(|c| c.hash.as_str()).collect();
        let content_hash = ChunkHasher::calc_file_hash(&chunk_hashes);
        self.db
            .transaction(|txn| register_complete_file(txn, path, &content_hash))?;

        report.chunk_states = stored.chunks.iter().map(|c| c.state).collect();
        info!("TransferEngine: {}", report);
        Ok(report)
    }

    async fn upload_chunk(
        &self,
        local: &Path,
        path: &FvrPath,
        mut chunk: ChunkRecord,
        halt: &AtomicBool,
        cancel: &CancelToken,
    ) -> FvrResult<ChunkOutcome> {
        if halt.load(Ordering::SeqCst) || cancel.is_cancelled() {
            return Ok(ChunkOutcome::Skipped);
        }

        if self.transfer.dedup && self.backend.reusable_remote_ids() {
            if let Some(remote_id) = self.db.find_stored_chunk_by_hash(&chunk.hash)? {
                debug!(
                    "TransferEngine: {}#{} dedup hit {}",
                    path, chunk.index, remote_id
                );
                chunk.state = ChunkState::Stored;
                chunk.remote_id = Some(remote_id);
                self.db.update_chunk(path, &chunk)?;
                return Ok(ChunkOutcome::Reused);
            }
        }

        chunk.state = ChunkState::Uploading;
        chunk.remote_id = None;
        self.db.update_chunk(path, &chunk)?;

        let data = match read_local_chunk(local, chunk.offset, chunk.length).await {
            Ok(data) if ChunkHasher::verify(&data, &chunk.hash) => data,
            Ok(_) => {
                self.set_chunk_state(path, &mut chunk, ChunkState::Planned);
                return Err(FvrError::IntegrityError(format!(
                    "{} changed during upload at chunk {}",
                    local.display(),
                    chunk.index
                )));
            }
            Err(e) => {
                self.set_chunk_state(path, &mut chunk, ChunkState::Planned);
                return Err(e);
            }
        };

        let backend = self.backend.as_ref();
        let bytes: &[u8] = &data;
        let what = format!("upload {}#{}", path, chunk.index);
        match retry_backend(&self.transfer, &what, move || backend.upload(bytes)).await {
            Ok(remote_id) => {
                chunk.state = ChunkState::Stored;
                chunk.remote_id = Some(remote_id);
                self.db.update_chunk(path, &chunk)?;
                debug!("TransferEngine: {}#{} stored", path, chunk.index);
                Ok(ChunkOutcome::Uploaded(chunk.length))
            }
            Err(BackendError::Permanent(msg)) => {
                self.set_chunk_state(path, &mut chunk, ChunkState::Aborted);
                Err(FvrError::PermanentBackend(msg))
            }
            Err(err) => {
                self.set_chunk_state(path, &mut chunk, ChunkState::Planned);
                Err(err.into())
            }
        }
    }

    /// Best effort: the original failure is what the caller needs to see.
    fn set_chunk_state(&self, path: &FvrPath, chunk: &mut ChunkRecord, state: ChunkState) {
        chunk.state = state;
        chunk.remote_id = None;
        if let Err(e) = self.db.update_chunk(path, chunk) {
            warn!(
                "TransferEngine: reset chunk {}#{} to {} failed! {}",
                path,
                chunk.index,
                state.to_str(),
                e
            );
        }
    }

    // ==================== get ====================

    /// Download `remote` into `local`. Nothing is written at `local` unless
    /// every chunk and the whole-file hash verify.
    pub async fn get(
        &self,
        remote: &str,
        local: &Path,
        cancel: &CancelToken,
    ) -> FvrResult<TransferReport> {
        let path = FvrPath::normalize(remote)?;
        let _guard = self.lock_file(&path).await?;
        let entry = self.load_complete_file(&path)?;

        let staging = self.new_staging_path("get").await?;
        let report = match self.fetch_to(&entry, &staging, cancel).await {
            Ok(report) => report,
            Err(e) => {
                remove_staging(&staging).await;
                return Err(e);
            }
        };
        if let Err(e) = move_into_place(&staging, local).await {
            remove_staging(&staging).await;
            return Err(e);
        }

        info!("TransferEngine: {} -> {}", report, local.display());
        Ok(report)
    }

    fn load_complete_file(&self, path: &FvrPath) -> FvrResult<FileEntry> {
        let entry = self
            .db
            .get_file(path)?
            .ok_or_else(|| FvrError::NotFound(path.to_string()))?;
        if entry.status != FileStatus::Complete {
            return Err(FvrError::InvalidState(format!(
                "{} is {}",
                path,
                entry.status.to_str()
            )));
        }
        if entry.content_hash.is_none()
            || entry
                .chunks
                .iter()
                .any(|c| !c.state.is_stored() || c.remote_id.is_none())
        {
            return Err(FvrError::StoreInconsistency(format!(
                "complete file {} has unstored chunks",
                path
            )));
        }
        Ok(entry)
    }

    async fn new_staging_path(&self, prefix: &str) -> FvrResult<PathBuf> {
        fs::create_dir_all(&self.tmp_path).await.map_err(|e| {
            warn!(
                "TransferEngine: create tmp dir {} failed! {}",
                self.tmp_path.display(),
                e
            );
            FvrError::IoError(e.to_string())
        })?;
        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .tmp_path
            .join(format!("{}-{}-{}.part", prefix, std::process::id(), seq)))
    }

    async fn fetch_to(
        &self,
        entry: &FileEntry,
        dest: &Path,
        cancel: &CancelToken,
    ) -> FvrResult<TransferReport> {
        let mut report =
            TransferReport::new(TransferKind::Download, entry.path.clone(), entry.chunks.len());
        report.chunk_states = entry.chunks.iter().map(|c| c.state).collect();

        let mut file = File::create(dest).await?;
        let mut fetches = stream::iter(entry.chunks.iter())
            .map(|chunk| self.fetch_chunk(&entry.path, chunk, cancel))
            .buffered(self.transfer.fan_out);
        let mut pos = 0usize;
        while let Some(result) = fetches.next().await {
            let data = result?;
            file.write_all(&data).await?;
            report.chunk_states[pos] = ChunkState::Local;
            report.chunks_transferred += 1;
            report.bytes_transferred += data.len() as u64;
            pos += 1;
        }
        file.flush().await?;
        file.sync_all().await?;

        if report.bytes_transferred != entry.size {
            return Err(FvrError::IntegrityError(format!(
                "{}: got {} bytes, expected {}",
                entry.path, report.bytes_transferred, entry.size
            )));
        }
        let chunk_hashes: Vec<&str> = entry.chunks.iter().map(|c| c.hash.as_str()).collect();
        let content_hash = ChunkHasher::calc_file_hash(&chunk_hashes);
        if entry.content_hash.as_deref() != Some(content_hash.as_str()) {
            return Err(FvrError::IntegrityError(format!(
                "{}: content hash mismatch",
                entry.path
            )));
        }
        Ok(report)
    }

    async fn fetch_chunk(
        &self,
        path: &FvrPath,
        chunk: &ChunkRecord,
        cancel: &CancelToken,
    ) -> FvrResult<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(FvrError::Cancelled(path.to_string()));
        }
        let remote_id = chunk.remote_id.as_deref().ok_or_else(|| {
            FvrError::StoreInconsistency(format!("{}#{} has no remote id", path, chunk.index))
        })?;

        let backend = self.backend.as_ref();
        let what = format!("download {}#{}", path, chunk.index);
        let data = retry_backend(&self.transfer, &what, move || backend.download(remote_id)).await?;
        if data.len() as u64 != chunk.length || !ChunkHasher::verify(&data, &chunk.hash) {
            warn!(
                "TransferEngine: {}#{} hash mismatch (remote {})",
                path, chunk.index, remote_id
            );
            return Err(FvrError::IntegrityError(format!(
                "{} chunk {} does not match {}",
                path, chunk.index, chunk.hash
            )));
        }
        Ok(data)
    }

    // ==================== copy ====================

    /// Copy `src` to `dst` inside the namespace. Shares the source's remote
    /// chunks when the backend allows it, otherwise round-trips the bytes.
    pub async fn copy(
        &self,
        src: &str,
        dst: &str,
        cancel: &CancelToken,
    ) -> FvrResult<TransferReport> {
        let src = FvrPath::normalize(src)?;
        let dst = FvrPath::normalize(dst)?;
        if dst.is_root() {
            return Err(FvrError::InvalidParam("cannot copy to root".to_string()));
        }
        if src == dst {
            return Err(FvrError::InvalidParam(format!(
                "source and destination are both {}",
                src
            )));
        }

        let _guard = self.lock_file(&dst).await?;
        let mut report = if self.backend.reusable_remote_ids() {
            self.copy_metadata(&src, &dst)?
        } else {
            self.copy_by_transfer(&src, &dst, cancel).await?
        };
        report.kind = TransferKind::Copy;
        info!("TransferEngine: {} (from {})", report, src);
        Ok(report)
    }

    fn copy_metadata(&self, src: &FvrPath, dst: &FvrPath) -> FvrResult<TransferReport> {
        let copied = self.db.transaction(|txn| {
            let source = txn
                .get_file(src)?
                .ok_or_else(|| FvrError::NotFound(src.to_string()))?;
            if source.status != FileStatus::Complete {
                return Err(FvrError::InvalidState(format!(
                    "{} is {}",
                    src,
                    source.status.to_str()
                )));
            }
            let content_hash = source.content_hash.clone().ok_or_else(|| {
                FvrError::StoreInconsistency(format!("{} has no content hash", src))
            })?;
            if txn.file_exists(dst)? {
                return Err(FvrError::AlreadyExists(dst.to_string()));
            }

            let copied = FileEntry::new_pending(dst.clone(), source.size, source.chunks);
            txn.put_file(&copied)?;
            register_complete_file(txn, dst, &content_hash)?;
            Ok(copied)
        })?;

        let mut report = TransferReport::new(TransferKind::Copy, dst.clone(), copied.chunks.len());
        report.chunks_reused = copied.chunks.len();
        report.chunk_states = copied.chunks.iter().map(|c| c.state).collect();
        Ok(report)
    }

    async fn copy_by_transfer(
        &self,
        src: &FvrPath,
        dst: &FvrPath,
        cancel: &CancelToken,
    ) -> FvrResult<TransferReport> {
        let source = self.load_complete_file(src)?;
        if self.db.get_file(dst)?.is_some() {
            return Err(FvrError::AlreadyExists(dst.to_string()));
        }

        debug!("TransferEngine: copy {} -> {} through local staging", src, dst);
        let staging = self.new_staging_path("cp").await?;
        let result: FvrResult<TransferReport> = async {
            self.fetch_to(&source, &staging, cancel).await?;
            self.put_locked(&staging, dst, cancel).await
        }
        .await;
        remove_staging(&staging).await;
        result
    }
}

/// New plan merged with what a previous attempt left behind: a stored chunk
/// survives only when its boundaries and hash are unchanged.
fn reconcile_chunks(
    plan: &[ChunkDesc],
    hashes: &[String],
    previous: Option<&FileEntry>,
) -> Vec<ChunkRecord> {
    plan.iter()
        .zip(hashes)
        .map(|(desc, hash)| {
            let mut record =
                ChunkRecord::new_planned(desc.index, desc.offset, desc.length, hash.clone());
            let old = previous.and_then(|e| e.chunks.get(desc.index as usize));
            if let Some(old) = old {
                let same = old.index == desc.index
                    && old.offset == desc.offset
                    && old.length == desc.length
                    && old.hash == *hash;
                if same && old.state.is_stored() && old.remote_id.is_some() {
                    record.state = ChunkState::Stored;
                    record.remote_id = old.remote_id.clone();
                }
            }
            record
        })
        .collect()
}

async fn hash_local_chunks(local: &Path, plan: &[ChunkDesc]) -> FvrResult<Vec<String>> {
    let mut file = File::open(local).await?;
    let mut hashes = Vec::with_capacity(plan.len());
    let mut buf = Vec::new();
    for desc in plan {
        buf.resize(desc.length as usize, 0);
        file.read_exact(&mut buf).await.map_err(|e| {
            warn!(
                "TransferEngine: read {} chunk {} failed! {}",
                local.display(),
                desc.index,
                e
            );
            FvrError::IoError(e.to_string())
        })?;
        hashes.push(ChunkHasher::calc_from_bytes(&buf));
    }
    Ok(hashes)
}

async fn read_local_chunk(local: &Path, offset: u64, length: u64) -> FvrResult<Vec<u8>> {
    let mut file = File::open(local).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn move_into_place(staging: &Path, dest: &Path) -> FvrResult<()> {
    if let Err(e) = fs::rename(staging, dest).await {
        debug!(
            "TransferEngine: rename to {} failed ({}), copying",
            dest.display(),
            e
        );
        if let Err(e) = fs::copy(staging, dest).await {
            warn!("TransferEngine: copy to {} failed! {}", dest.display(), e);
            let _ = fs::remove_file(dest).await;
            return Err(FvrError::IoError(e.to_string()));
        }
        remove_staging(staging).await;
    }
    Ok(())
}

async fn remove_staging(staging: &Path) {
    if let Err(e) = fs::remove_file(staging).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(
                "TransferEngine: remove staging {} failed! {}",
                staging.display(),
                e
            );
        }
    }
}
