use fs_meta::ChunkState;
use fvr_lib::FvrPath;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Upload,
    Download,
    Copy,
}

impl TransferKind {
    pub fn to_str(&self) -> &'static str {
        match self {
            TransferKind::Upload => "put",
            TransferKind::Download => "get",
            TransferKind::Copy => "cp",
        }
    }
}

/// Outcome of one put/get/cp call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub kind: TransferKind,
    pub path: FvrPath,
    pub chunks_total: usize,
    /// Chunks that actually crossed the backend during this call.
    pub chunks_transferred: usize,
    /// Chunks already stored (resume), found by hash (dedup) or shared (copy).
    pub chunks_reused: usize,
    pub bytes_transferred: u64,
    pub chunk_states: Vec<ChunkState>,
}

impl TransferReport {
    pub fn new(kind: TransferKind, path: FvrPath, chunks_total: usize) -> Self {
        Self {
            kind,
            path,
            chunks_total,
            chunks_transferred: 0,
            chunks_reused: 0,
            bytes_transferred: 0,
            chunk_states: Vec::with_capacity(chunks_total),
        }
    }

    /// A call that found nothing left to do.
    pub fn is_noop(&self) -> bool {
        self.chunks_transferred == 0 && self.chunks_reused == self.chunks_total
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} chunk(s), {} transferred, {} reused, {} bytes",
            self.kind.to_str(),
            self.path,
            self.chunks_total,
            self.chunks_transferred,
            self.chunks_reused,
            self.bytes_transferred
        )
    }
}
