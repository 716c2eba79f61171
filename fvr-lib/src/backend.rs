use async_trait::async_trait;
use thiserror::Error;

/// Identifier a backend assigns to an uploaded chunk.
pub type RemoteId = String;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Timeouts, rate limits: the same request may succeed later.
    #[error("transient: {0}")]
    Transient(String),
    /// Auth failure, quota exceeded, corrupted object: retrying will not help.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Remote object storage as seen by the transfer engine.
///
/// Implementations must be safe to call concurrently; every call moves one
/// whole chunk and is independent of any other call.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn backend_name(&self) -> &str;

    async fn upload(&self, data: &[u8]) -> BackendResult<RemoteId>;
    async fn download(&self, remote_id: &str) -> BackendResult<Vec<u8>>;

    /// Whether a remote id stays valid when referenced from another path.
    fn reusable_remote_ids(&self) -> bool {
        true
    }
}
