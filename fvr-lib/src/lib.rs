mod backend;
mod chunk;
mod config;
mod path;

pub use backend::*;
pub use chunk::*;
pub use config::*;
pub use path::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FvrError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("parent not found: {0}")]
    ParentNotFound(String),
    #[error("integrity error: {0}")]
    IntegrityError(String),
    #[error("transient backend error: {0}")]
    TransientBackend(String),
    #[error("permanent backend error: {0}")]
    PermanentBackend(String),
    #[error("store inconsistency: {0}")]
    StoreInconsistency(String),

    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl FvrError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FvrError::NotFound(_))
    }

    /// Only backend hiccups are worth retrying; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, FvrError::TransientBackend(_))
    }
}

pub type FvrResult<T> = std::result::Result<T, FvrError>;

impl From<std::io::Error> for FvrError {
    fn from(err: std::io::Error) -> Self {
        FvrError::IoError(err.to_string())
    }
}

impl From<BackendError> for FvrError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Transient(msg) => FvrError::TransientBackend(msg),
            BackendError::Permanent(msg) => FvrError::PermanentBackend(msg),
        }
    }
}

pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024; // 4M
pub const DEFAULT_TMP_PATH: &str = "/tmp/forever";
pub const FVR_HOME_DIR: &str = ".forever";
pub const DEFAULT_META_DB_FILE: &str = "forever.db";
pub const DEFAULT_CONFIG_FILE: &str = "forever.json";

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_backend_error_mapping() {
        let err: FvrError = BackendError::Transient("timeout".to_string()).into();
        assert!(err.is_transient());
        let err: FvrError = BackendError::Permanent("quota".to_string()).into();
        assert!(matches!(err, FvrError::PermanentBackend(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_io_error_mapping() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: FvrError = io.into();
        assert!(matches!(err, FvrError::IoError(_)));
        assert!(!err.is_not_found());
    }
}
