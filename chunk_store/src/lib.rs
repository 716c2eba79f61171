mod local_backend;

pub use local_backend::*;

use fvr_lib::{BackendAdapter, BackendConfig};
use std::sync::Arc;

pub fn create_backend(config: &BackendConfig) -> Arc<dyn BackendAdapter> {
    match config {
        BackendConfig::Local { root } => Arc::new(LocalChunkBackend::new(root.clone())),
    }
}
