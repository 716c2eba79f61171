use fvr_lib::{BackendError, BackendResult, TransferConfig};
use log::warn;
use std::future::Future;

/// Runs `op` until it succeeds, fails permanently, or `max_attempts` transient
/// failures have been seen. Sleeps `backoff_delay(attempt)` between tries.
pub(crate) async fn retry_backend<T, F, Fut>(
    policy: &TransferConfig,
    what: &str,
    mut op: F,
) -> BackendResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(BackendError::Transient(msg)) if attempt < policy.max_attempts => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    "TransferEngine: {} attempt {}/{} failed, retry in {:?}: {}",
                    what, attempt, policy.max_attempts, delay, msg
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(
                    "TransferEngine: {} failed after {} attempt(s): {}",
                    what, attempt, err
                );
                return Err(err);
            }
        }
    }
}
