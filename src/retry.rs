//! Attempt loops shared by the client and the file-group engine

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    config::RetryPolicy,
    error::{KvError, Result},
};

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent. `op` receives the zero-based attempt.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                warn!(
                    "{op_name}: attempt {}/{} failed, retrying in {:?}: {e}",
                    attempt, policy.max_attempts, delay,
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Like [`retry`], but gives up with [`KvError::Cancelled`] as soon as
/// `token` fires, including in the middle of an attempt.
pub async fn retry_cancellable<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    token: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(KvError::Cancelled),
        result = retry(policy, op_name, |attempt| {
            let cancelled = token.is_cancelled();
            let fut = op(attempt);
            async move {
                if cancelled {
                    return Err(KvError::Cancelled);
                }
                fut.await
            }
        }) => result,
    }
}
