use crate::error::RetryError;
use crate::policy::RetryConfig;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// operation を成功するまで最大 `config.max_attempts` 回実行する。
///
/// 試行の合間の待機中に cancel が発火した場合は [`RetryError::Cancelled`] を返す。
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let error = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        attempt += 1;
        if attempt >= attempts {
            return Err(RetryError::ExhaustedRetries {
                attempts,
                last_error: error,
            });
        }

        let delay = config.compute_delay(attempt - 1);
        tracing::warn!(
            operation = %operation_name,
            attempt = attempt,
            max_attempts = attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "operation failed, retrying"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}
