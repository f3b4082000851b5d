// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Fixed-delay retry of transient catalog failures.

use crate::config::RetryConfig;
use backon::{ConstantBuilder, Retryable};
use catalog::CatalogError;
use diagnostics::log_warn;
use std::future::Future;
use std::time::Duration;

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget in `policy` runs out.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryConfig,
    what: &str,
    op: F,
) -> Result<T, CatalogError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CatalogError>>,
{
    let backoff = ConstantBuilder::default()
        .with_delay(policy.delay())
        .with_max_times(policy.max_attempts);

    op.retry(backoff)
        .sleep(tokio::time::sleep)
        .when(CatalogError::is_transient)
        .notify(|err: &CatalogError, delay: Duration| {
            log_warn!(
                "Catalog unavailable during {what}: {error}; retrying in {delay_ms} ms",
                error: err.to_string(),
                delay_ms: delay.as_millis() as u64,
                what: what
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            delay_ms: 0,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;
        let result = with_retry(&fast(), "test", || async move {
            if calls_ref.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CatalogError::ConnectionLost("gone".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.expect("third attempt succeeds"), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;
        let result: Result<(), _> = with_retry(&fast(), "test", || async move {
            let _ = calls_ref.fetch_add(1, Ordering::SeqCst);
            Err(CatalogError::not_found("node", 3))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;
        let result: Result<(), _> = with_retry(&fast(), "test", || async move {
            let _ = calls_ref.fetch_add(1, Ordering::SeqCst);
            Err(CatalogError::ConnectionLost("gone".to_string()))
        })
        .await;
        assert!(result.expect_err("exhausted").is_transient());
        // One initial attempt plus three retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
