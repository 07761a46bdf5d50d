//! Retry wrapper for transient extraction failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ExtractionError;

/// Exponential backoff retry for OCR calls.
///
/// Only errors classified transient by [`ExtractionError::is_transient`] are
/// re-attempted; anything else (missing credential, malformed response)
/// surfaces immediately. Waits `base^attempt` seconds between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: f64) -> Self {
        Self {
            max_attempts,
            backoff_base,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_secs_f64(self.backoff_base.powi(attempt as i32))
    }

    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, ExtractionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExtractionError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(ExtractionError::RetriesExhausted {
                            attempts: attempt,
                            last: e.to_string(),
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "Transient extraction error; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn transient() -> ExtractionError {
        ExtractionError::ProviderStatus {
            provider: "remote_ocr",
            status: 503,
            message: "unavailable".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_with_growing_delays() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, 2.0);
        let started = Instant::now();

        let counter = calls.clone();
        let result = policy
            .run(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok("text")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "text");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 2^1 + 2^2 seconds of (virtual) backoff between the three attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_retries_for_persistent_transient_errors() {
        let policy = RetryPolicy::new(3, 2.0);
        let err = policy
            .run(|| async { Err::<(), _>(transient()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::RetriesExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, 2.0);

        let counter = calls.clone();
        let err = policy
            .run(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ExtractionError::MissingCredential {
                        name: "MISTRAL_API_KEY".to_string(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ExtractionError::MissingCredential { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
