//! Retry with exponential backoff for transient provider failures
//!
//! The engine is provider-agnostic: which failures count as transient is
//! decided by an [`ErrorClassifier`] supplied per provider family.

use crate::config::RetryConfig;
use crate::error::{LlmError, Result};
use async_openai::error::OpenAIError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Classification of one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff
    Transient,
    /// Propagate immediately on the first occurrence
    Fatal,
}

/// Per-provider failure classification
pub trait ErrorClassifier: Send + Sync {
    fn class(&self, error: &LlmError) -> ErrorClass;
}

/// Classifier for OpenAI-compatible endpoints.
///
/// The transient set is closed: rate limiting, connection failure, request
/// timeout, and server-side internal errors. Everything else is fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiClassifier;

impl ErrorClassifier for OpenAiClassifier {
    fn class(&self, error: &LlmError) -> ErrorClass {
        let LlmError::Provider(provider_err) = error else {
            return ErrorClass::Fatal;
        };
        match provider_err {
            // Transport-level failures: connection refused/reset and
            // request timeouts both surface here.
            OpenAIError::Reqwest(_) => ErrorClass::Transient,
            OpenAIError::ApiError(api) => {
                let kind = api.r#type.as_deref().unwrap_or("");
                let message = api.message.to_ascii_lowercase();
                let rate_limited = kind == "requests"
                    || kind == "tokens"
                    || message.contains("rate limit");
                let server_side = kind == "server_error"
                    || message.contains("internal server error")
                    || message.contains("overloaded");
                if rate_limited || server_side || message.contains("timeout") {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
            _ => ErrorClass::Fatal,
        }
    }
}

/// Retry state for one operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempt: usize,
    next_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            next_delay: config.initial_delay,
            config,
            attempt: 0,
        }
    }

    /// Number of calls made so far
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Whether another call is allowed after a transient failure
    pub fn should_retry(&self) -> bool {
        self.attempt + 1 < self.config.max_attempts
    }

    /// Consume one attempt and return the delay to wait before the next call
    pub fn next_delay(&mut self) -> Duration {
        let mut delay = self.next_delay;

        if self.config.jitter {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(0.0..0.3);
            let jitter_ms = (delay.as_millis() as f64 * jitter) as u64;
            delay += Duration::from_millis(jitter_ms);
        }

        self.attempt += 1;
        self.next_delay = Duration::from_secs_f32(
            (self.next_delay.as_secs_f32() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f32()),
        );

        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay = self.config.initial_delay;
    }
}

/// Retry an async operation with exponential backoff.
///
/// Transient failures (per the classifier) are retried until
/// `max_attempts` total calls have been made; the last transient failure
/// is the one surfaced. A fatal failure propagates after exactly one call.
pub async fn retry_async<F, Fut, T>(
    mut operation: F,
    policy: &mut RetryPolicy,
    classifier: &dyn ErrorClassifier,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match operation().await {
            Ok(result) => {
                if policy.attempt() > 0 {
                    debug!("operation succeeded after {} attempts", policy.attempt() + 1);
                }
                return Ok(result);
            }
            Err(error) => {
                if classifier.class(&error) == ErrorClass::Fatal {
                    debug!("non-retryable error: {}", error);
                    return Err(error);
                }

                if !policy.should_retry() {
                    warn!(
                        "retries exhausted after {} attempts, last error: {}",
                        policy.config.max_attempts, error
                    );
                    return Err(error);
                }

                let delay = policy.next_delay();
                warn!(
                    "attempt {} failed: {}, retrying in {:?}",
                    policy.attempt(),
                    error,
                    delay
                );

                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn transient_error() -> LlmError {
        LlmError::Provider(OpenAIError::ApiError(async_openai::error::ApiError {
            message: "Rate limit reached for requests".to_string(),
            r#type: Some("requests".to_string()),
            param: None,
            code: None,
        }))
    }

    #[test]
    fn test_backoff_schedule() {
        let config = RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let mut policy = RetryPolicy::new(config);

        assert!(policy.should_retry());
        assert_eq!(policy.next_delay(), Duration::from_millis(100));
        let second = policy.next_delay();
        assert!((second.as_millis() as i64 - 200).abs() <= 1);
        let third = policy.next_delay();
        assert!((third.as_millis() as i64 - 400).abs() <= 1);
        assert!(!policy.should_retry());

        policy.reset();
        assert_eq!(policy.attempt(), 0);
        assert_eq!(policy.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_classifier_transient_set() {
        let classifier = OpenAiClassifier;

        assert_eq!(classifier.class(&transient_error()), ErrorClass::Transient);

        let server = LlmError::Provider(OpenAIError::ApiError(async_openai::error::ApiError {
            message: "The server had an error while processing your request".to_string(),
            r#type: Some("server_error".to_string()),
            param: None,
            code: None,
        }));
        assert_eq!(classifier.class(&server), ErrorClass::Transient);

        let invalid = LlmError::Provider(OpenAIError::InvalidArgument("bad".to_string()));
        assert_eq!(classifier.class(&invalid), ErrorClass::Fatal);

        let config = LlmError::configuration("OPENAI_API_KEY is not set");
        assert_eq!(classifier.class(&config), ErrorClass::Fatal);

        let mismatch = LlmError::SchemaMismatch {
            expected: "a".to_string(),
            actual: "b".to_string(),
        };
        assert_eq!(classifier.class(&mismatch), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_retry_eventually_succeeds() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut policy = RetryPolicy::new(fast_config(5));

        let result = retry_async(
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient_error())
                    } else {
                        Ok(42)
                    }
                }
            },
            &mut policy,
            &OpenAiClassifier,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_makes_exactly_max_attempts_calls() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut policy = RetryPolicy::new(fast_config(3));

        let result: Result<()> = retry_async(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(transient_error())
                }
            },
            &mut policy,
            &OpenAiClassifier,
        )
        .await;

        assert!(matches!(result, Err(LlmError::Provider(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_makes_exactly_one_call() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut policy = RetryPolicy::new(fast_config(5));

        let result: Result<()> = retry_async(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(LlmError::configuration("unknown model id"))
                }
            },
            &mut policy,
            &OpenAiClassifier,
        )
        .await;

        assert!(matches!(result, Err(LlmError::Configuration { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
