use crate::config::env_parse;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub trait Retryable {
    fn is_retryable(&self) -> bool;
    fn cancelled() -> Self;
}

/// Attempt budget with exponential backoff: the wait after attempt `n` is
/// `base_delay * 2^(n-1)`. No jitter, so schedules are reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_parse::<u32>("LLM_MAX_ATTEMPTS")
                .filter(|v| *v >= 1)
                .unwrap_or(defaults.max_attempts),
            base_delay: env_parse::<u64>("LLM_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
        }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
    pub waited: Duration,
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Cancellation is honoured before each attempt and
/// while backing off.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    label: &'static str,
    mut op: F,
) -> RetryOutcome<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(E::cancelled()),
                attempts: attempt,
                waited: started.elapsed(),
            };
        }
        attempt += 1;
        let result = op(attempt).await;
        let err = match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    waited: started.elapsed(),
                };
            }
            Err(err) => err,
        };
        if !err.is_retryable() || attempt >= max_attempts {
            return RetryOutcome {
                result: Err(err),
                attempts: attempt,
                waited: started.elapsed(),
            };
        }
        let delay = policy.delay_after(attempt);
        warn!(
            target = "vitrine.llm",
            call = label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient_failure_backing_off"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                return RetryOutcome {
                    result: Err(E::cancelled()),
                    attempts: attempt,
                    waited: started.elapsed(),
                };
            }
            _ = sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedModel;
    use crate::llm::{GenerateRequest, GenerativeModel, LlmError, ModelRole};
    use crate::models::GenerationUsage;

    async fn call(model: &ScriptedModel, policy: RetryPolicy) -> RetryOutcome<String, LlmError> {
        let cancel = CancellationToken::new();
        retry(policy, &cancel, "test", |_| async move {
            model
                .generate(GenerateRequest::text(ModelRole::Text, "oi"))
                .await
                .map(|r| r.text)
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_two_then_four_seconds_before_succeeding() {
        let model = ScriptedModel::new();
        model
            .push_status(ModelRole::Text, 503)
            .push_status(ModelRole::Text, 503)
            .push_text(ModelRole::Text, "ok", GenerationUsage::new(10, 2));

        let started = Instant::now();
        let outcome = call(&model, RetryPolicy::default()).await;
        assert_eq!(outcome.result.as_deref(), Ok("ok"));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.waited, Duration::from_secs(6));
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget_with_last_error() {
        let model = ScriptedModel::new();
        for _ in 0..4 {
            model.push_status(ModelRole::Text, 429);
        }
        let outcome = call(&model, RetryPolicy::default()).await;
        assert_eq!(outcome.attempts, 3);
        assert!(matches!(outcome.result, Err(LlmError::Http { status: 429, .. })));
        assert_eq!(outcome.waited, Duration::from_secs(6));
        assert_eq!(model.calls(ModelRole::Text), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let model = ScriptedModel::new();
        model.push_status(ModelRole::Text, 400);
        let outcome = call(&model, RetryPolicy::default()).await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.waited, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let model = ScriptedModel::new();
        model.push_status(ModelRole::Text, 503);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        let model = &model;
        let outcome: RetryOutcome<String, LlmError> =
            retry(RetryPolicy::default(), &cancel, "test", |_| async move {
                model
                    .generate(GenerateRequest::text(ModelRole::Text, "oi"))
                    .await
                    .map(|r| r.text)
            })
            .await;
        assert_eq!(outcome.result, Err(LlmError::Cancelled));
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
    }
}
