use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::providers::{ProviderError, ProviderOutcome};

const MAX_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on random delay added to each backoff step.
    pub jitter: Duration,
    /// Bound on a single provider call.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_delay,
            max_delay: max_delay.max(min_delay),
            jitter: Duration::ZERO,
            attempt_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// `min_delay * 2^(attempt - 1)`, clamped to `[min_delay, max_delay]`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        self.min_delay
            .saturating_mul(1 << exponent)
            .clamp(self.min_delay, self.max_delay)
    }
}

#[derive(Debug)]
pub enum RetryOutcome {
    /// The provider answered, with a hit or a well-formed no-match.
    Completed {
        outcome: ProviderOutcome,
        attempts: u32,
    },
    /// Every attempt failed transiently.
    Exhausted {
        attempts: u32,
        last_error: ProviderError,
    },
    /// A failure that another attempt would not fix.
    Rejected { attempts: u32, error: ProviderError },
}

impl RetryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Completed { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Rejected { attempts, .. } => *attempts,
        }
    }
}

pub struct RetryController {
    policy: RetryPolicy,
    jitter_rng: Arc<Mutex<StdRng>>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    pub fn with_rng(policy: RetryPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            jitter_rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Runs `call` until it answers, fails permanently, or runs out of
    /// attempts. `call` receives the 1-based attempt number.
    pub async fn run<F, Fut>(&self, mut call: F) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<ProviderOutcome, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call(attempt).await {
                Ok(outcome) => {
                    return RetryOutcome::Completed {
                        outcome,
                        attempts: attempt,
                    }
                }
                Err(error) if !error.is_transient() => {
                    return RetryOutcome::Rejected {
                        attempts: attempt,
                        error,
                    }
                }
                Err(err) if attempt < self.policy.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        %err,
                        attempt, "provider call failed; retrying after {:?}", delay
                    );
                    sleep(delay).await;
                }
                Err(last_error) => {
                    return RetryOutcome::Exhausted {
                        attempts: attempt,
                        last_error,
                    }
                }
            }
        }
    }

    /// Applies the per-attempt timeout to one provider call.
    pub async fn timed<Fut>(&self, call: Fut) -> Result<ProviderOutcome, ProviderError>
    where
        Fut: Future<Output = Result<ProviderOutcome, ProviderError>>,
    {
        match timeout(self.policy.attempt_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay(attempt);
        let jitter_ms = self.policy.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..jitter_ms))
        };
        (base + jitter).min(self.policy.max_delay)
    }
}
