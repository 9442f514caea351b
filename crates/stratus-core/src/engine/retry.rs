//! Bounded retry for "wait until ready" conditions inside a step.
//!
//! Fixed attempt count, fixed base delay with jitter. A condition that
//! stays false past the last attempt is an outcome, not an error; the
//! caller decides whether that fails its task.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `attempt` until it reports `true` or attempts run out. An error
    /// from `attempt` aborts immediately.
    pub async fn run_until<F, Fut>(&self, mut attempt: F) -> Result<bool, EngineError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<bool, EngineError>> + Send,
    {
        for n in 0..self.max_attempts {
            if attempt().await? {
                return Ok(true);
            }
            if n + 1 < self.max_attempts {
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                tokio::time::sleep(self.delay.mul_f64(jitter)).await;
            }
        }
        Ok(false)
    }
}
