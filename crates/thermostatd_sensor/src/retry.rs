use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use tracing::warn;

use crate::isolation::Isolation;
use crate::isolation::read_isolated;
use crate::reading::ReadOutcome;
use crate::reading::SensorReading;

/// Attempt/backoff/timeout bounds for [`RetryingSensor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Isolated reads per call. Zero is treated as one.
    pub max_attempts: u32,

    /// Pause after each failed attempt except the last.
    pub backoff: Duration,

    /// Bound on each isolated read.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(1000),
            timeout: Duration::from_millis(2000),
        }
    }
}

/// Every attempt failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("sensor read failed after {attempts} attempts (last: {last})")]
pub struct ExhaustedError {
    pub attempts: u32,
    pub last: ReadOutcome,
}

/// Where the control loop gets its temperature readings from.
#[async_trait]
pub trait TemperatureSource: Send {
    async fn read_temperature(&mut self) -> Result<SensorReading, ExhaustedError>;
}

/// Repeats isolated reads until one succeeds or the policy runs out.
pub struct RetryingSensor {
    isolation: Box<dyn Isolation>,
    policy: RetryPolicy,
}

impl RetryingSensor {
    pub fn new(isolation: impl Isolation + 'static, policy: RetryPolicy) -> Self {
        Self {
            isolation: Box::new(isolation),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Return the first successful reading, or the last failure once
    /// `max_attempts` reads have failed.
    pub async fn read(&self) -> Result<SensorReading, ExhaustedError> {
        let attempts = self.policy.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            let outcome = read_isolated(self.isolation.as_ref(), self.policy.timeout).await;
            match outcome {
                ReadOutcome::Ok(reading) => {
                    debug!("Sensor read succeeded on attempt {}/{}: {}", attempt, attempts, reading);
                    return Ok(reading);
                }
                last if attempt >= attempts => {
                    warn!("Sensor read attempt {}/{} failed: {}", attempt, attempts, last);
                    return Err(ExhaustedError { attempts, last });
                }
                failed => {
                    warn!(
                        "Sensor read attempt {}/{} failed: {}, retrying in {:?}",
                        attempt, attempts, failed, self.policy.backoff
                    );
                    tokio::time::sleep(self.policy.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl TemperatureSource for RetryingSensor {
    async fn read_temperature(&mut self) -> Result<SensorReading, ExhaustedError> {
        self.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::ProtocolError;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff, Duration::from_secs(1));
        assert_eq!(policy.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_exhausted_message() {
        let error = ExhaustedError {
            attempts: 3,
            last: ReadOutcome::ProtocolError(ProtocolError::NoResponse),
        };
        insta::assert_snapshot!(error.to_string(), @"sensor read failed after 3 attempts (last: protocol error: sensor did not respond)");
    }
}
