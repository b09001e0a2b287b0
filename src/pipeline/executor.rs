use crate::apis::{FeatureService, QueryRequest};
use crate::artifact;
use crate::constants::DEFAULT_ATTEMPT_LIMIT;
use crate::error::{CollectError, Result};
use crate::metrics;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// How many times a source is tried and how long to wait in between.
pub trait RetryPolicy: Send + Sync {
    fn max_attempts(&self) -> u32;

    /// Pause before attempt number `attempt` (2 or higher).
    fn delay_before(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Reconnects from scratch immediately after every failure.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub attempt_limit: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempt_limit: DEFAULT_ATTEMPT_LIMIT,
        }
    }
}

impl RetryPolicy for ReconnectPolicy {
    fn max_attempts(&self) -> u32 {
        self.attempt_limit.max(1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Collected { path: PathBuf, count: usize },
    Empty,
    Unavailable { attempts: u32, last_error: String },
}

impl QueryOutcome {
    pub fn count(&self) -> usize {
        match self {
            QueryOutcome::Collected { count, .. } => *count,
            _ => 0,
        }
    }

    /// The outcome as an error for callers that cannot proceed without data.
    pub fn into_result(self, source_key: &str) -> Result<(PathBuf, usize)> {
        match self {
            QueryOutcome::Collected { path, count } => Ok((path, count)),
            QueryOutcome::Empty => Err(CollectError::EmptyResult {
                source_key: source_key.to_string(),
            }),
            QueryOutcome::Unavailable {
                attempts,
                last_error,
            } => Err(CollectError::ServiceUnavailable {
                source_key: source_key.to_string(),
                attempts,
                last_error,
            }),
        }
    }
}

/// Runs one spatial query per source under a retry policy and writes the
/// primary artifact on success.
#[derive(Clone)]
pub struct QueryExecutor {
    service: Arc<dyn FeatureService>,
    policy: Arc<dyn RetryPolicy>,
    attempt_timeout: Option<Duration>,
}

impl QueryExecutor {
    pub fn new(service: Arc<dyn FeatureService>) -> Self {
        Self {
            service,
            policy: Arc::new(ReconnectPolicy::default()),
            attempt_timeout: None,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn service(&self) -> &Arc<dyn FeatureService> {
        &self.service
    }

    #[instrument(skip(self, request, artifact_path), fields(source = %request.source.key))]
    pub async fn execute(&self, request: &QueryRequest, artifact_path: &Path) -> Result<QueryOutcome> {
        let max_attempts = self.policy.max_attempts().max(1);
        let key = &request.source.key;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                if let Some(delay) = self.policy.delay_before(attempt) {
                    tokio::time::sleep(delay).await;
                }
            }

            let started = Instant::now();
            let result = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.service.select_by_location(request)).await {
                    Ok(r) => r,
                    Err(_) => Err(CollectError::Service {
                        message: format!("attempt timed out after {:.1}s", limit.as_secs_f64()),
                    }),
                },
                None => self.service.select_by_location(request).await,
            };
            metrics::record_attempt(key, started.elapsed().as_secs_f64());

            match result {
                Ok(set) if set.count() == 0 => {
                    debug!("no features matched on attempt {}", attempt);
                    return Ok(QueryOutcome::Empty);
                }
                Ok(set) => {
                    let count = set.count();
                    artifact::write_table(&set.table, artifact_path)?;
                    info!("collected {} features into {}", count, artifact_path.display());
                    return Ok(QueryOutcome::Collected {
                        path: artifact_path.to_path_buf(),
                        count,
                    });
                }
                Err(e) => {
                    warn!("attempt {}/{} failed: {}", attempt, max_attempts, e);
                    last_error = e.to_string();
                }
            }
        }

        Ok(QueryOutcome::Unavailable {
            attempts: max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Backoff;

    impl RetryPolicy for Backoff {
        fn max_attempts(&self) -> u32 {
            3
        }

        fn delay_before(&self, attempt: u32) -> Option<Duration> {
            Some(Duration::from_millis(10 * u64::from(attempt)))
        }
    }

    #[test]
    fn default_policy_reconnects_five_times() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay_before(2), None);
        assert_eq!(ReconnectPolicy { attempt_limit: 0 }.max_attempts(), 1);
        assert_eq!(Backoff.delay_before(3), Some(Duration::from_millis(30)));
    }

    #[test]
    fn outcomes_convert_to_typed_errors() {
        assert!(matches!(
            QueryOutcome::Empty.into_result("HIFLD_Hospitals"),
            Err(CollectError::EmptyResult { .. })
        ));
        let unavailable = QueryOutcome::Unavailable {
            attempts: 5,
            last_error: "timeout".into(),
        };
        match unavailable.into_result("HIFLD_Hospitals") {
            Err(CollectError::ServiceUnavailable { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("unexpected {other:?}"),
        }
    }
}
