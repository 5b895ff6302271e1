use crate::error::{AbortedError, RetryFailure, StopReason};
use crate::policy::{Classify, RetryPolicy};
use chrono::Utc;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Re-evaluated after every failed attempt; `true` ends the run.
pub type EndPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Runs fallible async operations under a `RetryPolicy`.
///
/// The executor is stateless between runs and can be shared behind an `Arc`.
#[derive(Clone)]
pub struct Retry<K> {
    policy: RetryPolicy<K>,
    end: Option<EndPredicate>,
    aborts: Option<broadcast::Sender<AbortedError<K>>>,
}

impl<K: fmt::Debug> fmt::Debug for Retry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("policy", &self.policy)
            .field("end", &self.end.is_some())
            .field("aborts", &self.aborts.is_some())
            .finish()
    }
}

impl<K> Retry<K>
where
    K: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(policy: RetryPolicy<K>) -> Self {
        Self {
            policy,
            end: None,
            aborts: None,
        }
    }

    pub fn with_end_predicate(mut self, end: EndPredicate) -> Self {
        self.end = Some(end);
        self
    }

    /// Non-benign aborts are sent here. A channel without receivers is fine.
    pub fn with_abort_channel(mut self, aborts: broadcast::Sender<AbortedError<K>>) -> Self {
        self.aborts = Some(aborts);
        self
    }

    pub fn policy(&self) -> &RetryPolicy<K> {
        &self.policy
    }

    /// Calls `operation` until it succeeds, a stop kind is seen, attempts run
    /// out, or the end predicate fires. The closure receives the 1-based
    /// attempt number.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, RetryFailure<E>>
    where
        E: Classify<Kind = K> + fmt::Display + fmt::Debug,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = label, attempt, "Succeeded after retrying.");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let kind = error.kind();
            if self.policy.is_stop(&kind) {
                if self.policy.is_benign(&kind) {
                    debug!(operation = label, ?kind, "Stopped on benign error: {}", error);
                } else {
                    warn!(operation = label, ?kind, "Permanent failure, not retrying: {}", error);
                    self.publish_abort(label, kind, &error);
                }
                return Err(RetryFailure { error, attempts: attempt, reason: StopReason::Aborted });
            }

            if attempt >= max_attempts {
                warn!(operation = label, attempts = attempt, ?kind, "Giving up: {}", error);
                return Err(RetryFailure { error, attempts: attempt, reason: StopReason::Exhausted });
            }

            if self.end.as_ref().is_some_and(|end| end()) {
                debug!(operation = label, attempts = attempt, "End predicate stopped retrying.");
                return Err(RetryFailure { error, attempts: attempt, reason: StopReason::Ended });
            }

            warn!(
                operation = label,
                attempt,
                max_attempts,
                ?kind,
                "Attempt failed, retrying in {:?}: {}",
                self.policy.delay(),
                error
            );
            tokio::time::sleep(self.policy.delay()).await;
        }
    }

    fn publish_abort<E: fmt::Display>(&self, label: &str, kind: K, error: &E) {
        let Some(aborts) = &self.aborts else {
            return;
        };
        let aborted = AbortedError {
            operation: label.to_string(),
            kind,
            message: error.to_string(),
            at: Utc::now(),
        };
        if aborts.send(aborted).is_err() {
            debug!(operation = label, "No abort listeners.");
        }
    }
}
