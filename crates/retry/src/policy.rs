use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

/// Maps an error to the kind the retry decisions branch on.
pub trait Classify {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Bounds and classification for one family of retried operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy<K> {
    max_attempts: u32,
    delay: Duration,
    stop_kinds: HashSet<K>,
    benign_kinds: HashSet<K>,
}

impl<K: Copy + Eq + Hash> RetryPolicy<K> {
    /// `max_attempts` is clamped to at least one attempt.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            stop_kinds: HashSet::new(),
            benign_kinds: HashSet::new(),
        }
    }

    /// Kinds that end the run on the first occurrence.
    pub fn stop_on(mut self, kinds: impl IntoIterator<Item = K>) -> Self {
        self.stop_kinds.extend(kinds);
        self
    }

    /// Stop kinds that mean "already handled": they end the run but are not
    /// published on the abort channel.
    pub fn benign(mut self, kinds: impl IntoIterator<Item = K>) -> Self {
        self.benign_kinds.extend(kinds);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_stop(&self, kind: &K) -> bool {
        self.stop_kinds.contains(kind)
    }

    pub fn is_benign(&self, kind: &K) -> bool {
        self.benign_kinds.contains(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_are_at_least_one() {
        let policy: RetryPolicy<u8> = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_stop_and_benign_sets() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10))
            .stop_on([1u8, 2])
            .benign([2u8]);
        assert!(policy.is_stop(&1));
        assert!(!policy.is_benign(&1));
        assert!(policy.is_benign(&2));
        assert!(!policy.is_stop(&3));
    }
}
