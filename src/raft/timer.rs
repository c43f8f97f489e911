use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// Election deadline of one member, redrawn on every reset.
#[derive(Debug, Clone)]
pub struct ElectionTimer {
    min_ms: u64,
    max_ms: u64,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(min_ms: u64, max_ms: u64, now: Instant) -> Self {
        Self {
            min_ms,
            max_ms,
            deadline: now + random_election_timeout(min_ms, max_ms),
        }
    }

    /// Timer whose first deadline is fixed instead of drawn.
    pub fn with_initial(min_ms: u64, max_ms: u64, initial: Duration, now: Instant) -> Self {
        Self {
            min_ms,
            max_ms,
            deadline: now + initial,
        }
    }

    /// Push the deadline out by a freshly randomized timeout and return it.
    pub fn reset(&mut self, now: Instant) -> Duration {
        let timeout = random_election_timeout(self.min_ms, self.max_ms);
        self.deadline = now + timeout;
        timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}
