use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("correlation id '{0}' is already pending")]
    Duplicate(String),
}

/// A blocking send waiting for its ACK.
#[derive(Debug, Clone)]
pub struct PendingCorrelation {
    pub correlation_id: String,
    pub connection_id: u64,
    pub request_id: Option<String>,
    pub event_id: String,
    pub target: String,
    pub created_at: Instant,
    pub deadline: Instant,
}

/// Tracks blocking sends by correlation id and guarantees at-most-once
/// completion per id: the first of {ack, timeout, connection close} wins and
/// removes the entry; later ACKs find nothing and are dropped.
#[derive(Debug, Default)]
pub struct SyncCorrelator {
    pending: HashMap<String, PendingCorrelation>,
}

impl SyncCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        correlation_id: &str,
        connection_id: u64,
        request_id: Option<String>,
        event_id: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<(), CorrelatorError> {
        if self.pending.contains_key(correlation_id) {
            return Err(CorrelatorError::Duplicate(correlation_id.to_string()));
        }
        let now = Instant::now();
        self.pending.insert(
            correlation_id.to_string(),
            PendingCorrelation {
                correlation_id: correlation_id.to_string(),
                connection_id,
                request_id,
                event_id: event_id.to_string(),
                target: target.to_string(),
                created_at: now,
                deadline: now + timeout,
            },
        );
        Ok(())
    }

    /// Resolve a pending correlation. `None` means the id already completed
    /// (or never existed) and the caller should drop the ACK.
    pub fn complete(&mut self, correlation_id: &str) -> Option<PendingCorrelation> {
        self.pending.remove(correlation_id)
    }

    /// Drain every correlation whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingCorrelation> {
        let expired_ids: Vec<String> = self
            .pending
            .values()
            .filter(|entry| now >= entry.deadline)
            .map(|entry| entry.correlation_id.clone())
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    /// Drop every correlation owned by a closed connection.
    pub fn cancel_connection(&mut self, connection_id: u64) -> Vec<PendingCorrelation> {
        let ids: Vec<String> = self
            .pending
            .values()
            .filter(|entry| entry.connection_id == connection_id)
            .map(|entry| entry.correlation_id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{CorrelatorError, SyncCorrelator};

    fn register(corr: &mut SyncCorrelator, id: &str, conn: u64) {
        corr.register(id, conn, Some("req_1".into()), "evt_1", "A", Duration::from_secs(30))
            .unwrap();
    }

    #[test]
    fn duplicate_while_pending_rejected() {
        let mut corr = SyncCorrelator::new();
        register(&mut corr, "c1", 1);
        let err = corr
            .register("c1", 2, None, "evt_2", "B", Duration::from_secs(30))
            .unwrap_err();
        assert_eq!(err, CorrelatorError::Duplicate("c1".into()));
    }

    #[test]
    fn completion_is_at_most_once() {
        let mut corr = SyncCorrelator::new();
        register(&mut corr, "c1", 1);
        assert!(corr.complete("c1").is_some());
        assert!(corr.complete("c1").is_none());
    }

    #[test]
    fn completed_id_may_be_reused() {
        let mut corr = SyncCorrelator::new();
        register(&mut corr, "c1", 1);
        corr.complete("c1");
        register(&mut corr, "c1", 1);
        assert!(corr.is_pending("c1"));
    }

    #[test]
    fn expiry_drains_only_overdue() {
        let mut corr = SyncCorrelator::new();
        corr.register("slow", 1, None, "evt_1", "A", Duration::from_millis(0))
            .unwrap();
        corr.register("fast", 1, None, "evt_2", "B", Duration::from_secs(60))
            .unwrap();

        let expired = corr.expire(Instant::now() + Duration::from_millis(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].correlation_id, "slow");
        assert!(corr.is_pending("fast"));
    }

    #[test]
    fn expired_id_cannot_complete_again() {
        let mut corr = SyncCorrelator::new();
        corr.register("c1", 1, None, "evt_1", "A", Duration::from_millis(0))
            .unwrap();
        let expired = corr.expire(Instant::now() + Duration::from_millis(1));
        assert_eq!(expired.len(), 1);
        assert!(corr.complete("c1").is_none());
    }

    #[test]
    fn connection_close_cancels_only_its_own() {
        let mut corr = SyncCorrelator::new();
        register(&mut corr, "a", 1);
        register(&mut corr, "b", 1);
        register(&mut corr, "c", 2);

        let cancelled = corr.cancel_connection(1);
        assert_eq!(cancelled.len(), 2);
        assert!(!corr.is_pending("a"));
        assert!(!corr.is_pending("b"));
        assert!(corr.is_pending("c"));
    }
}
