use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use crate::queue::Queued;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Queued,
    Injecting,
    Verified,
    Acked,
    Failed,
    Dropped,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryState::Acked | DeliveryState::Failed | DeliveryState::Dropped
        )
    }

    /// Legal forward edges of the state machine. `Injecting → Queued` is the
    /// retry edge; everything else is monotone.
    pub fn can_transition(self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        matches!(
            (self, next),
            (Queued, Injecting)
                | (Queued, Dropped)
                | (Queued, Failed)
                | (Injecting, Verified)
                | (Injecting, Queued)
                | (Injecting, Failed)
                | (Injecting, Dropped)
                | (Verified, Acked)
        )
    }
}

/// An in-flight unit addressed to exactly one agent.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: String,
    pub event_id: String,
    pub from: String,
    pub target: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub priority: u8,
    pub correlation_id: Option<String>,
    pub attempts: u32,
    pub state: DeliveryState,
    pub created_at: Instant,
    pub last_attempted_at: Option<Instant>,
}

impl Delivery {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: &str,
        from: &str,
        target: &str,
        body: &str,
        thread_id: Option<String>,
        priority: u8,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            delivery_id: format!("del_{}", Uuid::new_v4().simple()),
            event_id: event_id.to_string(),
            from: from.to_string(),
            target: target.to_string(),
            body: body.to_string(),
            thread_id,
            priority,
            correlation_id,
            attempts: 0,
            state: DeliveryState::Queued,
            created_at: Instant::now(),
            last_attempted_at: None,
        }
    }

    pub fn transition(&mut self, next: DeliveryState) -> bool {
        if !self.state.can_transition(next) {
            tracing::warn!(
                target = "fleet::delivery",
                delivery_id = %self.delivery_id,
                from_state = ?self.state,
                to_state = ?next,
                "rejected illegal delivery state transition"
            );
            return false;
        }
        self.state = next;
        true
    }

    /// Move into `Injecting`, bumping the attempt counter.
    pub fn begin_attempt(&mut self) -> bool {
        if !self.transition(DeliveryState::Injecting) {
            return false;
        }
        self.attempts += 1;
        self.last_attempted_at = Some(Instant::now());
        true
    }

    /// Retry edge: back to the queue after a failed attempt.
    pub fn return_to_queue(&mut self) -> bool {
        self.transition(DeliveryState::Queued)
    }
}

impl Queued for Delivery {
    fn priority(&self) -> u8 {
        self.priority
    }

    fn enqueued_at(&self) -> Instant {
        self.created_at
    }
}

pub fn new_event_id() -> String {
    format!("evt_{}", Uuid::new_v4().simple())
}

pub fn new_correlation_id() -> String {
    format!("corr_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::{Delivery, DeliveryState};

    fn delivery() -> Delivery {
        Delivery::new("evt_1", "S", "A", "ping", None, 2, None)
    }

    #[test]
    fn happy_path_is_monotone() {
        let mut d = delivery();
        assert!(d.begin_attempt());
        assert!(d.transition(DeliveryState::Verified));
        assert!(d.transition(DeliveryState::Acked));
        assert!(d.state.is_terminal());
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut d = delivery();
        d.begin_attempt();
        d.transition(DeliveryState::Failed);
        assert!(!d.transition(DeliveryState::Queued));
        assert!(!d.transition(DeliveryState::Verified));
        assert_eq!(d.state, DeliveryState::Failed);
    }

    #[test]
    fn retry_edge_preserves_attempts() {
        let mut d = delivery();
        assert!(d.begin_attempt());
        assert!(d.return_to_queue());
        assert!(d.begin_attempt());
        assert_eq!(d.attempts, 2);
    }

    #[test]
    fn cannot_ack_without_verification() {
        let mut d = delivery();
        d.begin_attempt();
        assert!(!d.transition(DeliveryState::Acked));
    }

    #[test]
    fn queued_can_be_dropped() {
        let mut d = delivery();
        assert!(d.transition(DeliveryState::Dropped));
        assert!(d.state.is_terminal());
    }

    #[test]
    fn delivery_ids_are_unique() {
        assert_ne!(delivery().delivery_id, delivery().delivery_id);
    }
}
