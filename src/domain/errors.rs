use crate::domain::types::{OrderStatus, TaskName};
use thiserror::Error;

/// Errors surfaced by the broker adapter. Transport-level failures are
/// folded into `Transient` so that callers have a single retry decision.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Transient broker error: {reason}")]
    Transient { reason: String },

    #[error("Broker call deadline exceeded after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Broker session expired")]
    SessionExpired,

    #[error("Order rejected by broker: {reason}")]
    Rejected { reason: String },

    #[error("Invalid broker request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Authentication failed: {reason}")]
    AuthFailed { reason: String },
}

impl BrokerError {
    /// Deadline overruns count as transient fetch errors.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient { .. } | BrokerError::Timeout { .. })
    }
}

/// Violations of the order state machine. Terminal rows reject every
/// further transition; everything else must follow the transition table.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Order {local_id} is terminal in {status}; transition rejected")]
    Terminal { local_id: String, status: OrderStatus },

    #[error("Illegal transition {from} -> {to} for order {local_id}")]
    Illegal {
        local_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },
}

/// Lifecycle-control errors raised by the service manager.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("A conflicting service is already running for user {user_id}")]
    AlreadyRunning { user_id: i64 },

    #[error("No running service for user {user_id}")]
    NotRunning { user_id: i64 },

    #[error("Task {task} is already executing or was dispatched within the conflict window")]
    Conflict { task: TaskName },

    #[error("Task {task} requires live prices and the market is closed")]
    MarketClosed { task: TaskName },

    #[error("Schedule edits require admin privileges")]
    AdminOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(
            BrokerError::Transient {
                reason: "HTTP 503".to_string()
            }
            .is_transient()
        );
        assert!(BrokerError::Timeout { seconds: 15 }.is_transient());
        assert!(!BrokerError::SessionExpired.is_transient());
        assert!(
            !BrokerError::Rejected {
                reason: "margin disabled".to_string()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_transition_error_formatting() {
        let err = TransitionError::Illegal {
            local_id: "abc".to_string(),
            from: OrderStatus::Closed,
            to: OrderStatus::Pending,
        };
        let msg = err.to_string();
        assert!(msg.contains("closed"));
        assert!(msg.contains("pending"));
    }
}
