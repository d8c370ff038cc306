use crate::domain::types::OrderStatus;

/// Whether a failure reason is worth retrying. Decided once, at entry into
/// `failed`; permanent failures are cancelled immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

const TRANSIENT_MARKERS: &[&str] = &[
    "insufficient balance",
    "insufficient funds",
    "rate limit",
    "throttl",
    "timeout",
    "timed out",
    "network",
    "connection",
    "temporarily unavailable",
    "internal server error",
    "http 5",
];

const PERMANENT_MARKERS: &[&str] = &[
    "invalid symbol",
    "unknown symbol",
    "instrument not found",
    "lot size",
    "unsupported exchange",
    "margin disabled",
    "not allowed for this segment",
    "banned",
];

/// Substring catalog over the broker's free-text reason. Permanent markers
/// win over transient ones; anything unrecognized defaults to transient so
/// that expiry, not classification, terminates ambiguous failures.
pub fn classify_failure(reason: &str) -> FailureClass {
    let lowered = reason.to_lowercase();
    if PERMANENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return FailureClass::Permanent;
    }
    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return FailureClass::Transient;
    }
    FailureClass::Transient
}

/// The canonical transition table. The repository layer applies this
/// regardless of which collaborator asked for the write.
pub fn transition_allowed(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    match (from, to) {
        (Pending, Ongoing) => true,
        (Pending, Failed) => true,
        (Pending, Cancelled) => true,
        (Pending, Closed) => true, // sell that closes the position in one fill
        (Ongoing, Closed) => true,
        (Failed, Pending) => true, // retry dispatch
        (Failed, Cancelled) => true,
        // Terminal states, and everything else, reject.
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderStatus::*;

    #[test]
    fn test_terminal_states_reject_everything() {
        for terminal in [Closed, Cancelled] {
            for to in [Pending, Ongoing, Failed, Closed, Cancelled] {
                assert!(
                    !transition_allowed(terminal, to),
                    "{:?} -> {:?} must be rejected",
                    terminal,
                    to
                );
            }
        }
    }

    #[test]
    fn test_retry_dispatch_path() {
        assert!(transition_allowed(Failed, Pending));
        assert!(transition_allowed(Failed, Cancelled));
        assert!(!transition_allowed(Failed, Ongoing));
        assert!(!transition_allowed(Failed, Closed));
    }

    #[test]
    fn test_pending_fanout() {
        assert!(transition_allowed(Pending, Ongoing));
        assert!(transition_allowed(Pending, Failed));
        assert!(transition_allowed(Pending, Cancelled));
        assert!(transition_allowed(Pending, Closed));
        assert!(!transition_allowed(Ongoing, Pending));
    }

    #[test]
    fn test_classification_transient() {
        assert_eq!(
            classify_failure("RMS: Insufficient Balance for order value"),
            FailureClass::Transient
        );
        assert_eq!(classify_failure("Rate limit exceeded"), FailureClass::Transient);
        assert_eq!(classify_failure("connection reset by peer"), FailureClass::Transient);
    }

    #[test]
    fn test_classification_permanent() {
        assert_eq!(classify_failure("Invalid symbol: ACMEX"), FailureClass::Permanent);
        assert_eq!(
            classify_failure("Quantity not a multiple of lot size"),
            FailureClass::Permanent
        );
        assert_eq!(classify_failure("Margin disabled for account"), FailureClass::Permanent);
    }

    #[test]
    fn test_unknown_reason_defaults_to_transient() {
        assert_eq!(classify_failure("some new broker message"), FailureClass::Transient);
    }
}
