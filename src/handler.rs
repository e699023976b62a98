//! Types shared by event and message handlers.

use crate::consumer::EntryOutcome;

/// Failure reported by a handler. The delivery is retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Result of running one delivery through its handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// All handlers succeeded.
    Success,
    /// The delivery was decoded but not meant for this consumer.
    Skipped,
    /// At least one handler failed; redeliver.
    HandlerFailed,
    /// The payload could not be decoded; redelivery cannot help.
    DecodeError,
}

impl DispatchResult {
    /// Whether the delivery should be acknowledged (removed for good).
    ///
    /// Undecodable deliveries are acked so they are not redelivered forever.
    pub fn should_ack(&self) -> bool {
        !matches!(self, Self::HandlerFailed)
    }

    pub fn entry_outcome(&self) -> EntryOutcome {
        if self.should_ack() {
            EntryOutcome::Ack
        } else {
            EntryOutcome::Retry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_ack() {
        assert!(DispatchResult::Success.should_ack());
        assert!(DispatchResult::Skipped.should_ack());
        assert!(DispatchResult::DecodeError.should_ack());
        assert!(!DispatchResult::HandlerFailed.should_ack());
    }

    #[test]
    fn test_entry_outcome() {
        assert_eq!(DispatchResult::HandlerFailed.entry_outcome(), EntryOutcome::Retry);
        assert_eq!(DispatchResult::DecodeError.entry_outcome(), EntryOutcome::Ack);
    }
}
