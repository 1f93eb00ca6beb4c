//! Relay stream status machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle status of a relay stream.
///
/// The only legal histories are `Starting -> Active -> Stopped` and
/// `Starting -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// Worker spawned, still inside its grace period.
    #[default]
    Starting,
    /// Worker survived the grace period.
    Active,
    /// Terminal.
    Stopped,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Whether a worker process belongs to a record in this status.
    pub fn holds_process(&self) -> bool {
        !self.is_terminal()
    }

    /// Only forward moves are legal; rewriting the current status is not a move.
    pub fn can_transition_to(&self, target: StreamStatus) -> bool {
        use StreamStatus::*;

        matches!(
            (self, target),
            (Starting, Active) | (Starting, Stopped) | (Active, Stopped)
        )
    }

    pub fn transition_to(&self, target: StreamStatus) -> Result<StreamStatus, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a stream reached `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// An operator asked for the stop.
    Requested,
    /// The worker could not be started.
    SpawnFailed,
    /// The worker reported a known failure signature.
    RuntimeFailure,
    /// The worker exited on its own.
    UnexpectedExit,
    /// The supervisor is shutting down.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StreamStatus::Starting, StreamStatus::Active, true)]
    #[case(StreamStatus::Starting, StreamStatus::Stopped, true)]
    #[case(StreamStatus::Active, StreamStatus::Stopped, true)]
    #[case(StreamStatus::Active, StreamStatus::Starting, false)]
    #[case(StreamStatus::Active, StreamStatus::Active, false)]
    #[case(StreamStatus::Starting, StreamStatus::Starting, false)]
    #[case(StreamStatus::Stopped, StreamStatus::Starting, false)]
    #[case(StreamStatus::Stopped, StreamStatus::Active, false)]
    #[case(StreamStatus::Stopped, StreamStatus::Stopped, false)]
    fn test_transitions(
        #[case] from: StreamStatus,
        #[case] to: StreamStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
        assert_eq!(from.transition_to(to).is_ok(), allowed);
    }

    #[test]
    fn test_transition_error() {
        let err = StreamStatus::Stopped
            .transition_to(StreamStatus::Active)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid state transition: cannot transition from stopped to active"
        );
    }

    #[test]
    fn test_only_running_statuses_hold_a_process() {
        assert!(StreamStatus::Starting.holds_process());
        assert!(StreamStatus::Active.holds_process());
        assert!(!StreamStatus::Stopped.holds_process());
    }
}
