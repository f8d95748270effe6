//! Worker lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a worker. Process-local, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// No loop task exists.
    Stopped,
    /// A loop task is being spawned.
    Starting,
    /// The loop task is pulling and translating jobs.
    Running,
    /// Cancellation was signalled; waiting for the loop to reach a safe point.
    Stopping,
}

impl WorkerStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: WorkerStatus) -> bool {
        use WorkerStatus::*;

        matches!(
            (self, target),
            (Stopped, Starting) |
            (Starting, Running) | (Starting, Stopped) |
            (Running, Stopping) |
            // The loop ended on its own (server vanished, task panicked).
            (Running, Stopped) |
            (Stopping, Stopped)
        )
    }

    /// Whether a loop task exists or is about to.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle_is_allowed() {
        use WorkerStatus::*;
        let cycle = [Stopped, Starting, Running, Stopping, Stopped];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn cannot_restart_while_active() {
        assert!(!WorkerStatus::Running.can_transition_to(WorkerStatus::Starting));
        assert!(!WorkerStatus::Stopping.can_transition_to(WorkerStatus::Starting));
    }

    #[test]
    fn cannot_stop_twice() {
        assert!(!WorkerStatus::Stopped.can_transition_to(WorkerStatus::Stopping));
    }

    #[test]
    fn serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(WorkerStatus::Running).unwrap(),
            serde_json::json!("running")
        );
        assert!(WorkerStatus::Starting.is_active());
        assert!(!WorkerStatus::Stopping.is_active());
    }
}
