//! Process identity and lifecycle
//!
//! ```text
//! Starting ──spawn──▶ Running ──exit 0──────▶ Completed
//!                        │ ───exit ≠ 0────▶ Failed
//!                        │ ───budget spent─▶ TimedOut
//!                        └───cancel───────▶ Killed
//! ```
//!
//! A failed spawn goes straight from `Starting` to `Failed`. Terminal states
//! have no outgoing transitions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of one in-flight process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(Uuid);

impl ProcessId {
    /// Generate a new unique identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an identifier received from a client
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of one external process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Admitted, not yet spawned
    Starting,
    /// Spawned and supervised
    Running,
    /// Exited with status 0
    Completed,
    /// Exited non-zero, or never spawned
    Failed,
    /// Terminated by a cancellation
    Killed,
    /// Terminated after exceeding its wall-clock budget
    TimedOut,
}

impl ProcessState {
    /// Human-readable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Killed => "Killed",
            Self::TimedOut => "TimedOut",
        }
    }

    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Killed | Self::TimedOut
        )
    }

    /// Whether `next` is a legal successor
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Starting, Self::Running | Self::Failed) => true,
            (Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    /// Move to `next` if legal; returns whether the state changed
    pub fn advance(&mut self, next: Self) -> bool {
        if self.can_transition_to(next) {
            *self = next;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}
