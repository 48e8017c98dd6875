//! Observed container state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of one named container as reported by the runtime.
///
/// Never cached: the orchestrator asks again before every decision, since
/// containers can crash or be changed by hand between commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum ContainerState {
    /// No container with this name exists.
    Absent,

    /// Created but never started.
    Created,

    /// Running.
    Running,

    /// Exited or stopped.
    Stopped,

    /// The runtime reports a state the orchestrator cannot act on cleanly.
    Error(String),
}

impl ContainerState {
    /// Returns true if a container exists under this name.
    pub fn exists(&self) -> bool {
        !matches!(self, Self::Absent)
    }

    /// Returns true if the container is running.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns the lowercase state name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Absent => "absent",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(reason) => write!(f, "error ({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}
