//! Error types for the orchestrator crate.
//!
//! Errors fall into three groups. Validation errors (bad configuration,
//! unknown or cyclic dependencies) are always raised before the runtime is
//! touched. Transport errors mean the runtime could not be reached at all.
//! Runtime and build errors mean the runtime was reached and rejected the
//! operation.

use thiserror::Error;

use crate::plan::Action;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur during orchestration operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// Invalid or inconsistent configuration.
    #[error("validation error: {0}")]
    Validation(String),

    /// An accessory depends on an identifier that was never declared.
    #[error("accessory {referrer} depends on undeclared accessory {dependency}")]
    UnknownDependency {
        /// The missing identifier.
        dependency: String,
        /// The accessory that referenced it.
        referrer: String,
    },

    /// A command named an accessory that is not declared.
    #[error("unknown accessory: {0}")]
    UnknownAccessory(String),

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle {
        /// The cycle, with the first identifier repeated at the end.
        path: Vec<String>,
    },

    /// A dependency of a single-target operation is not running.
    #[error("cannot start {target}: dependency {dependency} is {state}")]
    DependencyNotReady {
        /// The accessory the operation was aimed at.
        target: String,
        /// The dependency that is not running.
        dependency: String,
        /// The observed state of the dependency.
        state: String,
    },

    /// The runtime could not be reached.
    #[error("transport error during {action} of {target}: {reason}")]
    Transport {
        /// The container or endpoint the operation was aimed at.
        target: String,
        /// The attempted action.
        action: Action,
        /// The reason for the failure.
        reason: String,
    },

    /// The runtime rejected an operation.
    #[error("runtime rejected {action} of {target}: {reason}")]
    Runtime {
        /// The container the operation was aimed at.
        target: String,
        /// The attempted action.
        action: Action,
        /// The reason for the failure.
        reason: String,
    },

    /// The runtime reported an image build failure.
    #[error("failed to build image {tag}: {reason}")]
    Build {
        /// The image tag being built.
        tag: String,
        /// The reason for the failure.
        reason: String,
    },

    /// A container with this name already exists.
    #[error("container already exists: {0}")]
    AlreadyExists(String),

    /// The container does not exist.
    #[error("cannot {action} {target}: container not found")]
    NotFound {
        /// The container name.
        target: String,
        /// The attempted action.
        action: Action,
    },

    /// The container is already running.
    #[error("container already running: {0}")]
    AlreadyRunning(String),
}

impl OrchestratorError {
    /// Creates a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// Creates an unknown dependency error.
    pub fn unknown_dependency(dependency: impl Into<String>, referrer: impl Into<String>) -> Self {
        Self::UnknownDependency {
            dependency: dependency.into(),
            referrer: referrer.into(),
        }
    }

    /// Creates an unknown accessory error.
    pub fn unknown_accessory(name: impl Into<String>) -> Self {
        Self::UnknownAccessory(name.into())
    }

    /// Creates a cycle error from the identifiers along the cycle.
    pub fn cycle(path: Vec<String>) -> Self {
        Self::Cycle { path }
    }

    /// Creates a dependency not ready error.
    pub fn dependency_not_ready(
        target: impl Into<String>,
        dependency: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        Self::DependencyNotReady {
            target: target.into(),
            dependency: dependency.into(),
            state: state.into(),
        }
    }

    /// Creates a transport error.
    pub fn transport(target: impl Into<String>, action: Action, reason: impl Into<String>) -> Self {
        Self::Transport {
            target: target.into(),
            action,
            reason: reason.into(),
        }
    }

    /// Creates a runtime error.
    pub fn runtime(target: impl Into<String>, action: Action, reason: impl Into<String>) -> Self {
        Self::Runtime {
            target: target.into(),
            action,
            reason: reason.into(),
        }
    }

    /// Creates a build error.
    pub fn build(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Build {
            tag: tag.into(),
            reason: reason.into(),
        }
    }

    /// Creates an already exists error.
    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::AlreadyExists(name.into())
    }

    /// Creates a not found error.
    pub fn not_found(target: impl Into<String>, action: Action) -> Self {
        Self::NotFound {
            target: target.into(),
            action,
        }
    }

    /// Creates an already running error.
    pub fn already_running(name: impl Into<String>) -> Self {
        Self::AlreadyRunning(name.into())
    }

    /// Returns true if the error was raised while checking configuration,
    /// before any runtime call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::UnknownDependency { .. }
                | Self::UnknownAccessory(_)
                | Self::Cycle { .. }
        )
    }

    /// Returns true if the runtime could not be reached.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Returns true if this is a not found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns the action the error was raised for, if it carries one.
    pub fn action(&self) -> Option<Action> {
        match self {
            Self::Transport { action, .. }
            | Self::Runtime { action, .. }
            | Self::NotFound { action, .. } => Some(*action),
            Self::Build { .. } => Some(Action::Build),
            Self::AlreadyExists(_) => Some(Action::Create),
            Self::AlreadyRunning(_) | Self::DependencyNotReady { .. } => Some(Action::Start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::unknown_dependency("ghost", "api");
        assert_eq!(
            err.to_string(),
            "accessory api depends on undeclared accessory ghost"
        );

        let err = OrchestratorError::cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");

        let err = OrchestratorError::not_found("web", Action::Start);
        assert_eq!(err.to_string(), "cannot start web: container not found");
    }

    #[test]
    fn test_error_classification() {
        assert!(OrchestratorError::validation("bad port").is_validation());
        assert!(OrchestratorError::cycle(vec![]).is_validation());
        assert!(!OrchestratorError::build("app:latest", "boom").is_validation());

        let err = OrchestratorError::transport("db", Action::Create, "connection refused");
        assert!(err.is_transport());
        assert!(!OrchestratorError::runtime("db", Action::Create, "conflict").is_transport());
    }

    #[test]
    fn test_error_action() {
        assert_eq!(
            OrchestratorError::build("app", "boom").action(),
            Some(Action::Build)
        );
        assert_eq!(
            OrchestratorError::dependency_not_ready("api", "db", "stopped").action(),
            Some(Action::Start)
        );
        assert_eq!(OrchestratorError::validation("x").action(), None);
    }
}
