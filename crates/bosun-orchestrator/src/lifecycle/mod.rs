//! Lifecycle orchestration.
//!
//! [`Orchestrator`] turns a [`Deployment`](crate::topology::Deployment) and
//! a runtime into ordered, idempotent container operations.

mod config;
mod orchestrator;

pub use config::{DeployOptions, OrchestratorConfig, OrchestratorConfigBuilder, DEFAULT_STOP_TIMEOUT};
pub use orchestrator::{ContainerReport, Orchestrator};
