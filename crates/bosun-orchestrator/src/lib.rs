//! Dependency-aware container lifecycle engine.
//!
//! This crate turns a declared deployment (one primary service plus accessory
//! containers with dependencies) into an ordered, idempotent sequence of
//! container operations, run against a local or remote container runtime.
//!
//! # Overview
//!
//! The orchestrator handles:
//! - **Dependency resolution**: Ordering accessories so dependencies start
//!   first and stop last, and rejecting unknown references and cycles
//! - **Image builds**: Resolving the build context, dockerfile, platform and
//!   build arguments, then building and tagging the primary image
//! - **Container lifecycle**: Creating, starting, stopping, restarting,
//!   rebooting and removing containers based on their observed state
//! - **Reporting**: Recording every executed, skipped and failed step in a
//!   [`PlanResult`]
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`topology`]: Validated deployment model (service, accessories, builder)
//! - [`graph`]: Dependency graph resolution
//! - [`container`]: Container specifications and observed state
//! - [`backend`]: Container runtime trait and implementations
//! - [`build`]: Image build coordination
//! - [`lifecycle`]: The orchestrator and its configuration
//! - [`plan`]: Operation plans and their results
//! - [`error`]: Error types for orchestration operations
//!
//! # Example
//!
//! ```ignore
//! use bosun_orchestrator::{
//!     backend,
//!     topology::{AccessorySpec, BuilderSpec, Deployment, ServiceSpec},
//!     DeployOptions, Orchestrator, OrchestratorConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = ServiceSpec::builder("web")
//!         .image("registry.example.com/web")
//!         .port("8080:80".parse()?)
//!         .build()?;
//!     let db = AccessorySpec::builder("db").image("postgres:16").build()?;
//!     let api = AccessorySpec::builder("api")
//!         .image("registry.example.com/api:2")
//!         .depends_on("db")
//!         .build()?;
//!
//!     let deployment = Deployment::new(service, BuilderSpec::local(), vec![db, api])?;
//!     let runtime = backend::connect(deployment.builder()).await?;
//!     let orchestrator = Orchestrator::new(deployment, runtime, OrchestratorConfig::default());
//!
//!     let result = orchestrator.deploy(DeployOptions::default()).await?;
//!     result.into_result()?;
//!     Ok(())
//! }
//! ```
//!
//! # Backends
//!
//! - [`DockerRuntime`](backend::DockerRuntime): Talks to a Docker daemon via
//!   bollard, locally or through TCP, a unix socket or an SSH tunnel.
//! - [`InMemoryRuntime`](backend::InMemoryRuntime): Keeps containers in memory
//!   and records every call, for tests and embedding.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backend;
pub mod build;
pub mod container;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod plan;
pub mod topology;

// Re-export commonly used types at the crate root
pub use backend::{
    ContainerRuntime, InMemoryRuntime, LogOptions, LogStream, RemoveOptions, SharedRuntime,
};
pub use build::BuildCoordinator;
pub use container::{ContainerSpec, ContainerState};
pub use error::{OrchestratorError, Result};
pub use graph::{resolve, ExecutionOrder};
pub use lifecycle::{ContainerReport, DeployOptions, Orchestrator, OrchestratorConfig};
pub use plan::{Action, Command, Intent, Outcome, PlanResult, PlanStep};
pub use topology::{AccessorySpec, BuilderSpec, Deployment, ServiceSpec};
