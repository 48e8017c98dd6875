//! Container runtime trait definition.
//!
//! This module defines the capability interface the orchestrator drives,
//! along with the request and response types of its operations.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::container::{ContainerSpec, ContainerState};
use crate::error::Result;

/// A lazily produced sequence of log lines.
///
/// Finite when logs are not followed, unbounded otherwise. Dropping the
/// stream cancels it.
pub type LogStream = BoxStream<'static, Result<String>>;

/// Core trait for container runtimes.
///
/// A runtime executes single operations on named containers. It knows
/// nothing about dependencies or plans; the orchestrator decides what to
/// call and in which order.
///
/// # Idempotence
///
/// - `create` fails with [`AlreadyExists`](crate::OrchestratorError::AlreadyExists)
///   if the name is taken, so callers check `status` first
/// - `start` succeeds on a running container and fails with
///   [`NotFound`](crate::OrchestratorError::NotFound) on an absent one
/// - `stop` succeeds on a stopped container
/// - `remove` succeeds on an absent container
///
/// # Errors
///
/// Every operation distinguishes a runtime that could not be reached
/// ([`Transport`](crate::OrchestratorError::Transport)) from one that
/// rejected the request ([`Runtime`](crate::OrchestratorError::Runtime)).
///
/// # Example
///
/// ```ignore
/// use bosun_orchestrator::backend::{connect, ContainerRuntime};
/// use bosun_orchestrator::topology::BuilderSpec;
///
/// let runtime = connect(&BuilderSpec::local()).await?;
/// let state = runtime.status("web").await?;
/// println!("web is {state}");
/// ```
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the observed state of a container.
    async fn status(&self, name: &str) -> Result<ContainerState>;

    /// Creates a container and returns its ID.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Starts a container.
    async fn start(&self, name: &str) -> Result<()>;

    /// Stops a container, killing it after `timeout`.
    async fn stop(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Removes a container in any state.
    ///
    /// A running container is stopped within `options.stop_timeout` first.
    async fn remove(&self, name: &str, options: RemoveOptions) -> Result<()>;

    /// Returns the container's log lines.
    async fn logs(&self, name: &str, options: LogOptions) -> Result<LogStream>;

    /// Builds an image, streaming progress into the log.
    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage>;

    /// Returns the runtime name.
    fn name(&self) -> &str;

    /// Returns true if the runtime can currently be reached.
    async fn is_ready(&self) -> bool;
}

/// Options for reading container logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    /// Keep streaming new lines.
    pub follow: bool,

    /// Only return the last `n` lines.
    pub tail: Option<usize>,

    /// Prefix lines with timestamps.
    pub timestamps: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: false,
            tail: Some(100),
            timestamps: false,
        }
    }
}

impl LogOptions {
    /// Follows the logs.
    pub fn follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    /// Sets how many trailing lines to return; `None` means all.
    pub fn tail(mut self, tail: Option<usize>) -> Self {
        self.tail = tail;
        self
    }

    /// Prefixes lines with timestamps.
    pub fn timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }
}

/// Options for removing a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveOptions {
    /// Grace period for a running container before it is killed.
    pub stop_timeout: Duration,

    /// Also remove anonymous volumes.
    pub volumes: bool,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            volumes: false,
        }
    }
}

/// A fully resolved image build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Build context directory on the local machine.
    pub context: PathBuf,

    /// Dockerfile path relative to the context.
    pub dockerfile: PathBuf,

    /// Tag for the resulting image.
    pub tag: String,

    /// Target platform, e.g. `linux/amd64`.
    pub platform: String,

    /// Build arguments.
    pub build_args: BTreeMap<String, String>,

    /// Always pull newer base images.
    pub pull: bool,

    /// Do not use the build cache.
    pub no_cache: bool,
}

/// The image produced by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltImage {
    /// The tag the image was built under.
    pub tag: String,

    /// The image ID, when the runtime reports one.
    pub id: Option<String>,
}

/// A type-erased, shareable container runtime.
pub type SharedRuntime = std::sync::Arc<dyn ContainerRuntime>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_options_defaults() {
        let options = LogOptions::default();
        assert!(!options.follow);
        assert_eq!(options.tail, Some(100));

        let options = options.follow(true).tail(None).timestamps(true);
        assert!(options.follow);
        assert_eq!(options.tail, None);
        assert!(options.timestamps);
    }
}
