//! Container runtime backends.
//!
//! The orchestrator only sees the [`ContainerRuntime`] trait. [`connect`]
//! picks the implementation from the builder configuration: the local Docker
//! daemon, or a remote one over TCP, a unix socket or an SSH tunnel.

mod docker;
mod memory;
mod r#trait;
mod transport;

use std::sync::Arc;

use tracing::info;

pub use docker::DockerRuntime;
pub use memory::{InMemoryRuntime, RuntimeCall};
pub use r#trait::{
    BuildRequest, BuiltImage, ContainerRuntime, LogOptions, LogStream, RemoveOptions,
    SharedRuntime,
};
pub use transport::{SshTunnel, REMOTE_DOCKER_SOCKET};

use crate::error::Result;
use crate::topology::{BuildMode, BuilderSpec};

/// Connects to the runtime selected by the builder's mode.
///
/// The returned handle owns the connection, including any SSH tunnel, and
/// releases it when the last clone is dropped.
pub async fn connect(builder: &BuilderSpec) -> Result<SharedRuntime> {
    let runtime = match &builder.mode {
        BuildMode::Local => DockerRuntime::connect_local().await?,
        BuildMode::Remote { endpoint } => {
            info!(endpoint = %endpoint, "Connecting to remote runtime");
            DockerRuntime::connect_remote(endpoint).await?
        }
    };
    Ok(Arc::new(runtime))
}
