//! Docker runtime implementation.
//!
//! This module provides a container runtime that talks to a Docker daemon
//! through the Docker API (via bollard), either the local daemon or a remote
//! one reached over TCP, a unix socket, or an SSH tunnel.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::service::{
    ContainerStateStatusEnum, HostConfig, PortBinding, RestartPolicy as DockerRestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::backend::r#trait::{
    BuildRequest, BuiltImage, ContainerRuntime, LogOptions, LogStream, RemoveOptions,
};
use crate::backend::transport::SshTunnel;
use crate::container::{ContainerSpec, ContainerState, LABEL_MANAGED};
use crate::error::{OrchestratorError, Result};
use crate::plan::Action;
use crate::topology::{RemoteEndpoint, RestartPolicy};

/// Error reason of a paused container.
const PAUSED: &str = "paused";

/// Request timeout for the Docker API, in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Container runtime backed by a Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
    name: String,
    // Dropped after `docker`, which closes the tunnel once the client is gone.
    _tunnel: Option<SshTunnel>,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl DockerRuntime {
    /// Connects to the local Docker daemon using platform defaults.
    pub async fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| OrchestratorError::transport("local", Action::Connect, e.to_string()))?;
        Self::with_client(docker, "docker", None).await
    }

    /// Connects to a remote Docker daemon.
    pub async fn connect_remote(endpoint: &RemoteEndpoint) -> Result<Self> {
        let label = endpoint.to_string();
        let connect_err =
            |e: BollardError| OrchestratorError::transport(&label, Action::Connect, e.to_string());

        let (docker, tunnel) = match endpoint {
            RemoteEndpoint::Ssh { user, host, port } => {
                let tunnel = SshTunnel::open(user.as_deref(), host, *port).await?;
                let docker = connect_unix(tunnel.socket_path()).map_err(connect_err)?;
                (docker, Some(tunnel))
            }
            RemoteEndpoint::Tcp { address } => {
                let docker = Docker::connect_with_http(
                    &format!("tcp://{}", address),
                    DEFAULT_TIMEOUT_SECS,
                    API_DEFAULT_VERSION,
                )
                .map_err(connect_err)?;
                (docker, None)
            }
            RemoteEndpoint::Unix { path } => (connect_unix(path).map_err(connect_err)?, None),
        };

        Self::with_client(docker, &format!("docker ({})", label), tunnel).await
    }

    /// Wraps an existing client, verifying the daemon answers.
    async fn with_client(docker: Docker, name: &str, tunnel: Option<SshTunnel>) -> Result<Self> {
        let version = docker
            .version()
            .await
            .map_err(|e| OrchestratorError::transport(name, Action::Connect, e.to_string()))?;

        info!(
            runtime = %name,
            version = version.version.as_deref().unwrap_or("unknown"),
            "Connected to Docker daemon"
        );

        Ok(Self {
            docker,
            name: name.to_string(),
            _tunnel: tunnel,
        })
    }

    /// Pulls the image unless it is already present.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if is_status(&e, 404) => {}
            Err(e) => return Err(classify(e, image, Action::Create)),
        }

        info!(image = %image, "Pulling image");

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = Box::pin(self.docker.create_image(Some(options), None, None));

        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(image = %image, status = %status, "Pull progress");
                    }
                }
                Err(e) => return Err(classify(e, image, Action::Create)),
            }
        }

        Ok(())
    }

    /// Creates a bridge network unless one with this name exists.
    async fn ensure_network(&self, network: &str, container: &str) -> Result<()> {
        match self
            .docker
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) if is_status(&e, 404) => {}
            Err(e) => return Err(classify(e, container, Action::Create)),
        }

        let options = CreateNetworkOptions {
            name: network,
            driver: "bridge",
            labels: HashMap::from([(LABEL_MANAGED, "true")]),
            ..Default::default()
        };

        match self.docker.create_network(options).await {
            Ok(_) => {
                info!(network = %network, "Created network");
                Ok(())
            }
            // Created concurrently by someone else.
            Err(e) if is_status(&e, 409) => Ok(()),
            Err(e) => Err(classify(e, container, Action::Create)),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn status(&self, name: &str) -> Result<ContainerState> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => Ok(map_state(
                response.state.as_ref().and_then(|s| s.status.as_ref()),
            )),
            Err(e) if is_status(&e, 404) => Ok(ContainerState::Absent),
            Err(e) => Err(classify(e, name, Action::Status)),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;
        if let Some(network) = &spec.network {
            self.ensure_network(network, &spec.name).await?;
        }

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        match self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
        {
            Ok(response) => {
                for warning in &response.warnings {
                    warn!(container = %spec.name, warning = %warning, "Docker warning");
                }
                info!(container = %spec.name, id = %response.id, "Created container");
                Ok(response.id)
            }
            Err(e) if is_status(&e, 409) => Err(OrchestratorError::already_exists(&spec.name)),
            Err(e) => Err(classify(e, &spec.name, Action::Create)),
        }
    }

    async fn start(&self, name: &str) -> Result<()> {
        // The daemon refuses to start a paused container.
        if is_paused(&self.status(name).await?) {
            return match self.docker.unpause_container(name).await {
                Ok(()) => {
                    info!(container = %name, "Unpaused container");
                    Ok(())
                }
                Err(e) => Err(classify(e, name, Action::Start)),
            };
        }

        match self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                info!(container = %name, "Started container");
                Ok(())
            }
            Err(e) if is_status(&e, 304) => {
                debug!(container = %name, "Container already running");
                Ok(())
            }
            Err(e) => Err(classify(e, name, Action::Start)),
        }
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: stop_seconds(timeout),
        };

        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => {
                info!(container = %name, "Stopped container");
                Ok(())
            }
            Err(e) if is_status(&e, 304) => {
                debug!(container = %name, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(classify(e, name, Action::Stop)),
        }
    }

    async fn remove(&self, name: &str, options: RemoveOptions) -> Result<()> {
        // The forced removal below would SIGKILL a running container.
        let stop = StopContainerOptions {
            t: stop_seconds(options.stop_timeout),
        };
        match self.docker.stop_container(name, Some(stop)).await {
            Ok(()) => debug!(container = %name, "Stopped container before removal"),
            Err(e) if is_status(&e, 304) || is_status(&e, 404) => {}
            Err(e) => return Err(classify(e, name, Action::Remove)),
        }

        let options = RemoveContainerOptions {
            force: true,
            v: options.volumes,
            ..Default::default()
        };

        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => {
                info!(container = %name, "Removed container");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => {
                debug!(container = %name, "Container already absent");
                Ok(())
            }
            Err(e) => Err(classify(e, name, Action::Remove)),
        }
    }

    async fn logs(&self, name: &str, options: LogOptions) -> Result<LogStream> {
        // An absent container is an error, not an empty stream.
        if !self.status(name).await?.exists() {
            return Err(OrchestratorError::not_found(name, Action::Logs));
        }

        let docker = self.docker.clone();
        let name = name.to_string();
        let options = LogsOptions::<String> {
            follow: options.follow,
            stdout: true,
            stderr: true,
            timestamps: options.timestamps,
            tail: options
                .tail
                .map_or_else(|| "all".to_string(), |n| n.to_string()),
            ..Default::default()
        };

        let stream = async_stream::try_stream! {
            let mut logs = Box::pin(docker.logs(&name, Some(options)));
            let mut buffer = LineBuffer::default();

            while let Some(chunk) = logs.next().await {
                let chunk = chunk.map_err(|e| classify(e, &name, Action::Logs))?;
                for line in buffer.push(&chunk.to_string()) {
                    yield line;
                }
            }

            if let Some(rest) = buffer.finish() {
                yield rest;
            }
        };

        Ok(stream.boxed())
    }

    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage> {
        let tag = request.tag.clone();
        let context = request.context.clone();

        info!(
            tag = %tag,
            context = %context.display(),
            platform = %request.platform,
            runtime = %self.name,
            "Building image"
        );

        let archive = tokio::task::spawn_blocking(move || build_context_archive(&context))
            .await
            .map_err(|e| OrchestratorError::build(&tag, format!("archive task failed: {e}")))?
            .map_err(|e| OrchestratorError::build(&tag, format!("failed to package context: {e}")))?;

        debug!(tag = %tag, bytes = archive.len(), "Packaged build context");

        let options = BuildImageOptions {
            dockerfile: request.dockerfile.to_string_lossy().replace('\\', "/"),
            t: tag.clone(),
            platform: request.platform.clone(),
            buildargs: request
                .build_args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            pull: request.pull,
            nocache: request.no_cache,
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = Box::pin(self.docker.build_image(
            options,
            None,
            Some(bytes::Bytes::from(archive)),
        ));
        let mut image_id = None;

        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| classify_build(e, &tag))?;

            if let Some(error) = info.error {
                return Err(OrchestratorError::build(&tag, error));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    info!(tag = %tag, "{}", line);
                }
            }
            if let Some(id) = info.aux.and_then(|aux| aux.id) {
                image_id = Some(id);
            }
        }

        info!(tag = %tag, id = image_id.as_deref().unwrap_or("unknown"), "Built image");
        Ok(BuiltImage { tag, id: image_id })
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn is_ready(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

#[cfg(unix)]
fn connect_unix(path: &Path) -> std::result::Result<Docker, BollardError> {
    Docker::connect_with_unix(
        &path.to_string_lossy(),
        DEFAULT_TIMEOUT_SECS,
        API_DEFAULT_VERSION,
    )
}

#[cfg(not(unix))]
fn connect_unix(path: &Path) -> std::result::Result<Docker, BollardError> {
    Err(BollardError::SocketNotFoundError(path.display().to_string()))
}

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

/// Splits bollard errors into "the daemon said no" and "we never reached it".
fn classify(err: BollardError, target: &str, action: Action) -> OrchestratorError {
    match &err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => OrchestratorError::not_found(target, action),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => OrchestratorError::runtime(target, action, format!("{} (HTTP {})", message, status_code)),
        BollardError::DockerStreamError { .. }
        | BollardError::JsonDataError { .. }
        | BollardError::JsonSerdeError { .. } => {
            OrchestratorError::runtime(target, action, err.to_string())
        }
        _ => OrchestratorError::transport(target, action, err.to_string()),
    }
}

fn classify_build(err: BollardError, tag: &str) -> OrchestratorError {
    match classify(err, tag, Action::Build) {
        OrchestratorError::Runtime { reason, .. } => OrchestratorError::build(tag, reason),
        OrchestratorError::NotFound { .. } => {
            OrchestratorError::build(tag, "build context or dockerfile not found")
        }
        other => other,
    }
}

fn is_paused(state: &ContainerState) -> bool {
    matches!(state, ContainerState::Error(reason) if reason == PAUSED)
}

fn map_state(status: Option<&ContainerStateStatusEnum>) -> ContainerState {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => ContainerState::Created,
        Some(ContainerStateStatusEnum::RUNNING) | Some(ContainerStateStatusEnum::RESTARTING) => {
            ContainerState::Running
        }
        Some(ContainerStateStatusEnum::EXITED) => ContainerState::Stopped,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerState::Error(PAUSED.to_string()),
        Some(ContainerStateStatusEnum::REMOVING) => ContainerState::Error("removing".to_string()),
        Some(ContainerStateStatusEnum::DEAD) => ContainerState::Error("dead".to_string()),
        _ => ContainerState::Error("unknown".to_string()),
    }
}

fn restart_policy_name(policy: RestartPolicy) -> RestartPolicyNameEnum {
    match policy {
        RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
        RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
        RestartPolicy::No => RestartPolicyNameEnum::NO,
    }
}

/// Translates a container spec into the Docker create request.
fn container_config(spec: &ContainerSpec) -> Config<String> {
    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .ports
        .iter()
        .map(|p| (p.container_key(), HashMap::new()))
        .collect();

    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for port in &spec.ports {
        port_bindings
            .entry(port.container_key())
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(PortBinding {
                host_ip: None,
                host_port: Some(port.host_port.to_string()),
            });
    }

    let binds: Vec<String> = spec.volumes.iter().map(|v| v.as_bind()).collect();

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        binds: (!binds.is_empty()).then_some(binds),
        network_mode: spec.network.clone(),
        restart_policy: Some(DockerRestartPolicy {
            name: Some(restart_policy_name(spec.restart_policy)),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env_pairs()),
        labels: Some(spec.labels.clone().into_iter().collect()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Packages a directory as a gzip-compressed tar archive in memory.
fn build_context_archive(context: &Path) -> std::io::Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut archive = tar::Builder::new(encoder);
    archive.follow_symlinks(false);
    archive.append_dir_all(".", context)?;

    let mut encoder = archive.into_inner()?;
    encoder.flush()?;
    encoder.finish()
}

fn stop_seconds(timeout: Duration) -> i64 {
    i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX)
}

/// Reassembles log chunks into whole lines.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(at) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=at).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    fn finish(self) -> Option<String> {
        (!self.pending.is_empty()).then_some(self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Read;

    use crate::topology::{PortMapping, VolumeMount};

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "web-db".to_string(),
            image: "postgres:16".to_string(),
            ports: vec![
                PortMapping::new(5432, 5432).unwrap(),
                PortMapping::new(15432, 5432).unwrap(),
            ],
            environment: BTreeMap::from([("POSTGRES_DB".to_string(), "app".to_string())]),
            volumes: vec!["pgdata:/var/lib/postgresql/data".parse::<VolumeMount>().unwrap()],
            network: Some("web-net".to_string()),
            restart_policy: RestartPolicy::UnlessStopped,
            labels: BTreeMap::from([(LABEL_MANAGED.to_string(), "true".to_string())]),
        }
    }

    #[test]
    fn test_container_config() {
        let config = container_config(&spec());

        assert_eq!(config.image.as_deref(), Some("postgres:16"));
        assert_eq!(config.env, Some(vec!["POSTGRES_DB=app".to_string()]));
        assert!(config.exposed_ports.unwrap().contains_key("5432/tcp"));

        let host = config.host_config.unwrap();
        let bindings = host.port_bindings.unwrap()["5432/tcp"].clone().unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[1].host_port.as_deref(), Some("15432"));
        assert_eq!(host.network_mode.as_deref(), Some("web-net"));
        assert_eq!(
            host.binds,
            Some(vec!["pgdata:/var/lib/postgresql/data".to_string()])
        );
        assert_eq!(
            host.restart_policy.unwrap().name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
    }

    #[test]
    fn test_map_state() {
        assert_eq!(
            map_state(Some(&ContainerStateStatusEnum::RUNNING)),
            ContainerState::Running
        );
        assert_eq!(
            map_state(Some(&ContainerStateStatusEnum::EXITED)),
            ContainerState::Stopped
        );
        assert_eq!(
            map_state(Some(&ContainerStateStatusEnum::PAUSED)),
            ContainerState::Error("paused".to_string())
        );
        assert!(matches!(map_state(None), ContainerState::Error(_)));
    }

    #[test]
    fn test_paused_container_is_unpaused_on_start() {
        assert!(is_paused(&map_state(Some(&ContainerStateStatusEnum::PAUSED))));
        assert!(!is_paused(&map_state(Some(&ContainerStateStatusEnum::DEAD))));
        assert!(!is_paused(&map_state(Some(&ContainerStateStatusEnum::EXITED))));
    }

    #[test]
    fn test_classify_errors() {
        let not_found = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: web".to_string(),
        };
        assert!(classify(not_found, "web", Action::Start).is_not_found());

        let conflict = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "driver failed".to_string(),
        };
        let err = classify(conflict, "web", Action::Start);
        assert!(matches!(err, OrchestratorError::Runtime { action: Action::Start, .. }));

        let err = classify(BollardError::RequestTimeoutError, "web", Action::Stop);
        assert!(err.is_transport());
    }

    #[test]
    fn test_classify_build_errors() {
        let rejected = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "dockerfile parse error".to_string(),
        };
        assert!(matches!(
            classify_build(rejected, "web:1"),
            OrchestratorError::Build { .. }
        ));
        assert!(classify_build(BollardError::RequestTimeoutError, "web:1").is_transport());
    }

    #[test]
    fn test_build_context_archive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();

        let archive = build_context_archive(dir.path()).unwrap();

        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(archive.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        let mut tar = tar::Archive::new(decoded.as_slice());
        let paths: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();

        assert!(paths.iter().any(|p| p.ends_with("Dockerfile")));
        assert!(paths.iter().any(|p| p.ends_with("src/main.rs")));
    }

    #[test]
    fn test_line_buffer() {
        let mut buffer = LineBuffer::default();
        assert_eq!(buffer.push("first\nsec"), vec!["first"]);
        assert_eq!(buffer.push("ond\r\nthi"), vec!["second"]);
        assert!(buffer.push("rd").is_empty());
        assert_eq!(buffer.finish(), Some("third".to_string()));
        assert_eq!(LineBuffer::default().finish(), None);
    }
}
