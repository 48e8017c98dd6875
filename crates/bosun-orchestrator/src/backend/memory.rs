//! In-memory container runtime.
//!
//! Keeps containers in a map and records every call, so orchestrator
//! behaviour can be checked without a daemon. Failures can be injected per
//! action and container.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;

use crate::backend::r#trait::{
    BuildRequest, BuiltImage, ContainerRuntime, LogOptions, LogStream, RemoveOptions,
};
use crate::container::{ContainerSpec, ContainerState};
use crate::error::{OrchestratorError, Result};
use crate::plan::Action;

/// One recorded runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCall {
    /// The operation.
    pub action: Action,
    /// Container name, or image tag for builds.
    pub name: String,
}

#[derive(Debug, Clone)]
struct MemoryContainer {
    id: String,
    spec: Option<ContainerSpec>,
    state: ContainerState,
    logs: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    containers: HashMap<String, MemoryContainer>,
    calls: Vec<RuntimeCall>,
    failures: HashMap<(Action, String), OrchestratorError>,
    build_failure: Option<String>,
    disconnected: bool,
    images: Vec<String>,
    removals: Vec<(String, RemoveOptions)>,
    next_id: u64,
}

/// A container runtime that lives in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRuntime {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryRuntime {
    /// Creates an empty runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a container in the given state without recording a call.
    pub async fn insert(&self, name: &str, state: ContainerState) {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = format!("mem-{}", inner.next_id);
        if state.exists() {
            inner.containers.insert(
                name.to_string(),
                MemoryContainer {
                    id,
                    spec: None,
                    state,
                    logs: Vec::new(),
                },
            );
        } else {
            inner.containers.remove(name);
        }
    }

    /// Appends a log line to a container.
    pub async fn push_log(&self, name: &str, line: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        if let Some(container) = inner.containers.get_mut(name) {
            container.logs.push(line.into());
        }
    }

    /// Makes the next `action` on `name` fail with `error`.
    pub async fn fail_on(&self, action: Action, name: &str, error: OrchestratorError) {
        let mut inner = self.inner.lock().await;
        inner.failures.insert((action, name.to_string()), error);
    }

    /// Makes every build fail with `reason`.
    pub async fn fail_builds(&self, reason: impl Into<String>) {
        self.inner.lock().await.build_failure = Some(reason.into());
    }

    /// Simulates a lost connection: every call fails with a transport error.
    pub async fn disconnect(&self) {
        self.inner.lock().await.disconnected = true;
    }

    /// Returns every recorded call.
    pub async fn calls(&self) -> Vec<RuntimeCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Returns the recorded calls that change state, i.e. everything but
    /// status queries.
    pub async fn mutations(&self) -> Vec<(Action, String)> {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.action != Action::Status)
            .map(|c| (c.action, c.name.clone()))
            .collect()
    }

    /// Forgets recorded calls.
    pub async fn clear_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    /// Returns the current state of a container.
    pub async fn state(&self, name: &str) -> ContainerState {
        self.inner
            .lock()
            .await
            .containers
            .get(name)
            .map_or(ContainerState::Absent, |c| c.state.clone())
    }

    /// Returns the spec a container was created from.
    pub async fn spec(&self, name: &str) -> Option<ContainerSpec> {
        self.inner
            .lock()
            .await
            .containers
            .get(name)
            .and_then(|c| c.spec.clone())
    }

    /// Returns the options of every remove call, in order.
    pub async fn removals(&self) -> Vec<(String, RemoveOptions)> {
        self.inner.lock().await.removals.clone()
    }

    /// Returns the tags of images built so far.
    pub async fn built_images(&self) -> Vec<String> {
        self.inner.lock().await.images.clone()
    }
}

impl Inner {
    /// Records the call and returns an injected or transport failure.
    fn enter(&mut self, action: Action, name: &str) -> Result<()> {
        self.calls.push(RuntimeCall {
            action,
            name: name.to_string(),
        });
        if self.disconnected {
            return Err(OrchestratorError::transport(
                name,
                action,
                "in-memory runtime disconnected",
            ));
        }
        match self.failures.remove(&(action, name.to_string())) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn status(&self, name: &str) -> Result<ContainerState> {
        let mut inner = self.inner.lock().await;
        inner.enter(Action::Status, name)?;
        Ok(inner
            .containers
            .get(name)
            .map_or(ContainerState::Absent, |c| c.state.clone()))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut inner = self.inner.lock().await;
        inner.enter(Action::Create, &spec.name)?;
        if inner.containers.contains_key(&spec.name) {
            return Err(OrchestratorError::already_exists(&spec.name));
        }

        inner.next_id += 1;
        let id = format!("mem-{}", inner.next_id);
        inner.containers.insert(
            spec.name.clone(),
            MemoryContainer {
                id: id.clone(),
                spec: Some(spec.clone()),
                state: ContainerState::Created,
                logs: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Action::Start, name)?;
        let container = inner
            .containers
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::not_found(name, Action::Start))?;
        container.state = ContainerState::Running;
        Ok(())
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Action::Stop, name)?;
        let container = inner
            .containers
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::not_found(name, Action::Stop))?;
        if container.state.is_running() {
            container.state = ContainerState::Stopped;
        }
        Ok(())
    }

    async fn remove(&self, name: &str, options: RemoveOptions) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Action::Remove, name)?;
        inner.removals.push((name.to_string(), options));
        inner.containers.remove(name);
        Ok(())
    }

    async fn logs(&self, name: &str, options: LogOptions) -> Result<LogStream> {
        let mut inner = self.inner.lock().await;
        inner.enter(Action::Logs, name)?;
        let container = inner
            .containers
            .get(name)
            .ok_or_else(|| OrchestratorError::not_found(name, Action::Logs))?;

        let skip = options
            .tail
            .map_or(0, |tail| container.logs.len().saturating_sub(tail));
        let lines: Vec<Result<String>> = container
            .logs
            .iter()
            .skip(skip)
            .map(|line| {
                if options.timestamps {
                    Ok(format!("{} {}", container.id, line))
                } else {
                    Ok(line.clone())
                }
            })
            .collect();

        let lines = stream::iter(lines);
        if options.follow {
            Ok(lines.chain(stream::pending()).boxed())
        } else {
            Ok(lines.boxed())
        }
    }

    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage> {
        let mut inner = self.inner.lock().await;
        inner.enter(Action::Build, &request.tag)?;
        if let Some(reason) = &inner.build_failure {
            return Err(OrchestratorError::build(&request.tag, reason.clone()));
        }
        inner.images.push(request.tag.clone());
        Ok(BuiltImage {
            tag: request.tag.clone(),
            id: Some(format!("sha256:{:064x}", inner.images.len())),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }

    async fn is_ready(&self) -> bool {
        !self.inner.lock().await.disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "busybox".to_string(),
            ports: Vec::new(),
            environment: BTreeMap::new(),
            volumes: Vec::new(),
            network: None,
            restart_policy: Default::default(),
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let runtime = InMemoryRuntime::new();

        assert_eq!(runtime.status("db").await.unwrap(), ContainerState::Absent);
        runtime.create(&spec("db")).await.unwrap();
        assert_eq!(runtime.state("db").await, ContainerState::Created);

        runtime.start("db").await.unwrap();
        runtime.start("db").await.unwrap();
        assert_eq!(runtime.state("db").await, ContainerState::Running);

        runtime.stop("db", Duration::from_secs(1)).await.unwrap();
        runtime.stop("db", Duration::from_secs(1)).await.unwrap();
        assert_eq!(runtime.state("db").await, ContainerState::Stopped);

        runtime.remove("db", RemoveOptions::default()).await.unwrap();
        runtime.remove("db", RemoveOptions::default()).await.unwrap();
        assert_eq!(runtime.state("db").await, ContainerState::Absent);
    }

    #[tokio::test]
    async fn test_create_rejects_existing_name() {
        let runtime = InMemoryRuntime::new();
        runtime.insert("db", ContainerState::Stopped).await;

        let err = runtime.create(&spec("db")).await.unwrap_err();
        assert_eq!(err, OrchestratorError::already_exists("db"));
    }

    #[tokio::test]
    async fn test_start_absent_is_not_found() {
        let runtime = InMemoryRuntime::new();
        assert!(runtime.start("db").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let runtime = InMemoryRuntime::new();
        runtime
            .fail_on(
                Action::Create,
                "db",
                OrchestratorError::runtime("db", Action::Create, "no space left"),
            )
            .await;

        assert!(runtime.create(&spec("db")).await.is_err());
        assert!(runtime.create(&spec("db")).await.is_ok());

        runtime.disconnect().await;
        assert!(!runtime.is_ready().await);
        assert!(runtime.status("db").await.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_logs_tail_and_follow() {
        let runtime = InMemoryRuntime::new();
        runtime.create(&spec("db")).await.unwrap();
        for i in 0..5 {
            runtime.push_log("db", format!("line {i}")).await;
        }

        let options = LogOptions::default().tail(Some(2));
        let lines: Vec<String> = runtime
            .logs("db", options)
            .await
            .unwrap()
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["line 3", "line 4"]);

        let mut followed = runtime
            .logs("db", options.follow(true))
            .await
            .unwrap();
        assert_eq!(followed.next().await.unwrap().unwrap(), "line 3");
        assert_eq!(followed.next().await.unwrap().unwrap(), "line 4");
        let pending = tokio::time::timeout(Duration::from_millis(20), followed.next()).await;
        assert!(pending.is_err());
    }
}
