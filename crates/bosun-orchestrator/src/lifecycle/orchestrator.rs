//! The lifecycle orchestrator.
//!
//! Every command follows the same shape: check the configuration and build an
//! [`OperationPlan`] without touching the runtime, then walk the plan in
//! order. Each planned intent observes the target's current state and turns
//! into the concrete actions still needed, so running a command twice only
//! produces skipped steps the second time. The first failing step halts the
//! plan; nothing is rolled back.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::backend::{LogOptions, LogStream, RemoveOptions, SharedRuntime};
use crate::build::BuildCoordinator;
use crate::container::{ContainerSpec, ContainerState, ImageReference};
use crate::error::{OrchestratorError, Result};
use crate::graph::ExecutionOrder;
use crate::lifecycle::config::{DeployOptions, OrchestratorConfig};
use crate::plan::{Action, Command, Intent, OperationPlan, PlanResult, PlannedOperation};
use crate::topology::{Deployment, Role};

/// Observed state of one deployed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerReport {
    /// Accessory identifier or service name.
    pub name: String,

    /// Container name.
    pub container: String,

    /// Whether this is the primary service or an accessory.
    pub role: Role,

    /// Configured image reference.
    pub image: String,

    /// Observed state.
    pub state: ContainerState,
}

/// Drives container lifecycle operations for one deployment.
///
/// The orchestrator owns no state besides its configuration; the runtime is
/// queried afresh before every decision.
///
/// # Example
///
/// ```ignore
/// use bosun_orchestrator::{backend, DeployOptions, Orchestrator, OrchestratorConfig};
///
/// let runtime = backend::connect(deployment.builder()).await?;
/// let orchestrator = Orchestrator::new(deployment, runtime, OrchestratorConfig::default());
///
/// let result = orchestrator.deploy(DeployOptions::default()).await?;
/// for step in &result.steps {
///     println!("{} {} {}", step.target, step.action, step.outcome);
/// }
/// ```
pub struct Orchestrator {
    deployment: Deployment,
    runtime: SharedRuntime,
    builds: BuildCoordinator,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Creates an orchestrator for a deployment on the given runtime.
    pub fn new(deployment: Deployment, runtime: SharedRuntime, config: OrchestratorConfig) -> Self {
        let builds = BuildCoordinator::new(runtime.clone())
            .with_pull(config.pull)
            .with_no_cache(config.no_cache);
        Self {
            deployment,
            runtime,
            builds,
            config,
        }
    }

    /// Returns the deployment.
    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    /// Returns the configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Builds the primary image, brings accessories up and replaces the
    /// primary container.
    ///
    /// # Errors
    ///
    /// Configuration errors (unknown dependencies, cycles, a missing
    /// dockerfile) are returned before the runtime is touched. Failures after
    /// that halt the plan and are reported in the [`PlanResult`].
    pub async fn deploy(&self, options: DeployOptions) -> Result<PlanResult> {
        let service = self.deployment.service();
        let mut plan = OperationPlan::new(Command::Deploy);

        let accessories = if options.skip_accessories {
            Vec::new()
        } else {
            self.resolve()?.forward().to_vec()
        };

        if !options.skip_build {
            self.builds
                .resolve(self.deployment.builder(), None, &service.image)?;
            plan.push(&service.name, Intent::Build);
        }

        let intent = if options.force {
            Intent::Recreate
        } else {
            Intent::EnsureRunning
        };
        for id in accessories {
            plan.push(id, intent);
        }
        plan.push(&service.name, Intent::Replace);

        info!(
            service = %service.name,
            force = options.force,
            skip_build = options.skip_build,
            skip_accessories = options.skip_accessories,
            "Deploying"
        );
        Ok(self.execute(plan).await)
    }

    /// Brings accessories up in dependency order.
    ///
    /// With `names`, only those accessories and their transitive
    /// dependencies are touched.
    pub async fn accessory_up(&self, names: Option<&[String]>) -> Result<PlanResult> {
        let order = self.resolve()?;
        let targets = match names {
            Some(names) if !names.is_empty() => order.closure(names)?,
            _ => order.forward().to_vec(),
        };

        let mut plan = OperationPlan::new(Command::AccessoryUp);
        for id in targets {
            plan.push(id, Intent::EnsureRunning);
        }
        Ok(self.execute(plan).await)
    }

    /// Tears accessories down in reverse dependency order.
    ///
    /// With `names`, those accessories and everything that depends on them
    /// are removed; their own dependencies are left running.
    pub async fn accessory_down(&self, names: Option<&[String]>) -> Result<PlanResult> {
        let order = self.resolve()?;
        let targets: Vec<String> = match names {
            Some(names) if !names.is_empty() => {
                order.dependents_closure(names)?.into_iter().rev().collect()
            }
            _ => order.reverse(),
        };

        let mut plan = OperationPlan::new(Command::AccessoryDown);
        for id in targets {
            plan.push(id, Intent::Teardown);
        }
        Ok(self.execute(plan).await)
    }

    /// Stops and starts one accessory once all of its dependencies run.
    pub async fn accessory_restart(&self, name: &str) -> Result<PlanResult> {
        let name = name.to_string();
        self.accessory_restarts(Some(std::slice::from_ref(&name))).await
    }

    /// Restarts several accessories, all of them when `names` is `None` or
    /// empty, in dependency order.
    ///
    /// Each target's dependencies must be running when its turn comes; the
    /// first one that is not halts the plan.
    pub async fn accessory_restarts(&self, names: Option<&[String]>) -> Result<PlanResult> {
        self.each_accessory(Command::AccessoryRestart, names, Intent::Restart)
            .await
    }

    /// Removes, creates and starts one accessory once all of its
    /// dependencies run.
    pub async fn accessory_reboot(&self, name: &str) -> Result<PlanResult> {
        let name = name.to_string();
        self.accessory_reboots(Some(std::slice::from_ref(&name))).await
    }

    /// Reboots several accessories, all of them when `names` is `None` or
    /// empty, in dependency order.
    pub async fn accessory_reboots(&self, names: Option<&[String]>) -> Result<PlanResult> {
        self.each_accessory(Command::AccessoryReboot, names, Intent::Recreate)
            .await
    }

    async fn each_accessory(
        &self,
        command: Command,
        names: Option<&[String]>,
        intent: Intent,
    ) -> Result<PlanResult> {
        let order = self.resolve()?;
        let targets: Vec<&str> = match names {
            Some(names) if !names.is_empty() => {
                for name in names {
                    self.deployment.require_accessory(name)?;
                }
                order
                    .forward()
                    .iter()
                    .filter(|id| names.contains(id))
                    .map(String::as_str)
                    .collect()
            }
            _ => order.forward().iter().map(String::as_str).collect(),
        };

        let mut plan = OperationPlan::new(command);
        for id in targets {
            plan.push(id, intent);
        }
        Ok(self.run(plan, Some(&order)).await)
    }

    /// Starts the primary service container.
    ///
    /// A running container is reported as a skipped step, not an error.
    pub async fn app_start(&self) -> Result<PlanResult> {
        Ok(self.app_command(Command::AppStart, Intent::Start).await)
    }

    /// Stops the primary service container.
    pub async fn app_stop(&self) -> Result<PlanResult> {
        Ok(self.app_command(Command::AppStop, Intent::Stop).await)
    }

    /// Stops and starts the primary service container.
    pub async fn app_restart(&self) -> Result<PlanResult> {
        Ok(self.app_command(Command::AppRestart, Intent::Restart).await)
    }

    /// Stops and removes the primary service container.
    pub async fn app_remove(&self) -> Result<PlanResult> {
        Ok(self.app_command(Command::AppRemove, Intent::Teardown).await)
    }

    async fn app_command(&self, command: Command, intent: Intent) -> PlanResult {
        let mut plan = OperationPlan::new(command);
        plan.push(&self.deployment.service().name, intent);
        self.execute(plan).await
    }

    /// Streams the logs of the primary service or an accessory.
    ///
    /// `name` may be the service name, an accessory identifier or an
    /// accessory container name.
    pub async fn logs(&self, name: &str, options: LogOptions) -> Result<LogStream> {
        let service = self.deployment.service();
        let container = if name == service.name {
            service.name.as_str()
        } else {
            self.deployment
                .find_accessory(name)
                .map(|a| a.container_name())
                .ok_or_else(|| {
                    OrchestratorError::validation(format!(
                        "{} is neither the service nor a declared accessory",
                        name
                    ))
                })?
        };

        debug!(container = %container, follow = options.follow, "Fetching logs");
        self.runtime.logs(container, options).await
    }

    /// Reports the observed state of the primary and every accessory, the
    /// accessories in dependency order.
    pub async fn status(&self) -> Result<Vec<ContainerReport>> {
        let order = self.resolve()?;
        let service = self.deployment.service();

        let mut reports = vec![ContainerReport {
            name: service.name.clone(),
            container: service.name.clone(),
            role: Role::App,
            image: service.image.clone(),
            state: self.runtime.status(&service.name).await?,
        }];

        for id in order.forward() {
            let accessory = self.deployment.require_accessory(id)?;
            reports.push(ContainerReport {
                name: accessory.id.clone(),
                container: accessory.container_name().to_string(),
                role: Role::Accessory,
                image: accessory.service.image.clone(),
                state: self.runtime.status(accessory.container_name()).await?,
            });
        }

        Ok(reports)
    }

    fn resolve(&self) -> Result<ExecutionOrder> {
        self.deployment.validate()
    }

    async fn check_dependencies(&self, id: &str, order: &ExecutionOrder) -> Result<()> {
        for dependency in order.dependencies_of(id) {
            let accessory = self.deployment.require_accessory(dependency)?;
            let state = self.runtime.status(accessory.container_name()).await?;
            if !state.is_running() {
                return Err(OrchestratorError::dependency_not_ready(
                    id,
                    dependency,
                    state.to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn execute(&self, plan: OperationPlan) -> PlanResult {
        self.run(plan, None).await
    }

    /// Walks the plan. With `order`, every target's dependencies are checked
    /// before it is touched.
    async fn run(&self, plan: OperationPlan, order: Option<&ExecutionOrder>) -> PlanResult {
        let command = plan.command();
        let mut result = PlanResult::new(command);
        let mut image = self.deployment.service().image.clone();

        let mut operations = plan.into_operations().into_iter();
        while let Some(operation) = operations.next() {
            if let Some(order) = order {
                if let Err(err) = self.check_dependencies(&operation.target, order).await {
                    warn!(accessory = %operation.target, error = %err, "Dependencies not ready");
                    let target = operation.target.clone();
                    let remaining = std::iter::once(operation).chain(operations).collect();
                    result.halt(target, Action::Status, err, remaining);
                    return result;
                }
            }

            let outcome = match operation.intent {
                Intent::Build => self
                    .build(&operation, &mut result)
                    .await
                    .map(|tag| image = tag),
                _ => self.apply(&operation, &image, &mut result).await,
            };

            if let Err(err) = outcome {
                error!(
                    command = %command,
                    name = %operation.target,
                    error = %err,
                    "Plan halted"
                );
                let fallback = operation
                    .intent
                    .actions()
                    .first()
                    .copied()
                    .unwrap_or(Action::Status);
                result.halt(&operation.target, fallback, err, operations.collect());
                return result;
            }
        }

        info!(command = %command, steps = result.steps.len(), "Plan complete");
        result
    }

    async fn build(&self, operation: &PlannedOperation, result: &mut PlanResult) -> Result<String> {
        let service = self.deployment.service();
        let built = self
            .builds
            .build(self.deployment.builder(), None, &service.image)
            .await?;

        let detail = match &built.id {
            Some(id) => format!("built {} ({})", built.tag, id),
            None => format!("built {}", built.tag),
        };
        info!(tag = %built.tag, "Image built");
        result.success(&operation.target, Action::Build, detail);
        Ok(built.tag)
    }

    fn container_spec(&self, target: &str, image: &str) -> Result<ContainerSpec> {
        let service = self.deployment.service();
        let spec = if target == service.name {
            let image = ImageReference::new(image).with_default_tag();
            ContainerSpec::for_app(service, image.reference())
        } else {
            let accessory = self.deployment.require_accessory(target)?;
            ContainerSpec::for_accessory(accessory, &service.name)
        };
        Ok(spec.with_labels(&self.config.labels))
    }

    async fn apply(
        &self,
        operation: &PlannedOperation,
        image: &str,
        result: &mut PlanResult,
    ) -> Result<()> {
        let target = operation.target.as_str();
        let spec = self.container_spec(target, image)?;
        let name = spec.name.as_str();

        let state = self.runtime.status(name).await?;
        debug!(container = %name, state = %state, intent = ?operation.intent, "Observed state");

        match operation.intent {
            Intent::EnsureRunning => match state {
                ContainerState::Running => {
                    result.skipped(target, Action::Start, "already running");
                }
                ContainerState::Absent => {
                    self.create(target, &spec, result).await?;
                    self.start(target, name, result).await?;
                }
                _ => self.start(target, name, result).await?,
            },
            Intent::Recreate => {
                self.remove_if_present(target, name, &state, result).await?;
                self.create(target, &spec, result).await?;
                self.start(target, name, result).await?;
            }
            Intent::Replace => {
                self.stop_if_running(target, name, &state, result).await?;
                self.remove_if_present(target, name, &state, result).await?;
                self.create(target, &spec, result).await?;
                self.start(target, name, result).await?;
            }
            Intent::Teardown => {
                if !state.exists() {
                    result.skipped(target, Action::Remove, "not present");
                } else {
                    self.stop_if_running(target, name, &state, result).await?;
                    self.remove(target, name, result).await?;
                }
            }
            Intent::Restart => {
                if !state.exists() {
                    return Err(OrchestratorError::not_found(name, Action::Start));
                }
                self.stop_if_running(target, name, &state, result).await?;
                self.start(target, name, result).await?;
            }
            Intent::Start => match state {
                ContainerState::Running => {
                    // Soft failure: reported, never retried, plan goes on.
                    let soft = OrchestratorError::already_running(name);
                    warn!(container = %name, error = %soft, "Start skipped");
                    result.skipped(target, Action::Start, soft.to_string());
                }
                ContainerState::Absent => {
                    return Err(OrchestratorError::not_found(name, Action::Start));
                }
                _ => self.start(target, name, result).await?,
            },
            Intent::Stop => self.stop_if_running(target, name, &state, result).await?,
            Intent::Build => {}
        }

        Ok(())
    }

    async fn create(&self, target: &str, spec: &ContainerSpec, result: &mut PlanResult) -> Result<()> {
        let id = self.runtime.create(spec).await?;
        info!(container = %spec.name, image = %spec.image, id = %id, "Created container");
        result.success(
            target,
            Action::Create,
            format!("created {} from {}", spec.name, spec.image),
        );
        Ok(())
    }

    async fn start(&self, target: &str, name: &str, result: &mut PlanResult) -> Result<()> {
        self.runtime.start(name).await?;
        info!(container = %name, "Started container");
        result.success(target, Action::Start, format!("started {}", name));
        Ok(())
    }

    async fn stop_if_running(
        &self,
        target: &str,
        name: &str,
        state: &ContainerState,
        result: &mut PlanResult,
    ) -> Result<()> {
        if !state.is_running() {
            result.skipped(target, Action::Stop, format!("{} is {}", name, state));
            return Ok(());
        }
        self.runtime.stop(name, self.config.stop_timeout).await?;
        info!(container = %name, "Stopped container");
        result.success(target, Action::Stop, format!("stopped {}", name));
        Ok(())
    }

    async fn remove_if_present(
        &self,
        target: &str,
        name: &str,
        state: &ContainerState,
        result: &mut PlanResult,
    ) -> Result<()> {
        if !state.exists() {
            result.skipped(target, Action::Remove, "not present");
            return Ok(());
        }
        self.remove(target, name, result).await
    }

    async fn remove(&self, target: &str, name: &str, result: &mut PlanResult) -> Result<()> {
        let options = RemoveOptions {
            stop_timeout: self.config.stop_timeout,
            volumes: self.config.remove_volumes,
        };
        self.runtime.remove(name, options).await?;
        info!(container = %name, volumes = self.config.remove_volumes, "Removed container");
        result.success(target, Action::Remove, format!("removed {}", name));
        Ok(())
    }
}
