//! Plans and their results.
//!
//! An [`OperationPlan`] is the ordered list of targets a command will touch,
//! each with an [`Intent`]. It is built before the first runtime call and
//! thrown away once executed. Intents only become concrete [`Action`]s after
//! the target's state has been observed, so the executed steps are recorded
//! separately in a [`PlanResult`].

use std::fmt;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::OrchestratorError;

/// A single runtime operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Reach the runtime.
    Connect,
    /// Query the container state.
    Status,
    /// Build an image.
    Build,
    /// Create a container.
    Create,
    /// Start a container.
    Start,
    /// Stop a container.
    Stop,
    /// Remove a container.
    Remove,
    /// Read container logs.
    Logs,
}

impl Action {
    /// Returns the lowercase name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Status => "status",
            Self::Build => "build",
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Remove => "remove",
            Self::Logs => "logs",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The action ran and succeeded.
    Success,
    /// The target was already in the desired state.
    Skipped,
    /// The action failed and halted the plan.
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        })
    }
}

/// The command a plan was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    /// Build and roll out the primary service and its accessories.
    Deploy,
    /// Bring accessories up.
    AccessoryUp,
    /// Tear accessories down.
    AccessoryDown,
    /// Stop and start one accessory.
    AccessoryRestart,
    /// Recreate one accessory.
    AccessoryReboot,
    /// Start the primary service.
    AppStart,
    /// Stop the primary service.
    AppStop,
    /// Stop and start the primary service.
    AppRestart,
    /// Remove the primary service container.
    AppRemove,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deploy => "deploy",
            Self::AccessoryUp => "accessory up",
            Self::AccessoryDown => "accessory down",
            Self::AccessoryRestart => "accessory restart",
            Self::AccessoryReboot => "accessory reboot",
            Self::AppStart => "app start",
            Self::AppStop => "app stop",
            Self::AppRestart => "app restart",
            Self::AppRemove => "app remove",
        })
    }
}

/// The desired transition for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Intent {
    /// Build the deployable image.
    Build,
    /// Make the container run, creating it if needed.
    EnsureRunning,
    /// Remove, create and start the container.
    Recreate,
    /// Stop and remove a previous container, then create and start a new one.
    Replace,
    /// Stop and remove the container.
    Teardown,
    /// Stop and start the existing container.
    Restart,
    /// Start the existing container.
    Start,
    /// Stop the container.
    Stop,
}

impl Intent {
    /// Returns the actions this intent performs when nothing is skipped.
    pub fn actions(&self) -> &'static [Action] {
        match self {
            Self::Build => &[Action::Build],
            Self::EnsureRunning => &[Action::Create, Action::Start],
            Self::Recreate => &[Action::Remove, Action::Create, Action::Start],
            Self::Replace => &[Action::Stop, Action::Remove, Action::Create, Action::Start],
            Self::Teardown => &[Action::Stop, Action::Remove],
            Self::Restart => &[Action::Stop, Action::Start],
            Self::Start => &[Action::Start],
            Self::Stop => &[Action::Stop],
        }
    }
}

/// One entry of an operation plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOperation {
    /// Accessory identifier or primary service name.
    pub target: String,
    /// The desired transition.
    pub intent: Intent,
}

impl PlannedOperation {
    /// Creates a planned operation.
    pub fn new(target: impl Into<String>, intent: Intent) -> Self {
        Self {
            target: target.into(),
            intent,
        }
    }
}

/// Ordered operations for one command.
#[derive(Debug, Clone)]
pub struct OperationPlan {
    command: Command,
    operations: Vec<PlannedOperation>,
}

impl OperationPlan {
    /// Creates an empty plan for a command.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            operations: Vec::new(),
        }
    }

    /// Appends an operation.
    pub fn push(&mut self, target: impl Into<String>, intent: Intent) {
        self.operations.push(PlannedOperation::new(target, intent));
    }

    /// Returns the command.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Returns the planned operations in execution order.
    pub fn operations(&self) -> &[PlannedOperation] {
        &self.operations
    }

    /// Returns true if the plan has nothing to do.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Consumes the plan, yielding its operations.
    pub fn into_operations(self) -> Vec<PlannedOperation> {
        self.operations
    }
}

/// One executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Accessory identifier or primary service name.
    pub target: String,
    /// The action performed.
    pub action: Action,
    /// What happened.
    pub outcome: Outcome,
    /// Human-readable detail.
    pub detail: String,
}

/// The result of executing a plan.
///
/// Serializes with `success` and the halting `error` message alongside the
/// steps, so machine readers need not scan for the failed step.
#[derive(Debug, Clone)]
pub struct PlanResult {
    /// The command that produced this result.
    pub command: Command,

    /// Executed steps in order, including the failed one.
    pub steps: Vec<PlanStep>,

    /// Operations never attempted because the plan halted.
    pub not_attempted: Vec<PlannedOperation>,

    error: Option<OrchestratorError>,
}

impl Serialize for PlanResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("PlanResult", 5)?;
        state.serialize_field("command", &self.command)?;
        state.serialize_field("success", &self.is_success())?;
        state.serialize_field("error", &self.error.as_ref().map(ToString::to_string))?;
        state.serialize_field("steps", &self.steps)?;
        state.serialize_field("not_attempted", &self.not_attempted)?;
        state.end()
    }
}

impl PlanResult {
    /// Creates an empty result.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            steps: Vec::new(),
            not_attempted: Vec::new(),
            error: None,
        }
    }

    /// Records a successful step.
    pub fn success(&mut self, target: impl Into<String>, action: Action, detail: impl Into<String>) {
        self.push(target, action, Outcome::Success, detail);
    }

    /// Records a skipped step.
    pub fn skipped(&mut self, target: impl Into<String>, action: Action, detail: impl Into<String>) {
        self.push(target, action, Outcome::Skipped, detail);
    }

    fn push(
        &mut self,
        target: impl Into<String>,
        action: Action,
        outcome: Outcome,
        detail: impl Into<String>,
    ) {
        self.steps.push(PlanStep {
            target: target.into(),
            action,
            outcome,
            detail: detail.into(),
        });
    }

    /// Records the failing step and the operations left behind.
    pub fn halt(
        &mut self,
        target: impl Into<String>,
        fallback: Action,
        error: OrchestratorError,
        remaining: Vec<PlannedOperation>,
    ) {
        let action = error.action().unwrap_or(fallback);
        self.push(target, action, Outcome::Failed, error.to_string());
        self.not_attempted = remaining;
        self.error = Some(error);
    }

    /// Returns true if no step failed.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Returns the failed step, if any.
    pub fn failed_step(&self) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.outcome == Outcome::Failed)
    }

    /// Returns the steps that completed, whether they ran or were skipped.
    pub fn completed(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.outcome != Outcome::Failed)
    }

    /// Returns the error that halted the plan.
    pub fn error(&self) -> Option<&OrchestratorError> {
        self.error.as_ref()
    }

    /// Returns true if every step was skipped.
    pub fn all_skipped(&self) -> bool {
        self.steps.iter().all(|s| s.outcome == Outcome::Skipped)
    }

    /// Returns the `(target, action)` pairs of steps that actually ran.
    pub fn executed_actions(&self) -> Vec<(&str, Action)> {
        self.steps
            .iter()
            .filter(|s| s.outcome == Outcome::Success)
            .map(|s| (s.target.as_str(), s.action))
            .collect()
    }

    /// Converts a halted result into its error.
    pub fn into_result(self) -> crate::Result<Self> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_actions() {
        assert_eq!(
            Intent::Recreate.actions(),
            &[Action::Remove, Action::Create, Action::Start]
        );
        assert_eq!(Intent::Teardown.actions(), &[Action::Stop, Action::Remove]);
    }

    #[test]
    fn test_plan_result_halt() {
        let mut result = PlanResult::new(Command::AccessoryUp);
        result.success("db", Action::Create, "created");
        result.success("db", Action::Start, "started");
        result.halt(
            "cache",
            Action::Create,
            OrchestratorError::runtime("cache", Action::Start, "port in use"),
            vec![PlannedOperation::new("api", Intent::EnsureRunning)],
        );

        assert!(!result.is_success());
        assert_eq!(result.completed().count(), 2);

        let failed = result.failed_step().unwrap();
        assert_eq!(failed.target, "cache");
        assert_eq!(failed.action, Action::Start);
        assert_eq!(result.not_attempted.len(), 1);
        assert!(result.into_result().is_err());
    }

    #[test]
    fn test_plan_result_json() {
        let mut result = PlanResult::new(Command::AppStop);
        result.skipped("web", Action::Stop, "already stopped");

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["command"], "app-stop");
        assert_eq!(json["steps"][0]["outcome"], "skipped");
        assert_eq!(json["success"], true);
        assert!(json["error"].is_null());
    }

    #[test]
    fn test_halted_plan_json_carries_error() {
        let mut result = PlanResult::new(Command::AccessoryUp);
        result.success("db", Action::Start, "started");
        result.halt(
            "cache",
            Action::Create,
            OrchestratorError::runtime("cache", Action::Start, "port in use"),
            vec![PlannedOperation::new("api", Intent::EnsureRunning)],
        );
        let message = result.error().unwrap().to_string();

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], message.as_str());
        assert!(message.contains("port in use"));
        assert_eq!(json["steps"][1]["outcome"], "failed");
        assert_eq!(json["not_attempted"][0]["target"], "api");
    }

    #[test]
    fn test_operation_plan_order() {
        let mut plan = OperationPlan::new(Command::AccessoryDown);
        plan.push("api", Intent::Teardown);
        plan.push("db", Intent::Teardown);

        let targets: Vec<_> = plan.operations().iter().map(|o| o.target.as_str()).collect();
        assert_eq!(targets, vec!["api", "db"]);
    }
}
