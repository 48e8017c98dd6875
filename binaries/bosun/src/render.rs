//! Terminal output for plan results, status listings and summaries.

use anyhow::Result;
use bosun_orchestrator::plan::PlanResult;
use bosun_orchestrator::{ContainerReport, Deployment, ExecutionOrder};
use serde::Serialize;

/// Renders a value as pretty JSON.
pub fn json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Renders the steps of a plan, then the operations it never reached.
pub fn plan(result: &PlanResult) -> String {
    let rows: Vec<[String; 4]> = result
        .steps
        .iter()
        .map(|step| {
            [
                step.target.clone(),
                step.action.to_string(),
                step.outcome.to_string(),
                step.detail.clone(),
            ]
        })
        .collect();

    let mut out = if rows.is_empty() {
        format!("{}: nothing to do\n", result.command)
    } else {
        table(["TARGET", "ACTION", "OUTCOME", "DETAIL"], &rows)
    };

    if !result.not_attempted.is_empty() {
        out.push_str("\nNot attempted:\n");
        for operation in &result.not_attempted {
            out.push_str(&format!("  {} ({:?})\n", operation.target, operation.intent));
        }
    }

    out
}

/// Renders the observed state of every container.
pub fn status(reports: &[ContainerReport]) -> String {
    let rows: Vec<[String; 5]> = reports
        .iter()
        .map(|report| {
            [
                report.name.clone(),
                report.container.clone(),
                report.role.as_str().to_string(),
                report.image.clone(),
                report.state.to_string(),
            ]
        })
        .collect();

    table(["NAME", "CONTAINER", "ROLE", "IMAGE", "STATE"], &rows)
}

/// Renders the summary printed by `validate`.
pub fn summary(deployment: &Deployment, order: &ExecutionOrder) -> String {
    let service = deployment.service();
    let builder = deployment.builder();

    let mut out = String::new();
    out.push_str(&format!("Service:     {}\n", service.name));
    out.push_str(&format!("Image:       {}\n", service.image));
    out.push_str(&format!("Platform:    {}\n", builder.platform()));
    match builder.endpoint() {
        Some(endpoint) => out.push_str(&format!("Runtime:     {}\n", endpoint)),
        None => out.push_str("Runtime:     local\n"),
    }

    if order.is_empty() {
        out.push_str("Accessories: none\n");
    } else {
        out.push_str(&format!("Accessories: {}\n", order.forward().join(" -> ")));
    }
    out
}

/// Left-aligned columns sized to their widest cell. The last column is not
/// padded.
fn table<const N: usize>(headers: [&str; N], rows: &[[String; N]]) -> String {
    let mut widths: [usize; N] = headers.map(str::len);
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let mut write_row = |cells: Vec<&str>| {
        let line: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                if i + 1 == N {
                    cell.to_string()
                } else {
                    format!("{:<width$}", cell, width = widths[i])
                }
            })
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    };

    write_row(headers.to_vec());
    for row in rows {
        write_row(row.iter().map(String::as_str).collect());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_orchestrator::plan::{Action, Command, Intent, PlannedOperation};
    use bosun_orchestrator::topology::Role;
    use bosun_orchestrator::{ContainerState, OrchestratorError};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_plan_table() {
        let mut result = PlanResult::new(Command::AccessoryUp);
        result.success("db", Action::Create, "created db from postgres:16");
        result.skipped("cache", Action::Start, "already running");
        result.halt(
            "api",
            Action::Create,
            OrchestratorError::runtime("api", Action::Start, "port is already allocated"),
            vec![PlannedOperation::new("worker", Intent::EnsureRunning)],
        );

        let out = plan(&result);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "TARGET  ACTION  OUTCOME  DETAIL");
        assert_eq!(lines[1], "db      create  success  created db from postgres:16");
        assert_eq!(lines[2], "cache   start   skipped  already running");
        assert!(lines[3].starts_with("api     start   failed   runtime rejected start of api"));
        assert!(out.contains("Not attempted:\n  worker (EnsureRunning)"));
    }

    #[test]
    fn test_empty_plan() {
        let result = PlanResult::new(Command::AccessoryDown);
        assert_eq!(plan(&result), "accessory down: nothing to do\n");
    }

    #[test]
    fn test_status_table() {
        let reports = vec![ContainerReport {
            name: "db".to_string(),
            container: "shop-db".to_string(),
            role: Role::Accessory,
            image: "postgres:16".to_string(),
            state: ContainerState::Running,
        }];

        assert_eq!(
            status(&reports),
            "NAME  CONTAINER  ROLE       IMAGE        STATE\n\
             db    shop-db    accessory  postgres:16  running\n"
        );
    }

    #[test]
    fn test_plan_json() {
        let mut result = PlanResult::new(Command::AppStart);
        result.skipped("web", Action::Start, "already running");

        let value: serde_json::Value = serde_json::from_str(&json(&result).unwrap()).unwrap();
        assert_eq!(value["command"], "app-start");
        assert_eq!(value["steps"][0]["action"], "start");
    }
}
