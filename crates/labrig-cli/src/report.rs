use std::time::SystemTime;

use labrig_core::graph::DependencyGraph;
use labrig_core::lifecycle::{ModuleSnapshot, StartReport, StopReport};
use labrig_core::models::{CoreError, ModuleRole, TaskSnapshot};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub fn role_label(role: ModuleRole) -> &'static str {
    match role {
        ModuleRole::Hardware => "hardware",
        ModuleRole::Logic => "logic",
        ModuleRole::Gui => "gui",
    }
}

pub fn timestamp(at: SystemTime) -> String {
    OffsetDateTime::from(at)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "-".to_string())
}

pub fn describe_error(error: &CoreError) -> String {
    let mut line = format!("{:?}: {}", error.kind, error.message);
    if !error.related.is_empty() {
        line.push_str(&format!(" [{}]", error.related.join(", ")));
    }
    line
}

pub fn order_lines(graph: &DependencyGraph, order: &[String]) -> Vec<String> {
    order
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let role = graph.role(name).map(role_label).unwrap_or("?");
            let dependencies = graph.dependencies(name);
            if dependencies.is_empty() {
                format!("{:>3}. {name} ({role})", index + 1)
            } else {
                format!(
                    "{:>3}. {name} ({role}) <- {}",
                    index + 1,
                    dependencies.join(", ")
                )
            }
        })
        .collect()
}

pub fn start_lines(report: &StartReport) -> Vec<String> {
    let mut lines = Vec::new();
    lines.extend(report.activated.iter().map(|name| format!("activated  {name}")));
    lines.extend(
        report
            .already_active
            .iter()
            .map(|name| format!("active     {name}")),
    );
    lines.extend(report.errored.iter().map(|failure| {
        format!("error      {} {}", failure.module, describe_error(&failure.error))
    }));
    lines.extend(report.skipped.iter().map(|skipped| {
        format!(
            "skipped    {} (blocked by {})",
            skipped.module,
            skipped.blocked_by.join(", ")
        )
    }));
    lines.extend(report.cancelled.iter().map(|name| format!("cancelled  {name}")));
    lines
}

pub fn stop_lines(report: &StopReport) -> Vec<String> {
    let mut lines = Vec::new();
    lines.extend(report.stopped.iter().map(|name| format!("stopped    {name}")));
    lines.extend(report.errored.iter().map(|failure| {
        format!("error      {} {}", failure.module, describe_error(&failure.error))
    }));
    lines.extend(report.cancelled.iter().map(|name| format!("cancelled  {name}")));
    lines
}

pub fn module_line(snapshot: &ModuleSnapshot) -> String {
    let mut line = format!(
        "{:<16} {:<8} {:<22} {:?}",
        snapshot.name,
        role_label(snapshot.role),
        snapshot.implementation,
        snapshot.state
    );
    if snapshot.remote_access {
        line.push_str(" remote");
    }
    if !snapshot.task_users.is_empty() {
        line.push_str(&format!(" used by {}", snapshot.task_users.join(", ")));
    }
    if let Some(error) = &snapshot.last_error {
        line.push_str(&format!(" ({})", describe_error(error)));
    }
    line
}

pub fn task_line(snapshot: &TaskSnapshot) -> String {
    let started = snapshot
        .started_at
        .map(timestamp)
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{:<16} #{:<4} {:<9} started {started}",
        snapshot.name,
        snapshot.id.0,
        format!("{:?}", snapshot.status)
    );
    if !snapshot.modules.is_empty() {
        line.push_str(&format!(" using {}", snapshot.modules.join(", ")));
    }
    if let Some(error) = &snapshot.error {
        line.push_str(&format!(" ({})", describe_error(error)));
    }
    line
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use labrig_core::models::{CoreErrorKind, ModuleSpec};

    use super::*;

    #[test]
    fn timestamps_are_rfc3339_utc() {
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(timestamp(at), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn errors_list_related_names() {
        let error = CoreError::for_module(
            "A",
            CoreErrorKind::DependentsStillActive,
            "dependents still active",
        )
        .with_related(["B", "C"]);
        assert_eq!(
            describe_error(&error),
            "DependentsStillActive: dependents still active [B, C]"
        );
    }

    #[test]
    fn order_lines_show_roles_and_dependencies() {
        let specs = vec![
            ModuleSpec::new("meter", ModuleRole::Hardware, "dummy.levelmeter"),
            ModuleSpec::new("monitor", ModuleRole::Logic, "cryo.monitor")
                .connect("levelmeter", "meter", "CryoLevelMeter"),
        ];
        let graph = DependencyGraph::build(specs.iter()).unwrap();

        assert_eq!(
            order_lines(&graph, &graph.start_order()),
            vec!["  1. meter (hardware)", "  2. monitor (logic) <- meter"]
        );
    }
}
