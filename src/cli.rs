//! Terminal rendering and exit codes for the `keel` binary.

use keel_core::{Error, Observation, StepId};
use keel_engine::{dangling_attempts, LedgerEntry, Plan, RunLedger, RunReport};
use std::path::{Path, PathBuf};

/// Run finished successfully.
pub const EXIT_OK: u8 = 0;
/// Run halted: action failure, drift, cancellation, missing confirmation.
pub const EXIT_HALTED: u8 = 1;
/// Configuration or plan rejected before anything ran.
pub const EXIT_INVALID: u8 = 2;

pub fn report_exit_code(report: &RunReport) -> u8 {
    if report.is_success() {
        EXIT_OK
    } else {
        EXIT_HALTED
    }
}

pub fn error_exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>() {
        Some(e) if e.is_plan_error() => EXIT_INVALID,
        _ => EXIT_HALTED,
    }
}

/// Numbered plan order with dependencies, plus observed state when given.
pub fn render_plan(plan: &Plan, observed: Option<&[(StepId, Observation)]>) -> String {
    let width = plan
        .steps()
        .iter()
        .map(|s| s.id.as_str().len())
        .max()
        .unwrap_or(0);
    let mut out = String::new();
    for (i, step) in plan.steps().iter().enumerate() {
        let deps = if step.depends_on.is_empty() {
            "-".to_string()
        } else {
            step.depends_on
                .iter()
                .map(StepId::as_str)
                .collect::<Vec<_>>()
                .join(",")
        };
        out.push_str(&format!(
            "{:>3}. {:<width$}  key={}  after={}",
            i + 1,
            step.id.as_str(),
            step.key.short(),
            deps
        ));
        if let Some(obs) = observed.and_then(|o| o.iter().find(|(id, _)| id == &step.id)) {
            out.push_str(&format!("  state={}", obs.1.state));
            if let Some(existing) = &obs.1.existing_id {
                out.push_str(&format!(" ({})", existing));
            }
        }
        out.push('\n');
    }
    out
}

/// Every entry, then any attempts that never closed.
pub fn render_ledger(entries: &[LedgerEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.to_line());
        out.push('\n');
    }
    let dangling = dangling_attempts(entries);
    if !dangling.is_empty() {
        out.push_str(&format!(
            "\n{} action(s) never completed; the external state may be partial:\n",
            dangling.len()
        ));
        for entry in dangling {
            out.push_str(&format!(
                "  {} {} attempt {}\n",
                entry.step, entry.action, entry.attempt
            ));
        }
    }
    out
}

/// Dangling attempts in the most recent ledger under `dir`, if any.
pub fn interrupted_run(dir: &Path) -> Option<(PathBuf, Vec<LedgerEntry>)> {
    let latest = RunLedger::latest_in(dir)?;
    let entries = match RunLedger::load(&latest) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %latest.display(), error = %e, "unreadable previous ledger");
            return None;
        }
    };
    let dangling: Vec<LedgerEntry> = dangling_attempts(&entries).into_iter().cloned().collect();
    (!dangling.is_empty()).then_some((latest, dangling))
}

/// Write `<dir>/<run_id>.yaml`.
pub fn write_report(dir: &Path, report: &RunReport) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.yaml", report.run_id));
    std::fs::write(&path, report.to_yaml())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ActionKind, StepSpec, StepState};
    use keel_engine::Outcome;
    use std::collections::BTreeMap;

    fn plan() -> Plan {
        let mut specs = BTreeMap::new();
        specs.insert("network".to_string(), StepSpec::new("true"));
        specs.insert("cluster".to_string(), StepSpec::new("true").depends_on(["network"]));
        Plan::build(&specs).unwrap()
    }

    #[test]
    fn plan_lists_order_and_state() {
        let plan = plan();
        let observed = vec![
            (StepId::from("network"), Observation::absent()),
            (
                StepId::from("cluster"),
                Observation {
                    state: StepState::Partial,
                    existing_id: Some("eks-1".into()),
                    recorded_key: None,
                },
            ),
        ];
        let text = render_plan(&plan, Some(observed.as_slice()));
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].contains("1. network"));
        assert!(lines[0].contains("state=absent"));
        assert!(lines[1].contains("after=network"));
        assert!(lines[1].contains("state=partial (eks-1)"));
    }

    #[tokio::test]
    async fn ledger_rendering_flags_unfinished_attempts() {
        let mut ledger = RunLedger::in_memory("r");
        let step = StepId::from("cluster");
        ledger.record(&step, ActionKind::Apply, 1, Outcome::Attempting, "").await.unwrap();
        let text = render_ledger(ledger.entries());
        assert!(text.contains("attempting"));
        assert!(text.contains("1 action(s) never completed"));
    }

    #[test]
    fn plan_errors_exit_with_two() {
        let err = anyhow::Error::new(Error::CycleDetected { ids: vec!["a".into()] });
        assert_eq!(error_exit_code(&err), EXIT_INVALID);
        let err = anyhow::Error::new(Error::CredentialsExpired);
        assert_eq!(error_exit_code(&err), EXIT_HALTED);
    }
}
