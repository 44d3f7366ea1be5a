//! Run report - final state of every step plus the halting step and reason.

use chrono::{DateTime, Utc};
use keel_core::{Error, StepId};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Apply,
    Teardown,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Pending,
    Success,
    Halted,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Halted => write!(f, "halted"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalState {
    Pending,
    Skipped,
    Applied,
    Destroyed,
    Absent,
    Failed,
    Drifted,
    RolledBack,
    /// Rollback was attempted and failed; the live state is unknown.
    Indeterminate,
}

impl std::fmt::Display for FinalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Skipped => "skipped",
            Self::Applied => "applied",
            Self::Destroyed => "destroyed",
            Self::Absent => "absent",
            Self::Failed => "failed",
            Self::Drifted => "drifted",
            Self::RolledBack => "rolled_back",
            Self::Indeterminate => "indeterminate",
        };
        write!(f, "{}", s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StepReport {
    pub id: StepId,
    pub label: String,
    pub final_state: FinalState,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HaltInfo {
    /// Step the halt is attributed to, when there is one.
    pub step: Option<String>,
    pub reason: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunReport {
    pub run_id: String,
    pub mode: RunMode,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub ledger: String,
    pub steps: Vec<StepReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt: Option<HaltInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_incomplete: Vec<String>,
    /// The halting error, kept for callers. Not serialized.
    #[serde(skip)]
    pub error: Option<std::sync::Arc<Error>>,
}

impl RunReport {
    pub fn new<'a>(
        run_id: &str,
        mode: RunMode,
        ledger: String,
        steps: impl IntoIterator<Item = (&'a StepId, &'a str)>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            mode,
            started: Utc::now(),
            ended: None,
            outcome: RunOutcome::Pending,
            ledger,
            steps: steps
                .into_iter()
                .map(|(id, label)| StepReport {
                    id: id.clone(),
                    label: label.to_string(),
                    final_state: FinalState::Pending,
                })
                .collect(),
            halt: None,
            rollback_incomplete: Vec::new(),
            error: None,
        }
    }

    pub fn set_state(&mut self, id: &StepId, state: FinalState) {
        if let Some(step) = self.steps.iter_mut().find(|s| &s.id == id) {
            step.final_state = state;
        }
    }

    pub fn state_of(&self, id: &str) -> Option<FinalState> {
        self.steps
            .iter()
            .find(|s| s.id.as_str() == id)
            .map(|s| s.final_state)
    }

    pub fn finish_success(&mut self) {
        self.outcome = RunOutcome::Success;
        self.ended = Some(Utc::now());
    }

    pub fn finish_halted(&mut self, error: Error) {
        if let Error::RollbackIncomplete { steps, .. } = &error {
            self.rollback_incomplete = steps.clone();
        }
        self.halt = Some(HaltInfo {
            step: error.step().map(String::from),
            reason: error.to_string(),
        });
        self.outcome = RunOutcome::Halted;
        self.ended = Some(Utc::now());
        self.error = Some(std::sync::Arc::new(error));
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }

    /// Terminal summary: one row per step, then the halting step and reason.
    pub fn render_summary(&self) -> String {
        let width = self
            .steps
            .iter()
            .map(|s| s.id.as_str().len())
            .max()
            .unwrap_or(4)
            .max(4);
        let mut out = format!("{} {} ({})\n", self.mode, self.run_id, self.outcome);
        out.push_str(&format!("  {:<width$}  {:<14}  {}\n", "STEP", "STATE", "LABEL"));
        for s in &self.steps {
            out.push_str(&format!(
                "  {:<width$}  {:<14}  {}\n",
                s.id.as_str(),
                s.final_state.to_string(),
                s.label
            ));
        }
        if let Some(halt) = &self.halt {
            match &halt.step {
                Some(step) => out.push_str(&format!("halted at '{}': {}\n", step, halt.reason)),
                None => out.push_str(&format!("halted: {}\n", halt.reason)),
            }
        }
        if !self.rollback_incomplete.is_empty() {
            out.push_str(&format!(
                "rollback incomplete, inspect manually: {}\n",
                self.rollback_incomplete.join(", ")
            ));
        }
        out.push_str(&format!("ledger: {}\n", self.ledger));
        out
    }
}
