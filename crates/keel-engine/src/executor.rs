//! Executor - drives a plan against the outside world.
//!
//! Apply walks the plan in order: reconcile, skip what is already applied,
//! halt on drift, otherwise run the apply action under the retry policy.
//! Every classification reaches the ledger before the executor branches on
//! it. A halt rolls back the steps this run created, newest first; steps
//! that were found partially present and completed are left in place.
//!
//! Teardown walks the plan in reverse and destroys whatever is present. It
//! never rolls back: destroyed resources are not recreated. A step with no
//! destroy action stays in place and the teardown does not succeed.
//!
//! Ledger entries written from a reconcile result (skipped, drift) carry
//! attempt 0; failed state queries carry the query attempt, and action
//! attempts count from 1.

use crate::action::{ActionFailure, ActionRequest, ActionRunner};
use crate::ledger::{Outcome, RunLedger};
use crate::planner::Plan;
use crate::reconciler::{ProbeAttempt, Reconciler};
use crate::report::{FinalState, RunMode, RunReport};
use crate::retry::RetryPolicy;
use crate::state::{StateRecord, StateStore};
use keel_core::{
    ActionKind, CredentialContext, Error, KeelConfig, Observation, Result, Step, StepId, StepState,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A step this run changed.
enum Change<'p> {
    /// Absent before the run; rollback destroys it.
    Created(&'p Step),
    /// Present before the run; rollback leaves it and restores `previous`.
    Adopted {
        step: &'p Step,
        previous: Option<StateRecord>,
    },
}

impl<'p> Change<'p> {
    fn step(&self) -> &'p Step {
        match self {
            Self::Created(step) | Self::Adopted { step, .. } => step,
        }
    }
}

pub struct Executor {
    runner: Arc<dyn ActionRunner>,
    reconciler: Reconciler,
    policy: RetryPolicy,
    ledger: RunLedger,
    store: Arc<StateStore>,
    cancel: CancellationToken,
    sentinel: String,
}

impl Executor {
    pub fn new(
        config: &KeelConfig,
        runner: Arc<dyn ActionRunner>,
        reconciler: Reconciler,
        ledger: RunLedger,
        store: Arc<StateStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            reconciler,
            policy: RetryPolicy::new(config.retry.clone()),
            ledger,
            store,
            cancel,
            sentinel: config.run.confirmation_sentinel.clone(),
        }
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    pub fn into_ledger(self) -> RunLedger {
        self.ledger
    }

    pub fn run_id(&self) -> &str {
        self.ledger.run_id()
    }

    // ============================================================
    // Apply
    // ============================================================

    pub async fn apply(&mut self, plan: &Plan, credentials: &Arc<CredentialContext>) -> RunReport {
        let mut report = self.new_report(plan, RunMode::Apply);
        let mut applied: Vec<Change> = Vec::new();
        info!(run_id = %self.run_id(), steps = plan.len(), "apply started");

        match self.apply_steps(plan, credentials, &mut report, &mut applied).await {
            Ok(()) => report.finish_success(),
            Err(cause) => {
                warn!(run_id = %self.run_id(), error = %cause, "apply halted");
                let err = self.rollback(&applied, credentials, &mut report, cause).await;
                report.finish_halted(err);
            }
        }
        info!(run_id = %self.run_id(), outcome = %report.outcome, "apply finished");
        report
    }

    async fn apply_steps<'p>(
        &mut self,
        plan: &'p Plan,
        credentials: &CredentialContext,
        report: &mut RunReport,
        applied: &mut Vec<Change<'p>>,
    ) -> Result<()> {
        let mut satisfied: HashSet<StepId> = HashSet::new();

        for step in plan.steps() {
            self.check_between_steps(step, ActionKind::Apply, credentials).await?;

            if let Some(dep) = step.depends_on.iter().find(|d| !satisfied.contains(*d)) {
                return Err(Error::DependencyUnsatisfied {
                    step: step.id.to_string(),
                    dependency: dep.to_string(),
                });
            }

            let obs = self.observe(step, ActionKind::Apply, credentials, report).await?;
            match obs.state {
                StepState::Applied => {
                    self.ledger
                        .record(&step.id, ActionKind::Apply, 0, Outcome::Skipped, "already applied")
                        .await?;
                    info!(run_id = %self.run_id(), step = %step.id, "already applied, skipping");
                    report.set_state(&step.id, FinalState::Skipped);
                }
                StepState::Conflicting => {
                    let recorded = obs.recorded_key.clone().unwrap_or_default();
                    self.ledger
                        .record(
                            &step.id,
                            ActionKind::Apply,
                            0,
                            Outcome::DriftDetected,
                            format!("recorded {} desired {}", short(&recorded), step.key.short()),
                        )
                        .await?;
                    report.set_state(&step.id, FinalState::Drifted);
                    return Err(Error::DriftDetected {
                        step: step.id.to_string(),
                        recorded,
                        desired: step.key.to_string(),
                    });
                }
                StepState::Absent | StepState::Partial => {
                    if obs.state == StepState::Partial {
                        info!(
                            run_id = %self.run_id(),
                            step = %step.id,
                            existing_id = obs.existing_id.as_deref().unwrap_or("-"),
                            "partially present, completing"
                        );
                    }
                    let apply = step.action.apply.as_str();
                    if let Err(e) = self
                        .run_with_retry(step, ActionKind::Apply, apply, &obs, credentials)
                        .await
                    {
                        if !matches!(e, Error::Cancelled(_)) {
                            report.set_state(&step.id, FinalState::Failed);
                        }
                        return Err(e);
                    }
                    let change = if obs.state == StepState::Partial {
                        Change::Adopted {
                            step,
                            previous: self.store.get(step.id.as_str()),
                        }
                    } else {
                        Change::Created(step)
                    };
                    applied.push(change);
                    self.store
                        .record(
                            step.id.as_str(),
                            StateRecord {
                                key: step.key.to_string(),
                                existing_id: obs.existing_id.clone(),
                                applied_at: chrono::Utc::now(),
                                run_id: self.run_id().to_string(),
                            },
                        )
                        .await?;
                    report.set_state(&step.id, FinalState::Applied);
                }
            }
            satisfied.insert(step.id.clone());
        }
        Ok(())
    }

    /// Undo this run's changes, newest first. One attempt per step.
    async fn rollback(
        &mut self,
        applied: &[Change<'_>],
        credentials: &CredentialContext,
        report: &mut RunReport,
        cause: Error,
    ) -> Error {
        if applied.is_empty() {
            return cause;
        }
        warn!(run_id = %self.run_id(), steps = applied.len(), "rolling back");

        let mut incomplete = Vec::new();
        for change in applied.iter().rev() {
            let step = change.step();
            let undone = match change {
                Change::Created(_) => self.rollback_step(step, credentials).await,
                Change::Adopted { previous, .. } => self.release(step, previous.clone()).await,
            };
            match undone {
                Ok(state) => report.set_state(&step.id, state),
                Err(e) => {
                    warn!(run_id = %self.run_id(), step = %step.id, error = %e, "rollback failed");
                    report.set_state(&step.id, FinalState::Indeterminate);
                    incomplete.push(step.id.to_string());
                }
            }
        }

        if incomplete.is_empty() {
            cause
        } else {
            Error::RollbackIncomplete {
                steps: incomplete,
                cause: Box::new(cause),
            }
        }
    }

    async fn rollback_step(
        &mut self,
        step: &Step,
        credentials: &CredentialContext,
    ) -> Result<FinalState> {
        let Some(destroy) = step.action.destroy.as_deref() else {
            warn!(run_id = %self.run_id(), step = %step.id, "no destroy action, left in place");
            self.ledger
                .record(
                    &step.id,
                    ActionKind::Destroy,
                    0,
                    Outcome::RolledBack,
                    "no destroy action; left in place",
                )
                .await?;
            return Ok(FinalState::RolledBack);
        };

        self.ledger
            .record(&step.id, ActionKind::Destroy, 1, Outcome::RollingBack, "")
            .await?;
        let request = ActionRequest {
            step,
            kind: ActionKind::Destroy,
            command: destroy,
            attempt: 1,
            observation: None,
            credentials,
        };
        match self.runner.run(&request).await {
            Ok(_) => {
                self.ledger
                    .record(&step.id, ActionKind::Destroy, 1, Outcome::RolledBack, "")
                    .await?;
                self.store.remove(step.id.as_str()).await?;
                Ok(FinalState::RolledBack)
            }
            Err(failure) => {
                self.ledger
                    .record(
                        &step.id,
                        ActionKind::Destroy,
                        1,
                        Outcome::RollbackFailed,
                        &failure.message,
                    )
                    .await?;
                Err(Error::action_failed(step.id.as_str(), failure.class, failure.message))
            }
        }
    }

    /// Leave a step that existed before this run in place and put its
    /// state record back the way the run found it.
    async fn release(&mut self, step: &Step, previous: Option<StateRecord>) -> Result<FinalState> {
        info!(run_id = %self.run_id(), step = %step.id, "present before this run, left in place");
        self.ledger
            .record(
                &step.id,
                ActionKind::Destroy,
                0,
                Outcome::Skipped,
                "present before this run; left in place",
            )
            .await?;
        match previous {
            Some(record) => self.store.record(step.id.as_str(), record).await?,
            None => self.store.remove(step.id.as_str()).await?,
        }
        Ok(FinalState::Skipped)
    }

    // ============================================================
    // Teardown
    // ============================================================

    /// Destroy every present step in reverse plan order. `confirmation` must
    /// equal the configured sentinel; nothing is probed otherwise.
    pub async fn teardown(
        &mut self,
        plan: &Plan,
        credentials: &Arc<CredentialContext>,
        confirmation: &str,
    ) -> RunReport {
        let mut report = self.new_report(plan, RunMode::Teardown);
        if confirmation != self.sentinel {
            warn!(run_id = %self.run_id(), "teardown refused: confirmation token mismatch");
            report.finish_halted(Error::ConfirmationRequired);
            return report;
        }
        info!(run_id = %self.run_id(), steps = plan.len(), "teardown started");

        match self.teardown_steps(plan, credentials, &mut report).await {
            Ok(()) => report.finish_success(),
            Err(e) => {
                warn!(run_id = %self.run_id(), error = %e, "teardown halted");
                report.finish_halted(e);
            }
        }
        info!(run_id = %self.run_id(), outcome = %report.outcome, "teardown finished");
        report
    }

    async fn teardown_steps(
        &mut self,
        plan: &Plan,
        credentials: &CredentialContext,
        report: &mut RunReport,
    ) -> Result<()> {
        let mut left_in_place = Vec::new();
        for step in plan.reversed() {
            self.check_between_steps(step, ActionKind::Destroy, credentials).await?;

            let obs = self.observe(step, ActionKind::Destroy, credentials, report).await?;
            if obs.state == StepState::Absent {
                self.ledger
                    .record(&step.id, ActionKind::Destroy, 0, Outcome::Skipped, "absent")
                    .await?;
                report.set_state(&step.id, FinalState::Absent);
                continue;
            }
            if obs.state == StepState::Conflicting {
                warn!(
                    run_id = %self.run_id(),
                    step = %step.id,
                    "destroying resource with a different recorded key"
                );
            }

            let Some(destroy) = step.action.destroy.as_deref() else {
                warn!(
                    run_id = %self.run_id(),
                    step = %step.id,
                    "no destroy action, leaving in place"
                );
                self.ledger
                    .record(&step.id, ActionKind::Destroy, 0, Outcome::Skipped, "no destroy action")
                    .await?;
                report.set_state(&step.id, FinalState::Skipped);
                left_in_place.push(step.id.to_string());
                continue;
            };

            if let Err(e) = self
                .run_with_retry(step, ActionKind::Destroy, destroy, &obs, credentials)
                .await
            {
                if !matches!(e, Error::Cancelled(_)) {
                    report.set_state(&step.id, FinalState::Failed);
                }
                return Err(e);
            }
            self.store.remove(step.id.as_str()).await?;
            report.set_state(&step.id, FinalState::Destroyed);
        }
        if !left_in_place.is_empty() {
            return Err(Error::TeardownIncomplete {
                steps: left_in_place,
            });
        }
        Ok(())
    }

    // ============================================================
    // Preview
    // ============================================================

    /// Reconcile every step without acting. Nothing is written to the ledger.
    pub async fn preview(
        &self,
        plan: &Plan,
        credentials: &CredentialContext,
    ) -> Result<Vec<(StepId, Observation)>> {
        let mut observed = Vec::with_capacity(plan.len());
        for step in plan.steps() {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled(step.id.to_string()));
            }
            let obs = self.reconciler.reconcile(step, credentials).await?;
            observed.push((step.id.clone(), obs));
        }
        Ok(observed)
    }

    // ============================================================
    // Shared
    // ============================================================

    fn new_report(&self, plan: &Plan, mode: RunMode) -> RunReport {
        RunReport::new(
            self.run_id(),
            mode,
            self.ledger.location(),
            plan.steps().iter().map(|s| (&s.id, s.label.as_str())),
        )
    }

    async fn check_between_steps(
        &mut self,
        step: &Step,
        kind: ActionKind,
        credentials: &CredentialContext,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.ledger
                .record(&step.id, kind, 0, Outcome::Cancelled, "cancelled before step")
                .await?;
            return Err(Error::Cancelled(step.id.to_string()));
        }
        if !credentials.is_valid() {
            self.ledger
                .record(
                    &step.id,
                    kind,
                    0,
                    Outcome::CredentialsExpired,
                    "credentials expired before step",
                )
                .await?;
            return Err(Error::CredentialsExpired);
        }
        Ok(())
    }

    /// Reconcile one step. Every failed query is recorded before the
    /// backoff, and the last one before it halts the run.
    async fn observe(
        &mut self,
        step: &Step,
        kind: ActionKind,
        credentials: &CredentialContext,
        report: &mut RunReport,
    ) -> Result<Observation> {
        let mut attempt = 1;
        loop {
            let (error, retry) = match self.reconciler.attempt(step, credentials, attempt).await {
                ProbeAttempt::Observed(obs) => return Ok(obs),
                ProbeAttempt::Failed { error, retry } => (error, retry),
            };
            self.ledger
                .record(&step.id, kind, attempt, Outcome::ReconcileUnavailable, error.to_string())
                .await?;
            if !retry {
                report.set_state(&step.id, FinalState::Failed);
                return Err(Reconciler::unavailable(step, &error, attempt));
            }
            if !self.reconciler.backoff(step, attempt, &error).await {
                self.ledger
                    .record(
                        &step.id,
                        kind,
                        attempt,
                        Outcome::Cancelled,
                        "cancelled during state query",
                    )
                    .await?;
                return Err(Error::Cancelled(step.id.to_string()));
            }
            attempt += 1;
        }
    }

    /// Run one action under the retry policy. `attempting` is durable before
    /// each invocation; the outcome is durable before this returns.
    async fn run_with_retry(
        &mut self,
        step: &Step,
        kind: ActionKind,
        command: &str,
        obs: &Observation,
        credentials: &CredentialContext,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            if attempt > 1 && self.cancel.is_cancelled() {
                self.ledger
                    .record(&step.id, kind, attempt, Outcome::Cancelled, "cancelled before retry")
                    .await?;
                return Err(Error::Cancelled(step.id.to_string()));
            }

            self.ledger
                .record(&step.id, kind, attempt, Outcome::Attempting, step.key.short())
                .await?;
            info!(run_id = %self.run_id(), step = %step.id, attempt, action = %kind, "running");

            let failure = match self.invoke(step, kind, command, attempt, obs, credentials).await {
                Ok(()) => {
                    self.ledger
                        .record(&step.id, kind, attempt, Outcome::Succeeded, "")
                        .await?;
                    info!(
                        run_id = %self.run_id(),
                        step = %step.id,
                        attempt,
                        action = %kind,
                        "succeeded"
                    );
                    return Ok(());
                }
                Err(failure) => failure,
            };

            if failure.is_transient() {
                self.ledger
                    .record(&step.id, kind, attempt, Outcome::TransientFailure, &failure.message)
                    .await?;
                if self.policy.has_attempts_left(attempt) {
                    warn!(
                        run_id = %self.run_id(),
                        step = %step.id,
                        attempt,
                        error = %failure.message,
                        "transient failure, retrying"
                    );
                    let resumed = self.policy.pause(attempt, &self.cancel).await;
                    if !resumed || self.cancel.is_cancelled() {
                        self.ledger
                            .record(
                                &step.id,
                                kind,
                                attempt,
                                Outcome::Cancelled,
                                "cancelled during backoff",
                            )
                            .await?;
                        return Err(Error::Cancelled(step.id.to_string()));
                    }
                    attempt += 1;
                    continue;
                }
                let message = format!(
                    "{} (retries exhausted after {} attempts)",
                    failure.message, attempt
                );
                return Err(Error::action_failed(step.id.as_str(), failure.class, message));
            }

            self.ledger
                .record(&step.id, kind, attempt, Outcome::PermanentFailure, &failure.message)
                .await?;
            return Err(Error::action_failed(step.id.as_str(), failure.class, failure.message));
        }
    }

    /// The action itself, then `verify` after a successful apply.
    async fn invoke(
        &self,
        step: &Step,
        kind: ActionKind,
        command: &str,
        attempt: u32,
        obs: &Observation,
        credentials: &CredentialContext,
    ) -> std::result::Result<(), ActionFailure> {
        let request = ActionRequest {
            step,
            kind,
            command,
            attempt,
            observation: Some(obs),
            credentials,
        };
        self.runner.run(&request).await?;

        if kind == ActionKind::Apply {
            if let Some(verify) = step.action.verify.as_deref() {
                let check = ActionRequest {
                    kind: ActionKind::Verify,
                    command: verify,
                    ..request
                };
                self.runner.run(&check).await.map_err(|f| ActionFailure {
                    class: f.class,
                    message: format!("verify: {}", f.message),
                })?;
            }
        }
        Ok(())
    }
}

fn short(key: &str) -> &str {
    key.char_indices().nth(12).map_or(key, |(i, _)| &key[..i])
}
