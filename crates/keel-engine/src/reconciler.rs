//! State reconciler - classifies each step against live external state.
//!
//! A [`StateProbe`] asks the system of record what exists; [`classify`] turns
//! the answer into one of four states:
//!
//! | found | recorded key        | complete | state         |
//! |-------|---------------------|----------|---------------|
//! | no    | -                   | -        | `Absent`      |
//! | yes   | differs from step   | -        | `Conflicting` |
//! | yes   | matches step        | yes      | `Applied`     |
//! | yes   | matches, or missing | no / -   | `Partial`     |
//!
//! A found resource with no recorded key is `Partial`: the executor adopts it
//! (import) rather than re-creating it.

use crate::action::{step_env, ShellRunner};
use crate::retry::RetryPolicy;
use crate::state::StateStore;
use keel_core::{CredentialContext, Error, Observation, Result, Step, StepState};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit code a query command uses to say "nothing exists".
pub const QUERY_NOT_FOUND_EXIT: i32 = 3;

/// What a probe found for one step.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ProbeReport {
    #[serde(default = "default_true")]
    pub found: bool,
    #[serde(default = "default_true")]
    pub complete: bool,
    #[serde(default, rename = "key", alias = "idempotency_key")]
    pub recorded_key: Option<String>,
    #[serde(default, alias = "id")]
    pub existing_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ProbeReport {
    pub fn missing() -> Self {
        Self {
            found: false,
            complete: false,
            recorded_key: None,
            existing_id: None,
        }
    }

    pub fn found(key: Option<&str>) -> Self {
        Self {
            found: true,
            complete: true,
            recorded_key: key.map(String::from),
            existing_id: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeError(pub String);

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queries the external system of record for a step's resources.
#[async_trait::async_trait]
pub trait StateProbe: Send + Sync {
    async fn probe(
        &self,
        step: &Step,
        credentials: &CredentialContext,
    ) -> std::result::Result<ProbeReport, ProbeError>;
}

pub fn classify(step: &Step, report: &ProbeReport) -> Observation {
    let state = if !report.found {
        StepState::Absent
    } else {
        match report.recorded_key.as_deref() {
            Some(key) if key != step.key.as_str() => StepState::Conflicting,
            Some(_) if report.complete => StepState::Applied,
            _ => StepState::Partial,
        }
    };
    Observation {
        state,
        existing_id: report.existing_id.clone(),
        recorded_key: report.recorded_key.clone(),
    }
}

/// Probes through step `query` commands, falling back to the local state
/// record for steps without one (or for reports that carry no key).
pub struct ShellProbe {
    runner: Arc<ShellRunner>,
    store: Arc<StateStore>,
}

impl ShellProbe {
    pub fn new(runner: Arc<ShellRunner>, store: Arc<StateStore>) -> Self {
        Self { runner, store }
    }
}

#[async_trait::async_trait]
impl StateProbe for ShellProbe {
    async fn probe(
        &self,
        step: &Step,
        credentials: &CredentialContext,
    ) -> std::result::Result<ProbeReport, ProbeError> {
        let recorded = self.store.get(step.id.as_str());

        let Some(query) = step.action.query.as_deref() else {
            return Ok(match recorded {
                Some(rec) => ProbeReport {
                    found: true,
                    complete: true,
                    recorded_key: Some(rec.key),
                    existing_id: rec.existing_id,
                },
                None => ProbeReport::missing(),
            });
        };

        let output = self
            .runner
            .exec(query, &step_env(step, credentials))
            .await
            .map_err(|e| ProbeError(format!("failed to run query: {}", e)))?;

        if output.timed_out {
            return Err(ProbeError(format!(
                "query timed out after {}s",
                self.runner.timeout().as_secs()
            )));
        }
        match output.code {
            Some(0) => {}
            Some(QUERY_NOT_FOUND_EXIT) => return Ok(ProbeReport::missing()),
            code => {
                return Err(ProbeError(format!(
                    "query exited with {}: {}",
                    code.unwrap_or(-1),
                    output.stderr.trim()
                )))
            }
        }

        let mut report: ProbeReport = if output.stdout.trim().is_empty() {
            ProbeReport::found(None)
        } else {
            serde_json::from_str(output.stdout.trim())
                .map_err(|e| ProbeError(format!("unparseable query output: {}", e)))?
        };
        if report.found {
            if let Some(rec) = recorded {
                if report.recorded_key.is_none() {
                    report.recorded_key = Some(rec.key);
                }
                if report.existing_id.is_none() {
                    report.existing_id = rec.existing_id;
                }
            }
        }
        Ok(report)
    }
}

pub struct Reconciler {
    probe: Arc<dyn StateProbe>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

/// Result of a single probe.
#[derive(Debug)]
pub enum ProbeAttempt {
    Observed(Observation),
    /// The probe failed; `retry` is false once the attempts are used up.
    Failed { error: ProbeError, retry: bool },
}

impl Reconciler {
    pub fn new(probe: Arc<dyn StateProbe>, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { probe, policy, cancel }
    }

    /// One probe, classified. Callers that keep a ledger drive the retry
    /// loop themselves so each failure is recorded before the backoff.
    pub async fn attempt(
        &self,
        step: &Step,
        credentials: &CredentialContext,
        attempt: u32,
    ) -> ProbeAttempt {
        match self.probe.probe(step, credentials).await {
            Ok(report) => {
                let obs = classify(step, &report);
                debug!(step = %step.id, state = %obs.state, "reconciled");
                ProbeAttempt::Observed(obs)
            }
            Err(error) => ProbeAttempt::Failed {
                retry: self.policy.has_attempts_left(attempt),
                error,
            },
        }
    }

    /// Sleep before the next probe. False when cancelled.
    pub async fn backoff(&self, step: &Step, attempt: u32, error: &ProbeError) -> bool {
        warn!(step = %step.id, attempt, error = %error, "state query failed, retrying");
        self.policy.pause(attempt, &self.cancel).await
    }

    pub fn unavailable(step: &Step, error: &ProbeError, attempts: u32) -> Error {
        Error::reconcile_unavailable(
            step.id.as_str(),
            format!("{} (after {} attempts)", error, attempts),
        )
    }

    /// Probe with retries. Exhausted retries give `ReconcileUnavailable`;
    /// cancellation during a backoff gives `Cancelled`.
    pub async fn reconcile(
        &self,
        step: &Step,
        credentials: &CredentialContext,
    ) -> Result<Observation> {
        let mut attempt = 1;
        loop {
            match self.attempt(step, credentials, attempt).await {
                ProbeAttempt::Observed(obs) => return Ok(obs),
                ProbeAttempt::Failed { error, retry: true } => {
                    if !self.backoff(step, attempt, &error).await {
                        return Err(Error::Cancelled(step.id.to_string()));
                    }
                    attempt += 1;
                }
                ProbeAttempt::Failed { error, retry: false } => {
                    return Err(Self::unavailable(step, &error, attempt));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateRecord;
    use keel_core::{BackoffConfig, ShellConfig, StepSpec};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn step() -> Step {
        Step::from_spec("cluster", &StepSpec::new("make cluster").input("version", "1.29"))
    }

    #[test]
    fn classification_table() {
        let s = step();
        let key = s.key.as_str();

        assert_eq!(classify(&s, &ProbeReport::missing()).state, StepState::Absent);
        assert_eq!(classify(&s, &ProbeReport::found(Some(key))).state, StepState::Applied);
        assert_eq!(
            classify(&s, &ProbeReport::found(Some("stale"))).state,
            StepState::Conflicting
        );
        assert_eq!(classify(&s, &ProbeReport::found(None)).state, StepState::Partial);

        let incomplete = ProbeReport {
            complete: false,
            ..ProbeReport::found(Some(key))
        };
        assert_eq!(classify(&s, &incomplete).state, StepState::Partial);
    }

    #[test]
    fn report_parses_with_defaults_and_aliases() {
        let r: ProbeReport = serde_json::from_str(r#"{"id": "eks-1"}"#).unwrap();
        assert!(r.found && r.complete);
        assert_eq!(r.existing_id.as_deref(), Some("eks-1"));
        let r: ProbeReport =
            serde_json::from_str(r#"{"complete": false, "idempotency_key": "k"}"#).unwrap();
        assert!(!r.complete);
        assert_eq!(r.recorded_key.as_deref(), Some("k"));
    }

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl StateProbe for Flaky {
        async fn probe(
            &self,
            _step: &Step,
            _credentials: &CredentialContext,
        ) -> std::result::Result<ProbeReport, ProbeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ProbeError("connection refused".into()))
            } else {
                Ok(ProbeReport::missing())
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(BackoffConfig {
            max_attempts,
            base_ms: 1,
            multiplier: 1.0,
            max_ms: 1,
            jitter: 0.0,
        })
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let probe = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let r = Reconciler::new(probe.clone(), fast_policy(3), CancellationToken::new());
        let obs = r.reconcile(&step(), &CredentialContext::empty()).await.unwrap();
        assert_eq!(obs.state, StepState::Absent);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_are_unavailable() {
        let probe = Arc::new(Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let r = Reconciler::new(probe.clone(), fast_policy(2), CancellationToken::new());
        let err = r.reconcile(&step(), &CredentialContext::empty()).await.unwrap_err();
        assert!(matches!(err, Error::ReconcileUnavailable { .. }));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    fn shell_probe(dir: &std::path::Path, store: Arc<StateStore>) -> ShellProbe {
        let runner = ShellRunner::from_config(&ShellConfig::default(), dir).unwrap();
        ShellProbe::new(Arc::new(runner), store)
    }

    #[tokio::test]
    async fn shell_probe_reads_query_output() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = shell_probe(tmp.path(), Arc::new(StateStore::in_memory()));
        let creds = CredentialContext::empty();

        let s = Step::from_spec(
            "network",
            &StepSpec::new("true").query(r#"echo "{\"key\": \"$KEEL_IDEMPOTENCY_KEY\"}""#),
        );
        let report = probe.probe(&s, &creds).await.unwrap();
        assert_eq!(classify(&s, &report).state, StepState::Applied);

        let gone = Step::from_spec("network", &StepSpec::new("true").query("exit 3"));
        assert!(!probe.probe(&gone, &creds).await.unwrap().found);

        let broken = Step::from_spec("network", &StepSpec::new("true").query("exit 1"));
        assert!(probe.probe(&broken, &creds).await.is_err());
    }

    #[tokio::test]
    async fn shell_probe_falls_back_to_state_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::in_memory());
        let probe = shell_probe(tmp.path(), store.clone());
        let creds = CredentialContext::empty();
        let s = Step::from_spec("addons", &StepSpec::new("true"));

        assert_eq!(classify(&s, &probe.probe(&s, &creds).await.unwrap()).state, StepState::Absent);

        store
            .record(
                "addons",
                StateRecord {
                    key: s.key.to_string(),
                    existing_id: None,
                    applied_at: chrono::Utc::now(),
                    run_id: "r".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(classify(&s, &probe.probe(&s, &creds).await.unwrap()).state, StepState::Applied);

        // Query reports the resource but no key: the recorded key fills in.
        let queried = Step::from_spec("addons", &StepSpec::new("true").query("true"));
        let report = probe.probe(&queried, &creds).await.unwrap();
        assert_eq!(report.recorded_key.as_deref(), Some(s.key.as_str()));
    }
}
