//! Step actions - opaque external operations (apply / destroy / verify / query).
//!
//! The executor only sees the [`ActionRunner`] trait. [`ShellRunner`] is the
//! production implementation: it hands each command to the shell, the way
//! the provisioning scripts call terraform, aws, kubectl and helm.

use keel_core::{
    ActionKind, CredentialContext, Error, FailureClass, Observation, Result, ShellConfig, Step,
};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Longest slice of command output copied into ledger messages.
const MESSAGE_LIMIT: usize = 2_000;

/// Everything an action invocation needs.
pub struct ActionRequest<'a> {
    pub step: &'a Step,
    pub kind: ActionKind,
    pub command: &'a str,
    pub attempt: u32,
    pub observation: Option<&'a Observation>,
    pub credentials: &'a CredentialContext,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActionOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActionFailure {
    pub class: FailureClass,
    pub message: String,
}

impl ActionFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == FailureClass::Transient
    }
}

impl std::fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failure: {}", self.class, self.message)
    }
}

/// Invokes step actions against the outside world.
#[async_trait::async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run(
        &self,
        request: &ActionRequest<'_>,
    ) -> std::result::Result<ActionOutput, ActionFailure>;
}

/// Raw result of one shell command.
#[derive(Clone, Debug)]
pub struct ShellOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }
}

pub struct ShellRunner {
    program: String,
    working_dir: PathBuf,
    timeout: Duration,
    transient_exit_codes: Vec<i32>,
    transient_patterns: Vec<Regex>,
}

impl ShellRunner {
    pub fn from_config(config: &ShellConfig, working_dir: impl AsRef<Path>) -> Result<Self> {
        let transient_patterns = config
            .transient_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| Error::config(format!("bad pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            program: config.program.clone(),
            working_dir: working_dir.as_ref().to_path_buf(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            transient_exit_codes: config.transient_exit_codes.clone(),
            transient_patterns,
        })
    }

    /// Run `command` with `env` added to the inherited environment.
    /// Spawn errors are returned as `Err`; everything else lands in [`ShellOutput`].
    pub async fn exec(
        &self,
        command: &str,
        env: &[(String, String)],
    ) -> std::io::Result<ShellOutput> {
        debug!(program = %self.program, "exec: {}", truncate(command, 120));

        let child = Command::new(&self.program)
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(ShellOutput {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    timed_out: false,
                })
            }
            // Dropping the future kills the child.
            Err(_) => Ok(ShellOutput {
                code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
            }),
        }
    }

    /// Transient when timed out, when the exit code is listed as retryable, or
    /// when stderr matches a retryable pattern. Anything else is permanent.
    pub fn classify(&self, output: &ShellOutput) -> FailureClass {
        if output.timed_out {
            return FailureClass::Transient;
        }
        if let Some(code) = output.code {
            if self.transient_exit_codes.contains(&code) {
                return FailureClass::Transient;
            }
        }
        if self.transient_patterns.iter().any(|re| re.is_match(&output.stderr)) {
            return FailureClass::Transient;
        }
        FailureClass::Permanent
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait::async_trait]
impl ActionRunner for ShellRunner {
    async fn run(
        &self,
        request: &ActionRequest<'_>,
    ) -> std::result::Result<ActionOutput, ActionFailure> {
        let env = action_env(request);
        let output = self
            .exec(request.command, &env)
            .await
            .map_err(|e| {
                ActionFailure::permanent(format!("failed to spawn {}: {}", self.program, e))
            })?;

        if output.success() {
            return Ok(ActionOutput {
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        let class = self.classify(&output);
        let message = if output.timed_out {
            format!("timed out after {}s", self.timeout.as_secs())
        } else {
            format!(
                "exit code {}: {}",
                output.code.unwrap_or(-1),
                truncate(output.stderr.trim(), MESSAGE_LIMIT)
            )
        };
        Err(ActionFailure { class, message })
    }
}

/// Environment handed to every action: step identity, reconciled state,
/// declared inputs as `KEEL_INPUT_<NAME>`, and credential values.
pub fn action_env(request: &ActionRequest<'_>) -> Vec<(String, String)> {
    let mut env = step_env(request.step, request.credentials);
    env.push(("KEEL_ACTION".to_string(), request.kind.to_string()));
    env.push(("KEEL_ATTEMPT".to_string(), request.attempt.to_string()));
    if let Some(obs) = request.observation {
        env.push(("KEEL_STEP_STATE".to_string(), obs.state.to_string()));
        if let Some(id) = &obs.existing_id {
            env.push(("KEEL_EXISTING_ID".to_string(), id.clone()));
        }
    }
    env
}

/// Step identity, inputs and credentials. Shared by actions and state queries.
pub fn step_env(step: &Step, credentials: &CredentialContext) -> Vec<(String, String)> {
    let mut env = vec![
        ("KEEL_STEP_ID".to_string(), step.id.to_string()),
        ("KEEL_STEP_LABEL".to_string(), step.label.clone()),
        ("KEEL_IDEMPOTENCY_KEY".to_string(), step.key.to_string()),
    ];
    for (name, value) in &step.inputs {
        env.push((format!("KEEL_INPUT_{}", env_name(name)), value.clone()));
    }
    for (name, value) in credentials.env_pairs() {
        env.push((name.to_string(), value.to_string()));
    }
    env
}

fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} total chars]", &s[..end], s.len())
}
