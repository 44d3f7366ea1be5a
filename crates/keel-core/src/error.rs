//! Error types for keel

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a failed action may be retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    Transient,
    Permanent,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("dependency cycle among steps: {}", ids.join(", "))]
    CycleDetected { ids: Vec<String> },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("state of step '{step}' unavailable: {reason}")]
    ReconcileUnavailable { step: String, reason: String },

    #[error("drift detected on step '{step}': recorded key {recorded} does not match desired {desired}")]
    DriftDetected {
        step: String,
        recorded: String,
        desired: String,
    },

    #[error("action failed on step '{step}' ({class}): {message}")]
    ActionFailed {
        step: String,
        class: FailureClass,
        message: String,
    },

    #[error("rollback incomplete, steps left in unknown state: {} (after: {cause})", steps.join(", "))]
    RollbackIncomplete { steps: Vec<String>, cause: Box<Error> },

    #[error("step '{step}' started before dependency '{dependency}' succeeded")]
    DependencyUnsatisfied { step: String, dependency: String },

    #[error("teardown left steps in place (no destroy action): {}", steps.join(", "))]
    TeardownIncomplete { steps: Vec<String> },

    #[error("teardown requires the confirmation token")]
    ConfirmationRequired,

    #[error("run cancelled before step '{0}'")]
    Cancelled(String),

    #[error("credentials unavailable: {0}")]
    CredentialsUnavailable(String),

    #[error("credentials expired or invalidated")]
    CredentialsExpired,

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    TomlError(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    pub fn action_failed(
        step: impl Into<String>,
        class: FailureClass,
        message: impl Into<String>,
    ) -> Self {
        Self::ActionFailed {
            step: step.into(),
            class,
            message: message.into(),
        }
    }

    pub fn reconcile_unavailable(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ReconcileUnavailable {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// Step the error is attributed to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::ReconcileUnavailable { step, .. }
            | Self::DriftDetected { step, .. }
            | Self::ActionFailed { step, .. }
            | Self::DependencyUnsatisfied { step, .. }
            | Self::UnknownDependency { step, .. } => Some(step),
            Self::Cancelled(step) => Some(step),
            Self::RollbackIncomplete { cause, .. } => cause.step(),
            _ => None,
        }
    }

    /// Errors raised while building the plan, before any external call.
    pub fn is_plan_error(&self) -> bool {
        matches!(
            self,
            Self::CycleDetected { .. } | Self::UnknownDependency { .. } | Self::ConfigError(_)
        )
    }
}
