//! Core types for keel

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Step identifier - cheaply cloneable
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct StepId(Arc<str>);

impl StepId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for StepId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for StepId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// External operation kinds a step can reference.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Apply,
    Destroy,
    Verify,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
            Self::Verify => write!(f, "verify"),
        }
    }
}

/// Declarative description of one step, as written in the step source.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct StepSpec {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub apply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destroy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<String>,
    /// Desired-state inputs; these feed the idempotency key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
}

impl StepSpec {
    pub fn new(apply: impl Into<String>) -> Self {
        Self {
            apply: apply.into(),
            ..Default::default()
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn destroy(mut self, cmd: impl Into<String>) -> Self {
        self.destroy = Some(cmd.into());
        self
    }

    pub fn query(mut self, cmd: impl Into<String>) -> Self {
        self.query = Some(cmd.into());
        self
    }

    pub fn verify(mut self, cmd: impl Into<String>) -> Self {
        self.verify = Some(cmd.into());
        self
    }

    pub fn input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }
}

/// The commands behind a step's actions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionSpec {
    pub apply: String,
    pub destroy: Option<String>,
    pub query: Option<String>,
    pub verify: Option<String>,
}

impl ActionSpec {
    pub fn command(&self, kind: ActionKind) -> Option<&str> {
        match kind {
            ActionKind::Apply => Some(&self.apply),
            ActionKind::Destroy => self.destroy.as_deref(),
            ActionKind::Verify => self.verify.as_deref(),
        }
    }
}

/// Deterministic hash of a step's declared desired state.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// SHA-256 over the step id, its apply command and its sorted inputs.
    /// Each field is length-prefixed so distinct inputs never collide by concatenation.
    pub fn compute(id: &str, apply: &str, inputs: &BTreeMap<String, String>) -> Self {
        let mut hasher = Sha256::new();
        let mut feed = |field: &str| {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        };
        feed(id);
        feed(apply);
        for (k, v) in inputs {
            feed(k);
            feed(v);
        }
        let digest = hasher.finalize();
        Self(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A planned unit of lifecycle work. Immutable once the plan is built.
#[derive(Clone, Debug)]
pub struct Step {
    pub id: StepId,
    pub label: String,
    pub depends_on: Vec<StepId>,
    pub action: ActionSpec,
    pub inputs: BTreeMap<String, String>,
    pub key: IdempotencyKey,
}

impl Step {
    pub fn from_spec(id: &str, spec: &StepSpec) -> Self {
        let label = if spec.label.is_empty() {
            id.to_string()
        } else {
            spec.label.clone()
        };
        Self {
            id: StepId::new(id),
            label,
            depends_on: spec.depends_on.iter().map(|d| StepId::new(d.as_str())).collect(),
            action: ActionSpec {
                apply: spec.apply.clone(),
                destroy: spec.destroy.clone(),
                query: spec.query.clone(),
                verify: spec.verify.clone(),
            },
            inputs: spec.inputs.clone(),
            key: IdempotencyKey::compute(id, &spec.apply, &spec.inputs),
        }
    }
}

/// Classification of a step against live external state.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Absent,
    Partial,
    Applied,
    Conflicting,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Partial => write!(f, "partial"),
            Self::Applied => write!(f, "applied"),
            Self::Conflicting => write!(f, "conflicting"),
        }
    }
}

/// What the reconciler saw for one step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub state: StepState,
    /// Identifier of an existing resource, used to import instead of re-create.
    pub existing_id: Option<String>,
    /// Key recorded against the live resource, if any.
    pub recorded_key: Option<String>,
}

impl Observation {
    pub fn absent() -> Self {
        Self {
            state: StepState::Absent,
            existing_id: None,
            recorded_key: None,
        }
    }
}
