//! Orchestrator configuration
//!
//! Everything a run needs, in one explicit object. Loaded from TOML and
//! validated up front; nothing is read from the ambient environment once a
//! run has started.

use crate::error::{Error, Result};
use crate::types::StepSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level keel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    /// Ledger location, state file, timeout budget, teardown token.
    pub run: RunSettings,
    /// Backoff for step actions.
    pub retry: BackoffConfig,
    /// Backoff for state queries.
    pub reconcile: BackoffConfig,
    /// How external commands are launched and classified.
    pub shell: ShellConfig,
    /// Authentication material captured before the run.
    pub credentials: CredentialConfig,
    /// Declarative step source, keyed by step id.
    pub steps: BTreeMap<String, StepSpec>,
    /// Directory relative paths resolve against (the config file's directory).
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Where run ledgers and reports are written.
    pub ledger_dir: PathBuf,
    /// Local record of applied idempotency keys.
    pub state_file: PathBuf,
    /// Whole-run budget in seconds. 0 disables it.
    pub timeout_secs: u64,
    /// Exact token an operator must pass before teardown.
    pub confirmation_sentinel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
    /// Fraction of each delay randomised either way (0.0 - 1.0).
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub program: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Per-command timeout. A timed-out command counts as a transient failure.
    pub timeout_secs: u64,
    /// Exit codes treated as retryable.
    pub transient_exit_codes: Vec<i32>,
    /// Regexes matched against stderr; a match makes the failure retryable.
    pub transient_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CredentialConfig {
    /// Environment variables that must be present when the run starts.
    pub required_env: Vec<String>,
    /// Environment variables captured when present.
    pub optional_env: Vec<String>,
    /// Command printing a JSON object of extra credential values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Lifetime of the acquired context. 0 means it lasts until the run ends.
    pub ttl_secs: u64,
}

// ============================================================
// Defaults
// ============================================================

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            run: RunSettings::default(),
            retry: BackoffConfig::default(),
            reconcile: BackoffConfig {
                max_attempts: 4,
                base_ms: 500,
                ..BackoffConfig::default()
            },
            shell: ShellConfig::default(),
            credentials: CredentialConfig::default(),
            steps: BTreeMap::new(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            ledger_dir: PathBuf::from(".keel/runs"),
            state_file: PathBuf::from(".keel/state.json"),
            timeout_secs: 0,
            confirmation_sentinel: "DESTROY".into(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 1_000,
            multiplier: 2.0,
            max_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: "bash".into(),
            working_dir: None,
            timeout_secs: 1_800,
            transient_exit_codes: vec![75],
            transient_patterns: vec![
                "(?i)throttl".into(),
                "RequestLimitExceeded".into(),
                "(?i)too many requests".into(),
                "(?i)rate exceeded".into(),
                "(?i)connection reset".into(),
                "(?i)i/o timeout".into(),
                "(?i)TLS handshake timeout".into(),
            ],
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl KeelConfig {
    /// Load and validate a config file. Relative paths inside it resolve
    /// against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&content)?;
        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tracing::info!(path = %path.display(), steps = config.steps.len(), "loaded config");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate("retry")?;
        self.reconcile.validate("reconcile")?;

        if self.run.confirmation_sentinel.trim().is_empty() {
            return Err(Error::config("run.confirmation_sentinel must not be empty"));
        }
        if self.shell.program.trim().is_empty() {
            return Err(Error::config("shell.program must not be empty"));
        }
        for pattern in &self.shell.transient_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                Error::config(format!(
                    "shell.transient_patterns: invalid regex '{}': {}",
                    pattern, e
                ))
            })?;
        }
        for name in &self.credentials.required_env {
            if name.trim().is_empty() {
                return Err(Error::config("credentials.required_env contains an empty name"));
            }
        }

        if self.steps.is_empty() {
            return Err(Error::config("no steps defined"));
        }
        for (id, spec) in &self.steps {
            if id.trim().is_empty() || id.chars().any(char::is_whitespace) {
                return Err(Error::config(format!("invalid step id '{}'", id)));
            }
            if spec.apply.trim().is_empty() {
                return Err(Error::config(format!("step '{}' has an empty apply command", id)));
            }
        }
        Ok(())
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.resolve(&self.run.ledger_dir)
    }

    pub fn state_file(&self) -> PathBuf {
        self.resolve(&self.run.state_file)
    }

    pub fn working_dir(&self) -> PathBuf {
        match &self.shell.working_dir {
            Some(dir) => self.resolve(dir),
            None => self.base_dir.clone(),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        let expanded = expand_tilde(path);
        if expanded.is_absolute() {
            expanded
        } else {
            self.base_dir.join(expanded)
        }
    }

    /// Sample configuration: network, cluster, policy add-ons, application.
    pub fn example() -> Self {
        let mut steps = BTreeMap::new();
        steps.insert(
            "network".to_string(),
            StepSpec::new("terraform -chdir=terraform/network apply -auto-approve -input=false")
                .label("VPC, subnets and NAT")
                .destroy("terraform -chdir=terraform/network destroy -auto-approve -input=false")
                .query("./scripts/query-state.sh network")
                .input("region", "us-east-1")
                .input("vpc_cidr", "10.0.0.0/16"),
        );
        steps.insert(
            "cluster".to_string(),
            StepSpec::new("terraform -chdir=terraform/cluster apply -auto-approve -input=false")
                .label("EKS control plane and node group")
                .depends_on(["network"])
                .destroy("terraform -chdir=terraform/cluster destroy -auto-approve -input=false")
                .query("./scripts/query-state.sh cluster")
                .verify(
                    "aws eks describe-cluster --name \"$KEEL_INPUT_CLUSTER_NAME\" \
                     --query cluster.status --output text | grep -q ACTIVE",
                )
                .input("cluster_name", "demo-cluster")
                .input("kubernetes_version", "1.29"),
        );
        steps.insert(
            "addons".to_string(),
            StepSpec::new(
                "helm upgrade --install kyverno kyverno/kyverno -n kyverno --create-namespace --wait",
            )
            .label("Admission policy engine")
            .depends_on(["cluster"])
            .destroy("helm uninstall kyverno -n kyverno")
            .input("chart_version", "3.1.4"),
        );
        steps.insert(
            "app".to_string(),
            StepSpec::new("kubectl apply -f k8s/")
                .label("Web application")
                .depends_on(["cluster", "addons"])
                .destroy("kubectl delete -f k8s/ --ignore-not-found")
                .verify("kubectl rollout status deployment/web --timeout=120s")
                .input("image", "ghcr.io/example/web:1.0.0"),
        );

        Self {
            credentials: CredentialConfig {
                required_env: vec!["AWS_REGION".into()],
                optional_env: vec!["AWS_PROFILE".into(), "KUBECONFIG".into()],
                command: None,
                ttl_secs: 3_600,
            },
            run: RunSettings {
                timeout_secs: 5_400,
                ..RunSettings::default()
            },
            steps,
            ..Self::default()
        }
    }
}

impl BackoffConfig {
    fn validate(&self, section: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config(format!("{}.max_attempts must be at least 1", section)));
        }
        if !(self.multiplier >= 1.0) {
            return Err(Error::config(format!("{}.multiplier must be >= 1.0", section)));
        }
        if self.base_ms > self.max_ms {
            return Err(Error::config(format!("{}.base_ms exceeds {}.max_ms", section, section)));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::config(format!("{}.jitter must be within 0.0..=1.0", section)));
        }
        Ok(())
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[steps.network]
apply = "true"
"#;

    #[test]
    fn minimal_config_takes_defaults() {
        let config = KeelConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.reconcile.max_attempts, 4);
        assert_eq!(config.run.confirmation_sentinel, "DESTROY");
        assert_eq!(config.shell.transient_exit_codes, vec![75]);
        assert_eq!(config.steps["network"].apply, "true");
    }

    #[test]
    fn rejects_zero_attempts() {
        let text = format!("[retry]\nmax_attempts = 0\n{}", MINIMAL);
        let err = KeelConfig::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("retry.max_attempts"));
    }

    #[test]
    fn rejects_bad_pattern() {
        let text = format!("[shell]\ntransient_patterns = [\"(\"]\n{}", MINIMAL);
        assert!(matches!(KeelConfig::from_toml_str(&text), Err(Error::ConfigError(_))));
    }

    #[test]
    fn rejects_empty_step_set() {
        let err = KeelConfig::from_toml_str("[run]\ntimeout_secs = 5\n").unwrap_err();
        assert!(err.to_string().contains("no steps"));
    }

    #[test]
    fn example_roundtrips_through_toml() {
        let text = KeelConfig::example().to_toml();
        let back = KeelConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.steps.len(), 4);
        assert_eq!(back.steps["app"].depends_on, vec!["cluster", "addons"]);
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("keel.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = KeelConfig::load(&path).unwrap();
        assert_eq!(config.ledger_dir(), tmp.path().join(".keel/runs"));
        assert_eq!(config.working_dir(), tmp.path());
    }
}
