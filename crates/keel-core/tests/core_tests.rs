//! Tests for keel-core: identifiers, idempotency keys, configuration, errors

use keel_core::*;
use std::collections::BTreeMap;

// ===========================================================================
// StepId
// ===========================================================================

#[test]
fn step_id_display_and_conversions() {
    let id = StepId::new("network");
    assert_eq!(id.as_str(), "network");
    assert_eq!(format!("{}", id), "network");
    let from_str: StepId = "network".into();
    let from_string: StepId = String::from("network").into();
    assert_eq!(from_str, from_string);
}

#[test]
fn step_id_serializes_as_plain_string() {
    let id = StepId::new("cluster");
    assert_eq!(serde_json::to_string(&id).unwrap(), r#""cluster""#);
    let back: StepId = serde_json::from_str(r#""cluster""#).unwrap();
    assert_eq!(back, id);
}

#[test]
fn step_ids_order_lexicographically() {
    let mut ids = vec![StepId::new("b"), StepId::new("a"), StepId::new("c")];
    ids.sort();
    let names: Vec<&str> = ids.iter().map(StepId::as_str).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

// ===========================================================================
// IdempotencyKey
// ===========================================================================

fn spec() -> StepSpec {
    StepSpec::new("terraform apply")
        .input("region", "us-east-1")
        .input("cidr", "10.0.0.0/16")
}

#[test]
fn key_is_stable_hex_sha256() {
    let a = Step::from_spec("network", &spec());
    let b = Step::from_spec("network", &spec());
    assert_eq!(a.key, b.key);
    assert_eq!(a.key.as_str().len(), 64);
    assert!(a.key.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    assert_eq!(a.key.short().len(), 12);
}

#[test]
fn key_tracks_desired_state_only() {
    let base = Step::from_spec("network", &spec()).key;

    let relabelled = spec().label("VPC").depends_on(["other"]).destroy("terraform destroy");
    assert_eq!(Step::from_spec("network", &relabelled).key, base);

    let new_input = spec().input("cidr", "10.1.0.0/16");
    assert_ne!(Step::from_spec("network", &new_input).key, base);

    let new_command = StepSpec { apply: "terraform apply -refresh=false".into(), ..spec() };
    assert_ne!(Step::from_spec("network", &new_command).key, base);

    assert_ne!(Step::from_spec("network2", &spec()).key, base);
}

#[test]
fn key_fields_do_not_run_together() {
    let mut a = BTreeMap::new();
    a.insert("ab".to_string(), "c".to_string());
    let mut b = BTreeMap::new();
    b.insert("a".to_string(), "bc".to_string());
    assert_ne!(
        IdempotencyKey::compute("s", "x", &a),
        IdempotencyKey::compute("s", "x", &b)
    );
}

// ===========================================================================
// Step
// ===========================================================================

#[test]
fn label_defaults_to_id() {
    let step = Step::from_spec("addons", &StepSpec::new("helm install"));
    assert_eq!(step.label, "addons");
    let step = Step::from_spec("addons", &StepSpec::new("helm install").label("Policy engine"));
    assert_eq!(step.label, "Policy engine");
}

#[test]
fn action_spec_exposes_commands_by_kind() {
    let step = Step::from_spec("app", &StepSpec::new("up").destroy("down"));
    assert_eq!(step.action.command(ActionKind::Apply), Some("up"));
    assert_eq!(step.action.command(ActionKind::Destroy), Some("down"));
    assert_eq!(step.action.command(ActionKind::Verify), None);
}

#[test]
fn step_state_serializes_lowercase() {
    assert_eq!(serde_json::to_string(&StepState::Conflicting).unwrap(), r#""conflicting""#);
    assert_eq!(StepState::Partial.to_string(), "partial");
    assert_eq!(Observation::absent().state, StepState::Absent);
}

// ===========================================================================
// Configuration
// ===========================================================================

#[test]
fn config_loads_from_file_and_resolves_paths() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("keel.toml");
    std::fs::write(
        &path,
        r#"
[run]
ledger_dir = "runs"

[retry]
max_attempts = 5

[steps.network]
apply = "make network"

[steps.cluster]
apply = "make cluster"
depends_on = ["network"]
inputs = { version = "1.29" }
"#,
    )
    .unwrap();

    let config = KeelConfig::load(&path).unwrap();
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.reconcile.max_attempts, 4);
    assert_eq!(config.run.confirmation_sentinel, "DESTROY");
    assert_eq!(config.ledger_dir(), tmp.path().join("runs"));
    assert_eq!(config.working_dir(), tmp.path());
    assert_eq!(config.steps["cluster"].depends_on, vec!["network"]);
    assert_eq!(config.steps["cluster"].inputs["version"], "1.29");
}

#[test]
fn missing_config_file_is_a_config_error() {
    let err = KeelConfig::load(std::path::Path::new("/nonexistent/keel.toml")).unwrap_err();
    assert!(matches!(err, Error::ConfigError(_)));
    assert!(err.is_plan_error());
}

#[test]
fn invalid_settings_are_rejected() {
    let cases = [
        "[retry]\nmultiplier = 0.5\n[steps.a]\napply = \"x\"",
        "[retry]\njitter = 1.5\n[steps.a]\napply = \"x\"",
        "[retry]\nbase_ms = 50000\n[steps.a]\napply = \"x\"",
        "[run]\nconfirmation_sentinel = \"\"\n[steps.a]\napply = \"x\"",
        "[steps.\"a b\"]\napply = \"x\"",
        "[steps.a]\napply = \"  \"",
    ];
    for case in cases {
        assert!(
            matches!(KeelConfig::from_toml_str(case), Err(Error::ConfigError(_))),
            "accepted: {}",
            case
        );
    }
}

#[test]
fn malformed_toml_is_a_toml_error() {
    let err = KeelConfig::from_toml_str("[steps.a\napply = ").unwrap_err();
    assert!(matches!(err, Error::TomlError(_)));
}

#[test]
fn example_config_is_valid() {
    let example = KeelConfig::example();
    example.validate().unwrap();
    let ids: Vec<&str> = example.steps.keys().map(String::as_str).collect();
    assert_eq!(ids, vec!["addons", "app", "cluster", "network"]);
    let reparsed = KeelConfig::from_toml_str(&example.to_toml()).unwrap();
    assert_eq!(reparsed.steps, example.steps);
}

// ===========================================================================
// Errors
// ===========================================================================

#[test]
fn errors_name_their_step() {
    let err = Error::action_failed("cluster", FailureClass::Transient, "throttled");
    assert_eq!(err.step(), Some("cluster"));
    assert!(err.to_string().contains("transient"));

    let wrapped = Error::RollbackIncomplete {
        steps: vec!["network".into()],
        cause: Box::new(err),
    };
    assert_eq!(wrapped.step(), Some("cluster"));
    assert!(wrapped.to_string().contains("network"));
    assert_eq!(Error::ConfirmationRequired.step(), None);
}

#[test]
fn cycle_error_lists_members() {
    let err = Error::CycleDetected { ids: vec!["a".into(), "b".into()] };
    assert_eq!(err.to_string(), "dependency cycle among steps: a, b");
    assert!(err.is_plan_error());
    assert!(!Error::CredentialsExpired.is_plan_error());
}

#[test]
fn failure_class_serde() {
    assert_eq!(serde_json::to_string(&FailureClass::Permanent).unwrap(), r#""permanent""#);
}
