//! Integration tests: the `keel` binary against marker-file steps.
//!
//! Each step's "resource" is a file in a scratch directory, so apply,
//! rerun, failure rollback and teardown can be observed from outside.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn keel_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_keel"))
}

fn keel(dir: &Path, args: &[&str]) -> Output {
    Command::new(keel_bin())
        .args(args)
        .current_dir(dir)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("failed to run keel: {e}"))
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).to_string()
}

fn marker_step(id: &str, deps: &[&str], apply: Option<&str>) -> String {
    let deps = deps
        .iter()
        .map(|d| format!("\"{d}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let apply = apply
        .map(String::from)
        .unwrap_or_else(|| format!("printf '%s' \"$KEEL_IDEMPOTENCY_KEY\" > {id}.done"));
    format!(
        r#"
[steps.{id}]
depends_on = [{deps}]
apply = '''{apply}'''
destroy = "rm -f {id}.done"
query = '''if [ -f {id}.done ]; then printf '{{"key":"%s"}}' "$(cat {id}.done)"; else exit 3; fi'''
"#
    )
}

fn write_config(dir: &Path, steps: &[String]) {
    let mut content = String::from(
        "[retry]\nmax_attempts = 2\nbase_ms = 1\nmax_ms = 1\n\n[reconcile]\nbase_ms = 1\nmax_ms = 1\n",
    );
    for step in steps {
        content.push_str(step);
    }
    std::fs::write(dir.join("keel.toml"), content).unwrap();
}

fn reference_config(dir: &Path, app_apply: Option<&str>) {
    write_config(
        dir,
        &[
            marker_step("network", &[], None),
            marker_step("cluster", &["network"], None),
            marker_step("addons", &["cluster"], None),
            marker_step("app", &["cluster", "addons"], app_apply),
        ],
    );
}

fn reports(dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = std::fs::read_dir(dir.join(".keel/runs"))
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|x| x == "yaml").unwrap_or(false))
        .collect();
    found.sort();
    found
}

// ===========================================================================
// init / plan
// ===========================================================================

#[test]
fn init_prints_a_valid_config() {
    let tmp = tempfile::tempdir().unwrap();
    let out = keel(tmp.path(), &["init"]);
    assert!(out.status.success());
    std::fs::write(tmp.path().join("keel.toml"), &out.stdout).unwrap();

    let plan = keel(tmp.path(), &["plan"]);
    assert!(plan.status.success(), "{}", stderr(&plan));
    let text = stdout(&plan);
    let order: Vec<&str> = text
        .lines()
        .map(|l| l.split_whitespace().nth(1).unwrap())
        .collect();
    assert_eq!(order, vec!["network", "cluster", "addons", "app"]);
}

#[test]
fn plan_reconcile_shows_live_state() {
    let tmp = tempfile::tempdir().unwrap();
    reference_config(tmp.path(), None);
    std::fs::write(tmp.path().join("network.done"), "not-the-key").unwrap();

    let out = keel(tmp.path(), &["plan", "--reconcile"]);
    assert!(out.status.success(), "{}", stderr(&out));
    let text = stdout(&out);
    assert!(text.lines().next().unwrap().contains("state=conflicting"));
    assert!(text.contains("state=absent"));
    assert!(!tmp.path().join("cluster.done").exists());
}

#[test]
fn cycle_exits_with_two_and_names_members() {
    let tmp = tempfile::tempdir().unwrap();
    write_config(
        tmp.path(),
        &[
            marker_step("a", &["b"], None),
            marker_step("b", &["a"], None),
            marker_step("c", &["b"], None),
        ],
    );
    let out = keel(tmp.path(), &["apply"]);
    assert_eq!(out.status.code(), Some(2));
    let err = stderr(&out);
    assert!(err.contains("a, b"), "{err}");
    assert!(!err.contains("b, c"));
}

#[test]
fn missing_config_exits_with_two() {
    let tmp = tempfile::tempdir().unwrap();
    let out = keel(tmp.path(), &["plan"]);
    assert_eq!(out.status.code(), Some(2));
}

// ===========================================================================
// apply / destroy
// ===========================================================================

#[test]
fn apply_then_rerun_then_destroy() {
    let tmp = tempfile::tempdir().unwrap();
    reference_config(tmp.path(), None);

    let first = keel(tmp.path(), &["apply"]);
    assert_eq!(first.status.code(), Some(0), "{}", stderr(&first));
    for id in ["network", "cluster", "addons", "app"] {
        assert!(tmp.path().join(format!("{id}.done")).exists());
    }
    let stamp = std::fs::metadata(tmp.path().join("app.done")).unwrap().modified().unwrap();

    let second = keel(tmp.path(), &["apply"]);
    assert_eq!(second.status.code(), Some(0));
    assert!(stdout(&second).contains("skipped"));
    assert!(!stdout(&second).contains("applied"));
    let restamp = std::fs::metadata(tmp.path().join("app.done")).unwrap().modified().unwrap();
    assert_eq!(stamp, restamp);
    assert_eq!(reports(tmp.path()).len(), 2);

    let refused = keel(tmp.path(), &["destroy", "--confirm", "yes"]);
    assert_eq!(refused.status.code(), Some(1));
    assert!(stderr(&refused).contains("confirmation"));
    assert!(tmp.path().join("network.done").exists());

    let down = keel(tmp.path(), &["destroy", "--confirm", "DESTROY"]);
    assert_eq!(down.status.code(), Some(0), "{}", stderr(&down));
    for id in ["network", "cluster", "addons", "app"] {
        assert!(!tmp.path().join(format!("{id}.done")).exists());
    }
}

#[test]
fn destroy_that_leaves_a_step_in_place_exits_one() {
    let tmp = tempfile::tempdir().unwrap();
    let keep = r#"
[steps.keep]
apply = "touch keep.done"
query = '''if [ -f keep.done ]; then exit 0; else exit 3; fi'''
"#;
    write_config(tmp.path(), &[marker_step("network", &[], None), keep.to_string()]);
    assert!(keel(tmp.path(), &["apply"]).status.success());

    let down = keel(tmp.path(), &["destroy", "--confirm", "DESTROY"]);
    assert_eq!(down.status.code(), Some(1));
    assert!(stderr(&down).contains("keep"));
    assert!(tmp.path().join("keep.done").exists());
    assert!(!tmp.path().join("network.done").exists());
}

#[test]
fn failing_step_rolls_back_and_exits_one() {
    let tmp = tempfile::tempdir().unwrap();
    reference_config(tmp.path(), Some("echo 'image pull denied' >&2; exit 1"));

    let out = keel(tmp.path(), &["apply"]);
    assert_eq!(out.status.code(), Some(1));
    let summary = stdout(&out);
    assert!(summary.contains("halted at 'app'"), "{summary}");
    assert!(summary.contains("rolled_back"));
    assert!(stderr(&out).contains("image pull denied"));
    for id in ["network", "cluster", "addons"] {
        assert!(!tmp.path().join(format!("{id}.done")).exists(), "{id} left behind");
    }

    let report = std::fs::read_to_string(&reports(tmp.path())[0]).unwrap();
    assert!(report.contains("outcome: halted"));
    assert!(report.contains("step: app"));
}

#[test]
fn ledger_command_prints_entries() {
    let tmp = tempfile::tempdir().unwrap();
    reference_config(tmp.path(), None);
    assert!(keel(tmp.path(), &["apply"]).status.success());

    let ledger = reports(tmp.path())[0].with_extension("jsonl");
    let out = keel(tmp.path(), &["ledger", ledger.to_str().unwrap()]);
    assert!(out.status.success());
    let text = stdout(&out);
    assert_eq!(text.lines().filter(|l| l.contains("succeeded")).count(), 4);
    assert!(!text.contains("never completed"));
}
