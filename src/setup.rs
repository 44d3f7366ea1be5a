//! Wiring from a loaded config to a ready executor.

use keel_core::{KeelConfig, Result};
use keel_engine::{
    Executor, JsonlSink, Reconciler, RetryPolicy, RunLedger, ShellProbe, ShellRunner, StateStore,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shell-backed executor whose ledger lands in `<ledger_dir>/<run_id>.jsonl`.
pub fn executor(config: &KeelConfig, run_id: &str, cancel: CancellationToken) -> Result<Executor> {
    let runner = Arc::new(ShellRunner::from_config(&config.shell, config.working_dir())?);
    let store = Arc::new(StateStore::open(config.state_file())?);
    let probe = Arc::new(ShellProbe::new(runner.clone(), store.clone()));
    let reconciler = Reconciler::new(
        probe,
        RetryPolicy::new(config.reconcile.clone()),
        cancel.clone(),
    );
    let sink = Arc::new(JsonlSink::for_run(config.ledger_dir(), run_id));
    let ledger = RunLedger::new(run_id, sink);
    Ok(Executor::new(config, runner, reconciler, ledger, store, cancel))
}

/// Cancel `token` on Ctrl-C, or once `timeout_secs` elapse when non-zero.
pub fn watch_for_cancellation(token: CancellationToken, timeout_secs: u64) {
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current action");
            on_signal.cancel();
        }
    });
    if timeout_secs > 0 {
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(timeout_secs)) => {
                    tracing::warn!(
                        timeout_secs,
                        "run timeout reached, stopping after the current action"
                    );
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });
    }
}
