//! keel - idempotent infrastructure lifecycle orchestrator
//!
//! Usage:
//!   keel init                       → print a sample keel.toml
//!   keel plan [--reconcile]         → show the step order (and live state)
//!   keel apply                      → bring every step to its desired state
//!   keel destroy --confirm DESTROY  → tear everything down in reverse order
//!   keel ledger <file>              → inspect a run ledger

use anyhow::Context;
use clap::{Parser, Subcommand};
use keel::cli;
use keel::setup;
use keel_core::{CredentialContext, KeelConfig};
use keel_engine::{Plan, RunLedger, RunReport};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "keel",
    about = "Idempotent, dependency-ordered infrastructure lifecycle runs",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the keel config file (TOML)
    #[arg(short, long, global = true, default_value = "keel.toml")]
    config: PathBuf,

    /// Also write logs to this file (in addition to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a sample configuration
    Init,
    /// Print the planned step order
    Plan {
        /// Query live state for every step (no changes are made)
        #[arg(long)]
        reconcile: bool,
    },
    /// Apply every step, skipping what is already in place
    Apply,
    /// Destroy every step in reverse order
    Destroy {
        /// Confirmation token; must match run.confirmation_sentinel
        #[arg(long, default_value = "")]
        confirm: String,
    },
    /// Print a ledger file and any actions it left unfinished
    Ledger { path: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    let _guard = init_tracing(args.log_file.as_deref());

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(cli::error_exit_code(&e))
        }
    }
}

fn init_tracing(log_file: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "keel=info,keel_core=info,keel_engine=info".into());
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "keel.log".into());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .init();
    guard
}

async fn run(args: Cli) -> anyhow::Result<u8> {
    if let Commands::Init = args.command {
        print!("{}", KeelConfig::example().to_toml());
        return Ok(cli::EXIT_OK);
    }
    if let Commands::Ledger { path } = &args.command {
        let entries = RunLedger::load(path)
            .with_context(|| format!("reading ledger {}", path.display()))?;
        print!("{}", cli::render_ledger(&entries));
        return Ok(cli::EXIT_OK);
    }

    let config = KeelConfig::load(&args.config)?;
    let plan = Plan::build(&config.steps)?;

    match args.command {
        Commands::Plan { reconcile: false } => {
            print!("{}", cli::render_plan(&plan, None));
            Ok(cli::EXIT_OK)
        }
        Commands::Plan { reconcile: true } => {
            let credentials = acquire_credentials(&config).await?;
            let cancel = CancellationToken::new();
            setup::watch_for_cancellation(cancel.clone(), config.run.timeout_secs);
            let executor = setup::executor(&config, &RunLedger::new_run_id(), cancel)?;
            let observed = executor.preview(&plan, &credentials).await;
            credentials.invalidate();
            print!("{}", cli::render_plan(&plan, Some(observed?.as_slice())));
            Ok(cli::EXIT_OK)
        }
        Commands::Apply => {
            warn_if_interrupted(&config.ledger_dir());
            let credentials = acquire_credentials(&config).await?;
            let mut executor = start_run(&config)?;
            let report = executor.apply(&plan, &credentials).await;
            credentials.invalidate();
            finish(&config, &report)
        }
        Commands::Destroy { confirm } => {
            warn_if_interrupted(&config.ledger_dir());
            let credentials = if confirm == config.run.confirmation_sentinel {
                acquire_credentials(&config).await?
            } else {
                Arc::new(CredentialContext::empty())
            };
            let mut executor = start_run(&config)?;
            let report = executor.teardown(&plan, &credentials, &confirm).await;
            credentials.invalidate();
            finish(&config, &report)
        }
        Commands::Init | Commands::Ledger { .. } => Ok(cli::EXIT_OK),
    }
}

async fn acquire_credentials(config: &KeelConfig) -> anyhow::Result<Arc<CredentialContext>> {
    let ctx = CredentialContext::acquire(
        &config.credentials,
        &config.shell.program,
        &config.working_dir(),
    )
    .await?;
    Ok(Arc::new(ctx))
}

fn start_run(config: &KeelConfig) -> anyhow::Result<keel_engine::Executor> {
    let run_id = RunLedger::new_run_id();
    let cancel = CancellationToken::new();
    setup::watch_for_cancellation(cancel.clone(), config.run.timeout_secs);
    tracing::info!(run_id = %run_id, ledger_dir = %config.ledger_dir().display(), "run starting");
    Ok(setup::executor(config, &run_id, cancel)?)
}

fn warn_if_interrupted(ledger_dir: &Path) {
    if let Some((path, dangling)) = cli::interrupted_run(ledger_dir) {
        tracing::warn!(
            ledger = %path.display(),
            count = dangling.len(),
            "previous run left actions unfinished"
        );
        for entry in &dangling {
            eprintln!(
                "warning: {} {} attempt {} may have been interrupted (see {})",
                entry.step,
                entry.action,
                entry.attempt,
                path.display()
            );
        }
    }
}

fn finish(config: &KeelConfig, report: &RunReport) -> anyhow::Result<u8> {
    let path = cli::write_report(&config.ledger_dir(), report)
        .with_context(|| format!("writing report for run {}", report.run_id))?;
    print!("{}", report.render_summary());
    println!("report: {}", path.display());
    if let Some(halt) = &report.halt {
        eprintln!("error: {}", halt.reason);
    }
    Ok(cli::report_exit_code(report))
}
