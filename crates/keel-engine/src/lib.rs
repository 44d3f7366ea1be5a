//! keel engine - planning, reconciliation and execution of lifecycle steps.

pub mod action;
pub mod executor;
pub mod ledger;
pub mod planner;
pub mod reconciler;
pub mod report;
pub mod retry;
pub mod state;

pub use action::{ActionFailure, ActionOutput, ActionRequest, ActionRunner, ShellRunner};
pub use executor::Executor;
pub use ledger::{dangling_attempts, JsonlSink, LedgerEntry, LedgerSink, Outcome, RunLedger};
pub use planner::Plan;
pub use reconciler::{classify, ProbeError, ProbeReport, Reconciler, ShellProbe, StateProbe};
pub use report::{FinalState, HaltInfo, RunMode, RunOutcome, RunReport, StepReport};
pub use retry::RetryPolicy;
pub use state::{StateRecord, StateStore};
