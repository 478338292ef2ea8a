//! Scheduler: job registry, execution units, cron sub-scheduler and the orchestrator.

pub mod cron;
pub mod orchestrator;
pub mod registry;
pub mod unit;

pub use orchestrator::{Orchestrator, OrchestratorState, SchedulerSettings};
pub use registry::{Job, JobInfo, JobKind, JobRegistry};
pub use unit::{UnitContext, UnitExit, run_unit};
