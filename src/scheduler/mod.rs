//! Process scheduling: cron and filesystem triggers driving shell commands,
//! tracked in a process table keyed by snowflake PIDs.

pub mod cron;
pub mod fswatch;
pub mod process;
pub mod runner;
#[allow(clippy::module_inception)]
pub mod scheduler;

pub use process::{Process, ProcessInfo, ProcessState, ProcessTable, SpawnKind};
pub use runner::{CommandRunner, ShellRunner};
pub use scheduler::Scheduler;
