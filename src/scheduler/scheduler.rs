//! Ties the process table to the trigger engines.
//!
//! Each scheduled process owns exactly one trigger registration (a cron
//! entry or a watch handle). `Kill` flips the process to `Stopped`
//! immediately and queues the trigger teardown; the drain task unhooks the
//! engine asynchronously, so a firing racing the kill is stopped by the
//! `try_start` gate instead.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use ::cron::Schedule;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{FleetError, Result};
use crate::promise::IdGenerator;
use crate::scheduler::cron::{self, CronEngine, TriggerFn};
use crate::scheduler::fswatch::WatchEngine;
use crate::scheduler::process::{Process, ProcessInfo, ProcessState, ProcessTable, SpawnKind};
use crate::scheduler::runner::CommandRunner;

/// The engine-side registration backing a process, removed on kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerHandle {
    Cron(u64),
    Watch(usize),
}

pub struct Scheduler {
    table: ProcessTable,
    cron: CronEngine,
    watch: WatchEngine,
    ids: IdGenerator,
    triggers: Mutex<HashMap<i64, TriggerHandle>>,
    kills_tx: mpsc::UnboundedSender<i64>,
    kills_rx: Mutex<Option<mpsc::UnboundedReceiver<i64>>>,
    runner: Arc<dyn CommandRunner>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        node: u64,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let (kills_tx, kills_rx) = mpsc::unbounded_channel();
        Ok(Self {
            table: ProcessTable::new(),
            cron: CronEngine::new(shutdown.clone()),
            watch: WatchEngine::new()?,
            ids: IdGenerator::new(node),
            triggers: Mutex::new(HashMap::new()),
            kills_tx,
            kills_rx: Mutex::new(Some(kills_rx)),
            runner,
            shutdown,
        })
    }

    /// Spawn the background tasks: the kill drain and the watch event pump.
    pub fn start(self: &Arc<Self>) {
        let sched = self.clone();
        tokio::spawn(async move { sched.drain_kills().await });
        let sched = self.clone();
        tokio::spawn(async move { sched.watch.run(sched.shutdown.clone()).await });
    }

    /// Schedule `cmd` on a cron expression. Both 5-field POSIX and 6/7-field
    /// (with seconds) expressions are accepted.
    pub fn create_cron_task(&self, expr: &str, cmd: &str) -> Result<i64> {
        let schedule = Schedule::from_str(&cron::normalize_expr(expr))?;
        let process = Arc::new(Process::new(self.ids.next(), expr, cmd));
        self.table.insert(process.clone());

        let trigger = run_trigger(process.clone(), self.runner.clone(), ProcessState::Ready);
        let entry = self.cron.add(schedule, trigger);
        self.register_trigger(process.pid(), TriggerHandle::Cron(entry));
        process.set_state(ProcessState::Ready);
        tracing::info!(pid = process.pid(), %expr, %cmd, "cron task created");
        Ok(process.pid())
    }

    /// Run `cmd` once, immediately. The process stops itself after the run.
    pub fn create_immediate_task(self: &Arc<Self>, cmd: &str) -> Result<i64> {
        self.spawn_once("@immediately", cmd)
    }

    /// Run a plain script command once, outside any trigger engine.
    pub fn spawn_script_task(self: &Arc<Self>, cmd: &str) -> Result<i64> {
        self.spawn_once("script", cmd)
    }

    fn spawn_once(self: &Arc<Self>, spec: &str, cmd: &str) -> Result<i64> {
        let process = Arc::new(Process::new(self.ids.next(), spec, cmd));
        self.table.insert(process.clone());
        let runner = self.runner.clone();
        let task = process.clone();
        tokio::spawn(async move {
            if !task.try_start() {
                return;
            }
            if let Err(err) = runner.run(task.spec(), task.cmd()).await {
                tracing::warn!(pid = task.pid(), %err, "one-shot command failed");
                task.set_state(ProcessState::Suspended);
                return;
            }
            task.set_state(ProcessState::Stopped);
        });
        tracing::info!(pid = process.pid(), %cmd, "one-shot task spawned");
        Ok(process.pid())
    }

    /// Run `cmd` whenever something changes under any of `paths`.
    pub fn create_fs_listen_task(&self, paths: &[String], cmd: &str) -> Result<i64> {
        if paths.is_empty() {
            return Err(FleetError::Internal("no paths to watch".to_string()));
        }
        let process = Arc::new(Process::new(self.ids.next(), paths.join(","), cmd));
        self.table.insert(process.clone());

        let trigger = run_trigger(process.clone(), self.runner.clone(), ProcessState::Wait);
        let handle = self.watch.add(paths, trigger)?;
        self.register_trigger(process.pid(), TriggerHandle::Watch(handle));
        process.set_state(ProcessState::Wait);
        tracing::info!(pid = process.pid(), watch = %process.spec(), %cmd, "fs task created");
        Ok(process.pid())
    }

    /// Create a process from its wire description, as carried by spawn
    /// requests. Cron and fs kinds take `spec`; scripts ignore it.
    pub fn spawn(self: &Arc<Self>, kind: SpawnKind, spec: &str, cmd: &str) -> Result<i64> {
        match kind {
            SpawnKind::Cron => self.create_cron_task(spec, cmd),
            SpawnKind::Fs => {
                let paths: Vec<String> = spec.split(',').map(|s| s.trim().to_string()).collect();
                self.create_fs_listen_task(&paths, cmd)
            }
            SpawnKind::Script => self.spawn_script_task(cmd),
        }
    }

    /// Stop a process. The state flips synchronously; the trigger
    /// registration is torn down by the drain task. Killing an already
    /// stopped process is a no-op.
    pub fn kill(&self, pid: i64) -> Result<()> {
        let process = self
            .table
            .get(pid)
            .ok_or(FleetError::ProcessNotFound(pid))?;
        process.set_state(ProcessState::Stopped);
        // Send fails only after shutdown, when the engines are gone anyway.
        let _ = self.kills_tx.send(pid);
        tracing::info!(pid, "process killed");
        Ok(())
    }

    pub fn find_by_pid(&self, pid: i64) -> Option<ProcessInfo> {
        self.table.get(pid).map(|p| p.info())
    }

    pub fn find_by_cmd(&self, cmd: &str) -> Vec<ProcessInfo> {
        self.table
            .find_by_cmd(cmd)
            .into_iter()
            .map(|p| p.info())
            .collect()
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        self.table.snapshot()
    }

    fn register_trigger(&self, pid: i64, handle: TriggerHandle) {
        let mut triggers = self.triggers.lock().expect("trigger map lock poisoned");
        if triggers.insert(pid, handle).is_some() {
            panic!("duplicate trigger for pid {pid}");
        }
    }

    async fn drain_kills(&self) {
        let Some(mut rx) = self.kills_rx.lock().expect("kill queue lock poisoned").take() else {
            return;
        };
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                pid = rx.recv() => {
                    let Some(pid) = pid else { return };
                    let handle = self
                        .triggers
                        .lock()
                        .expect("trigger map lock poisoned")
                        .remove(&pid);
                    match handle {
                        Some(TriggerHandle::Cron(id)) => self.cron.remove(id),
                        Some(TriggerHandle::Watch(id)) => self.watch.remove(id),
                        None => {}
                    }
                }
            }
        }
    }
}

/// Trigger callback shared by the cron and fs engines: gate on `try_start`,
/// run the command, settle into `rest` (or `Suspended` on failure).
fn run_trigger(process: Arc<Process>, runner: Arc<dyn CommandRunner>, rest: ProcessState) -> TriggerFn {
    Arc::new(move || {
        let process = process.clone();
        let runner = runner.clone();
        Box::pin(async move {
            if !process.try_start() {
                tracing::debug!(pid = process.pid(), "trigger fired on stopped process");
                return;
            }
            match runner.run(process.spec(), process.cmd()).await {
                Ok(_) => process.set_state(rest),
                Err(err) => {
                    tracing::warn!(pid = process.pid(), %err, "scheduled command failed");
                    process.set_state(ProcessState::Suspended);
                }
            }
        })
    })
}
