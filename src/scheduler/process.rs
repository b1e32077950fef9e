//! Process table: every scheduled unit of work, keyed by snowflake PID.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Lifecycle of a scheduled process.
///
/// `New → Ready` on trigger registration, `Ready/Wait → Running` on a
/// firing, back to `Ready` (cron) or `Wait` (fs watch) on success,
/// `Suspended` on command failure, `Stopped` only through kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Suspended,
    Wait,
    Stopped,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::New => write!(f, "new"),
            ProcessState::Ready => write!(f, "ready"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Suspended => write!(f, "suspended"),
            ProcessState::Wait => write!(f, "wait"),
            ProcessState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Which trigger source drives a spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnKind {
    Cron,
    Fs,
    Script,
}

impl std::fmt::Display for SpawnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnKind::Cron => write!(f, "cron"),
            SpawnKind::Fs => write!(f, "fs"),
            SpawnKind::Script => write!(f, "script"),
        }
    }
}

/// A scheduled process. The state cell is shared with the trigger callback
/// that fires it; `Kill` is the only external mutation path.
#[derive(Debug)]
pub struct Process {
    pid: i64,
    spec: String,
    cmd: String,
    state: Mutex<ProcessState>,
}

impl Process {
    pub fn new(pid: i64, spec: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            pid,
            spec: spec.into(),
            cmd: cmd.into(),
            state: Mutex::new(ProcessState::New),
        }
    }

    pub fn pid(&self) -> i64 {
        self.pid
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock().expect("process state lock poisoned")
    }

    pub fn set_state(&self, state: ProcessState) {
        *self.state.lock().expect("process state lock poisoned") = state;
    }

    /// Transition to Running unless the process has been stopped. Trigger
    /// callbacks gate on this so a kill that lands first wins.
    pub fn try_start(&self) -> bool {
        let mut state = self.state.lock().expect("process state lock poisoned");
        if *state == ProcessState::Stopped {
            return false;
        }
        *state = ProcessState::Running;
        true
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            state: self.state(),
            spec: self.spec.clone(),
            cmd: self.cmd.clone(),
        }
    }
}

/// Serializable snapshot of a process, as carried over the wire and
/// returned by `processlist`/`processfind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i64,
    pub state: ProcessState,
    pub spec: String,
    pub cmd: String,
}

/// Table of live processes. Duplicate PIDs indicate state-machine
/// corruption and abort the daemon.
#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: Mutex<HashMap<i64, Arc<Process>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, process: Arc<Process>) {
        let mut processes = self.processes.lock().expect("process table lock poisoned");
        if processes.contains_key(&process.pid()) {
            panic!("duplicate pid {}", process.pid());
        }
        processes.insert(process.pid(), process);
    }

    pub fn get(&self, pid: i64) -> Option<Arc<Process>> {
        self.processes
            .lock()
            .expect("process table lock poisoned")
            .get(&pid)
            .cloned()
    }

    pub fn find_by_cmd(&self, cmd: &str) -> Vec<Arc<Process>> {
        let processes = self.processes.lock().expect("process table lock poisoned");
        let mut hits: Vec<Arc<Process>> = processes
            .values()
            .filter(|p| p.cmd().contains(cmd))
            .cloned()
            .collect();
        hits.sort_by_key(|p| p.pid());
        hits
    }

    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        let processes = self.processes.lock().expect("process table lock poisoned");
        let mut infos: Vec<ProcessInfo> = processes.values().map(|p| p.info()).collect();
        infos.sort_by_key(|i| i.pid);
        infos
    }

    pub fn len(&self) -> usize {
        self.processes
            .lock()
            .expect("process table lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_start_respects_stopped() {
        let p = Process::new(1, "* * * * * *", "echo hi");
        assert!(p.try_start());
        assert_eq!(p.state(), ProcessState::Running);
        p.set_state(ProcessState::Stopped);
        assert!(!p.try_start());
        assert_eq!(p.state(), ProcessState::Stopped);
    }

    #[test]
    fn find_by_cmd_matches_substring() {
        let table = ProcessTable::new();
        table.insert(Arc::new(Process::new(1, "spec", "echo build")));
        table.insert(Arc::new(Process::new(2, "spec", "make test")));
        let hits = table.find_by_cmd("build");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pid(), 1);
    }

    #[test]
    fn state_spelling_matches_on_every_wire_path() {
        // JSON bodies and the proto `state` string must agree, and both use
        // the Display spelling.
        for state in [
            ProcessState::New,
            ProcessState::Ready,
            ProcessState::Running,
            ProcessState::Suspended,
            ProcessState::Wait,
            ProcessState::Stopped,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
            let back: ProcessState = serde_json::from_str(&json).unwrap();
            assert_eq!(back, state);
        }
    }

    #[test]
    #[should_panic(expected = "duplicate pid")]
    fn duplicate_pid_panics() {
        let table = ProcessTable::new();
        table.insert(Arc::new(Process::new(1, "a", "b")));
        table.insert(Arc::new(Process::new(1, "a", "b")));
    }
}
