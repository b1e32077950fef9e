//! User-visible named signals: a level-triggered cousin of the correlation
//! table. A signal that has been notified stays true until explicitly
//! cleared, so build steps on different nodes can rendezvous on a name
//! without racing the observation.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct SignalStream {
    signals: RwLock<HashMap<String, bool>>,
}

impl SignalStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the current truth value of `sig`, registering it as false if
    /// it has never been seen. Non-blocking single check; callers that want
    /// to block poll this repeatedly.
    pub fn wait(&self, sig: &str) -> bool {
        {
            let signals = self.signals.read().expect("signal lock poisoned");
            if let Some(&v) = signals.get(sig) {
                return v;
            }
        }
        let mut signals = self.signals.write().expect("signal lock poisoned");
        *signals.entry(sig.to_string()).or_insert(false)
    }

    /// Set `sig` true. Idempotent; signals are monotonic until cleared.
    pub fn notify(&self, sig: &str) {
        let mut signals = self.signals.write().expect("signal lock poisoned");
        signals.insert(sig.to_string(), true);
    }

    /// Current value plus whether the signal has ever been registered.
    pub fn info(&self, sig: &str) -> (bool, bool) {
        let signals = self.signals.read().expect("signal lock poisoned");
        match signals.get(sig) {
            Some(&v) => (v, true),
            None => (false, false),
        }
    }

    /// Remove the named signals. The only way a true signal becomes unset.
    pub fn clear<S: AsRef<str>>(&self, sigs: &[S]) {
        let mut signals = self.signals.write().expect("signal lock poisoned");
        for sig in sigs {
            signals.remove(sig.as_ref());
        }
    }

    pub fn list(&self) -> Vec<String> {
        let signals = self.signals.read().expect("signal lock poisoned");
        let mut names: Vec<String> = signals.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_registers_unseen_signal_as_false() {
        let s = SignalStream::new();
        assert!(!s.wait("build-done"));
        let (value, exists) = s.info("build-done");
        assert!(!value);
        assert!(exists);
    }

    #[test]
    fn notify_is_monotonic() {
        let s = SignalStream::new();
        s.notify("build-done");
        assert!(s.wait("build-done"));
        assert!(s.wait("build-done"));
        s.notify("build-done");
        assert!(s.wait("build-done"));
    }

    #[test]
    fn clear_removes_signal() {
        let s = SignalStream::new();
        s.notify("a");
        s.notify("b");
        s.clear(&["a"]);
        assert_eq!(s.info("a"), (false, false));
        assert_eq!(s.info("b"), (true, true));
        assert_eq!(s.list(), vec!["b".to_string()]);
    }

    #[test]
    fn list_is_sorted() {
        let s = SignalStream::new();
        s.notify("zeta");
        s.wait("alpha");
        assert_eq!(s.list(), vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
