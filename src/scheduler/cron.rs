//! Cron trigger engine: one timer task per registered entry, cancelled
//! through a per-entry token so `Kill` can unhook the right schedule.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use cron::Schedule;
use tokio_util::sync::CancellationToken;

/// An async trigger callback. The engine awaits it inline, so firings of the
/// same entry never overlap.
pub type TriggerFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct CronEngine {
    entries: Mutex<HashMap<u64, CancellationToken>>,
    next_entry: AtomicU64,
    shutdown: CancellationToken,
}

impl CronEngine {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_entry: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Register a schedule and return the entry handle for later removal.
    pub fn add(&self, schedule: Schedule, trigger: TriggerFn) -> u64 {
        let id = self.next_entry.fetch_add(1, Ordering::SeqCst);
        let token = self.shutdown.child_token();
        self.entries
            .lock()
            .expect("cron entries lock poisoned")
            .insert(id, token.clone());

        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    tracing::debug!(entry = id, "schedule exhausted");
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(wait) => trigger().await,
                }
            }
        });
        id
    }

    /// Cancel the entry's timer task. Unknown handles are ignored.
    pub fn remove(&self, id: u64) {
        if let Some(token) = self
            .entries
            .lock()
            .expect("cron entries lock poisoned")
            .remove(&id)
        {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("cron entries lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accept both 5-field POSIX expressions and the 6/7-field form with
/// seconds; POSIX expressions get an implicit `0` seconds column.
pub fn normalize_expr(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn normalize_adds_seconds_to_posix_expr() {
        assert_eq!(normalize_expr("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_expr("* * * * * *"), "* * * * * *");
    }

    #[tokio::test]
    async fn entry_fires_and_remove_cancels() {
        let engine = CronEngine::new(CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let schedule = Schedule::from_str("* * * * * *").unwrap();
        let id = engine.add(
            schedule,
            Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        // An every-second schedule must fire within two seconds.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(fired.load(Ordering::SeqCst) >= 1);

        engine.remove(id);
        let after = fired.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        // At most one in-flight firing may land after removal.
        assert!(fired.load(Ordering::SeqCst) <= after + 1);
        assert!(engine.is_empty());
    }
}
