//! Filesystem trigger engine.
//!
//! Watched roots are registered recursively; when an event arrives the
//! engine walks the event path's ancestor chain until it hits a registered
//! root, then fires that root's callbacks. Bursty editors and copy tools
//! emit several events per logical write, so firings are debounced per
//! handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::scheduler::cron::TriggerFn;

const DEBOUNCE: Duration = Duration::from_millis(200);

struct WatchHandle {
    enabled: bool,
    last_fired: Option<Instant>,
    trigger: TriggerFn,
}

pub struct WatchEngine {
    watcher: Mutex<RecommendedWatcher>,
    handles: Arc<Mutex<Vec<WatchHandle>>>,
    routes: Arc<Mutex<HashMap<PathBuf, Vec<usize>>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl WatchEngine {
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(err) => tracing::warn!(%err, "watch backend error"),
        })?;
        Ok(Self {
            watcher: Mutex::new(watcher),
            handles: Arc::new(Mutex::new(Vec::new())),
            routes: Arc::new(Mutex::new(HashMap::new())),
            events: Mutex::new(Some(rx)),
        })
    }

    /// Watch `paths` recursively and fire `trigger` on changes beneath any
    /// of them. Returns the handle used by [`remove`](Self::remove).
    pub fn add(&self, paths: &[impl AsRef<Path>], trigger: TriggerFn) -> Result<usize> {
        let id = {
            let mut handles = self.handles.lock().expect("watch handles lock poisoned");
            handles.push(WatchHandle {
                enabled: true,
                last_fired: None,
                trigger,
            });
            handles.len() - 1
        };

        let mut watcher = self.watcher.lock().expect("watcher lock poisoned");
        let mut routes = self.routes.lock().expect("watch routes lock poisoned");
        for path in paths {
            // Event paths come back canonical, so register them that way.
            let canonical = std::fs::canonicalize(path.as_ref())
                .unwrap_or_else(|_| path.as_ref().to_path_buf());
            watcher.watch(&canonical, RecursiveMode::Recursive)?;
            routes.entry(canonical).or_default().push(id);
        }
        Ok(id)
    }

    /// Disable a handle. The underlying OS watch stays registered; events
    /// routed to a disabled handle are dropped.
    pub fn remove(&self, id: usize) {
        let mut handles = self.handles.lock().expect("watch handles lock poisoned");
        if let Some(handle) = handles.get_mut(id) {
            handle.enabled = false;
        }
    }

    /// Pump events until cancelled. Call once; later calls return
    /// immediately because the receiver has already been claimed.
    pub async fn run(&self, shutdown: CancellationToken) {
        let Some(mut rx) = self.events.lock().expect("watch events lock poisoned").take() else {
            return;
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = rx.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => return,
                },
            }
        }
    }

    /// Each firing runs on its own task so a long-running trigger never
    /// stalls the pump; the callbacks' own `try_start` gate and the
    /// per-handle debounce keep concurrent firings from overlapping.
    fn dispatch(&self, event: Event) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }
        for path in &event.paths {
            for trigger in self.route(path) {
                tokio::spawn(trigger());
            }
        }
    }

    /// Resolve the triggers to fire for one event path: walk ancestors up
    /// to a registered root, debounce, and collect enabled callbacks.
    fn route(&self, path: &Path) -> Vec<TriggerFn> {
        let routes = self.routes.lock().expect("watch routes lock poisoned");
        let mut cursor = Some(path);
        let ids = loop {
            let Some(current) = cursor else {
                return Vec::new();
            };
            if let Some(ids) = routes.get(current) {
                break ids.clone();
            }
            cursor = current.parent();
        };
        drop(routes);

        let now = Instant::now();
        let mut handles = self.handles.lock().expect("watch handles lock poisoned");
        ids.iter()
            .filter_map(|&id| {
                let handle = handles.get_mut(id)?;
                if !handle.enabled {
                    return None;
                }
                if let Some(last) = handle.last_fired {
                    if now.duration_since(last) < DEBOUNCE {
                        return None;
                    }
                }
                handle.last_fired = Some(now);
                Some(handle.trigger.clone())
            })
            .collect()
    }
}
