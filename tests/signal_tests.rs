//! Signal-stream semantics shared across tasks.

use std::sync::Arc;

use fleetd::signal::SignalStream;

#[tokio::test]
async fn notify_is_visible_to_every_waiter() {
    let signals = Arc::new(SignalStream::new());
    signals.notify("release");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let signals = signals.clone();
        handles.push(tokio::spawn(async move { signals.wait("release") }));
    }
    for handle in handles {
        assert!(handle.await.unwrap(), "a raised signal stays raised");
    }
}

#[test]
fn wait_then_notify_then_clear() {
    let signals = SignalStream::new();

    assert!(!signals.wait("build-done"));
    assert_eq!(signals.info("build-done"), (false, true));

    signals.notify("build-done");
    assert!(signals.wait("build-done"));
    assert_eq!(signals.info("build-done"), (true, true));

    signals.clear(&["build-done"]);
    assert_eq!(signals.info("build-done"), (false, false));
    assert!(signals.list().is_empty());
}

#[test]
fn clear_is_selective() {
    let signals = SignalStream::new();
    signals.notify("a");
    signals.notify("b");
    signals.notify("c");
    signals.clear(&["a", "c"]);
    assert_eq!(signals.list(), vec!["b".to_string()]);
}
