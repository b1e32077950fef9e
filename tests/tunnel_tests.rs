//! End-to-end relay scenario: a private node keeps a tunnel open to a public
//! relay, and a third party reaches it by calling through the relay.

use std::time::Duration;

use fleetd::config::NodeConfig;
use fleetd::net::PeerClient;

mod test_harness;
use test_harness::{eventually, free_port, TestDaemon};

/// Spawn a public relay plus a private worker tunneled into it, waiting until
/// the worker's proxy client is registered on the relay.
async fn relay_pair() -> (TestDaemon, TestDaemon) {
    let mut relay_cfg = NodeConfig::new("relay", free_port());
    relay_cfg.public = true;
    let relay = TestDaemon::spawn(relay_cfg).await;

    let worker_cfg = NodeConfig::new("worker", free_port()).with_peer(
        "relay",
        relay.addr.to_string(),
        true,
    );
    let worker = TestDaemon::spawn(worker_cfg).await;

    let registered = eventually(Duration::from_secs(5), || {
        relay.state.registry().names().contains(&"worker".to_string())
    })
    .await;
    assert!(registered, "worker never established its tunnel");
    (relay, worker)
}

#[tokio::test]
async fn call_is_relayed_over_the_tunnel() {
    let (relay, worker) = relay_pair().await;
    let pid = worker
        .state
        .scheduler()
        .create_cron_task("* * * * * *", "echo hi")
        .unwrap();

    let client = relay.client();
    // Dispatch lands on the worker via its tunnel and answers with its own
    // process table.
    let ret = call_until_ok(&client, "worker", "processlist", &[]).await;
    assert!(ret.contains("echo hi"), "unexpected table: {ret}");
    assert!(ret.contains(&pid.to_string()));
}

#[tokio::test]
async fn signals_travel_through_the_relay() {
    let (relay, worker) = relay_pair().await;
    let client = relay.client();

    call_until_ok(
        &client,
        "worker",
        "signalnotify",
        &["deploy-ready".to_string()],
    )
    .await;
    assert!(worker.state.signals().wait("deploy-ready"));

    let ret = call_until_ok(
        &client,
        "worker",
        "signalinfo",
        &["deploy-ready".to_string()],
    )
    .await;
    assert_eq!(ret, "[true,true]");
}

#[tokio::test]
async fn worker_identity_is_reachable_by_name() {
    let (relay, _worker) = relay_pair().await;
    let client = relay.client();
    let ret = call_until_ok(&client, "worker", "info", &[]).await;
    assert_eq!(ret, "worker");
}

#[tokio::test]
async fn unknown_method_is_rejected_not_swallowed() {
    let (relay, _worker) = relay_pair().await;
    let client = relay.client();
    // Dispatch happens on the relay before any frame is sent: an unknown
    // method on the relay itself is rejected immediately.
    let err = client.call("relay", "frobnicate", &[]).await.unwrap_err();
    assert!(err.to_string().contains("invalid method"));
}

/// The tunnel may still be draining its first Establish when the test
/// starts; retry the call until the relay can answer it.
async fn call_until_ok(
    client: &fleetd::net::DirectClient,
    node: &str,
    method: &str,
    args: &[String],
) -> String {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match client.call(node, method, args).await {
            Ok(ret) => return ret,
            Err(err) if tokio::time::Instant::now() < deadline => {
                eprintln!("call {method} not ready yet: {err}");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(err) => panic!("call {method} never succeeded: {err}"),
        }
    }
}
