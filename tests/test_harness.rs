//! Test harness for in-process fleetd daemons.
//!
//! Spawns full daemons on loopback ports and hands back their shared state
//! so tests can assert on registries, signals and schedulers directly.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fleetd::config::NodeConfig;
use fleetd::net::{DirectClient, PeerClient};
use fleetd::node::{Node, NodeState};

/// Reserve a loopback port for a daemon about to start.
pub fn free_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr")
}

/// Handle to a running test daemon.
pub struct TestDaemon {
    pub name: String,
    pub addr: SocketAddr,
    pub state: Arc<NodeState>,
    shutdown: CancellationToken,
}

impl TestDaemon {
    /// Start a daemon with the given config and wait until it answers pings.
    pub async fn spawn(config: NodeConfig) -> TestDaemon {
        let addr = config.listen_addr;
        let name = config.name.clone();
        let shutdown = CancellationToken::new();
        let node = Node::new(config, shutdown.clone()).expect("node construction");
        let state = node.state();
        tokio::spawn(async move {
            if let Err(err) = node.run().await {
                eprintln!("test daemon exited: {err}");
            }
        });
        wait_ready(addr).await;
        TestDaemon {
            name,
            addr,
            state,
            shutdown,
        }
    }

    /// A fresh direct client pointed at this daemon.
    pub fn client(&self) -> DirectClient {
        DirectClient::connect(&self.name, self.addr.to_string()).expect("client")
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn wait_ready(addr: SocketAddr) {
    let client = DirectClient::connect("probe", addr.to_string()).expect("probe client");
    for _ in 0..100 {
        if client.ping().await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("daemon at {addr} never became ready");
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
