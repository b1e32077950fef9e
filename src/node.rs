//! Daemon state and orchestration.
//!
//! `NodeState` is the dependency-injected bundle every layer works against:
//! the correlation table, the signal table, the peer registry, the scheduler
//! and the outbound event queue. `Node` wires it together and runs the
//! startup sequence: identity, scheduler loops, optional NAT discovery and
//! rendezvous roles, peer dialing, the relay tunnel for private nodes, and
//! finally the gRPC server.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{NodeConfig, PeerConfig};
use crate::error::{FleetError, Result};
use crate::grpc::dispatch::MethodDispatcher;
use crate::machine;
use crate::net::addr::PeerCapabilities;
use crate::net::rendezvous::{RendezvousClient, RendezvousServer};
use crate::net::stun::{NatDiscovery, NatType};
use crate::net::{DeliveryClient, DirectClient, NodeRegistry, PeerClient, ProxyClient};
use crate::promise::{Promise, PromiseEvent};
use crate::proto::NodeInfo;
use crate::scheduler::{Scheduler, ShellRunner};
use crate::signal::SignalStream;

const EVENT_QUEUE: usize = 64;

/// Shared daemon state, one instance per process.
pub struct NodeState {
    name: String,
    config: NodeConfig,
    promise: Arc<Promise>,
    signals: SignalStream,
    registry: NodeRegistry,
    scheduler: Arc<Scheduler>,
    events: mpsc::Sender<PromiseEvent>,
}

impl NodeState {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn promise(&self) -> &Arc<Promise> {
        &self.promise
    }

    pub fn signals(&self) -> &SignalStream {
        &self.signals
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Sender half of the outbound event queue carried by this node's
    /// tunnel; delivery clients publish onto it.
    pub fn events(&self) -> mpsc::Sender<PromiseEvent> {
        self.events.clone()
    }

    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            name: self.name.clone(),
            ip: self.config.listen_addr.ip().to_string(),
            port: i32::from(self.config.listen_addr.port()),
            public: self.config.public,
        }
    }

    /// Register a peer by name and advertised address. The first
    /// registration wins; re-marking a known node is a no-op, and a node
    /// never registers itself.
    pub fn mark(&self, name: &str, addr: &str) {
        if name == self.name {
            return;
        }
        let proxy = Arc::new(ProxyClient::new(name, addr, self.promise.clone()));
        if self.registry.set_node_if_absent(name, proxy) {
            tracing::info!(%name, %addr, "peer marked");
        } else {
            tracing::debug!(%name, "peer already known, mark ignored");
        }
    }

    /// Server-side `Dial` semantics. A dial addressed to this node registers
    /// the caller (direct when it is public, otherwise relayed); a dial for
    /// a third node forwards the caller's mark to it.
    pub async fn dial(&self, from: &NodeInfo, to: &NodeInfo) -> Result<()> {
        let from_addr = format!("{}:{}", from.ip, from.port);
        if to.name.is_empty() || to.name == self.name {
            if from.public {
                let client = DirectClient::connect(&from.name, &from_addr)?;
                self.registry.set_node_if_absent(&from.name, Arc::new(client));
                return Ok(());
            }
            if self.config.public {
                // The private caller opens a tunnel next; Establish will
                // register its proxy client.
                return Ok(());
            }
            // Both ends private: reach the caller through a public relay.
            if self.registry.first_public().is_none() {
                return Err(FleetError::NoPublicRelay);
            }
            self.registry.set_node_if_absent(
                &from.name,
                Arc::new(DeliveryClient::new(
                    &from.name,
                    self.promise.clone(),
                    self.events(),
                )),
            );
            return Ok(());
        }

        // Introducer: pass the caller's mark along to the target.
        let target = self
            .registry
            .node(&to.name)
            .ok_or_else(|| FleetError::NodeNotFound(to.name.clone()))?;
        target.mark(&from.name, &from_addr).await
    }
}

pub struct Node {
    state: Arc<NodeState>,
    events_rx: Mutex<Option<mpsc::Receiver<PromiseEvent>>>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(mut config: NodeConfig, shutdown: CancellationToken) -> Result<Self> {
        let identity = machine::machine_id()?;
        if config.name.is_empty() {
            config.name = identity.clone();
        }
        let node_bits = machine::node_bits(&identity);
        let promise = Arc::new(Promise::new(node_bits));
        let runner = Arc::new(ShellRunner::new(config.runner.clone()));
        let scheduler = Arc::new(Scheduler::new(runner, node_bits, shutdown.clone())?);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

        let state = Arc::new(NodeState {
            name: config.name.clone(),
            config,
            promise,
            signals: SignalStream::new(),
            registry: NodeRegistry::new(),
            scheduler,
            events: events_tx,
        });
        Ok(Self {
            state,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
        })
    }

    pub fn state(&self) -> Arc<NodeState> {
        self.state.clone()
    }

    /// Run the daemon until the shutdown token fires.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            name = %self.state.name,
            listen = %self.state.config.listen_addr,
            public = self.state.config.public,
            "starting node"
        );
        self.state.scheduler.start();
        self.start_discovery();
        self.connect_peers().await;
        self.open_tunnel();

        crate::grpc::server::serve(
            self.state.clone(),
            self.state.config.listen_addr,
            self.shutdown.clone(),
        )
        .await
    }

    /// NAT discovery for private nodes plus the optional rendezvous roles,
    /// all best-effort background work. Discovery runs before the rendezvous
    /// probe so the probe advertises the learned NAT classification.
    fn start_discovery(&self) {
        let stun = self.state.config.stun.clone();
        let public = self.state.config.public;

        if let Some(listen) = stun.listen_addr {
            let token = stun.token.clone();
            let shutdown = self.shutdown.child_token();
            tokio::spawn(async move {
                match RendezvousServer::bind(listen, token).await {
                    Ok(server) => server.run(shutdown).await,
                    Err(err) => tracing::error!(%err, "rendezvous server failed to bind"),
                }
            });
        }

        if public && stun.server_addr.is_none() {
            return;
        }
        let id = self.state.name.clone();
        tokio::spawn(async move {
            let mut nat_type = NatType::Unknown;
            if !public {
                let discovery = NatDiscovery::new(stun.urls.clone(), stun.retry_count);
                match discovery.discover().await {
                    Ok(report) => {
                        tracing::info!(
                            nat = %report.nat_type,
                            public_addr = ?report.public_addr,
                            hole_punch = report.nat_type.can_make_hole(),
                            "NAT discovery finished"
                        );
                        nat_type = report.nat_type;
                    }
                    Err(err) => tracing::warn!(%err, "NAT discovery failed"),
                }
            }

            let Some(server) = stun.server_addr else {
                return;
            };
            let capabilities = PeerCapabilities {
                relay: public,
                worker: true,
            };
            let exchange = async {
                RendezvousClient::connect(server, stun.token.clone(), id)
                    .await?
                    .advertise(nat_type, capabilities)
                    .exchange()
                    .await
            };
            match exchange.await {
                Ok(peers) => {
                    for peer in &peers {
                        tracing::info!(
                            addr = %peer.addr,
                            id = %peer.id,
                            nat = %peer.addr.nat_type,
                            relay = peer.addr.capabilities.relay,
                            "rendezvous peer"
                        );
                    }
                }
                Err(err) => tracing::warn!(%err, "rendezvous exchange failed"),
            }
        });
    }

    /// Mark ourselves on every configured peer. Public peers get a direct
    /// client; private peers are reachable only through a relay, so they get
    /// a delivery client once a public peer is known.
    async fn connect_peers(&self) {
        let advertised = self.state.config.listen_addr.to_string();
        let me = self.state.node_info();
        let peers: Vec<PeerConfig> = self.state.config.peers.clone();

        for peer in peers.iter().filter(|p| p.public) {
            let client = match DirectClient::connect(&peer.name, &peer.addr) {
                Ok(client) => Arc::new(client),
                Err(err) => {
                    tracing::warn!(peer = %peer.name, %err, "bad peer address");
                    continue;
                }
            };
            if let Err(err) = client.mark(&self.state.name, &advertised).await {
                tracing::warn!(peer = %peer.name, %err, "mark on peer failed");
            }
            if let Err(err) = client.dial(&me, &peer_info(peer)).await {
                tracing::warn!(peer = %peer.name, %err, "dial to peer failed");
            }
            self.state.registry.set_node_if_absent(&peer.name, client);
        }

        for peer in peers.iter().filter(|p| !p.public) {
            if self.state.config.public {
                // A public node never opens a tunnel, so nothing would carry
                // a delivery client's calls; the peer registers itself as a
                // proxy when it tunnels in.
                tracing::info!(
                    peer = %peer.name,
                    "private peer will register itself over a tunnel"
                );
                continue;
            }
            if self.state.registry.first_public().is_none() {
                tracing::warn!(
                    peer = %peer.name,
                    "no public relay known, skipping private peer"
                );
                continue;
            }
            self.state.registry.set_node_if_absent(
                &peer.name,
                Arc::new(DeliveryClient::new(
                    &peer.name,
                    self.state.promise.clone(),
                    self.state.events(),
                )),
            );
        }
    }

    /// Private nodes keep one tunnel open to the first public relay.
    fn open_tunnel(&self) {
        if self.state.config.public {
            return;
        }
        let Some(relay) = self.state.registry.first_public() else {
            if !self.state.config.peers.is_empty() {
                tracing::warn!("private node without a public relay stays unreachable");
            }
            return;
        };
        let Some(events_rx) = self
            .events_rx
            .lock()
            .expect("event queue lock poisoned")
            .take()
        else {
            return;
        };

        let state = self.state.clone();
        let shutdown = self.shutdown.child_token();
        let dispatcher = Arc::new(MethodDispatcher::new(state.clone()));
        tokio::spawn(async move {
            let name = state.name.clone();
            if let Err(err) = relay
                .make_tunnel(
                    &name,
                    shutdown,
                    state.promise.clone(),
                    events_rx,
                    dispatcher,
                )
                .await
            {
                tracing::error!(%err, "tunnel terminated");
            }
        });
    }
}

fn peer_info(peer: &PeerConfig) -> NodeInfo {
    let (ip, port) = peer
        .addr
        .rsplit_once(':')
        .map(|(host, port)| (host.to_string(), port.parse().unwrap_or(0)))
        .unwrap_or_else(|| (peer.addr.clone(), 0));
    NodeInfo {
        name: peer.name.clone(),
        ip,
        port,
        public: peer.public,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::PeerClient;

    fn node(name: &str, public: bool) -> Node {
        let mut config = NodeConfig::new(name, "127.0.0.1:0".parse().unwrap());
        config.public = public;
        Node::new(config, CancellationToken::new()).unwrap()
    }

    #[tokio::test]
    async fn mark_is_first_writer_wins() {
        let state = node("alpha", true).state();
        state.mark("beta", "10.0.0.2:11451");
        state.mark("beta", "10.9.9.9:1");
        let client = state.registry().node("beta").unwrap();
        assert!(client.status().contains("10.0.0.2:11451"));
    }

    #[tokio::test]
    async fn mark_ignores_own_name() {
        let state = node("alpha", true).state();
        state.mark("alpha", "10.0.0.1:11451");
        assert!(state.registry().is_empty());
    }

    #[tokio::test]
    async fn dial_from_public_registers_direct() {
        let state = node("alpha", true).state();
        let from = NodeInfo {
            name: "beta".into(),
            ip: "10.0.0.2".into(),
            port: 11451,
            public: true,
        };
        state.dial(&from, &state.node_info()).await.unwrap();
        assert!(state.registry().node("beta").unwrap().is_public());
    }

    #[tokio::test]
    async fn dial_between_privates_needs_a_relay() {
        let state = node("alpha", false).state();
        let from = NodeInfo {
            name: "beta".into(),
            ip: "10.0.0.2".into(),
            port: 11451,
            public: false,
        };
        let err = state.dial(&from, &state.node_info()).await.unwrap_err();
        assert!(matches!(err, FleetError::NoPublicRelay));
        assert_eq!(err.to_string(), "public server not found");
    }

    #[tokio::test]
    async fn dial_for_unknown_third_node_errors() {
        let state = node("alpha", true).state();
        let from = NodeInfo {
            name: "beta".into(),
            ip: "10.0.0.2".into(),
            port: 11451,
            public: true,
        };
        let to = NodeInfo {
            name: "ghost".into(),
            ..Default::default()
        };
        assert!(matches!(
            state.dial(&from, &to).await,
            Err(FleetError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn public_node_does_not_preregister_private_peers() {
        let mut config = NodeConfig::new("alpha", "127.0.0.1:0".parse().unwrap());
        config.public = true;
        config = config.with_peer("worker", "10.0.0.2:11451".to_string(), false);
        let node = Node::new(config, CancellationToken::new()).unwrap();

        // No tunnel will ever drain the event queue here, so a delivery
        // client for the private peer must not be registered.
        node.connect_peers().await;
        assert!(node.state().registry().node("worker").is_none());
    }

    #[test]
    fn peer_info_parses_host_port() {
        let info = peer_info(&PeerConfig {
            name: "b".into(),
            addr: "relay.example:11451".into(),
            public: true,
        });
        assert_eq!(info.ip, "relay.example");
        assert_eq!(info.port, 11451);
        assert!(info.public);
    }
}
