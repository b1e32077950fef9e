//! Token-tagged UDP address exchange: a minimal STUN-assisted rendezvous.
//!
//! The server role echoes back the externally observed address of every
//! probe that carries the shared token, appends it to the discovered-peer
//! list, and immediately rebroadcasts the full list to every peer seen so
//! far. The client role probes the server and collects the returned list.
//! Probes with a foreign token are ignored.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{FleetError, Result};
use crate::net::addr::{PeerAddr, PeerCapabilities};
use crate::net::stun::NatType;

const EXCHANGE_VERSION: u32 = 1;
const MAX_DATAGRAM: usize = 4096;
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire format for both probe and broadcast datagrams.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Exchange {
    pub token: String,
    pub version: u32,
    /// Machine identity of the sender; empty in server broadcasts.
    #[serde(default)]
    pub id: String,
    /// Full peer list; empty in client probes.
    #[serde(default)]
    pub peers: Vec<ExchangePeer>,
    /// What the probing node learned about its own NAT; Unknown in server
    /// broadcasts.
    #[serde(default)]
    pub nat_type: NatType,
    #[serde(default)]
    pub capabilities: PeerCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePeer {
    pub addr: PeerAddr,
    pub id: String,
}

/// Server role: accumulates peers and rebroadcasts the mesh.
pub struct RendezvousServer {
    socket: UdpSocket,
    token: String,
    peers: Mutex<Vec<ExchangePeer>>,
}

impl RendezvousServer {
    pub async fn bind(addr: SocketAddr, token: impl Into<String>) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!(addr = %socket.local_addr()?, "rendezvous server listening");
        Ok(Self {
            socket,
            token: token.into(),
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve probes until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("rendezvous server shutting down");
                    return;
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(%err, "rendezvous receive failed");
                            continue;
                        }
                    };
                    if let Err(err) = self.handle_probe(&buf[..n], from).await {
                        tracing::debug!(%err, %from, "dropping rendezvous probe");
                    }
                }
            }
        }
    }

    async fn handle_probe(&self, datagram: &[u8], from: SocketAddr) -> Result<()> {
        let probe: Exchange = serde_json::from_slice(datagram)?;
        if probe.token != self.token {
            // Unrelated traffic; not an error, just noise.
            return Ok(());
        }
        let broadcast = {
            let mut peers = self.peers.lock().expect("rendezvous lock poisoned");
            if !peers.iter().any(|p| p.addr.socket_addr() == from) {
                tracing::info!(%from, id = %probe.id, nat = %probe.nat_type, "rendezvous peer discovered");
                peers.push(ExchangePeer {
                    addr: PeerAddr::from(from)
                        .with_nat_type(probe.nat_type)
                        .with_capabilities(probe.capabilities),
                    id: probe.id,
                });
            }
            Exchange {
                token: self.token.clone(),
                version: EXCHANGE_VERSION,
                peers: peers.clone(),
                ..Exchange::default()
            }
        };
        let raw = serde_json::to_vec(&broadcast)?;
        for peer in &broadcast.peers {
            if let Err(err) = self.socket.send_to(&raw, peer.addr.socket_addr()).await {
                tracing::warn!(peer = %peer.addr, %err, "rendezvous broadcast failed");
            }
        }
        Ok(())
    }

    /// Snapshot of the discovered peer list.
    pub fn peers(&self) -> Vec<ExchangePeer> {
        self.peers.lock().expect("rendezvous lock poisoned").clone()
    }
}

/// Client role: one probe, one collected peer list.
pub struct RendezvousClient {
    socket: UdpSocket,
    token: String,
    id: String,
    nat_type: NatType,
    capabilities: PeerCapabilities,
}

impl RendezvousClient {
    pub async fn connect(
        server: SocketAddr,
        token: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(server).await?;
        Ok(Self {
            socket,
            token: token.into(),
            id: id.into(),
            nat_type: NatType::Unknown,
            capabilities: PeerCapabilities::default(),
        })
    }

    /// Attach what this node knows about itself; travels with the probe and
    /// ends up on the server's peer entry.
    pub fn advertise(mut self, nat_type: NatType, capabilities: PeerCapabilities) -> Self {
        self.nat_type = nat_type;
        self.capabilities = capabilities;
        self
    }

    /// Send a probe and wait for the server's peer-list broadcast.
    pub async fn exchange(&self) -> Result<Vec<ExchangePeer>> {
        let probe = Exchange {
            token: self.token.clone(),
            version: EXCHANGE_VERSION,
            id: self.id.clone(),
            peers: Vec::new(),
            nat_type: self.nat_type,
            capabilities: self.capabilities,
        };
        self.socket.send(&serde_json::to_vec(&probe)?).await?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let n = timeout(CLIENT_READ_TIMEOUT, self.socket.recv(&mut buf))
                .await
                .map_err(|_| FleetError::DeadlineExceeded)??;
            let answer: Exchange = serde_json::from_slice(&buf[..n])?;
            if answer.token == self.token {
                return Ok(answer.peers);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_probe_appears_in_server_list() {
        let server = RendezvousServer::bind("127.0.0.1:0".parse().unwrap(), "tok")
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = std::sync::Arc::new(server);
        let running = server.clone();
        let guard = shutdown.clone();
        let handle = tokio::spawn(async move { running.run(guard).await });

        let client = RendezvousClient::connect(addr, "tok", "machine-a")
            .await
            .unwrap();
        let peers = client.exchange().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "machine-a");
        assert_eq!(server.peers().len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn advertised_nat_and_capabilities_reach_the_peer_list() {
        let server = RendezvousServer::bind("127.0.0.1:0".parse().unwrap(), "tok")
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = std::sync::Arc::new(server);
        let running = server.clone();
        let guard = shutdown.clone();
        tokio::spawn(async move { running.run(guard).await });

        let client = RendezvousClient::connect(addr, "tok", "machine-a")
            .await
            .unwrap()
            .advertise(
                NatType::Symmetric,
                PeerCapabilities {
                    relay: false,
                    worker: true,
                },
            );
        let peers = client.exchange().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].addr.nat_type, NatType::Symmetric);
        assert!(!peers[0].addr.capabilities.relay);
        assert!(peers[0].addr.capabilities.worker);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn foreign_token_is_ignored() {
        let server = RendezvousServer::bind("127.0.0.1:0".parse().unwrap(), "tok")
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = std::sync::Arc::new(server);
        let running = server.clone();
        let guard = shutdown.clone();
        tokio::spawn(async move { running.run(guard).await });

        let stranger = RendezvousClient::connect(addr, "other", "stranger")
            .await
            .unwrap();
        assert!(stranger.exchange().await.is_err());
        assert!(server.peers().is_empty());
        shutdown.cancel();
    }
}
