use std::net::SocketAddr;
use std::time::Duration;

/// Default deadline for simple peer calls.
pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(5);
/// Deadline for calls that may themselves traverse a tunnel transitively
/// (`info`, `dial`, `call`).
pub const RELAY_CALL_DEADLINE: Duration = Duration::from_secs(100);

/// Configuration for NAT discovery and the rendezvous exchange.
#[derive(Debug, Clone)]
pub struct StunConfig {
    /// STUN server URLs tried in load-balanced order during discovery.
    pub urls: Vec<String>,
    /// Maximum discovery attempts before giving up.
    pub retry_count: usize,
    /// Shared token tagging rendezvous probes; unrelated traffic is ignored.
    pub token: String,
    /// UDP address for the rendezvous server role, when this node runs one.
    pub listen_addr: Option<SocketAddr>,
    /// Rendezvous server to probe, when this node runs the client role.
    pub server_addr: Option<SocketAddr>,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            urls: crate::net::stun::DEFAULT_STUN_SERVERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            retry_count: 3,
            token: "fleetd".to_string(),
            listen_addr: None,
            server_addr: None,
        }
    }
}

/// Configuration for shell command execution by the process scheduler.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Shell used to interpret process commands.
    pub shell: String,
    /// Working directory for spawned commands, if pinned.
    pub workdir: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            workdir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node name; defaults to the machine identity when empty.
    pub name: String,
    pub listen_addr: SocketAddr,
    /// Whether this node is reachable from the outside without a tunnel.
    pub public: bool,
    /// Peers to dial at startup.
    pub peers: Vec<PeerConfig>,
    pub stun: StunConfig,
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub name: String,
    pub addr: String, // host:port format, supports both IP and hostnames
    pub public: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:11451"
                .parse()
                .expect("default listen address is valid"),
            public: false,
            peers: Vec::new(),
            stun: StunConfig::default(),
            runner: RunnerConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, name: impl Into<String>, addr: String, public: bool) -> Self {
        self.peers.push(PeerConfig {
            name: name.into(),
            addr,
            public,
        });
        self
    }

    /// First peer that can serve as a relay for this node.
    pub fn first_public_peer(&self) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.public)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert!(cfg.name.is_empty());
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:11451");
        assert!(!cfg.public);
        assert!(cfg.peers.is_empty());
    }

    #[test]
    fn node_config_with_peer() {
        let cfg = NodeConfig::default()
            .with_peer("b", "127.0.0.1:11452".to_string(), true)
            .with_peer("c", "127.0.0.1:11453".to_string(), false);
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.peers[0].name, "b");
        assert!(cfg.peers[0].public);
        assert_eq!(cfg.peers[1].addr, "127.0.0.1:11453");
    }

    #[test]
    fn first_public_peer_skips_private_peers() {
        let cfg = NodeConfig::default()
            .with_peer("priv", "127.0.0.1:1".to_string(), false)
            .with_peer("pub", "127.0.0.1:2".to_string(), true);
        assert_eq!(cfg.first_public_peer().map(|p| p.name.as_str()), Some("pub"));
    }

    #[test]
    fn stun_config_default_carries_server_pool() {
        let cfg = StunConfig::default();
        assert!(!cfg.urls.is_empty());
        assert_eq!(cfg.retry_count, 3);
        assert_eq!(cfg.token, "fleetd");
        assert!(cfg.listen_addr.is_none());
    }

    #[test]
    fn runner_config_default() {
        let cfg = RunnerConfig::default();
        assert_eq!(cfg.shell, "sh");
        assert!(cfg.workdir.is_none());
    }
}
