//! NAT discovery: learn this node's externally observed address and NAT
//! category by probing STUN servers, and decide whether a direct
//! hole-punched path to a peer is worth attempting.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

use crate::error::{FleetError, Result};
use crate::net::balance::Balanced;

/// Public STUN servers used when the configuration does not pin its own.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun.cloudflare.com:3478",
    "stun.ekiga.net:3478",
];

const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;
const STUN_BINDING_REQUEST: u16 = 0x0001;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// NAT classification, RFC 3489 style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatType {
    #[default]
    Unknown,
    Error,
    Blocked,
    /// No NAT: the mapped address is the local address.
    None,
    Full,
    Restricted,
    PortRestricted,
    Symmetric,
    SymmetricUdpFirewall,
}

impl NatType {
    /// Whether a direct hole-punched path is worth attempting. Symmetric NAT
    /// is excluded because port prediction is unreliable; Unknown and Error
    /// carry no usable mapping. Everything else punches.
    pub fn can_make_hole(&self) -> bool {
        !matches!(self, NatType::Symmetric | NatType::Unknown | NatType::Error)
    }
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NatType::Unknown => "unknown",
            NatType::Error => "error",
            NatType::Blocked => "blocked",
            NatType::None => "none",
            NatType::Full => "full cone",
            NatType::Restricted => "restricted cone",
            NatType::PortRestricted => "port restricted cone",
            NatType::Symmetric => "symmetric",
            NatType::SymmetricUdpFirewall => "symmetric udp firewall",
        };
        f.write_str(s)
    }
}

/// Outcome of a successful discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatReport {
    pub nat_type: NatType,
    pub public_addr: Option<SocketAddr>,
}

/// NAT discovery over a load-balanced STUN server pool. Servers that answer
/// badly are weighted down so subsequent probes avoid them.
pub struct NatDiscovery {
    pool: Balanced<String>,
    retry_count: usize,
}

impl NatDiscovery {
    pub fn new(urls: impl IntoIterator<Item = String>, retry_count: usize) -> Self {
        Self {
            pool: Balanced::new(urls),
            retry_count,
        }
    }

    /// Probe the pool up to `retry_count` times. Blocked/erroring servers are
    /// marked down and the next URL is tried; exhausting the budget without a
    /// single mapping is a discovery failure.
    pub async fn discover(&self) -> Result<NatReport> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let mut mappings: Vec<(SocketAddr, SocketAddr)> = Vec::new();

        for attempt in 0..self.retry_count.max(1) {
            let Some((url, idx)) = self.pool.next() else {
                return Err(FleetError::NatDiscovery("empty STUN server pool".into()));
            };
            let Some(server) = resolve(&url).await else {
                tracing::debug!(url, "failed to resolve STUN server");
                self.pool.down(idx);
                continue;
            };
            match binding_request(&socket, server).await {
                Ok(mapped) => {
                    tracing::debug!(url, %mapped, attempt, "STUN mapping observed");
                    self.pool.up(idx);
                    if !mappings.iter().any(|(s, _)| *s == server) {
                        mappings.push((server, mapped));
                    }
                    // Two mappings from distinct servers are enough to
                    // classify; keep probing only until then.
                    if mappings.len() >= 2 {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(url, %err, attempt, "STUN probe failed");
                    self.pool.down(idx);
                }
            }
        }

        if mappings.is_empty() {
            // Total silence from the pool: outbound UDP is blocked, which is
            // a classification in its own right, not a discovery failure.
            return Ok(NatReport {
                nat_type: NatType::Blocked,
                public_addr: None,
            });
        }
        let mapped = mappings[0].1;
        let nat_type = classify(&mappings).await;
        Ok(NatReport {
            nat_type,
            public_addr: Some(mapped),
        })
    }
}

/// Compare mappings from distinct servers: a mapping that varies by
/// destination is the definitive symmetric-NAT indicator; a mapping equal to
/// the local source address means no NAT at all. With only one answering
/// server the symmetric case cannot be ruled out, so the result stays
/// Unknown. STUN alone cannot tell the cone flavors apart, so the
/// conservative PortRestricted is reported.
async fn classify(mappings: &[(SocketAddr, SocketAddr)]) -> NatType {
    let mapped = mappings[0].1;
    if let Some(local_ip) = local_source_ip(mappings[0].0).await {
        if local_ip == mapped.ip() {
            return NatType::None;
        }
    }
    if mappings.len() < 2 {
        return NatType::Unknown;
    }
    if mappings[0].1 != mappings[1].1 {
        return NatType::Symmetric;
    }
    NatType::PortRestricted
}

/// The source IP the OS would pick for `server`, learned from a throwaway
/// connected socket.
async fn local_source_ip(server: SocketAddr) -> Option<IpAddr> {
    let probe = UdpSocket::bind(("0.0.0.0", 0)).await.ok()?;
    probe.connect(server).await.ok()?;
    Some(probe.local_addr().ok()?.ip())
}

async fn resolve(url: &str) -> Option<SocketAddr> {
    match timeout(Duration::from_secs(2), lookup_host(url)).await {
        Ok(Ok(mut addrs)) => addrs.find(|a| a.is_ipv4()),
        _ => None,
    }
}

/// One STUN binding request/response exchange, returning the mapped address
/// the server observed.
async fn binding_request(socket: &UdpSocket, server: SocketAddr) -> Result<SocketAddr> {
    let mut txid = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut txid);

    let mut request = Vec::with_capacity(20);
    request.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    request.extend_from_slice(&0u16.to_be_bytes()); // no attributes
    request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    request.extend_from_slice(&txid);

    socket.send_to(&request, server).await?;

    let mut buf = [0u8; 512];
    let (n, from) = timeout(QUERY_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| FleetError::NatDiscovery(format!("no answer from {server}")))??;
    if from != server {
        return Err(FleetError::NatDiscovery(format!(
            "answer from unexpected peer {from}"
        )));
    }
    parse_binding_response(&buf[..n], &txid)
        .ok_or_else(|| FleetError::NatDiscovery(format!("malformed answer from {server}")))
}

/// Extract (XOR-)MAPPED-ADDRESS from a binding response.
fn parse_binding_response(packet: &[u8], txid: &[u8; 12]) -> Option<SocketAddr> {
    if packet.len() < 20 || &packet[8..20] != txid {
        return None;
    }
    let msg_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    let attrs = packet.get(20..20 + msg_len)?;

    let mut off = 0;
    while off + 4 <= attrs.len() {
        let attr_type = u16::from_be_bytes([attrs[off], attrs[off + 1]]);
        let attr_len = u16::from_be_bytes([attrs[off + 2], attrs[off + 3]]) as usize;
        let value = attrs.get(off + 4..off + 4 + attr_len)?;
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return parse_address(value, true),
            ATTR_MAPPED_ADDRESS => return parse_address(value, false),
            _ => {}
        }
        // Attributes are padded to 4-byte boundaries.
        off += 4 + (attr_len + 3) / 4 * 4;
    }
    None
}

fn parse_address(value: &[u8], xored: bool) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xored {
        port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
    }
    match family {
        0x01 => {
            let mut octets = [value[4], value[5], value[6], value[7]];
            if xored {
                for (o, m) in octets.iter_mut().zip(STUN_MAGIC_COOKIE.to_be_bytes()) {
                    *o ^= m;
                }
            }
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if xored {
                // IPv6 is XORed with cookie || transaction id; only the
                // cookie part is undone here since fleetd probes over IPv4.
                for (o, m) in octets.iter_mut().zip(STUN_MAGIC_COOKIE.to_be_bytes()) {
                    *o ^= m;
                }
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hole_punch_predicate_by_nat_type() {
        let cases = [
            (NatType::Unknown, false),
            (NatType::Error, false),
            (NatType::Blocked, true),
            (NatType::None, true),
            (NatType::Full, true),
            (NatType::Restricted, true),
            (NatType::PortRestricted, true),
            (NatType::Symmetric, false),
            (NatType::SymmetricUdpFirewall, true),
        ];
        for (nat_type, expected) in cases {
            assert_eq!(
                nat_type.can_make_hole(),
                expected,
                "can_make_hole({nat_type})"
            );
        }
    }

    #[test]
    fn parse_xor_mapped_address() {
        let txid = [7u8; 12];
        // Binding success response with one XOR-MAPPED-ADDRESS attribute.
        let ip = Ipv4Addr::new(203, 0, 113, 9);
        let port: u16 = 54321;
        let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
        let xport = port ^ (STUN_MAGIC_COOKIE >> 16) as u16;
        let mut xip = ip.octets();
        for (o, m) in xip.iter_mut().zip(cookie) {
            *o ^= m;
        }

        let mut packet = Vec::new();
        packet.extend_from_slice(&0x0101u16.to_be_bytes()); // binding success
        packet.extend_from_slice(&12u16.to_be_bytes());
        packet.extend_from_slice(&cookie);
        packet.extend_from_slice(&txid);
        packet.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        packet.extend_from_slice(&8u16.to_be_bytes());
        packet.push(0);
        packet.push(0x01);
        packet.extend_from_slice(&xport.to_be_bytes());
        packet.extend_from_slice(&xip);

        let parsed = parse_binding_response(&packet, &txid).unwrap();
        assert_eq!(parsed, SocketAddr::new(IpAddr::V4(ip), port));
    }

    #[test]
    fn parse_rejects_wrong_transaction_id() {
        let packet = [0u8; 32];
        assert!(parse_binding_response(&packet, &[9u8; 12]).is_none());
    }

    fn mapping(server: &str, mapped: &str) -> (SocketAddr, SocketAddr) {
        (server.parse().unwrap(), mapped.parse().unwrap())
    }

    #[tokio::test]
    async fn single_answering_server_classifies_as_unknown() {
        // One mapping cannot rule out a symmetric NAT.
        let mappings = [mapping("203.0.113.1:3478", "198.51.100.7:4242")];
        assert_eq!(classify(&mappings).await, NatType::Unknown);
    }

    #[tokio::test]
    async fn differing_mappings_classify_as_symmetric() {
        let mappings = [
            mapping("203.0.113.1:3478", "198.51.100.7:4242"),
            mapping("203.0.113.2:3478", "198.51.100.7:4777"),
        ];
        assert_eq!(classify(&mappings).await, NatType::Symmetric);
    }

    #[tokio::test]
    async fn stable_mappings_classify_as_port_restricted() {
        let mappings = [
            mapping("203.0.113.1:3478", "198.51.100.7:4242"),
            mapping("203.0.113.2:3478", "198.51.100.7:4242"),
        ];
        assert_eq!(classify(&mappings).await, NatType::PortRestricted);
    }

    #[tokio::test]
    async fn silent_pool_reports_blocked() {
        let discovery = NatDiscovery::new(["unanswerable.invalid:1".to_string()], 2);
        let report = discovery.discover().await.unwrap();
        assert_eq!(report.nat_type, NatType::Blocked);
        assert!(report.public_addr.is_none());
    }
}
