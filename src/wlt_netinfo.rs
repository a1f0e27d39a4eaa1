//! Weft Layered Transport - Environment Probe
//!
//! Answers three questions the factories ask before dialing:
//! - what local address do we have, and is it private?
//! - which broadcast addresses cover our up interfaces?
//! - what kind of NAT sits between us and the internet?
//!
//! All answers are advisory inputs to success estimation; nothing here
//! gates functionality.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use get_if_addrs::{get_if_addrs, IfAddr};
use serde::{Deserialize, Serialize};
use stun::agent::TransactionId;
use stun::message::{Getter, Message as StunMessage, BINDING_REQUEST};
use stun::xoraddr::XorMappedAddress;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("STUN request failed: {0}")]
    StunFailed(String),

    #[error("STUN timeout")]
    StunTimeout,

    #[error("no STUN servers configured")]
    NoStunServers,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProbeResult<T> = Result<T, ProbeError>;

// =============================================================================
// Constants
// =============================================================================

const STUN_TIMEOUT: Duration = Duration::from_secs(3);

/// Global broadcast fallback when no interface qualifies.
pub const GLOBAL_BROADCAST: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

// =============================================================================
// Network Info
// =============================================================================

/// Rough network placement of this node relative to the peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Lan,
    Wifi,
    Internet,
    #[default]
    Unknown,
}

/// Detected NAT class. Advisory; inconclusive probes default to `Cone`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    Open,
    Cone,
    Symmetric,
    Blocked,
    #[default]
    Unknown,
}

/// Advisory inputs to the factories' success estimators. Every field is
/// optional knowledge; absent knowledge never disables a family outright.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_http_url: Option<String>,
    #[serde(default)]
    pub network_type: NetworkType,
    #[serde(default)]
    pub nat_type: NatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
}

impl NetworkInfo {
    /// True when the local address is known and sits in a private range.
    pub fn on_private_network(&self) -> bool {
        self.local_ip
            .as_deref()
            .and_then(|s| s.parse::<IpAddr>().ok())
            .map(is_private_ip)
            .unwrap_or(false)
    }
}

// =============================================================================
// Local Address Enumeration
// =============================================================================

/// First non-loopback IPv4 address on an up interface. Falls back to the
/// UDP-connect trick when interface enumeration is unavailable.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    if let Ok(ifaces) = get_if_addrs() {
        for iface in ifaces {
            if iface.is_loopback() {
                continue;
            }
            if let IfAddr::V4(v4) = iface.addr {
                return Some(v4.ip);
            }
        }
    }
    local_ipv4_via_route()
}

/// Learns the outbound interface address by "connecting" a UDP socket to a
/// public destination. No packet is sent.
fn local_ipv4_via_route() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

/// Private (RFC 1918 + loopback) address check.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
                || octets[0] == 127
        }
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

// =============================================================================
// Broadcast Addresses
// =============================================================================

/// Directed broadcast address of a subnet: `ip | !mask`.
pub fn broadcast_of(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    let ip = u32::from(ip);
    let mask = u32::from(netmask);
    Ipv4Addr::from(ip | !mask)
}

/// Broadcast addresses of every up, broadcast-capable, non-loopback IPv4
/// interface; the global broadcast when none qualify.
pub fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut addrs = Vec::new();
    if let Ok(ifaces) = get_if_addrs() {
        for iface in ifaces {
            if iface.is_loopback() {
                continue;
            }
            if let IfAddr::V4(v4) = iface.addr {
                if v4.broadcast.is_none() {
                    // Interface is not broadcast-capable (e.g. point-to-point).
                    continue;
                }
                addrs.push(broadcast_of(v4.ip, v4.netmask));
            }
        }
    }
    if addrs.is_empty() {
        addrs.push(GLOBAL_BROADCAST);
    }
    addrs.sort_unstable();
    addrs.dedup();
    addrs
}

// =============================================================================
// NAT Probe
// =============================================================================

/// Classifies the NAT by comparing mapped addresses reported by multiple
/// STUN servers from one local socket. Inconclusive results are `Unknown`;
/// callers treat that as `Cone`.
pub async fn probe_nat(stun_servers: &[String]) -> NatType {
    if stun_servers.is_empty() {
        return NatType::Unknown;
    }

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            log::warn!("NAT probe could not bind a socket: {e}");
            return NatType::Unknown;
        }
    };

    let mut mapped = Vec::new();
    for server in stun_servers {
        let target = strip_stun_scheme(server);
        match stun_binding_request(&socket, target).await {
            Ok(addr) => {
                log::debug!("STUN {target} reports mapped address {addr}");
                mapped.push(addr);
            }
            Err(e) => log::debug!("STUN request to {target} failed: {e}"),
        }
    }

    classify_mapped(&mapped, local_ipv4().map(IpAddr::V4))
}

/// NAT class from observed server-reflexive addresses.
fn classify_mapped(mapped: &[SocketAddr], local: Option<IpAddr>) -> NatType {
    let Some(first) = mapped.first() else {
        return NatType::Unknown;
    };

    let same_port = mapped.iter().all(|a| a.port() == first.port());
    if !same_port {
        return NatType::Symmetric;
    }

    // A mapped address equal to a local interface address means no NAT at
    // all; otherwise a stable mapping reads as cone.
    if local == Some(first.ip()) {
        NatType::Open
    } else {
        NatType::Cone
    }
}

/// Drops a leading `stun:`/`stuns:` scheme so config entries work both as
/// ICE URLs and as probe targets.
pub fn strip_stun_scheme(server: &str) -> &str {
    server
        .strip_prefix("stuns:")
        .or_else(|| server.strip_prefix("stun:"))
        .unwrap_or(server)
}

async fn stun_binding_request(socket: &UdpSocket, server: &str) -> ProbeResult<SocketAddr> {
    let mut msg = StunMessage::new();
    msg.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])
        .map_err(|e| ProbeError::StunFailed(e.to_string()))?;

    let dest: SocketAddr = tokio::net::lookup_host(server)
        .await?
        .next()
        .ok_or_else(|| ProbeError::StunFailed(format!("no addresses for {server}")))?;

    socket.send_to(&msg.raw, dest).await?;

    let mut buf = [0u8; 1024];
    let (n, _) = timeout(STUN_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| ProbeError::StunTimeout)??;

    let mut resp = StunMessage::new();
    resp.write(&buf[..n])
        .map_err(|e| ProbeError::StunFailed(e.to_string()))?;

    let mut xor = XorMappedAddress::default();
    xor.get_from(&resp)
        .map_err(|e| ProbeError::StunFailed(e.to_string()))?;

    Ok(SocketAddr::new(xor.ip, xor.port))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges() {
        for ip in ["10.0.0.1", "172.16.4.2", "172.31.255.1", "192.168.1.100", "127.0.0.1"] {
            assert!(is_private_ip(ip.parse().unwrap()), "{ip} should be private");
        }
        for ip in ["8.8.8.8", "172.32.0.1", "192.169.0.1", "100.64.0.1"] {
            assert!(!is_private_ip(ip.parse().unwrap()), "{ip} should be public");
        }
    }

    #[test]
    fn broadcast_math() {
        assert_eq!(
            broadcast_of("192.168.1.100".parse().unwrap(), "255.255.255.0".parse().unwrap()),
            "192.168.1.255".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            broadcast_of("10.1.2.3".parse().unwrap(), "255.0.0.0".parse().unwrap()),
            "10.255.255.255".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            broadcast_of("172.16.5.9".parse().unwrap(), "255.255.252.0".parse().unwrap()),
            "172.16.7.255".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn scheme_stripping() {
        assert_eq!(strip_stun_scheme("stun:stun.l.google.com:19302"), "stun.l.google.com:19302");
        assert_eq!(strip_stun_scheme("stuns:example.com:5349"), "example.com:5349");
        assert_eq!(strip_stun_scheme("example.com:3478"), "example.com:3478");
    }

    #[test]
    fn mapped_classification() {
        let local: IpAddr = "192.168.1.5".parse().unwrap();
        let a1: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let a2: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let a3: SocketAddr = "203.0.113.7:40123".parse().unwrap();

        assert_eq!(classify_mapped(&[], Some(local)), NatType::Unknown);
        assert_eq!(classify_mapped(&[a1, a2], Some(local)), NatType::Cone);
        assert_eq!(classify_mapped(&[a1, a3], Some(local)), NatType::Symmetric);

        let open: SocketAddr = "192.168.1.5:40000".parse().unwrap();
        assert_eq!(classify_mapped(&[open], Some(local)), NatType::Open);
    }

    #[test]
    fn network_info_privacy() {
        let mut info = NetworkInfo::default();
        assert!(!info.on_private_network());
        info.local_ip = Some("192.168.0.12".to_string());
        assert!(info.on_private_network());
        info.local_ip = Some("203.0.113.9".to_string());
        assert!(!info.on_private_network());
    }
}
