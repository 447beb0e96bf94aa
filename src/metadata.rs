//! Flow metadata and the ingress descriptors that carry it.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::outbound::ProxyStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the destination host was recovered from an IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnsMode {
    #[default]
    Normal,
    Mapping,
    FakeIp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowType {
    #[default]
    Normal,
    /// Produced by the interception listener; never re-intercepted.
    Interception,
}

/// Addressing and resolution state of one flow.
///
/// Created by ingress, refined in place by the preprocessor and the
/// dispatcher, then read-only once an outbound is chosen.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub network: Network,
    pub flow_type: FlowType,
    pub src_ip: Option<IpAddr>,
    pub src_port: u16,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: u16,
    pub host: String,
    pub dns_mode: DnsMode,
    pub process: String,
    pub process_path: String,
    /// Sniffed HTTP user agent, empty when unknown.
    pub user_agent: String,
}

impl Metadata {
    pub fn new(network: Network, host: impl Into<String>, dst_port: u16) -> Self {
        Self {
            network,
            host: host.into(),
            dst_port,
            ..Default::default()
        }
    }

    pub fn with_dst_ip(mut self, ip: IpAddr) -> Self {
        self.dst_ip = Some(ip);
        self
    }

    pub fn with_source(mut self, addr: SocketAddr) -> Self {
        self.src_ip = Some(addr.ip());
        self.src_port = addr.port();
        self
    }

    pub fn resolved(&self) -> bool {
        self.dst_ip.is_some()
    }

    /// A flow is routable once it names a destination by host or by IP.
    pub fn valid(&self) -> bool {
        !self.host.is_empty() || self.dst_ip.is_some()
    }

    /// Destination used for host based matching: the host when known,
    /// otherwise the IP.
    pub fn destination(&self) -> String {
        if !self.host.is_empty() {
            return self.host.clone();
        }
        self.dst_ip.map(|ip| ip.to_string()).unwrap_or_default()
    }

    pub fn remote_address(&self) -> String {
        join_host_port(&self.destination(), self.dst_port)
    }

    pub fn source_address(&self) -> String {
        match self.src_ip {
            Some(ip) => SocketAddr::new(ip, self.src_port).to_string(),
            None => format!(":{}", self.src_port),
        }
    }

    /// Resolved UDP destination, if the IP is known.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.dst_ip.map(|ip| SocketAddr::new(ip, self.dst_port))
    }

    /// Copy handed to outbounds: mapping-mode flows that already carry the
    /// real IP drop the recovered host so the IP is dialed directly.
    pub fn pure(&self, keep_host: bool) -> Metadata {
        if !keep_host && self.dns_mode == DnsMode::Mapping && self.dst_ip.is_some() {
            let mut copy = self.clone();
            copy.host.clear();
            return copy;
        }
        self.clone()
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Accepted TCP connection plus its metadata.
pub struct TcpFlow {
    pub conn: Box<dyn ProxyStream>,
    pub metadata: Metadata,
}

/// Path back to the socket a UDP datagram arrived on.
#[async_trait]
pub trait PacketReply: Send + Sync {
    /// Write `data` back to the originating client as if sent from `from`.
    async fn write_back(&self, data: &[u8], from: SocketAddr) -> io::Result<usize>;
}

/// One inbound datagram plus its metadata.
pub struct UdpPacket {
    pub data: Bytes,
    pub metadata: Metadata,
    /// Local 4-tuple signature shared by every datagram of one conversation.
    pub key: String,
    pub reply: Arc<dyn PacketReply>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_prefers_host() {
        let meta = Metadata::new(Network::Tcp, "example.com", 443)
            .with_dst_ip("1.2.3.4".parse().unwrap());

        assert_eq!(meta.destination(), "example.com");
        assert_eq!(meta.remote_address(), "example.com:443");
    }

    #[test]
    fn remote_address_brackets_ipv6() {
        let meta = Metadata::new(Network::Udp, "", 53).with_dst_ip("::1".parse().unwrap());

        assert_eq!(meta.remote_address(), "[::1]:53");
    }

    #[test]
    fn pure_drops_mapped_host() {
        let mut meta = Metadata::new(Network::Tcp, "example.com", 80)
            .with_dst_ip("1.2.3.4".parse().unwrap());
        meta.dns_mode = DnsMode::Mapping;

        assert!(meta.pure(false).host.is_empty());
        assert_eq!(meta.pure(true).host, "example.com");
    }

    #[test]
    fn valid_requires_destination() {
        assert!(!Metadata::default().valid());
        assert!(Metadata::new(Network::Tcp, "a.com", 1).valid());
    }
}
