//! DNS upstream transports.
//!
//! Every upstream kind implements [`Transport`]; the resolver only sees
//! that capability. [`NameServer`] descriptors are compiled into transports
//! by [`transform`].

pub mod dhcp;
mod dialer;
pub mod https;
pub mod tcp;
pub mod udp;

pub use dialer::{Dialer, PacketConn};

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use hickory_proto::op::Message;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::dns::is_failure_rcode;
use crate::error::{DnsError, DnsResult};
use crate::lookup::{HostResolver, LookupOptions};
use crate::outbound::ProxyStream;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Bound on a single upstream exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(&self, query: &Message) -> DnsResult<Message>;

    /// Upstream address for logs.
    fn address(&self) -> &str;
}

/// Shared, ordered group of upstreams.
pub type TransportGroup = Arc<[Arc<dyn Transport>]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Net {
    Udp,
    Tcp,
    Tls,
    Https,
    Dhcp,
}

impl Net {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "udp" => Some(Self::Udp),
            "tcp" => Some(Self::Tcp),
            "tls" => Some(Self::Tls),
            "https" => Some(Self::Https),
            "dhcp" => Some(Self::Dhcp),
            _ => None,
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Tls => 853,
            Self::Https => 443,
            _ => 53,
        }
    }
}

/// Upstream descriptor.
///
/// `addr` is `host:port` for classic kinds, the full URL for `https` and
/// the interface name for `dhcp` (`system` reads the host resolver list).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameServer {
    pub net: Net,
    pub addr: String,
    pub interface: Option<String>,
    /// Outbound to tunnel queries through.
    pub proxy: Option<String>,
}

impl NameServer {
    pub fn udp(addr: &str) -> Self {
        Self {
            net: Net::Udp,
            addr: addr.to_string(),
            interface: None,
            proxy: None,
        }
    }

    /// Parse `[scheme://]host[:port][/path][?interface=name][#outbound]`.
    pub fn parse(input: &str) -> DnsResult<Self> {
        let invalid = || DnsError::InvalidNameServer(input.to_string());

        let (rest, proxy) = match input.split_once('#') {
            Some((rest, proxy)) => (rest, Some(proxy).filter(|p| !p.is_empty())),
            None => (input, None),
        };
        let (rest, interface) = match rest.split_once("?interface=") {
            Some((rest, iface)) => (rest, Some(iface).filter(|i| !i.is_empty())),
            None => (rest, None),
        };
        let (net, rest) = match rest.split_once("://") {
            Some((scheme, rest)) => (Net::from_scheme(scheme).ok_or_else(invalid)?, rest),
            None => (Net::Udp, rest),
        };
        if rest.is_empty() {
            return Err(invalid());
        }

        let addr = match net {
            Net::Https => {
                let (authority, path) = match rest.find('/') {
                    Some(idx) => rest.split_at(idx),
                    None => (rest, "/dns-query"),
                };
                let authority = with_default_port(authority, net.default_port()).ok_or_else(invalid)?;
                format!("https://{authority}{path}")
            }
            Net::Dhcp => rest.to_string(),
            _ => with_default_port(rest, net.default_port()).ok_or_else(invalid)?,
        };

        Ok(Self {
            net,
            addr,
            interface: interface.map(str::to_string),
            proxy: proxy.map(str::to_string),
        })
    }
}

impl fmt::Display for NameServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.net {
            Net::Https => f.write_str(&self.addr)?,
            Net::Udp => write!(f, "udp://{}", self.addr)?,
            Net::Tcp => write!(f, "tcp://{}", self.addr)?,
            Net::Tls => write!(f, "tls://{}", self.addr)?,
            Net::Dhcp => write!(f, "dhcp://{}", self.addr)?,
        }
        if let Some(proxy) = &self.proxy {
            write!(f, "#{proxy}")?;
        }
        Ok(())
    }
}

fn with_default_port(host: &str, port: u16) -> Option<String> {
    if host.parse::<SocketAddr>().is_ok() {
        return Some(host.to_string());
    }
    if host.parse::<Ipv6Addr>().is_ok() {
        return Some(format!("[{host}]:{port}"));
    }
    if host.starts_with('[') {
        return host.ends_with(']').then(|| format!("{host}:{port}"));
    }
    match host.rsplit_once(':') {
        Some((name, p)) => (!name.is_empty() && p.parse::<u16>().is_ok()).then(|| host.to_string()),
        None => Some(format!("{host}:{port}")),
    }
}

/// Split `host:port`, unbracketing IPv6 hosts.
pub(crate) fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host.to_string(), port.parse().ok()?))
}

/// Server address and connection options shared by the classic kinds.
///
/// A host name is resolved once through the bootstrap resolver and the
/// address is reused afterwards.
pub(crate) struct Endpoint {
    host: String,
    port: u16,
    interface: Option<String>,
    proxy: Option<String>,
    ip: OnceCell<IpAddr>,
    bootstrap: Option<Arc<dyn HostResolver>>,
    dialer: Dialer,
}

impl Endpoint {
    pub(crate) fn new(
        host: String,
        port: u16,
        server: &NameServer,
        bootstrap: Option<Arc<dyn HostResolver>>,
        dialer: Dialer,
    ) -> Self {
        Self {
            host,
            port,
            interface: server.interface.clone(),
            proxy: server.proxy.clone(),
            ip: OnceCell::new(),
            bootstrap,
            dialer,
        }
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    async fn ip(&self) -> DnsResult<IpAddr> {
        let ip = self
            .ip
            .get_or_try_init(|| async {
                if let Ok(ip) = self.host.parse::<IpAddr>() {
                    return Ok(ip);
                }
                match &self.bootstrap {
                    Some(resolver) => resolver
                        .resolve_ip(&self.host, LookupOptions::default())
                        .await
                        .inspect(|ip| debug!("[DNS] bootstrap {} -> {ip}", self.host)),
                    None => Err(DnsError::InvalidNameServer(format!(
                        "dns {} not a valid ip",
                        self.host
                    ))),
                }
            })
            .await?;
        Ok(*ip)
    }

    pub(crate) async fn connect_tcp(&self) -> DnsResult<Box<dyn ProxyStream>> {
        let addr = SocketAddr::new(self.ip().await?, self.port);
        self.dialer
            .dial_tcp(addr, self.interface.as_deref(), self.proxy.as_deref())
            .await
    }

    pub(crate) async fn connect_udp(&self) -> DnsResult<PacketConn> {
        let addr = SocketAddr::new(self.ip().await?, self.port);
        self.dialer
            .dial_udp(addr, self.interface.as_deref(), self.proxy.as_deref())
            .await
    }
}

/// Compile descriptors into transports, in order.
///
/// Host names in server addresses are resolved through `bootstrap`.
pub fn transform(
    servers: &[NameServer],
    bootstrap: Option<Arc<dyn HostResolver>>,
    dialer: &Dialer,
) -> DnsResult<Vec<Arc<dyn Transport>>> {
    servers
        .iter()
        .map(|server| -> DnsResult<Arc<dyn Transport>> {
            Ok(match server.net {
                Net::Udp => Arc::new(udp::UdpTransport::new(server, bootstrap.clone(), dialer.clone())?),
                Net::Tcp => Arc::new(tcp::TcpTransport::new(server, bootstrap.clone(), dialer.clone())?),
                Net::Tls => Arc::new(tcp::TcpTransport::new_tls(server, bootstrap.clone(), dialer.clone())?),
                Net::Https => Arc::new(https::HttpsTransport::new(server, bootstrap.clone(), dialer.clone())?),
                Net::Dhcp => Arc::new(dhcp::DhcpTransport::new(&server.addr, dialer.clone())),
            })
        })
        .collect()
}

/// Query every transport at once and return the first usable answer.
///
/// ServFail and Refused count as failures. When nothing succeeds before
/// `timeout`, the error carries the first failure seen.
pub async fn race(
    transports: &[Arc<dyn Transport>],
    query: &Message,
    timeout: Duration,
) -> DnsResult<Message> {
    let mut pending: FuturesUnordered<_> = transports
        .iter()
        .map(|transport| async move { (transport.address(), transport.exchange(query).await) })
        .collect();

    let mut first_error: Option<DnsError> = None;
    let winner = tokio::time::timeout(timeout, async {
        while let Some((address, result)) = pending.next().await {
            match result {
                Ok(msg) if is_failure_rcode(msg.response_code()) => {
                    debug!("[DNS] {address} answered {}", msg.response_code());
                    first_error.get_or_insert(DnsError::ServerFailure(msg.response_code()));
                }
                Ok(msg) => return Some(msg),
                Err(e) => {
                    debug!("[DNS] {address} failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        None
    })
    .await;

    match winner {
        Ok(Some(msg)) => Ok(msg),
        Ok(None) => Err(DnsError::all_failed(first_error)),
        Err(_) => Err(DnsError::all_failed(
            first_error.or(Some(DnsError::Timeout(timeout))),
        )),
    }
}
