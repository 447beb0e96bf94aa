//! Resolvers advertised to this host.
//!
//! The nameserver list written by the network configuration (usually via
//! DHCP) is read from `resolv.conf`, refreshed periodically, and raced as
//! plain UDP upstreams. A non-`system` name binds those upstreams to that
//! interface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DnsError, DnsResult};

use super::udp::UdpTransport;
use super::{DEFAULT_TIMEOUT, Dialer, NameServer, Net, Transport, TransportGroup, race};

const RESOLV_CONF: &str = "/etc/resolv.conf";
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const SYSTEM: &str = "system";

struct Snapshot {
    loaded_at: Instant,
    transports: TransportGroup,
}

pub struct DhcpTransport {
    address: String,
    interface: Option<String>,
    path: PathBuf,
    dialer: Dialer,
    snapshot: Mutex<Option<Snapshot>>,
    timeout: Duration,
}

impl DhcpTransport {
    pub fn new(interface: &str, dialer: Dialer) -> Self {
        Self::with_path(interface, dialer, RESOLV_CONF)
    }

    pub fn with_path(interface: &str, dialer: Dialer, path: impl Into<PathBuf>) -> Self {
        Self {
            address: format!("dhcp://{interface}"),
            interface: (!interface.is_empty() && interface != SYSTEM).then(|| interface.to_string()),
            path: path.into(),
            dialer,
            snapshot: Mutex::new(None),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    async fn transports(&self) -> DnsResult<TransportGroup> {
        let mut snapshot = self.snapshot.lock().await;
        if let Some(current) = snapshot.as_ref() {
            if current.loaded_at.elapsed() < REFRESH_INTERVAL {
                return Ok(current.transports.clone());
            }
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let servers = parse_resolv_conf(&content);
        debug!("[DNS] {} nameservers: {servers:?}", self.address);
        if servers.is_empty() {
            return Err(DnsError::NotFound);
        }

        let transports: Vec<Arc<dyn Transport>> = servers
            .iter()
            .map(|addr| {
                let server = NameServer {
                    net: Net::Udp,
                    addr: addr.clone(),
                    interface: self.interface.clone(),
                    proxy: None,
                };
                UdpTransport::new(&server, None, self.dialer.clone())
                    .map(|t| Arc::new(t) as Arc<dyn Transport>)
            })
            .collect::<DnsResult<_>>()?;

        let transports: TransportGroup = transports.into();
        *snapshot = Some(Snapshot {
            loaded_at: Instant::now(),
            transports: transports.clone(),
        });
        Ok(transports)
    }
}

#[async_trait]
impl Transport for DhcpTransport {
    async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        let transports = self.transports().await?;
        race(&transports, query, self.timeout).await
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// `nameserver` entries as `ip:53` / `[ip]:53`; zone suffixes are dropped.
fn parse_resolv_conf(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            (fields.next()? == "nameserver").then_some(fields.next()?)
        })
        .filter_map(|addr| {
            let addr = addr.split('%').next()?;
            let ip: std::net::IpAddr = addr.parse().ok()?;
            Some(std::net::SocketAddr::new(ip, 53).to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nameservers() {
        let conf = "\
# generated by dhclient
search lan
nameserver 192.168.1.1
nameserver fe80::1%eth0
nameserver bogus
options edns0
";

        assert_eq!(
            parse_resolv_conf(conf),
            vec!["192.168.1.1:53".to_string(), "[fe80::1]:53".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_file_is_not_found() {
        let path = std::env::temp_dir().join(format!("resolv-{}.conf", std::process::id()));
        tokio::fs::write(&path, "search lan\n").await.unwrap();

        let transport = DhcpTransport::with_path(SYSTEM, Dialer::default(), &path);
        let query = crate::dns::new_query("example.com", hickory_proto::rr::RecordType::A).unwrap();
        let err = transport.exchange(&query).await.unwrap_err();

        assert!(matches!(err, DnsError::NotFound));
        let _ = tokio::fs::remove_file(&path).await;
    }
}
