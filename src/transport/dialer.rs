//! Upstream connections for DNS transports.
//!
//! A connection is either dialed from this host (optionally bound to an
//! interface) or tunneled through a named outbound. When the named outbound
//! is missing from the active proxy set, the name is retried as an
//! interface.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::debug;

use crate::error::{DnsError, DnsResult};
use crate::metadata::{Metadata, Network};
use crate::outbound::{Outbound, PacketSession, ProxyLookup, ProxyStream};

#[derive(Clone, Default)]
pub struct Dialer {
    proxies: Option<Arc<dyn ProxyLookup>>,
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("proxies", &self.proxies.is_some())
            .finish()
    }
}

impl Dialer {
    pub fn new(proxies: Arc<dyn ProxyLookup>) -> Self {
        Self {
            proxies: Some(proxies),
        }
    }

    pub async fn dial_tcp(
        &self,
        addr: SocketAddr,
        interface: Option<&str>,
        proxy: Option<&str>,
    ) -> DnsResult<Box<dyn ProxyStream>> {
        if let Some(name) = proxy {
            match self.dial_tcp_through(name, addr).await {
                Err(e) if e.is_proxy_not_found() => {
                    debug!("[DNS] outbound {name} not found, binding interface {name}");
                    return Ok(Box::new(connect_tcp(addr, Some(name)).await?));
                }
                other => return other,
            }
        }

        Ok(Box::new(connect_tcp(addr, interface).await?))
    }

    pub async fn dial_udp(
        &self,
        addr: SocketAddr,
        interface: Option<&str>,
        proxy: Option<&str>,
    ) -> DnsResult<PacketConn> {
        if let Some(name) = proxy {
            match self.dial_udp_through(name, addr).await {
                Err(e) if e.is_proxy_not_found() => {
                    debug!("[DNS] outbound {name} not found, binding interface {name}");
                    return Ok(PacketConn::Socket(connect_udp(addr, Some(name)).await?));
                }
                other => return other,
            }
        }

        Ok(PacketConn::Socket(connect_udp(addr, interface).await?))
    }

    fn outbound(&self, name: &str) -> DnsResult<Arc<dyn Outbound>> {
        self.proxies
            .as_ref()
            .and_then(|proxies| proxies.outbound(name))
            .ok_or_else(|| DnsError::ProxyNotFound(name.to_string()))
    }

    async fn dial_tcp_through(
        &self,
        name: &str,
        addr: SocketAddr,
    ) -> DnsResult<Box<dyn ProxyStream>> {
        let outbound = self.outbound(name)?;
        let metadata = Metadata::new(Network::Tcp, "", addr.port()).with_dst_ip(addr.ip());
        Ok(outbound.dial(&metadata).await?)
    }

    async fn dial_udp_through(&self, name: &str, addr: SocketAddr) -> DnsResult<PacketConn> {
        let outbound = self.outbound(name)?;
        if !outbound.supports_udp() {
            return Err(DnsError::UnsupportedNetwork {
                outbound: name.to_string(),
                network: Network::Udp,
            });
        }

        let metadata = Metadata::new(Network::Udp, "", addr.port()).with_dst_ip(addr.ip());
        let session = outbound.listen_packet(&metadata).await?;
        Ok(PacketConn::Session {
            session,
            remote: addr,
        })
    }
}

/// Datagram path to one upstream.
pub enum PacketConn {
    Socket(UdpSocket),
    Session {
        session: Arc<dyn PacketSession>,
        remote: SocketAddr,
    },
}

impl PacketConn {
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        match self {
            Self::Socket(socket) => socket.send(data).await,
            Self::Session { session, remote } => session.send_to(data, *remote).await,
        }
    }

    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Socket(socket) => socket.recv(buf).await,
            Self::Session { session, .. } => Ok(session.recv_from(buf).await?.0),
        }
    }
}

impl Drop for PacketConn {
    fn drop(&mut self) {
        if let Self::Session { session, .. } = self {
            session.close();
        }
    }
}

async fn connect_tcp(addr: SocketAddr, interface: Option<&str>) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(interface) = interface {
        bind_tcp_device(&socket, interface)?;
    }
    socket.connect(addr).await
}

async fn connect_udp(addr: SocketAddr, interface: Option<&str>) -> io::Result<UdpSocket> {
    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    if let Some(interface) = interface {
        bind_udp_device(&socket, interface)?;
    }
    socket.connect(addr).await?;
    Ok(socket)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_tcp_device(socket: &TcpSocket, interface: &str) -> io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_udp_device(socket: &UdpSocket, interface: &str) -> io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_tcp_device(_socket: &TcpSocket, interface: &str) -> io::Result<()> {
    Err(unsupported_bind(interface))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_udp_device(_socket: &UdpSocket, interface: &str) -> io::Result<()> {
    Err(unsupported_bind(interface))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn unsupported_bind(interface: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("binding interface {interface} is not supported on this platform"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::mock::MockOutbound;
    use rustc_hash::FxHashMap;

    struct Proxies(FxHashMap<String, Arc<dyn Outbound>>);

    impl ProxyLookup for Proxies {
        fn outbound(&self, name: &str) -> Option<Arc<dyn Outbound>> {
            self.0.get(name).cloned()
        }
    }

    fn dialer(outbounds: Vec<Arc<MockOutbound>>) -> Dialer {
        let map = outbounds
            .into_iter()
            .map(|o| (o.name.clone(), o as Arc<dyn Outbound>))
            .collect();
        Dialer::new(Arc::new(Proxies(map)))
    }

    #[tokio::test]
    async fn tcp_through_named_outbound() {
        let proxy = MockOutbound::new("proxy");
        let dialer = dialer(vec![proxy.clone()]);

        dialer
            .dial_tcp("1.1.1.1:53".parse().unwrap(), None, Some("proxy"))
            .await
            .unwrap();

        assert_eq!(proxy.dials.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn udp_through_tcp_only_outbound_is_rejected() {
        let dialer = dialer(vec![MockOutbound::tcp_only("tcp-only")]);

        let err = dialer
            .dial_udp("1.1.1.1:53".parse().unwrap(), None, Some("tcp-only"))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, DnsError::UnsupportedNetwork { .. }));
    }

    #[tokio::test]
    async fn plain_udp_connects() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let conn = Dialer::default()
            .dial_udp(server.local_addr().unwrap(), None, None)
            .await
            .unwrap();

        conn.send(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn missing_outbound_is_recognizable() {
        let err = Dialer::default().outbound("wg0").err().unwrap();

        assert!(err.is_proxy_not_found());
    }
}
