//! Outbound capability and the built-in `DIRECT` / `REJECT` outbounds.
//!
//! Protocol adapters live outside this crate; they plug in by implementing
//! [`Outbound`] and appearing in the active proxy set.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};

use crate::lookup::Lookup;
use crate::metadata::Metadata;

pub const DIRECT: &str = "DIRECT";
pub const REJECT: &str = "REJECT";
pub const GLOBAL: &str = "GLOBAL";

/// Byte stream returned by [`Outbound::dial`].
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

/// Datagram session returned by [`Outbound::listen_packet`].
#[async_trait]
pub trait PacketSession: Send + Sync {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram, which may be empty. An `UnexpectedEof` error
    /// ends the session.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn close(&self) {}
}

#[async_trait]
pub trait Outbound: Send + Sync {
    fn name(&self) -> &str;

    fn supports_udp(&self) -> bool;

    async fn dial(&self, metadata: &Metadata) -> io::Result<Box<dyn ProxyStream>>;

    async fn listen_packet(&self, metadata: &Metadata) -> io::Result<Arc<dyn PacketSession>>;
}

/// Name lookup in the active proxy set.
pub trait ProxyLookup: Send + Sync {
    fn outbound(&self, name: &str) -> Option<Arc<dyn Outbound>>;
}

/// Dials the destination from this host.
pub struct Direct {
    lookup: Arc<Lookup>,
}

impl Direct {
    pub fn new(lookup: Arc<Lookup>) -> Self {
        Self { lookup }
    }

    async fn target(&self, metadata: &Metadata) -> io::Result<SocketAddr> {
        let ip = match metadata.dst_ip {
            Some(ip) => ip,
            None => self
                .lookup
                .resolve_ip(&metadata.host)
                .await
                .map_err(|e| io::Error::other(e.to_string()))?,
        };
        Ok(SocketAddr::new(ip, metadata.dst_port))
    }
}

#[async_trait]
impl Outbound for Direct {
    fn name(&self) -> &str {
        DIRECT
    }

    fn supports_udp(&self) -> bool {
        true
    }

    async fn dial(&self, metadata: &Metadata) -> io::Result<Box<dyn ProxyStream>> {
        let target = self.target(metadata).await?;
        let stream = TcpStream::connect(target).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn listen_packet(&self, metadata: &Metadata) -> io::Result<Arc<dyn PacketSession>> {
        let bind: SocketAddr = match metadata.dst_ip {
            Some(ip) if ip.is_ipv6() => (Ipv6Addr::UNSPECIFIED, 0).into(),
            _ => (Ipv4Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        Ok(Arc::new(DirectSession { socket }))
    }
}

struct DirectSession {
    socket: UdpSocket,
}

#[async_trait]
impl PacketSession for DirectSession {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

/// Accepts every flow and drops its traffic.
pub struct Reject;

#[async_trait]
impl Outbound for Reject {
    fn name(&self) -> &str {
        REJECT
    }

    fn supports_udp(&self) -> bool {
        true
    }

    async fn dial(&self, _metadata: &Metadata) -> io::Result<Box<dyn ProxyStream>> {
        Ok(Box::new(tokio::io::join(tokio::io::empty(), tokio::io::sink())))
    }

    async fn listen_packet(&self, _metadata: &Metadata) -> io::Result<Arc<dyn PacketSession>> {
        Ok(Arc::new(RejectSession))
    }
}

pub(crate) struct RejectSession;

#[async_trait]
impl PacketSession for RejectSession {
    async fn send_to(&self, data: &[u8], _target: SocketAddr) -> io::Result<usize> {
        Ok(data.len())
    }

    async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        Err(io::ErrorKind::UnexpectedEof.into())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording outbound used by dispatch and session tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    pub struct MockOutbound {
        pub name: String,
        pub udp: bool,
        pub dials: AtomicUsize,
        pub listens: AtomicUsize,
        pub delay: Duration,
    }

    impl MockOutbound {
        pub fn new(name: &str) -> Arc<Self> {
            Arc::new(Self::plain(name))
        }

        pub fn tcp_only(name: &str) -> Arc<Self> {
            Arc::new(Self {
                udp: false,
                ..Self::plain(name)
            })
        }

        pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::plain(name)
            })
        }

        fn plain(name: &str) -> Self {
            Self {
                name: name.to_string(),
                udp: true,
                dials: AtomicUsize::new(0),
                listens: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Outbound for MockOutbound {
        fn name(&self) -> &str {
            &self.name
        }

        fn supports_udp(&self) -> bool {
            self.udp
        }

        async fn dial(&self, _metadata: &Metadata) -> io::Result<Box<dyn ProxyStream>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let (client, _server) = tokio::io::duplex(64);
            Ok(Box::new(client))
        }

        async fn listen_packet(&self, _metadata: &Metadata) -> io::Result<Arc<dyn PacketSession>> {
            self.listens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Arc::new(RejectSession))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Network;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn reject_stream_is_closed() {
        let mut conn = Reject
            .dial(&Metadata::new(Network::Tcp, "example.com", 80))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        conn.write_all(b"dropped").await.unwrap();
    }

    #[tokio::test]
    async fn reject_session_swallows_datagrams() {
        let session = Reject
            .listen_packet(&Metadata::new(Network::Udp, "example.com", 53))
            .await
            .unwrap();

        let target: SocketAddr = "1.1.1.1:53".parse().unwrap();
        assert_eq!(session.send_to(b"abc", target).await.unwrap(), 3);

        let mut buf = [0u8; 16];
        let err = session.recv_from(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn direct_session_round_trip() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let direct = Direct::new(Arc::new(Lookup::default()));
        let meta = Metadata::new(Network::Udp, "", echo_addr.port()).with_dst_ip(echo_addr.ip());
        let session = direct.listen_packet(&meta).await.unwrap();

        session.send_to(b"ping", echo_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = session.recv_from(&mut buf).await.unwrap();

        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, echo_addr);
    }
}
