//! Classic DNS over TCP, optionally wrapped in TLS.
//!
//! TCP DNS messages are prefixed with a 2-byte big-endian length. A fresh
//! connection is used per exchange.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsConnector;

use crate::dns::{decode, encode};
use crate::error::{DnsError, DnsResult};
use crate::lookup::HostResolver;
use crate::outbound::ProxyStream;

use super::{DEFAULT_TIMEOUT, Dialer, Endpoint, NameServer, Transport, split_host_port};

/// Client TLS settings trusting the bundled web PKI roots.
pub(crate) fn tls_config(alpn: &[&[u8]]) -> Arc<ClientConfig> {
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

/// Wrap `stream` in TLS using the endpoint host as server name.
pub(crate) async fn tls_handshake(
    connector: &TlsConnector,
    host: &str,
    stream: Box<dyn ProxyStream>,
) -> DnsResult<Box<dyn ProxyStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| DnsError::InvalidNameServer(format!("{host}: {e}")))?;
    Ok(Box::new(connector.connect(server_name, stream).await?))
}

pub struct TcpTransport {
    address: String,
    endpoint: Endpoint,
    tls: Option<TlsConnector>,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(
        server: &NameServer,
        bootstrap: Option<Arc<dyn HostResolver>>,
        dialer: Dialer,
    ) -> DnsResult<Self> {
        let (host, port) = split_host_port(&server.addr)
            .ok_or_else(|| DnsError::InvalidNameServer(server.addr.clone()))?;

        Ok(Self {
            address: server.to_string(),
            endpoint: Endpoint::new(host, port, server, bootstrap, dialer),
            tls: None,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// DNS over TLS.
    pub fn new_tls(
        server: &NameServer,
        bootstrap: Option<Arc<dyn HostResolver>>,
        dialer: Dialer,
    ) -> DnsResult<Self> {
        let mut transport = Self::new(server, bootstrap, dialer)?;
        transport.tls = Some(TlsConnector::from(tls_config(&[])));
        Ok(transport)
    }

    async fn roundtrip(&self, query: &Message) -> DnsResult<Message> {
        let mut stream = self.endpoint.connect_tcp().await?;
        if let Some(connector) = &self.tls {
            stream = tls_handshake(connector, self.endpoint.host(), stream).await?;
        }

        write_dns_message(&mut stream, &encode(query)?).await?;
        let response = read_dns_message(&mut stream).await?;
        decode(&response)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        tokio::time::timeout(self.timeout, self.roundtrip(query))
            .await
            .map_err(|_| DnsError::Timeout(self.timeout))?
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// Write one length-prefixed DNS message.
pub(crate) async fn write_dns_message<S>(stream: &mut S, msg: &[u8]) -> DnsResult<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let len = u16::try_from(msg.len())
        .map_err(|_| DnsError::Proto(format!("message too large: {} bytes", msg.len())))?;

    let mut frame = Vec::with_capacity(msg.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(msg);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed DNS message, returning the body only.
pub(crate) async fn read_dns_message<S>(stream: &mut S) -> DnsResult<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let len = stream.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{msg_to_ips, new_query, testing};
    use hickory_proto::rr::RecordType;
    use std::net::IpAddr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn framing_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_dns_message(&mut a, b"abcdef").await.unwrap();
        assert_eq!(read_dns_message(&mut b).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn exchange_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let query = decode(&read_dns_message(&mut conn).await.unwrap()).unwrap();
            let reply = testing::answer(&query, &["7.7.7.7".parse().unwrap()], 60);
            write_dns_message(&mut conn, &encode(&reply).unwrap())
                .await
                .unwrap();
        });

        let server = NameServer::parse(&format!("tcp://{addr}")).unwrap();
        let transport = TcpTransport::new(&server, None, Dialer::default()).unwrap();
        let query = new_query("example.com", RecordType::A).unwrap();
        let resp = transport.exchange(&query).await.unwrap();

        assert_eq!(msg_to_ips(&resp), vec!["7.7.7.7".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn tls_config_sets_alpn() {
        let config = tls_config(&[b"h2".as_slice()]);

        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
        assert!(tls_config(&[]).alpn_protocols.is_empty());
    }
}
