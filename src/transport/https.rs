//! DNS over HTTPS (RFC 8484) on HTTP/2.
//!
//! Queries are POSTed as `application/dns-message`. The message id is
//! zeroed on the wire for cache friendliness and restored on the reply.
//! One HTTP/2 connection is kept and reused until it closes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::Message;
use http::{Method, Request, header};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http2::{self, SendRequest};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::dns::{decode, encode};
use crate::error::{DnsError, DnsResult};
use crate::lookup::HostResolver;

use super::tcp::{tls_config, tls_handshake};
use super::{DEFAULT_TIMEOUT, Dialer, Endpoint, NameServer, Transport, split_host_port};

const DNS_MESSAGE: &str = "application/dns-message";

pub struct HttpsTransport {
    url: String,
    endpoint: Endpoint,
    tls: TlsConnector,
    sender: Mutex<Option<SendRequest<Full<Bytes>>>>,
    timeout: Duration,
}

impl HttpsTransport {
    pub fn new(
        server: &NameServer,
        bootstrap: Option<Arc<dyn HostResolver>>,
        dialer: Dialer,
    ) -> DnsResult<Self> {
        let invalid = || DnsError::InvalidNameServer(server.addr.clone());
        let rest = server.addr.strip_prefix("https://").ok_or_else(invalid)?;
        let authority = rest.split('/').next().ok_or_else(invalid)?;
        let (host, port) = split_host_port(authority).ok_or_else(invalid)?;

        Ok(Self {
            url: server.addr.clone(),
            endpoint: Endpoint::new(host, port, server, bootstrap, dialer),
            tls: TlsConnector::from(tls_config(&[b"h2".as_slice()])),
            sender: Mutex::new(None),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    async fn sender(&self) -> DnsResult<SendRequest<Full<Bytes>>> {
        let mut cached = self.sender.lock().await;
        if let Some(sender) = cached.as_ref().filter(|s| !s.is_closed()) {
            return Ok(sender.clone());
        }

        let stream = self.endpoint.connect_tcp().await?;
        let stream = tls_handshake(&self.tls, self.endpoint.host(), stream).await?;
        let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await
            .map_err(|e| DnsError::Http(e.to_string()))?;

        let url = self.url.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("[DNS] {url} connection closed: {e}");
            }
        });

        *cached = Some(sender.clone());
        Ok(sender)
    }

    async fn post(&self, body: Vec<u8>) -> DnsResult<Bytes> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header(header::CONTENT_TYPE, DNS_MESSAGE)
            .header(header::ACCEPT, DNS_MESSAGE)
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| DnsError::Http(e.to_string()))?;

        let mut sender = self.sender().await?;
        sender
            .ready()
            .await
            .map_err(|e| DnsError::Http(e.to_string()))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| DnsError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DnsError::Http(format!("status {}", response.status())));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| DnsError::Http(e.to_string()))?;
        Ok(body.to_bytes())
    }
}

/// Copy of `query` with the id zeroed, plus the original id.
fn wire_query(query: &Message) -> (Message, u16) {
    let mut wire = query.clone();
    let id = wire.id();
    wire.set_id(0);
    (wire, id)
}

#[async_trait]
impl Transport for HttpsTransport {
    async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        let (wire, id) = wire_query(query);
        let body = encode(&wire)?;

        let bytes = tokio::time::timeout(self.timeout, self.post(body))
            .await
            .map_err(|_| DnsError::Timeout(self.timeout))??;

        let mut response = decode(&bytes)?;
        response.set_id(id);
        Ok(response)
    }

    fn address(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::new_query;
    use hickory_proto::rr::RecordType;

    #[test]
    fn wire_query_zeroes_id() {
        let mut query = new_query("example.com", RecordType::A).unwrap();
        query.set_id(4242);

        let (wire, id) = wire_query(&query);

        assert_eq!(wire.id(), 0);
        assert_eq!(id, 4242);
        assert_eq!(query.id(), 4242);
    }

    #[test]
    fn endpoint_from_url() {
        let server = NameServer::parse("https://dns.example:8443/resolve").unwrap();
        let transport = HttpsTransport::new(&server, None, Dialer::default()).unwrap();

        assert_eq!(transport.address(), "https://dns.example:8443/resolve");
        assert_eq!(transport.endpoint.host(), "dns.example");
    }
}
