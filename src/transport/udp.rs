//! Classic DNS over UDP.
//!
//! One datagram socket per exchange; replies with a different id or that
//! fail to decode are ignored until the deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tracing::trace;

use crate::dns::{decode, encode};
use crate::error::{DnsError, DnsResult};
use crate::lookup::HostResolver;

use super::{DEFAULT_TIMEOUT, Dialer, Endpoint, MAX_DNS_PACKET_SIZE, NameServer, Transport, split_host_port};

pub struct UdpTransport {
    address: String,
    endpoint: Endpoint,
    timeout: Duration,
}

impl UdpTransport {
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
            timeout: DEFAULT_TIMEOUT,
        })
    }

    async fn roundtrip(&self, query: &Message) -> DnsResult<Message> {
        let bytes = encode(query)?;
        let conn = self.endpoint.connect_udp().await?;
        conn.send(&bytes).await?;

        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
        loop {
            let len = conn.recv(&mut buf).await?;
            if len < 12 {
                continue;
            }

            let response = match decode(&buf[..len]) {
                Ok(response) => response,
                Err(e) => {
                    trace!("[DNS] {} undecodable reply: {e}", self.address);
                    continue;
                }
            };
            if response.id() == query.id() {
                return Ok(response);
            }
            trace!("[DNS] {} stray reply id={}", self.address, response.id());
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        tokio::time::timeout(self.timeout, self.roundtrip(query))
            .await
            .map_err(|_| DnsError::Timeout(self.timeout))?
    }

    fn address(&self) -> &str {
        &self.address
    }
}
