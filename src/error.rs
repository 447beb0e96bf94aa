//! Error types for resolution, dispatch and the UDP session table.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::ResponseCode;
use thiserror::Error;

use crate::metadata::Network;

/// Result alias for DNS operations.
pub type DnsResult<T> = Result<T, DnsError>;

/// Errors produced by the resolver and its transports.
///
/// Every variant is cheap to clone so one coalesced upstream result can be
/// handed to every caller that waited on it.
#[derive(Debug, Clone, Error)]
pub enum DnsError {
    #[error("should have one question at least")]
    NoQuestion,

    #[error("couldn't find ip")]
    NotFound,

    #[error("ip version error")]
    IpVersion,

    #[error("ipv6 disabled")]
    Ipv6Disabled,

    /// Every transport in a group failed or the group timed out.
    #[error("all DNS requests failed{}", first_error_suffix(.first))]
    AllFailed { first: Option<Box<DnsError>> },

    #[error("server failure: {0}")]
    ServerFailure(ResponseCode),

    /// The named outbound is missing from the active proxy set.
    #[error("proxy adapter [{0}] not found")]
    ProxyNotFound(String),

    #[error("proxy adapter [{outbound}] {network} is not supported")]
    UnsupportedNetwork { outbound: String, network: Network },

    #[error("dns request timed out after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(Arc<io::Error>),

    #[error("dns message error: {0}")]
    Proto(String),

    #[error("doh request failed: {0}")]
    Http(String),

    #[error("invalid nameserver {0}")]
    InvalidNameServer(String),
}

fn first_error_suffix(first: &Option<Box<DnsError>>) -> String {
    match first {
        Some(err) => format!(", first error: {err}"),
        None => String::new(),
    }
}

impl DnsError {
    pub fn all_failed(first: Option<DnsError>) -> Self {
        Self::AllFailed {
            first: first.map(Box::new),
        }
    }

    /// True for the "named outbound missing" case callers recover from by
    /// binding an interface with the same name.
    pub fn is_proxy_not_found(&self) -> bool {
        matches!(self, Self::ProxyNotFound(_))
    }
}

impl From<io::Error> for DnsError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<hickory_proto::error::ProtoError> for DnsError {
    fn from(err: hickory_proto::error::ProtoError) -> Self {
        Self::Proto(err.to_string())
    }
}

/// Errors from the UDP session table.
#[derive(Debug, Clone, Error)]
pub enum NatError {
    /// The task that claimed creation finished without installing a session.
    #[error("session creation failed")]
    CreationFailed,

    #[error("timed out after {0:?} waiting for session creation")]
    WaitTimeout(Duration),
}

/// Errors from building rules out of configuration lines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("rule {0:?} is malformed")]
    Malformed(String),

    #[error("unsupported rule type {0}")]
    UnknownType(String),

    #[error("invalid {kind} payload {payload:?}")]
    InvalidPayload { kind: &'static str, payload: String },

    #[error("geosite {0} not found")]
    UnknownGeoSite(String),

    #[error("script rule {0} needs a script matcher")]
    NoScript(String),
}

/// Errors that end a single flow.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("metadata not valid: {0}")]
    InvalidMetadata(String),

    /// Fatal for the owning flow only.
    #[error("fake DNS record {0} missing")]
    FakeRecordMissing(IpAddr),

    #[error("proxy adapter [{0}] not found")]
    OutboundNotFound(String),

    #[error("script evaluation failed: {0}")]
    Script(String),

    #[error("proxy adapter [{outbound}] {network} is not supported")]
    UnsupportedNetwork { outbound: String, network: Network },

    #[error("resolve failed: {0}")]
    Resolve(#[from] DnsError),

    #[error("dial {outbound} failed: {source}")]
    Dial {
        outbound: String,
        #[source]
        source: io::Error,
    },

    #[error("dial {outbound} timed out after {timeout:?}")]
    DialTimeout { outbound: String, timeout: Duration },

    #[error("udp session unavailable: {0}")]
    Session(#[from] NatError),
}

/// Errors from assembling a router out of its configuration.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("dns: {0}")]
    Dns(#[from] DnsError),

    #[error("rule: {0}")]
    Rule(#[from] RuleError),

    #[error("hosts: {0}")]
    Hosts(#[from] crate::trie::InvalidDomain),

    #[error(transparent)]
    FakeIp(#[from] crate::fakeip::RangeTooSmall),
}
