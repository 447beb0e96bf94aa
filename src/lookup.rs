//! Address resolution front end.
//!
//! Static hosts and literal IPs are answered locally. Everything else goes
//! to the configured [`HostResolver`], or to the system resolver when none
//! is configured.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use crate::error::{DnsError, DnsResult};
use crate::trie::DomainTrie;

/// Default bound on a single resolution.
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-lookup switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupOptions {
    /// Always take the first address of an answer instead of a random one.
    pub first_ip: bool,
}

impl LookupOptions {
    pub fn first_ip() -> Self {
        Self { first_ip: true }
    }
}

/// Capability to turn a host name into an address.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// A and AAAA raced, A preferred.
    async fn resolve_ip(&self, host: &str, opts: LookupOptions) -> DnsResult<IpAddr>;

    async fn resolve_ipv4(&self, host: &str, opts: LookupOptions) -> DnsResult<IpAddr>;

    async fn resolve_ipv6(&self, host: &str, opts: LookupOptions) -> DnsResult<IpAddr>;
}

/// Pick one address from `ips`, randomly unless `opts.first_ip` is set.
pub fn pick_ip(ips: &[IpAddr], opts: LookupOptions) -> DnsResult<IpAddr> {
    match ips {
        [] => Err(DnsError::NotFound),
        [ip] => Ok(*ip),
        _ if opts.first_ip => Ok(ips[0]),
        _ => Ok(ips[rand::rng().random_range(0..ips.len())]),
    }
}

/// Literal IP check for a requested family. `None` when `host` is not an IP.
pub fn literal_ip(host: &str, want_v6: Option<bool>) -> Option<DnsResult<IpAddr>> {
    let ip = host.parse::<IpAddr>().ok()?.to_canonical();
    Some(match want_v6 {
        Some(true) if !ip.is_ipv6() => Err(DnsError::IpVersion),
        Some(false) if !ip.is_ipv4() => Err(DnsError::IpVersion),
        _ => Ok(ip),
    })
}

pub struct Lookup {
    hosts: Arc<DomainTrie<IpAddr>>,
    resolver: Option<Arc<dyn HostResolver>>,
    ipv6: bool,
    timeout: Duration,
}

impl Default for Lookup {
    fn default() -> Self {
        Self {
            hosts: Arc::new(DomainTrie::new()),
            resolver: None,
            ipv6: false,
            timeout: DEFAULT_DNS_TIMEOUT,
        }
    }
}

impl Lookup {
    pub fn new(
        hosts: Arc<DomainTrie<IpAddr>>,
        resolver: Option<Arc<dyn HostResolver>>,
        ipv6: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            hosts,
            resolver,
            ipv6,
            timeout,
        }
    }

    pub fn hosts(&self) -> &DomainTrie<IpAddr> {
        &self.hosts
    }

    /// Static hosts entry for `host`, if any.
    pub fn search_host(&self, host: &str) -> Option<IpAddr> {
        if host.is_empty() {
            return None;
        }
        self.hosts.search(host).copied()
    }

    pub fn ipv6(&self) -> bool {
        self.ipv6
    }

    pub async fn resolve_ip(&self, host: &str) -> DnsResult<IpAddr> {
        self.resolve_ip_with(host, LookupOptions::default()).await
    }

    /// Stable variant for flows that must see the same address on every
    /// lookup of one name.
    pub async fn resolve_first_ip(&self, host: &str) -> DnsResult<IpAddr> {
        self.resolve_ip_with(host, LookupOptions::first_ip()).await
    }

    pub async fn resolve_ip_with(&self, host: &str, opts: LookupOptions) -> DnsResult<IpAddr> {
        if let Some(ip) = self.search_host(host) {
            return Ok(ip);
        }

        if !self.ipv6 {
            return self.resolve_ipv4(host, opts).await;
        }

        if let Some(result) = literal_ip(host, None) {
            return result;
        }

        match &self.resolver {
            Some(resolver) => resolver.resolve_ip(host, opts).await,
            None => self.system_lookup(host, None, opts).await,
        }
    }

    pub async fn resolve_ipv4(&self, host: &str, opts: LookupOptions) -> DnsResult<IpAddr> {
        if let Some(ip) = self.search_host(host).filter(IpAddr::is_ipv4) {
            return Ok(ip);
        }
        if let Some(result) = literal_ip(host, Some(false)) {
            return result;
        }

        match &self.resolver {
            Some(resolver) => resolver.resolve_ipv4(host, opts).await,
            None => self.system_lookup(host, Some(false), opts).await,
        }
    }

    pub async fn resolve_ipv6(&self, host: &str, opts: LookupOptions) -> DnsResult<IpAddr> {
        if !self.ipv6 {
            return Err(DnsError::Ipv6Disabled);
        }
        if let Some(ip) = self.search_host(host).filter(IpAddr::is_ipv6) {
            return Ok(ip);
        }
        if let Some(result) = literal_ip(host, Some(true)) {
            return result;
        }

        match &self.resolver {
            Some(resolver) => resolver.resolve_ipv6(host, opts).await,
            None => self.system_lookup(host, Some(true), opts).await,
        }
    }

    async fn system_lookup(
        &self,
        host: &str,
        want_v6: Option<bool>,
        opts: LookupOptions,
    ) -> DnsResult<IpAddr> {
        let addrs = tokio::time::timeout(self.timeout, tokio::net::lookup_host((host, 0)))
            .await
            .map_err(|_| DnsError::Timeout(self.timeout))??;

        let ips: Vec<IpAddr> = addrs
            .map(|addr| addr.ip().to_canonical())
            .filter(|ip| match want_v6 {
                Some(true) => ip.is_ipv6(),
                Some(false) => ip.is_ipv4(),
                None => true,
            })
            .collect();

        debug!("[DNS] system lookup {host} -> {ips:?}");
        pick_ip(&ips, opts)
    }
}
