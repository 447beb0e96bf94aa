//! Multi-upstream DNS resolver.
//!
//! Handles the query pipeline:
//! 1. Cache lookup (stale entries answer once and trigger a refresh)
//! 2. Coalescing of identical in-flight questions
//! 3. Upstream selection: policy group, fallback-only domains, or main
//!    with fallback racing driven by the fallback IP filters
//!
//! Transports handle the actual I/O, the resolver handles decisions.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tracing::debug;

use crate::cache::{DEFAULT_CACHE_SIZE, DnsCache};
use crate::dns::{is_ip_request, msg_domain, msg_to_ips, new_query, question_key, set_msg_ttl};
use crate::error::{DnsError, DnsResult};
use crate::filter::{FallbackDomainFilter, FallbackFilterConfig, FallbackIpFilter};
use crate::lookup::{HostResolver, LookupOptions, literal_ip, pick_ip};
use crate::singleflight::SingleFlight;
use crate::stats::DnsStats;
use crate::transport::{DEFAULT_TIMEOUT, Dialer, NameServer, Transport, TransportGroup, race, transform};
use crate::trie::DomainTrie;

/// Resolver settings. Nameserver groups are compiled into transports by
/// [`Resolver::new`].
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub main: Vec<NameServer>,
    pub fallback: Vec<NameServer>,
    /// Bootstrap group used to resolve nameserver host names.
    pub default: Vec<NameServer>,
    /// Group used only for proxy server host names.
    pub proxy_server: Vec<NameServer>,
    pub ipv6: bool,
    pub fallback_filter: FallbackFilterConfig,
    /// Domain pattern to dedicated nameserver.
    pub policy: Vec<(String, NameServer)>,
    pub timeout: Duration,
    pub cache_size: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            main: Vec::new(),
            fallback: Vec::new(),
            default: Vec::new(),
            proxy_server: Vec::new(),
            ipv6: false,
            fallback_filter: FallbackFilterConfig::default(),
            policy: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

struct Inner {
    ipv6: bool,
    main: TransportGroup,
    fallback: TransportGroup,
    proxy_server: TransportGroup,
    ip_filters: Vec<FallbackIpFilter>,
    domain_filters: Vec<FallbackDomainFilter>,
    policy: Arc<DomainTrie<TransportGroup>>,
    cache: Arc<DnsCache>,
    group: SingleFlight<DnsResult<Message>>,
    timeout: Duration,
    stats: Arc<DnsStats>,
}

/// Cheap to clone; clones share cache, coalescing and counters.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<Inner>,
}

pub struct ResolverBuilder {
    main: Vec<Arc<dyn Transport>>,
    fallback: Vec<Arc<dyn Transport>>,
    proxy_server: Vec<Arc<dyn Transport>>,
    ip_filters: Vec<FallbackIpFilter>,
    domain_filters: Vec<FallbackDomainFilter>,
    policy: DomainTrie<TransportGroup>,
    ipv6: bool,
    timeout: Duration,
    cache_size: usize,
}

impl ResolverBuilder {
    pub fn fallback(mut self, fallback: Vec<Arc<dyn Transport>>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn proxy_server(mut self, transports: Vec<Arc<dyn Transport>>) -> Self {
        self.proxy_server = transports;
        self
    }

    pub fn ip_filter(mut self, filter: FallbackIpFilter) -> Self {
        self.ip_filters.push(filter);
        self
    }

    pub fn domain_filter(mut self, filter: FallbackDomainFilter) -> Self {
        self.domain_filters.push(filter);
        self
    }

    pub fn fallback_filter(mut self, config: &FallbackFilterConfig) -> Self {
        self.ip_filters.extend(config.ip_filters());
        self.domain_filters.extend(config.domain_filters());
        self
    }

    pub fn policy(mut self, pattern: &str, transports: Vec<Arc<dyn Transport>>) -> DnsResult<Self> {
        self.policy
            .insert(pattern, transports.into())
            .map_err(|e| DnsError::InvalidNameServer(e.to_string()))?;
        Ok(self)
    }

    pub fn ipv6(mut self, enabled: bool) -> Self {
        self.ipv6 = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    pub fn build(self) -> Resolver {
        Resolver {
            inner: Arc::new(Inner {
                ipv6: self.ipv6,
                main: self.main.into(),
                fallback: self.fallback.into(),
                proxy_server: self.proxy_server.into(),
                ip_filters: self.ip_filters,
                domain_filters: self.domain_filters,
                policy: Arc::new(self.policy),
                cache: Arc::new(DnsCache::new(self.cache_size)),
                group: SingleFlight::new(),
                timeout: self.timeout,
                stats: Arc::new(DnsStats::new()),
            }),
        }
    }
}

impl Resolver {
    pub fn builder(main: Vec<Arc<dyn Transport>>) -> ResolverBuilder {
        ResolverBuilder {
            main,
            fallback: Vec::new(),
            proxy_server: Vec::new(),
            ip_filters: Vec::new(),
            domain_filters: Vec::new(),
            policy: DomainTrie::new(),
            ipv6: false,
            timeout: DEFAULT_TIMEOUT,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }

    /// Compile `config` into a resolver.
    ///
    /// Nameservers given by host name are bootstrapped through a separate
    /// resolver built from the `default` group.
    pub fn new(config: &ResolverConfig, dialer: &Dialer) -> DnsResult<Self> {
        let bootstrap: Option<Arc<dyn HostResolver>> = if config.default.is_empty() {
            None
        } else {
            let default = Resolver::builder(transform(&config.default, None, dialer)?)
                .timeout(config.timeout)
                .build();
            Some(Arc::new(default))
        };

        let group = |servers: &[NameServer]| transform(servers, bootstrap.clone(), dialer);

        let mut builder = Resolver::builder(group(&config.main)?)
            .fallback(group(&config.fallback)?)
            .proxy_server(group(&config.proxy_server)?)
            .fallback_filter(&config.fallback_filter)
            .ipv6(config.ipv6)
            .timeout(config.timeout)
            .cache_size(config.cache_size);

        for (pattern, server) in &config.policy {
            builder = builder.policy(pattern, group(std::slice::from_ref(server))?)?;
        }

        Ok(builder.build())
    }

    /// Resolver for proxy server host names: the `proxy_server` group as
    /// main, sharing cache and policy with `self`. `None` when no such group
    /// is configured.
    pub fn proxy_server_host_resolver(&self) -> Option<Resolver> {
        if self.inner.proxy_server.is_empty() {
            return None;
        }

        Some(Resolver {
            inner: Arc::new(Inner {
                ipv6: self.inner.ipv6,
                main: self.inner.proxy_server.clone(),
                fallback: Arc::new([]),
                proxy_server: Arc::new([]),
                ip_filters: Vec::new(),
                domain_filters: Vec::new(),
                policy: self.inner.policy.clone(),
                cache: self.inner.cache.clone(),
                group: SingleFlight::new(),
                timeout: self.inner.timeout,
                stats: self.inner.stats.clone(),
            }),
        })
    }

    pub fn has_proxy_server(&self) -> bool {
        !self.inner.proxy_server.is_empty()
    }

    pub fn ipv6(&self) -> bool {
        self.inner.ipv6
    }

    pub fn stats(&self) -> &DnsStats {
        &self.inner.stats
    }

    pub fn cache(&self) -> &DnsCache {
        &self.inner.cache
    }

    /// Answer `query`, from cache when possible. The reply carries the id
    /// of `query`.
    pub async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        let question = query.queries().first().ok_or(DnsError::NoQuestion)?;
        let key = question_key(question);

        if let Some(hit) = self.inner.cache.get(&key) {
            let now = Instant::now();
            let stale = hit.is_stale(now);
            let remaining = hit.remaining(now);
            let mut msg = hit.response;
            if stale {
                self.inner.stats.record_hit(true);
                set_msg_ttl(&mut msg, 1);

                let resolver = self.clone();
                let refresh = query.clone();
                tokio::spawn(async move {
                    if let Err(e) = resolver.exchange_without_cache(&refresh).await {
                        debug!("[DNS] refresh {} failed: {e}", msg_domain(&refresh));
                    }
                });
            } else {
                self.inner.stats.record_hit(false);
                let ttl = u32::try_from(remaining.as_secs()).unwrap_or(u32::MAX);
                set_msg_ttl(&mut msg, ttl);
            }
            msg.set_id(query.id());
            return Ok(msg);
        }

        self.inner.stats.record_miss();
        let mut msg = self.exchange_without_cache(query).await?;
        msg.set_id(query.id());
        Ok(msg)
    }

    /// Coalesced upstream exchange. Only the execution that actually ran
    /// writes the cache.
    async fn exchange_without_cache(&self, query: &Message) -> DnsResult<Message> {
        let question = query.queries().first().ok_or(DnsError::NoQuestion)?;
        let key = question_key(question);

        let resolver = self.clone();
        let query = query.clone();
        let cache_key = key.clone();
        let (result, shared) = self
            .inner
            .group
            .run(&key, move || async move {
                let start = Instant::now();
                let result = resolver.route(&query).await;
                resolver
                    .inner
                    .stats
                    .record_upstream(start.elapsed().as_secs_f64() * 1000.0, result.is_ok());

                if let Ok(msg) = &result {
                    if !resolver.inner.cache.put(&cache_key, msg) {
                        debug!("[DNS] response msg empty: {}", msg_domain(msg));
                    }
                }
                result
            })
            .await;

        if shared {
            self.inner.stats.record_coalesced();
        }
        result.unwrap_or_else(|| Err(DnsError::all_failed(None)))
    }

    async fn route(&self, query: &Message) -> DnsResult<Message> {
        let question = query.queries().first().ok_or(DnsError::NoQuestion)?;
        if is_ip_request(question) {
            return self.ip_exchange(query).await;
        }

        match self.match_policy(query) {
            Some(group) => self.batch_exchange(group, query).await,
            None => self.batch_exchange(&self.inner.main, query).await,
        }
    }

    async fn ip_exchange(&self, query: &Message) -> DnsResult<Message> {
        if let Some(group) = self.match_policy(query) {
            return self.batch_exchange(group, query).await;
        }

        if self.should_only_query_fallback(query) {
            return self.batch_exchange(&self.inner.fallback, query).await;
        }

        let msg = self.batch_exchange(&self.inner.main, query).await;
        if self.inner.fallback.is_empty() {
            return msg;
        }

        let msg = msg?;
        if let Some(ip) = msg_to_ips(&msg).first() {
            if !self.should_ip_fallback(*ip) {
                return Ok(msg);
            }
            debug!("[DNS] {} -> {ip} matched fallback filter", msg_domain(query));
        }

        self.batch_exchange(&self.inner.fallback, query).await
    }

    async fn batch_exchange(&self, group: &[Arc<dyn Transport>], query: &Message) -> DnsResult<Message> {
        if group.is_empty() {
            return Err(DnsError::all_failed(None));
        }
        race(group, query, self.inner.timeout).await
    }

    fn match_policy(&self, query: &Message) -> Option<&TransportGroup> {
        let domain = msg_domain(query);
        if domain.is_empty() {
            return None;
        }
        self.inner.policy.search(&domain).filter(|group| !group.is_empty())
    }

    fn should_only_query_fallback(&self, query: &Message) -> bool {
        if self.inner.fallback.is_empty() || self.inner.domain_filters.is_empty() {
            return false;
        }

        let domain = msg_domain(query);
        !domain.is_empty() && self.inner.domain_filters.iter().any(|f| f.matches(&domain))
    }

    fn should_ip_fallback(&self, ip: IpAddr) -> bool {
        self.inner.ip_filters.iter().any(|f| f.matches(ip))
    }

    async fn lookup(&self, host: &str, record_type: RecordType, opts: LookupOptions) -> DnsResult<IpAddr> {
        if let Some(result) = literal_ip(host, Some(record_type == RecordType::AAAA)) {
            return result;
        }

        let query = new_query(host, record_type)?;
        let msg = self.exchange(&query).await?;
        pick_ip(&msg_to_ips(&msg), opts)
    }

    /// Race A and AAAA; A wins whenever it succeeds, AAAA is only awaited
    /// when A fails.
    pub async fn resolve_ip(&self, host: &str, opts: LookupOptions) -> DnsResult<IpAddr> {
        if let Some(result) = literal_ip(host, None) {
            return result;
        }
        if !self.inner.ipv6 {
            return self.resolve_ipv4(host, opts).await;
        }

        let resolver = self.clone();
        let v6_host = host.to_string();
        let aaaa = tokio::spawn(async move {
            resolver.lookup(&v6_host, RecordType::AAAA, opts).await
        });

        match self.lookup(host, RecordType::A, opts).await {
            Ok(ip) => Ok(ip),
            Err(e) => {
                debug!("[DNS] {host} A lookup failed: {e}");
                match aaaa.await {
                    Ok(Ok(ip)) => Ok(ip),
                    _ => Err(DnsError::NotFound),
                }
            }
        }
    }

    pub async fn resolve_ipv4(&self, host: &str, opts: LookupOptions) -> DnsResult<IpAddr> {
        self.lookup(host, RecordType::A, opts).await
    }

    pub async fn resolve_ipv6(&self, host: &str, opts: LookupOptions) -> DnsResult<IpAddr> {
        if !self.inner.ipv6 {
            return Err(DnsError::Ipv6Disabled);
        }
        self.lookup(host, RecordType::AAAA, opts).await
    }
}

#[async_trait]
impl HostResolver for Resolver {
    async fn resolve_ip(&self, host: &str, opts: LookupOptions) -> DnsResult<IpAddr> {
        Resolver::resolve_ip(self, host, opts).await
    }

    async fn resolve_ipv4(&self, host: &str, opts: LookupOptions) -> DnsResult<IpAddr> {
        Resolver::resolve_ipv4(self, host, opts).await
    }

    async fn resolve_ipv6(&self, host: &str, opts: LookupOptions) -> DnsResult<IpAddr> {
        Resolver::resolve_ipv6(self, host, opts).await
    }
}
