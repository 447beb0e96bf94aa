//! Router orchestration.
//!
//! Builds the resolver, the shared router state and the tunnel from one
//! [`ServiceConfig`], answers DNS questions through the enhancer, and logs
//! activity counters periodically.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use ipnet::Ipv4Net;
use tracing::info;

use crate::enhancer::{EnhancedMode, Enhancer};
use crate::error::{DnsError, DnsResult, ServiceError, TunnelError};
use crate::fakeip::FakeIpPool;
use crate::filter::{GeoIpDatabase, GeoSiteDatabase};
use crate::lookup::{HostResolver, Lookup};
use crate::metadata::Metadata;
use crate::outbound::{Direct, Outbound};
use crate::resolver::{Resolver, ResolverConfig};
use crate::rule::{Rule, RuleContext, ScriptMatcher};
use crate::state::{Mode, RouterState, SharedState};
use crate::transport::Dialer;
use crate::trie::DomainTrie;
use crate::tunnel::{Ingress, Route, Tunnel, TunnelConfig};

pub struct ServiceConfig {
    /// No main nameservers means host names go to the system resolver.
    pub resolver: ResolverConfig,
    pub tunnel: TunnelConfig,
    /// Static host entries; patterns may use trie wildcards.
    pub hosts: Vec<(String, IpAddr)>,
    pub enhanced_mode: EnhancedMode,
    pub fake_ip_range: Ipv4Net,
    pub rules: Vec<String>,
    pub mode: Mode,
    pub geoip: Arc<GeoIpDatabase>,
    pub geosite: Arc<GeoSiteDatabase>,
    pub script: Option<Arc<dyn ScriptMatcher>>,
    pub stats_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            resolver: ResolverConfig::default(),
            tunnel: TunnelConfig::default(),
            hosts: Vec::new(),
            enhanced_mode: EnhancedMode::Normal,
            fake_ip_range: Ipv4Net::new(Ipv4Addr::new(198, 18, 0, 0), 16).unwrap_or_default(),
            rules: Vec::new(),
            mode: Mode::Rule,
            geoip: Arc::default(),
            geosite: Arc::default(),
            script: None,
            stats_interval: Duration::from_secs(60),
        }
    }
}

pub struct Service {
    state: Arc<SharedState>,
    resolver: Option<Resolver>,
    lookup: Arc<Lookup>,
    proxy_server_lookup: Arc<Lookup>,
    enhancer: Arc<Enhancer>,
    tunnel: Arc<Tunnel>,
    stats_interval: Duration,
}

impl Service {
    /// Assemble the router. `outbounds` join the built-in `DIRECT` and
    /// `REJECT` in the proxy set.
    pub fn build(
        config: ServiceConfig,
        outbounds: Vec<Arc<dyn Outbound>>,
    ) -> Result<Self, ServiceError> {
        let state = Arc::new(SharedState::new(
            RouterState::default().with_mode(config.mode),
        ));
        let dialer = Dialer::new(state.clone());

        let resolver = if config.resolver.main.is_empty() {
            None
        } else {
            Some(Resolver::new(&config.resolver, &dialer)?)
        };

        let mut hosts = DomainTrie::new();
        for (pattern, ip) in &config.hosts {
            hosts.insert(pattern, *ip)?;
        }
        let hosts = Arc::new(hosts);
        let lookup = Arc::new(Lookup::new(
            hosts.clone(),
            resolver
                .clone()
                .map(|r| Arc::new(r) as Arc<dyn HostResolver>),
            config.resolver.ipv6,
            config.tunnel.dns_timeout,
        ));
        let proxy_server_lookup = match resolver.as_ref().and_then(Resolver::proxy_server_host_resolver) {
            Some(r) => Arc::new(Lookup::new(
                hosts,
                Some(Arc::new(r) as Arc<dyn HostResolver>),
                config.resolver.ipv6,
                config.tunnel.dns_timeout,
            )),
            None => lookup.clone(),
        };

        let enhancer = Arc::new(match config.enhanced_mode {
            EnhancedMode::FakeIp => {
                let pool = FakeIpPool::new(config.fake_ip_range)?;
                Enhancer::new(EnhancedMode::FakeIp, Some(Arc::new(pool)))
            }
            mode => Enhancer::new(mode, None),
        });

        let ctx = RuleContext {
            geoip: config.geoip.clone(),
            geosite: config.geosite.clone(),
            script: config.script.clone(),
        };
        let rules = config
            .rules
            .iter()
            .map(|line| Rule::parse(line, &ctx))
            .collect::<Result<Vec<_>, _>>()?;

        let mut proxies: Vec<Arc<dyn Outbound>> = vec![Arc::new(Direct::new(lookup.clone()))];
        proxies.extend(outbounds);
        state.update(rules, proxies);
        state.update_script(config.script);
        state.snapshot().validate();

        let tunnel = Tunnel::new(
            state.clone(),
            lookup.clone(),
            enhancer.clone(),
            config.tunnel,
        );

        Ok(Self {
            state,
            resolver,
            lookup,
            proxy_server_lookup,
            enhancer,
            tunnel: Arc::new(tunnel),
            stats_interval: config.stats_interval,
        })
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn resolver(&self) -> Option<&Resolver> {
        self.resolver.as_ref()
    }

    pub fn lookup(&self) -> &Lookup {
        &self.lookup
    }

    /// Lookup for outbound server host names. Uses the proxy-server
    /// nameserver group when one is configured, so reaching a proxy never
    /// depends on a nameserver that is itself reached through a proxy.
    pub fn proxy_server_lookup(&self) -> Arc<Lookup> {
        self.proxy_server_lookup.clone()
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    /// Answer a client DNS question: synthetic in fake-ip mode, otherwise
    /// through the resolver with answers remembered for mapping mode.
    pub async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        if let Some(fake) = self.enhancer.fake_response(query) {
            return Ok(fake);
        }

        let resolver = self.resolver.as_ref().ok_or(DnsError::NotFound)?;
        let response = resolver.exchange(query).await?;
        self.enhancer.record_mapping(&response);
        Ok(response)
    }

    /// Preprocess and dispatch one flow without connecting it.
    pub async fn route(&self, metadata: &mut Metadata) -> Result<Route, TunnelError> {
        if !metadata.valid() {
            return Err(TunnelError::InvalidMetadata(format!("{metadata:?}")));
        }
        self.tunnel.preprocess(metadata)?;
        self.tunnel.dispatch(metadata).await
    }

    /// Start the tunnel workers and the periodic stats logger.
    pub fn start(&self) -> Ingress {
        let ingress = self.tunnel.start();

        let tunnel = self.tunnel.clone();
        let resolver = self.resolver.clone();
        let period = self.stats_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let flows = tunnel.stats().snapshot_and_reset();
                info!(
                    "[stats] tcp={} udp_packets={} udp_sessions={} nat={} rejected={} dropped={}",
                    flows.tcp_flows,
                    flows.udp_packets,
                    flows.udp_sessions,
                    tunnel.nat().len(),
                    flows.rejected,
                    flows.dropped
                );
                if let Some(resolver) = &resolver {
                    let dns = resolver.stats().snapshot_and_reset();
                    info!(
                        "[stats] dns requests={} cached={} stale={} upstream={} coalesced={} failed={} cache={} avg_upstream={:.2}ms",
                        dns.requests,
                        dns.cache_hits,
                        dns.stale_hits,
                        dns.upstream,
                        dns.coalesced,
                        dns.failures,
                        resolver.cache().len(),
                        dns.avg_upstream_ms
                    );
                }
            }
        });

        ingress
    }
}
