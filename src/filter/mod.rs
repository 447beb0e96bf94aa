//! Fallback filters and geo data.
//!
//! IP filters inspect the first address of a main-group answer and decide
//! whether the fallback group must be consulted. Domain filters pick
//! questions that skip the main group entirely.

mod domain_set;
mod geo;

pub use domain_set::DomainSet;
pub use geo::{GeoIpDatabase, GeoSiteDatabase, is_lan};

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::warn;

use crate::trie::DomainTrie;

/// Fallback filter settings.
#[derive(Debug, Clone)]
pub struct FallbackFilterConfig {
    /// Enable the country filter.
    pub geoip: bool,
    /// Trusted country; answers outside it (and outside LAN) use fallback.
    pub geoip_code: String,
    pub geoip_db: Arc<GeoIpDatabase>,
    pub ip_cidr: Vec<IpNet>,
    /// Domain patterns (trie syntax) that always use fallback.
    pub domain: Vec<String>,
    pub geosite: Vec<Arc<DomainSet>>,
}

impl Default for FallbackFilterConfig {
    fn default() -> Self {
        Self {
            geoip: true,
            geoip_code: "CN".to_string(),
            geoip_db: Arc::new(GeoIpDatabase::new()),
            ip_cidr: Vec::new(),
            domain: Vec::new(),
            geosite: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FallbackIpFilter {
    GeoIp {
        code: String,
        db: Arc<GeoIpDatabase>,
    },
    Cidr(IpNet),
}

impl FallbackIpFilter {
    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            Self::GeoIp { code, db } => !is_lan(ip) && !db.contains(code, ip),
            Self::Cidr(net) => net.contains(&ip.to_canonical()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FallbackDomainFilter {
    Domains(DomainTrie<()>),
    GeoSite(Vec<Arc<DomainSet>>),
}

impl FallbackDomainFilter {
    pub fn matches(&self, domain: &str) -> bool {
        match self {
            Self::Domains(trie) => trie.search(domain).is_some(),
            Self::GeoSite(sets) => sets.iter().any(|set| set.contains(domain)),
        }
    }
}

impl FallbackFilterConfig {
    /// The country filter needs country data; with an empty database it
    /// would flag every public address, so it is left out.
    pub fn ip_filters(&self) -> Vec<FallbackIpFilter> {
        let mut filters = Vec::new();
        if self.geoip && !self.geoip_db.is_empty() {
            filters.push(FallbackIpFilter::GeoIp {
                code: self.geoip_code.clone(),
                db: self.geoip_db.clone(),
            });
        }
        filters.extend(self.ip_cidr.iter().copied().map(FallbackIpFilter::Cidr));
        filters
    }

    pub fn domain_filters(&self) -> Vec<FallbackDomainFilter> {
        let mut filters = Vec::new();
        if !self.domain.is_empty() {
            let mut trie = DomainTrie::new();
            for domain in &self.domain {
                if let Err(e) = trie.insert(domain, ()) {
                    warn!("[DNS] skip fallback domain filter: {e}");
                }
            }
            filters.push(FallbackDomainFilter::Domains(trie));
        }
        if !self.geosite.is_empty() {
            filters.push(FallbackDomainFilter::GeoSite(self.geosite.clone()));
        }
        filters
    }
}
