//! Country IP ranges and named domain sets.
//!
//! Databases are built in memory by the embedding application; loading
//! vendor database formats happens outside this crate.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use rustc_hash::FxHashMap;

use super::DomainSet;

/// Country code to CIDR table.
#[derive(Debug, Clone, Default)]
pub struct GeoIpDatabase {
    countries: FxHashMap<String, Vec<IpNet>>,
}

impl GeoIpDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, code: &str, net: IpNet) {
        self.countries
            .entry(code.to_ascii_uppercase())
            .or_default()
            .push(net);
    }

    /// Country code of the first range containing `ip`.
    pub fn country(&self, ip: IpAddr) -> Option<&str> {
        let ip = ip.to_canonical();
        self.countries
            .iter()
            .find(|(_, nets)| nets.iter().any(|net| net.contains(&ip)))
            .map(|(code, _)| code.as_str())
    }

    pub fn contains(&self, code: &str, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.countries
            .get(&code.to_ascii_uppercase())
            .is_some_and(|nets| nets.iter().any(|net| net.contains(&ip)))
    }

    pub fn is_empty(&self) -> bool {
        self.countries.is_empty()
    }
}

/// Named domain sets, looked up by lowercase name (`cn`, `category-ads`).
#[derive(Debug, Clone, Default)]
pub struct GeoSiteDatabase {
    sets: FxHashMap<String, Arc<DomainSet>>,
}

impl GeoSiteDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, set: DomainSet) {
        self.sets.insert(name.to_lowercase(), Arc::new(set));
    }

    pub fn get(&self, name: &str) -> Option<Arc<DomainSet>> {
        self.sets.get(&name.to_lowercase()).cloned()
    }
}

/// Private, loopback, link-local and unspecified addresses (`GEOIP,LAN`).
pub fn is_lan(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> GeoIpDatabase {
        let mut db = GeoIpDatabase::new();
        db.add("cn", "114.114.0.0/16".parse().unwrap());
        db.add("US", "8.8.8.0/24".parse().unwrap());
        db
    }

    #[test]
    fn country_lookup() {
        let db = db();

        assert_eq!(db.country("114.114.114.114".parse().unwrap()), Some("CN"));
        assert_eq!(db.country("8.8.8.8".parse().unwrap()), Some("US"));
        assert_eq!(db.country("1.1.1.1".parse().unwrap()), None);
    }

    #[test]
    fn contains_is_case_insensitive() {
        assert!(db().contains("Cn", "114.114.1.1".parse().unwrap()));
        assert!(!db().contains("cn", "8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn mapped_v4_is_canonicalized() {
        assert!(db().contains("us", "::ffff:8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn lan_addresses() {
        for ip in ["10.0.0.1", "192.168.1.1", "127.0.0.1", "169.254.0.1", "100.64.0.1", "fd00::1", "::1"] {
            assert!(is_lan(ip.parse().unwrap()), "{ip}");
        }
        assert!(!is_lan("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn geosite_lookup_by_name() {
        let mut sites = GeoSiteDatabase::new();
        sites.insert("CN", DomainSet::from_lines("baidu.com"));

        assert!(sites.get("cn").unwrap().contains("www.baidu.com"));
        assert!(sites.get("us").is_none());
    }
}
