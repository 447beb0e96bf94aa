//! Fake-IP address pool.
//!
//! Hands out synthetic IPv4 addresses from a range, one per host, and
//! remembers the reverse mapping. When the range is exhausted the least
//! recently used address is recycled.

use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;

use ipnet::Ipv4Net;
use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("fake-ip range {0} is too small")]
pub struct RangeTooSmall(pub Ipv4Net);

struct PoolState {
    next: u32,
    host_to_ip: LruCache<String, Ipv4Addr>,
    ip_to_host: LruCache<Ipv4Addr, String>,
}

pub struct FakeIpPool {
    net: Ipv4Net,
    gateway: Ipv4Addr,
    first: u32,
    size: u32,
    state: Mutex<PoolState>,
}

impl FakeIpPool {
    /// The network address and the gateway (first host) are never handed
    /// out, nor is the broadcast address.
    pub fn new(net: Ipv4Net) -> Result<Self, RangeTooSmall> {
        let network = u32::from(net.network());
        let broadcast = u32::from(net.broadcast());
        let first = network.saturating_add(2);
        if broadcast <= first {
            return Err(RangeTooSmall(net));
        }

        let size = broadcast - first;
        let capacity = NonZeroUsize::new(size as usize).ok_or(RangeTooSmall(net))?;

        Ok(Self {
            net,
            gateway: Ipv4Addr::from(network + 1),
            first,
            size,
            state: Mutex::new(PoolState {
                next: 0,
                host_to_ip: LruCache::new(capacity),
                ip_to_host: LruCache::new(capacity),
            }),
        })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn net(&self) -> Ipv4Net {
        self.net
    }

    /// Address for `host`, allocating one on first use.
    pub fn lookup(&self, host: &str) -> Ipv4Addr {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let mut state = self.state.lock();

        if let Some(ip) = state.host_to_ip.get(&host).copied() {
            state.ip_to_host.promote(&ip);
            return ip;
        }

        let ip = if state.next < self.size {
            let ip = Ipv4Addr::from(self.first + state.next);
            state.next += 1;
            ip
        } else {
            match state.ip_to_host.pop_lru() {
                Some((ip, old_host)) => {
                    state.host_to_ip.pop(&old_host);
                    ip
                }
                None => Ipv4Addr::from(self.first),
            }
        };

        state.host_to_ip.put(host.clone(), ip);
        state.ip_to_host.put(ip, host);
        ip
    }

    /// Host previously given `ip`.
    pub fn lookup_back(&self, ip: IpAddr) -> Option<String> {
        let IpAddr::V4(v4) = ip.to_canonical() else {
            return None;
        };
        let mut state = self.state.lock();
        let host = state.ip_to_host.get(&v4).cloned()?;
        state.host_to_ip.promote(&host);
        Some(host)
    }

    /// Whether `ip` is currently mapped to a host.
    pub fn exists(&self, ip: IpAddr) -> bool {
        match ip.to_canonical() {
            IpAddr::V4(v4) => self.state.lock().ip_to_host.contains(&v4),
            IpAddr::V6(_) => false,
        }
    }

    /// Whether `ip` falls inside the pool range.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip.to_canonical() {
            IpAddr::V4(v4) => self.net.contains(&v4),
            IpAddr::V6(_) => false,
        }
    }
}
