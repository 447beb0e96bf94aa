//! Host recovery for flows that only carry a destination IP.
//!
//! In fake-ip mode the pool hands out synthetic addresses and reverses
//! them. In mapping mode real answers are remembered so the IP can be
//! turned back into the name the client asked for.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use lru::LruCache;
use parking_lot::Mutex;

use crate::dns::{msg_domain, msg_to_ips};
use crate::fakeip::FakeIpPool;

const MAPPING_CAPACITY: NonZeroUsize = NonZeroUsize::new(4096).unwrap();

/// TTL of synthetic answers.
const FAKE_TTL: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnhancedMode {
    #[default]
    Normal,
    Mapping,
    FakeIp,
}

pub struct Enhancer {
    mode: EnhancedMode,
    pool: Option<Arc<FakeIpPool>>,
    mapping: Mutex<LruCache<IpAddr, String>>,
}

impl Default for Enhancer {
    fn default() -> Self {
        Self::new(EnhancedMode::Normal, None)
    }
}

impl Enhancer {
    pub fn new(mode: EnhancedMode, pool: Option<Arc<FakeIpPool>>) -> Self {
        Self {
            mode,
            pool,
            mapping: Mutex::new(LruCache::new(MAPPING_CAPACITY)),
        }
    }

    pub fn mode(&self) -> EnhancedMode {
        self.mode
    }

    /// Either mapping or fake-ip is active.
    pub fn mapping_enabled(&self) -> bool {
        self.mode != EnhancedMode::Normal
    }

    pub fn fake_ip_enabled(&self) -> bool {
        self.mode == EnhancedMode::FakeIp && self.pool.is_some()
    }

    /// `ip` lies inside the fake-ip range, mapped or not.
    pub fn is_fake_ip(&self, ip: IpAddr) -> bool {
        self.fake_ip_enabled() && self.pool.as_ref().is_some_and(|pool| pool.contains(ip))
    }

    /// `ip` is a fake address currently mapped to a host.
    pub fn is_exist_fake_ip(&self, ip: IpAddr) -> bool {
        self.fake_ip_enabled() && self.pool.as_ref().is_some_and(|pool| pool.exists(ip))
    }

    pub fn find_host_by_ip(&self, ip: IpAddr) -> Option<String> {
        if let Some(host) = self
            .pool
            .as_ref()
            .filter(|_| self.fake_ip_enabled())
            .and_then(|pool| pool.lookup_back(ip))
        {
            return Some(host);
        }

        self.mapping.lock().get(&ip.to_canonical()).cloned()
    }

    /// Remember every answered address of `msg` against its question name.
    pub fn record_mapping(&self, msg: &Message) {
        if !self.mapping_enabled() {
            return;
        }
        let host = msg_domain(msg);
        if host.is_empty() {
            return;
        }

        let mut mapping = self.mapping.lock();
        for ip in msg_to_ips(msg) {
            mapping.put(ip.to_canonical(), host.clone());
        }
    }

    /// Synthetic answer for an A question in fake-ip mode.
    pub fn fake_response(&self, query: &Message) -> Option<Message> {
        let pool = self.pool.as_ref().filter(|_| self.fake_ip_enabled())?;
        let question = query.queries().first()?;
        if question.query_type() != RecordType::A {
            return None;
        }

        let ip = pool.lookup(&msg_domain(query));

        let mut msg = Message::new();
        msg.set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(query.op_code())
            .set_recursion_desired(query.recursion_desired())
            .set_recursion_available(true)
            .set_response_code(ResponseCode::NoError);
        msg.add_query(question.clone());
        msg.add_answer(Record::from_rdata(
            question.name().clone(),
            FAKE_TTL,
            RData::A(A(ip)),
        ));
        Some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{new_query, testing};

    fn fake() -> Enhancer {
        let pool = FakeIpPool::new("198.18.0.0/16".parse().unwrap()).unwrap();
        Enhancer::new(EnhancedMode::FakeIp, Some(Arc::new(pool)))
    }

    #[test]
    fn fake_answers_reverse() {
        let enhancer = fake();
        let query = new_query("example.com", RecordType::A).unwrap();

        let resp = enhancer.fake_response(&query).unwrap();
        let ip = msg_to_ips(&resp)[0];

        assert_eq!(resp.id(), query.id());
        assert!(enhancer.is_fake_ip(ip));
        assert!(enhancer.is_exist_fake_ip(ip));
        assert_eq!(enhancer.find_host_by_ip(ip).as_deref(), Some("example.com"));
    }

    #[test]
    fn fake_mode_ignores_non_a_questions() {
        let query = new_query("example.com", RecordType::AAAA).unwrap();

        assert!(fake().fake_response(&query).is_none());
    }

    #[test]
    fn unmapped_fake_ip_is_recognized() {
        let enhancer = fake();
        let ip: IpAddr = "198.18.9.9".parse().unwrap();

        assert!(enhancer.is_fake_ip(ip));
        assert!(!enhancer.is_exist_fake_ip(ip));
        assert!(enhancer.find_host_by_ip(ip).is_none());
    }

    #[test]
    fn mapping_mode_records_answers() {
        let enhancer = Enhancer::new(EnhancedMode::Mapping, None);
        let query = new_query("example.com", RecordType::A).unwrap();
        let resp = testing::answer(&query, &["93.184.216.34".parse().unwrap()], 60);

        enhancer.record_mapping(&resp);

        assert_eq!(
            enhancer
                .find_host_by_ip("93.184.216.34".parse().unwrap())
                .as_deref(),
            Some("example.com")
        );
        assert!(!enhancer.is_fake_ip("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn normal_mode_records_nothing() {
        let enhancer = Enhancer::default();
        let query = new_query("example.com", RecordType::A).unwrap();
        let resp = testing::answer(&query, &["1.1.1.1".parse().unwrap()], 60);

        enhancer.record_mapping(&resp);

        assert!(!enhancer.mapping_enabled());
        assert!(enhancer.find_host_by_ip("1.1.1.1".parse().unwrap()).is_none());
    }
}
