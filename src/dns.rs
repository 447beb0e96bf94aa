//! DNS message helpers.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};

use crate::error::{DnsError, DnsResult};

/// Cache and coalescing key for a question: name, class and type.
pub fn question_key(query: &Query) -> String {
    format!(
        "{}:{}:{}",
        query.name().to_lowercase(),
        u16::from(query.query_class()),
        u16::from(query.query_type())
    )
}

/// Queried domain without the trailing dot, empty when there is no question.
pub fn msg_domain(msg: &Message) -> String {
    msg.queries()
        .first()
        .map(|q| q.name().to_string().trim_end_matches('.').to_string())
        .unwrap_or_default()
}

pub fn is_ip_request(query: &Query) -> bool {
    query.query_class() == DNSClass::IN
        && matches!(query.query_type(), RecordType::A | RecordType::AAAA)
}

/// Addresses in the answer section, in order.
pub fn msg_to_ips(msg: &Message) -> Vec<IpAddr> {
    msg.answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// Rewrite the TTL of every record in every section.
pub fn set_msg_ttl(msg: &mut Message, ttl: u32) {
    fn rewrite(records: Vec<Record>, ttl: u32) -> Vec<Record> {
        records
            .into_iter()
            .map(|mut r| {
                r.set_ttl(ttl);
                r
            })
            .collect()
    }

    let answers = rewrite(msg.take_answers(), ttl);
    let name_servers = rewrite(msg.take_name_servers(), ttl);
    let additionals = rewrite(msg.take_additionals(), ttl);
    msg.insert_answers(answers);
    msg.insert_name_servers(name_servers);
    msg.insert_additionals(additionals);
}

/// TTL used for caching: minimum TTL of the first non-empty section among
/// answer, authority and additional. `None` when all are empty.
pub fn cache_ttl(msg: &Message) -> Option<Duration> {
    [msg.answers(), msg.name_servers(), msg.additionals()]
        .into_iter()
        .find(|section| !section.is_empty())
        .and_then(|section| section.iter().map(Record::ttl).min())
        .map(|ttl| Duration::from_secs(u64::from(ttl)))
}

/// Build a recursive query for `host`.
pub fn new_query(host: &str, record_type: RecordType) -> DnsResult<Message> {
    let mut name = Name::from_str(host).map_err(|e| DnsError::Proto(e.to_string()))?;
    name.set_fqdn(true);

    let mut msg = Message::new();
    msg.set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    msg.add_query(Query::query(name, record_type));
    Ok(msg)
}

/// Response codes that count as transport failures when racing upstreams.
pub fn is_failure_rcode(code: ResponseCode) -> bool {
    matches!(code, ResponseCode::ServFail | ResponseCode::Refused)
}

pub fn encode(msg: &Message) -> DnsResult<Vec<u8>> {
    Ok(msg.to_vec()?)
}

pub fn decode(bytes: &[u8]) -> DnsResult<Message> {
    Ok(Message::from_vec(bytes)?)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Message builders shared by tests across the crate.

    use std::net::IpAddr;
    use std::str::FromStr;

    use hickory_proto::op::{Message, MessageType, ResponseCode};
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::{Name, RData, Record};

    pub fn answer(query: &Message, ips: &[IpAddr], ttl: u32) -> Message {
        let mut msg = Message::new();
        msg.set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::NoError);
        for q in query.queries() {
            msg.add_query(q.clone());
        }
        let name = query
            .queries()
            .first()
            .map(|q| q.name().clone())
            .unwrap_or_else(|| Name::from_str("example.com.").unwrap());
        for ip in ips {
            let rdata = match ip {
                IpAddr::V4(v4) => RData::A(A(*v4)),
                IpAddr::V6(v6) => RData::AAAA(AAAA(*v6)),
            };
            msg.add_answer(Record::from_rdata(name.clone(), ttl, rdata));
        }
        msg
    }

    pub fn rcode(query: &Message, code: ResponseCode) -> Message {
        let mut msg = answer(query, &[], 0);
        msg.set_response_code(code);
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_key_ignores_case() {
        let a = new_query("Example.COM", RecordType::A).unwrap();
        let b = new_query("example.com", RecordType::A).unwrap();
        let c = new_query("example.com", RecordType::AAAA).unwrap();

        assert_eq!(question_key(&a.queries()[0]), question_key(&b.queries()[0]));
        assert_ne!(question_key(&a.queries()[0]), question_key(&c.queries()[0]));
    }

    #[test]
    fn msg_domain_strips_root() {
        let q = new_query("example.com", RecordType::A).unwrap();

        assert_eq!(msg_domain(&q), "example.com");
        assert_eq!(msg_domain(&Message::new()), "");
    }

    #[test]
    fn extracts_ips_in_order() {
        let q = new_query("example.com", RecordType::A).unwrap();
        let ips: Vec<IpAddr> = vec!["1.1.1.1".parse().unwrap(), "2.2.2.2".parse().unwrap()];
        let resp = testing::answer(&q, &ips, 60);

        assert_eq!(msg_to_ips(&resp), ips);
    }

    #[test]
    fn ttl_rewrite_and_cache_ttl() {
        let q = new_query("example.com", RecordType::A).unwrap();
        let mut resp = testing::answer(&q, &["1.1.1.1".parse().unwrap()], 300);

        assert_eq!(cache_ttl(&resp), Some(Duration::from_secs(300)));

        set_msg_ttl(&mut resp, 1);
        assert_eq!(resp.answers()[0].ttl(), 1);
    }

    #[test]
    fn empty_message_is_not_cacheable() {
        let q = new_query("example.com", RecordType::A).unwrap();
        let resp = testing::answer(&q, &[], 300);

        assert_eq!(cache_ttl(&resp), None);
    }

    #[test]
    fn address_questions() {
        let a = new_query("example.com", RecordType::A).unwrap();
        let mx = new_query("example.com", RecordType::MX).unwrap();

        assert!(is_ip_request(&a.queries()[0]));
        assert!(!is_ip_request(&mx.queries()[0]));
    }

    #[test]
    fn failure_codes() {
        assert!(is_failure_rcode(ResponseCode::ServFail));
        assert!(is_failure_rcode(ResponseCode::Refused));
        assert!(!is_failure_rcode(ResponseCode::NXDomain));
    }
}
