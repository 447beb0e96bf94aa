//! Routing rules.
//!
//! A rule pairs one condition over flow [`Metadata`] with the name of the
//! outbound that carries matching flows. Rules are immutable once built and
//! are evaluated in order by the tunnel dispatcher.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::debug;

use crate::error::RuleError;
use crate::filter::{DomainSet, GeoIpDatabase, GeoSiteDatabase, is_lan};
use crate::metadata::Metadata;

const NO_RESOLVE: &str = "no-resolve";

/// External policy evaluator used by `SCRIPT` rules and script mode.
pub trait ScriptMatcher: Send + Sync {
    /// Evaluate the named shortcut against a flow.
    fn matches(&self, shortcut: &str, metadata: &Metadata) -> Result<bool, String>;

    /// Outbound name chosen by the main script.
    fn eval(&self, metadata: &Metadata) -> Result<String, String>;
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    fn parse(payload: &str, kind: &'static str) -> Result<Self, RuleError> {
        let invalid = || RuleError::InvalidPayload {
            kind,
            payload: payload.to_string(),
        };
        let (start, end) = match payload.split_once('-') {
            Some((start, end)) => (start.trim(), end.trim()),
            None => (payload, payload),
        };
        let start: u16 = start.parse().map_err(|_| invalid())?;
        let end: u16 = end.parse().map_err(|_| invalid())?;
        if start > end {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

#[derive(Clone)]
pub enum Condition {
    Domain(String),
    DomainSuffix(String),
    DomainKeyword(String),
    GeoSite {
        code: String,
        set: Arc<DomainSet>,
    },
    GeoIp {
        code: String,
        db: Arc<GeoIpDatabase>,
        no_resolve: bool,
    },
    IpCidr {
        net: IpNet,
        no_resolve: bool,
    },
    SrcIpCidr(IpNet),
    SrcPort(PortRange),
    DstPort(PortRange),
    Process(String),
    ProcessPath(String),
    Script {
        shortcut: String,
        matcher: Arc<dyn ScriptMatcher>,
    },
    UserAgent(String),
    Match,
}

/// Databases and collaborators rule lines refer to by name.
#[derive(Clone, Default)]
pub struct RuleContext {
    pub geoip: Arc<GeoIpDatabase>,
    pub geosite: Arc<GeoSiteDatabase>,
    pub script: Option<Arc<dyn ScriptMatcher>>,
}

#[derive(Clone)]
pub struct Rule {
    condition: Condition,
    outbound: String,
}

impl Rule {
    pub fn new(condition: Condition, outbound: impl Into<String>) -> Self {
        Self {
            condition,
            outbound: outbound.into(),
        }
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    /// Name of the outbound that carries matching flows.
    pub fn outbound(&self) -> &str {
        &self.outbound
    }

    /// Matching needs the destination IP; the dispatcher resolves the host
    /// before evaluating this rule when the flow has none yet.
    pub fn should_resolve_ip(&self) -> bool {
        match &self.condition {
            Condition::GeoIp { no_resolve, .. } | Condition::IpCidr { no_resolve, .. } => {
                !no_resolve
            }
            _ => false,
        }
    }

    /// Matching needs the owning process of the flow.
    pub fn should_find_process(&self) -> bool {
        matches!(
            self.condition,
            Condition::Process(_) | Condition::ProcessPath(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match &self.condition {
            Condition::Domain(_) => "Domain",
            Condition::DomainSuffix(_) => "DomainSuffix",
            Condition::DomainKeyword(_) => "DomainKeyword",
            Condition::GeoSite { .. } => "GeoSite",
            Condition::GeoIp { .. } => "GeoIP",
            Condition::IpCidr { .. } => "IPCIDR",
            Condition::SrcIpCidr(_) => "SrcIPCIDR",
            Condition::SrcPort(_) => "SrcPort",
            Condition::DstPort(_) => "DstPort",
            Condition::Process(_) => "Process",
            Condition::ProcessPath(_) => "ProcessPath",
            Condition::Script { .. } => "Script",
            Condition::UserAgent(_) => "UserAgent",
            Condition::Match => "Match",
        }
    }

    pub fn payload(&self) -> String {
        match &self.condition {
            Condition::Domain(v)
            | Condition::DomainSuffix(v)
            | Condition::DomainKeyword(v)
            | Condition::Process(v)
            | Condition::ProcessPath(v)
            | Condition::UserAgent(v) => v.clone(),
            Condition::GeoSite { code, .. } | Condition::GeoIp { code, .. } => code.clone(),
            Condition::IpCidr { net, .. } | Condition::SrcIpCidr(net) => net.to_string(),
            Condition::SrcPort(range) | Condition::DstPort(range) => range.to_string(),
            Condition::Script { shortcut, .. } => shortcut.clone(),
            Condition::Match => String::new(),
        }
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        let host = metadata.host.as_str();
        match &self.condition {
            Condition::Domain(domain) => host.eq_ignore_ascii_case(domain),
            Condition::DomainSuffix(suffix) => has_suffix(host, suffix),
            Condition::DomainKeyword(keyword) => {
                !host.is_empty() && host.to_ascii_lowercase().contains(keyword.as_str())
            }
            Condition::GeoSite { set, .. } => set.contains(host),
            Condition::GeoIp { code, db, .. } => metadata.dst_ip.is_some_and(|ip| {
                if code == "LAN" {
                    is_lan(ip)
                } else {
                    db.contains(code, ip)
                }
            }),
            Condition::IpCidr { net, .. } => in_net(net, metadata.dst_ip),
            Condition::SrcIpCidr(net) => in_net(net, metadata.src_ip),
            Condition::SrcPort(range) => range.contains(metadata.src_port),
            Condition::DstPort(range) => range.contains(metadata.dst_port),
            Condition::Process(name) => {
                !metadata.process.is_empty() && metadata.process.eq_ignore_ascii_case(name)
            }
            Condition::ProcessPath(path) => {
                !metadata.process_path.is_empty() && metadata.process_path.eq_ignore_ascii_case(path)
            }
            Condition::Script { shortcut, matcher } => match matcher.matches(shortcut, metadata) {
                Ok(matched) => matched,
                Err(err) => {
                    debug!("[Script] shortcut {shortcut} failed: {err}");
                    false
                }
            },
            Condition::UserAgent(pattern) => {
                !metadata.user_agent.is_empty() && wildcard_match(pattern, &metadata.user_agent)
            }
            Condition::Match => true,
        }
    }

    /// Parse one rule line: `TYPE,payload,outbound[,no-resolve]` or
    /// `MATCH,outbound`.
    pub fn parse(line: &str, ctx: &RuleContext) -> Result<Self, RuleError> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let malformed = || RuleError::Malformed(line.to_string());

        let kind = fields.first().copied().unwrap_or_default().to_ascii_uppercase();
        if kind == "MATCH" || kind == "FINAL" {
            let outbound = fields.get(1).filter(|s| !s.is_empty()).ok_or_else(malformed)?;
            return Ok(Self::new(Condition::Match, *outbound));
        }

        let (payload, outbound) = match (fields.get(1), fields.get(2)) {
            (Some(p), Some(o)) if !p.is_empty() && !o.is_empty() => (*p, *o),
            _ => return Err(malformed()),
        };
        let no_resolve = fields[3..].iter().any(|opt| opt.eq_ignore_ascii_case(NO_RESOLVE));

        let condition = match kind.as_str() {
            "DOMAIN" => Condition::Domain(payload.to_ascii_lowercase()),
            "DOMAIN-SUFFIX" => Condition::DomainSuffix(payload.to_ascii_lowercase()),
            "DOMAIN-KEYWORD" => Condition::DomainKeyword(payload.to_ascii_lowercase()),
            "GEOSITE" => {
                let set = ctx
                    .geosite
                    .get(payload)
                    .ok_or_else(|| RuleError::UnknownGeoSite(payload.to_string()))?;
                Condition::GeoSite {
                    code: payload.to_string(),
                    set,
                }
            }
            "GEOIP" => Condition::GeoIp {
                code: payload.to_ascii_uppercase(),
                db: ctx.geoip.clone(),
                no_resolve,
            },
            "IP-CIDR" | "IP-CIDR6" => Condition::IpCidr {
                net: parse_net(payload, "IPCIDR")?,
                no_resolve,
            },
            "SRC-IP-CIDR" => Condition::SrcIpCidr(parse_net(payload, "SrcIPCIDR")?),
            "SRC-PORT" => Condition::SrcPort(PortRange::parse(payload, "SrcPort")?),
            "DST-PORT" => Condition::DstPort(PortRange::parse(payload, "DstPort")?),
            "PROCESS-NAME" => Condition::Process(payload.to_string()),
            "PROCESS-PATH" => Condition::ProcessPath(payload.to_string()),
            "SCRIPT" => Condition::Script {
                shortcut: payload.to_string(),
                matcher: ctx
                    .script
                    .clone()
                    .ok_or_else(|| RuleError::NoScript(payload.to_string()))?,
            },
            "USER-AGENT" => Condition::UserAgent(payload.to_string()),
            _ => return Err(RuleError::UnknownType(kind)),
        };

        Ok(Self::new(condition, outbound))
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) -> {}", self.kind(), self.payload(), self.outbound)
    }
}

fn parse_net(payload: &str, kind: &'static str) -> Result<IpNet, RuleError> {
    payload
        .parse::<IpNet>()
        .or_else(|_| payload.parse::<IpAddr>().map(IpNet::from))
        .map(|net| net.trunc())
        .map_err(|_| RuleError::InvalidPayload {
            kind,
            payload: payload.to_string(),
        })
}

fn in_net(net: &IpNet, ip: Option<IpAddr>) -> bool {
    ip.is_some_and(|ip| net.contains(&ip.to_canonical()))
}

/// `host` equals `suffix` or is a subdomain of it.
fn has_suffix(host: &str, suffix: &str) -> bool {
    let (host, suffix) = (host.as_bytes(), suffix.as_bytes());
    if host.len() < suffix.len() || suffix.is_empty() {
        return false;
    }
    let split = host.len() - suffix.len();
    host[split..].eq_ignore_ascii_case(suffix) && (split == 0 || host[split - 1] == b'.')
}

/// Case-insensitive match where `*` stands for any run of characters. A
/// pattern without `*` matches as a substring.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let text = text.to_ascii_lowercase();
    if !pattern.contains('*') {
        return text.contains(&pattern);
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !text.starts_with(first) || !text.ends_with(last) || text.len() < first.len() + last.len()
    {
        return false;
    }

    let mut rest = &text[first.len()..text.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}
