//! Versioned router state.
//!
//! Rules, the proxy set, the operating mode and the interception settings
//! live in one immutable snapshot. Readers take the whole snapshot at the
//! start of a dispatch, so a reload that swaps rules and proxies together is
//! never observed half applied.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::outbound::{Outbound, ProxyLookup, REJECT, Reject};
use crate::rule::{Condition, Rule, ScriptMatcher};
use crate::trie::DomainTrie;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Every flow uses `DIRECT`.
    Direct,
    /// Every flow uses `GLOBAL`.
    Global,
    #[default]
    Rule,
    /// The script matcher picks the outbound.
    Script,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Direct => "direct",
            Mode::Global => "global",
            Mode::Rule => "rule",
            Mode::Script => "script",
        })
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Mode::Direct),
            "global" => Ok(Mode::Global),
            "rule" => Ok(Mode::Rule),
            "script" => Ok(Mode::Script),
            _ => Err(format!("unknown mode {s}")),
        }
    }
}

pub type ProxyMap = FxHashMap<String, Arc<dyn Outbound>>;

#[derive(Clone)]
pub struct RouterState {
    pub version: u64,
    pub mode: Mode,
    pub rules: Arc<[Rule]>,
    pub proxies: Arc<ProxyMap>,
    /// Hosts whose TCP flows go to the interception outbound.
    pub rewrite_hosts: Option<Arc<DomainTrie<()>>>,
    pub interception: Option<Arc<dyn Outbound>>,
    pub script: Option<Arc<dyn ScriptMatcher>>,
}

impl Default for RouterState {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl RouterState {
    /// `REJECT` is always part of the proxy set.
    pub fn new(rules: Vec<Rule>, proxies: Vec<Arc<dyn Outbound>>) -> Self {
        Self {
            version: 0,
            mode: Mode::default(),
            rules: rules.into(),
            proxies: Arc::new(proxy_map(proxies)),
            rewrite_hosts: None,
            interception: None,
            script: None,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn outbound(&self, name: &str) -> Option<Arc<dyn Outbound>> {
        self.proxies.get(name).cloned()
    }

    /// Configuration problems that still leave the router usable.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !matches!(self.rules.last().map(Rule::condition), Some(Condition::Match)) {
            warnings.push("rule list has no trailing MATCH; unmatched flows are rejected".into());
        }
        for rule in self.rules.iter() {
            if !self.proxies.contains_key(rule.outbound()) {
                warnings.push(format!(
                    "rule {rule:?} refers to unknown outbound {}",
                    rule.outbound()
                ));
            }
        }
        if self.mode == Mode::Script && self.script.is_none() {
            warnings.push("script mode without a script matcher".into());
        }

        for warning in &warnings {
            warn!("[Config] {warning}");
        }
        warnings
    }
}

fn proxy_map(proxies: Vec<Arc<dyn Outbound>>) -> ProxyMap {
    let mut map: ProxyMap = proxies
        .into_iter()
        .map(|p| (p.name().to_string(), p))
        .collect();
    map.entry(REJECT.to_string())
        .or_insert_with(|| Arc::new(Reject));
    map
}

/// Shared handle to the current [`RouterState`].
pub struct SharedState {
    current: ArcSwap<RouterState>,
}

impl SharedState {
    pub fn new(state: RouterState) -> Self {
        Self {
            current: ArcSwap::from_pointee(state),
        }
    }

    /// Consistent view for one dispatch.
    pub fn snapshot(&self) -> Arc<RouterState> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Swap rules and proxies as one unit.
    pub fn update(&self, rules: Vec<Rule>, proxies: Vec<Arc<dyn Outbound>>) {
        let rules: Arc<[Rule]> = rules.into();
        let proxies = Arc::new(proxy_map(proxies));
        self.apply(|state| {
            state.rules = rules.clone();
            state.proxies = proxies.clone();
        });
    }

    pub fn update_rules(&self, rules: Vec<Rule>) {
        let rules: Arc<[Rule]> = rules.into();
        self.apply(|state| state.rules = rules.clone());
    }

    pub fn update_proxies(&self, proxies: Vec<Arc<dyn Outbound>>) {
        let proxies = Arc::new(proxy_map(proxies));
        self.apply(|state| state.proxies = proxies.clone());
    }

    pub fn set_mode(&self, mode: Mode) {
        self.apply(|state| state.mode = mode);
        info!("[Config] mode set to {mode}");
    }

    pub fn set_interception(&self, outbound: Option<Arc<dyn Outbound>>) {
        self.apply(|state| state.interception = outbound.clone());
    }

    pub fn update_rewrites(&self, hosts: Option<Arc<DomainTrie<()>>>) {
        self.apply(|state| state.rewrite_hosts = hosts.clone());
    }

    pub fn update_script(&self, script: Option<Arc<dyn ScriptMatcher>>) {
        self.apply(|state| state.script = script.clone());
    }

    fn apply(&self, change: impl Fn(&mut RouterState)) {
        self.current.rcu(|current| {
            let mut next = RouterState::clone(current);
            change(&mut next);
            next.version = current.version + 1;
            next
        });
    }
}

impl ProxyLookup for SharedState {
    fn outbound(&self, name: &str) -> Option<Arc<dyn Outbound>> {
        self.current.load().proxies.get(name).cloned()
    }
}
