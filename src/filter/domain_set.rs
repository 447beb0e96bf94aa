//! Named domain sets (geosite lists).
//!
//! A set holds full names, suffixes and keywords. Suffix lookup walks the
//! labels of the queried name so `ads.example.com` is covered by a
//! `example.com` suffix entry.

use rustc_hash::FxHashSet;

#[derive(Debug, Clone, Default)]
pub struct DomainSet {
    full: FxHashSet<String>,
    suffixes: FxHashSet<String>,
    keywords: Vec<String>,
}

impl DomainSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from list lines: `full:`, `domain:` (suffix, the default) and
    /// `keyword:` prefixes. Blank lines and `#` comments are skipped.
    pub fn from_lines(lines: &str) -> Self {
        let mut set = Self::new();
        for line in lines.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(':') {
                Some(("full", name)) => set.add_full(name),
                Some(("keyword", word)) => set.add_keyword(word),
                Some(("domain", suffix)) => set.add_suffix(suffix),
                _ => set.add_suffix(line),
            }
        }
        set
    }

    pub fn add_full(&mut self, name: &str) {
        self.full.insert(name.trim().to_lowercase());
    }

    pub fn add_suffix(&mut self, suffix: &str) {
        self.suffixes.insert(suffix.trim().to_lowercase());
    }

    pub fn add_keyword(&mut self, keyword: &str) {
        self.keywords.push(keyword.trim().to_lowercase());
    }

    /// Exact, suffix (including subdomains) or keyword match.
    pub fn contains(&self, domain: &str) -> bool {
        if domain.is_empty() {
            return false;
        }

        let domain = domain.to_lowercase();
        if self.full.contains(&domain) {
            return true;
        }

        let mut current = domain.as_str();
        loop {
            if self.suffixes.contains(current) {
                return true;
            }
            match current.find('.') {
                Some(pos) => current = &current[pos + 1..],
                None => break,
            }
        }

        self.keywords.iter().any(|k| domain.contains(k.as_str()))
    }

    pub fn len(&self) -> usize {
        self.full.len() + self.suffixes.len() + self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
