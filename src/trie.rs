//! Domain trie with wildcard support.
//!
//! Labels are stored right to left. Supported patterns:
//!
//! - `www.example.com` exact name
//! - `*.example.com` exactly one extra label
//! - `sub.*.example.com` wildcard in the middle
//! - `.example.com` any number of extra labels (but not the bare name)
//! - `+.example.com` the bare name and any subdomain

use rustc_hash::FxHashMap;
use thiserror::Error;

const WILDCARD: &str = "*";
const DOT_WILDCARD: &str = "";
const COMPLEX_WILDCARD: &str = "+";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid domain {0}")]
pub struct InvalidDomain(pub String);

#[derive(Debug, Clone)]
struct Node<T> {
    children: FxHashMap<String, Node<T>>,
    data: Option<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: FxHashMap::default(),
            data: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DomainTrie<T> {
    root: Node<T>,
    len: usize,
}

impl<T> Default for DomainTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn split_domain(domain: &str) -> Option<Vec<&str>> {
    if domain.is_empty() || domain.ends_with('.') {
        return None;
    }

    let parts: Vec<&str> = domain.split('.').collect();
    if parts[1..].iter().any(|part| part.is_empty()) {
        return None;
    }

    Some(parts)
}

impl<T> DomainTrie<T> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
            len: 0,
        }
    }

    /// Find the data for `domain`.
    ///
    /// Priority: exact label, then `*`, then `.` wildcard.
    pub fn search(&self, domain: &str) -> Option<&T> {
        let lowered = domain.to_ascii_lowercase();
        let parts = split_domain(&lowered)?;
        if parts[0].is_empty() {
            return None;
        }

        search_node(&self.root, &parts)?.data.as_ref()
    }

    /// Number of inserted patterns.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T: Clone> DomainTrie<T> {
    /// Insert a pattern. Patterns are case-insensitive.
    pub fn insert(&mut self, domain: &str, data: T) -> Result<(), InvalidDomain> {
        let lowered = domain.to_ascii_lowercase();
        let Some(mut parts) = split_domain(&lowered) else {
            return Err(InvalidDomain(domain.to_string()));
        };

        if parts[0] == COMPLEX_WILDCARD {
            self.insert_parts(&parts[1..], data.clone());
            parts[0] = DOT_WILDCARD;
        }
        self.insert_parts(&parts, data);
        self.len += 1;

        Ok(())
    }

    fn insert_parts(&mut self, parts: &[&str], data: T) {
        let mut node = &mut self.root;
        for part in parts.iter().rev() {
            node = node.children.entry((*part).to_string()).or_default();
        }
        node.data = Some(data);
    }
}

fn search_node<'a, T>(node: &'a Node<T>, parts: &[&str]) -> Option<&'a Node<T>> {
    let Some((last, rest)) = parts.split_last() else {
        return Some(node);
    };

    if let Some(child) = node.children.get(*last) {
        if let Some(found) = search_node(child, rest).filter(|n| n.data.is_some()) {
            return Some(found);
        }
    }

    if let Some(child) = node.children.get(WILDCARD) {
        if let Some(found) = search_node(child, rest).filter(|n| n.data.is_some()) {
            return Some(found);
        }
    }

    node.children.get(DOT_WILDCARD)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie(patterns: &[&str]) -> DomainTrie<&'static str> {
        let mut t = DomainTrie::new();
        for p in patterns {
            t.insert(p, "hit").unwrap();
        }
        t
    }

    #[test]
    fn exact_match() {
        let t = trie(&["example.com"]);

        assert!(t.search("example.com").is_some());
        assert!(t.search("EXAMPLE.com").is_some());
        assert!(t.search("www.example.com").is_none());
    }

    #[test]
    fn single_label_wildcard() {
        let t = trie(&["*.example.com"]);

        assert!(t.search("www.example.com").is_some());
        assert!(t.search("a.b.example.com").is_none());
        assert!(t.search("example.com").is_none());
    }

    #[test]
    fn middle_wildcard() {
        let t = trie(&["sub.*.example.com"]);

        assert!(t.search("sub.foo.example.com").is_some());
        assert!(t.search("sub.example.com").is_none());
    }

    #[test]
    fn dot_wildcard_matches_any_depth() {
        let t = trie(&[".example.com"]);

        assert!(t.search("a.example.com").is_some());
        assert!(t.search("a.b.c.example.com").is_some());
        assert!(t.search("example.com").is_none());
    }

    #[test]
    fn complex_wildcard_includes_bare_name() {
        let t = trie(&["+.example.com"]);

        assert!(t.search("example.com").is_some());
        assert!(t.search("deep.sub.example.com").is_some());
        assert!(t.search("notexample.com").is_none());
    }

    #[test]
    fn exact_beats_wildcard() {
        let mut t = DomainTrie::new();
        t.insert("+.example.com", 1).unwrap();
        t.insert("www.example.com", 2).unwrap();

        assert_eq!(t.search("www.example.com"), Some(&2));
        assert_eq!(t.search("api.example.com"), Some(&1));
    }

    #[test]
    fn rejects_invalid_patterns() {
        let mut t = DomainTrie::new();

        assert!(t.insert("", 1).is_err());
        assert!(t.insert("example.com.", 1).is_err());
        assert!(t.insert("a..com", 1).is_err());
        assert!(t.search("").is_none());
    }
}
