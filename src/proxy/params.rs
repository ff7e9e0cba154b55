//! Ordered multimap over `application/x-www-form-urlencoded` pairs.
//!
//! Used for both URL query strings and POST form bodies so that every rewrite
//! (stripping the tenant parameter, replacing `query`, rewriting `match[]`
//! entries in place) goes through one representation, and re-encoding happens
//! exactly once when the request is forwarded.

use url::form_urlencoded;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    pairs: Vec<(String, String)>,
}

impl Params {
    pub fn parse(raw: &str) -> Self {
        Self::parse_bytes(raw.as_bytes())
    }

    pub fn parse_bytes(raw: &[u8]) -> Self {
        Self {
            pairs: form_urlencoded::parse(raw).into_owned().collect(),
        }
    }

    /// First value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Remove every pair with `key`; reports whether anything was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.pairs.len();
        self.pairs.retain(|(k, _)| k != key);
        self.pairs.len() != before
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Mutable access to every value stored under `key`, in order. Lets a
    /// rewriter replace values without disturbing their position.
    pub fn values_mut<'a>(&'a mut self, key: &'a str) -> impl Iterator<Item = &'a mut String> {
        self.pairs
            .iter_mut()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn encode(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (k, v) in &self.pairs {
            serializer.append_pair(k, v);
        }
        serializer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_get() {
        let p = Params::parse("a=1&b=2&a=3");
        assert_eq!(p.get("a"), Some("1"));
        assert_eq!(p.get_all("a"), vec!["1", "3"]);
        assert_eq!(p.get("missing"), None);
    }

    #[test]
    fn remove_strips_all_occurrences() {
        let mut p = Params::parse("a=1&b=2&a=3");
        assert!(p.remove("a"));
        assert!(!p.remove("a"));
        assert_eq!(p.encode(), "b=2");
    }

    #[test]
    fn values_mut_rewrites_in_place() {
        let mut p = Params::parse("match%5B%5D=up&other=x&match%5B%5D=down");
        for v in p.values_mut("match[]") {
            v.push_str("{tenant=\"a\"}");
        }
        assert_eq!(
            p.get_all("match[]"),
            vec!["up{tenant=\"a\"}", "down{tenant=\"a\"}"]
        );
        // Position relative to other keys is preserved.
        assert!(p.encode().starts_with("match%5B%5D="));
    }

    #[test]
    fn encode_percent_encodes() {
        let mut p = Params::default();
        p.push("query", r#"up{tenant="a"}"#);
        assert_eq!(p.encode(), "query=up%7Btenant%3D%22a%22%7D");
    }

    #[test]
    fn roundtrip_decodes_plus_and_percent() {
        let p = Params::parse("q=a+b%26c");
        assert_eq!(p.get("q"), Some("a b&c"));
    }
}
