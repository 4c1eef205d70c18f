//! Key/value configuration
//!
//! Configurations travel as text, one `key = value` per line. A line that
//! ends in `.` and has no value opens a prefix, and following keys that
//! start with `.` are appended to it:
//!
//! ```text
//! trap.transport.socket.
//! .host = 127.0.0.1
//! .port = 4000
//! trap.maxchunksize = 1024
//! ```

use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Parsed configuration with sorted keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    options: BTreeMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration text. Malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::new();
        config.merge_text(text);
        config
    }

    /// Parse `text` and set every option it contains
    pub fn merge_text(&mut self, text: &str) {
        let mut prefix = String::new();

        for line in text.lines() {
            let line = line.trim();

            let pos = match line.find('=') {
                Some(pos) if pos < line.len() - 1 => pos,
                _ => {
                    if let Some(stripped) = line.strip_suffix('.') {
                        prefix = stripped.to_string();
                    }
                    continue;
                }
            };

            let key = line[..pos].trim();
            let value = line[pos + 1..].trim().replace("\\n", "\n");

            let key = if key.starts_with('.') {
                format!("{}{}", prefix, key)
            } else {
                prefix.clear();
                key.to_string()
            };

            self.options.insert(key, value);
        }
    }

    /// Copy every option of `other` into this configuration, overwriting
    pub fn merge(&mut self, other: &Configuration) {
        for (k, v) in &other.options {
            self.options.insert(k.clone(), v.clone());
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Look up `prefix.key`
    pub fn option_in(&self, prefix: &str, key: &str) -> Option<&str> {
        self.option(&format!("{}.{}", prefix, key))
    }

    pub fn set_option(&mut self, key: impl Into<String>, value: impl ToString) {
        self.options.insert(key.into(), value.to_string());
    }

    pub fn set_option_in(&mut self, prefix: &str, key: &str, value: impl ToString) {
        self.set_option(format!("{}.{}", prefix, key), value);
    }

    pub fn remove_option(&mut self, key: &str) -> Option<String> {
        self.options.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.options.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.option(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn int_option(&self, key: &str, default: i32) -> i32 {
        self.parsed(key).unwrap_or(default)
    }

    pub fn long_option(&self, key: &str, default: i64) -> i64 {
        self.parsed(key).unwrap_or(default)
    }

    /// Boolean option; only `true` (any case) is true
    pub fn bool_option(&self, key: &str, default: bool) -> bool {
        self.option(key)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    }

    pub fn string_option(&self, key: &str, default: &str) -> String {
        self.option(key).unwrap_or(default).to_string()
    }

    /// Options under `prefix`, with the prefix and its dot removed
    pub fn child(&self, prefix: &str) -> Configuration {
        let full = if prefix.ends_with('.') {
            prefix.to_string()
        } else {
            format!("{}.", prefix)
        };
        let options = self
            .options
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&full).map(|s| (s.to_string(), v.clone())))
            .collect();
        Configuration { options }
    }

    /// Lowercase hex MD5 of the serialized configuration
    pub fn digest(&self) -> String {
        hex::encode(Md5::digest(self.to_string().as_bytes()))
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.options {
            writeln!(f, "{} = {}", k, v.replace('\n', "\\n"))?;
        }
        Ok(())
    }
}

impl From<&str> for Configuration {
    fn from(text: &str) -> Self {
        Configuration::parse(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let cfg = Configuration::parse("a = 1\nb=two\n  c =  x y  \n");
        assert_eq!(cfg.option("a"), Some("1"));
        assert_eq!(cfg.option("b"), Some("two"));
        assert_eq!(cfg.option("c"), Some("x y"));
    }

    #[test]
    fn test_prefix_lines() {
        let cfg = Configuration::parse(
            "trap.transport.socket.\n.host = localhost\n.port = 80\nother = 1\n.orphan = 2",
        );
        assert_eq!(cfg.option("trap.transport.socket.host"), Some("localhost"));
        assert_eq!(cfg.option("trap.transport.socket.port"), Some("80"));
        assert_eq!(cfg.option("other"), Some("1"));
        assert_eq!(cfg.option(".orphan"), Some("2"));
    }

    #[test]
    fn test_skips_empty_values() {
        let cfg = Configuration::parse("novalue =\njunk\n\n");
        assert!(cfg.is_empty());
        assert_eq!(cfg.option("novalue"), None);
        assert_eq!(cfg.option("junk"), None);
    }

    #[test]
    fn test_newline_escape_roundtrip() {
        let mut cfg = Configuration::new();
        cfg.set_option("multi", "line one\nline two");
        let text = cfg.to_string();
        assert_eq!(text, "multi = line one\\nline two\n");
        assert_eq!(Configuration::parse(&text), cfg);
    }

    #[test]
    fn test_typed_getters() {
        let cfg = Configuration::parse("i = 42\nl = 9000000000\nb = TRUE\nbad = x");
        assert_eq!(cfg.int_option("i", 0), 42);
        assert_eq!(cfg.int_option("bad", 7), 7);
        assert_eq!(cfg.int_option("missing", -1), -1);
        assert_eq!(cfg.long_option("l", 0), 9_000_000_000);
        assert!(cfg.bool_option("b", false));
        assert!(!cfg.bool_option("bad", true));
        assert!(cfg.bool_option("missing", true));
    }

    #[test]
    fn test_child() {
        let cfg = Configuration::parse("x.a = 1\nx.b = 2\ny.a = 3");
        let child = cfg.child("x");
        assert_eq!(child.len(), 2);
        assert_eq!(child.option("a"), Some("1"));
        assert_eq!(child.option("b"), Some("2"));
    }

    #[test]
    fn test_digest_is_order_independent() {
        let a = Configuration::parse("k1 = v1\nk2 = v2");
        let b = Configuration::parse("k2 = v2\nk1 = v1");
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 32);
        assert_ne!(a.digest(), Configuration::parse("k1 = v1").digest());
    }
}
