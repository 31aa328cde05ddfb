//! Named peer URL maps (`name=url,name=url`).

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Member name to peer URLs, as given in the initial cluster configuration
/// or returned by discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlsMap {
    inner: BTreeMap<String, Vec<String>>,
}

impl UrlsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a URL for `name`, validating it first.
    pub fn insert(&mut self, name: impl Into<String>, url: &str) -> Result<()> {
        let url = normalize_url(url)?;
        let urls = self.inner.entry(name.into()).or_default();
        urls.push(url);
        urls.sort();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.inner.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Iterate `(name, urls)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Every URL in the map, sorted.
    pub fn urls(&self) -> Vec<String> {
        let mut all: Vec<String> = self.inner.values().flatten().cloned().collect();
        all.sort();
        all
    }

    /// The first URL that appears more than once, across all names.
    pub fn duplicate_url(&self) -> Option<String> {
        let mut seen = HashSet::new();
        self.inner
            .values()
            .flatten()
            .find(|u| !seen.insert(u.as_str()))
            .cloned()
    }
}

impl fmt::Display for UrlsMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, urls) in &self.inner {
            for url in urls {
                if !first {
                    f.write_str(",")?;
                }
                first = false;
                write!(f, "{}={}", name, url)?;
            }
        }
        Ok(())
    }
}

impl FromStr for UrlsMap {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        let mut map = UrlsMap::new();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, url) = pair.split_once('=').ok_or_else(|| {
                TesseraError::Config(format!("invalid url map entry {:?}, want name=url", pair))
            })?;
            if name.is_empty() {
                return Err(TesseraError::Config(format!(
                    "empty member name in url map entry {:?}",
                    pair
                )));
            }
            map.insert(name, url)?;
        }
        Ok(map)
    }
}

impl Serialize for UrlsMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UrlsMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse and canonicalize a peer URL. Only http and https are accepted and
/// a path is not allowed.
pub fn normalize_url(raw: &str) -> Result<String> {
    let url = reqwest::Url::parse(raw.trim())
        .map_err(|e| TesseraError::Config(format!("invalid url {:?}: {}", raw, e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(TesseraError::Config(format!(
            "url scheme must be http or https: {}",
            raw
        )));
    }
    if url.host_str().is_none() {
        return Err(TesseraError::Config(format!("url has no host: {}", raw)));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(TesseraError::Config(format!("url must not contain a path: {}", raw)));
    }

    Ok(url.as_str().trim_end_matches('/').to_string())
}

/// Compare two URL lists ignoring order.
pub fn urls_equal(a: &[String], b: &[String]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let map: UrlsMap = "b=http://10.0.0.2:2380,a=http://10.0.0.1:2380,a=http://10.0.1.1:2380"
            .parse()
            .unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.get("a").unwrap(),
            &["http://10.0.0.1:2380".to_string(), "http://10.0.1.1:2380".to_string()]
        );
        assert_eq!(
            map.to_string(),
            "a=http://10.0.0.1:2380,a=http://10.0.1.1:2380,b=http://10.0.0.2:2380"
        );
    }

    #[test]
    fn test_rejects_malformed_entries() {
        assert!("a".parse::<UrlsMap>().is_err());
        assert!("=http://10.0.0.1:2380".parse::<UrlsMap>().is_err());
        assert!("a=ftp://10.0.0.1".parse::<UrlsMap>().is_err());
        assert!("a=http://10.0.0.1:2380/path".parse::<UrlsMap>().is_err());
    }

    #[test]
    fn test_duplicate_url() {
        let map: UrlsMap = "a=http://10.0.0.1:2380,b=http://10.0.0.1:2380".parse().unwrap();
        assert_eq!(map.duplicate_url().as_deref(), Some("http://10.0.0.1:2380"));

        let map: UrlsMap = "a=http://10.0.0.1:2380,b=http://10.0.0.2:2380".parse().unwrap();
        assert!(map.duplicate_url().is_none());
    }

    #[test]
    fn test_urls_equal_ignores_order() {
        let a = vec!["http://b:1".to_string(), "http://a:1".to_string()];
        let b = vec!["http://a:1".to_string(), "http://b:1".to_string()];
        assert!(urls_equal(&a, &b));
        assert!(!urls_equal(&a, &b[..1]));
    }

    #[test]
    fn test_serde_as_string() {
        let map: UrlsMap = "infra1=http://127.0.0.1:2380".parse().unwrap();
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, "\"infra1=http://127.0.0.1:2380\"");
        let back: UrlsMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
