use crate::AllocatorKey;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// An immutable, order-independent set of labels.
///
/// The canonical encoding serializes entries in key order as `k=v;` pairs.
/// Characters that are meaningful to the encoding or to the store's path
/// grammar (`%`, `/`, `;`, `=`) are percent-escaped, so an encoding can be
/// embedded in a store path without ever containing `/`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSet(Arc<Map>);

pub type Map = BTreeMap<String, String>;

// === impl LabelSet ===

impl LabelSet {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Canonical encoding: entries in key order, `k=v;` per entry, escaped.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * 16);
        for (k, v) in self.0.iter() {
            escape_into(k, &mut out);
            out.push('=');
            escape_into(v, &mut out);
            out.push(';');
        }
        out
    }

    /// Decodes a canonical encoding.
    ///
    /// Decoding is lenient: pairs without a `=` separator are dropped so
    /// that foreign or truncated encodings still yield a usable key.
    pub fn decode(raw: &str) -> Self {
        let mut map = Map::new();
        for pair in raw.split(';') {
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((k, v)) => {
                    map.insert(unescape(k), unescape(v));
                }
                None => {
                    tracing::debug!(%pair, "dropping label pair without separator");
                }
            }
        }
        Self(Arc::new(map))
    }
}

impl From<Map> for LabelSet {
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl AsRef<Map> for LabelSet {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl std::iter::FromIterator<(String, String)> for LabelSet {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for LabelSet {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl AllocatorKey for LabelSet {
    fn as_key(&self) -> String {
        self.encode()
    }

    fn put_key(raw: &str) -> Self {
        Self::decode(raw)
    }
}

fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            ';' => out.push_str("%3B"),
            '=' => out.push_str("%3D"),
            c => out.push(c),
        }
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match s.get(i + 1..i + 3) {
            Some("25") => out.push('%'),
            Some("2F") => out.push('/'),
            Some("3B") => out.push(';'),
            Some("3D") => out.push('='),
            // Unknown escape: keep the literal.
            _ => {
                out.push('%');
                continue;
            }
        }
        chars.next();
        chars.next();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_sorted_and_order_independent() {
        let a = LabelSet::from_iter([("env", "prod"), ("app", "web")]);
        let b = LabelSet::from_iter([("app", "web"), ("env", "prod")]);
        assert_eq!(a.encode(), "app=web;env=prod;");
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn separators_are_escaped() {
        let labels = LabelSet::from_iter([("ns/name", "a=b;c"), ("pct", "50%")]);
        let encoded = labels.encode();
        assert!(!encoded.contains('/'), "{encoded}");
        assert_eq!(encoded, "ns%2Fname=a%3Db%3Bc;pct=50%25;");
        assert_eq!(LabelSet::decode(&encoded), labels);
    }

    #[test]
    fn empty_values_round_trip() {
        let labels = LabelSet::from_iter([("reserved", "")]);
        assert_eq!(labels.encode(), "reserved=;");
        assert_eq!(LabelSet::decode("reserved=;"), labels);
    }

    #[test]
    fn decode_drops_malformed_pairs() {
        let decoded = LabelSet::decode("app=web;garbage;env=prod;");
        assert_eq!(decoded.get("app"), Some("web"));
        assert_eq!(decoded.get("env"), Some("prod"));
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn unknown_escapes_are_preserved() {
        assert_eq!(unescape("a%zzb"), "a%zzb");
        assert_eq!(unescape("trailing%"), "trailing%");
    }
}
