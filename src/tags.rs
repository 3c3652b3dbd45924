//! Canonical tag representation.
//!
//! A tag line is the canonical string form of a set of `key=value` pairs:
//! `|k1=v1|k2=v2|` with keys lowercase and in ascending order. The empty
//! set is the empty string. Tag lines are compared byte for byte, so two
//! equal sets always produce the same line.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};

use crate::error::{Error, Result};

const TAG_SEPARATOR: char = '|';
const VALUE_SEPARATOR: char = '=';

/// Ordered key to value mapping of one tag set.
pub type TagMap = BTreeMap<String, String>;

/// Canonical serialized form of a tag set.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagLine(String);

impl TagLine {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builds the canonical line for a tag map. Keys are lowercased; keys
    /// and values must not contain the separator characters.
    pub fn from_map(map: &TagMap) -> Result<TagLine> {
        if map.is_empty() {
            return Ok(TagLine::default());
        }
        // re-key through lowercase so the output stays in ascending order
        let mut lowered = TagMap::new();
        for (k, v) in map {
            let key = k.to_ascii_lowercase();
            if key.is_empty() {
                return Err(Error::invalid_input("empty tag key"));
            }
            if key.contains(TAG_SEPARATOR)
                || key.contains(VALUE_SEPARATOR)
                || v.contains(TAG_SEPARATOR)
            {
                return Err(Error::invalid_input(format!(
                    "tag '{key}' contains a separator character"
                )));
            }
            lowered.insert(key, v.clone());
        }
        let mut out = String::new();
        out.push(TAG_SEPARATOR);
        for (key, v) in &lowered {
            out.push_str(key);
            out.push(VALUE_SEPARATOR);
            out.push_str(v);
            out.push(TAG_SEPARATOR);
        }
        Ok(TagLine(out))
    }

    /// Parses a line that is expected to already be canonical. Parsing is
    /// strict: wrong framing, unordered or uppercase keys, and pairs
    /// without a value separator are all errors.
    pub fn parse(line: &str) -> Result<TagMap> {
        let mut map = TagMap::new();
        if line.is_empty() {
            return Ok(map);
        }
        if !line.starts_with(TAG_SEPARATOR) || !line.ends_with(TAG_SEPARATOR) || line.len() < 2 {
            return Err(Error::invalid_input(format!(
                "tag line '{line}' is not wrapped in '{TAG_SEPARATOR}'"
            )));
        }
        let mut prev_key: Option<String> = None;
        for pair in line[1..line.len() - 1].split(TAG_SEPARATOR) {
            let (key, value) = pair.split_once(VALUE_SEPARATOR).ok_or_else(|| {
                Error::invalid_input(format!("tag pair '{pair}' has no '{VALUE_SEPARATOR}'"))
            })?;
            if key.is_empty() {
                return Err(Error::invalid_input(format!("empty key in tag line '{line}'")));
            }
            if key.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(Error::invalid_input(format!(
                    "tag key '{key}' must be lower case"
                )));
            }
            if let Some(prev) = &prev_key {
                if prev.as_str() >= key {
                    return Err(Error::invalid_input(format!(
                        "tag keys out of order: '{prev}' before '{key}'"
                    )));
                }
            }
            prev_key = Some(key.to_string());
            map.insert(key.to_string(), value.to_string());
        }
        Ok(map)
    }

    /// Parses and attaches a group id, producing the shared [`Tags`] triple.
    pub fn new_tags(&self, gid: i64) -> Result<Tags> {
        let map = Self::parse(&self.0)?;
        Ok(Tags {
            gid,
            line: self.clone(),
            map,
        })
    }
}

impl From<&str> for TagLine {
    fn from(s: &str) -> Self {
        TagLine(s.to_string())
    }
}

impl From<String> for TagLine {
    fn from(s: String) -> Self {
        TagLine(s)
    }
}

impl Display for TagLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable tag set with its synthetic group id. Created only by the
/// tag index and shared freely by readers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tags {
    gid: i64,
    line: TagLine,
    map: TagMap,
}

impl Tags {
    pub fn gid(&self) -> i64 {
        self.gid
    }

    pub fn line(&self) -> &TagLine {
        &self.line
    }

    /// Value of a tag, or the empty string when the tag is absent.
    pub fn get(&self, key: &str) -> &str {
        self.map.get(key).map(String::as_str).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_map_is_canonical() {
        let mut map = TagMap::new();
        map.insert("svc".into(), "api".into());
        map.insert("ENV".into(), "prod".into());
        let line = TagLine::from_map(&map).unwrap();
        assert_eq!(line.as_str(), "|env=prod|svc=api|");
    }

    #[test]
    fn empty_map_is_empty_line() {
        assert_eq!(TagLine::from_map(&TagMap::new()).unwrap(), TagLine::default());
        assert!(TagLine::parse("").unwrap().is_empty());
    }

    #[test]
    fn parse_round_trip() {
        let line = TagLine::from("|env=prod|svc=api|");
        let map = TagLine::parse(line.as_str()).unwrap();
        assert_eq!(map.get("env").unwrap(), "prod");
        assert_eq!(map.get("svc").unwrap(), "api");
        assert_eq!(TagLine::from_map(&map).unwrap(), line);
    }

    #[test]
    fn parse_is_strict() {
        for bad in [
            "env=prod",
            "|env=prod",
            "env=prod|",
            "|envprod|",
            "|ENV=prod|",
            "|svc=api|env=prod|",
            "|=v|",
            "|",
        ] {
            assert!(TagLine::parse(bad).is_err(), "accepted '{bad}'");
        }
    }

    #[test]
    fn new_tags_carries_the_triple() {
        let line = TagLine::from("|env=prod|");
        let tags = line.new_tags(42).unwrap();
        assert_eq!(tags.gid(), 42);
        assert_eq!(tags.line(), &line);
        assert_eq!(tags.get("env"), "prod");
        assert_eq!(tags.get("missing"), "");
    }

    #[test]
    fn separators_in_keys_are_rejected() {
        let mut map = TagMap::new();
        map.insert("a|b".into(), "v".into());
        assert!(TagLine::from_map(&map).is_err());
        let mut map = TagMap::new();
        map.insert("k".into(), "v|w".into());
        assert!(TagLine::from_map(&map).is_err());
    }
}
