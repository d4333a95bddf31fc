//! Parsing of the YAML bodies returned by `stats*` and `list-tubes*`.
//!
//! beanstalkd only emits two shapes: a flat `key: value` mapping and a
//! flat `- item` sequence, both preceded by a `---` document marker. A
//! line-oriented parser covers both.

use std::collections::BTreeMap;

use crate::error::QueueError;

/// A flat statistics mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats(BTreeMap<String, String>);

impl Stats {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Numeric value of `key`, if present and numeric.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
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
}

fn body_lines(body: &[u8]) -> Result<impl Iterator<Item = &str>, QueueError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| QueueError::Malformed(format!("non-UTF-8 YAML body: {e}")))?;
    Ok(text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && *line != "---"))
}

/// Parse a `key: value` mapping.
pub fn parse_dict(body: &[u8]) -> Result<Stats, QueueError> {
    let mut map = BTreeMap::new();
    for line in body_lines(body)? {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| QueueError::Malformed(format!("not a mapping entry: {line}")))?;
        map.insert(key.trim().to_string(), unquote(value.trim()).to_string());
    }
    Ok(Stats(map))
}

/// Parse a `- item` sequence.
pub fn parse_list(body: &[u8]) -> Result<Vec<String>, QueueError> {
    body_lines(body)?
        .map(|line| {
            line.strip_prefix("- ")
                .or_else(|| line.strip_prefix('-'))
                .map(|item| unquote(item.trim()).to_string())
                .ok_or_else(|| QueueError::Malformed(format!("not a sequence entry: {line}")))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}
