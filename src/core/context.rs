//! Matrix bindings and placeholder rendering

use once_cell::sync::Lazy;
use regex::Regex;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashMap;
use std::fmt;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{\{\s*matrix\.([A-Za-z0-9_.-]+)\s*\}\}").expect("placeholder regex is valid")
});

/// Concrete matrix values chosen for one job instance.
///
/// Pairs are kept in declared axis order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Bindings {
    pairs: Vec<(String, String)>,
}

impl Bindings {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    /// Get the value bound to an axis
    pub fn get(&self, axis: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True if every pair in `partial` is bound to the same value here
    pub fn matches_partial(&self, partial: &[(String, String)]) -> bool {
        partial
            .iter()
            .all(|(axis, value)| self.get(axis) == Some(value.as_str()))
    }

    /// Environment variables injected into every step of the instance
    pub fn to_env(&self) -> HashMap<String, String> {
        self.pairs
            .iter()
            .map(|(axis, value)| (format!("MATRIX_{}", env_key(axis)), value.clone()))
            .collect()
    }
}

impl fmt::Display for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .pairs
            .iter()
            .map(|(axis, value)| format!("{}={}", axis, value))
            .collect();
        write!(f, "{}", rendered.join(", "))
    }
}

impl Serialize for Bindings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.pairs.len()))?;
        for (axis, value) in &self.pairs {
            map.serialize_entry(axis, value)?;
        }
        map.end()
    }
}

/// Upper-case an axis or tool name into an environment variable key
pub fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Axes referenced by `${{ matrix.<axis> }}` placeholders in a template
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|cap| cap[1].to_string())
        .collect()
}

/// Replace `${{ matrix.<axis> }}` placeholders with bound values.
///
/// Placeholders are validated at load time, so an unbound axis renders empty.
pub fn render(template: &str, bindings: &Bindings) -> String {
    PLACEHOLDER
        .replace_all(template, |cap: &regex::Captures<'_>| {
            bindings.get(&cap[1]).unwrap_or_default().to_string()
        })
        .into_owned()
}

/// Split an argument line on whitespace, keeping `${{ ... }}` placeholders
/// whole so they render after the split.
pub fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut rest = line;

    while let Some(c) = rest.chars().next() {
        if rest.starts_with("${{") {
            let end = rest.find("}}").map(|i| i + 2).unwrap_or(rest.len());
            current.push_str(&rest[..end]);
            rest = &rest[end..];
        } else {
            if c.is_whitespace() {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            } else {
                current.push(c);
            }
            rest = &rest[c.len_utf8()..];
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
