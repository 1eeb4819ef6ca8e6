// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

// Dotted firmware versions and their total order

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::de::{Deserializer, Error as _};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::Error;

/// A firmware version: a dotted sequence of non-negative integers, such as `1.12.0`.
///
/// Versions are compared component-wise after padding the shorter one with
/// zeros, so `1.2` and `1.2.0` are equal. Pre-release or build suffixes are
/// not supported and fail to parse.
#[derive(Debug, Clone)]
pub struct Version {
    components: Vec<u64>,
}

impl Version {
    /// Build a version from its components. An empty list is version `0`.
    pub fn new(components: Vec<u64>) -> Self {
        if components.is_empty() {
            return Self {
                components: vec![0],
            };
        }
        Self { components }
    }

    /// The dotted components, as written.
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// Whether `self` is strictly greater than `other`.
    pub fn is_newer_than(&self, other: &Version) -> bool {
        self > other
    }

    /// Parse a release tag such as `v1.2.0`, stripping one leading `v` or `V`.
    pub fn from_tag(tag: &str) -> Result<Self, Error> {
        let trimmed = tag
            .strip_prefix('v')
            .or_else(|| tag.strip_prefix('V'))
            .unwrap_or(tag);
        trimmed.parse()
    }

    // Components without trailing zeros, identical for all equal versions.
    fn significant(&self) -> &[u64] {
        let len = self
            .components
            .iter()
            .rposition(|c| *c != 0)
            .map_or(0, |i| i + 1);
        &self.components[..len]
    }

    fn component(&self, i: usize) -> u64 {
        self.components.get(i).copied().unwrap_or(0)
    }
}

/// Compare two versions.
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.cmp(b)
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let components = s
            .split('.')
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Error::MalformedVersion(s.to_string()));
                }
                part.parse::<u64>()
                    .map_err(|_| Error::MalformedVersion(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { components })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.components.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
