use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
};

use crate::errors::{
    Error,
    Result,
};

/// Sources may be encoded into fixed-width wire coordinates, so the set size
/// is bounded.
pub const MAX_SOURCES: usize = u16::MAX as usize;

const MAX_SOURCE_NAME_LENGTH: usize = 128;

/// A named writer identity. Each source contributes one coordinate of the
/// [`Clock`](crate::clock::Clock) and owns one monotonic sequence of writes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceName(String);

impl SourceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Placeholder identity for diagnostics on a coordinate with no
    /// resolvable name.
    pub fn unknown() -> Self {
        Self("unknown".to_owned())
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SourceName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidSourceName("source names may not be empty".into()));
        }
        if s.len() > MAX_SOURCE_NAME_LENGTH {
            return Err(Error::InvalidSourceName(format!(
                "source name {s} is longer than {MAX_SOURCE_NAME_LENGTH} bytes"
            )));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::InvalidSourceName(format!(
                "source name {s} may only contain a-z, A-Z, 0-9, underscores and dashes"
            )));
        }
        Ok(Self(s.to_owned()))
    }
}

/// The fixed, process-wide source order. Both ends of a retention stream
/// must agree on it: clocks are serialized as one integer per source in this
/// order, and persisted watermark files are validated against it on startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSet {
    names: Vec<SourceName>,
    by_name: BTreeMap<SourceName, usize>,
}

impl SourceSet {
    pub fn new(names: Vec<SourceName>) -> Result<Self> {
        if names.is_empty() {
            return Err(Error::InvariantViolation(
                "a source set must declare at least one source".into(),
            ));
        }
        if names.len() > MAX_SOURCES {
            return Err(Error::InvariantViolation(format!(
                "a source set may declare at most {MAX_SOURCES} sources"
            )));
        }
        let mut by_name = BTreeMap::new();
        for (coordinate, name) in names.iter().enumerate() {
            if by_name.insert(name.clone(), coordinate).is_some() {
                return Err(Error::InvariantViolation(format!(
                    "duplicate source {name} in source set"
                )));
            }
        }
        Ok(Self { names, by_name })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// The coordinate of `name` in clock order.
    pub fn coordinate(&self, name: &SourceName) -> Result<usize> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownSource(name.clone()))
    }

    pub fn contains(&self, name: &SourceName) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn name(&self, coordinate: usize) -> Option<&SourceName> {
        self.names.get(coordinate)
    }

    pub fn names(&self) -> impl Iterator<Item = &SourceName> {
        self.names.iter()
    }
}

impl FromStr for SourceSet {
    type Err = Error;

    /// Parses a comma-separated source list, e.g. `"members,jobs"`.
    fn from_str(s: &str) -> Result<Self> {
        let names = s
            .split(',')
            .map(|name| name.trim().parse())
            .collect::<Result<Vec<_>>>()?;
        Self::new(names)
    }
}
