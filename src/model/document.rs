use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Schema version of a persisted record, `major.minor`.
///
/// Records sharing a major version are mutually loadable: missing
/// attributes fall back to schema defaults, unknown ones are ignored. A
/// different major version is not loadable and yields a placeholder plus a
/// recorded error instead of corrupting the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn is_loadable(&self, current: SchemaVersion) -> bool {
        self.major == current.major
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for SchemaVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| format!("invalid schema version '{s}'"))?;
        let major = major
            .parse()
            .map_err(|_| format!("invalid schema version '{s}'"))?;
        let minor = minor
            .parse()
            .map_err(|_| format!("invalid schema version '{s}'"))?;
        Ok(Self { major, minor })
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Self-describing persisted record: class tag + schema version + category
/// + attribute map. One of these per job file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "type")]
    pub type_name: String,
    pub version: SchemaVersion,
    pub category: String,
    pub attrs: Map<String, Value>,
}

impl Document {
    pub fn new(type_name: impl Into<String>, version: SchemaVersion, category: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            version,
            category: category.into(),
            attrs: Map::new(),
        }
    }
}

/// A non-fatal problem hit while loading a record, attached to the subtree
/// it affects. Loading continues for the rest of the object graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    /// Attribute path inside the record, e.g. `subjobs[1].backend`.
    pub path: String,
    pub reason: String,
}

impl LoadError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

/// The outcome of a tolerant load: always a usable value, plus whatever
/// went wrong on the way. Placeholders stand in for unloadable subtrees.
#[derive(Debug, Clone)]
pub struct LoadResult<T> {
    pub value: T,
    pub errors: Vec<LoadError>,
}

impl<T> LoadResult<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            errors: Vec::new(),
        }
    }

    pub fn with_errors(value: T, errors: Vec<LoadError>) -> Self {
        Self { value, errors }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
