//! Typed access to the store's collection structures.
//!
//! Every key lives under `{prefix}:{kind}:{key}` and every stored value goes
//! through canonical JSON, so numbers, strings and objects read back exactly
//! as written and equal values always encode to the same member.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::canonical_json;
use crate::store::StoreError;

mod service;

pub use service::{
    CleanupPolicy, CleanupReport, DataStats, KindStats, ListEnd, StructuredDataService,
};

/// Result type for structured data operations.
pub type Result<T> = std::result::Result<T, DataError>;

/// Errors that can occur during structured data operations.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Data serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DataError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Collection structure a key holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    Hash,
    Set,
    SortedSet,
    List,
    HyperLogLog,
    Geo,
}

impl DataKind {
    pub const ALL: [DataKind; 6] = [
        DataKind::Hash,
        DataKind::Set,
        DataKind::SortedSet,
        DataKind::List,
        DataKind::HyperLogLog,
        DataKind::Geo,
    ];

    pub fn segment(&self) -> &'static str {
        match self {
            Self::Hash => "hash",
            Self::Set => "set",
            Self::SortedSet => "zset",
            Self::List => "list",
            Self::HyperLogLog => "hll",
            Self::Geo => "geo",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

/// Encode a value as canonical JSON.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(canonical_json(&serde_json::to_value(value)?))
}

pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| DataError::Serialization(format!("Cannot decode '{}': {}", raw, e)))
}
