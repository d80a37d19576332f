//! Type prefixed, time sortable identifiers
//!
//! Every persisted entity is keyed by `<prefix>_<32 hex digits>` where the hex part is a UUIDv7.
//! The leading 48 bits of a UUIDv7 are a millisecond timestamp, so the lexicographic order of the
//! string matches creation order. Within one process the generator is additionally forced to be
//! strictly increasing, identifiers created in the same millisecond still sort by creation.
use parking_lot::{const_mutex, Mutex};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{cmp::Ordering, fmt, hash::Hash, marker::PhantomData, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// last handed out value, see `next_uuid`
static LAST: Mutex<u128> = const_mutex(0);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdError {
    #[error("expected an id with prefix '{expected}_', got '{value}'")]
    Prefix { expected: &'static str, value: String },
    #[error("id '{0}' does not carry a valid 128 bit hex suffix")]
    Suffix(String),
}

/// Marker for an entity type that owns an id prefix
pub trait Kind {
    const PREFIX: &'static str;
}

macro_rules! kinds {
    ($($(#[$meta:meta])* $name:ident => $prefix:literal),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            pub struct $name;

            impl Kind for $name {
                const PREFIX: &'static str = $prefix;
            }
        )*
    };
}

kinds! {
    /// a single benchmark row
    BenchmarkKind => "bmk",
    /// a batch of benchmarks produced by one invocation
    GroupKind => "bmkgrp",
    ResultKind => "bmkres",
    SystemMetricKind => "sysmet",
    SystemConfigKind => "syscfg",
}

pub type BenchmarkId = Id<BenchmarkKind>;
pub type GroupId = Id<GroupKind>;
pub type ResultId = Id<ResultKind>;
pub type SystemMetricId = Id<SystemMetricKind>;
pub type SystemConfigId = Id<SystemConfigKind>;

/// An immutable identifier of entity kind `K`
pub struct Id<K> {
    value: String,
    kind: PhantomData<K>,
}

/// strictly increasing UUIDv7 source for this process
fn next_uuid() -> Uuid {
    let mut last = LAST.lock();
    let mut candidate = Uuid::now_v7().as_u128();

    if candidate <= *last {
        candidate = *last + 1;
    }
    *last = candidate;

    Uuid::from_u128(candidate)
}

impl<K: Kind> Id<K> {
    /// generate a fresh id for the current point in time
    pub fn new() -> Self {
        Self {
            value: format!("{}_{}", K::PREFIX, next_uuid().simple()),
            kind: PhantomData,
        }
    }

    /// validate a foreign string as an id of this kind
    pub fn parse(value: &str) -> Result<Self, IdError> {
        let suffix = value
            .strip_prefix(K::PREFIX)
            .and_then(|rest| rest.strip_prefix('_'))
            .ok_or_else(|| IdError::Prefix {
                expected: K::PREFIX,
                value: value.to_owned(),
            })?;

        if suffix.len() != 32 || Uuid::try_parse(suffix).is_err() {
            return Err(IdError::Suffix(value.to_owned()));
        }

        Ok(Self {
            value: value.to_ascii_lowercase(),
            kind: PhantomData,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<K: Kind> Default for Id<K> {
    fn default() -> Self {
        Self::new()
    }
}

// manual impls, derives would put bounds on `K`

impl<K> Clone for Id<K> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            kind: PhantomData,
        }
    }
}

impl<K> PartialEq for Id<K> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<K> Eq for Id<K> {}

impl<K> PartialOrd for Id<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Id<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl<K> Hash for Id<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state)
    }
}

impl<K> fmt::Debug for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<K> fmt::Display for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<K: Kind> FromStr for Id<K> {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<K> Serialize for Id<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

impl<'de, K: Kind> Deserialize<'de> for Id<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;

        Self::parse(&value).map_err(de::Error::custom)
    }
}

impl<K> ToSql for Id<K> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.value.as_str()))
    }
}

impl<K: Kind> FromSql for Id<K> {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let value = value.as_str()?;

        Self::parse(value).map_err(|error| FromSqlError::Other(Box::new(error)))
    }
}
