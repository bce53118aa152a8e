//! Strongly-typed identifiers.
//!
//! `Id<T>` wraps a ULID and carries a zero-sized marker so that a durable
//! record id can never be passed where a lock lease token is expected.
//! ULIDs sort by creation time, which the stores rely on for stable
//! pagination.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait providing the display prefix of an id type.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Parses either the prefixed display form (`job-01H...`) or a bare ULID.
    pub fn parse(raw: &str) -> Option<Self> {
        let bare = raw.strip_prefix(T::prefix()).unwrap_or(raw);
        Ulid::from_string(bare).ok().map(Self::from_ulid)
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let bare = raw.strip_prefix(T::prefix()).unwrap_or(raw);
        Ulid::from_string(bare).map(Self::from_ulid)
    }
}

/// Marker for durable job records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Record {}

impl IdMarker for Record {
    fn prefix() -> &'static str {
        "job-"
    }
}

/// Marker for distributed lock leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lease {}

impl IdMarker for Lease {
    fn prefix() -> &'static str {
        "lease-"
    }
}

/// Internal id of a durable job record (distinct from the producer-supplied identifier).
pub type RecordId = Id<Record>;

/// Token proving ownership of a lock lease.
pub type LeaseToken = Id<Lease>;
