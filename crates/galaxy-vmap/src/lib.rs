//! Convergent versioned map.
//!
//! Every key holds an unordered, append-only history of `(value, version)`
//! entries. The current value of a key is the entry with the highest version,
//! with ties broken by the lexicographically greatest value. Because an unset
//! is stored as the empty string, a concurrent set always beats a concurrent
//! unset at the same version without any special casing.
//!
//! Histories are never compacted in place, so [`VersionedMap::merge`] is
//! commutative, associative and idempotent with respect to the value each key
//! resolves to. Garbage collection is an explicit, read-only query
//! ([`VersionedMap::marshal_expired_map`]) whose result the caller removes from
//! its backing store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Flat string-to-string record map exchanged with the replicated store.
///
/// Each record key is `"<key>:<op>:<version>"` where `op` is `s` (set) or `u`
/// (unset); the record value is the entry's value (empty for unsets).
pub type WireMap = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum VmapError {
    #[error("invalid version '{version}' in record '{record}': {source}")]
    InvalidVersion {
        record: String,
        version: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("no version left after {version} for key '{key}'")]
    VersionOverflow { key: String, version: i64 },
}

/// Kind of write an entry represents on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOp {
    Set,
    UnSet,
}

impl EntryOp {
    pub fn as_wire(self) -> &'static str {
        match self {
            EntryOp::Set => "s",
            EntryOp::UnSet => "u",
        }
    }

    pub fn from_wire(op: &str) -> Option<Self> {
        match op {
            "s" => Some(EntryOp::Set),
            "u" => Some(EntryOp::UnSet),
            _ => None,
        }
    }
}

/// One write in a key's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub value: String,
    pub version: i64,
}

impl MapEntry {
    pub fn op(&self) -> EntryOp {
        if self.value.is_empty() {
            EntryOp::UnSet
        } else {
            EntryOp::Set
        }
    }

    /// True when `self` resolves ahead of `other`: higher version first, then
    /// the greater value.
    pub fn wins_over(&self, other: &MapEntry) -> bool {
        (self.version, self.value.as_str()) > (other.version, other.value.as_str())
    }

    fn wire_key(&self, key: &str) -> String {
        format!("{key}:{}:{}", self.op().as_wire(), self.version)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "WireMap", try_from = "WireMap")]
pub struct VersionedMap {
    values: BTreeMap<String, Vec<MapEntry>>,
}

impl VersionedMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from wire records.
    pub fn from_wire(serialized: &WireMap) -> Result<Self, VmapError> {
        let mut map = Self::new();
        map.unmarshal_map(serialized)?;
        Ok(map)
    }

    /// Write `value` at the next local version for `key`. Returns the version
    /// used.
    ///
    /// Fails when `key` already holds `i64::MAX`, which only a merged or
    /// replayed entry can put there.
    pub fn set(&mut self, key: &str, value: &str) -> Result<i64, VmapError> {
        let version = self.next_version(key)?;
        self.set_version(key, value, version);
        Ok(version)
    }

    /// Unset `key` at the next local version. Returns the version used.
    pub fn unset(&mut self, key: &str) -> Result<i64, VmapError> {
        let version = self.next_version(key)?;
        self.unset_version(key, version);
        Ok(version)
    }

    pub fn set_version(&mut self, key: &str, value: &str, version: i64) {
        self.values
            .entry(key.to_string())
            .or_default()
            .push(MapEntry {
                value: value.to_string(),
                version,
            });
    }

    pub fn unset_version(&mut self, key: &str, version: i64) {
        self.set_version(key, "", version);
    }

    /// Current value of `key`; empty when the key has no history or its
    /// winning entry is an unset.
    pub fn get(&self, key: &str) -> &str {
        self.current(key).map(|e| e.value.as_str()).unwrap_or("")
    }

    /// The entry that currently wins for `key`.
    pub fn current(&self, key: &str) -> Option<&MapEntry> {
        let entries = self.values.get(key)?;
        let mut winner = entries.first()?;
        for entry in &entries[1..] {
            if entry.wins_over(winner) {
                winner = entry;
            }
        }
        Some(winner)
    }

    /// Raw history for `key`, in arrival order.
    pub fn history(&self, key: &str) -> &[MapEntry] {
        self.values.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Append every entry of `other` to this map. Nothing is dropped or
    /// deduplicated.
    pub fn merge(&mut self, other: &VersionedMap) {
        for (key, entries) in &other.values {
            self.values
                .entry(key.clone())
                .or_default()
                .extend(entries.iter().cloned());
        }
    }

    /// All keys with any history, including keys whose current value is unset.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Highest version observed across all keys, or 0 for an empty map.
    pub fn latest_version(&self) -> i64 {
        self.values
            .values()
            .flatten()
            .map(|e| e.version)
            .max()
            .unwrap_or(0)
    }

    /// Highest version observed for `key`, or 0 when it has no history.
    pub fn key_version(&self, key: &str) -> i64 {
        self.history(key)
            .iter()
            .map(|e| e.version)
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn next_version(&self, key: &str) -> Result<i64, VmapError> {
        let version = self.key_version(key);
        version
            .checked_add(1)
            .ok_or_else(|| VmapError::VersionOverflow {
                key: key.to_string(),
                version,
            })
    }

    /// Serialize every entry as one wire record.
    pub fn marshal_map(&self) -> WireMap {
        let mut out = WireMap::new();
        for (key, entries) in &self.values {
            insert_records(&mut out, key, entries.iter());
        }
        out
    }

    /// Replay wire records into this map.
    ///
    /// Records that do not have the `<key>:<op>:<version>` shape, or whose op
    /// is unknown, are skipped. A record with a non-integer version is an
    /// error and leaves the records applied so far in place.
    pub fn unmarshal_map(&mut self, serialized: &WireMap) -> Result<(), VmapError> {
        for (record, value) in serialized {
            // the key itself may contain ':', so split op and version from the right
            let mut parts = record.rsplitn(3, ':');
            let (Some(version), Some(op), Some(key)) = (parts.next(), parts.next(), parts.next())
            else {
                debug!(record = %record, "skipping wire record without op and version");
                continue;
            };
            let Some(op) = EntryOp::from_wire(op) else {
                debug!(record = %record, op = %op, "skipping wire record with unknown op");
                continue;
            };
            let version = version
                .parse::<i64>()
                .map_err(|source| VmapError::InvalidVersion {
                    record: record.clone(),
                    version: version.to_string(),
                    source,
                })?;
            match op {
                EntryOp::Set => self.set_version(key, value, version),
                EntryOp::UnSet => self.unset_version(key, version),
            }
        }
        Ok(())
    }

    /// Wire records for entries more than `age` versions behind their key's
    /// maximum version. The entry holding a key's maximum version is never
    /// included. Does not modify the map.
    pub fn marshal_expired_map(&self, age: u64) -> WireMap {
        let mut out = WireMap::new();
        for (key, entries) in &self.values {
            let max = entries.iter().map(|e| e.version).max().unwrap_or(0);
            let expired = entries.iter().filter(|e| max.abs_diff(e.version) > age);
            insert_records(&mut out, key, expired);
        }
        out
    }
}

// Two entries at the same version and op share a record key; keep the one
// that wins resolution so a read-back resolves identically.
fn insert_records<'a>(
    out: &mut WireMap,
    key: &str,
    entries: impl Iterator<Item = &'a MapEntry>,
) {
    for entry in entries {
        let record = entry.wire_key(key);
        match out.get(&record) {
            Some(existing) if existing.as_str() >= entry.value.as_str() => {}
            _ => {
                out.insert(record, entry.value.clone());
            }
        }
    }
}

impl From<VersionedMap> for WireMap {
    fn from(map: VersionedMap) -> Self {
        map.marshal_map()
    }
}

impl TryFrom<WireMap> for VersionedMap {
    type Error = VmapError;

    fn try_from(serialized: WireMap) -> Result<Self, Self::Error> {
        VersionedMap::from_wire(&serialized)
    }
}
