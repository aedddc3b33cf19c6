//! Per-node key/value attribute tables with anti-entropy semantics.
//!
//! Each table keeps a live map and a disjoint map of death certificates
//! (tombstones), both stamped with a table-local monotone version counter.
//! Merges are last-writer-wins by version, never by wall clock, which makes
//! them idempotent and commutative across any message delivery order.

use crate::{
    common::NodeId,
    error::{Error, Result},
    transport::proto::TableEntry,
};
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

/// Keys starting with this prefix are reserved for the protocol itself
/// (leader election, rebuttal).
pub const INTERNAL_KEY_PREFIX: &str = ".";

/// Tombstone-only key bumped to rebut a false suspicion without touching
/// real attributes.
pub(crate) const REBUTTAL_KEY: &str = ".rebuttal";

#[derive(Debug, Clone, PartialEq)]
struct LiveEntry {
    version: u64,
    value: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
struct DeathCertificate {
    version: u64,
    time: Instant,
}

#[derive(Debug, Clone)]
pub struct AttributeTable {
    entries: HashMap<String, LiveEntry>,
    certificates: HashMap<String, DeathCertificate>,
    /// High-water mark over every version ever assigned or merged.
    version: u64,
    /// Table version as of the last outgoing digest.
    last_sent: u64,
    /// Table version as of the last listener notification.
    last_notified: u64,
    /// Outstanding anti-entropy request, if any: who we asked and the
    /// version we asked for data newer than.
    pending: Option<(NodeId, u64)>,
}

impl AttributeTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            certificates: HashMap::new(),
            version: 0,
            last_sent: 0,
            last_notified: 0,
            pending: None,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn key_set(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    /// Clone of the live map, used for event snapshots.
    pub fn snapshot(&self) -> HashMap<String, Bytes> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Inserts or overwrites a key with the table's next version, clearing
    /// any tombstone for it. Returns whether the key was new.
    pub fn set(&mut self, key: &str, value: Bytes) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::new_empty_attribute_key());
        }

        self.version += 1;
        self.certificates.remove(key);
        let prev = self.entries.insert(
            key.to_owned(),
            LiveEntry {
                version: self.version,
                value,
            },
        );
        Ok(prev.is_none())
    }

    /// Deletes a live key, leaving a death certificate behind so the
    /// deletion is not resurrected by stale gossip. Returns whether the key
    /// was present.
    pub fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }

        self.version += 1;
        self.certificates.insert(
            key.to_owned(),
            DeathCertificate {
                version: self.version,
                time: Instant::now(),
            },
        );
        true
    }

    /// Tombstones every live key. Propagates as deletions, unlike dropping
    /// the table wholesale.
    pub fn clear(&mut self) {
        let keys: Vec<String> = self.entries.keys().cloned().collect();
        for key in keys {
            self.remove(&key);
        }
    }

    /// Tombstones every live key starting with `prefix`.
    pub fn clear_prefix(&mut self, prefix: &str) {
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in keys {
            self.remove(&key);
        }
    }

    /// Tombstones every live key *not* starting with `prefix`.
    pub fn clear_no_prefix(&mut self, prefix: &str) {
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|k| !k.starts_with(prefix))
            .cloned()
            .collect();
        for key in keys {
            self.remove(&key);
        }
    }

    /// Gossip write side: every live entry and tombstone with a version
    /// strictly above `newer_than`.
    pub fn write_entries_newer_than(&self, newer_than: u64) -> Vec<TableEntry> {
        let mut out: Vec<TableEntry> = self
            .entries
            .iter()
            .filter(|(_, e)| e.version > newer_than)
            .map(|(k, e)| TableEntry {
                key: k.clone(),
                version: e.version,
                value: Some(e.value.clone()),
            })
            .collect();

        out.extend(
            self.certificates
                .iter()
                .filter(|(_, c)| c.version > newer_than)
                .map(|(k, c)| TableEntry {
                    key: k.clone(),
                    version: c.version,
                    value: None,
                }),
        );

        out
    }

    /// Gossip merge side: applies each entry iff its version beats whatever
    /// the table currently holds for that key, live or tombstone. Advances
    /// the table version to the maximum seen. Returns the number of entries
    /// that changed the table; re-applying the same batch is a no-op.
    pub fn merge_entries(&mut self, incoming: &[TableEntry]) -> usize {
        let mut applied = 0;

        for entry in incoming {
            let current = self.key_version(&entry.key);
            if entry.version <= current {
                continue;
            }

            match &entry.value {
                Some(value) => {
                    self.certificates.remove(&entry.key);
                    self.entries.insert(
                        entry.key.clone(),
                        LiveEntry {
                            version: entry.version,
                            value: value.clone(),
                        },
                    );
                }
                None => {
                    self.entries.remove(&entry.key);
                    self.certificates.insert(
                        entry.key.clone(),
                        DeathCertificate {
                            version: entry.version,
                            time: Instant::now(),
                        },
                    );
                }
            }

            if entry.version > self.version {
                self.version = entry.version;
            }
            applied += 1;
        }

        applied
    }

    fn key_version(&self, key: &str) -> u64 {
        let live = self.entries.get(key).map(|e| e.version).unwrap_or(0);
        let dead = self.certificates.get(key).map(|c| c.version).unwrap_or(0);
        live.max(dead)
    }

    /// Garbage-collects tombstones created before `cutoff`, keeping the
    /// certificate set bounded.
    pub fn prune_death_certificates(&mut self, cutoff: Instant) {
        self.certificates.retain(|_, c| c.time >= cutoff);
    }

    /// Bumps the reserved rebuttal tombstone so the table appears newer
    /// than any version a suspicion was raised against.
    pub fn write_rebuttal_key(&mut self) {
        self.version += 1;
        self.certificates.insert(
            REBUTTAL_KEY.to_owned(),
            DeathCertificate {
                version: self.version,
                time: Instant::now(),
            },
        );
    }

    /// Whether this table advanced past the last outgoing digest.
    pub fn is_update_needed(&self) -> bool {
        self.version > self.last_sent
    }

    pub fn mark_version_sent(&mut self, version: u64) {
        self.last_sent = version;
    }

    /// Whether this table advanced past the last listener notification.
    pub fn is_notify_needed(&self) -> bool {
        self.version > self.last_notified
    }

    pub fn mark_notified(&mut self) {
        self.last_notified = self.version;
    }

    /// Records an outstanding request to `target` for data newer than
    /// `requested_version`. A zero version would request the whole table
    /// from a peer that never advertised one, which is a caller bug.
    pub fn mark_pending(&mut self, target: NodeId, requested_version: u64) {
        debug_assert!(requested_version > 0, "pending request with version 0");
        self.pending = Some((target, requested_version));
    }

    pub fn is_pending(&self, target: NodeId) -> bool {
        matches!(self.pending, Some((t, _)) if t == target)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn clear_pending(&mut self) {
        self.pending = None;
    }
}

impl Default for AttributeTable {
    fn default() -> Self {
        Self::new()
    }
}
