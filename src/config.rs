use crate::common::Endpoint;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A configured discovery candidate. Named entries become bootstrap-set
/// members; entries with no name are raw endpoints that can only be probed
/// blind (multimap mode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapEntry {
    pub name: Option<String>,
    pub endpoint: Endpoint,
}

impl BootstrapEntry {
    pub fn named(name: impl Into<String>, endpoint: impl Into<Endpoint>) -> Self {
        Self {
            name: Some(name.into()),
            endpoint: endpoint.into(),
        }
    }

    pub fn nameless(endpoint: impl Into<Endpoint>) -> Self {
        Self {
            name: None,
            endpoint: endpoint.into(),
        }
    }
}

/// Static configuration for one membership manager instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's unique name. Identity is name-only.
    pub node_name: String,
    /// This node's advertised endpoint.
    pub endpoint: Endpoint,
    /// Incarnation number for this life of the process. Must strictly
    /// increase across restarts of the same name; defaults to unix-epoch
    /// seconds at construction.
    pub incarnation: i64,

    /// Discovery candidates probed until they enter the view.
    pub bootstrap: Vec<BootstrapEntry>,
    /// Bias early discovery toward the ring successor to speed up ring
    /// convergence.
    pub full_view_bootstrap: bool,

    /// Period of the gossip round (update flush + metadata digest + prune).
    pub gossip_interval: Duration,
    /// How long departed nodes stay in history before pruning.
    pub history_retention: Duration,
    /// How long attribute tombstones are kept before garbage collection.
    pub tombstone_retention: Duration,

    /// Independent reporters required to confirm a suspicion. When the view
    /// is no larger than `threshold + 1` a single reporter suffices.
    pub suspicion_threshold: usize,
    /// Keep a departed node's attribute table in history until explicitly
    /// cleared, instead of dropping it with the view entry.
    pub retain_attributes_on_suspect: bool,

    /// Upper bound, in serialized bytes, for one discovery-view message.
    pub discovery_mtu: usize,

    /// Run as a leader-election candidate.
    pub election_candidate: bool,
    /// Delay before a candidate may claim leadership, letting the view
    /// converge first.
    pub election_warmup: Duration,

    /// Seed for peer selection and ring hashing. `None` seeds from entropy;
    /// tests pass a fixed value for determinism.
    pub seed: Option<u64>,
}

impl Config {
    pub fn new(node_name: impl Into<String>, endpoint: impl Into<Endpoint>) -> Self {
        let incarnation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Self {
            node_name: node_name.into(),
            endpoint: endpoint.into(),
            incarnation,
            bootstrap: Vec::new(),
            full_view_bootstrap: false,
            gossip_interval: Duration::from_secs(1),
            history_retention: Duration::from_secs(600),
            tombstone_retention: Duration::from_secs(600),
            suspicion_threshold: 2,
            retain_attributes_on_suspect: false,
            discovery_mtu: 8 * 1024,
            election_candidate: false,
            election_warmup: Duration::from_secs(5),
            seed: None,
        }
    }
}
