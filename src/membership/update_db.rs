use crate::{
    common::{NodeCache, NodeId},
    membership::view::NodeStatus,
    transport::proto::{AliveRecord, Sender, StatusRecord, SuspicionRecord, UpdateMessage},
    version::NodeVersion,
};
use std::collections::{BTreeSet, HashMap};

/// The outgoing gossip diff batch accumulated between rounds. Every insert
/// merges with version dominance so duplicate or stale evidence collapses;
/// the batch is cleared only after a fully successful send-to-all, so a
/// partial round simply retries next tick.
#[derive(Debug, Default)]
pub struct UpdateDatabase {
    left: HashMap<NodeId, (NodeVersion, NodeStatus)>,
    alive: HashMap<NodeId, NodeVersion>,
    retained: HashMap<NodeId, (NodeVersion, NodeStatus)>,
    suspicions: BTreeSet<(NodeId, NodeId, NodeVersion)>,
}

impl UpdateDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_left(&mut self, id: NodeId, version: NodeVersion, status: NodeStatus) {
        // A departed node is no longer alive in this batch.
        if let Some(&alive) = self.alive.get(&id) {
            if alive <= version {
                self.alive.remove(&id);
            }
        }

        match self.left.get_mut(&id) {
            Some(existing) if existing.0 >= version => {}
            Some(existing) => *existing = (version, status),
            None => {
                self.left.insert(id, (version, status));
            }
        }
    }

    pub fn add_alive(&mut self, id: NodeId, version: NodeVersion) {
        if let Some(&(left, _)) = self.left.get(&id) {
            if left >= version {
                return;
            }
            self.left.remove(&id);
        }

        match self.alive.get_mut(&id) {
            Some(existing) if *existing >= version => {}
            Some(existing) => *existing = version,
            None => {
                self.alive.insert(id, version);
            }
        }
    }

    pub fn add_retained(&mut self, id: NodeId, version: NodeVersion, status: NodeStatus) {
        match self.retained.get_mut(&id) {
            Some(existing) if existing.0 >= version => {}
            Some(existing) => *existing = (version, status),
            None => {
                self.retained.insert(id, (version, status));
            }
        }
    }

    /// Returns whether the record was new to this batch.
    pub fn add_suspicion(
        &mut self,
        suspect: NodeId,
        reporter: NodeId,
        version: NodeVersion,
    ) -> bool {
        self.suspicions.insert((suspect, reporter, version))
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
            && self.alive.is_empty()
            && self.retained.is_empty()
            && self.suspicions.is_empty()
    }

    pub fn clear(&mut self) {
        self.left.clear();
        self.alive.clear();
        self.retained.clear();
        self.suspicions.clear();
    }

    /// Renders the batch as a wire message. The batch itself is untouched;
    /// the caller clears it once the send fully succeeds.
    pub fn to_message(&self, cache: &NodeCache, sender: Sender) -> UpdateMessage {
        let left = self
            .left
            .iter()
            .map(|(&id, &(version, status))| StatusRecord {
                name: cache.name(id).to_owned(),
                version,
                status,
            })
            .collect();

        let alive = self
            .alive
            .iter()
            .map(|(&id, &version)| AliveRecord {
                name: cache.name(id).to_owned(),
                endpoint: cache.endpoint(id).to_owned(),
                version,
            })
            .collect();

        let retained = self
            .retained
            .iter()
            .map(|(&id, &(version, status))| StatusRecord {
                name: cache.name(id).to_owned(),
                version,
                status,
            })
            .collect();

        let suspects = self
            .suspicions
            .iter()
            .map(|&(suspect, reporter, version)| SuspicionRecord {
                suspect: cache.name(suspect).to_owned(),
                reporter: cache.name(reporter).to_owned(),
                version,
            })
            .collect();

        UpdateMessage {
            sender,
            left,
            alive,
            suspects,
            retained,
        }
    }
}
