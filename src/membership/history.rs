use crate::{
    common::NodeId,
    membership::view::{NodeInfo, NodeStatus},
    version::NodeVersion,
};
use std::collections::BTreeMap;
use std::time::Instant;

/// Departed nodes, kept for dedup (an alive claim must beat the recorded
/// version to re-enter the view) and for rediscovery once bootstrap runs
/// dry. Entries holding retained attribute tables survive pruning until
/// explicitly cleared.
#[derive(Debug, Default)]
pub struct NodeHistorySet {
    nodes: BTreeMap<NodeId, NodeInfo>,
    /// Last id handed out by the cyclic cursor.
    cursor: Option<NodeId>,
}

impl NodeHistorySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or merges with version dominance: an existing entry is only
    /// overwritten by a version at least as new, and status/version never
    /// regress. A retained table on the existing entry is carried over when
    /// the incoming record has none.
    pub fn add(&mut self, id: NodeId, mut info: NodeInfo) {
        match self.nodes.get_mut(&id) {
            Some(existing) => {
                if info.version < existing.version {
                    return;
                }
                if info.table.is_none() {
                    info.table = existing.table.take();
                }
                *existing = info;
            }
            None => {
                self.nodes.insert(id, info);
            }
        }
    }

    /// Forwards an entry's version/status, never regressing. Returns
    /// whether anything changed.
    pub fn update_ver(&mut self, id: NodeId, version: NodeVersion, status: NodeStatus) -> bool {
        match self.nodes.get_mut(&id) {
            Some(info) if version > info.version => {
                info.version = version;
                info.status = status;
                info.timestamp = Instant::now();
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut NodeInfo> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn version_of(&self, id: NodeId) -> Option<NodeVersion> {
        self.nodes.get(&id).map(|i| i.version)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<NodeInfo> {
        if self.cursor == Some(id) {
            self.cursor = None;
        }
        self.nodes.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeInfo)> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&NodeId, &mut NodeInfo)> {
        self.nodes.iter_mut()
    }

    /// Cyclic draw across history, the discovery fallback once bootstrap is
    /// exhausted.
    pub fn next_node(&mut self) -> Option<NodeId> {
        if self.nodes.is_empty() {
            return None;
        }

        let next = match self.cursor {
            Some(last) => self
                .nodes
                .range((
                    std::ops::Bound::Excluded(last),
                    std::ops::Bound::Unbounded,
                ))
                .next()
                .or_else(|| self.nodes.iter().next())
                .map(|(&id, _)| id),
            None => self.nodes.keys().next().copied(),
        };

        self.cursor = next;
        next
    }

    /// Drops entries older than `cutoff`, sparing those that still hold
    /// retained attributes.
    pub fn prune(&mut self, cutoff: Instant) {
        self.nodes
            .retain(|_, info| info.table.is_some() || info.timestamp >= cutoff);
        if let Some(cursor) = self.cursor {
            if !self.nodes.contains_key(&cursor) {
                self.cursor = None;
            }
        }
    }

    /// Force-drops one node's retained attribute table. Returns whether a
    /// table was held.
    pub fn clear_retained(&mut self, id: NodeId) -> bool {
        match self.nodes.get_mut(&id) {
            Some(info) => info.table.take().is_some(),
            None => false,
        }
    }

    /// Force-drops every retained table (administrative clear).
    pub fn clear_all_retained(&mut self) {
        for info in self.nodes.values_mut() {
            info.table = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{attributes::AttributeTable, common::NodeCache, membership::view::NodeInfo};
    use std::time::Duration;

    fn departed(version: NodeVersion, retained: bool) -> NodeInfo {
        let mut info = NodeInfo::alive(version);
        info.status = NodeStatus::Leave;
        info.table = if retained {
            Some(AttributeTable::new())
        } else {
            None
        };
        info
    }

    #[test]
    fn add_never_regresses() {
        let mut cache = NodeCache::new();
        let a = cache.intern("a", "");
        let mut history = NodeHistorySet::new();

        history.add(a, departed(NodeVersion::new(2, 5), false));
        history.add(a, departed(NodeVersion::new(2, 3), false));

        assert_eq!(history.version_of(a), Some(NodeVersion::new(2, 5)));
    }

    #[test]
    fn add_carries_retained_table_forward() {
        let mut cache = NodeCache::new();
        let a = cache.intern("a", "");
        let mut history = NodeHistorySet::new();

        history.add(a, departed(NodeVersion::new(2, 3), true));
        history.add(a, departed(NodeVersion::new(2, 5), false));

        assert!(history.get(a).unwrap().table.is_some());
        assert_eq!(history.version_of(a), Some(NodeVersion::new(2, 5)));
    }

    #[test]
    fn update_ver_forwards_only() {
        let mut cache = NodeCache::new();
        let a = cache.intern("a", "");
        let mut history = NodeHistorySet::new();
        history.add(a, departed(NodeVersion::new(1, 4), false));

        assert!(!history.update_ver(a, NodeVersion::new(1, 4), NodeStatus::Remove));
        assert!(history.update_ver(a, NodeVersion::new(1, 6), NodeStatus::Remove));
        assert_eq!(history.get(a).unwrap().status, NodeStatus::Remove);
    }

    #[test]
    fn cyclic_cursor_wraps() {
        let mut cache = NodeCache::new();
        let a = cache.intern("a", "");
        let b = cache.intern("b", "");
        let mut history = NodeHistorySet::new();
        history.add(a, departed(NodeVersion::new(1, 1), false));
        history.add(b, departed(NodeVersion::new(1, 1), false));

        let first = history.next_node().unwrap();
        let second = history.next_node().unwrap();
        let third = history.next_node().unwrap();

        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn prune_spares_retained() {
        let mut cache = NodeCache::new();
        let a = cache.intern("a", "");
        let b = cache.intern("b", "");
        let mut history = NodeHistorySet::new();
        history.add(a, departed(NodeVersion::new(1, 1), false));
        history.add(b, departed(NodeVersion::new(1, 1), true));

        history.prune(Instant::now() + Duration::from_secs(1));

        assert!(!history.contains(a));
        assert!(history.contains(b));

        // Once the retained table is force-cleared, pruning takes it.
        assert!(history.clear_retained(b));
        history.prune(Instant::now() + Duration::from_secs(1));
        assert!(!history.contains(b));
    }
}
