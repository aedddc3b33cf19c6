use crate::{
    attributes::AttributeTable,
    common::NodeId,
    error::{Error, Result},
    membership::{ring::Ring, suspicion::SuspicionList},
    version::NodeVersion,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Node lifecycle as seen by a remote observer. `SuspectDuplicateNode` is
/// the terminal variant for the stale half of a split-name conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Alive,
    Suspect,
    Leave,
    Remove,
    SuspectDuplicateNode,
}

/// Everything tracked about one node. In the view the attribute table is
/// always present; in history it survives only while attributes are
/// retained post-departure.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub version: NodeVersion,
    pub status: NodeStatus,
    pub suspicions: SuspicionList,
    pub table: Option<AttributeTable>,
    pub timestamp: Instant,
}

impl NodeInfo {
    pub fn alive(version: NodeVersion) -> Self {
        Self {
            version,
            status: NodeStatus::Alive,
            suspicions: SuspicionList::new(),
            table: Some(AttributeTable::new()),
            timestamp: Instant::now(),
        }
    }
}

/// The membership view: node map plus the hash ring, kept in lockstep.
/// Every member has exactly one ring slot and vice versa.
#[derive(Debug)]
pub struct MembershipView {
    members: HashMap<NodeId, NodeInfo>,
    vids: HashMap<NodeId, u64>,
    ring: Ring,
}

impl MembershipView {
    pub fn new(seed: u64) -> Self {
        Self {
            members: HashMap::new(),
            vids: HashMap::new(),
            ring: Ring::new(seed),
        }
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn virtual_id_of(&self, id: NodeId) -> Option<u64> {
        self.vids.get(&id).copied()
    }

    /// Adds a member under the ring slot for `name`. Fails if the member
    /// (or its slot) is already present, keeping map and ring consistent.
    pub fn add(&mut self, id: NodeId, name: &str, info: NodeInfo) -> Result<()> {
        if self.members.contains_key(&id) {
            return Err(Error::new_node_already_in_ring());
        }

        let vid = self.ring.virtual_id(name);
        self.ring.add(vid, id)?;
        self.vids.insert(id, vid);
        self.members.insert(id, info);
        Ok(())
    }

    /// Removes a member and its ring slot, returning its record.
    pub fn remove(&mut self, id: NodeId) -> Result<NodeInfo> {
        let info = self
            .members
            .remove(&id)
            .ok_or_else(Error::new_node_not_in_view)?;
        if let Some(vid) = self.vids.remove(&id) {
            self.ring.remove(vid)?;
        }
        Ok(info)
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeInfo> {
        self.members.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut NodeInfo> {
        self.members.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeInfo)> {
        self.members.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&NodeId, &mut NodeInfo)> {
        self.members.iter_mut()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeCache;

    fn view_with(names: &[&str]) -> (MembershipView, NodeCache, Vec<NodeId>) {
        let mut cache = NodeCache::new();
        let mut view = MembershipView::new(0);
        let mut ids = Vec::new();

        for name in names {
            let id = cache.intern(name, "");
            view.add(id, name, NodeInfo::alive(NodeVersion::new(1, 1)))
                .unwrap();
            ids.push(id);
        }

        (view, cache, ids)
    }

    #[test]
    fn add_keeps_map_and_ring_in_lockstep() {
        let (view, _, _) = view_with(&["a", "b", "c"]);

        assert_eq!(view.len(), 3);
        assert_eq!(view.ring().len(), 3);
    }

    #[test]
    fn double_add_fails() {
        let (mut view, mut cache, _) = view_with(&["a"]);
        let id = cache.intern("a", "");

        assert!(view
            .add(id, "a", NodeInfo::alive(NodeVersion::new(1, 1)))
            .is_err());
        assert_eq!(view.len(), 1);
        assert_eq!(view.ring().len(), 1);
    }

    #[test]
    fn remove_frees_the_ring_slot() {
        let (mut view, mut cache, ids) = view_with(&["a", "b"]);

        let info = view.remove(ids[0]).unwrap();
        assert_eq!(info.status, NodeStatus::Alive);
        assert_eq!(view.len(), 1);
        assert_eq!(view.ring().len(), 1);

        // Re-addition after removal succeeds.
        let id = cache.intern("a", "");
        view.add(id, "a", NodeInfo::alive(NodeVersion::new(2, 0)))
            .unwrap();
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn remove_missing_fails() {
        let (mut view, mut cache, _) = view_with(&["a"]);
        let ghost = cache.intern("ghost", "");

        assert!(view.remove(ghost).is_err());
    }
}
