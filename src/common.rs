use std::collections::HashMap;

/// Represents some _node/destination_ in the system.
pub type Endpoint = String;

/// Interned handle for a node identity. Two nodes are the same node iff
/// their names are equal; the handle is a dense index into the owning
/// [`NodeCache`], so equality on the handle is equality on the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
struct NodeRecord {
    name: String,
    endpoint: Endpoint,
}

/// Canonical name → id table. Every structure in the crate keys off
/// [`NodeId`] handles resolved through one cache owned by the manager, so
/// a name is interned exactly once per process.
#[derive(Debug, Default)]
pub struct NodeCache {
    records: Vec<NodeRecord>,
    by_name: HashMap<String, NodeId>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `name`, creating a new handle on first sight. A non-empty
    /// `endpoint` refreshes the stored endpoint; identity is name-only.
    pub fn intern(&mut self, name: &str, endpoint: &str) -> NodeId {
        if let Some(&id) = self.by_name.get(name) {
            if !endpoint.is_empty() {
                self.records[id.index()].endpoint = endpoint.to_owned();
            }
            return id;
        }

        let id = NodeId(self.records.len() as u32);
        self.records.push(NodeRecord {
            name: name.to_owned(),
            endpoint: endpoint.to_owned(),
        });
        self.by_name.insert(name.to_owned(), id);
        id
    }

    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.records[id.index()].name
    }

    pub fn endpoint(&self, id: NodeId) -> &str {
        &self.records[id.index()].endpoint
    }

    /// Name-order comparison between two handles. Handle order itself is
    /// interning order and means nothing.
    pub fn cmp_names(&self, a: NodeId, b: NodeId) -> std::cmp::Ordering {
        self.name(a).cmp(self.name(b))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
