use crate::{
    common::NodeId,
    error::{Error, Result},
};
use std::collections::BTreeMap;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Consistent-hash ring over the view. Every member sits at a virtual id
/// computed from a seeded hash of its name; the ordered map gives us
/// successor/predecessor walks and wrap-around for free.
#[derive(Debug, Clone)]
pub struct Ring {
    seed: u64,
    nodes: BTreeMap<u64, NodeId>,
}

impl Ring {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            nodes: BTreeMap::new(),
        }
    }

    /// The virtual id a name occupies on this ring.
    pub fn virtual_id(&self, name: &str) -> u64 {
        let mut hasher = XxHash64::with_seed(self.seed);
        hasher.write(name.as_bytes());
        hasher.finish()
    }

    /// Places a node on the ring, failing if the slot is taken.
    pub fn add(&mut self, vid: u64, id: NodeId) -> Result<()> {
        if self.nodes.contains_key(&vid) {
            return Err(Error::new_node_already_in_ring());
        }

        self.nodes.insert(vid, id);
        Ok(())
    }

    /// Removes a node from the ring, failing if it was never there.
    pub fn remove(&mut self, vid: u64) -> Result<NodeId> {
        self.nodes.remove(&vid).ok_or_else(Error::new_node_not_in_ring)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The member at the lowest virtual id strictly above `vid`, wrapping
    /// to the start of the ring. `None` on an empty ring.
    pub fn successor(&self, vid: u64) -> Option<(u64, NodeId)> {
        self.nodes
            .range((
                std::ops::Bound::Excluded(vid),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .or_else(|| self.nodes.iter().next())
            .map(|(&v, &id)| (v, id))
    }

    /// The member at the highest virtual id strictly below `vid`, wrapping
    /// to the end of the ring.
    pub fn predecessor(&self, vid: u64) -> Option<(u64, NodeId)> {
        self.nodes
            .range(..vid)
            .next_back()
            .or_else(|| self.nodes.iter().next_back())
            .map(|(&v, &id)| (v, id))
    }

    /// Walks `steps` successors from `vid`. Used by the harmonic pick.
    fn walk(&self, vid: u64, steps: usize) -> Option<(u64, NodeId)> {
        let mut cursor = vid;
        let mut found = None;
        for _ in 0..steps {
            let (v, id) = self.successor(cursor)?;
            cursor = v;
            found = Some((v, id));
        }
        found
    }

    /// Ring-distance-biased peer selection: the step count follows a
    /// harmonic (~1/x) distribution over ring distance, d = n^(r-1) with
    /// r uniform in [0,1), so near successors are picked most often while
    /// far members still get occasional traffic. `None` when `vid` is the
    /// only occupant.
    pub fn harmonic_pick(&self, vid: u64, r: f64) -> Option<NodeId> {
        let n = self.nodes.len().saturating_sub(1);
        if n == 0 {
            return None;
        }

        let d = (n as f64).powf(r - 1.0);
        let steps = ((n as f64) * d).ceil() as usize;
        let steps = steps.clamp(1, n);

        self.walk(vid, steps).map(|(_, id)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeCache;

    fn ring_with(names: &[&str]) -> (Ring, NodeCache) {
        let mut cache = NodeCache::new();
        let mut ring = Ring::new(0);

        for name in names {
            let id = cache.intern(name, "");
            let vid = ring.virtual_id(name);
            ring.add(vid, id).unwrap();
        }

        (ring, cache)
    }

    #[test]
    fn add_twice_fails() {
        let (mut ring, mut cache) = ring_with(&["a"]);
        let id = cache.intern("a", "");
        let vid = ring.virtual_id("a");

        assert!(ring.add(vid, id).is_err());
    }

    #[test]
    fn remove_missing_fails() {
        let (mut ring, _) = ring_with(&[]);
        assert!(ring.remove(42).is_err());
    }

    #[test]
    fn successor_wraps() {
        let (ring, cache) = ring_with(&["a", "b", "c"]);

        let mut vids: Vec<u64> = ["a", "b", "c"]
            .iter()
            .map(|n| ring.virtual_id(n))
            .collect();
        vids.sort_unstable();

        // Successor of the highest vid is the lowest one.
        let (v, id) = ring.successor(vids[2]).unwrap();
        assert_eq!(v, vids[0]);
        assert!(cache.get(cache.name(id)).is_some());
    }

    #[test]
    fn predecessor_wraps() {
        let (ring, _) = ring_with(&["a", "b", "c"]);

        let mut vids: Vec<u64> = ["a", "b", "c"]
            .iter()
            .map(|n| ring.virtual_id(n))
            .collect();
        vids.sort_unstable();

        let (v, _) = ring.predecessor(vids[0]).unwrap();
        assert_eq!(v, vids[2]);
    }

    #[test]
    fn harmonic_pick_excludes_lone_occupant() {
        let (ring, _) = ring_with(&["me"]);
        let vid = ring.virtual_id("me");

        assert_eq!(ring.harmonic_pick(vid, 0.5), None);
    }

    #[test]
    fn harmonic_pick_prefers_near_successor() {
        let (ring, _) = ring_with(&["me", "a", "b", "c", "d"]);
        let vid = ring.virtual_id("me");

        // r near zero lands on the immediate successor.
        let near = ring.harmonic_pick(vid, 0.0).unwrap();
        let (_, succ) = ring.successor(vid).unwrap();
        assert_eq!(near, succ);

        // r near one can reach all the way around, but never self.
        let me = ring.successor(ring.predecessor(vid).unwrap().0).unwrap().1;
        let far = ring.harmonic_pick(vid, 0.999).unwrap();
        assert_ne!(far, me);
    }

    #[test]
    fn seeded_ids_are_stable() {
        let ring_a = Ring::new(7);
        let ring_b = Ring::new(7);
        let ring_c = Ring::new(8);

        assert_eq!(ring_a.virtual_id("node"), ring_b.virtual_id("node"));
        assert_ne!(ring_a.virtual_id("node"), ring_c.virtual_id("node"));
    }
}
