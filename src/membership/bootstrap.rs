//! Discovery candidate sets. Candidates are probed until they show up in
//! the view; the remaining counter makes exhaustion checks O(1), and the
//! ring successor is drawn preferentially under full-view bootstrap so the
//! ring converges from the neighbors outward.

use crate::common::{Endpoint, NodeId};
use rand::Rng;

/// Where a discovery probe should go: a known node, or a raw endpoint we
/// have no name for yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryTarget {
    Node(NodeId),
    Blind(Endpoint),
}

#[derive(Debug, Clone)]
struct Candidate {
    id: NodeId,
    in_view: bool,
}

/// One candidate per configured name.
#[derive(Debug, Clone)]
pub struct BootstrapSet {
    candidates: Vec<Candidate>,
    remaining: usize,
}

impl BootstrapSet {
    pub fn new(ids: Vec<NodeId>) -> Self {
        let remaining = ids.len();
        Self {
            candidates: ids
                .into_iter()
                .map(|id| Candidate { id, in_view: false })
                .collect(),
            remaining,
        }
    }

    pub fn set_in_view(&mut self, id: NodeId, in_view: bool) {
        for c in &mut self.candidates {
            if c.id == id && c.in_view != in_view {
                c.in_view = in_view;
                if in_view {
                    self.remaining -= 1;
                } else {
                    self.remaining += 1;
                }
            }
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    pub fn ids_not_in_view(&self) -> Vec<NodeId> {
        self.candidates
            .iter()
            .filter(|c| !c.in_view)
            .map(|c| c.id)
            .collect()
    }

    /// Cyclic random draw over undiscovered candidates. When
    /// `prefer_successor` holds and the ring successor is itself still
    /// undiscovered, it wins roughly one draw in `remaining`.
    pub fn next_node_not_in_view<R: Rng>(
        &mut self,
        rng: &mut R,
        ring_successor: Option<NodeId>,
        prefer_successor: bool,
    ) -> Option<NodeId> {
        if self.remaining == 0 {
            return None;
        }

        if prefer_successor {
            if let Some(succ) = ring_successor {
                let undiscovered = self
                    .candidates
                    .iter()
                    .any(|c| c.id == succ && !c.in_view);
                if undiscovered && rng.gen_range(0..self.remaining) == 0 {
                    return Some(succ);
                }
            }
        }

        let start = rng.gen_range(0..self.candidates.len());
        for i in 0..self.candidates.len() {
            let c = &self.candidates[(start + i) % self.candidates.len()];
            if !c.in_view {
                return Some(c.id);
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
struct MultiCandidate {
    id: Option<NodeId>,
    endpoint: Endpoint,
    in_view: bool,
}

/// Multiple endpoints per name plus nameless endpoints that can only be
/// probed blind.
#[derive(Debug, Clone)]
pub struct BootstrapMultimap {
    candidates: Vec<MultiCandidate>,
    remaining: usize,
}

impl BootstrapMultimap {
    pub fn new(entries: Vec<(Option<NodeId>, Endpoint)>) -> Self {
        let remaining = entries.len();
        Self {
            candidates: entries
                .into_iter()
                .map(|(id, endpoint)| MultiCandidate {
                    id,
                    endpoint,
                    in_view: false,
                })
                .collect(),
            remaining,
        }
    }

    /// Marks every endpoint registered under `id`. Nameless candidates are
    /// marked through [`set_endpoint_in_view`] once the probe resolves.
    pub fn set_in_view(&mut self, id: NodeId, in_view: bool) {
        for c in &mut self.candidates {
            if c.id == Some(id) && c.in_view != in_view {
                c.in_view = in_view;
                if in_view {
                    self.remaining -= 1;
                } else {
                    self.remaining += 1;
                }
            }
        }
    }

    pub fn set_endpoint_in_view(&mut self, endpoint: &str, in_view: bool) {
        for c in &mut self.candidates {
            if c.endpoint == endpoint && c.in_view != in_view {
                c.in_view = in_view;
                if in_view {
                    self.remaining -= 1;
                } else {
                    self.remaining += 1;
                }
            }
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    pub fn ids_not_in_view(&self) -> Vec<NodeId> {
        self.candidates
            .iter()
            .filter(|c| !c.in_view)
            .filter_map(|c| c.id)
            .collect()
    }

    pub fn next_target_not_in_view<R: Rng>(
        &mut self,
        rng: &mut R,
        ring_successor: Option<NodeId>,
        prefer_successor: bool,
    ) -> Option<DiscoveryTarget> {
        if self.remaining == 0 {
            return None;
        }

        if prefer_successor {
            if let Some(succ) = ring_successor {
                let undiscovered = self
                    .candidates
                    .iter()
                    .any(|c| c.id == Some(succ) && !c.in_view);
                if undiscovered && rng.gen_range(0..self.remaining) == 0 {
                    return Some(DiscoveryTarget::Node(succ));
                }
            }
        }

        let start = rng.gen_range(0..self.candidates.len());
        for i in 0..self.candidates.len() {
            let c = &self.candidates[(start + i) % self.candidates.len()];
            if !c.in_view {
                return Some(match c.id {
                    Some(id) => DiscoveryTarget::Node(id),
                    None => DiscoveryTarget::Blind(c.endpoint.clone()),
                });
            }
        }
        None
    }
}

/// The manager picks the set form when every configured entry is named and
/// unique, the multimap otherwise.
#[derive(Debug, Clone)]
pub enum Bootstrap {
    Set(BootstrapSet),
    Multi(BootstrapMultimap),
}

impl Bootstrap {
    pub fn set_in_view(&mut self, id: NodeId, in_view: bool) {
        match self {
            Bootstrap::Set(s) => s.set_in_view(id, in_view),
            Bootstrap::Multi(m) => m.set_in_view(id, in_view),
        }
    }

    pub fn remaining(&self) -> usize {
        match self {
            Bootstrap::Set(s) => s.remaining(),
            Bootstrap::Multi(m) => m.remaining(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn ids_not_in_view(&self) -> Vec<NodeId> {
        match self {
            Bootstrap::Set(s) => s.ids_not_in_view(),
            Bootstrap::Multi(m) => m.ids_not_in_view(),
        }
    }

    pub fn next_target_not_in_view<R: Rng>(
        &mut self,
        rng: &mut R,
        ring_successor: Option<NodeId>,
        prefer_successor: bool,
    ) -> Option<DiscoveryTarget> {
        match self {
            Bootstrap::Set(s) => s
                .next_node_not_in_view(rng, ring_successor, prefer_successor)
                .map(DiscoveryTarget::Node),
            Bootstrap::Multi(m) => {
                m.next_target_not_in_view(rng, ring_successor, prefer_successor)
            }
        }
    }
}

/// The clockwise-nearest candidate from `my_vid`: the lowest virtual id
/// strictly above mine, wrapping to the lowest overall. Candidates carry
/// their own virtual ids so undiscovered nodes, which sit on no ring yet,
/// can still be ordered.
pub fn ring_successor_of(
    my_vid: u64,
    candidates: impl IntoIterator<Item = (NodeId, u64)>,
) -> Option<NodeId> {
    let mut ahead: Option<(u64, NodeId)> = None;
    let mut wrap: Option<(u64, NodeId)> = None;

    for (id, vid) in candidates {
        if vid > my_vid {
            if ahead.map_or(true, |(v, _)| vid < v) {
                ahead = Some((vid, id));
            }
        } else if wrap.map_or(true, |(v, _)| vid < v) {
            wrap = Some((vid, id));
        }
    }

    ahead.or(wrap).map(|(_, id)| id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeCache;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn exhaustion_and_recovery() {
        let mut cache = NodeCache::new();
        let a = cache.intern("a", "");
        let b = cache.intern("b", "");
        let mut set = BootstrapSet::new(vec![a, b]);
        let mut rng = StdRng::seed_from_u64(1);

        assert_eq!(set.remaining(), 2);

        set.set_in_view(a, true);
        set.set_in_view(b, true);
        assert!(set.is_exhausted());
        assert_eq!(set.next_node_not_in_view(&mut rng, None, false), None);

        // The moment a flag flips back, draws resume.
        set.set_in_view(b, false);
        assert_eq!(
            set.next_node_not_in_view(&mut rng, None, false),
            Some(b)
        );
    }

    #[test]
    fn set_in_view_is_idempotent() {
        let mut cache = NodeCache::new();
        let a = cache.intern("a", "");
        let mut set = BootstrapSet::new(vec![a]);

        set.set_in_view(a, true);
        set.set_in_view(a, true);
        assert_eq!(set.remaining(), 0);

        set.set_in_view(a, false);
        set.set_in_view(a, false);
        assert_eq!(set.remaining(), 1);
    }

    #[test]
    fn successor_bias_draws_successor_eventually() {
        let mut cache = NodeCache::new();
        let ids: Vec<NodeId> = (0..8)
            .map(|i| cache.intern(&format!("n{}", i), ""))
            .collect();
        let succ = ids[3];
        let mut set = BootstrapSet::new(ids);
        let mut rng = StdRng::seed_from_u64(7);

        let mut hit = 0;
        for _ in 0..200 {
            if set.next_node_not_in_view(&mut rng, Some(succ), true) == Some(succ) {
                hit += 1;
            }
        }
        // Uniform draw over 8 gives ~25 hits; the bias roughly doubles it.
        assert!(hit > 30, "successor drawn {} times", hit);
    }

    #[test]
    fn ring_successor_picks_nearest_clockwise() {
        let mut cache = NodeCache::new();
        let a = cache.intern("a", "");
        let b = cache.intern("b", "");
        let c = cache.intern("c", "");

        // Ahead of my_vid=50: 70 beats 90; 10 only matters on wrap.
        let succ = ring_successor_of(50, vec![(a, 90), (b, 70), (c, 10)]);
        assert_eq!(succ, Some(b));

        // Nothing ahead: wrap to the lowest vid.
        let succ = ring_successor_of(95, vec![(a, 90), (b, 70), (c, 10)]);
        assert_eq!(succ, Some(c));

        assert_eq!(ring_successor_of(50, Vec::new()), None);
    }

    #[test]
    fn ids_not_in_view_shrinks_with_discovery() {
        let mut cache = NodeCache::new();
        let a = cache.intern("a", "");
        let b = cache.intern("b", "");
        let mut set = BootstrapSet::new(vec![a, b]);

        assert_eq!(set.ids_not_in_view(), vec![a, b]);

        set.set_in_view(a, true);
        assert_eq!(set.ids_not_in_view(), vec![b]);

        // Nameless multimap entries never show up as ids.
        let multi = BootstrapMultimap::new(vec![
            (Some(a), "10.0.0.1:7000".into()),
            (None, "10.0.0.3:7000".into()),
        ]);
        assert_eq!(multi.ids_not_in_view(), vec![a]);
    }

    #[test]
    fn multimap_marks_all_endpoints_of_a_name() {
        let mut cache = NodeCache::new();
        let a = cache.intern("a", "");
        let mut multi = BootstrapMultimap::new(vec![
            (Some(a), "10.0.0.1:7000".into()),
            (Some(a), "10.0.0.2:7000".into()),
            (None, "10.0.0.3:7000".into()),
        ]);

        multi.set_in_view(a, true);
        assert_eq!(multi.remaining(), 1);

        let mut rng = StdRng::seed_from_u64(3);
        match multi.next_target_not_in_view(&mut rng, None, false) {
            Some(DiscoveryTarget::Blind(ep)) => assert_eq!(ep, "10.0.0.3:7000"),
            other => panic!("expected blind target, got {:?}", other),
        }

        multi.set_endpoint_in_view("10.0.0.3:7000", true);
        assert!(multi.is_exhausted());
    }
}
