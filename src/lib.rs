//! Eventually-consistent cluster membership for a messaging mesh.
//!
//! Each node runs a [`MembershipManager`] that gossips three kinds of
//! state: the membership view itself (who is alive, suspected, or gone),
//! per-node key/value attributes converged by anti-entropy, and a
//! consistent-hash ring derived from the view for structured peer
//! selection. Failure detection is suspicion-based: connection-level
//! evidence accumulates per node until a configurable number of
//! independent reporters confirms it. A leader election rides on a
//! reserved attribute, needing no extra protocol machinery.
//!
//! The manager owns all state on a single task; [`Handle`] is the
//! cloneable front door, and [`Transport`] is the seam the embedding
//! server plugs its connections into.

pub mod attributes;
pub mod common;
pub mod config;
pub mod election;
pub mod error;
pub mod event;
pub mod handle;
pub mod membership;
pub mod transport;
pub mod version;

pub use crate::attributes::{AttributeTable, INTERNAL_KEY_PREFIX};
pub use crate::common::{Endpoint, NodeId};
pub use crate::config::{BootstrapEntry, Config};
pub use crate::election::{LeaderElection, LeaderListener, ELECTION_KEY};
pub use crate::error::{Error, Result};
pub use crate::event::{Event, MemberInfo, NodeStatusChange};
pub use crate::handle::{EventStream, Handle};
pub use crate::membership::{ClearScope, DiscoveryProbe, MembershipManager, NodeStatus};
pub use crate::transport::{proto, Message, Transport};
pub use crate::version::NodeVersion;
