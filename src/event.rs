use crate::{common::Endpoint, membership::NodeStatus, version::NodeVersion};
use bytes::Bytes;
use std::collections::HashMap;

/// Snapshot of one member as carried by events, so pure listeners (leader
/// election among them) never have to query the manager back.
#[derive(Debug, PartialEq, Clone)]
pub struct MemberInfo {
    pub name: String,
    pub endpoint: Endpoint,
    pub version: NodeVersion,
    pub attributes: HashMap<String, Bytes>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Event {
    /// Batch of status changes applied in one processing step. The first
    /// event after start carries the full view.
    ViewChange(Vec<NodeStatusChange>),
    /// A node entered the view.
    NodeJoin(MemberInfo),
    /// A node left the view. Published as soon as a Leave is processed,
    /// ahead of the batched view change.
    NodeLeave(MemberInfo),
    /// Attribute tables changed for the listed members.
    MetadataChange(Vec<MemberInfo>),
}

#[derive(Debug, PartialEq, Clone)]
pub struct NodeStatusChange {
    pub member: MemberInfo,
    pub status: NodeStatus,
}
