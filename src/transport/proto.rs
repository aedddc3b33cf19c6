//! Typed wire messages exchanged by the membership protocol. Byte framing
//! (and any checksum trailer) is the embedding transport's concern; these
//! structs are the logical payloads.

use crate::{common::Endpoint, membership::NodeStatus, version::NodeVersion};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identity header carried by every membership message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    pub name: String,
    pub endpoint: Endpoint,
    pub version: NodeVersion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Leave(LeaveMessage),
    LeaveAck(LeaveAck),
    NodeUpdate(UpdateMessage),
    MetadataUpdate(MetadataDigest),
    MetadataRequest(MetadataDigest),
    MetadataRequestPush(MetadataDigest),
    MetadataReply(MetadataReply),
    DiscoveryRequest(DiscoveryView),
    DiscoveryReply(DiscoveryView),
}

impl Message {
    pub fn sender(&self) -> &Sender {
        match self {
            Message::Leave(m) => &m.sender,
            Message::LeaveAck(m) => &m.sender,
            Message::NodeUpdate(m) => &m.sender,
            Message::MetadataUpdate(m) => &m.sender,
            Message::MetadataRequest(m) => &m.sender,
            Message::MetadataRequestPush(m) => &m.sender,
            Message::MetadataReply(m) => &m.sender,
            Message::DiscoveryRequest(m) => &m.sender,
            Message::DiscoveryReply(m) => &m.sender,
        }
    }
}

/// Graceful departure announcement. `request_ack` is set when the leaver
/// is waiting to learn that the cluster recorded its removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveMessage {
    pub sender: Sender,
    pub status: NodeStatus,
    pub request_ack: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveAck {
    pub sender: Sender,
}

/// One gossip round's worth of membership diffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    pub sender: Sender,
    pub left: Vec<StatusRecord>,
    pub alive: Vec<AliveRecord>,
    pub suspects: Vec<SuspicionRecord>,
    pub retained: Vec<StatusRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub name: String,
    pub version: NodeVersion,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliveRecord {
    pub name: String,
    pub endpoint: Endpoint,
    pub version: NodeVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SuspicionRecord {
    // Suspect before reporter so an ordered set groups all reports
    // against one suspect.
    pub suspect: String,
    pub reporter: String,
    pub version: NodeVersion,
}

/// Anti-entropy digest: one item per attribute table the sender knows of.
/// Doubles as the request format, where `table_version` is the version the
/// requester already holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDigest {
    pub sender: Sender,
    pub items: Vec<DigestItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestItem {
    pub name: String,
    pub version: NodeVersion,
    pub table_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataReply {
    pub sender: Sender,
    pub tables: Vec<TableUpdate>,
}

/// Attribute data for one node's table. `entries: None` invalidates the
/// requester's pending request: the responder no longer holds newer data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableUpdate {
    pub name: String,
    pub version: NodeVersion,
    pub entries: Option<Vec<TableEntry>>,
}

/// One attribute cell. `value: None` is a death certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEntry {
    pub key: String,
    pub version: u64,
    pub value: Option<Bytes>,
}

/// A view summary for bootstrap/history discovery. Large views are split
/// into self-contained parts, each under the configured MTU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryView {
    pub sender: Sender,
    pub items: Vec<AliveRecord>,
    pub part: u32,
    pub parts: u32,
}
