//! Attribute anti-entropy: the digest / request / reply exchange that
//! converges attribute tables across the cluster.
//!
//! A digest advertises table versions; a peer that is behind asks the
//! advertiser for entries newer than what it holds and remembers whom it
//! asked. The reply either carries those entries or an invalidation, in
//! which case the requester re-asks the whole neighborhood with a pushed
//! request. Pushed requests are never answered with invalidations, so a
//! peer with nothing newer simply stays silent.

use crate::{
    attributes::AttributeTable,
    common::NodeId,
    transport::{
        proto::{DigestItem, MetadataDigest, MetadataReply, Message, TableUpdate},
        Transport,
    },
    version::NodeVersion,
};
use tracing::debug;

use super::MembershipManager;

impl<T: Transport> MembershipManager<T> {
    /// Digest of every attribute table worth advertising. With `full` set
    /// the sent-watermark is ignored, used to greet a new neighbor.
    pub(super) fn build_digest(&self, full: bool) -> Option<MetadataDigest> {
        let mut items = Vec::new();

        if self.my_table.version() > 0 && (full || self.my_table.is_update_needed()) {
            items.push(DigestItem {
                name: self.cfg.node_name.clone(),
                version: self.my_version,
                table_version: self.my_table.version(),
            });
        }

        for (&id, info) in self.view.iter() {
            if id == self.me {
                continue;
            }
            if let Some(table) = &info.table {
                if table.version() > 0 && (full || table.is_update_needed()) {
                    items.push(DigestItem {
                        name: self.cache.name(id).to_owned(),
                        version: info.version,
                        table_version: table.version(),
                    });
                }
            }
        }

        // Retained tables of departed nodes keep gossiping until cleared.
        for (&id, info) in self.history.iter() {
            if let Some(table) = &info.table {
                if table.version() > 0 && (full || table.is_update_needed()) {
                    items.push(DigestItem {
                        name: self.cache.name(id).to_owned(),
                        version: info.version,
                        table_version: table.version(),
                    });
                }
            }
        }

        if items.is_empty() {
            None
        } else {
            Some(MetadataDigest {
                sender: self.sender_header(),
                items,
            })
        }
    }

    /// Advances the sent-watermark of every table named by a digest that
    /// actually went out.
    pub(super) fn mark_digest_sent(&mut self, digest: &MetadataDigest) {
        for item in &digest.items {
            let id = match self.cache.get(&item.name) {
                Some(id) => id,
                None => continue,
            };
            if let Some((_, table)) = self.table_of_mut(id) {
                table.mark_version_sent(item.table_version);
            }
        }
    }

    /// Incoming digest: ask the advertiser for every table it holds a newer
    /// version of, remembering the outstanding request per table.
    pub(super) async fn on_metadata_update(&mut self, digest: MetadataDigest) {
        self.merge_alive(
            &digest.sender.name,
            &digest.sender.endpoint,
            digest.sender.version,
        );
        let advertiser = self
            .cache
            .intern(&digest.sender.name, &digest.sender.endpoint);

        let mut items = Vec::new();
        for item in &digest.items {
            let id = match self.cache.get(&item.name) {
                Some(id) => id,
                None => continue,
            };
            if id == self.me {
                // Only this node writes its own table.
                continue;
            }

            let (local_version, table) = match self.table_of_mut(id) {
                Some(entry) => entry,
                None => continue,
            };
            // Tables belong to one life of a node; across incarnations the
            // view has to converge first.
            if local_version.incarnation() != item.version.incarnation() {
                continue;
            }
            if item.table_version <= table.version() || table.has_pending() {
                continue;
            }

            let held = table.version();
            table.mark_pending(advertiser, item.table_version);
            items.push(DigestItem {
                name: item.name.clone(),
                version: local_version,
                table_version: held,
            });
        }

        if items.is_empty() {
            return;
        }

        debug!(from = %digest.sender.name, tables = items.len(), "requesting newer attribute data");
        let request = Message::MetadataRequest(MetadataDigest {
            sender: self.sender_header(),
            items,
        });
        if self
            .transport
            .send_to_neighbor(digest.sender.endpoint.clone(), request)
            .await
            .is_err()
        {
            self.undo_pending_requests(advertiser).await;
        }
    }

    /// Incoming request (direct or pushed). `push` requests come from a
    /// requester flooding the neighborhood, so only peers holding newer
    /// data answer; a direct request always gets an answer, if only an
    /// invalidation.
    pub(super) async fn on_metadata_request(&mut self, digest: MetadataDigest, push: bool) {
        let mut tables = Vec::new();

        for item in &digest.items {
            let local = self
                .cache
                .get(&item.name)
                .and_then(|id| self.table_of(id));

            let (local_version, table) = match local {
                Some(entry) => entry,
                None => {
                    if !push {
                        tables.push(invalidation(item));
                    }
                    continue;
                }
            };

            if local_version.incarnation() > item.version.incarnation() {
                // We hold a newer life of that node; send its whole table
                // so the requester converges once its view catches up.
                tables.push(TableUpdate {
                    name: item.name.clone(),
                    version: local_version,
                    entries: Some(table.write_entries_newer_than(0)),
                });
            } else if local_version.incarnation() == item.version.incarnation()
                && table.version() > item.table_version
            {
                tables.push(TableUpdate {
                    name: item.name.clone(),
                    version: local_version,
                    entries: Some(table.write_entries_newer_than(item.table_version)),
                });
            } else if !push {
                tables.push(invalidation(item));
            }
        }

        if tables.is_empty() {
            return;
        }

        let reply = Message::MetadataReply(MetadataReply {
            sender: self.sender_header(),
            tables,
        });
        if let Err(e) = self
            .transport
            .send_to_neighbor(digest.sender.endpoint.clone(), reply)
            .await
        {
            debug!(to = %digest.sender.name, error = %e, "metadata reply send failed");
        }
    }

    /// Incoming reply: merge what applies, and for every table the
    /// responder could not serve, re-ask the whole neighborhood.
    pub(super) async fn on_metadata_reply(&mut self, reply: MetadataReply) {
        let mut rerequest = Vec::new();

        for update in &reply.tables {
            let id = match self.cache.get(&update.name) {
                Some(id) => id,
                None => continue,
            };
            if id == self.me {
                continue;
            }
            let (local_version, table) = match self.table_of_mut(id) {
                Some(entry) => entry,
                None => continue,
            };

            if update.version.incarnation() > local_version.incarnation() {
                // Data from a life our view has not caught up with yet.
                // Keep the request outstanding and wait for the view.
                continue;
            }
            if update.version.incarnation() < local_version.incarnation() {
                table.clear_pending();
                rerequest.push(DigestItem {
                    name: update.name.clone(),
                    version: local_version,
                    table_version: table.version(),
                });
                continue;
            }

            match &update.entries {
                Some(entries) => {
                    let applied = table.merge_entries(entries);
                    table.clear_pending();
                    if applied > 0 {
                        debug!(node = %update.name, applied, "attribute table merged");
                    }
                }
                None => {
                    table.clear_pending();
                    rerequest.push(DigestItem {
                        name: update.name.clone(),
                        version: local_version,
                        table_version: table.version(),
                    });
                }
            }
        }

        if rerequest.is_empty() {
            return;
        }

        debug!(tables = rerequest.len(), "re-requesting invalidated tables from all neighbors");
        let push = Message::MetadataRequestPush(MetadataDigest {
            sender: self.sender_header(),
            items: rerequest,
        });
        self.transport.send_to_all(push).await;
    }

    /// A peer we had outstanding requests against went away: clear those
    /// marks and re-ask everyone else.
    pub(super) async fn undo_pending_requests(&mut self, gone: NodeId) {
        let mut items = Vec::new();

        for (&id, info) in self.view.iter_mut() {
            if let Some(table) = info.table.as_mut() {
                if table.is_pending(gone) {
                    table.clear_pending();
                    items.push(DigestItem {
                        name: self.cache.name(id).to_owned(),
                        version: info.version,
                        table_version: table.version(),
                    });
                }
            }
        }
        for (&id, info) in self.history.iter_mut() {
            if let Some(table) = info.table.as_mut() {
                if table.is_pending(gone) {
                    table.clear_pending();
                    items.push(DigestItem {
                        name: self.cache.name(id).to_owned(),
                        version: info.version,
                        table_version: table.version(),
                    });
                }
            }
        }

        if items.is_empty() {
            return;
        }

        debug!(peer = %self.cache.name(gone), tables = items.len(), "redirecting pending requests");
        let push = Message::MetadataRequestPush(MetadataDigest {
            sender: self.sender_header(),
            items,
        });
        self.transport.send_to_all(push).await;
    }

    fn table_of(&self, id: NodeId) -> Option<(NodeVersion, &AttributeTable)> {
        if id == self.me {
            return Some((self.my_version, &self.my_table));
        }
        if let Some(info) = self.view.get(id) {
            return info.table.as_ref().map(|t| (info.version, t));
        }
        let info = self.history.get(id)?;
        info.table.as_ref().map(|t| (info.version, t))
    }

    pub(super) fn table_of_mut(&mut self, id: NodeId) -> Option<(NodeVersion, &mut AttributeTable)> {
        if id == self.me {
            return Some((self.my_version, &mut self.my_table));
        }
        if let Some(info) = self.view.get_mut(id) {
            let version = info.version;
            return info.table.as_mut().map(|t| (version, t));
        }
        let info = self.history.get_mut(id)?;
        let version = info.version;
        info.table.as_mut().map(|t| (version, t))
    }
}

/// Invalidation reply for a request the responder cannot serve: the
/// requester's pending mark is cleared and it re-asks the neighborhood.
fn invalidation(item: &DigestItem) -> TableUpdate {
    TableUpdate {
        name: item.name.clone(),
        version: item.version,
        entries: None,
    }
}
