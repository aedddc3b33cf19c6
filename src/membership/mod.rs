//! The membership manager: single authoritative owner of the view, ring,
//! bootstrap, history and update database. It runs as one actor task
//! draining a command mailbox, so every mutation happens on one logical
//! thread; the cross-thread entry points on [`crate::Handle`] are channel
//! sends.

pub mod bootstrap;
pub mod history;
pub mod ring;
pub mod suspicion;
pub mod update_db;
pub mod view;

mod exchange;

pub use bootstrap::{Bootstrap, BootstrapMultimap, BootstrapSet, DiscoveryTarget};
pub use view::{MembershipView, NodeInfo, NodeStatus};

use crate::{
    attributes::{AttributeTable, INTERNAL_KEY_PREFIX},
    common::{Endpoint, NodeCache, NodeId},
    config::Config,
    error::{Error, Result},
    event::{Event, MemberInfo, NodeStatusChange},
    transport::{
        proto::{
            AliveRecord, DiscoveryView, LeaveAck, LeaveMessage, Message, Sender,
            UpdateMessage,
        },
        Transport,
    },
    version::NodeVersion,
};
use bytes::Bytes;
use history::NodeHistorySet;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{BTreeSet, HashSet};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use update_db::UpdateDatabase;
use uuid::Uuid;

type Reply<T> = oneshot::Sender<T>;

/// Which slice of this node's own attributes to wipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    All,
    Internal,
    External,
}

/// A discovery target handed to the topology manager: either a known node
/// or a configured endpoint we have no name for yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryProbe {
    pub name: Option<String>,
    pub endpoint: Endpoint,
    pub from_bootstrap: bool,
}

#[derive(Debug)]
pub(crate) enum Command {
    Incoming(Message),
    NewNeighbor {
        name: String,
        endpoint: Endpoint,
    },
    DisconnectedNeighbor {
        name: String,
    },
    ReportSuspect {
        name: String,
    },
    ReportDuplicateNode {
        name: String,
        incarnation: i64,
    },
    SetAttribute {
        key: String,
        value: Bytes,
        tx: Reply<Result<bool>>,
    },
    RemoveAttribute {
        key: String,
        tx: Reply<bool>,
    },
    GetAttribute {
        key: String,
        tx: Reply<Option<Bytes>>,
    },
    ContainsAttribute {
        key: String,
        tx: Reply<bool>,
    },
    AttributeKeys {
        tx: Reply<BTreeSet<String>>,
    },
    ClearAttributes {
        scope: ClearScope,
        tx: Reply<()>,
    },
    ClearRetained {
        name: Option<String>,
        tx: Reply<bool>,
    },
    Members {
        tx: Reply<Vec<MemberInfo>>,
    },
    RandomNode {
        tx: Reply<Option<(String, Endpoint)>>,
    },
    StructuredNode {
        tx: Reply<Option<(String, Endpoint)>>,
    },
    DiscoveryNode {
        tx: Reply<Option<DiscoveryProbe>>,
    },
    Terminate {
        soft: bool,
        remove_retained: bool,
        tx: Reply<bool>,
    },
}

pub struct MembershipManager<T: Transport> {
    cfg: Config,
    instance: Uuid,

    cache: NodeCache,
    me: NodeId,
    my_version: NodeVersion,
    my_table: AttributeTable,
    last_advertised: Option<NodeVersion>,

    view: MembershipView,
    history: NodeHistorySet,
    bootstrap: Bootstrap,
    updates: UpdateDatabase,

    transport: T,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<Event>,
    pending_changes: Vec<NodeStatusChange>,

    rng: StdRng,
    started: bool,
    closed: bool,
    leave_ack_waiter: Option<Reply<bool>>,
}

impl<T: Transport> MembershipManager<T> {
    /// Starts the manager actor and returns the handle every other layer
    /// talks through.
    pub fn spawn(cfg: Config, transport: T) -> crate::handle::Handle {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let (event_tx, _) = broadcast::channel(256);

        let manager = Self::new(cfg, transport, cmd_rx, event_tx.clone());
        tokio::spawn(manager.run());

        crate::handle::Handle::new(cmd_tx, event_tx)
    }

    fn new(
        cfg: Config,
        transport: T,
        commands: mpsc::Receiver<Command>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        let mut cache = NodeCache::new();
        let me = cache.intern(&cfg.node_name, &cfg.endpoint);
        let my_version = NodeVersion::new(cfg.incarnation, 0);

        let seed = cfg.seed.unwrap_or_else(rand::random);
        let rng = StdRng::seed_from_u64(seed);
        let view = MembershipView::new(seed);

        let bootstrap = Self::build_bootstrap(&cfg, &mut cache, me);

        Self {
            instance: Uuid::new_v4(),
            cache,
            me,
            my_version,
            my_table: AttributeTable::new(),
            last_advertised: None,
            view,
            history: NodeHistorySet::new(),
            bootstrap,
            updates: UpdateDatabase::new(),
            transport,
            commands,
            events,
            pending_changes: Vec::new(),
            rng,
            started: false,
            closed: false,
            leave_ack_waiter: None,
            cfg,
        }
    }

    fn build_bootstrap(cfg: &Config, cache: &mut NodeCache, me: NodeId) -> Bootstrap {
        let mut names = HashSet::new();
        let all_named_unique = cfg
            .bootstrap
            .iter()
            .all(|e| matches!(&e.name, Some(n) if names.insert(n.clone())));

        if all_named_unique {
            let ids = cfg
                .bootstrap
                .iter()
                .filter_map(|e| e.name.as_deref().map(|n| cache.intern(n, &e.endpoint)))
                .filter(|&id| id != me)
                .collect();
            Bootstrap::Set(BootstrapSet::new(ids))
        } else {
            let entries = cfg
                .bootstrap
                .iter()
                .map(|e| {
                    let id = e.name.as_deref().map(|n| cache.intern(n, &e.endpoint));
                    (id, e.endpoint.clone())
                })
                .filter(|(id, _)| *id != Some(me))
                .collect();
            Bootstrap::Multi(BootstrapMultimap::new(entries))
        }
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.cfg.gossip_interval);
        info!(instance = %self.instance, node = %self.cfg.node_name, "membership manager started");

        loop {
            tokio::select! {
                maybe_cmd = self.commands.recv() => match maybe_cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => break,
                },
                _ = ticker.tick() => self.on_gossip_round().await,
            }

            if self.closed {
                if let Some(tx) = &self.leave_ack_waiter {
                    if tx.is_closed() {
                        self.leave_ack_waiter = None;
                    }
                }
                if self.leave_ack_waiter.is_none() {
                    break;
                }
            }
        }

        info!(instance = %self.instance, node = %self.cfg.node_name, "membership manager stopped");
    }

    async fn on_command(&mut self, cmd: Command) {
        if self.closed {
            // Only the shutdown handshake survives the closed flag; every
            // other entry point is a no-op and reply channels are dropped.
            match cmd {
                Command::Incoming(Message::LeaveAck(_)) => {
                    if let Some(tx) = self.leave_ack_waiter.take() {
                        let _ = tx.send(true);
                    }
                }
                Command::Terminate { tx, .. } => {
                    let _ = tx.send(false);
                }
                _ => {}
            }
            return;
        }

        match cmd {
            Command::Incoming(msg) => {
                if let Err(e) = self.process_incoming(msg).await {
                    warn!(error = %e, "failed to process incoming message");
                }
            }
            Command::NewNeighbor { name, endpoint } => {
                self.on_new_neighbor(name, endpoint).await;
            }
            Command::DisconnectedNeighbor { name } => {
                self.on_disconnected_neighbor(name).await;
            }
            Command::ReportSuspect { name } => {
                self.report_suspect_local(&name);
                self.emit_view_changes();
            }
            Command::ReportDuplicateNode { name, incarnation } => {
                self.report_duplicate_node(&name, incarnation);
                self.emit_view_changes();
            }
            Command::SetAttribute { key, value, tx } => {
                let res = self.my_table.set(&key, value);
                if matches!(res, Ok(_)) {
                    self.notify_my_metadata();
                }
                let _ = tx.send(res);
            }
            Command::RemoveAttribute { key, tx } => {
                let removed = self.my_table.remove(&key);
                if removed {
                    self.notify_my_metadata();
                }
                let _ = tx.send(removed);
            }
            Command::GetAttribute { key, tx } => {
                let _ = tx.send(self.my_table.get(&key));
            }
            Command::ContainsAttribute { key, tx } => {
                let _ = tx.send(self.my_table.contains(&key));
            }
            Command::AttributeKeys { tx } => {
                let _ = tx.send(self.my_table.key_set());
            }
            Command::ClearAttributes { scope, tx } => {
                match scope {
                    ClearScope::All => self.my_table.clear(),
                    ClearScope::Internal => self.my_table.clear_prefix(INTERNAL_KEY_PREFIX),
                    ClearScope::External => self.my_table.clear_no_prefix(INTERNAL_KEY_PREFIX),
                }
                self.notify_my_metadata();
                let _ = tx.send(());
            }
            Command::ClearRetained { name, tx } => {
                let cleared = match name {
                    Some(name) => match self.cache.get(&name) {
                        Some(id) => self.history.clear_retained(id),
                        None => false,
                    },
                    None => {
                        self.history.clear_all_retained();
                        true
                    }
                };
                let _ = tx.send(cleared);
            }
            Command::Members { tx } => {
                let members = self
                    .view
                    .ids()
                    .collect::<Vec<_>>()
                    .into_iter()
                    .map(|id| self.member_info(id))
                    .collect();
                let _ = tx.send(members);
            }
            Command::RandomNode { tx } => {
                let _ = tx.send(self.random_node());
            }
            Command::StructuredNode { tx } => {
                let _ = tx.send(self.structured_node());
            }
            Command::DiscoveryNode { tx } => {
                let probe = self.pick_discovery_target().map(|(target, from_bootstrap)| {
                    self.probe_of(target, from_bootstrap)
                });
                let _ = tx.send(probe);
            }
            Command::Terminate {
                soft,
                remove_retained,
                tx,
            } => {
                self.terminate(soft, remove_retained, tx).await;
            }
        }
    }

    async fn terminate(&mut self, soft: bool, remove_retained: bool, tx: Reply<bool>) {
        info!(soft, remove_retained, "terminating");
        self.closed = true;

        if soft && self.started {
            let leave = Message::Leave(LeaveMessage {
                sender: self.sender_header(),
                status: NodeStatus::Leave,
                request_ack: remove_retained,
            });
            let (sent, total) = self.transport.send_to_all(leave).await;
            debug!(sent, total, "leave sent");

            if remove_retained && sent > 0 {
                // Stay alive until a neighbor confirms the removal; the
                // caller's timeout bounds the wait.
                self.leave_ack_waiter = Some(tx);
                return;
            }
        }

        let _ = tx.send(!remove_retained);
    }

    // === incoming dispatch ===

    async fn process_incoming(&mut self, msg: Message) -> Result<()> {
        if msg.sender().name == self.cfg.node_name {
            // Our own gossip reflected back.
            return Ok(());
        }

        match msg {
            Message::Leave(m) => self.on_leave(m).await,
            Message::LeaveAck(m) => {
                debug!(from = %m.sender.name, "leave ack");
                if let Some(tx) = self.leave_ack_waiter.take() {
                    let _ = tx.send(true);
                }
            }
            Message::NodeUpdate(m) => self.on_node_update(m),
            Message::MetadataUpdate(d) => self.on_metadata_update(d).await,
            Message::MetadataRequest(d) => self.on_metadata_request(d, false).await,
            Message::MetadataRequestPush(d) => self.on_metadata_request(d, true).await,
            Message::MetadataReply(r) => self.on_metadata_reply(r).await,
            Message::DiscoveryRequest(v) => {
                let reply_to = v.sender.endpoint.clone();
                self.merge_discovery_view(v);
                self.send_discovery_views(reply_to).await;
            }
            Message::DiscoveryReply(v) => self.merge_discovery_view(v),
        }

        self.emit_view_changes();
        self.emit_metadata_changes();
        Ok(())
    }

    async fn on_leave(&mut self, m: LeaveMessage) {
        let id = self.cache.intern(&m.sender.name, &m.sender.endpoint);
        debug!(node = %m.sender.name, version = %m.sender.version, "leave received");

        if m.request_ack {
            let ack = Message::LeaveAck(LeaveAck {
                sender: self.sender_header(),
            });
            if let Err(e) = self
                .transport
                .send_to_neighbor(m.sender.endpoint.clone(), ack)
                .await
            {
                debug!(error = %e, "leave ack send failed");
            }
        }

        // An acked leave asks the cluster to drop retained attributes.
        let retain = !m.request_ack;
        self.view_remove_node(id, m.sender.version, m.status, retain);
    }

    fn on_node_update(&mut self, m: UpdateMessage) {
        self.merge_alive(&m.sender.name, &m.sender.endpoint, m.sender.version);

        for rec in &m.left {
            self.merge_departed(&rec.name, rec.version, rec.status, false);
        }
        for rec in &m.retained {
            self.merge_departed(&rec.name, rec.version, rec.status, true);
        }
        for rec in &m.alive {
            self.merge_alive(&rec.name, &rec.endpoint, rec.version);
        }
        for s in &m.suspects {
            let suspect = self.cache.intern(&s.suspect, "");
            let reporter = self.cache.intern(&s.reporter, "");
            self.process_suspicion(suspect, reporter, s.version);
        }
    }

    async fn on_new_neighbor(&mut self, name: String, endpoint: Endpoint) {
        let _ = self.cache.intern(&name, &endpoint);
        debug!(node = %name, %endpoint, "new neighbor");

        // Greet with our view and a full metadata digest so the newcomer
        // converges in one exchange instead of waiting out diff rounds.
        self.send_discovery_views(endpoint.clone()).await;
        if let Some(digest) = self.build_digest(true) {
            if let Err(e) = self
                .transport
                .send_to_neighbor(endpoint, Message::MetadataUpdate(digest))
                .await
            {
                debug!(error = %e, "greeting digest send failed");
            }
        }
    }

    async fn on_disconnected_neighbor(&mut self, name: String) {
        debug!(node = %name, "neighbor disconnected");
        let id = match self.cache.get(&name) {
            Some(id) => id,
            None => return,
        };

        self.report_suspect_local(&name);
        self.emit_view_changes();
        self.undo_pending_requests(id).await;
    }

    // === view mutation primitives ===

    fn merge_alive(&mut self, name: &str, endpoint: &str, version: NodeVersion) {
        let id = self.cache.intern(name, endpoint);
        if id == self.me {
            return;
        }

        let mut rebutted = false;
        if let Some(info) = self.view.get_mut(id) {
            if version > info.version {
                info.version = version;
                info.timestamp = Instant::now();
                info.suspicions.delete_older(version);
                if info.status == NodeStatus::Suspect && info.suspicions.is_empty() {
                    info.status = NodeStatus::Alive;
                    rebutted = true;
                }
                self.updates.add_alive(id, version);
            }
            if rebutted {
                debug!(node = %name, %version, "suspicion rebutted");
                self.push_status_change(id, NodeStatus::Alive);
            }
            return;
        }

        // An alive claim must dominate whatever history recorded, or a
        // node already confirmed dead would flap back in.
        if let Some(hist_ver) = self.history.version_of(id) {
            if version <= hist_ver {
                return;
            }
        }

        self.view_add_node(id, version);
    }

    fn view_add_node(&mut self, id: NodeId, version: NodeVersion) {
        let mut info = NodeInfo::alive(version);

        // The same life resurfacing gets its retained attributes back.
        if let Some(hist) = self.history.remove(id) {
            if hist.version.incarnation() == version.incarnation() {
                if let Some(table) = hist.table {
                    info.table = Some(table);
                }
            }
        }

        let name = self.cache.name(id).to_owned();
        if let Err(e) = self.view.add(id, &name, info) {
            warn!(node = %name, error = %e, "view add failed");
            return;
        }

        info!(node = %name, %version, "node joined view");
        self.bootstrap.set_in_view(id, true);
        self.note_bootstrap_endpoint(id, true);
        self.updates.add_alive(id, version);
        self.push_status_change(id, NodeStatus::Alive);
        let _ = self.events.send(Event::NodeJoin(self.member_info(id)));
    }

    fn view_remove_node(
        &mut self,
        id: NodeId,
        version: NodeVersion,
        status: NodeStatus,
        retain: bool,
    ) {
        if id == self.me {
            return;
        }

        let mut info = match self.view.remove(id) {
            Ok(info) => info,
            Err(_) => {
                // Not in the view; still record the departure so stale
                // alive claims keep losing.
                self.merge_departed_history(id, version, status);
                return;
            }
        };

        if version > info.version {
            info.version = version;
        }
        info.status = status;
        info.timestamp = Instant::now();
        info.suspicions.clear();

        let retain = retain && self.cfg.retain_attributes_on_suspect;
        if !retain {
            info.table = None;
        }

        let final_version = info.version;
        info!(node = %self.cache.name(id), version = %final_version, ?status, retain, "node left view");

        if retain {
            self.updates.add_retained(id, final_version, status);
        } else {
            self.updates.add_left(id, final_version, status);
        }

        let member = self.member_info_of(id, &info);
        self.history.add(id, info);
        self.bootstrap.set_in_view(id, false);
        self.note_bootstrap_endpoint(id, false);

        self.pending_changes.push(NodeStatusChange {
            member: member.clone(),
            status,
        });
        let _ = self.events.send(Event::NodeLeave(member));
    }

    fn merge_departed(
        &mut self,
        name: &str,
        version: NodeVersion,
        status: NodeStatus,
        retain: bool,
    ) {
        let id = self.cache.intern(name, "");
        if id == self.me {
            return;
        }

        if let Some(info) = self.view.get(id) {
            if version >= info.version {
                self.view_remove_node(id, version, status, retain);
            }
            return;
        }

        self.merge_departed_history(id, version, status);
    }

    fn merge_departed_history(&mut self, id: NodeId, version: NodeVersion, status: NodeStatus) {
        if self.history.contains(id) {
            self.history.update_ver(id, version, status);
        } else {
            let mut info = NodeInfo::alive(version);
            info.status = status;
            info.table = None;
            self.history.add(id, info);
        }
    }

    // === suspicion ===

    fn process_suspicion(&mut self, suspect: NodeId, reporter: NodeId, version: NodeVersion) {
        if suspect == self.me {
            self.rebut_suspicion();
            return;
        }

        let (new_evidence, became_suspect, reports) = {
            let info = match self.view.get_mut(suspect) {
                Some(info) => info,
                None => return,
            };
            if version < info.version {
                // Report against a life the suspect already moved past.
                return;
            }

            let new_evidence = info.suspicions.add(reporter, version);
            let became_suspect = new_evidence && info.status == NodeStatus::Alive;
            if became_suspect {
                info.status = NodeStatus::Suspect;
            }
            (new_evidence, became_suspect, info.suspicions.len())
        };

        if !new_evidence {
            return;
        }

        if became_suspect {
            debug!(node = %self.cache.name(suspect), %version, "node suspected");
            self.push_status_change(suspect, NodeStatus::Suspect);
        }
        self.updates.add_suspicion(suspect, reporter, version);

        let mut threshold = self.cfg.suspicion_threshold.max(1);
        if self.view.len() <= threshold + 1 {
            threshold = 1;
        }
        if reports >= threshold {
            self.view_remove_node(suspect, version, NodeStatus::Suspect, true);
        }
    }

    /// My own name showed up in a suspicion report: advance my version so
    /// the alive claim dominates the suspected one, and make the attribute
    /// table look newer without touching real attributes.
    fn rebut_suspicion(&mut self) {
        self.my_version.bump_minor();
        self.sync_my_view_entry();
        self.updates.add_alive(self.me, self.my_version);
        if !self.my_table.is_update_needed() {
            self.my_table.write_rebuttal_key();
        }
        info!(version = %self.my_version, "rebutting suspicion against self");
    }

    fn report_suspect_local(&mut self, name: &str) {
        if name == self.cfg.node_name {
            debug_assert!(false, "suspicion report against self");
            warn!("ignoring suspicion report against self");
            return;
        }

        let id = self.cache.intern(name, "");
        let version = match self.view.get(id) {
            Some(info) => info.version,
            None => return,
        };
        self.process_suspicion(id, self.me, version);
    }

    fn report_duplicate_node(&mut self, name: &str, incarnation: i64) {
        let id = self.cache.intern(name, "");
        let stale = match self.view.get(id) {
            Some(info) if info.version.incarnation() < incarnation => {
                NodeVersion::highest_of(info.version.incarnation())
            }
            _ => return,
        };

        // Synthesize a terminal Leave for the stale incarnation instead of
        // waiting out a suspicion timeout.
        warn!(node = %name, incarnation, "duplicate node detected, dropping stale incarnation");
        self.view_remove_node(id, stale, NodeStatus::SuspectDuplicateNode, false);
    }

    // === gossip round ===

    async fn on_gossip_round(&mut self) {
        if self.closed {
            return;
        }
        if !self.started {
            self.on_start();
        }

        if self.last_advertised.map_or(true, |v| v < self.my_version) {
            self.updates.add_alive(self.me, self.my_version);
            self.last_advertised = Some(self.my_version);
        }

        if !self.updates.is_empty() {
            let msg = Message::NodeUpdate(
                self.updates.to_message(&self.cache, self.sender_header()),
            );
            let (sent, total) = self.transport.send_to_all(msg).await;
            if sent == total {
                self.updates.clear();
            } else {
                debug!(sent, total, "partial update round, batch kept for retry");
            }
        }

        if let Some(digest) = self.build_digest(false) {
            let msg = Message::MetadataUpdate(digest.clone());
            let (sent, _) = self.transport.send_to_all(msg).await;
            if sent > 0 {
                self.mark_digest_sent(&digest);
            }
        }

        if let Some((target, _)) = self.pick_discovery_target() {
            self.send_discovery_probe(target).await;
        }

        let now = Instant::now();
        if let Some(cutoff) = now.checked_sub(self.cfg.history_retention) {
            self.history.prune(cutoff);
        }
        if let Some(cutoff) = now.checked_sub(self.cfg.tombstone_retention) {
            self.my_table.prune_death_certificates(cutoff);
            for (_, info) in self.view.iter_mut() {
                if let Some(table) = info.table.as_mut() {
                    table.prune_death_certificates(cutoff);
                }
            }
            for (_, info) in self.history.iter_mut() {
                if let Some(table) = info.table.as_mut() {
                    table.prune_death_certificates(cutoff);
                }
            }
        }

        self.emit_metadata_changes();
        self.emit_view_changes();
    }

    fn on_start(&mut self) {
        let name = self.cfg.node_name.clone();
        let info = NodeInfo::alive(self.my_version);
        if let Err(e) = self.view.add(self.me, &name, info) {
            warn!(error = %e, "self insert failed");
            return;
        }
        self.started = true;
        self.push_status_change(self.me, NodeStatus::Alive);
        self.emit_view_changes();
        info!(node = %name, version = %self.my_version, "self inserted into view");
    }

    // === discovery ===

    fn pick_discovery_target(&mut self) -> Option<(DiscoveryTarget, bool)> {
        let from_bootstrap = self.bootstrap.remaining();
        let from_history = self.history.len();
        if from_bootstrap + from_history == 0 {
            return None;
        }

        // Mix draws proportionally to each set's remaining candidates.
        let roll = self.rng.gen_range(0..from_bootstrap + from_history);
        if roll < from_bootstrap {
            let prefer = self.cfg.full_view_bootstrap;
            let successor = if prefer {
                self.bootstrap_ring_successor()
            } else {
                None
            };
            self.bootstrap
                .next_target_not_in_view(&mut self.rng, successor, prefer)
                .map(|t| (t, true))
        } else {
            self.history
                .next_node()
                .map(|id| (DiscoveryTarget::Node(id), false))
        }
    }

    /// My ring successor among the candidates still waiting to be
    /// discovered. Members of the view are already behind us, so their ring
    /// slots are irrelevant here; each candidate is ordered by the virtual
    /// id its name will occupy once it joins.
    fn bootstrap_ring_successor(&self) -> Option<NodeId> {
        let ring = self.view.ring();
        let my_vid = ring.virtual_id(&self.cfg.node_name);
        let cache = &self.cache;
        bootstrap::ring_successor_of(
            my_vid,
            self.bootstrap
                .ids_not_in_view()
                .into_iter()
                .map(|id| (id, ring.virtual_id(cache.name(id)))),
        )
    }

    fn probe_of(&self, target: DiscoveryTarget, from_bootstrap: bool) -> DiscoveryProbe {
        match target {
            DiscoveryTarget::Node(id) => DiscoveryProbe {
                name: Some(self.cache.name(id).to_owned()),
                endpoint: self.cache.endpoint(id).to_owned(),
                from_bootstrap,
            },
            DiscoveryTarget::Blind(endpoint) => DiscoveryProbe {
                name: None,
                endpoint,
                from_bootstrap,
            },
        }
    }

    async fn send_discovery_probe(&mut self, target: DiscoveryTarget) {
        let endpoint = match &target {
            DiscoveryTarget::Node(id) => self.cache.endpoint(*id).to_owned(),
            DiscoveryTarget::Blind(endpoint) => endpoint.clone(),
        };
        if endpoint.is_empty() {
            return;
        }

        let request = Message::DiscoveryRequest(DiscoveryView {
            sender: self.sender_header(),
            items: vec![self.my_alive_record()],
            part: 0,
            parts: 1,
        });
        if let Err(e) = self.transport.send_to_neighbor(endpoint.clone(), request).await {
            debug!(%endpoint, error = %e, "discovery probe failed");
        }
    }

    fn merge_discovery_view(&mut self, v: DiscoveryView) {
        self.merge_alive(&v.sender.name, &v.sender.endpoint, v.sender.version);
        for item in v.items {
            self.merge_alive(&item.name, &item.endpoint, item.version);
        }
    }

    async fn send_discovery_views(&mut self, to: Endpoint) {
        let parts = match pack_discovery_views(
            self.sender_header(),
            self.discovery_items(),
            self.cfg.discovery_mtu,
        ) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "discovery view packing failed");
                return;
            }
        };

        for part in parts {
            if let Err(e) = self
                .transport
                .send_to_neighbor(to.clone(), Message::DiscoveryReply(part))
                .await
            {
                debug!(endpoint = %to, error = %e, "discovery reply send failed");
                return;
            }
        }
    }

    fn discovery_items(&self) -> Vec<AliveRecord> {
        let mut items = vec![self.my_alive_record()];
        for (&id, info) in self.view.iter() {
            if id == self.me {
                continue;
            }
            items.push(AliveRecord {
                name: self.cache.name(id).to_owned(),
                endpoint: self.cache.endpoint(id).to_owned(),
                version: info.version,
            });
        }
        items
    }

    // === peer selection ===

    fn random_node(&mut self) -> Option<(String, Endpoint)> {
        let others: Vec<NodeId> = self.view.ids().filter(|&id| id != self.me).collect();
        if others.is_empty() {
            return None;
        }
        let id = others[self.rng.gen_range(0..others.len())];
        Some((
            self.cache.name(id).to_owned(),
            self.cache.endpoint(id).to_owned(),
        ))
    }

    fn structured_node(&mut self) -> Option<(String, Endpoint)> {
        let vid = self.view.virtual_id_of(self.me)?;
        let r: f64 = self.rng.gen();
        let id = self.view.ring().harmonic_pick(vid, r)?;
        Some((
            self.cache.name(id).to_owned(),
            self.cache.endpoint(id).to_owned(),
        ))
    }

    // === events & snapshots ===

    fn sender_header(&self) -> Sender {
        Sender {
            name: self.cfg.node_name.clone(),
            endpoint: self.cfg.endpoint.clone(),
            version: self.my_version,
        }
    }

    fn my_alive_record(&self) -> AliveRecord {
        AliveRecord {
            name: self.cfg.node_name.clone(),
            endpoint: self.cfg.endpoint.clone(),
            version: self.my_version,
        }
    }

    fn sync_my_view_entry(&mut self) {
        let version = self.my_version;
        if let Some(info) = self.view.get_mut(self.me) {
            info.version = version;
        }
    }

    fn member_info(&self, id: NodeId) -> MemberInfo {
        if id == self.me {
            return MemberInfo {
                name: self.cfg.node_name.clone(),
                endpoint: self.cfg.endpoint.clone(),
                version: self.my_version,
                attributes: self.my_table.snapshot(),
            };
        }

        if let Some(info) = self.view.get(id) {
            return self.member_info_of(id, info);
        }
        if let Some(info) = self.history.get(id) {
            return self.member_info_of(id, info);
        }

        MemberInfo {
            name: self.cache.name(id).to_owned(),
            endpoint: self.cache.endpoint(id).to_owned(),
            version: NodeVersion::new(0, 0),
            attributes: Default::default(),
        }
    }

    fn member_info_of(&self, id: NodeId, info: &NodeInfo) -> MemberInfo {
        MemberInfo {
            name: self.cache.name(id).to_owned(),
            endpoint: self.cache.endpoint(id).to_owned(),
            version: info.version,
            attributes: info
                .table
                .as_ref()
                .map(|t| t.snapshot())
                .unwrap_or_default(),
        }
    }

    fn push_status_change(&mut self, id: NodeId, status: NodeStatus) {
        let member = self.member_info(id);
        self.pending_changes.push(NodeStatusChange { member, status });
    }

    fn emit_view_changes(&mut self) {
        if self.pending_changes.is_empty() {
            return;
        }
        let changes = std::mem::take(&mut self.pending_changes);
        let _ = self.events.send(Event::ViewChange(changes));
    }

    fn notify_my_metadata(&mut self) {
        if self.my_table.is_notify_needed() {
            self.my_table.mark_notified();
            let member = self.member_info(self.me);
            let _ = self.events.send(Event::MetadataChange(vec![member]));
        }
    }

    fn emit_metadata_changes(&mut self) {
        let mut changed: Vec<NodeId> = Vec::new();
        if self.my_table.is_notify_needed() {
            self.my_table.mark_notified();
            changed.push(self.me);
        }
        for (&id, info) in self.view.iter_mut() {
            if let Some(table) = info.table.as_mut() {
                if table.is_notify_needed() {
                    table.mark_notified();
                    changed.push(id);
                }
            }
        }
        for (&id, info) in self.history.iter_mut() {
            if let Some(table) = info.table.as_mut() {
                if table.is_notify_needed() {
                    table.mark_notified();
                    changed.push(id);
                }
            }
        }

        if changed.is_empty() {
            return;
        }
        let members = changed.into_iter().map(|id| self.member_info(id)).collect();
        let _ = self.events.send(Event::MetadataChange(members));
    }

    fn note_bootstrap_endpoint(&mut self, id: NodeId, in_view: bool) {
        if let Bootstrap::Multi(multi) = &mut self.bootstrap {
            let endpoint = self.cache.endpoint(id).to_owned();
            if !endpoint.is_empty() {
                multi.set_endpoint_in_view(&endpoint, in_view);
            }
        }
    }
}

/// Packs alive records into self-contained discovery messages, each within
/// `mtu` serialized bytes. A record that alone exceeds the MTU is a hard
/// error rather than a silent drop.
pub(crate) fn pack_discovery_views(
    sender: Sender,
    items: Vec<AliveRecord>,
    mtu: usize,
) -> Result<Vec<DiscoveryView>> {
    let mut parts: Vec<DiscoveryView> = Vec::new();
    let mut current = DiscoveryView {
        sender: sender.clone(),
        items: Vec::new(),
        part: 0,
        parts: 0,
    };

    for item in items {
        current.items.push(item);
        let size = bincode::serialized_size(&current).map_err(|e| Error::new_codec(e))? as usize;
        if size <= mtu {
            continue;
        }

        let overflow = match current.items.pop() {
            Some(item) => item,
            None => return Err(Error::new_oversized_item()),
        };
        if current.items.is_empty() {
            return Err(Error::new_oversized_item());
        }

        let next = DiscoveryView {
            sender: sender.clone(),
            items: vec![overflow],
            part: 0,
            parts: 0,
        };
        let size = bincode::serialized_size(&next).map_err(|e| Error::new_codec(e))? as usize;
        if size > mtu {
            return Err(Error::new_oversized_item());
        }
        parts.push(std::mem::replace(&mut current, next));
    }

    if !current.items.is_empty() || parts.is_empty() {
        parts.push(current);
    }

    let total = parts.len() as u32;
    for (i, part) in parts.iter_mut().enumerate() {
        part.part = i as u32;
        part.parts = total;
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootstrapEntry;
    use async_trait::async_trait;

    fn sender() -> Sender {
        Sender {
            name: "me".into(),
            endpoint: "127.0.0.1:7000".into(),
            version: NodeVersion::new(1, 0),
        }
    }

    fn records(n: usize) -> Vec<AliveRecord> {
        (0..n)
            .map(|i| AliveRecord {
                name: format!("node-{:04}", i),
                endpoint: format!("10.0.0.{}:7000", i),
                version: NodeVersion::new(1, i as i64),
            })
            .collect()
    }

    #[test]
    fn small_view_packs_into_one_part() {
        let parts = pack_discovery_views(sender(), records(3), 8 * 1024).unwrap();

        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].part, 0);
        assert_eq!(parts[0].parts, 1);
        assert_eq!(parts[0].items.len(), 3);
    }

    #[test]
    fn large_view_splits_under_mtu() {
        let items = records(100);
        let mtu = 1024;
        let parts = pack_discovery_views(sender(), items.clone(), mtu).unwrap();

        assert!(parts.len() > 1);
        let total: usize = parts.iter().map(|p| p.items.len()).sum();
        assert_eq!(total, items.len());

        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.part, i as u32);
            assert_eq!(part.parts, parts.len() as u32);
            let size = bincode::serialized_size(part).unwrap() as usize;
            assert!(size <= mtu, "part {} is {} bytes", i, size);
        }
    }

    #[test]
    fn oversized_single_item_is_an_error() {
        let huge = vec![AliveRecord {
            name: "x".repeat(4096),
            endpoint: "10.0.0.1:7000".into(),
            version: NodeVersion::new(1, 0),
        }];

        assert!(pack_discovery_views(sender(), huge, 256).is_err());
    }

    #[test]
    fn empty_view_still_produces_one_part() {
        let parts = pack_discovery_views(sender(), Vec::new(), 1024).unwrap();

        assert_eq!(parts.len(), 1);
        assert!(parts[0].items.is_empty());
        assert_eq!(parts[0].parts, 1);
    }

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        type Error = std::io::Error;

        async fn send_to_neighbor(
            &mut self,
            _dst: Endpoint,
            _msg: Message,
        ) -> std::result::Result<(), Self::Error> {
            Ok(())
        }

        async fn send_to_all(&mut self, _msg: Message) -> (usize, usize) {
            (0, 0)
        }
    }

    struct Fixture {
        manager: MembershipManager<NullTransport>,
        _commands: mpsc::Sender<Command>,
        _events: broadcast::Receiver<Event>,
    }

    fn fixture(cfg: Config) -> Fixture {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = broadcast::channel(64);
        let manager = MembershipManager::new(cfg, NullTransport, cmd_rx, event_tx);

        Fixture {
            manager,
            _commands: cmd_tx,
            _events: event_rx,
        }
    }

    fn base_config() -> Config {
        let mut cfg = Config::new("me", "127.0.0.1:7000");
        cfg.incarnation = 10;
        cfg.seed = Some(42);
        cfg
    }

    #[test]
    fn discovery_bias_targets_undiscovered_successor() {
        let mut cfg = base_config();
        cfg.full_view_bootstrap = true;
        cfg.bootstrap = ["b", "c", "d"]
            .iter()
            .map(|n| BootstrapEntry::named(*n, format!("sim://{}", n)))
            .collect();
        let mut f = fixture(cfg);

        // Candidates sit on no ring yet; order them by the virtual ids
        // their names will occupy.
        let ring = f.manager.view.ring();
        let my_vid = ring.virtual_id("me");
        let vids: Vec<(String, u64)> = ["b", "c", "d"]
            .iter()
            .map(|n| (n.to_string(), ring.virtual_id(n)))
            .collect();
        let expected = vids
            .iter()
            .filter(|(_, v)| *v > my_vid)
            .min_by_key(|(_, v)| *v)
            .or_else(|| vids.iter().min_by_key(|(_, v)| *v))
            .map(|(n, _)| n.clone())
            .unwrap();

        let succ = f.manager.bootstrap_ring_successor().unwrap();
        assert_eq!(f.manager.cache.name(succ), expected);

        // A discovered candidate stops being the bias target.
        f.manager
            .merge_alive(&expected, "sim://x", NodeVersion::new(1, 0));
        let next = f.manager.bootstrap_ring_successor().unwrap();
        assert_ne!(f.manager.cache.name(next), expected);

        for n in &["b", "c", "d"] {
            f.manager.merge_alive(n, "", NodeVersion::new(1, 0));
        }
        assert_eq!(f.manager.bootstrap_ring_successor(), None);
    }

    #[test]
    fn history_version_blocks_readmission() {
        let mut f = fixture(base_config());
        let departed = NodeVersion::new(5, 3);
        f.manager.merge_alive("peer", "10.0.0.2:7000", departed);
        let id = f.manager.cache.get("peer").unwrap();
        assert!(f.manager.view.contains(id));

        f.manager
            .merge_departed("peer", departed, NodeStatus::Leave, false);
        assert!(!f.manager.view.contains(id));
        assert_eq!(f.manager.history.version_of(id), Some(departed));

        // Alive claims at or below the departure version keep losing.
        f.manager.merge_alive("peer", "10.0.0.2:7000", departed);
        f.manager
            .merge_alive("peer", "10.0.0.2:7000", NodeVersion::new(5, 2));
        assert!(!f.manager.view.contains(id));

        // A strictly newer claim readmits the node.
        f.manager
            .merge_alive("peer", "10.0.0.2:7000", NodeVersion::new(5, 4));
        assert!(f.manager.view.contains(id));
    }

    #[test]
    fn suspicion_accumulates_to_threshold() {
        let mut f = fixture(base_config());
        let v = NodeVersion::new(1, 0);
        for n in &["p1", "p2", "p3", "p4"] {
            f.manager.merge_alive(n, "", v);
        }
        let suspect = f.manager.cache.get("p1").unwrap();
        let first = f.manager.cache.get("p2").unwrap();
        let second = f.manager.cache.get("p3").unwrap();

        // Threshold is 2 and the view is large enough that the single-
        // reporter override stays out of the way.
        f.manager.process_suspicion(suspect, first, v);
        assert_eq!(
            f.manager.view.get(suspect).unwrap().status,
            NodeStatus::Suspect
        );

        // The same reporter again is not new evidence.
        f.manager.process_suspicion(suspect, first, v);
        assert!(f.manager.view.contains(suspect));

        f.manager.process_suspicion(suspect, second, v);
        assert!(!f.manager.view.contains(suspect));
        assert!(f.manager.history.contains(suspect));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "suspicion report against self")]
    fn self_suspicion_report_is_rejected() {
        let mut f = fixture(base_config());
        f.manager.report_suspect_local("me");
    }

    #[tokio::test]
    async fn gossip_round_after_close_does_not_self_insert() {
        let mut f = fixture(base_config());
        f.manager.closed = true;

        f.manager.on_gossip_round().await;

        assert!(!f.manager.started);
        assert!(f.manager.view.is_empty());
    }
}
