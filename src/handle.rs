use crate::{
    common::Endpoint,
    error::{Error, Result},
    event::{Event, MemberInfo},
    membership::{ClearScope, Command, DiscoveryProbe},
    transport::Message,
};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Cheap, cloneable entry point to a running membership manager. All calls
/// are forwarded to the manager task; they fail with a closed error once
/// the manager has stopped.
#[derive(Debug, Clone)]
pub struct Handle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<Event>,
}

impl Handle {
    pub(crate) fn new(commands: mpsc::Sender<Command>, events: broadcast::Sender<Event>) -> Self {
        Self { commands, events }
    }

    /// Subscribes to membership and metadata events. Events published
    /// before the subscription are not replayed.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            inner: self.events.subscribe(),
        }
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| Error::new_closed())
    }

    async fn request<R>(&self, cmd: Command, rx: oneshot::Receiver<R>) -> Result<R> {
        self.send(cmd).await?;
        rx.await.map_err(|_| Error::new_closed())
    }

    /// Feeds a received wire message into the manager.
    pub async fn incoming(&self, msg: Message) -> Result<()> {
        self.send(Command::Incoming(msg)).await
    }

    /// Reports a freshly connected neighbor; the manager greets it with the
    /// current view and a full metadata digest.
    pub async fn new_neighbor(
        &self,
        name: impl Into<String>,
        endpoint: impl Into<Endpoint>,
    ) -> Result<()> {
        self.send(Command::NewNeighbor {
            name: name.into(),
            endpoint: endpoint.into(),
        })
        .await
    }

    /// Reports a lost neighbor connection. Starts a suspicion and redirects
    /// any anti-entropy requests outstanding against that peer.
    pub async fn disconnected_neighbor(&self, name: impl Into<String>) -> Result<()> {
        self.send(Command::DisconnectedNeighbor { name: name.into() })
            .await
    }

    /// Raises a local suspicion against a node believed unresponsive.
    pub async fn report_suspect(&self, name: impl Into<String>) -> Result<()> {
        self.send(Command::ReportSuspect { name: name.into() }).await
    }

    /// Reports that `name` is running a second, newer incarnation; the
    /// stale one is dropped from the view immediately.
    pub async fn report_duplicate_node(
        &self,
        name: impl Into<String>,
        incarnation: i64,
    ) -> Result<()> {
        self.send(Command::ReportDuplicateNode {
            name: name.into(),
            incarnation,
        })
        .await
    }

    /// Sets one of this node's attributes. Returns whether the key was new.
    pub async fn set_attribute(&self, key: impl Into<String>, value: Bytes) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::SetAttribute {
                key: key.into(),
                value,
                tx,
            },
            rx,
        )
        .await?
    }

    /// Removes one of this node's attributes. Returns whether the key was
    /// present.
    pub async fn remove_attribute(&self, key: impl Into<String>) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::RemoveAttribute { key: key.into(), tx }, rx)
            .await
    }

    pub async fn get_attribute(&self, key: impl Into<String>) -> Result<Option<Bytes>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::GetAttribute { key: key.into(), tx }, rx)
            .await
    }

    pub async fn contains_attribute(&self, key: impl Into<String>) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::ContainsAttribute { key: key.into(), tx }, rx)
            .await
    }

    pub async fn attribute_keys(&self) -> Result<BTreeSet<String>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::AttributeKeys { tx }, rx).await
    }

    /// Tombstones a slice of this node's attributes so the deletions
    /// propagate.
    pub async fn clear_attributes(&self, scope: ClearScope) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::ClearAttributes { scope, tx }, rx).await
    }

    /// Drops retained attribute tables of departed nodes, one node's or
    /// all of them.
    pub async fn clear_retained(&self, name: Option<String>) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::ClearRetained { name, tx }, rx).await
    }

    /// Snapshot of every member currently in the view, this node included.
    pub async fn members(&self) -> Result<Vec<MemberInfo>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Members { tx }, rx).await
    }

    /// Uniform random peer, for unstructured gossip.
    pub async fn random_node(&self) -> Result<Option<(String, Endpoint)>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::RandomNode { tx }, rx).await
    }

    /// Ring-distance-weighted peer, for structured gossip.
    pub async fn structured_node(&self) -> Result<Option<(String, Endpoint)>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::StructuredNode { tx }, rx).await
    }

    /// Next node worth probing for discovery, drawn from the bootstrap
    /// candidates and departed-node history.
    pub async fn discovery_node(&self) -> Result<Option<DiscoveryProbe>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::DiscoveryNode { tx }, rx).await
    }

    /// Shuts the manager down. A soft terminate announces the departure;
    /// with `remove_retained` it additionally waits (up to `timeout`) for a
    /// neighbor to acknowledge that the cluster dropped our attributes.
    /// Returns whether the removal was acknowledged; `Ok(false)` on
    /// timeout.
    pub async fn terminate(
        &self,
        soft: bool,
        remove_retained: bool,
        timeout: Duration,
    ) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Terminate {
            soft,
            remove_retained,
            tx,
        })
        .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(acked)) => Ok(acked),
            Ok(Err(_)) => Err(Error::new_closed()),
            Err(_) => Ok(false),
        }
    }
}

/// Stream of membership events. Wraps the broadcast receiver so slow
/// subscribers skip over lagged events instead of erroring out.
pub struct EventStream {
    inner: broadcast::Receiver<Event>,
}

impl EventStream {
    /// Next event, or `None` once the manager has stopped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.inner.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
