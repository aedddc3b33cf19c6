//! Leader election on top of the membership view, piggybacked on the
//! attribute gossip. Candidates advertise themselves under a reserved
//! internal attribute; the leader is the lexicographically lowest candidate
//! currently claiming the role. Ties from concurrent claims resolve
//! deterministically: every claimant that is not the lowest backs off.

use crate::{
    config::Config,
    error::Result,
    event::{Event, MemberInfo},
    handle::Handle,
    membership::NodeStatus,
};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reserved attribute carrying election state. The internal-key prefix
/// keeps it out of application attribute listings by convention.
pub const ELECTION_KEY: &str = ".election";

const LEADING: &[u8] = b"true";
const NOT_LEADING: &[u8] = b"false";

/// Observer notified whenever the elected leader changes. Closures work
/// directly; anything stateful can implement the trait.
pub trait LeaderListener: Send + 'static {
    fn on_leader_changed(&mut self, leader: Option<&str>);
}

impl<F> LeaderListener for F
where
    F: FnMut(Option<&str>) + Send + 'static,
{
    fn on_leader_changed(&mut self, leader: Option<&str>) {
        (self)(leader)
    }
}

/// Election state distilled from membership events: which nodes are
/// candidates and which of them currently claim leadership.
#[derive(Debug, Default)]
pub(crate) struct ViewKeeper {
    candidates: BTreeMap<String, bool>,
}

impl ViewKeeper {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Updates one member's candidacy from its attribute snapshot. Returns
    /// whether anything changed.
    pub(crate) fn absorb(&mut self, member: &MemberInfo) -> bool {
        match member.attributes.get(ELECTION_KEY) {
            Some(value) => {
                let leading = value.as_ref() == LEADING;
                self.candidates.insert(member.name.clone(), leading) != Some(leading)
            }
            None => self.candidates.remove(&member.name).is_some(),
        }
    }

    pub(crate) fn remove(&mut self, name: &str) -> bool {
        self.candidates.remove(name).is_some()
    }

    /// Folds one membership event into the keeper. Returns whether the
    /// candidate set changed.
    pub(crate) fn observe(&mut self, event: &Event) -> bool {
        match event {
            Event::NodeJoin(member) => self.absorb(member),
            Event::NodeLeave(member) => self.remove(&member.name),
            Event::MetadataChange(members) => {
                let mut changed = false;
                for member in members {
                    changed |= self.absorb(member);
                }
                changed
            }
            Event::ViewChange(changes) => {
                let mut changed = false;
                for change in changes {
                    changed |= match change.status {
                        NodeStatus::Alive => self.absorb(&change.member),
                        NodeStatus::Suspect => false,
                        NodeStatus::Leave
                        | NodeStatus::Remove
                        | NodeStatus::SuspectDuplicateNode => self.remove(&change.member.name),
                    };
                }
                changed
            }
        }
    }

    /// The lowest-named candidate currently claiming leadership.
    pub(crate) fn current_leader(&self) -> Option<&str> {
        self.candidates
            .iter()
            .find(|(_, &leading)| leading)
            .map(|(name, _)| name.as_str())
    }

    /// What `me` should advertise next, if anything: `Some(true)` to claim
    /// a vacant leadership it is entitled to, `Some(false)` to back off a
    /// contested claim it is losing.
    pub(crate) fn arbitrate(&self, me: &str) -> Option<bool> {
        let leaders: Vec<&str> = self
            .candidates
            .iter()
            .filter(|(_, &leading)| leading)
            .map(|(name, _)| name.as_str())
            .collect();

        match leaders.as_slice() {
            [] => {
                let lowest = self.candidates.keys().next()?;
                if lowest == me {
                    Some(true)
                } else {
                    None
                }
            }
            [_single] => None,
            [lowest, ..] => {
                if *lowest != me && leaders.contains(&me) {
                    Some(false)
                } else {
                    None
                }
            }
        }
    }
}

/// Runs the election protocol for one node. Dropping the struct leaves the
/// task running; call [`close`](LeaderElection::close) to withdraw.
pub struct LeaderElection {
    task: JoinHandle<()>,
    handle: Handle,
    candidate: bool,
}

impl LeaderElection {
    /// Spawns the election observer. When the config marks this node a
    /// candidate it announces its candidacy immediately and may claim
    /// leadership after the warmup, once the view had time to converge.
    pub fn spawn<L: LeaderListener>(handle: Handle, cfg: &Config, listener: L) -> Self {
        let candidate = cfg.election_candidate;
        let task = tokio::spawn(run(
            handle.clone(),
            cfg.node_name.clone(),
            candidate,
            cfg.election_warmup,
            listener,
        ));

        Self {
            task,
            handle,
            candidate,
        }
    }

    /// Withdraws from the election and stops the observer task.
    pub async fn close(self) -> Result<()> {
        self.task.abort();
        if self.candidate {
            self.handle.remove_attribute(ELECTION_KEY).await?;
        }
        Ok(())
    }
}

async fn run<L: LeaderListener>(
    handle: Handle,
    me: String,
    candidate: bool,
    warmup: Duration,
    mut listener: L,
) {
    // Subscribe before seeding so no event falls between the two.
    let mut events = handle.subscribe();
    let mut keeper = ViewKeeper::new();

    if candidate {
        if let Err(e) = handle
            .set_attribute(ELECTION_KEY, Bytes::from_static(NOT_LEADING))
            .await
        {
            warn!(error = %e, "could not announce candidacy");
            return;
        }
    }

    match handle.members().await {
        Ok(members) => {
            for member in &members {
                keeper.absorb(member);
            }
        }
        Err(e) => {
            warn!(error = %e, "could not seed election view");
            return;
        }
    }

    let warmup_sleep = tokio::time::sleep(warmup);
    tokio::pin!(warmup_sleep);
    let mut warmed = false;
    let mut last_leader: Option<String> = None;

    loop {
        tokio::select! {
            _ = &mut warmup_sleep, if !warmed => {
                warmed = true;
            }
            event = events.recv() => match event {
                Some(event) => {
                    keeper.observe(&event);
                }
                None => return,
            },
        }

        if warmed && candidate {
            match keeper.arbitrate(&me) {
                Some(true) => {
                    info!(node = %me, "claiming leadership");
                    if handle
                        .set_attribute(ELECTION_KEY, Bytes::from_static(LEADING))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Some(false) => {
                    debug!(node = %me, "backing off contested leadership claim");
                    if handle
                        .set_attribute(ELECTION_KEY, Bytes::from_static(NOT_LEADING))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                None => {}
            }
        }

        let leader = keeper.current_leader().map(str::to_owned);
        if leader != last_leader {
            info!(leader = ?leader, "leader changed");
            listener.on_leader_changed(leader.as_deref());
            last_leader = leader;
        }
    }
}
