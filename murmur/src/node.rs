use std::net::SocketAddr;
use std::time::Duration;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::message::MembershipUpdate;
use crate::state::NodeState;

/// Local record of a cluster member.
#[derive(Clone, Debug)]
pub struct Node {
    /// Unique name of the member
    pub name: String,

    /// Address the member receives gossip on (datagrams and streams)
    pub addr: SocketAddr,

    /// Opaque metadata supplied by the member's delegate
    pub meta: Bytes,

    pub(crate) incarnation: u64,
    pub(crate) state: NodeState,

    // when `state` last changed, drives dead-node retention
    pub(crate) state_changed: Instant,
}

impl Node {
    pub fn new(name: impl Into<String>, addr: SocketAddr, incarnation: u64, state: NodeState, meta: Bytes) -> Self {
        Self {
            name: name.into(),
            addr,
            meta,
            incarnation,
            state,
            state_changed: Instant::now(),
        }
    }

    pub(crate) fn from_update(update: &MembershipUpdate) -> Self {
        Self::new(
            update.name.clone(),
            update.addr,
            update.incarnation,
            update.state,
            Bytes::from(update.meta.clone()),
        )
    }

    pub(crate) fn to_update(&self) -> MembershipUpdate {
        MembershipUpdate {
            name: self.name.clone(),
            addr: self.addr,
            incarnation: self.incarnation,
            state: self.state,
            meta: self.meta.to_vec(),
        }
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state == NodeState::Alive
    }

    pub fn is_suspect(&self) -> bool {
        self.state == NodeState::Suspect
    }

    pub fn is_dead(&self) -> bool {
        self.state == NodeState::Dead
    }

    pub fn is_left(&self) -> bool {
        self.state == NodeState::Left
    }

    /// Time elapsed since the last state transition.
    pub fn since_state_change(&self) -> Duration {
        self.state_changed.elapsed()
    }

    /// Whether a dead node is still young enough to be gossiped to, giving
    /// it a chance to hear about its own death and refute it.
    pub(crate) fn is_within_dead_gossip_window(&self, window: Duration) -> bool {
        self.is_dead() && self.since_state_change() <= window
    }
}

/// Operator-facing view of a member: just its name and address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
}

impl From<&Node> for Member {
    fn from(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            addr: node.addr,
        }
    }
}
