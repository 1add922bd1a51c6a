use std::time::Duration;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::time::Instant;

use crate::message::MembershipUpdate;
use crate::node::Node;
use crate::state::NodeState;

/*
 *
 * ===== Members =====
 *
 */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// First record for this name
    Added,
    /// The update superseded the local record
    Updated,
    /// Stale or duplicate update, nothing changed
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub action: MergeAction,
    pub old_state: Option<NodeState>,
    pub new_state: NodeState,
}

impl MergeResult {
    pub fn is_changed(&self) -> bool {
        self.action != MergeAction::Unchanged
    }

    /// The update changed the member's health state, not just its incarnation.
    pub fn state_changed(&self) -> bool {
        self.old_state != Some(self.new_state)
    }
}

/// Whether an update for `(incarnation, state)` wins over the local record:
/// higher incarnation, or equal incarnation with a more severe state.
pub(crate) fn supersedes(incarnation: u64, state: NodeState, local_incarnation: u64, local_state: NodeState) -> bool {
    incarnation > local_incarnation
        || (incarnation == local_incarnation && state.severity() > local_state.severity())
}

#[derive(Default)]
struct ProbeOrder {
    names: Vec<String>,
    index: usize,
}

/// Local view of the cluster, keyed by member name. The local node is a
/// member like any other.
#[derive(Default)]
pub struct Membership {
    nodes: DashMap<String, Node>,
    probe_order: Mutex<ProbeOrder>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `update` if it supersedes the local record for its name.
    /// Unknown names are inserted as they come, whatever their state.
    pub fn merge(&self, update: &MembershipUpdate) -> MergeResult {
        match self.nodes.entry(update.name.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(Node::from_update(update));
                MergeResult {
                    action: MergeAction::Added,
                    old_state: None,
                    new_state: update.state,
                }
            }
            Entry::Occupied(mut entry) => {
                let node = entry.get_mut();
                if !supersedes(update.incarnation, update.state, node.incarnation, node.state) {
                    return MergeResult {
                        action: MergeAction::Unchanged,
                        old_state: Some(node.state),
                        new_state: node.state,
                    };
                }

                let old_state = node.state;
                node.addr = update.addr;
                node.incarnation = update.incarnation;
                node.meta = Bytes::from(update.meta.clone());
                if node.state != update.state {
                    node.state = update.state;
                    node.state_changed = Instant::now();
                }

                MergeResult {
                    action: MergeAction::Updated,
                    old_state: Some(old_state),
                    new_state: update.state,
                }
            }
        }
    }

    /// Applies `update`, returning whether the registry changed.
    pub fn upsert(&self, update: &MembershipUpdate) -> bool {
        self.merge(update).is_changed()
    }

    /// Raises the incarnation of `name` above both `received` and its own,
    /// and marks it Alive. Returns the refuting record.
    pub(crate) fn refute(&self, name: &str, received: u64) -> Option<Node> {
        let mut node = self.nodes.get_mut(name)?;
        node.incarnation = received.max(node.incarnation) + 1;
        if node.state != NodeState::Alive {
            node.state = NodeState::Alive;
            node.state_changed = Instant::now();
        }
        Some(node.clone())
    }

    pub fn get(&self, name: &str) -> Option<Node> {
        self.nodes.get(name).map(|node| node.clone())
    }

    /// Point-in-time copy of every record, ordered by name.
    pub fn snapshot(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|entry| entry.value().clone()).collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    /// Number of Alive or Suspect members, the local node included.
    pub fn count(&self) -> usize {
        self.nodes.iter().filter(|entry| entry.state.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Next `k` Alive or Suspect members to probe, skipping `exclude`.
    ///
    /// Walks a shuffled list of names round-robin and reshuffles once the
    /// list is exhausted, so every member gets probed within a bounded
    /// number of rounds.
    pub fn next_probe_targets(&self, k: usize, exclude: &str) -> Vec<Node> {
        let mut order = self.probe_order.lock();
        let mut targets: Vec<Node> = Vec::with_capacity(k);
        let mut reshuffled = false;

        while targets.len() < k {
            if order.index >= order.names.len() {
                if reshuffled {
                    break;
                }
                let mut names: Vec<String> = self.nodes.iter().map(|entry| entry.key().clone()).collect();
                names.shuffle(&mut thread_rng());
                order.names = names;
                order.index = 0;
                reshuffled = true;
                if order.names.is_empty() {
                    break;
                }
            }

            let name = order.names[order.index].clone();
            order.index += 1;
            if name == exclude || targets.iter().any(|node| node.name == name) {
                continue;
            }
            if let Some(node) = self.nodes.get(&name) {
                if node.state.is_active() {
                    targets.push(node.clone());
                }
            }
        }

        targets
    }

    /// Up to `k` random members accepted by `filter`.
    pub fn random_nodes<F>(&self, k: usize, filter: F) -> Vec<Node>
    where
        F: Fn(&Node) -> bool,
    {
        let candidates: Vec<Node> = self.nodes
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        candidates
            .choose_multiple(&mut thread_rng(), k)
            .cloned()
            .collect()
    }

    /// Removes Dead and Left members older than `retention`.
    pub fn purge(&self, retention: Duration) -> Vec<Node> {
        let expired: Vec<String> = self.nodes
            .iter()
            .filter(|entry| entry.state.is_gone() && entry.since_state_change() >= retention)
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|name| {
                self.nodes
                    .remove_if(&name, |_, node| node.state.is_gone() && node.since_state_change() >= retention)
                    .map(|(_, node)| node)
            })
            .collect()
    }
}
