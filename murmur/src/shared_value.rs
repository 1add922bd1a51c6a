//! A single string value shared by every member of the cluster.
//!
//! Each `set_value` turns into a value message disseminated through the
//! application broadcast queue. Receivers store it and relay it once, so a
//! write reaches the whole cluster in O(log N) gossip rounds. There is no
//! ordering between writers: every node keeps the last value it delivered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broadcast_queue::{Broadcast, BroadcastQueue};
use crate::delegate::Delegate;
use crate::protocol_metrics::METRICS;

const VALUE_BROADCAST_NAME: &str = "value";

/// How a newly queued value treats values still waiting to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationPolicy {
    /// Every value is disseminated with its full budget.
    #[default]
    Never,
    /// A new value retires pending ones, so only the latest spreads.
    SupersedePending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ValueMessage {
    pub origin: String,
    pub seq: u64,
    pub value: String,
}

struct ValueBroadcast {
    payload: Vec<u8>,
    policy: InvalidationPolicy,
}

impl Broadcast for ValueBroadcast {
    fn message(&self) -> &[u8] {
        &self.payload
    }

    fn invalidates(&self, other: &dyn Broadcast) -> bool {
        self.policy == InvalidationPolicy::SupersedePending && other.name() == Some(VALUE_BROADCAST_NAME)
    }

    fn name(&self) -> Option<&str> {
        Some(VALUE_BROADCAST_NAME)
    }
}

type MemberCount = Box<dyn Fn() -> usize + Send + Sync>;

/// [`Delegate`] holding the shared value.
pub struct SharedValueDelegate {
    origin: String,
    value: RwLock<Option<ValueMessage>>,
    broadcasts: BroadcastQueue,
    next_seq: AtomicU64,
    // highest sequence delivered per origin
    seen: DashMap<String, u64>,
    member_count: Arc<RwLock<Option<MemberCount>>>,
    relay: bool,
    policy: InvalidationPolicy,
}

impl SharedValueDelegate {
    /// Creates the store for the node named `origin`. Until
    /// [`SharedValueDelegate::bind_member_count`] is called, the broadcast
    /// budget assumes a single node.
    pub fn new(origin: impl Into<String>, retransmit_mult: u32) -> Self {
        let member_count: Arc<RwLock<Option<MemberCount>>> = Arc::new(RwLock::new(None));
        let source = member_count.clone();
        let broadcasts = BroadcastQueue::new(retransmit_mult, move || {
            source.read().as_ref().map_or(1, |count| count())
        });

        // Sequences start at the wall clock so a restarted node is not
        // mistaken for a replay of its previous life.
        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            origin: origin.into(),
            value: RwLock::new(None),
            broadcasts,
            next_seq: AtomicU64::new(start),
            seen: DashMap::new(),
            member_count,
            relay: true,
            policy: InvalidationPolicy::default(),
        }
    }

    pub fn with_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_invalidation_policy(mut self, policy: InvalidationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the cluster size source used for the retransmit budget,
    /// typically [`Murmur::member_counter`](crate::Murmur::member_counter).
    pub fn bind_member_count(&self, count: impl Fn() -> usize + Send + Sync + 'static) {
        *self.member_count.write() = Some(Box::new(count));
    }

    /// Stores `value` locally and queues it for dissemination.
    pub fn set_value(&self, value: impl Into<String>) {
        let msg = ValueMessage {
            origin: self.origin.clone(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst) + 1,
            value: value.into(),
        };
        info!("setting value to {}", msg.value);

        self.observe(&msg);
        self.deliver(msg.clone());
        self.enqueue(&msg);
    }

    /// Last delivered value, empty if none was ever delivered.
    pub fn get_value(&self) -> String {
        self.value
            .read()
            .as_ref()
            .map(|msg| msg.value.clone())
            .unwrap_or_default()
    }

    /// Value messages waiting in the broadcast queue.
    pub fn pending_broadcasts(&self) -> usize {
        self.broadcasts.len()
    }

    // Records `msg` as seen; false when it is not newer than what this
    // origin already delivered.
    fn observe(&self, msg: &ValueMessage) -> bool {
        match self.seen.entry(msg.origin.clone()) {
            Entry::Occupied(entry) if *entry.get() >= msg.seq => false,
            Entry::Occupied(mut entry) => {
                entry.insert(msg.seq);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(msg.seq);
                true
            }
        }
    }

    fn deliver(&self, msg: ValueMessage) {
        METRICS.value_deliveries.increment(1);
        *self.value.write() = Some(msg);
    }

    fn enqueue(&self, msg: &ValueMessage) {
        match bincode::serialize(msg) {
            Ok(payload) => self.broadcasts.enqueue(Box::new(ValueBroadcast {
                payload,
                policy: self.policy,
            })),
            Err(e) => warn!("failed to encode value message: {}", e),
        }
    }

    fn decode(&self, buf: &[u8]) -> Option<ValueMessage> {
        match bincode::deserialize::<ValueMessage>(buf) {
            Ok(msg) => Some(msg),
            Err(e) => {
                METRICS.malformed_messages.increment(1);
                warn!("dropping malformed value message ({} bytes): {}", buf.len(), e);
                None
            }
        }
    }
}

impl Delegate for SharedValueDelegate {
    fn notify_msg(&self, msg: &[u8]) {
        let Some(msg) = self.decode(msg) else {
            return;
        };
        if !self.observe(&msg) {
            debug!("ignoring already delivered value {}#{}", msg.origin, msg.seq);
            return;
        }

        info!("GOT MESSAGE: {}", msg.value);
        if self.relay {
            self.enqueue(&msg);
        }
        self.deliver(msg);
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Bytes> {
        self.broadcasts.drain(overhead, limit)
    }

    /// The last delivered message, so a joining node starts with the
    /// cluster's current value.
    fn local_state(&self, _join: bool) -> Bytes {
        let current = self.value.read().clone();
        match current {
            Some(msg) => bincode::serialize(&msg).map(Bytes::from).unwrap_or_default(),
            None => Bytes::new(),
        }
    }

    /// Adopts the remote value only while joining and only if nothing was
    /// delivered locally yet.
    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if !join || buf.is_empty() || self.value.read().is_some() {
            return;
        }
        if let Some(msg) = self.decode(buf) {
            if self.observe(&msg) {
                debug!("adopting value {}#{} from remote state", msg.origin, msg.seq);
                self.deliver(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(origin: &str, seq: u64, value: &str) -> Vec<u8> {
        bincode::serialize(&ValueMessage {
            origin: origin.to_string(),
            seq,
            value: value.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_get_value_is_empty_before_any_delivery() {
        let store = SharedValueDelegate::new("a", 4);
        assert_eq!(store.get_value(), "");
    }

    #[test]
    fn test_set_value_delivers_locally_and_queues() {
        let store = SharedValueDelegate::new("a", 4);
        store.set_value("hello");
        assert_eq!(store.get_value(), "hello");
        assert_eq!(store.pending_broadcasts(), 1);

        let drained = store.get_broadcasts(0, 1400);
        let msg: ValueMessage = bincode::deserialize(&drained[0]).unwrap();
        assert_eq!((msg.origin.as_str(), msg.value.as_str()), ("a", "hello"));
    }

    #[test]
    fn test_notify_msg_stores_and_relays_once() {
        let store = SharedValueDelegate::new("b", 4);
        store.notify_msg(&encoded("a", 7, "x"));
        assert_eq!(store.get_value(), "x");
        assert_eq!(store.pending_broadcasts(), 1);

        // duplicate and older messages are neither stored nor relayed
        store.notify_msg(&encoded("a", 7, "x"));
        store.notify_msg(&encoded("a", 6, "older"));
        assert_eq!(store.get_value(), "x");
        assert_eq!(store.pending_broadcasts(), 1);

        // another origin is independent: last delivered wins
        store.notify_msg(&encoded("c", 1, "y"));
        assert_eq!(store.get_value(), "y");
    }

    #[test]
    fn test_relay_can_be_disabled() {
        let store = SharedValueDelegate::new("b", 4).with_relay(false);
        store.notify_msg(&encoded("a", 1, "x"));
        assert_eq!(store.get_value(), "x");
        assert_eq!(store.pending_broadcasts(), 0);
    }

    #[test]
    fn test_malformed_message_is_dropped() {
        let store = SharedValueDelegate::new("b", 4);
        store.notify_msg(b"\xff\xff\xff");
        assert_eq!(store.get_value(), "");
        assert_eq!(store.pending_broadcasts(), 0);
    }

    #[test]
    fn test_invalidation_policies() {
        let keep_all = SharedValueDelegate::new("a", 4);
        keep_all.set_value("1");
        keep_all.set_value("2");
        assert_eq!(keep_all.pending_broadcasts(), 2);

        let latest_only = SharedValueDelegate::new("a", 4).with_invalidation_policy(InvalidationPolicy::SupersedePending);
        latest_only.set_value("1");
        latest_only.set_value("2");
        assert_eq!(latest_only.pending_broadcasts(), 1);
    }

    #[test]
    fn test_budget_follows_bound_member_count() {
        let store = SharedValueDelegate::new("a", 4);
        store.bind_member_count(|| 9); // ceil(4 * log10(10)) = 4
        store.set_value("v");

        let mut sent = 0;
        while store.pending_broadcasts() > 0 {
            sent += store.get_broadcasts(0, 1400).len();
        }
        assert_eq!(sent, 4);
    }

    #[test]
    fn test_joining_node_adopts_remote_value() {
        let seed = SharedValueDelegate::new("seed", 4);
        seed.set_value("current");

        let joiner = SharedValueDelegate::new("joiner", 4);
        let state = seed.local_state(true);
        joiner.merge_remote_state(&state, false);
        assert_eq!(joiner.get_value(), "");
        joiner.merge_remote_state(&state, true);
        assert_eq!(joiner.get_value(), "current");

        // a node with its own value keeps it
        let busy = SharedValueDelegate::new("busy", 4);
        busy.set_value("mine");
        busy.merge_remote_state(&state, true);
        assert_eq!(busy.get_value(), "mine");
    }
}
