use std::sync::Arc;
use bytes::Bytes;
use parking_lot::Mutex;

/// Something to be disseminated a bounded number of times.
///
/// The queue owns a broadcast from [`BroadcastQueue::enqueue`] until it is
/// retired, either because its transmit budget is spent or because a newer
/// broadcast invalidated it. [`Broadcast::finished`] runs exactly once, at
/// retirement.
pub trait Broadcast: Send + Sync {
    /// Bytes placed on the wire.
    fn message(&self) -> &[u8];

    /// Whether enqueueing `self` makes `other` obsolete.
    fn invalidates(&self, other: &dyn Broadcast) -> bool;

    /// Optional logical key, useful for keyed invalidation.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Called once when the queue drops the broadcast.
    fn finished(&self) {}
}

/// Represents a broadcast in the queue with its transmit bookkeeping
struct QueuedBroadcast {
    broadcast: Box<dyn Broadcast>,
    transmits: u32,
    id: u64,
}

#[derive(Default)]
struct QueueState {
    items: Vec<QueuedBroadcast>,
    next_id: u64,
}

/// Number of times a broadcast is sent in a cluster of `num_nodes`:
/// `max(1, ceil(mult * log10(num_nodes + 1)))`.
pub fn retransmit_limit(retransmit_mult: u32, num_nodes: usize) -> u32 {
    let scale = ((num_nodes as f64) + 1.0).log10();
    let limit = (retransmit_mult as f64 * scale).ceil() as u32;
    limit.max(1)
}

/// Transmit-limited queue of broadcasts.
///
/// Draining prefers the broadcasts sent the fewest times, newest first among
/// equals, so fresh information overtakes old gossip. The transmit budget is
/// derived from the current cluster size, read through `num_nodes` every
/// time the queue is drained.
pub struct BroadcastQueue {
    state: Mutex<QueueState>,
    retransmit_mult: u32,
    num_nodes: Arc<dyn Fn() -> usize + Send + Sync>,
}

impl BroadcastQueue {
    pub fn new(retransmit_mult: u32, num_nodes: impl Fn() -> usize + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            retransmit_mult,
            num_nodes: Arc::new(num_nodes),
        }
    }

    /// Adds a broadcast, first retiring every queued broadcast it invalidates.
    pub fn enqueue(&self, broadcast: Box<dyn Broadcast>) {
        let retired = {
            let mut state = self.state.lock();
            let (retired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.items)
                .into_iter()
                .partition(|queued| broadcast.invalidates(queued.broadcast.as_ref()));
            state.items = kept;

            let id = state.next_id;
            state.next_id += 1;
            state.items.push(QueuedBroadcast { broadcast, transmits: 0, id });
            retired
        };

        Self::retire(retired);
    }

    /// Selects broadcasts whose `overhead + len` fit in `limit` bytes.
    ///
    /// # Arguments
    ///
    /// * `overhead` - Bytes the caller spends framing each selected message.
    /// * `limit` - Total bytes available, framing included.
    pub fn drain(&self, overhead: usize, limit: usize) -> Vec<Bytes> {
        self.drain_at_most(usize::MAX, overhead, limit)
    }

    /// Like [`BroadcastQueue::drain`], selecting at most `max_items` broadcasts.
    pub fn drain_at_most(&self, max_items: usize, overhead: usize, limit: usize) -> Vec<Bytes> {
        let transmit_limit = retransmit_limit(self.retransmit_mult, (self.num_nodes)());
        let mut selected = Vec::new();

        let retired = {
            let mut state = self.state.lock();
            if state.items.is_empty() {
                return selected;
            }

            // fewest transmits first, newest first among equals
            state.items.sort_by(|a, b| a.transmits.cmp(&b.transmits).then(b.id.cmp(&a.id)));

            let mut used = 0;
            for queued in state.items.iter_mut() {
                if selected.len() >= max_items || limit.saturating_sub(used) <= overhead {
                    break;
                }
                // the budget may have shrunk with the cluster
                if queued.transmits >= transmit_limit {
                    continue;
                }
                let cost = overhead + queued.broadcast.message().len();
                if used + cost > limit {
                    continue;
                }
                used += cost;
                queued.transmits += 1;
                selected.push(Bytes::copy_from_slice(queued.broadcast.message()));
            }

            let (retired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.items)
                .into_iter()
                .partition(|queued| queued.transmits >= transmit_limit);
            state.items = kept;
            retired
        };

        Self::retire(retired);
        selected
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Retires every queued broadcast.
    pub fn reset(&self) {
        let retired = std::mem::take(&mut self.state.lock().items);
        Self::retire(retired);
    }

    /// Retires the oldest broadcasts until at most `max_retained` remain.
    pub fn prune(&self, max_retained: usize) {
        let retired = {
            let mut state = self.state.lock();
            if state.items.len() <= max_retained {
                return;
            }
            state.items.sort_by_key(|queued| queued.id);
            let excess = state.items.len() - max_retained;
            state.items.drain(..excess).collect::<Vec<_>>()
        };
        Self::retire(retired);
    }

    // `finished` runs outside the lock, a callback may enqueue again.
    fn retire(retired: Vec<QueuedBroadcast>) {
        for queued in retired {
            queued.broadcast.finished();
        }
    }
}

impl std::fmt::Debug for BroadcastQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastQueue")
            .field("len", &self.len())
            .field("retransmit_mult", &self.retransmit_mult)
            .finish()
    }
}
