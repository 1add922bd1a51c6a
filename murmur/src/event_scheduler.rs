use std::collections::{BinaryHeap, HashMap};
use std::future::Future as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use pin_project::pin_project;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::time::{Instant, Sleep};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::cmp::Ordering as CmpOrdering;
use futures::stream::Stream;
use futures::task::AtomicWaker;
use crossbeam::queue::SegQueue;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub(crate) enum EventType {
    /// Deadline of a whole probe, indirect phase included
    Ack { seq: u64 },
    /// Deadline after which a suspect member is declared dead. Keyed by the
    /// incarnation it was suspected at, a refutation makes it irrelevant.
    SuspicionTimeout { node: String, incarnation: u64 },
}

// EVENT-LIFECYCLE
/// [`EventState`] Represents the current state of a scheduled event in the EventScheduler.
///
/// The lifecycle of an event typically progresses as follows:
/// 1. An event is initially created in the `Pending` state.
/// 2. If the event reaches its scheduled time, it transitions to the `ReachedDeadline` state.
/// 3. If the event is handled before its scheduled time, it moves to the `Intercepted` state.
/// 4. At any point before timing out or being intercepted, an event can be explicitly `Cancelled`.
///
/// Only the first transition out of `Pending` counts, and it is reported
/// once on the event channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EventState {
    /// The initial state of a newly scheduled event.
    Pending = 0,

    /// The event reached its deadline without being handled.
    ReachedDeadline = 1,

    /// The event was handled before its deadline (an ACK arrived, for instance).
    Intercepted = 2,

    /// The event became irrelevant before its deadline.
    Cancelled = 3,
}

#[derive(Debug)]
pub(crate) struct Event {
    id: u64,
    pub(crate) event_type: EventType,
    state: AtomicU8,
    sender: mpsc::Sender<EventState>,
}

impl Event {
    fn new(event_type: EventType, sender: mpsc::Sender<EventState>, id: u64) -> Self {
        Event {
            sender,
            event_type,
            state: AtomicU8::new(EventState::Pending as u8),
            id,
        }
    }

    pub(crate) fn get_state(&self) -> EventState {
        match self.state.load(Ordering::Acquire) {
            1 => EventState::ReachedDeadline,
            2 => EventState::Intercepted,
            3 => EventState::Cancelled,
            _ => EventState::Pending,
        }
    }

    // Moves a pending event to `new_state` and reports it; false if the
    // event already left `Pending`.
    fn transition(&self, new_state: EventState) -> bool {
        let moved = self.state.compare_exchange(
            EventState::Pending as u8,
            new_state as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ).is_ok();

        if moved {
            // capacity 1 and a single transition, this never finds the channel full
            let _ = self.sender.try_send(new_state);
        }
        moved
    }
}

#[derive(Debug)]
struct TimestampedEvent {
    deadline: Instant,
    event: Arc<Event>,
}

impl PartialEq for TimestampedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.event.id == other.event.id
    }
}

impl Eq for TimestampedEvent {}

impl PartialOrd for TimestampedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimestampedEvent {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // min-heap on deadline
        other.deadline.cmp(&self.deadline).then_with(|| other.event.id.cmp(&self.event.id))
    }
}

/// Deadline tracker. Events are scheduled from anywhere; an [`EventStream`]
/// yields those that reach their deadline while still pending.
pub(crate) struct EventScheduler {
    event_map: Mutex<HashMap<EventType, Arc<Event>>>,
    incoming_events: SegQueue<TimestampedEvent>,
    next_event_id: AtomicU64,
    waker: AtomicWaker,
}

impl EventScheduler {
    pub(crate) fn new() -> Self {
        EventScheduler {
            event_map: Mutex::new(HashMap::new()),
            incoming_events: SegQueue::new(),
            next_event_id: AtomicU64::new(0),
            waker: AtomicWaker::new(),
        }
    }

    /// Schedules a new event with a specified type and deadline.
    /// Returns a receiver reporting how the event ended.
    pub(crate) fn schedule_event(&self, event_type: EventType, deadline: Instant) -> Result<mpsc::Receiver<EventState>> {
        let (sender, receiver) = mpsc::channel(1);
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let event = Arc::new(Event::new(event_type.clone(), sender, id));

        {
            let mut event_map = self.event_map.lock();
            if event_map.contains_key(&event_type) {
                return Err(anyhow!("An event of type {:?} is already scheduled", event_type));
            }
            event_map.insert(event_type, event.clone());
        }

        self.incoming_events.push(TimestampedEvent { deadline, event });
        self.waker.wake();
        Ok(receiver)
    }

    /// Marks a pending event as handled before its deadline.
    pub(crate) fn intercept_event(&self, event_type: &EventType) -> bool {
        self.finish_early(event_type, EventState::Intercepted)
    }

    /// Drops a pending event that no longer matters.
    pub(crate) fn cancel_event(&self, event_type: &EventType) -> bool {
        self.finish_early(event_type, EventState::Cancelled)
    }

    #[cfg(test)]
    pub(crate) fn is_scheduled(&self, event_type: &EventType) -> bool {
        self.event_map.lock().contains_key(event_type)
    }

    fn finish_early(&self, event_type: &EventType, state: EventState) -> bool {
        match self.event_map.lock().remove(event_type) {
            Some(event) => event.transition(state),
            None => false,
        }
    }

    // Remove the map entry, unless it was replaced by a newer event of the same type.
    fn remove_event(&self, event: &Event) {
        let mut event_map = self.event_map.lock();
        if event_map.get(&event.event_type).is_some_and(|current| current.id == event.id) {
            event_map.remove(&event.event_type);
        }
    }
}

#[pin_project]
pub(crate) struct EventStream {
    scheduler: Arc<EventScheduler>,
    lobby: BinaryHeap<TimestampedEvent>,
    #[pin]
    sleep: Sleep,
}

impl EventStream {
    pub(crate) fn new(scheduler: Arc<EventScheduler>) -> Self {
        EventStream {
            scheduler,
            lobby: BinaryHeap::new(),
            sleep: tokio::time::sleep_until(Instant::now()),
        }
    }
}

impl Stream for EventStream {
    type Item = Arc<Event>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        this.scheduler.waker.register(cx.waker());

        // Move newly scheduled events into the lobby (`BinaryHeap`).
        while let Some(event) = this.scheduler.incoming_events.pop() {
            this.lobby.push(event);
        }

        loop {
            let Some(next) = this.lobby.peek() else {
                return Poll::Pending;
            };

            // intercepted or cancelled, nothing left to do
            if next.event.get_state() != EventState::Pending {
                this.lobby.pop();
                continue;
            }

            let deadline = next.deadline;
            if deadline <= Instant::now() {
                let Some(TimestampedEvent { event, .. }) = this.lobby.pop() else {
                    continue;
                };
                if event.transition(EventState::ReachedDeadline) {
                    this.scheduler.remove_event(&event);
                    return Poll::Ready(Some(event));
                }
                continue;
            }

            if this.sleep.deadline() != deadline {
                this.sleep.as_mut().reset(deadline);
            }
            match this.sleep.as_mut().poll(cx) {
                Poll::Ready(()) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
