use std::sync::Arc;

use murmur_runtime::{ActorCommand, Runtime};

use crate::event_scheduler::Event;

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub(crate) enum ActorId {
    ProbeActor,
    GossipActor,
    PushPullActor,
    MemberListActor,
    EventSchedulerActor,
}

#[derive(Debug)]
pub(crate) enum MurmurCommand {
    /// An event of the scheduler reached its deadline
    EventScheduler(Arc<Event>),
}

impl ActorCommand for MurmurCommand {}

pub(crate) type MurmurRuntime = Runtime<ActorId, MurmurCommand>;
