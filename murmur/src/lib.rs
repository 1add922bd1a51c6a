use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, Result};
use futures::StreamExt as _;
use murmur_runtime::RuntimeExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot};
use tokio::time;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::BackOff;
use crate::config::META_MAX_SIZE;
use crate::event_scheduler::{EventScheduler, EventState, EventStream, EventType};
use crate::protocol_metrics::METRICS;
use crate::runtime::{ActorId, MurmurCommand, MurmurRuntime};

pub use broadcast_queue::{retransmit_limit, Broadcast, BroadcastQueue};
pub use config::{MurmurConfig, MurmurConfigBuilder, NetworkType};
pub use delegate::{Delegate, EventDelegate, NoopEventDelegate};
pub use error::MurmurError;
pub use ip_addr::IpAddress;
pub use members::{MergeAction, MergeResult, Membership};
pub use memory_transport::{MemoryNetwork, MemoryTransport};
pub use message::MembershipUpdate;
pub use node::{Member, Node};
pub use shared_value::{InvalidationPolicy, SharedValueDelegate};
pub use state::NodeState;
pub use transport::{AsyncStream, BoxedStream, Datagram, NetTransport, Transport};

mod backoff;
mod broadcast_queue;
mod codec;
pub mod config;
mod delegate;
mod detector;
mod error;
mod event_scheduler;
mod gossip;
mod ip_addr;
mod members;
mod memory_transport;
mod message;
mod node;
mod protocol_metrics;
mod runtime;
mod shared_value;
mod state;
mod transport;

// SWIM membership for MURMUR

/// This crate implements the SWIM (Scalable Weakly-consistent Infection-style
/// Membership) protocol on top of tokio, plus a transmit-limited broadcast
/// queue applications use to spread their own messages over the same traffic.
///
/// * Murmur: the engine. It owns the local membership view, runs the failure
///   detector and the disseminator as actors of a `murmur-runtime` runtime,
///   and forwards application payloads to a [`Delegate`].
///
/// * Membership: local view of the cluster, changed through a single `merge`
///   entry point that applies the (incarnation, severity) ordering rule.
///
/// * Transport: unreliable datagrams for probes and gossip, reliable streams
///   for push-pull state exchange. [`NetTransport`] binds UDP and TCP on the
///   same port, [`MemoryNetwork`] simulates a network in process.
///
/// Protocol summary:
/// `PING` / `PING-REQ` / `ACK` detect failures. A probed node that answers
/// neither directly nor through `indirect_checks` intermediaries becomes
/// SUSPECT; if it does not refute within the suspicion timeout it is
/// declared DEAD. Every packet carries piggybacked membership updates and
/// application broadcasts, a periodic `GOSSIP` packet keeps them flowing when
/// there is nothing to probe, and a periodic push-pull over a stream repairs
/// whatever gossip missed.
///
/// Each node owns an incarnation number that only the node itself raises, to
/// refute suspicions about itself or to announce that it leaves.
pub struct Murmur {
    inner: Arc<InnerMurmur>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MurmurState {
    Idle,
    Running,
    Stopped,
}

pub(crate) struct InnerMurmur {
    /// Configuration settings for the node
    config: MurmurConfig,

    /// Name of the local node, unique in the cluster
    name: String,

    /// Address advertised to peers
    addr: SocketAddr,

    /// Map of all known members and their current state,
    /// the local node included
    members: Arc<Membership>,

    /// Membership updates waiting to be piggybacked
    broadcasts: BroadcastQueue,

    /// Communication layer for sending and receiving messages
    transport: Arc<dyn Transport>,

    /// Application hooks for payloads and state exchange
    delegate: Arc<dyn Delegate>,

    /// Notified of joins, departures and deaths
    event_delegate: Arc<dyn EventDelegate>,

    /// Deadlines of probes and suspicions
    event_scheduler: Arc<EventScheduler>,

    // runtime owning every periodic task
    runtime: Arc<MurmurRuntime>,

    state: RwLock<MurmurState>,

    /// Channel sender for stopping the listeners
    shutdown: broadcast::Sender<()>,

    listeners: Mutex<Vec<JoinHandle<()>>>,

    /// Monotonically increasing sequence number for probes
    sequence_number: AtomicU64,
}

impl Clone for Murmur {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

// Cluster size as seen by a weak handle on the registry, never below one.
fn live_count(members: &Weak<Membership>) -> usize {
    members.upgrade().map_or(1, |members| members.count().max(1))
}

impl Murmur {
    /// Creates a node listening on [`MurmurConfig::bind_addr`] with the
    /// default UDP/TCP transport.
    pub async fn create(
        config: MurmurConfig,
        delegate: Arc<dyn Delegate>,
        event_delegate: Arc<dyn EventDelegate>,
    ) -> Result<Self> {
        let transport = NetTransport::bind(config.bind_addr()).await?;
        Self::new(config, delegate, event_delegate, Arc::new(transport))
    }

    /// Creates a node on top of an already bound transport.
    pub fn new(
        config: MurmurConfig,
        delegate: Arc<dyn Delegate>,
        event_delegate: Arc<dyn EventDelegate>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let addr = match config.advertise_addr() {
            Some(addr) => addr,
            None => IpAddress::advertise_addr(transport.local_addr()?)?,
        };

        let members = Arc::new(Membership::new());
        let registry = Arc::downgrade(&members);
        let broadcasts = BroadcastQueue::new(config.retransmit_mult(), move || live_count(&registry));

        // an actor may be in the middle of a probe or a push-pull
        let runtime = MurmurRuntime::builder()
            .with_metrics_enabled(true)
            .with_shutdown_duration(config.probe_timeout() + config.stream_timeout())
            .build::<ActorId, MurmurCommand>();

        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            inner: Arc::new(InnerMurmur {
                name: config.name().to_string(),
                config,
                addr,
                members,
                broadcasts,
                transport,
                delegate,
                event_delegate,
                event_scheduler: Arc::new(EventScheduler::new()),
                runtime,
                state: RwLock::new(MurmurState::Idle),
                shutdown,
                listeners: Mutex::new(Vec::new()),
                sequence_number: AtomicU64::new(0),
            }),
        })
    }

    /// Brings the node up: registers it as Alive and starts listening,
    /// probing and gossiping. Returns once everything is running.
    #[instrument(skip(self), fields(name = %self.inner.name))]
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write();
            if *state != MurmurState::Idle {
                return Err(anyhow!("murmur node {} was already started", self.inner.name));
            }
            *state = MurmurState::Running;
        }

        self.set_local_node_liveness();

        self.launch_datagram_listener();
        self.launch_stream_listener();

        self.launch_prober().await?;
        self.launch_gossiper().await?;
        self.launch_push_pull().await?;
        self.launch_member_list().await?;
        self.launch_event_scheduler().await?;

        info!("> [MURMUR] Node {} started on {}", self.inner.name, self.inner.addr);
        Ok(())
    }

    /// Joins a cluster through `seeds`, exchanging full state with each of
    /// them. Returns how many seeds were synchronized. An empty list leaves
    /// the node alone in its own cluster; a list where no seed answers is a
    /// startup failure.
    #[instrument(skip(self), fields(name = %self.inner.name))]
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize> {
        self.ensure_running()?;
        if seeds.is_empty() {
            info!("> [MURMUR] No seed given, starting a new cluster");
            return Ok(0);
        }

        let mut synced = 0;
        let mut last_error = None;
        for seed in seeds {
            match self.push_pull(*seed, true).await {
                Ok(()) => {
                    debug!("synchronized with seed {}", seed);
                    synced += 1;
                }
                Err(e) => {
                    warn!("unable to join through {}: {}", seed, e);
                    last_error = Some(e);
                }
            }
        }

        if synced == 0 {
            let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
            return Err(MurmurError::Startup(format!(
                "none of the {} seeds could be reached: {}",
                seeds.len(),
                reason,
            )).into());
        }
        Ok(synced)
    }

    /// Announces that the node leaves the cluster and waits, at most
    /// `leave_timeout`, until the announcement used up its transmit budget.
    /// The node keeps running until [`Murmur::shutdown`].
    pub async fn leave(&self) -> Result<()> {
        self.ensure_running()?;
        let local = self.local_node()
            .ok_or_else(|| anyhow!("local node {} missing from membership", self.inner.name))?;
        if local.is_left() {
            return Ok(());
        }

        let update = MembershipUpdate {
            incarnation: local.incarnation() + 1,
            state: NodeState::Left,
            ..local.to_update()
        };
        self.inner.members.merge(&update);
        let (sent_tx, mut sent_rx) = oneshot::channel();
        self.enqueue_update_notify(&update, Some(sent_tx));
        info!("> [MURMUR] Leaving the cluster with incarnation {}", update.incarnation);

        if self.inner.members.count() == 0 {
            return Ok(());
        }

        // Keep gossiping until the departure spent its transmit budget, the
        // node is about to stop and the gossip tick may never come again.
        let deadline = time::Instant::now() + self.inner.config.leave_timeout();
        loop {
            self.gossip().await?;
            tokio::select! {
                _ = &mut sent_rx => return Ok(()),
                _ = time::sleep_until(deadline) => {
                    warn!("departure not fully disseminated after {:?}", self.inner.config.leave_timeout());
                    return Ok(());
                }
                _ = time::sleep(self.inner.config.gossip_interval()) => {}
            }
        }
    }

    /// Leaves the cluster, then stops every task and the transport. Once
    /// this returns no task of the node is left running.
    #[instrument(skip(self), fields(name = %self.inner.name))]
    pub async fn shutdown(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        if let Err(e) = self.leave().await {
            warn!("failed to announce departure: {}", e);
        }

        *self.inner.state.write() = MurmurState::Stopped;
        // Err only means every listener is already gone.
        let _ = self.inner.shutdown.send(());
        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        for listener in listeners {
            if let Err(e) = listener.await {
                error!("listener task failed: {}", e);
            }
        }

        self.inner.runtime.destroy().await?;
        self.inner.transport.shutdown().await?;

        info!("> [MURMUR] Gracefully shut down completed.");
        Ok(())
    }

    /// Alive and Suspect members, the local node included.
    pub fn members(&self) -> Vec<Member> {
        self.inner.members
            .snapshot()
            .iter()
            .filter(|node| node.state().is_active())
            .map(Member::from)
            .collect()
    }

    /// Every record of the local view, departed and dead nodes included.
    pub fn snapshot(&self) -> Vec<Node> {
        self.inner.members.snapshot()
    }

    pub fn local_node(&self) -> Option<Node> {
        self.inner.members.get(&self.inner.name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Address advertised to peers.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Number of Alive and Suspect members.
    pub fn num_members(&self) -> usize {
        self.inner.members.count()
    }

    /// Cluster size source for broadcast budgets, such as
    /// [`SharedValueDelegate::bind_member_count`]. It does not keep the node
    /// alive and reports 1 once the node is dropped.
    pub fn member_counter(&self) -> impl Fn() -> usize + Send + Sync + 'static {
        let registry = Arc::downgrade(&self.inner.members);
        move || live_count(&registry)
    }

    pub fn is_running(&self) -> bool {
        *self.inner.state.read() == MurmurState::Running
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(MurmurError::NotRunning.into())
        }
    }

    fn runtime(&self) -> Arc<MurmurRuntime> {
        self.inner.runtime.clone()
    }

    /// Generate the next sequence number for probes.
    pub(crate) fn next_sequence_number(&self) -> u64 {
        self.inner.sequence_number.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn set_local_node_liveness(&self) {
        let mut meta = self.inner.delegate.node_meta(META_MAX_SIZE);
        if meta.len() > META_MAX_SIZE {
            warn!("node metadata of {} bytes truncated to {}", meta.len(), META_MAX_SIZE);
            meta.truncate(META_MAX_SIZE);
        }

        let update = MembershipUpdate {
            name: self.inner.name.clone(),
            addr: self.inner.addr,
            incarnation: 0,
            state: NodeState::Alive,
            meta: meta.to_vec(),
        };
        let result = self.inner.members.merge(&update);
        debug!("local node {} registered ({:?})", self.inner.name, result.action);
        self.enqueue_update(&update);
        METRICS.active_members.set(self.inner.members.count() as f64);
    }

    fn launch_datagram_listener(&self) {
        let murmur = self.clone();
        let mut incoming = self.inner.transport.incoming();
        let mut shutdown_rx = self.inner.shutdown.subscribe();

        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    received = incoming.recv() => match received {
                        Ok(datagram) => {
                            // Handlers may wait for acks, never hold the listener on them.
                            let murmur = murmur.clone();
                            tokio::spawn(async move { murmur.handle_datagram(datagram).await });
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("datagram listener lagging, {} packets dropped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("datagram listener stopped");
        });
        self.inner.listeners.lock().push(listener);
    }

    fn launch_stream_listener(&self) {
        let murmur = self.clone();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        let backoff = BackOff::new();

        let listener = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = murmur.inner.transport.accept() => accepted,
                };

                match accepted {
                    Ok((stream, from)) => {
                        backoff.record_success();
                        let murmur = murmur.clone();
                        tokio::spawn(async move {
                            if let Err(e) = murmur.handle_stream(stream, from).await {
                                warn!("push-pull from {} failed: {}", from, e);
                            }
                        });
                    }
                    Err(e) => {
                        if !murmur.is_running() {
                            break;
                        }
                        let (failures, _) = backoff.record_failure();
                        error!("failed to accept stream: {} Consecutive failures: {}", e, failures);
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = tokio::time::sleep(backoff.calculate_delay()) => {},
                        }
                    }
                }
            }
            debug!("stream listener stopped");
        });
        self.inner.listeners.lock().push(listener);
    }

    /// Launches the prober.
    ///
    /// Failure Detection (Probing):
    /// 1. Pick the next node of a shuffled round-robin list.
    /// 2. Send a PING message to the node.
    /// 3. If it does not ACK in time, ask random peers to PING-REQ it.
    /// 4. If nobody got an ACK either, mark the node SUSPECT and disseminate it.
    /// 5. A SUSPECT node that does not refute in time is declared DEAD.
    ///
    /// The same tick purges members that stayed DEAD or LEFT past the retention window.
    async fn launch_prober(&self) -> Result<()> {
        let interval = self.inner.config.probe_interval();
        let murmur = self.clone();

        self.runtime().spawn_recurrent_actor(
            ActorId::ProbeActor,
            interval,
            move |_| {
                let murmur = murmur.clone();
                Box::pin(async move {
                    if !murmur.is_running() {
                        debug!("murmur is no longer running, skipping probe");
                        return;
                    }
                    if let Err(e) = murmur.probe().await {
                        error!("Probe error: {}", e);
                    }
                    for node in murmur.inner.members.purge(murmur.inner.config.dead_node_retention()) {
                        debug!("purged {} ({}) after {:?} in state {}", node.name, node.addr, node.since_state_change(), node.state());
                    }
                })
            },
        ).await
    }

    async fn launch_gossiper(&self) -> Result<()> {
        let interval = self.inner.config.gossip_interval();
        let murmur = self.clone();

        self.runtime().spawn_recurrent_actor(
            ActorId::GossipActor,
            interval,
            move |_| {
                let murmur = murmur.clone();
                Box::pin(async move {
                    if !murmur.is_running() {
                        return;
                    }
                    if let Err(e) = murmur.gossip().await {
                        error!("Gossip error: {}", e);
                    }
                })
            },
        ).await
    }

    async fn launch_push_pull(&self) -> Result<()> {
        let interval = self.inner.config.push_pull_interval();
        let murmur = self.clone();

        self.runtime().spawn_recurrent_actor(
            ActorId::PushPullActor,
            interval,
            move |_| {
                let murmur = murmur.clone();
                Box::pin(async move {
                    if !murmur.is_running() {
                        return;
                    }
                    if let Err(e) = murmur.push_pull_tick().await {
                        warn!("periodic push-pull failed: {}", e);
                    }
                })
            },
        ).await
    }

    /// Periodic listing of the members at `info` level, for operators.
    async fn launch_member_list(&self) -> Result<()> {
        let Some(interval) = self.inner.config.member_log_interval else {
            return Ok(());
        };
        let murmur = self.clone();

        self.runtime().spawn_recurrent_actor(
            ActorId::MemberListActor,
            interval,
            move |_| {
                let murmur = murmur.clone();
                Box::pin(async move {
                    for member in murmur.members() {
                        info!("Member: {} {}", member.name, member.addr);
                    }
                })
            },
        ).await
    }

    async fn launch_event_scheduler(&self) -> Result<()> {
        let murmur = self.clone();
        let deadlines = EventStream::new(self.inner.event_scheduler.clone())
            .map(MurmurCommand::EventScheduler);

        self.runtime().spawn_actor_on_stream(
            ActorId::EventSchedulerActor,
            deadlines,
            move |command| {
                let murmur = murmur.clone();
                Box::pin(async move {
                    let MurmurCommand::EventScheduler(event) = command;
                    if event.get_state() != EventState::ReachedDeadline {
                        return;
                    }
                    match &event.event_type {
                        // the prober waits on the event channel itself
                        EventType::Ack { seq } => debug!("Ack with sequence number {} timed out", seq),
                        EventType::SuspicionTimeout { node, incarnation } => {
                            murmur.confirm_dead(node, *incarnation).await;
                        }
                    }
                })
            },
        ).await
    }
}
