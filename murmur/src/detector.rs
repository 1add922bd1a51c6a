//! Failure detection: probing, suspicion, refutation, and the single path
//! through which every membership update enters the local view.

use std::net::SocketAddr;

use anyhow::Result;
use futures::future::join_all;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::error::MurmurError;
use crate::event_scheduler::{EventState, EventType};
use crate::message::{AckPayload, MembershipUpdate, MessagePayload, PingPayload, PingReqPayload};
use crate::node::Node;
use crate::protocol_metrics::METRICS;
use crate::state::NodeState;
use crate::Murmur;

impl Murmur {
    /// One probe round over the next `probe_batch` members.
    pub(crate) async fn probe(&self) -> Result<()> {
        let batch = self.inner.config.probe_batch.max(1);
        let targets = self.inner.members.next_probe_targets(batch, &self.inner.name);
        if targets.is_empty() {
            debug!("no member to probe");
            return Ok(());
        }

        let probes = targets.into_iter().map(|target| async move {
            let result = self.probe_node(&target).await;
            (target, result)
        });

        for (target, result) in join_all(probes).await {
            match result {
                Ok(()) => debug!("probe of {} succeeded", target.name),
                Err(e) => match e.downcast_ref::<MurmurError>() {
                    Some(MurmurError::ProbeFailed { .. }) => {
                        debug!("{}", e);
                        self.suspect_node(&target).await;
                    }
                    _ => warn!("unable to probe {}: {}", target.name, e),
                },
            }
        }
        Ok(())
    }

    /// Probes `target` directly, then through `indirect_checks` random peers.
    /// Fails with [`MurmurError::ProbeFailed`] when no ack arrives before the
    /// probe deadline.
    async fn probe_node(&self, target: &Node) -> Result<()> {
        METRICS.probes.increment(1);
        let seq = self.next_sequence_number();
        let deadline = Instant::now() + self.inner.config.probe_timeout();
        let mut ack_rx = self.inner.event_scheduler.schedule_event(EventType::Ack { seq }, deadline)?;

        let ping = MessagePayload::Ping(PingPayload {
            seq,
            target: target.name.clone(),
        });
        if let Err(e) = self.send_message(target.addr, ping).await {
            debug!("failed to send PING to {}: {}", target.name, e);
        }

        match time::timeout(self.inner.config.ack_timeout(), ack_rx.recv()).await {
            Ok(Some(EventState::Intercepted)) => return Ok(()),
            Ok(state) => debug!("probe {} of {} ended early with {:?}", seq, target.name, state),
            Err(_) => debug!("no direct ACK from {}, trying indirect probes", target.name),
        }

        let intermediaries = self.inner.members.random_nodes(self.inner.config.indirect_checks, |node| {
            node.is_alive() && node.name != self.inner.name && node.name != target.name
        });
        if intermediaries.is_empty() {
            debug!("no peer available for an indirect probe of {}", target.name);
        }
        for peer in &intermediaries {
            let ping_req = MessagePayload::PingReq(PingReqPayload {
                seq,
                target: target.name.clone(),
                target_addr: target.addr,
            });
            if let Err(e) = self.send_message(peer.addr, ping_req).await {
                debug!("failed to send PING-REQ to {}: {}", peer.name, e);
            }
        }

        // bounded by the deadline even if the scheduler stream is gone
        if let Ok(Some(EventState::Intercepted)) = time::timeout_at(deadline, ack_rx.recv()).await {
            debug!("indirect ACK for {}", target.name);
            return Ok(());
        }

        METRICS.probe_failures.increment(1);
        Err(MurmurError::ProbeFailed {
            node: target.name.clone(),
            addr: target.addr,
        }.into())
    }

    /// Marks `node` Suspect at the incarnation it was probed with. A
    /// refutation that arrived in the meantime wins by incarnation.
    pub(crate) async fn suspect_node(&self, node: &Node) {
        let update = MembershipUpdate {
            state: NodeState::Suspect,
            ..node.to_update()
        };
        self.apply_update(update).await;
    }

    /// Declares a suspect dead once its suspicion timeout expired, unless it
    /// refuted or changed state in the meantime.
    pub(crate) async fn confirm_dead(&self, name: &str, incarnation: u64) {
        let Some(node) = self.inner.members.get(name) else {
            return;
        };
        if !node.is_suspect() || node.incarnation() != incarnation {
            debug!("suspicion of {} at incarnation {} is obsolete", name, incarnation);
            return;
        }

        METRICS.confirmed_deaths.increment(1);
        warn!("> [MURMUR] Node {} ({}) confirmed DEAD", node.name, node.addr);
        let update = MembershipUpdate {
            state: NodeState::Dead,
            ..node.to_update()
        };
        self.apply_update(update).await;
    }

    fn schedule_suspicion_timeout(&self, name: &str, incarnation: u64) {
        let timeout = self.inner.config.suspicious_timeout(self.inner.members.count());
        let event = EventType::SuspicionTimeout {
            node: name.to_string(),
            incarnation,
        };
        // The receiver is not needed: the event scheduler actor handles the deadline.
        match self.inner.event_scheduler.schedule_event(event, Instant::now() + timeout) {
            Ok(_) => debug!("{} will be declared dead in {:?} unless it refutes", name, timeout),
            Err(e) => debug!("suspicion of {} already pending: {}", name, e),
        }
    }

    /// Applies a membership update from any source: probes, piggybacked
    /// gossip or push-pull. Changes are queued for dissemination and
    /// reported to the event delegate; stale updates are dropped silently.
    pub(crate) async fn apply_update(&self, update: MembershipUpdate) {
        if update.name == self.inner.name {
            self.handle_update_about_self(&update);
            return;
        }

        let previous = self.inner.members.get(&update.name);
        let result = self.inner.members.merge(&update);
        if !result.is_changed() {
            return;
        }
        self.enqueue_update(&update);
        METRICS.active_members.set(self.inner.members.count() as f64);

        if let Some(previous) = previous.filter(|node| node.is_suspect()) {
            if previous.incarnation() != update.incarnation || result.new_state != NodeState::Suspect {
                let incarnation = previous.incarnation();
                self.inner.event_scheduler.cancel_event(&EventType::SuspicionTimeout {
                    node: previous.name,
                    incarnation,
                });
            }
        }

        // a suspicion at a new incarnation needs its own timeout
        if result.new_state == NodeState::Suspect {
            self.schedule_suspicion_timeout(&update.name, update.incarnation);
        }
        if !result.state_changed() {
            return;
        }
        debug!(
            "{} moved from {:?} to {} at incarnation {}",
            update.name, result.old_state, result.new_state, update.incarnation,
        );
        if result.new_state == NodeState::Suspect {
            METRICS.suspicions.increment(1);
            info!("> [MURMUR] Node {} ({}) is SUSPECT", update.name, update.addr);
        }

        let Some(node) = self.inner.members.get(&update.name) else {
            return;
        };
        let was_active = result.old_state.is_some_and(|state| state.is_active());
        let notified = match result.new_state {
            NodeState::Alive | NodeState::Suspect if !was_active => {
                info!("> [MURMUR] Node {} ({}) joined", node.name, node.addr);
                Some(self.inner.event_delegate.notify_join(&node).await)
            }
            NodeState::Dead if was_active => Some(self.inner.event_delegate.notify_dead(&node).await),
            NodeState::Left if was_active => {
                info!("> [MURMUR] Node {} ({}) left", node.name, node.addr);
                Some(self.inner.event_delegate.notify_leave(&node).await)
            }
            _ => None,
        };
        if let Some(Err(e)) = notified {
            warn!("event delegate failed on {} becoming {}: {}", node.name, node.state(), e);
        }
    }

    // Refutes anything claiming the local node is not alive at its current
    // incarnation. A node that left does not contest.
    fn handle_update_about_self(&self, update: &MembershipUpdate) {
        let Some(local) = self.local_node() else {
            return;
        };
        if local.is_left() {
            return;
        }

        let contested = match update.state {
            NodeState::Alive => update.incarnation > local.incarnation(),
            NodeState::Suspect | NodeState::Dead | NodeState::Left => update.incarnation >= local.incarnation(),
        };
        if !contested {
            return;
        }

        if let Some(refuted) = self.inner.members.refute(&self.inner.name, update.incarnation) {
            METRICS.refutations.increment(1);
            info!(
                "> [MURMUR] Refuting {} about ourselves with incarnation {}",
                update.state, refuted.incarnation(),
            );
            self.enqueue_update(&refuted.to_update());
        }
    }

    /// Answers a PING addressed to this node. A PING for another name comes
    /// from a peer that still maps this address to a previous node.
    pub(crate) async fn handle_ping(&self, from: SocketAddr, ping: PingPayload) -> Result<()> {
        if ping.target != self.inner.name {
            warn!("ignoring PING for {} from {}, this node is {}", ping.target, from, self.inner.name);
            return Ok(());
        }
        self.send_message(from, MessagePayload::Ack(AckPayload { seq: ping.seq })).await
    }

    /// Probes the target of a PING-REQ on behalf of `from` and relays the
    /// ACK, carrying the requester's sequence number, if one arrives in time.
    pub(crate) async fn handle_ping_req(&self, from: SocketAddr, request: PingReqPayload) -> Result<()> {
        let seq = self.next_sequence_number();
        let deadline = Instant::now() + self.inner.config.indirect_ack_timeout;
        let mut ack_rx = self.inner.event_scheduler.schedule_event(EventType::Ack { seq }, deadline)?;

        let ping = MessagePayload::Ping(PingPayload {
            seq,
            target: request.target.clone(),
        });
        self.send_message(request.target_addr, ping).await?;

        match time::timeout_at(deadline, ack_rx.recv()).await {
            Ok(Some(EventState::Intercepted)) => {
                debug!("{} answered the indirect probe of {}", request.target, from);
                self.send_message(from, MessagePayload::Ack(AckPayload { seq: request.seq })).await
            }
            _ => {
                debug!("no ACK from {} for the indirect probe of {}", request.target, from);
                Ok(())
            }
        }
    }

    pub(crate) fn handle_ack(&self, ack: AckPayload) {
        if !self.inner.event_scheduler.intercept_event(&EventType::Ack { seq: ack.seq }) {
            debug!("late or unknown ACK {}", ack.seq);
        }
    }
}
