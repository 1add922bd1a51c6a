use std::net::SocketAddr;

use anyhow::Result;
use futures::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::broadcast_queue::Broadcast;
use crate::codec::MessageCodec;
use crate::config::MAX_UDP_PACKET_SIZE;
use crate::error::MurmurError;
use crate::message::{MembershipUpdate, Message, MessagePayload, Piggyback, PushPullPayload};
use crate::node::Node;
use crate::protocol_metrics::METRICS;
use crate::state::NodeState;
use crate::transport::{BoxedStream, Datagram};
use crate::Murmur;

/// Framing cost of one piggybacked item: its bincode length prefix.
const PIGGYBACK_ITEM_OVERHEAD: usize = 8;

/// A queued membership update. A newer update about the same node retires
/// the older one.
struct MembershipBroadcast {
    name: String,
    payload: Vec<u8>,
    // fired once the update is retired from the queue
    notify: Mutex<Option<oneshot::Sender<()>>>,
}

impl Broadcast for MembershipBroadcast {
    fn message(&self) -> &[u8] {
        &self.payload
    }

    fn invalidates(&self, other: &dyn Broadcast) -> bool {
        other.name() == Some(self.name.as_str())
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn finished(&self) {
        if let Some(notify) = self.notify.lock().take() {
            let _ = notify.send(());
        }
    }
}

impl Murmur {
    pub(crate) fn enqueue_update(&self, update: &MembershipUpdate) {
        self.enqueue_update_notify(update, None);
    }

    /// Queues `update`; `notify` fires once it spent its transmit budget or
    /// was superseded.
    pub(crate) fn enqueue_update_notify(&self, update: &MembershipUpdate, notify: Option<oneshot::Sender<()>>) {
        match update.encode() {
            Ok(payload) => self.inner.broadcasts.enqueue(Box::new(MembershipBroadcast {
                name: update.name.clone(),
                payload,
                notify: Mutex::new(notify),
            })),
            Err(e) => warn!("failed to encode update about {}: {}", update.name, e),
        }
    }

    // Fills whatever room a packet of `base_len` bytes leaves: membership
    // updates first, then application broadcasts.
    fn build_piggyback(&self, base_len: usize) -> Piggyback {
        let mut remaining = MAX_UDP_PACKET_SIZE.saturating_sub(base_len);

        let updates = self.inner.broadcasts.drain_at_most(
            self.inner.config.max_piggyback_updates,
            PIGGYBACK_ITEM_OVERHEAD,
            remaining,
        );
        let used: usize = updates.iter().map(|update| update.len() + PIGGYBACK_ITEM_OVERHEAD).sum();
        remaining = remaining.saturating_sub(used);

        let broadcasts = self.inner.delegate.get_broadcasts(PIGGYBACK_ITEM_OVERHEAD, remaining);

        Piggyback {
            updates: updates.into_iter().map(|update| update.to_vec()).collect(),
            broadcasts: broadcasts.into_iter().map(|broadcast| broadcast.to_vec()).collect(),
        }
    }

    // Encodes `payload` with as much piggyback as fits in one datagram.
    fn packet(&self, payload: MessagePayload) -> Result<(Vec<u8>, bool)> {
        let message = Message::new(self.inner.name.clone(), self.inner.addr, payload);
        let base_len = message.to_bytes()?.len();
        let piggyback = self.build_piggyback(base_len);
        let empty = piggyback.is_empty();
        let bytes = message.with_piggyback(piggyback).to_bytes()?;
        Ok((bytes.to_vec(), empty))
    }

    pub(crate) async fn send_message(&self, target: SocketAddr, payload: MessagePayload) -> Result<()> {
        let (packet, _) = self.packet(payload)?;
        self.inner.transport.send_to(target, &packet).await
    }

    /// Decodes an inbound packet, applies what it carries and dispatches it.
    /// Undecodable packets are dropped.
    pub(crate) async fn handle_datagram(&self, datagram: Datagram) {
        if !self.is_running() {
            return;
        }
        let from = datagram.remote_addr;
        let message = match Message::from_slice(&datagram.data) {
            Ok(message) => message,
            Err(e) => {
                METRICS.malformed_messages.increment(1);
                warn!("{}", MurmurError::MalformedMessage { from: from.to_string(), reason: e.to_string() });
                return;
            }
        };

        let msg_type = message.msg_type();
        let Message { sender, payload, piggyback, .. } = message;
        self.handle_piggyback(&sender, piggyback).await;

        let result = match payload {
            MessagePayload::Ping(ping) => self.handle_ping(from, ping).await,
            MessagePayload::PingReq(request) => self.handle_ping_req(from, request).await,
            MessagePayload::Ack(ack) => {
                self.handle_ack(ack);
                Ok(())
            }
            MessagePayload::Gossip => Ok(()),
            MessagePayload::PushPull(_) => {
                warn!("ignoring push-pull datagram from {}, push-pull runs over streams", sender);
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!("failed to handle {} from {}: {}", msg_type, sender, e);
        }
    }

    async fn handle_piggyback(&self, sender: &str, piggyback: Piggyback) {
        for raw in piggyback.updates {
            match MembershipUpdate::decode(&raw) {
                Ok(update) => self.apply_update(update).await,
                Err(e) => {
                    METRICS.malformed_messages.increment(1);
                    warn!("{}", MurmurError::MalformedMessage { from: sender.to_string(), reason: e.to_string() });
                }
            }
        }
        for broadcast in piggyback.broadcasts {
            self.inner.delegate.notify_msg(&broadcast);
        }
    }

    /// Sends a GOSSIP packet to `gossip_nodes` random peers, dead ones
    /// included while they are young enough to refute. Stops as soon as
    /// there is nothing left to tell.
    pub(crate) async fn gossip(&self) -> Result<()> {
        let window = self.inner.config.dead_node_gossip_window();
        let targets = self.inner.members.random_nodes(self.inner.config.gossip_nodes, |node| {
            node.name != self.inner.name
                && (node.state().is_active() || node.is_within_dead_gossip_window(window))
        });

        for target in targets {
            let (packet, empty) = self.packet(MessagePayload::Gossip)?;
            if empty {
                break;
            }
            if let Err(e) = self.inner.transport.send_to(target.addr, &packet).await {
                debug!("failed to gossip to {}: {}", target.name, e);
                continue;
            }
            METRICS.gossip_packets.increment(1);
        }
        Ok(())
    }

    fn push_pull_message(&self, join: bool) -> Message {
        let payload = PushPullPayload {
            join,
            nodes: self.inner.members.snapshot().iter().map(Node::to_update).collect(),
            app_state: self.inner.delegate.local_state(join).to_vec(),
        };
        Message::new(self.inner.name.clone(), self.inner.addr, MessagePayload::PushPull(payload))
    }

    /// Exchanges the full state with `target` over a stream, bounded by
    /// the stream timeout.
    pub(crate) async fn push_pull(&self, target: SocketAddr, join: bool) -> Result<()> {
        let result = time::timeout(self.inner.config.stream_timeout(), self.exchange_state(target, join)).await;
        self.record_exchange(target, result)
    }

    /// Serves a push-pull initiated by `from`.
    pub(crate) async fn handle_stream(&self, stream: BoxedStream, from: SocketAddr) -> Result<()> {
        let result = time::timeout(self.inner.config.stream_timeout(), self.serve_state(stream, from)).await;
        self.record_exchange(from, result)
    }

    async fn exchange_state(&self, target: SocketAddr, join: bool) -> Result<()> {
        let stream = self.inner.transport.dial(target, self.inner.config.stream_timeout()).await?;
        let mut framed = Framed::new(stream, MessageCodec::new());
        framed.send(self.push_pull_message(join)).await?;

        let reply = framed.next().await
            .ok_or_else(|| MurmurError::Transport(format!("{} closed the stream without replying", target)))??;
        match reply.payload {
            MessagePayload::PushPull(remote) => {
                self.merge_remote_state(remote, join).await;
                Ok(())
            }
            other => Err(MurmurError::MalformedMessage {
                from: target.to_string(),
                reason: format!("expected a push-pull reply, got {}", other.msg_type()),
            }.into()),
        }
    }

    // Replies with the local state first, then merges the remote one.
    async fn serve_state(&self, stream: BoxedStream, from: SocketAddr) -> Result<()> {
        let mut framed = Framed::new(stream, MessageCodec::new());
        let request = framed.next().await
            .ok_or_else(|| MurmurError::Transport(format!("{} closed the stream before sending", from)))??;
        let remote = match request.payload {
            MessagePayload::PushPull(remote) => remote,
            other => {
                return Err(MurmurError::MalformedMessage {
                    from: from.to_string(),
                    reason: format!("expected a push-pull request, got {}", other.msg_type()),
                }.into())
            }
        };

        let join = remote.join;
        framed.send(self.push_pull_message(join)).await?;
        self.merge_remote_state(remote, join).await;
        Ok(())
    }

    fn record_exchange(&self, peer: SocketAddr, result: Result<Result<()>, time::error::Elapsed>) -> Result<()> {
        let result = result
            .unwrap_or_else(|_| Err(MurmurError::Transport(format!("push-pull with {} timed out", peer)).into()));
        match &result {
            Ok(()) => METRICS.push_pulls.increment(1),
            Err(_) => METRICS.push_pull_failures.increment(1),
        }
        result
    }

    // Remote Dead entries only count as suspicions: the local detector gets
    // to confirm them, and a live node gets to refute.
    async fn merge_remote_state(&self, remote: PushPullPayload, join: bool) {
        debug!("merging {} remote records (join: {})", remote.nodes.len(), join);
        for mut update in remote.nodes {
            if update.state == NodeState::Dead {
                update.state = NodeState::Suspect;
            }
            self.apply_update(update).await;
        }
        if !remote.app_state.is_empty() {
            self.inner.delegate.merge_remote_state(&remote.app_state, join);
        }
    }

    /// Push-pull with one random alive peer.
    pub(crate) async fn push_pull_tick(&self) -> Result<()> {
        let peer = self.inner.members
            .random_nodes(1, |node| node.is_alive() && node.name != self.inner.name)
            .into_iter()
            .next();
        match peer {
            Some(peer) => self.push_pull(peer.addr, false).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::config::MurmurConfigBuilder;
    use crate::delegate::{Delegate, NoopEventDelegate};
    use crate::memory_transport::MemoryNetwork;
    use super::*;

    // Delegate with a fixed set of pending broadcasts.
    struct Chatty {
        payload_len: usize,
    }

    impl Delegate for Chatty {
        fn notify_msg(&self, _msg: &[u8]) {}

        fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Bytes> {
            let mut out = Vec::new();
            if self.payload_len == 0 {
                return out;
            }
            let mut used = 0;
            while used + overhead + self.payload_len <= limit && out.len() < 100 {
                used += overhead + self.payload_len;
                out.push(Bytes::from(vec![7u8; self.payload_len]));
            }
            out
        }
    }

    fn murmur(network: &MemoryNetwork, name: &str, delegate: Arc<dyn Delegate>) -> Murmur {
        let config = MurmurConfigBuilder::new().with_name(name).build().unwrap();
        Murmur::new(config, delegate, Arc::new(NoopEventDelegate), Arc::new(network.bind())).unwrap()
    }

    fn update(name: &str, incarnation: u64) -> MembershipUpdate {
        MembershipUpdate {
            name: name.to_string(),
            addr: SocketAddr::from(([127, 0, 0, 1], 30_000)),
            incarnation,
            state: NodeState::Alive,
            meta: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_packets_stay_within_udp_limit() {
        let network = MemoryNetwork::new();
        let node = murmur(&network, "a", Arc::new(Chatty { payload_len: 90 }));
        for i in 0..40 {
            node.enqueue_update(&update(&format!("node-{}", i), 1));
        }

        let (packet, empty) = node.packet(MessagePayload::Gossip).unwrap();
        assert!(!empty);
        assert!(packet.len() <= MAX_UDP_PACKET_SIZE, "packet of {} bytes", packet.len());

        let message = Message::from_slice(&packet).unwrap();
        assert!(message.piggyback.updates.len() <= 8);
        assert!(!message.piggyback.broadcasts.is_empty());
    }

    #[tokio::test]
    async fn test_newer_update_replaces_queued_one() {
        let network = MemoryNetwork::new();
        let node = murmur(&network, "a", Arc::new(Chatty { payload_len: 0 }));
        node.enqueue_update(&update("b", 1));
        node.enqueue_update(&update("b", 2));
        assert_eq!(node.inner.broadcasts.len(), 1);

        let drained = node.inner.broadcasts.drain(0, MAX_UDP_PACKET_SIZE);
        assert_eq!(MembershipUpdate::decode(&drained[0]).unwrap().incarnation, 2);
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let network = MemoryNetwork::new();
        let node = murmur(&network, "a", Arc::new(Chatty { payload_len: 0 }));
        node.start().await.unwrap();

        node.handle_datagram(Datagram {
            remote_addr: SocketAddr::from(([127, 0, 0, 1], 1)),
            data: vec![0, 0, 0, 3, 9, 9, 9],
        }).await;
        assert_eq!(node.snapshot().len(), 1);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_push_pull_exchanges_membership() {
        let network = MemoryNetwork::new();
        let a = murmur(&network, "a", Arc::new(Chatty { payload_len: 0 }));
        let b = murmur(&network, "b", Arc::new(Chatty { payload_len: 0 }));
        a.start().await.unwrap();
        b.start().await.unwrap();
        b.apply_update(update("c", 5)).await;

        a.push_pull(b.local_addr(), true).await.unwrap();

        let names: Vec<String> = a.snapshot().into_iter().map(|node| node.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        // b merges after replying
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.inner.members.get("a").is_some());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_dead_merges_as_suspect() {
        let network = MemoryNetwork::new();
        let node = murmur(&network, "a", Arc::new(Chatty { payload_len: 0 }));
        node.start().await.unwrap();

        let dead = MembershipUpdate { state: NodeState::Dead, ..update("c", 3) };
        let remote = PushPullPayload { join: false, nodes: vec![dead], app_state: Vec::new() };
        node.merge_remote_state(remote, false).await;
        assert!(node.inner.members.get("c").unwrap().is_suspect());
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_leave_returns_once_departure_is_sent() {
        let network = MemoryNetwork::new();
        let a = murmur(&network, "a", Arc::new(Chatty { payload_len: 0 }));
        let b = murmur(&network, "b", Arc::new(Chatty { payload_len: 0 }));
        a.start().await.unwrap();
        b.start().await.unwrap();
        a.join(&[b.local_addr()]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), a.leave()).await.unwrap().unwrap();

        // the departure spent its budget, nothing about "a" is left queued
        let pending = a.inner.broadcasts.drain(0, usize::MAX);
        assert!(pending.iter().all(|raw| MembershipUpdate::decode(raw).unwrap().name != "a"));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !b.inner.members.get("a").is_some_and(|node| node.is_left()) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }).await.unwrap();

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lone_node_leaves_without_waiting() {
        let network = MemoryNetwork::new();
        let node = murmur(&network, "a", Arc::new(Chatty { payload_len: 0 }));
        node.start().await.unwrap();

        tokio::time::timeout(Duration::from_millis(100), node.leave()).await.unwrap().unwrap();
        assert!(node.local_node().unwrap().is_left());
        node.shutdown().await.unwrap();
    }
}
