use async_trait::async_trait;
use bytes::Bytes;
use std::error::Error;

use crate::node::Node;

/// [`Delegate`] is the seam between the membership engine and the hosted
/// application.
///
/// Every method is called from the engine's own tasks, inline with packet
/// processing, so implementations must return quickly and never block.
pub trait Delegate: Send + Sync {
    /// Metadata advertised with the local node, at most `limit` bytes.
    /// Longer values are truncated.
    fn node_meta(&self, _limit: usize) -> Bytes {
        Bytes::new()
    }

    /// Called with every application payload received from a peer.
    fn notify_msg(&self, msg: &[u8]);

    /// Application payloads to piggyback on an outgoing packet. Each payload
    /// costs `overhead` bytes of framing; the total, framing included, must
    /// stay within `limit`.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Bytes>;

    /// Full application state sent during push-pull. `join` is set when the
    /// exchange is part of joining the cluster.
    fn local_state(&self, _join: bool) -> Bytes {
        Bytes::new()
    }

    /// Merges the application state a peer sent during push-pull.
    fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}
}

/// [`EventDelegate`] is notified of membership changes.
///
/// Notifications are dispatched after the registry changed; a failing
/// handler is logged and does not affect the protocol.
#[async_trait]
pub trait EventDelegate: Send + Sync {
    /// A node was seen for the first time, or came back after being gone.
    async fn notify_join(&self, node: &Node) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// A node announced it is leaving the cluster.
    async fn notify_leave(&self, node: &Node) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// A node failed both direct and indirect probes for longer than the
    /// suspicion timeout and was declared dead.
    async fn notify_dead(&self, node: &Node) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Event delegate that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventDelegate;

#[async_trait]
impl EventDelegate for NoopEventDelegate {
    async fn notify_join(&self, _node: &Node) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }

    async fn notify_leave(&self, _node: &Node) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }

    async fn notify_dead(&self, _node: &Node) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
}
