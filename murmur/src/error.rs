use std::net::SocketAddr;
use thiserror::Error;

/// Failures murmur reports. Public functions return `anyhow::Result`; the
/// variants below are what ends up inside and can be recovered with
/// `err.downcast_ref::<MurmurError>()`.
///
/// Stale membership updates are not errors: the registry reports them as
/// [`MergeAction::Unchanged`](crate::MergeAction::Unchanged).
#[derive(Debug, Error)]
pub enum MurmurError {
    /// The node cannot come up: the transport failed to bind or no seed
    /// could be reached. Fatal.
    #[error("startup failure: {0}")]
    Startup(String),

    /// A probe got neither a direct nor an indirect ack in time. Absorbed by
    /// the failure detector, never surfaced to the application.
    #[error("probe of {node} ({addr}) failed")]
    ProbeFailed { node: String, addr: SocketAddr },

    /// An inbound packet or stream frame could not be decoded. The packet is
    /// dropped.
    #[error("malformed message from {from}: {reason}")]
    MalformedMessage { from: String, reason: String },

    /// A transport operation failed after startup.
    #[error("transport error: {0}")]
    Transport(String),

    /// The configuration is rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The operation needs a running node.
    #[error("murmur is not running")]
    NotRunning,
}
