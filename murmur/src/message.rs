// SWIM protocol messages exchanged over datagrams and streams.
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio_util::{bytes::BytesMut, codec::{Decoder, Encoder as _}};
use core::fmt;
use std::net::SocketAddr;

use crate::{codec::MessageCodec, NodeState};

// Largest payload a UDP datagram can carry.
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// A gossiped assertion about one member: its address, incarnation, state
/// and metadata. Ordered by `(incarnation, severity)` when merged.
#[derive(Debug, Clone, Serialize, Eq, PartialEq, Deserialize)]
pub struct MembershipUpdate {
    pub name: String,
    pub addr: SocketAddr,
    pub incarnation: u64,
    pub state: NodeState,
    pub meta: Vec<u8>,
}

impl MembershipUpdate {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub(crate) fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PingPayload {
    pub seq: u64,
    /// Name of the member the ping is meant for. A process that reuses the
    /// address under another name ignores it.
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PingReqPayload {
    pub seq: u64,
    pub target: String,
    pub target_addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct AckPayload {
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PushPullPayload {
    pub join: bool,
    pub nodes: Vec<MembershipUpdate>,
    pub app_state: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum MessagePayload {
    Ping(PingPayload),
    PingReq(PingReqPayload),
    Ack(AckPayload),
    Gossip,
    PushPull(PushPullPayload),
}

impl MessagePayload {
    pub(crate) fn msg_type(&self) -> MessageType {
        match self {
            MessagePayload::Ping(_) => MessageType::Ping,
            MessagePayload::PingReq(_) => MessageType::PingReq,
            MessagePayload::Ack(_) => MessageType::Ack,
            MessagePayload::Gossip => MessageType::Gossip,
            MessagePayload::PushPull(_) => MessageType::PushPull,
        }
    }

    /// Serializes the inner payload, the message type travels separately.
    pub(crate) fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        match self {
            MessagePayload::Ping(p) => bincode::serialize(p),
            MessagePayload::PingReq(p) => bincode::serialize(p),
            MessagePayload::Ack(p) => bincode::serialize(p),
            MessagePayload::Gossip => Ok(Vec::new()),
            MessagePayload::PushPull(p) => bincode::serialize(p),
        }
    }

    pub(crate) fn deserialize(msg_type: MessageType, data: &[u8]) -> Result<Self, bincode::Error> {
        Ok(match msg_type {
            MessageType::Ping => MessagePayload::Ping(bincode::deserialize(data)?),
            MessageType::PingReq => MessagePayload::PingReq(bincode::deserialize(data)?),
            MessageType::Ack => MessagePayload::Ack(bincode::deserialize(data)?),
            MessageType::Gossip => MessagePayload::Gossip,
            MessageType::PushPull => MessagePayload::PushPull(bincode::deserialize(data)?),
        })
    }
}

/// Encoded membership updates and application broadcasts riding on a packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Piggyback {
    pub updates: Vec<Vec<u8>>,
    pub broadcasts: Vec<Vec<u8>>,
}

impl Piggyback {
    pub(crate) fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.broadcasts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Message {
    pub(crate) sender: String,
    pub(crate) sender_addr: SocketAddr,
    pub(crate) payload: MessagePayload,
    pub(crate) piggyback: Piggyback,
}

impl Message {
    pub(crate) fn new(sender: impl Into<String>, sender_addr: SocketAddr, payload: MessagePayload) -> Self {
        Self {
            sender: sender.into(),
            sender_addr,
            payload,
            piggyback: Piggyback::default(),
        }
    }

    pub(crate) fn with_piggyback(mut self, piggyback: Piggyback) -> Self {
        self.piggyback = piggyback;
        self
    }

    pub(crate) fn msg_type(&self) -> MessageType {
        self.payload.msg_type()
    }

    /// Encodes the message as a single length-prefixed frame.
    pub(crate) fn to_bytes(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        MessageCodec::new().encode(self, &mut buf)?;
        Ok(buf)
    }

    pub(crate) fn from_slice(data: &[u8]) -> Result<Self> {
        let mut codec = MessageCodec::with_max_frame_size(MAX_DATAGRAM_SIZE);
        let mut bytes = BytesMut::from(data);
        codec.decode(&mut bytes)?
            .ok_or_else(|| anyhow!("Truncated message frame"))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub(crate) enum MessageType {
    Ping = 0,
    PingReq = 1,
    Ack = 2,
    Gossip = 3,
    PushPull = 4,
}

impl MessageType {
    pub(crate) fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Ping),
            1 => Ok(MessageType::PingReq),
            2 => Ok(MessageType::Ack),
            3 => Ok(MessageType::Gossip),
            4 => Ok(MessageType::PushPull),
            _ => Err(anyhow!("Invalid MessageType value: {}", value)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Ping => write!(f, "PING"),
            MessageType::PingReq => write!(f, "PING_REQ"),
            MessageType::Ack => write!(f, "ACK"),
            MessageType::Gossip => write!(f, "GOSSIP"),
            MessageType::PushPull => write!(f, "PUSH_PULL"),
        }
    }
}
