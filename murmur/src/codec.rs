use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use anyhow::{anyhow, bail, Result};
use serde::de::DeserializeOwned;
use tokio_util::{bytes::{Buf as _, BufMut as _, BytesMut}, codec::{Decoder, Encoder}};

use crate::config::MAX_STREAM_FRAME_SIZE;
use crate::message::{Message, MessagePayload, MessageType, Piggyback};

const FRAME_HEADER_LEN: usize = 4;

/// Frames a [`Message`] as `u32 length | body`. The same framing is used for
/// datagrams (one frame per packet) and streams (a sequence of frames).
pub(crate) struct MessageCodec {
    max_frame_size: usize,
}

impl MessageCodec {
    pub(crate) fn new() -> Self {
        Self { max_frame_size: MAX_STREAM_FRAME_SIZE }
    }

    pub(crate) fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Encoder<&'a Message> for MessageCodec {
    type Error = anyhow::Error;

    /// Encodes a `Message` into a `BytesMut` buffer for transmission.
    /// Every variable sized field carries its length as prefix so the
    /// receiver can rebuild the message without any schema negotiation.
    fn encode(&mut self, item: &'a Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();

        // Encode Message Type
        body.put_u8(item.msg_type() as u8);

        // Encode Socket Address
        Self::encode_socket_addr(&item.sender_addr, &mut body);

        // Encode sender name with length prefix
        Self::write_length_prefixed(&bincode::serialize(&item.sender)?, &mut body);

        // Encode Payload with length prefix
        Self::write_length_prefixed(&item.payload.serialize()?, &mut body);

        // Encode piggybacked gossip with length prefix
        Self::write_length_prefixed(&bincode::serialize(&item.piggyback)?, &mut body);

        if body.len() > self.max_frame_size {
            bail!("frame of {} bytes exceeds limit of {} bytes", body.len(), self.max_frame_size);
        }

        dst.reserve(FRAME_HEADER_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&Message>>::encode(self, &item, dst)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > self.max_frame_size {
            bail!("frame of {} bytes exceeds limit of {} bytes", frame_len, self.max_frame_size);
        }
        if src.len() < FRAME_HEADER_LEN + frame_len {
            src.reserve(FRAME_HEADER_LEN + frame_len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let mut body = src.split_to(frame_len);

        let message_type = MessageType::from_u8(Self::read_bytes(&mut body, 1)?.get_u8())?;
        let sender_addr = Self::decode_socket_addr(&mut body)?;
        let sender: String = Self::read_length_prefixed(&mut body)?;

        let payload_len = Self::read_bytes(&mut body, 4)?.get_u32() as usize;
        let payload_bytes = Self::read_bytes(&mut body, payload_len)?;
        let payload = MessagePayload::deserialize(message_type, &payload_bytes)?;

        let piggyback: Piggyback = Self::read_length_prefixed(&mut body)?;

        Ok(Some(Message {
            sender,
            sender_addr,
            payload,
            piggyback,
        }))
    }
}

impl MessageCodec {
    /// read a fixed number of bytes
    pub(crate) fn read_bytes(src: &mut BytesMut, size: usize) -> Result<BytesMut> {
        if src.remaining() < size {
            return Err(anyhow!("Buffer underflow: not enough data"));
        }
        Ok(src.split_to(size))
    }

    /// Read the length of the data, stored as a u32 (4 bytes).
    /// If successful, proceed to read the actual data based on this length.
    pub(crate) fn read_length_prefixed<T: DeserializeOwned>(src: &mut BytesMut) -> Result<T> {
        let len = MessageCodec::read_bytes(src, 4)?.get_u32() as usize;
        let data = MessageCodec::read_bytes(src, len)?;
        Ok(bincode::deserialize(&data)?)
    }

    fn write_length_prefixed(data: &[u8], dst: &mut BytesMut) {
        dst.put_u32(data.len() as u32);
        dst.extend_from_slice(data);
    }

    /// encode a SocketAddr into BytesMut
    pub(crate) fn encode_socket_addr(addr: &SocketAddr, dst: &mut BytesMut) {
        match addr {
            SocketAddr::V4(addr_v4) => {
                dst.put_u8(4);  // IPv4 identifier
                dst.extend_from_slice(&addr_v4.ip().octets());
                dst.put_u16(addr_v4.port());
            },
            SocketAddr::V6(addr_v6) => {
                dst.put_u8(6);  // IPv6 identifier
                dst.extend_from_slice(&addr_v6.ip().octets());
                dst.put_u16(addr_v6.port());
            },
        }
    }

    /// decode a SocketAddr from BytesMut
    pub(crate) fn decode_socket_addr(src: &mut BytesMut) -> Result<SocketAddr> {
        let ip_type = Self::read_bytes(src, 1)?.get_u8();
        let ip_addr = match ip_type {
            4 => {
                let bytes = Self::read_bytes(src, 4)?;
                IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
            },
            6 => {
                let bytes = Self::read_bytes(src, 16)?;
                IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(&bytes[..])?))
            },
            _ => return Err(anyhow!("Invalid IP type")),
        };
        let port = Self::read_bytes(src, 2)?.get_u16();
        Ok(SocketAddr::new(ip_addr, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AckPayload, PingPayload};
    use serde::{Serialize, Deserialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestPayload {
        data: String,
    }

    fn ping(seq: u64) -> Message {
        Message::new(
            "node-a",
            "127.0.0.1:7000".parse().unwrap(),
            MessagePayload::Ping(PingPayload { seq, target: "node-b".into() }),
        )
    }

    #[test]
    fn test_read_bytes() {
        let mut src = BytesMut::from(&b"Hello"[..]);
        assert_eq!(MessageCodec::read_bytes(&mut src, 5).unwrap(), b"Hello"[..]);
        // should error-out (buffer over flow)
        assert!(MessageCodec::read_bytes(&mut src, 1).is_err());
    }

    #[test]
    fn test_read_length_prefixed() {
        let payload = TestPayload { data: "World".to_string() };
        let mut buffer = BytesMut::new();
        MessageCodec::write_length_prefixed(&bincode::serialize(&payload).unwrap(), &mut buffer);

        let decoded_payload: TestPayload = MessageCodec::read_length_prefixed(&mut buffer).unwrap();
        assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn test_socket_addr_ipv6() {
        let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 8080);
        let mut dst = BytesMut::new();
        MessageCodec::encode_socket_addr(&addr, &mut dst);
        assert_eq!(MessageCodec::decode_socket_addr(&mut dst).unwrap(), addr);
    }

    #[test]
    fn test_truncated_socket_addr_is_an_error() {
        let mut src = BytesMut::from(&[4u8, 127, 0][..]);
        assert!(MessageCodec::decode_socket_addr(&mut src).is_err());
    }

    #[test]
    fn test_decoder_waits_for_complete_frame() {
        let mut codec = MessageCodec::new();
        let mut full = BytesMut::new();
        codec.encode(&ping(1), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() / 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() / 2..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(ping(1)));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decoder_splits_consecutive_frames() {
        let mut codec = MessageCodec::new();
        let ack = Message::new("node-b", "127.0.0.1:7001".parse().unwrap(), MessagePayload::Ack(AckPayload { seq: 2 }));
        let mut buf = BytesMut::new();
        codec.encode(&ping(1), &mut buf).unwrap();
        codec.encode(&ack, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ping(1)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ack));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut codec = MessageCodec::with_max_frame_size(16);
        let mut buf = BytesMut::new();
        assert!(codec.encode(&ping(1), &mut buf).is_err());

        let mut forged = BytesMut::new();
        forged.put_u32(1024);
        assert!(codec.decode(&mut forged).is_err());
    }

    #[test]
    fn test_garbage_body_is_an_error() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(&[9, 9, 9]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
