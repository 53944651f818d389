//! Control-channel framing and message demultiplexing.
//!
//! Every control frame is a 2-byte big-endian message type, a 4-byte
//! big-endian payload length, and the protobuf payload. `UDPTunnel` frames
//! carry a raw voice packet instead (see [`crate::voice`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;

use crate::error::ProtocolError;
use crate::proto;

/// Frame header size: u16 type + u32 length.
pub const HEADER_SIZE: usize = 6;

/// Upper bound on a single control payload (the server caps messages well
/// below this; anything larger means a corrupt stream).
pub const MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;

/// Control message types, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    Version = 0,
    UdpTunnel = 1,
    Authenticate = 2,
    Ping = 3,
    Reject = 4,
    ServerSync = 5,
    ChannelRemove = 6,
    ChannelState = 7,
    UserRemove = 8,
    UserState = 9,
    BanList = 10,
    TextMessage = 11,
    PermissionDenied = 12,
    Acl = 13,
    QueryUsers = 14,
    CryptSetup = 15,
    ContextActionModify = 16,
    ContextAction = 17,
    UserList = 18,
    VoiceTarget = 19,
    PermissionQuery = 20,
    CodecVersion = 21,
    UserStats = 22,
    RequestBlob = 23,
    ServerConfig = 24,
    SuggestConfig = 25,
}

impl MessageKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::Version,
            1 => Self::UdpTunnel,
            2 => Self::Authenticate,
            3 => Self::Ping,
            4 => Self::Reject,
            5 => Self::ServerSync,
            6 => Self::ChannelRemove,
            7 => Self::ChannelState,
            8 => Self::UserRemove,
            9 => Self::UserState,
            10 => Self::BanList,
            11 => Self::TextMessage,
            12 => Self::PermissionDenied,
            13 => Self::Acl,
            14 => Self::QueryUsers,
            15 => Self::CryptSetup,
            16 => Self::ContextActionModify,
            17 => Self::ContextAction,
            18 => Self::UserList,
            19 => Self::VoiceTarget,
            20 => Self::PermissionQuery,
            21 => Self::CodecVersion,
            22 => Self::UserStats,
            23 => Self::RequestBlob,
            24 => Self::ServerConfig,
            25 => Self::SuggestConfig,
            _ => return None,
        })
    }
}

/// Frame a raw payload for the wire.
pub fn encode_frame(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u16(kind as u16);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf
}

/// Encode a protobuf message body and frame it.
pub fn encode_message<M: Message>(kind: MessageKind, msg: &M) -> Vec<u8> {
    encode_frame(kind, &msg.encode_to_vec())
}

/// Extract one complete frame from the buffer, if available.
///
/// Returns `Ok(None)` when more data is needed. A frame with an unrecognised
/// type is consumed before the error is returned, so the caller may log it
/// and keep reading.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<(MessageKind, Bytes)>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let kind_raw = u16::from_be_bytes([buf[0], buf[1]]);
    let len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;

    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    if buf.len() < HEADER_SIZE + len {
        return Ok(None);
    }

    buf.advance(HEADER_SIZE);
    let payload = buf.split_to(len).freeze();

    match MessageKind::from_u16(kind_raw) {
        Some(kind) => Ok(Some((kind, payload))),
        None => Err(ProtocolError::UnknownMessageKind(kind_raw)),
    }
}

/// An inbound control message, decoded as far as the client interprets it.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Version(proto::Version),
    Ping(proto::Ping),
    Reject(proto::Reject),
    ServerSync(proto::ServerSync),
    ChannelRemove(proto::ChannelRemove),
    ChannelState(proto::ChannelState),
    UserRemove(proto::UserRemove),
    UserState(proto::UserState),
    TextMessage(proto::TextMessage),
    PermissionDenied(proto::PermissionDenied),
    CryptSetup(proto::CryptSetup),
    CodecVersion(proto::CodecVersion),
    ServerConfig(proto::ServerConfig),
    /// A voice packet tunnelled over TCP; the payload is handed to the
    /// voice codec untouched.
    UdpTunnel(Bytes),
    /// Message types the client relays to the host without interpreting
    /// (ACL, QueryUsers, ContextActionModify, UserStats, ...).
    Raw { kind: MessageKind, payload: Bytes },
}

impl ControlMessage {
    pub fn decode(kind: MessageKind, payload: Bytes) -> Result<Self, ProtocolError> {
        fn body<M: Message + Default>(
            kind: MessageKind,
            payload: &Bytes,
        ) -> Result<M, ProtocolError> {
            M::decode(payload.as_ref())
                .map_err(|source| ProtocolError::MessageDecode { kind, source })
        }

        Ok(match kind {
            MessageKind::Version => Self::Version(body(kind, &payload)?),
            MessageKind::Ping => Self::Ping(body(kind, &payload)?),
            MessageKind::Reject => Self::Reject(body(kind, &payload)?),
            MessageKind::ServerSync => Self::ServerSync(body(kind, &payload)?),
            MessageKind::ChannelRemove => Self::ChannelRemove(body(kind, &payload)?),
            MessageKind::ChannelState => Self::ChannelState(body(kind, &payload)?),
            MessageKind::UserRemove => Self::UserRemove(body(kind, &payload)?),
            MessageKind::UserState => Self::UserState(body(kind, &payload)?),
            MessageKind::TextMessage => Self::TextMessage(body(kind, &payload)?),
            MessageKind::PermissionDenied => Self::PermissionDenied(body(kind, &payload)?),
            MessageKind::CryptSetup => Self::CryptSetup(body(kind, &payload)?),
            MessageKind::CodecVersion => Self::CodecVersion(body(kind, &payload)?),
            MessageKind::ServerConfig => Self::ServerConfig(body(kind, &payload)?),
            MessageKind::UdpTunnel => Self::UdpTunnel(payload),
            _ => Self::Raw { kind, payload },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let msg = proto::Ping {
            timestamp: Some(12345),
            ..Default::default()
        };
        let wire = encode_message(MessageKind::Ping, &msg);

        let mut buf = BytesMut::from(&wire[..]);
        let (kind, payload) = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(kind, MessageKind::Ping);
        assert!(buf.is_empty());

        match ControlMessage::decode(kind, payload).unwrap() {
            ControlMessage::Ping(decoded) => assert_eq!(decoded.timestamp, Some(12345)),
            other => panic!("expected ping, got {other:?}"),
        }
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let wire = encode_message(
            MessageKind::ServerSync,
            &proto::ServerSync {
                session: Some(3),
                ..Default::default()
            },
        );

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire[..3]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&wire[3..7]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&wire[7..]);
        let (kind, _) = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(kind, MessageKind::ServerSync);
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(MessageKind::UdpTunnel, b"voice"));
        buf.extend_from_slice(&encode_message(
            MessageKind::Ping,
            &proto::Ping::default(),
        ));

        let (kind, payload) = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(kind, MessageKind::UdpTunnel);
        assert_eq!(payload.as_ref(), b"voice");

        let (kind, _) = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(kind, MessageKind::Ping);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(MessageKind::UserState as u16);
        buf.put_u32(MAX_PAYLOAD_SIZE as u32 + 1);
        assert!(matches!(
            try_decode_frame(&mut buf),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn unknown_kind_consumes_the_frame() {
        let mut buf = BytesMut::new();
        buf.put_u16(999);
        buf.put_u32(2);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&encode_message(
            MessageKind::Ping,
            &proto::Ping::default(),
        ));

        assert!(matches!(
            try_decode_frame(&mut buf),
            Err(ProtocolError::UnknownMessageKind(999))
        ));
        // the stream stays decodable after the bad frame
        let (kind, _) = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(kind, MessageKind::Ping);
    }

    #[test]
    fn uninterpreted_kinds_surface_raw() {
        let payload = Bytes::from_static(b"\x08\x01");
        match ControlMessage::decode(MessageKind::Acl, payload.clone()).unwrap() {
            ControlMessage::Raw { kind, payload: p } => {
                assert_eq!(kind, MessageKind::Acl);
                assert_eq!(p, payload);
            }
            other => panic!("expected raw, got {other:?}"),
        }
    }

    #[test]
    fn malformed_body_reports_the_kind() {
        // truncated varint in a ServerSync body
        let payload = Bytes::from_static(b"\x08");
        match ControlMessage::decode(MessageKind::ServerSync, payload) {
            Err(ProtocolError::MessageDecode { kind, .. }) => {
                assert_eq!(kind, MessageKind::ServerSync)
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }
}
