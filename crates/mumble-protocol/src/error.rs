use thiserror::Error;

use crate::control::MessageKind;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("control payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("unknown control message type: {0}")]
    UnknownMessageKind(u16),

    #[error("failed to decode {kind:?} payload: {source}")]
    MessageDecode {
        kind: MessageKind,
        #[source]
        source: prost::DecodeError,
    },

    #[error("voice packet truncated")]
    TruncatedVoicePacket,

    #[error("unknown voice packet kind: {0}")]
    UnknownVoiceKind(u8),

    #[error("voice frame too large: {0} bytes")]
    VoiceFrameTooLarge(usize),

    #[error(transparent)]
    Varint(#[from] VarintError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VarintError {
    #[error("varint truncated")]
    Truncated,
}
