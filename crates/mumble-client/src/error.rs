use mumble_audio::AudioError;
use mumble_protocol::proto::reject::RejectType;
use mumble_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("server rejected the connection: {reason}")]
    Rejected {
        kind: Option<RejectType>,
        reason: String,
    },

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("text message too long: {len} characters (server limit {max})")]
    TextTooLong { len: usize, max: usize },

    #[error("image message too big: {len} bytes (server limit {max})")]
    ImageTooBig { len: usize, max: usize },

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Disconnected,

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_display_includes_reason() {
        let e = ClientError::Rejected {
            kind: Some(RejectType::ServerFull),
            reason: "server is full".into(),
        };
        assert!(e.to_string().contains("server is full"));
    }

    #[test]
    fn text_too_long_display() {
        let e = ClientError::TextTooLong { len: 200, max: 128 };
        let msg = e.to_string();
        assert!(msg.contains("200"));
        assert!(msg.contains("128"));
    }
}
