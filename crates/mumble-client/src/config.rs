use std::path::PathBuf;
use std::time::Duration;

use mumble_audio::DEFAULT_BITRATE;
use mumble_protocol::DEFAULT_PORT;

/// Connection and audio settings for a [`MumbleClient`](crate::MumbleClient).
///
/// Audio is fixed to 48 kHz mono s16le; there is no stereo mode.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    /// ACL tokens sent with `Authenticate`.
    pub tokens: Vec<String>,
    /// Client certificate (PEM) for a registered identity.
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    /// Reconnect automatically when the transport fails.
    pub reconnect: bool,
    /// Skip certificate-chain validation. Mumble servers commonly run with
    /// self-signed certificates, so this defaults to true.
    pub accept_invalid_certs: bool,
    /// Outbound Opus target bitrate in bits per second.
    pub opus_bitrate: i32,
    /// Outbound frame duration; must be 10, 20 or 40 ms.
    pub frame_duration: Duration,
    /// Keep received audio in the per-user queues.
    pub receive_sound: bool,
    /// Release string reported in the `Version` handshake.
    pub client_release: String,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        ClientConfig {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: None,
            tokens: Vec::new(),
            certfile: None,
            keyfile: None,
            reconnect: false,
            accept_invalid_certs: true,
            opus_bitrate: DEFAULT_BITRATE,
            frame_duration: Duration::from_millis(20),
            receive_sound: false,
            client_release: format!("mumble-client {}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_tokens(mut self, tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tokens = tokens.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_certificate(mut self, certfile: impl Into<PathBuf>, keyfile: impl Into<PathBuf>) -> Self {
        self.certfile = Some(certfile.into());
        self.keyfile = Some(keyfile.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_opus_bitrate(mut self, bitrate: i32) -> Self {
        self.opus_bitrate = bitrate;
        self
    }

    pub fn with_frame_duration(mut self, frame_duration: Duration) -> Self {
        self.frame_duration = frame_duration;
        self
    }

    pub fn with_receive_sound(mut self, receive_sound: bool) -> Self {
        self.receive_sound = receive_sound;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::new("voice.example.org", "bot");
        assert_eq!(config.port, 64738);
        assert_eq!(config.opus_bitrate, 40_000);
        assert_eq!(config.frame_duration, Duration::from_millis(20));
        assert!(!config.reconnect);
        assert!(!config.receive_sound);
    }

    #[test]
    fn builders_apply() {
        let config = ClientConfig::new("h", "u")
            .with_port(1234)
            .with_password("hunter2")
            .with_tokens(["a", "b"])
            .with_reconnect(true);
        assert_eq!(config.port, 1234);
        assert_eq!(config.password.as_deref(), Some("hunter2"));
        assert_eq!(config.tokens, vec!["a".to_string(), "b".to_string()]);
        assert!(config.reconnect);
    }
}
