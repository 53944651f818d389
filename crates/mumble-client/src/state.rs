//! Session-level shared state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::blobs::BlobCache;
use crate::callbacks::Callbacks;
use crate::channels::Channels;
use crate::commands::{CommandQueue, QueuedCommand};
use crate::config::ClientConfig;
use crate::outbound::OutboundAudio;
use crate::users::Users;

/// Fallback for `max_message_length` until `ServerConfig` arrives.
pub const DEFAULT_MAX_MESSAGE_LENGTH: u32 = 5000;

/// Fallback for `max_image_length` until `ServerConfig` arrives.
pub const DEFAULT_MAX_IMAGE_LENGTH: u32 = 131_072;

/// Connection lifecycle, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerVersion {
    pub version: u32,
    pub release: String,
    pub os: String,
    pub os_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodecVersions {
    pub alpha: i32,
    pub beta: i32,
    pub prefer_alpha: bool,
    pub opus: bool,
}

/// Key material announced in `CryptSetup`. Voice rides the TCP tunnel, so
/// this is stored but not otherwise used.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CryptMaterial {
    pub key: Vec<u8>,
    pub client_nonce: Vec<u8>,
    pub server_nonce: Vec<u8>,
}

/// Server-advertised limits and identity, filled in during the handshake.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// The local connection's session id (from `ServerSync`).
    pub session: Option<u32>,
    pub welcome_text: Option<String>,
    pub max_bandwidth: Option<u32>,
    pub permissions: Option<u64>,
    pub max_message_length: Option<u32>,
    pub max_image_length: Option<u32>,
    pub allow_html: Option<bool>,
    pub max_users: Option<u32>,
    pub server_version: Option<ServerVersion>,
    pub codec_versions: Option<CodecVersions>,
    pub crypt: Option<CryptMaterial>,
}

impl ServerInfo {
    /// Effective plain-text length limit (0 disables the check).
    pub fn max_message_length(&self) -> u32 {
        self.max_message_length.unwrap_or(DEFAULT_MAX_MESSAGE_LENGTH)
    }

    /// Effective image-message length limit (0 disables the check).
    pub fn max_image_length(&self) -> u32 {
        self.max_image_length.unwrap_or(DEFAULT_MAX_IMAGE_LENGTH)
    }
}

/// Everything the runtime tasks and the host-facing handle share.
pub(crate) struct Shared {
    pub config: ClientConfig,
    pub users: Arc<Users>,
    pub channels: Arc<Channels>,
    pub blobs: Arc<BlobCache>,
    pub callbacks: Arc<Callbacks>,
    pub outbound: OutboundAudio,
    pub commands: CommandQueue,
    pub info: Mutex<ServerInfo>,
    pub state_tx: watch::Sender<ConnectionState>,
    /// Most recent control-ping round trip, in microseconds (0 = none yet).
    pub last_rtt_micros: AtomicU64,
}

impl Shared {
    pub(crate) fn new(config: ClientConfig) -> (Arc<Self>, mpsc::Receiver<QueuedCommand>) {
        let (commands, command_rx) = CommandQueue::new();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let shared = Arc::new(Shared {
            users: Arc::new(Users::new(config.receive_sound)),
            channels: Arc::new(Channels::default()),
            blobs: Arc::new(BlobCache::default()),
            callbacks: Arc::new(Callbacks::default()),
            outbound: OutboundAudio::new(),
            commands,
            info: Mutex::new(ServerInfo::default()),
            state_tx,
            last_rtt_micros: AtomicU64::new(0),
            config,
        });
        (shared, command_rx)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    pub(crate) fn is_closing(&self) -> bool {
        matches!(self.state(), ConnectionState::Closing | ConnectionState::Closed)
    }

    pub(crate) fn server_info(&self) -> ServerInfo {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn record_rtt(&self, rtt: Duration) {
        self.last_rtt_micros
            .store(rtt.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn last_rtt(&self) -> Option<Duration> {
        match self.last_rtt_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    /// Forget everything tied to the dead connection; the next handshake
    /// repopulates the shadows from scratch.
    pub(crate) fn clear_session(&self) {
        self.users.clear();
        self.channels.clear();
        self.blobs.clear_pending();
        self.outbound.clear();
        let mut info = self.info.lock().unwrap_or_else(|e| e.into_inner());
        info.session = None;
    }
}
