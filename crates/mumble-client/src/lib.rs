//! Client library for the Mumble voice-chat protocol.
//!
//! A [`MumbleClient`] connects to a server over TLS, mirrors the channel
//! tree and user table, exchanges text messages, and streams Opus audio in
//! both directions through the TCP voice tunnel.
//!
//! ```no_run
//! use mumble_client::{ClientConfig, MumbleClient};
//!
//! # async fn run() -> Result<(), mumble_client::ClientError> {
//! let client = MumbleClient::new(ClientConfig::new("voice.example.org", "bot"));
//! client.callbacks().on_sound_received(|_user, _chunk| {
//!     // feed chunk.pcm somewhere
//! });
//! client.start()?;
//! client.ready(std::time::Duration::from_secs(10)).await?;
//! client.set_receive_sound(true);
//! client.send_channel_message(0, "hello").await?.wait().await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

mod blobs;
mod callbacks;
mod channels;
mod commands;
mod config;
mod connection;
mod dispatch;
mod error;
mod outbound;
mod state;
mod users;

pub use blobs::{BlobCache, BlobKind};
pub use callbacks::Callbacks;
pub use channels::{Channel, ChannelField, Channels, ROOT_CHANNEL};
pub use commands::CommandHandle;
pub use config::ClientConfig;
pub use error::ClientError;
pub use mumble_audio::{SoundChunk, SoundQueue};
pub use mumble_protocol::proto;
pub use mumble_protocol::MessageKind;
pub use state::{
    CodecVersions, ConnectionState, CryptMaterial, ServerInfo, ServerVersion,
};
pub use users::{User, UserField, Users};

use commands::{CommandKind, QueuedCommand};
use state::Shared;

/// Normal talk; whisper targets are 1..=30, 31 is server loopback.
pub const TARGET_NORMAL: u8 = 0;

struct RuntimeSlots {
    command_rx: Option<mpsc::Receiver<QueuedCommand>>,
    supervisor: Option<JoinHandle<()>>,
}

/// A session with one Mumble server.
///
/// All mutating operations are queued as commands and dispatched by the I/O
/// worker in submission order; the returned [`CommandHandle`] resolves when
/// the message has been written to the wire.
pub struct MumbleClient {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ConnectionState>,
    slots: Mutex<RuntimeSlots>,
}

impl MumbleClient {
    pub fn new(config: ClientConfig) -> Self {
        let (shared, command_rx) = Shared::new(config);
        let state_rx = shared.state_tx.subscribe();
        MumbleClient {
            shared,
            state_rx,
            slots: Mutex::new(RuntimeSlots {
                command_rx: Some(command_rx),
                supervisor: None,
            }),
        }
    }

    /// Spawn the connection supervisor. Non-blocking; must be called from
    /// within a tokio runtime. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), ClientError> {
        let millis = self.shared.config.frame_duration.as_millis() as u64;
        if !matches!(millis, 10 | 20 | 40) {
            return Err(ClientError::Audio(
                mumble_audio::AudioError::InvalidFrameDuration(millis),
            ));
        }

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.supervisor.is_some() {
            return Ok(());
        }
        let command_rx = slots.command_rx.take().ok_or(ClientError::Disconnected)?;
        slots.supervisor = Some(tokio::spawn(connection::run_supervisor(
            self.shared.clone(),
            command_rx,
        )));
        Ok(())
    }

    /// Wait until the handshake finished and the session is usable.
    pub async fn ready(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut state_rx = self.state_rx.clone();
        let wait = state_rx.wait_for(|state| {
            matches!(state, ConnectionState::Ready | ConnectionState::Closed)
        });
        let outcome = match tokio::time::timeout(timeout, wait).await {
            Err(_) => Err(ClientError::Timeout),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Ok(Ok(state)) => match *state {
                ConnectionState::Ready => Ok(()),
                _ => Err(ClientError::Disconnected),
            },
        };
        outcome
    }

    /// Orderly shutdown: refuse new commands, fail the queued ones, drain
    /// outbound audio briefly, then tear the connection down.
    pub async fn close(&self) {
        self.shared.commands.close();
        self.shared.set_state(ConnectionState::Closing);
        let supervisor = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.supervisor.take()
        };
        match supervisor {
            Some(handle) => {
                if handle.await.is_err() {
                    debug!("supervisor task aborted");
                }
            }
            None => self.shared.set_state(ConnectionState::Closed),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// User table shadow.
    pub fn users(&self) -> Arc<Users> {
        self.shared.users.clone()
    }

    /// Channel tree shadow.
    pub fn channels(&self) -> Arc<Channels> {
        self.shared.channels.clone()
    }

    /// Comment/texture/description blob cache.
    pub fn blobs(&self) -> Arc<BlobCache> {
        self.shared.blobs.clone()
    }

    /// Callback registry. Register handlers before [`start`](Self::start)
    /// to observe the initial state flood.
    pub fn callbacks(&self) -> &Callbacks {
        &self.shared.callbacks
    }

    /// Snapshot of server-advertised limits and identity.
    pub fn server_info(&self) -> ServerInfo {
        self.shared.server_info()
    }

    /// Most recent control-channel round trip.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.shared.last_rtt()
    }

    /// Whether outbound audio overflowed since the last call (oldest frames
    /// were dropped).
    pub fn sound_lagged(&self) -> bool {
        self.shared.outbound.take_lagged()
    }

    // ── text ───────────────────────────────────────────────────────────

    /// Send a text message to a channel, length-checked against the server
    /// limits before it is queued.
    pub async fn send_channel_message(
        &self,
        channel_id: u32,
        text: &str,
    ) -> Result<CommandHandle, ClientError> {
        self.check_text(text)?;
        let msg = proto::TextMessage {
            channel_id: vec![channel_id],
            message: text.to_owned(),
            ..Default::default()
        };
        self.shared
            .commands
            .submit(CommandKind::SendTextMessage(msg))
            .await
    }

    /// Send a private text message to a user.
    pub async fn send_user_message(
        &self,
        session: u32,
        text: &str,
    ) -> Result<CommandHandle, ClientError> {
        self.check_text(text)?;
        let msg = proto::TextMessage {
            session: vec![session],
            message: text.to_owned(),
            ..Default::default()
        };
        self.shared
            .commands
            .submit(CommandKind::SendTextMessage(msg))
            .await
    }

    // ── channel mutations ──────────────────────────────────────────────

    /// Move the local user to a channel.
    pub async fn move_self(&self, channel_id: u32) -> Result<CommandHandle, ClientError> {
        let session = self.myself_session()?;
        self.move_user(session, channel_id).await
    }

    pub async fn move_user(
        &self,
        session: u32,
        channel_id: u32,
    ) -> Result<CommandHandle, ClientError> {
        self.shared
            .commands
            .submit(CommandKind::MoveUser { session, channel_id })
            .await
    }

    pub async fn new_channel(
        &self,
        parent: u32,
        name: impl Into<String>,
        temporary: bool,
    ) -> Result<CommandHandle, ClientError> {
        self.shared
            .commands
            .submit(CommandKind::CreateChannel {
                parent,
                name: name.into(),
                temporary,
            })
            .await
    }

    pub async fn remove_channel(&self, channel_id: u32) -> Result<CommandHandle, ClientError> {
        self.shared
            .commands
            .submit(CommandKind::RemoveChannel { channel_id })
            .await
    }

    // ── user state mutations ───────────────────────────────────────────

    /// Mute a user. Muting the local session becomes a self-mute.
    pub async fn mute(&self, session: u32) -> Result<CommandHandle, ClientError> {
        self.set_mute_state(session, true).await
    }

    pub async fn unmute(&self, session: u32) -> Result<CommandHandle, ClientError> {
        self.set_mute_state(session, false).await
    }

    async fn set_mute_state(&self, session: u32, value: bool) -> Result<CommandHandle, ClientError> {
        let mut msg = proto::UserState {
            session: Some(session),
            ..Default::default()
        };
        if self.shared.users.local_session() == Some(session) {
            msg.self_mute = Some(value);
        } else {
            msg.mute = Some(value);
        }
        self.mod_user_state(msg).await
    }

    /// Deafen a user. Deafening the local session becomes a self-deafen.
    pub async fn deafen(&self, session: u32) -> Result<CommandHandle, ClientError> {
        self.set_deaf_state(session, true).await
    }

    pub async fn undeafen(&self, session: u32) -> Result<CommandHandle, ClientError> {
        self.set_deaf_state(session, false).await
    }

    async fn set_deaf_state(&self, session: u32, value: bool) -> Result<CommandHandle, ClientError> {
        let mut msg = proto::UserState {
            session: Some(session),
            ..Default::default()
        };
        if self.shared.users.local_session() == Some(session) {
            msg.self_deaf = Some(value);
        } else {
            msg.deaf = Some(value);
        }
        self.mod_user_state(msg).await
    }

    pub async fn suppress(&self, session: u32) -> Result<CommandHandle, ClientError> {
        self.mod_user_state(proto::UserState {
            session: Some(session),
            suppress: Some(true),
            ..Default::default()
        })
        .await
    }

    pub async fn unsuppress(&self, session: u32) -> Result<CommandHandle, ClientError> {
        self.mod_user_state(proto::UserState {
            session: Some(session),
            suppress: Some(false),
            ..Default::default()
        })
        .await
    }

    pub async fn set_recording(
        &self,
        session: u32,
        recording: bool,
    ) -> Result<CommandHandle, ClientError> {
        self.mod_user_state(proto::UserState {
            session: Some(session),
            recording: Some(recording),
            ..Default::default()
        })
        .await
    }

    pub async fn set_self_mute(&self, value: bool) -> Result<CommandHandle, ClientError> {
        let session = self.myself_session()?;
        self.mod_user_state(proto::UserState {
            session: Some(session),
            self_mute: Some(value),
            ..Default::default()
        })
        .await
    }

    pub async fn set_self_deaf(&self, value: bool) -> Result<CommandHandle, ClientError> {
        let session = self.myself_session()?;
        self.mod_user_state(proto::UserState {
            session: Some(session),
            self_deaf: Some(value),
            ..Default::default()
        })
        .await
    }

    /// Set the local user's comment text.
    pub async fn set_comment(&self, comment: impl Into<String>) -> Result<CommandHandle, ClientError> {
        let session = self.myself_session()?;
        self.mod_user_state(proto::UserState {
            session: Some(session),
            comment: Some(comment.into()),
            ..Default::default()
        })
        .await
    }

    /// Set the local user's avatar texture.
    pub async fn set_texture(&self, texture: Vec<u8>) -> Result<CommandHandle, ClientError> {
        let session = self.myself_session()?;
        self.mod_user_state(proto::UserState {
            session: Some(session),
            texture: Some(texture),
            ..Default::default()
        })
        .await
    }

    /// Register the local user with the server.
    pub async fn register_self(&self) -> Result<CommandHandle, ClientError> {
        let session = self.myself_session()?;
        self.mod_user_state(proto::UserState {
            session: Some(session),
            user_id: Some(0),
            ..Default::default()
        })
        .await
    }

    async fn mod_user_state(&self, msg: proto::UserState) -> Result<CommandHandle, ClientError> {
        self.shared
            .commands
            .submit(CommandKind::ModUserState(msg))
            .await
    }

    // ── audio ──────────────────────────────────────────────────────────

    /// Configure a whisper/voice target slot (1..=30) to reach the given
    /// sessions; outbound audio selects it via [`add_sound`](Self::add_sound).
    pub async fn set_voice_target(
        &self,
        id: u32,
        sessions: Vec<u32>,
    ) -> Result<CommandHandle, ClientError> {
        self.shared
            .commands
            .submit(CommandKind::SetVoiceTarget { id, sessions })
            .await
    }

    /// Keep (or discard) audio received from other users.
    pub fn set_receive_sound(&self, value: bool) {
        self.shared.users.set_receive_sound(value);
    }

    /// Stage PCM (s16le, 48 kHz mono) for paced transmission to `target`
    /// (0 = normal talk).
    pub fn add_sound(&self, pcm: &[u8], target: u8) {
        self.shared.outbound.add_sound(pcm, target & 0x1F);
    }

    fn myself_session(&self) -> Result<u32, ClientError> {
        self.shared
            .users
            .local_session()
            .ok_or(ClientError::NotConnected)
    }

    fn check_text(&self, text: &str) -> Result<(), ClientError> {
        let info = self.shared.server_info();
        let chars = text.chars().count();

        let max_image = info.max_image_length() as usize;
        if max_image != 0 && chars > max_image {
            return Err(ClientError::ImageTooBig {
                len: chars,
                max: max_image,
            });
        }
        if !(text.contains("<img") && text.contains("src")) {
            let max = info.max_message_length() as usize;
            if max != 0 && chars > max {
                return Err(ClientError::TextTooLong { len: chars, max });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MumbleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MumbleClient")
            .field("host", &self.shared.config.host)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MumbleClient {
        MumbleClient::new(ClientConfig::new("localhost", "test"))
    }

    fn set_limits(client: &MumbleClient, message: u32, image: u32) {
        let mut info = client.shared.info.lock().unwrap();
        info.max_message_length = Some(message);
        info.max_image_length = Some(image);
    }

    #[test]
    fn starts_idle() {
        assert_eq!(client().state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn plain_text_checked_against_message_limit() {
        let client = client();
        set_limits(&client, 128, 131_072);

        let long = "x".repeat(200);
        match client.send_channel_message(0, &long).await {
            Err(ClientError::TextTooLong { len, max }) => {
                assert_eq!(len, 200);
                assert_eq!(max, 128);
            }
            other => panic!("expected TextTooLong, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn image_text_checked_against_image_limit() {
        let client = client();
        set_limits(&client, 128, 131_072);

        // 200 chars with both <img and src: the text limit does not apply
        let mut image = String::from("<img src=\"data:;base64,\"");
        image.push_str(&"A".repeat(200 - image.chars().count()));
        assert!(client.send_channel_message(0, &image).await.is_ok());

        set_limits(&client, 128, 64);
        match client.send_channel_message(0, &image).await {
            Err(ClientError::ImageTooBig { max, .. }) => assert_eq!(max, 64),
            other => panic!("expected ImageTooBig, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn private_messages_share_the_guards() {
        let client = client();
        set_limits(&client, 16, 131_072);
        assert!(matches!(
            client.send_user_message(5, &"y".repeat(32)).await,
            Err(ClientError::TextTooLong { .. })
        ));
        assert!(client.send_user_message(5, "short").await.is_ok());
    }

    #[tokio::test]
    async fn self_operations_require_a_session() {
        let client = client();
        assert!(matches!(
            client.move_self(3).await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.set_comment("hi").await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn mute_targets_self_state_for_the_local_session() {
        let client = client();
        client.shared.users.set_local_session(9);

        client.mute(9).await.unwrap();
        client.mute(4).await.unwrap();

        let mut rx = {
            let mut slots = client.slots.lock().unwrap();
            slots.command_rx.take().unwrap()
        };
        match rx.try_recv().unwrap().kind {
            CommandKind::ModUserState(msg) => {
                assert_eq!(msg.self_mute, Some(true));
                assert_eq!(msg.mute, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        match rx.try_recv().unwrap().kind {
            CommandKind::ModUserState(msg) => {
                assert_eq!(msg.mute, Some(true));
                assert_eq!(msg.self_mute, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_without_start_settles_closed() {
        let client = client();
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.send_channel_message(0, "hi").await,
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn add_sound_masks_the_target() {
        let client = client();
        client.add_sound(&[0u8; 960], 0xFF);
        // staged under target 31 (loopback) after masking
        let frame = client.shared.outbound.take_frame(960, 1).unwrap();
        assert_eq!(frame.target, 31);
    }

    #[test]
    fn staged_pcm_becomes_one_voice_packet() {
        use mumble_protocol::voice;

        let client = client();
        // exactly one 20 ms frame of PCM
        client.add_sound(&[0u8; 1920], TARGET_NORMAL);

        let mut encoder =
            mumble_audio::Encoder::new(40_000, Duration::from_millis(20)).unwrap();
        let frame = client
            .shared
            .outbound
            .take_frame(encoder.frame_bytes(), encoder.sequence_increment())
            .unwrap();
        assert!(
            client
                .shared
                .outbound
                .take_frame(encoder.frame_bytes(), encoder.sequence_increment())
                .is_none(),
            "one frame in, one packet out"
        );

        let opus = encoder.encode(&frame.samples).unwrap();
        let audio = voice::AudioData::opus(frame.target, frame.sequence, opus.into(), false);
        let packet = voice::encode_outbound(&audio).unwrap();

        // serverbound header carries Opus (4) and target 0
        assert_eq!(packet[0], 4 << 5);
        assert_eq!(frame.sequence, 0);

        // the next burst frame advances the sequence
        client.add_sound(&[0u8; 1920], TARGET_NORMAL);
        let next = client
            .shared
            .outbound
            .take_frame(encoder.frame_bytes(), encoder.sequence_increment())
            .unwrap();
        assert_eq!(next.sequence, 2, "20 ms frames advance by two 10 ms units");
    }

    #[test]
    fn start_rejects_bad_frame_durations() {
        let client = MumbleClient::new(
            ClientConfig::new("localhost", "t").with_frame_duration(Duration::from_millis(15)),
        );
        assert!(matches!(
            client.start(),
            Err(ClientError::Audio(
                mumble_audio::AudioError::InvalidFrameDuration(15)
            ))
        ));
    }
}
