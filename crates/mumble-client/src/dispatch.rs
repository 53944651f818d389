//! Inbound control message demultiplexer.
//!
//! Runs on the I/O worker. Applies state messages to the shadows, routes
//! tunnelled voice to the per-user queues, and surfaces everything else
//! through the callback registry. Undecodable frames are logged and
//! dropped; only a `Reject` ends the connection from here.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use mumble_protocol::control::{ControlMessage, MessageKind};
use mumble_protocol::proto::reject::RejectType;
use mumble_protocol::voice::{self, VoicePacket};
use tracing::{debug, info, warn};

use crate::commands::CommandKind;
use crate::error::ClientError;
use crate::state::{
    CodecVersions, ConnectionState, CryptMaterial, ServerVersion, Shared,
};
use crate::users::BlobAction;

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Handle one inbound control frame.
pub(crate) fn handle_control(
    shared: &Shared,
    kind: MessageKind,
    payload: Bytes,
) -> Result<(), ClientError> {
    let message = match ControlMessage::decode(kind, payload) {
        Ok(message) => message,
        Err(err) => {
            warn!(?kind, error = %err, "dropping undecodable control frame");
            return Ok(());
        }
    };

    match message {
        ControlMessage::Version(version) => {
            let mut server_info = shared.info.lock().unwrap_or_else(|e| e.into_inner());
            server_info.server_version = Some(ServerVersion {
                version: version.version.unwrap_or(0),
                release: version.release.unwrap_or_default(),
                os: version.os.unwrap_or_default(),
                os_version: version.os_version.unwrap_or_default(),
            });
        }
        ControlMessage::Ping(ping) => {
            if let Some(timestamp) = ping.timestamp {
                let rtt = unix_millis().saturating_sub(timestamp);
                shared.record_rtt(Duration::from_millis(rtt));
            }
        }
        ControlMessage::Reject(reject) => {
            let kind = reject.r#type.and_then(|t| RejectType::try_from(t).ok());
            let reason = reject.reason.unwrap_or_default();
            return Err(ClientError::Rejected { kind, reason });
        }
        ControlMessage::ServerSync(sync) => {
            {
                let mut server_info = shared.info.lock().unwrap_or_else(|e| e.into_inner());
                server_info.session = sync.session;
                server_info.max_bandwidth = sync.max_bandwidth.or(server_info.max_bandwidth);
                server_info.welcome_text = sync.welcome_text.or(server_info.welcome_text.take());
                server_info.permissions = sync.permissions.or(server_info.permissions);
            }
            if let Some(session) = sync.session {
                shared.users.set_local_session(session);
            }
            info!(session = ?sync.session, "handshake complete");
            shared.set_state(ConnectionState::Ready);
            shared.callbacks.fire_connected();
        }
        ControlMessage::ServerConfig(config) => {
            let mut server_info = shared.info.lock().unwrap_or_else(|e| e.into_inner());
            if config.message_length.is_some() {
                server_info.max_message_length = config.message_length;
            }
            if config.image_message_length.is_some() {
                server_info.max_image_length = config.image_message_length;
            }
            if config.allow_html.is_some() {
                server_info.allow_html = config.allow_html;
            }
            if config.max_users.is_some() {
                server_info.max_users = config.max_users;
            }
            if config.welcome_text.is_some() {
                server_info.welcome_text = config.welcome_text;
            }
            if config.max_bandwidth.is_some() {
                server_info.max_bandwidth = config.max_bandwidth;
            }
        }
        ControlMessage::CryptSetup(crypt) => {
            let mut server_info = shared.info.lock().unwrap_or_else(|e| e.into_inner());
            server_info.crypt = Some(CryptMaterial {
                key: crypt.key.unwrap_or_default(),
                client_nonce: crypt.client_nonce.unwrap_or_default(),
                server_nonce: crypt.server_nonce.unwrap_or_default(),
            });
        }
        ControlMessage::CodecVersion(codec) => {
            let mut server_info = shared.info.lock().unwrap_or_else(|e| e.into_inner());
            server_info.codec_versions = Some(CodecVersions {
                alpha: codec.alpha,
                beta: codec.beta,
                prefer_alpha: codec.prefer_alpha,
                opus: codec.opus.unwrap_or(false),
            });
        }
        ControlMessage::ChannelState(state) => {
            let actions = shared.channels.apply_state(&state, &shared.callbacks);
            process_blob_actions(shared, actions);
        }
        ControlMessage::ChannelRemove(remove) => {
            shared.channels.remove(remove.channel_id, &shared.callbacks);
        }
        ControlMessage::UserState(state) => {
            let actions = shared.users.apply_state(&state, &shared.callbacks);
            process_blob_actions(shared, actions);
        }
        ControlMessage::UserRemove(remove) => {
            shared.users.remove(&remove, &shared.callbacks);
        }
        ControlMessage::TextMessage(message) => {
            shared.callbacks.fire_text_message(&message);
        }
        ControlMessage::PermissionDenied(denied) => {
            shared.callbacks.fire_permission_denied(&denied);
        }
        ControlMessage::UdpTunnel(packet) => {
            handle_voice(shared, &packet);
        }
        ControlMessage::Raw { kind, payload } => {
            match kind {
                MessageKind::Acl => shared.callbacks.fire_acl_received(&payload),
                MessageKind::ContextAction => shared.callbacks.fire_context_action(&payload),
                _ => {}
            }
            shared.callbacks.fire_raw_control(kind, &payload);
        }
    }

    Ok(())
}

/// Store inline blobs; fetch the rest by hash, at most once per hash.
fn process_blob_actions(shared: &Shared, actions: Vec<BlobAction>) {
    for action in actions {
        match action.inline {
            Some(bytes) => shared.blobs.store(&action.hash, bytes),
            None => {
                if let Some(request) = shared.blobs.request(&action.hash, action.kind) {
                    // fire-and-forget; nobody waits on blob fetches
                    if let Err(err) = shared.commands.try_submit(CommandKind::RequestBlob(request)) {
                        debug!(error = %err, "blob request not queued");
                    }
                }
            }
        }
    }
}

/// Voice is lossy: anything undecodable is dropped without ceremony.
fn handle_voice(shared: &Shared, packet: &[u8]) {
    match voice::decode_inbound(packet) {
        Ok(VoicePacket::Audio(audio)) => {
            shared.users.dispatch_voice(&audio, &shared.callbacks);
        }
        Ok(VoicePacket::Ping { .. }) => {}
        Err(err) => {
            debug!(error = %err, "dropping malformed voice packet");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use mumble_protocol::control::encode_message;
    use mumble_protocol::proto;
    use mumble_protocol::voice::AudioData;

    use super::*;
    use crate::commands::QueuedCommand;
    use crate::config::ClientConfig;

    fn shared() -> (Arc<Shared>, tokio::sync::mpsc::Receiver<QueuedCommand>) {
        Shared::new(ClientConfig::new("localhost", "test").with_receive_sound(true))
    }

    fn body<M: prost::Message>(kind: MessageKind, msg: &M) -> Bytes {
        // strip the 6-byte frame header
        Bytes::from(encode_message(kind, msg).split_off(6))
    }

    #[test]
    fn server_sync_promotes_to_ready_and_fires_connected() {
        let (shared, _rx) = shared();
        let connected = Arc::new(AtomicUsize::new(0));
        let counter = connected.clone();
        shared.callbacks.on_connected(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let sync = proto::ServerSync {
            session: Some(42),
            welcome_text: Some("hi".into()),
            ..Default::default()
        };
        handle_control(&shared, MessageKind::ServerSync, body(MessageKind::ServerSync, &sync))
            .unwrap();

        assert_eq!(shared.state(), ConnectionState::Ready);
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(shared.users.local_session(), Some(42));
        assert_eq!(shared.server_info().welcome_text.as_deref(), Some("hi"));
    }

    #[test]
    fn reject_is_fatal() {
        let (shared, _rx) = shared();
        let reject = proto::Reject {
            r#type: Some(RejectType::ServerFull as i32),
            reason: Some("full".into()),
        };
        let err = handle_control(&shared, MessageKind::Reject, body(MessageKind::Reject, &reject))
            .unwrap_err();
        match err {
            ClientError::Rejected { kind, reason } => {
                assert_eq!(kind, Some(RejectType::ServerFull));
                assert_eq!(reason, "full");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn server_config_overrides_limits() {
        let (shared, _rx) = shared();
        let config = proto::ServerConfig {
            message_length: Some(128),
            image_message_length: Some(2048),
            ..Default::default()
        };
        handle_control(
            &shared,
            MessageKind::ServerConfig,
            body(MessageKind::ServerConfig, &config),
        )
        .unwrap();

        let info = shared.server_info();
        assert_eq!(info.max_message_length(), 128);
        assert_eq!(info.max_image_length(), 2048);
    }

    #[test]
    fn undecodable_frame_is_dropped_not_fatal() {
        let (shared, _rx) = shared();
        handle_control(
            &shared,
            MessageKind::ServerSync,
            Bytes::from_static(b"\x08"),
        )
        .unwrap();
        assert_eq!(shared.state(), ConnectionState::Idle);
    }

    #[test]
    fn channel_hash_without_inline_queues_one_blob_request() {
        let (shared, mut rx) = shared();
        let state = proto::ChannelState {
            channel_id: Some(1),
            description_hash: Some(vec![0xEE; 20]),
            ..Default::default()
        };
        let payload = body(MessageKind::ChannelState, &state);
        handle_control(&shared, MessageKind::ChannelState, payload.clone()).unwrap();
        // the same hash again must not fetch twice
        handle_control(&shared, MessageKind::ChannelState, payload).unwrap();

        let cmd = rx.try_recv().expect("one blob request queued");
        assert!(matches!(cmd.kind, CommandKind::RequestBlob(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn inline_description_lands_in_blob_cache() {
        let (shared, mut rx) = shared();
        let state = proto::ChannelState {
            channel_id: Some(1),
            description: Some("motd".into()),
            description_hash: Some(vec![0xAB; 20]),
            ..Default::default()
        };
        handle_control(
            &shared,
            MessageKind::ChannelState,
            body(MessageKind::ChannelState, &state),
        )
        .unwrap();

        assert_eq!(
            shared.blobs.get(&[0xAB; 20]).unwrap(),
            Bytes::from_static(b"motd")
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn tunnelled_voice_reaches_the_user_queue_and_callback() {
        let (shared, _rx) = shared();

        // the sender must exist in the user table
        let user = proto::UserState {
            session: Some(7),
            name: Some("echo".into()),
            ..Default::default()
        };
        handle_control(&shared, MessageKind::UserState, body(MessageKind::UserState, &user))
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        shared.callbacks.on_sound_received(move |user, chunk| {
            sink.lock()
                .unwrap()
                .push((user.session, chunk.sequence, chunk.pcm.len()));
        });

        // one 20 ms Opus frame through the real encoder
        let mut encoder =
            mumble_audio::Encoder::new(40_000, Duration::from_millis(20)).unwrap();
        let opus = encoder.encode(&vec![0i16; encoder.frame_samples()]).unwrap();
        let audio = AudioData {
            session: Some(7),
            ..AudioData::opus(0, 64, opus.into(), false)
        };
        let mut packet = vec![audio.codec.id() << 5];
        mumble_protocol::varint::write(&mut packet, 7); // session
        packet.extend_from_slice(&voice::encode_outbound(&audio).unwrap()[1..]);

        handle_control(&shared, MessageKind::UdpTunnel, Bytes::from(packet)).unwrap();

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1, "sound callback must fire exactly once");
        let (session, sequence, pcm_len) = events[0];
        assert_eq!(session, 7);
        assert_eq!(sequence, 64);
        assert_eq!(pcm_len, 960 * 2, "20 ms of mono s16le is 960 samples");

        let queued = shared.users.get(7).unwrap().sound.get_sound(None).unwrap();
        assert_eq!(queued.sequence, 64);
    }

    #[test]
    fn raw_kinds_surface_through_raw_control() {
        let (shared, _rx) = shared();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        shared.callbacks.on_raw_control(move |kind, payload| {
            *sink.lock().unwrap() = Some((kind, payload.to_vec()));
        });

        handle_control(&shared, MessageKind::UserStats, Bytes::from_static(b"\x08\x07"))
            .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, Some((MessageKind::UserStats, b"\x08\x07".to_vec())));
    }

    #[test]
    fn ping_reply_records_rtt() {
        let (shared, _rx) = shared();
        let ping = proto::Ping {
            timestamp: Some(unix_millis().saturating_sub(15)),
            ..Default::default()
        };
        handle_control(&shared, MessageKind::Ping, body(MessageKind::Ping, &ping)).unwrap();
        assert!(shared.last_rtt().unwrap() >= Duration::from_millis(15));
    }
}
