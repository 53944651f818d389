//! TLS transport, handshake, and the connect/reconnect supervisor.
//!
//! One reader loop owns the socket, frame decoding, and the command drain;
//! a writer task serialises everything onto the wire and carries the ping
//! keepalive; a pacer task emits outbound voice frames. The supervisor
//! wraps a connection attempt in the reconnect policy.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mumble_protocol::control::{self, encode_frame, encode_message, MessageKind};
use mumble_protocol::voice::{self, AudioData};
use mumble_protocol::{proto, ProtocolError, CLIENT_PROTOCOL_VERSION};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn};

use crate::commands::QueuedCommand;
use crate::config::ClientConfig;
use crate::dispatch::{handle_control, unix_millis};
use crate::error::ClientError;
use crate::state::{ConnectionState, Shared};

/// Control-channel keepalive cadence.
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Three missed pings and the connection is considered dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const RECONNECT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(32);
const MAX_RECONNECT_ATTEMPTS: u32 = 8;

/// How long a closing connection keeps draining staged outbound audio.
const OUTBOUND_DRAIN_DEADLINE: Duration = Duration::from_millis(200);

/// Connect/reconnect loop. Runs until orderly shutdown, a fatal error, or
/// the reconnect budget is spent; then fails all queued commands and
/// settles in `Closed`.
pub(crate) async fn run_supervisor(
    shared: Arc<Shared>,
    mut command_rx: mpsc::Receiver<QueuedCommand>,
) {
    let mut attempts = 0u32;

    loop {
        if shared.is_closing() {
            break;
        }
        shared.set_state(ConnectionState::Connecting);

        match run_connection(&shared, &mut command_rx).await {
            Ok(()) => break,
            Err(err) => {
                let was_ready = shared.state() == ConnectionState::Ready;
                let fatal = matches!(err, ClientError::Rejected { .. } | ClientError::Tls(_));
                warn!(error = %err, "connection ended");
                shared.callbacks.fire_disconnected();
                shared.clear_session();

                if fatal || !shared.config.reconnect || shared.is_closing() {
                    break;
                }
                attempts = if was_ready { 1 } else { attempts + 1 };
                if attempts > MAX_RECONNECT_ATTEMPTS {
                    error!(attempts, "reconnect budget exhausted, giving up");
                    break;
                }

                let backoff = backoff_delay(attempts);
                info!(attempt = attempts, ?backoff, "reconnecting after backoff");
                let mut state_rx = shared.state_tx.subscribe();
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = state_rx.wait_for(|s| *s == ConnectionState::Closing) => break,
                }
            }
        }
    }

    shared.commands.close();
    command_rx.close();
    while let Ok(cmd) = command_rx.try_recv() {
        cmd.complete(Err(ClientError::Disconnected));
    }
    shared.set_state(ConnectionState::Closed);
}

fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u32 << (attempt - 1).min(16);
    (RECONNECT_BACKOFF_BASE * factor).min(RECONNECT_BACKOFF_CAP)
}

/// One full connection: TLS, handshake, then the read/dispatch loop.
/// `Ok(())` means shutdown was requested; every other exit is an error.
async fn run_connection(
    shared: &Arc<Shared>,
    command_rx: &mut mpsc::Receiver<QueuedCommand>,
) -> Result<(), ClientError> {
    let config = &shared.config;
    info!(host = %config.host, port = config.port, "connecting");

    let tcp = tokio::time::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((config.host.as_str(), config.port)),
    )
    .await
    .map_err(|_| ClientError::Timeout)??;
    tcp.set_nodelay(true)?;

    let connector = build_tls_connector(config)?;
    let server_name = resolve_server_name(&config.host)?;
    let mut tls = connector.connect(server_name, tcp).await?;
    info!("TLS established");
    shared.set_state(ConnectionState::Handshaking);

    tls.write_all(&encode_message(MessageKind::Version, &version_message(config)))
        .await?;
    tls.write_all(&encode_message(
        MessageKind::Authenticate,
        &authenticate_message(config),
    ))
    .await?;

    let (mut read_half, write_half) = tokio::io::split(tls);
    let (writer_tx, writer_rx) = mpsc::channel::<Vec<u8>>(64);
    let ping = Arc::new(PingTracker::new());

    let mut writer_handle = tokio::spawn(writer_task(write_half, writer_rx, ping.clone()));
    let pacer_handle = tokio::spawn(pacer_task(shared.clone(), writer_tx.clone()));

    let mut buf = BytesMut::with_capacity(8192);
    let mut state_rx = shared.state_tx.subscribe();

    let result = loop {
        tokio::select! {
            read = read_half.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break Err(ClientError::Disconnected),
                    Ok(_) => {
                        if let Err(err) = drain_frames(shared, &ping, &mut buf) {
                            break Err(err);
                        }
                    }
                    Err(err) => break Err(err.into()),
                }
            }
            cmd = command_rx.recv() => {
                match cmd {
                    Some(cmd) => match writer_tx.send(cmd.kind.encode()).await {
                        Ok(()) => cmd.complete(Ok(())),
                        Err(_) => {
                            cmd.complete(Err(ClientError::Disconnected));
                            break Err(ClientError::Disconnected);
                        }
                    },
                    // all queue handles dropped; treat like a shutdown
                    None => break Ok(()),
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow_and_update() == ConnectionState::Closing {
                    break Ok(());
                }
            }
            _ = &mut writer_handle => {
                // the writer only exits on write failure or missed pongs
                break Err(ClientError::Disconnected);
            }
        }
    };

    if result.is_ok() {
        let deadline = Instant::now() + OUTBOUND_DRAIN_DEADLINE;
        while !shared.outbound.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    pacer_handle.abort();
    writer_handle.abort();
    result
}

/// Decode every complete frame currently buffered.
fn drain_frames(
    shared: &Shared,
    ping: &PingTracker,
    buf: &mut BytesMut,
) -> Result<(), ClientError> {
    loop {
        match control::try_decode_frame(buf) {
            Ok(Some((kind, payload))) => {
                if kind == MessageKind::Ping {
                    ping.record_pong();
                }
                handle_control(shared, kind, payload)?;
            }
            Ok(None) => return Ok(()),
            Err(ProtocolError::UnknownMessageKind(kind)) => {
                warn!(kind, "skipping control frame of unknown type");
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Owns the write half: serialises frames from the channel and carries the
/// ping keepalive. Exits on write failure or when pongs stop arriving.
async fn writer_task(
    mut write_half: WriteHalf<TlsStream<TcpStream>>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    ping: Arc<PingTracker>,
) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if ping.pong_overdue() {
                    error!("no ping reply within {PONG_TIMEOUT:?}, dropping connection");
                    break;
                }
                if let Err(err) = write_half.write_all(&ping.ping_frame()).await {
                    error!(error = %err, "keepalive write failed");
                    break;
                }
            }
            data = rx.recv() => {
                match data {
                    Some(data) => {
                        if let Err(err) = write_half.write_all(&data).await {
                            error!(error = %err, "control write failed");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

/// Ticks at the configured frame duration and turns staged PCM into
/// tunnelled voice packets.
async fn pacer_task(shared: Arc<Shared>, writer_tx: mpsc::Sender<Vec<u8>>) {
    let mut encoder = match mumble_audio::Encoder::new(
        shared.config.opus_bitrate,
        shared.config.frame_duration,
    ) {
        Ok(encoder) => encoder,
        Err(err) => {
            error!(error = %err, "outbound audio disabled: encoder unavailable");
            return;
        }
    };

    let mut interval = tokio::time::interval(encoder.frame_duration());

    loop {
        interval.tick().await;
        let Some(frame) =
            shared.outbound.take_frame(encoder.frame_bytes(), encoder.sequence_increment())
        else {
            continue;
        };

        let opus = match encoder.encode(&frame.samples) {
            Ok(opus) => opus,
            Err(err) => {
                warn!(error = %err, "dropping outbound frame: encode failed");
                continue;
            }
        };

        let audio = AudioData::opus(frame.target, frame.sequence, opus.into(), false);
        match voice::encode_outbound(&audio) {
            Ok(packet) => {
                if writer_tx
                    .send(encode_frame(MessageKind::UdpTunnel, &packet))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => warn!(error = %err, "dropping outbound frame: packet encode failed"),
        }
    }
}

/// Keepalive bookkeeping shared between the writer (sends) and the
/// dispatcher (replies).
pub(crate) struct PingTracker {
    last_pong: Mutex<Instant>,
    sent: AtomicU32,
    received: AtomicU32,
}

impl PingTracker {
    pub(crate) fn new() -> Self {
        PingTracker {
            last_pong: Mutex::new(Instant::now()),
            sent: AtomicU32::new(0),
            received: AtomicU32::new(0),
        }
    }

    pub(crate) fn record_pong(&self) {
        *self.last_pong.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pong_overdue(&self) -> bool {
        self.last_pong
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
            > PONG_TIMEOUT
    }

    /// Build the next keepalive frame. UDP stats stay zero: voice runs
    /// through the TCP tunnel.
    pub(crate) fn ping_frame(&self) -> Vec<u8> {
        let sent = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        let received = self.received.load(Ordering::Relaxed);
        let msg = proto::Ping {
            timestamp: Some(unix_millis()),
            good: Some(received),
            lost: Some(sent.saturating_sub(received)),
            udp_packets: Some(0),
            tcp_packets: Some(received),
            ..Default::default()
        };
        encode_message(MessageKind::Ping, &msg)
    }
}

fn resolve_server_name(host: &str) -> Result<ServerName<'static>, ClientError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_owned())
        .map_err(|_| ClientError::InvalidServerName(host.to_owned()))
}

fn build_tls_connector(config: &ClientConfig) -> Result<TlsConnector, ClientError> {
    let builder = if config.accept_invalid_certs {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder().with_root_certificates(roots)
    };

    let tls_config = match (&config.certfile, &config.keyfile) {
        (Some(certfile), Some(keyfile)) => {
            let certs = load_certs(certfile)?;
            let key = load_key(keyfile)?;
            builder.with_client_auth_cert(certs, key)?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let data = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(data.as_slice());
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut reader).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(ClientError::Transport(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("no certificates found in {}", path.display()),
        )));
    }
    Ok(certs)
}

fn load_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    let data = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(data.as_slice());
    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            Some(_) => continue,
            None => {
                return Err(ClientError::Transport(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("no private key found in {}", path.display()),
                )))
            }
        }
    }
}

fn version_message(config: &ClientConfig) -> proto::Version {
    proto::Version {
        version: Some(CLIENT_PROTOCOL_VERSION),
        release: Some(config.client_release.clone()),
        os: Some(std::env::consts::OS.to_string()),
        os_version: None,
    }
}

fn authenticate_message(config: &ClientConfig) -> proto::Authenticate {
    proto::Authenticate {
        username: Some(config.username.clone()),
        password: config.password.clone(),
        tokens: config.tokens.clone(),
        celt_versions: Vec::new(),
        opus: Some(true),
    }
}

/// Accepts whatever certificate the server presents. Mumble servers very
/// commonly run self-signed; signature validity is still enforced.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
