//! Voice packet codec.
//!
//! Voice packets ride the control channel as `UDPTunnel` payloads. Layout:
//!
//! ```text
//! [header: 3 bits kind | 5 bits target]
//! [varint session]        clientbound only
//! [varint sequence]
//! frames (codec dependent)
//! [positional audio tail] optional, 3 x f32
//! ```
//!
//! Opus carries a single frame behind a 13-bit length header whose `0x2000`
//! bit marks the end of a transmission. The legacy codecs (CELT alpha/beta,
//! Speex) chain byte-length-prefixed frames with a `0x80` continuation bit.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::varint;

/// Packet kind for ping packets (shares the header space with codecs).
const KIND_PING: u8 = 1;

/// Opus length-header bit marking the last frame of a transmission.
const OPUS_TERMINATOR: u16 = 0x2000;

/// Loopback voice target; 1..=30 are whisper slots, 0 is normal talk.
pub const TARGET_SERVER_LOOPBACK: u8 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AudioCodec {
    CeltAlpha = 0,
    Speex = 2,
    CeltBeta = 3,
    Opus = 4,
}

impl AudioCodec {
    pub fn from_kind(kind: u8) -> Option<Self> {
        match kind {
            0 => Some(Self::CeltAlpha),
            2 => Some(Self::Speex),
            3 => Some(Self::CeltBeta),
            4 => Some(Self::Opus),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

/// A decoded voice packet.
#[derive(Debug, Clone, PartialEq)]
pub enum VoicePacket {
    /// Opaque timestamp echoed back by the peer.
    Ping { timestamp: i64 },
    Audio(AudioData),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    pub codec: AudioCodec,
    /// 5-bit voice target (0 normal, 1..=30 whisper, 31 loopback).
    pub target: u8,
    /// Sender session; `None` on serverbound packets.
    pub session: Option<u32>,
    /// Sequence number of the first frame in this packet.
    pub sequence: i64,
    pub frames: Vec<Bytes>,
    pub end_of_transmission: bool,
    /// Raw positional-audio tail, when present.
    pub positional: Option<Bytes>,
}

impl AudioData {
    /// An outbound Opus packet carrying a single encoded frame.
    pub fn opus(target: u8, sequence: i64, frame: Bytes, end_of_transmission: bool) -> Self {
        AudioData {
            codec: AudioCodec::Opus,
            target,
            session: None,
            sequence,
            frames: vec![frame],
            end_of_transmission,
            positional: None,
        }
    }
}

/// Decode a clientbound voice packet (the session varint is present).
pub fn decode_inbound(payload: &[u8]) -> Result<VoicePacket, ProtocolError> {
    let (&header, mut rest) = payload
        .split_first()
        .ok_or(ProtocolError::TruncatedVoicePacket)?;
    let kind = header >> 5;
    let target = header & 0x1F;

    if kind == KIND_PING {
        let timestamp = varint::read(&mut rest)?;
        return Ok(VoicePacket::Ping { timestamp });
    }

    let codec = AudioCodec::from_kind(kind).ok_or(ProtocolError::UnknownVoiceKind(kind))?;
    let session = varint::read(&mut rest)? as u32;
    let sequence = varint::read(&mut rest)?;

    let mut frames = Vec::new();
    let mut end_of_transmission = false;

    match codec {
        AudioCodec::Opus => {
            let header = varint::read(&mut rest)? as u16;
            end_of_transmission = header & OPUS_TERMINATOR != 0;
            let len = (header & !OPUS_TERMINATOR) as usize;
            if rest.len() < len {
                return Err(ProtocolError::TruncatedVoicePacket);
            }
            frames.push(Bytes::copy_from_slice(&rest[..len]));
            rest = &rest[len..];
        }
        _ => loop {
            let (&len_byte, tail) = rest
                .split_first()
                .ok_or(ProtocolError::TruncatedVoicePacket)?;
            let len = (len_byte & 0x7F) as usize;
            if tail.len() < len {
                return Err(ProtocolError::TruncatedVoicePacket);
            }
            frames.push(Bytes::copy_from_slice(&tail[..len]));
            rest = &tail[len..];
            if len_byte & 0x80 == 0 {
                break;
            }
            if rest.is_empty() {
                // continuation flagged but the packet ends here; tolerate it
                break;
            }
        },
    }

    let positional = if rest.is_empty() {
        None
    } else {
        Some(Bytes::copy_from_slice(rest))
    };

    Ok(VoicePacket::Audio(AudioData {
        codec,
        target,
        session: Some(session),
        sequence,
        frames,
        end_of_transmission,
        positional,
    }))
}

/// Encode a serverbound voice packet (no session varint).
pub fn encode_outbound(audio: &AudioData) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(
        16 + audio.frames.iter().map(|f| f.len() + 2).sum::<usize>()
            + audio.positional.as_ref().map_or(0, |p| p.len()),
    );
    buf.push((audio.codec.id() << 5) | (audio.target & 0x1F));
    varint::write(&mut buf, audio.sequence);

    match audio.codec {
        AudioCodec::Opus => {
            let frame = audio.frames.first().map(Bytes::as_ref).unwrap_or(&[]);
            if frame.len() >= OPUS_TERMINATOR as usize {
                return Err(ProtocolError::VoiceFrameTooLarge(frame.len()));
            }
            let mut header = frame.len() as u16;
            if audio.end_of_transmission {
                header |= OPUS_TERMINATOR;
            }
            varint::write(&mut buf, i64::from(header));
            buf.extend_from_slice(frame);
        }
        _ => {
            let mut iter = audio.frames.iter().peekable();
            while let Some(frame) = iter.next() {
                if frame.len() > 0x7F {
                    return Err(ProtocolError::VoiceFrameTooLarge(frame.len()));
                }
                let continuation = if iter.peek().is_some() { 0x80 } else { 0 };
                buf.push(continuation | frame.len() as u8);
                buf.extend_from_slice(frame);
            }
        }
    }

    if let Some(positional) = &audio.positional {
        buf.extend_from_slice(positional);
    }
    Ok(buf)
}

/// Encode a serverbound voice ping.
pub fn encode_ping(timestamp: i64) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(11);
    buf.put_u8(KIND_PING << 5);
    let mut tail = Vec::with_capacity(10);
    varint::write(&mut tail, timestamp);
    buf.extend_from_slice(&tail);
    buf.to_vec()
}
