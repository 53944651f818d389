//! Outbound audio staging and pacing state.
//!
//! The host pushes raw PCM through [`OutboundAudio::add_sound`]; the pacer
//! task pulls exactly one encoder frame per tick with
//! [`OutboundAudio::take_frame`]. Sequence numbers count 10 ms units within
//! a talk burst and restart after the pacer has been idle for a while.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// Cap on buffered-but-unsent audio: one second. Beyond it the oldest
/// frames are dropped and the lagged flag raised.
const MAX_BUFFERED_BYTES: usize = mumble_audio::SAMPLE_RATE as usize * mumble_audio::BYTES_PER_SAMPLE;

/// Idle gap after which the next frame starts a new talk burst.
const SEQUENCE_RESET_INTERVAL: Duration = Duration::from_secs(5);

/// PCM staged for one voice target.
struct PcmChunk {
    pcm: VecDeque<u8>,
    target: u8,
}

struct OutboundState {
    chunks: VecDeque<PcmChunk>,
    buffered: usize,
    sequence: i64,
    last_frame: Option<Instant>,
}

/// One frame's worth of samples ready for the encoder.
pub(crate) struct OutboundFrame {
    pub samples: Vec<i16>,
    pub target: u8,
    pub sequence: i64,
}

pub(crate) struct OutboundAudio {
    state: Mutex<OutboundState>,
    lagged: AtomicBool,
}

impl OutboundAudio {
    pub(crate) fn new() -> Self {
        OutboundAudio {
            state: Mutex::new(OutboundState {
                chunks: VecDeque::new(),
                buffered: 0,
                sequence: 0,
                last_frame: None,
            }),
            lagged: AtomicBool::new(false),
        }
    }

    /// Stage PCM (s16le, 48 kHz mono) for transmission to `target`.
    pub(crate) fn add_sound(&self, pcm: &[u8], target: u8) {
        if pcm.is_empty() {
            return;
        }
        if pcm.len() % 2 != 0 {
            warn!(len = pcm.len(), "dropping PCM with a partial sample");
            return;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // merge into the newest chunk when the target matches
        match state.chunks.back_mut() {
            Some(chunk) if chunk.target == target => chunk.pcm.extend(pcm.iter().copied()),
            _ => state.chunks.push_back(PcmChunk {
                pcm: pcm.iter().copied().collect(),
                target,
            }),
        }
        state.buffered += pcm.len();

        // overflow drops the oldest audio first
        while state.buffered > MAX_BUFFERED_BYTES {
            let excess = state.buffered - MAX_BUFFERED_BYTES;
            let Some(front) = state.chunks.front_mut() else {
                break;
            };
            let drop_len = excess.min(front.pcm.len());
            front.pcm.drain(..drop_len);
            let front_is_empty = front.pcm.is_empty();
            state.buffered -= drop_len;
            if front_is_empty {
                state.chunks.pop_front();
            }
            self.lagged.store(true, Ordering::Relaxed);
        }
    }

    /// Pull one frame of `frame_bytes` for encoding, if enough same-target
    /// audio is staged. When the target changes mid-frame the shortfall is
    /// zero-padded so the next target starts on a frame boundary.
    pub(crate) fn take_frame(&self, frame_bytes: usize, sequence_increment: i64) -> Option<OutboundFrame> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let target = state.chunks.front()?.target;
        let available: usize = state
            .chunks
            .iter()
            .take_while(|chunk| chunk.target == target)
            .map(|chunk| chunk.pcm.len())
            .sum();
        let target_switches = available < state.buffered;

        if available < frame_bytes && !target_switches {
            // a partial tail frame waits for more audio
            return None;
        }

        let mut bytes = Vec::with_capacity(frame_bytes);
        while bytes.len() < frame_bytes {
            let Some(front) = state.chunks.front_mut() else {
                break;
            };
            if front.target != target {
                break;
            }
            let want = frame_bytes - bytes.len();
            let take = want.min(front.pcm.len());
            bytes.extend(front.pcm.drain(..take));
            if front.pcm.is_empty() {
                state.chunks.pop_front();
            }
        }
        state.buffered -= bytes.len();
        bytes.resize(frame_bytes, 0);

        let now = Instant::now();
        let idle_too_long = state
            .last_frame
            .map_or(true, |last| now.duration_since(last) > SEQUENCE_RESET_INTERVAL);
        if idle_too_long {
            state.sequence = 0;
        }
        let sequence = state.sequence;
        state.sequence += sequence_increment;
        state.last_frame = Some(now);

        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Some(OutboundFrame {
            samples,
            target,
            sequence,
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.chunks.is_empty()
    }

    /// Sticky overflow indicator; reading clears it.
    pub(crate) fn take_lagged(&self) -> bool {
        self.lagged.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.chunks.clear();
        state.buffered = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_BYTES: usize = 960; // 10 ms

    #[test]
    fn frames_come_out_in_submission_order() {
        let outbound = OutboundAudio::new();
        let first: Vec<u8> = (0..FRAME_BYTES).map(|i| i as u8).collect();
        let second: Vec<u8> = (0..FRAME_BYTES).map(|i| (i + 1) as u8).collect();
        outbound.add_sound(&first, 0);
        outbound.add_sound(&second, 0);

        let a = outbound.take_frame(FRAME_BYTES, 1).unwrap();
        let b = outbound.take_frame(FRAME_BYTES, 1).unwrap();
        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
        assert_eq!(a.samples[0], i16::from_le_bytes([0, 1]));
        assert!(outbound.take_frame(FRAME_BYTES, 1).is_none());
    }

    #[test]
    fn partial_frame_waits_for_more_audio() {
        let outbound = OutboundAudio::new();
        outbound.add_sound(&vec![0u8; FRAME_BYTES / 2], 0);
        assert!(outbound.take_frame(FRAME_BYTES, 1).is_none());

        outbound.add_sound(&vec![0u8; FRAME_BYTES / 2], 0);
        assert!(outbound.take_frame(FRAME_BYTES, 1).is_some());
    }

    #[test]
    fn target_switch_pads_the_short_frame() {
        let outbound = OutboundAudio::new();
        outbound.add_sound(&vec![0x11; FRAME_BYTES / 2], 0);
        outbound.add_sound(&vec![0x22; FRAME_BYTES], 3);

        let padded = outbound.take_frame(FRAME_BYTES, 1).unwrap();
        assert_eq!(padded.target, 0);
        assert_eq!(padded.samples.len(), FRAME_BYTES / 2);
        assert_eq!(padded.samples[FRAME_BYTES / 4 - 1], i16::from_le_bytes([0x11, 0x11]));
        assert_eq!(*padded.samples.last().unwrap(), 0);

        let whisper = outbound.take_frame(FRAME_BYTES, 1).unwrap();
        assert_eq!(whisper.target, 3);
    }

    #[test]
    fn overflow_drops_oldest_and_sets_lagged() {
        let outbound = OutboundAudio::new();
        assert!(!outbound.take_lagged());

        outbound.add_sound(&vec![0x01; MAX_BUFFERED_BYTES], 0);
        outbound.add_sound(&vec![0x02; FRAME_BYTES], 0);

        assert!(outbound.take_lagged());
        // flag clears on read
        assert!(!outbound.take_lagged());

        // the oldest bytes were dropped, so the buffer tail (0x02) survives
        let mut last = None;
        while let Some(frame) = outbound.take_frame(FRAME_BYTES, 1) {
            last = Some(frame);
        }
        assert_eq!(*last.unwrap().samples.last().unwrap(), i16::from_le_bytes([0x02, 0x02]));
    }

    #[test]
    fn odd_length_pcm_is_rejected() {
        let outbound = OutboundAudio::new();
        outbound.add_sound(&[0u8; 3], 0);
        assert!(outbound.is_empty());
    }
}
