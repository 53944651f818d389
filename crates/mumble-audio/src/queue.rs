//! Per-user inbound sound queue.
//!
//! Each frame is decoded on arrival and stored with a logical playout time
//! derived from its sequence number within the current talk burst. The deque
//! is kept sorted by descending playout time: the tail always holds the
//! chunk that should play next, so late packets slot into place instead of
//! playing out of order.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use mumble_protocol::voice::AudioCodec;
use tracing::warn;

use crate::decoder::Decoder;
use crate::error::AudioError;
use crate::{pcm_duration, BYTES_PER_SAMPLE, SAMPLE_RATE, SEQUENCE_DURATION};

/// One decoded run of audio from a single sender.
#[derive(Debug, Clone)]
pub struct SoundChunk {
    /// s16le mono PCM at 48 kHz.
    pub pcm: Vec<u8>,
    /// Sequence number of the frame this chunk came from.
    pub sequence: i64,
    /// Byte length of `pcm`.
    pub size: usize,
    pub codec: AudioCodec,
    /// 5-bit voice target the sender used.
    pub target: u8,
    /// Wallclock arrival time.
    pub received_at: SystemTime,
    /// Logical playout time within the talk burst.
    pub playout_time: Instant,
}

impl SoundChunk {
    pub fn new(
        pcm: Vec<u8>,
        sequence: i64,
        codec: AudioCodec,
        target: u8,
        playout_time: Instant,
    ) -> Self {
        let size = pcm.len();
        SoundChunk {
            pcm,
            sequence,
            size,
            codec,
            target,
            received_at: SystemTime::now(),
            playout_time,
        }
    }

    /// Play duration of this chunk.
    pub fn duration(&self) -> Duration {
        pcm_duration(self.size)
    }

    /// Carve off the leading `duration` of audio, leaving a valid chunk for
    /// the remainder (its playout time advances by the carved duration).
    pub fn split(&mut self, duration: Duration) -> SoundChunk {
        let samples = (duration.as_secs_f64() * f64::from(SAMPLE_RATE)).round() as usize;
        let bytes = (samples * BYTES_PER_SAMPLE).min(self.pcm.len());

        let head = SoundChunk {
            pcm: self.pcm.drain(..bytes).collect(),
            sequence: self.sequence,
            size: bytes,
            codec: self.codec,
            target: self.target,
            received_at: self.received_at,
            playout_time: self.playout_time,
        };

        self.size -= bytes;
        self.playout_time += pcm_duration(bytes);
        head
    }
}

struct QueueState {
    queue: VecDeque<SoundChunk>,
    /// Burst anchor: the sequence and wallclock instant that started the
    /// current talk burst.
    start_sequence: Option<i64>,
    start_time: Option<Instant>,
    decoders: HashMap<AudioCodec, Decoder>,
}

/// Per-user storage of received audio frames; decodes on insert.
pub struct SoundQueue {
    state: Mutex<QueueState>,
    receive_sound: AtomicBool,
}

impl Default for SoundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SoundQueue {
    pub fn new() -> Self {
        SoundQueue {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                start_sequence: None,
                start_time: None,
                decoders: HashMap::new(),
            }),
            receive_sound: AtomicBool::new(true),
        }
    }

    /// Whether frames handed to [`add`](Self::add) are kept or discarded.
    pub fn set_receive_sound(&self, value: bool) {
        self.receive_sound.store(value, Ordering::Relaxed);
    }

    pub fn receive_sound(&self) -> bool {
        self.receive_sound.load(Ordering::Relaxed)
    }

    /// Decode and enqueue one frame. Returns a copy of the stored chunk, or
    /// `None` when receiving is disabled or the frame was dropped (unknown
    /// codec, decode failure).
    pub fn add(&self, payload: &[u8], sequence: i64, codec: AudioCodec, target: u8) -> Option<SoundChunk> {
        if !self.receive_sound() {
            return None;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.push_frame(payload, sequence, codec, target) {
            Ok(chunk) => Some(chunk),
            Err(AudioError::UnknownCodec(codec)) => {
                warn!(?codec, sequence, "dropping frame for unsupported codec");
                None
            }
            Err(err) => {
                warn!(sequence, ?codec, error = %err, "failed to decode audio frame");
                None
            }
        }
    }

    /// True when at least one chunk is queued.
    pub fn has_sound(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        !state.queue.is_empty()
    }

    /// Pop the next chunk to play. With a `duration`, a longer tail chunk is
    /// split and only the leading slice returned; the split is atomic under
    /// the queue lock.
    pub fn get_sound(&self, duration: Option<Duration>) -> Option<SoundChunk> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let tail = state.queue.back_mut()?;
        match duration {
            Some(duration) if tail.duration() > duration => Some(tail.split(duration)),
            _ => state.queue.pop_back(),
        }
    }

    /// Peek at the next chunk to play without removing it.
    pub fn first_sound(&self) -> Option<SoundChunk> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queue.back().cloned()
    }

    /// Drop all queued audio and the burst anchor.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queue.clear();
        state.start_sequence = None;
        state.start_time = None;
    }
}

impl QueueState {
    fn push_frame(
        &mut self,
        payload: &[u8],
        sequence: i64,
        codec: AudioCodec,
        target: u8,
    ) -> Result<SoundChunk, AudioError> {
        // Decode before touching the burst anchor so a bad frame leaves the
        // queue state untouched.
        let decoder = match self.decoders.entry(codec) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => match codec {
                AudioCodec::Opus => slot.insert(Decoder::new()?),
                other => return Err(AudioError::UnknownCodec(other)),
            },
        };
        let pcm = decoder.decode(payload)?;

        let playout_time = match (self.start_sequence, self.start_time) {
            (Some(start_sequence), Some(start_time)) if sequence > start_sequence => {
                start_time + SEQUENCE_DURATION * (sequence - start_sequence) as u32
            }
            _ => {
                // new talk burst (first frame, or the sequence restarted)
                let now = Instant::now();
                self.start_sequence = Some(sequence);
                self.start_time = Some(now);
                now
            }
        };

        let chunk = SoundChunk::new(pcm, sequence, codec, target, playout_time);
        self.queue.push_front(chunk.clone());

        // Bubble the new head toward the tail until the deque is sorted by
        // descending playout time again (tail = soonest).
        let mut i = 0;
        while i + 1 < self.queue.len() && self.queue[i].playout_time < self.queue[i + 1].playout_time
        {
            self.queue.swap(i, i + 1);
            i += 1;
        }

        Ok(chunk)
    }
}

impl std::fmt::Debug for SoundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundQueue")
            .field("receive_sound", &self.receive_sound())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Encoder;

    fn opus_frame(encoder: &mut Encoder) -> Vec<u8> {
        encoder.encode(&vec![0i16; encoder.frame_samples()]).unwrap()
    }

    #[test]
    fn reordered_frames_dequeue_in_sequence_order() {
        let mut encoder = Encoder::new(40_000, Duration::from_millis(20)).unwrap();
        let queue = SoundQueue::new();

        for sequence in [100, 102, 101] {
            let frame = opus_frame(&mut encoder);
            assert!(queue.add(&frame, sequence, AudioCodec::Opus, 0).is_some());
        }

        let order: Vec<i64> = std::iter::from_fn(|| queue.get_sound(None))
            .map(|chunk| chunk.sequence)
            .collect();
        assert_eq!(order, vec![100, 101, 102]);
    }

    #[test]
    fn adjacent_playout_times_stay_sorted() {
        let mut encoder = Encoder::new(40_000, Duration::from_millis(10)).unwrap();
        let queue = SoundQueue::new();
        for sequence in [5, 3, 9, 4, 7] {
            let frame = opus_frame(&mut encoder);
            queue.add(&frame, sequence, AudioCodec::Opus, 0);
        }

        let mut previous: Option<Instant> = None;
        while let Some(chunk) = queue.get_sound(None) {
            if let Some(prev) = previous {
                assert!(chunk.playout_time >= prev, "queue delivered out of order");
            }
            previous = Some(chunk.playout_time);
        }
    }

    #[test]
    fn burst_restarts_on_rewound_sequence() {
        let mut encoder = Encoder::new(40_000, Duration::from_millis(20)).unwrap();
        let queue = SoundQueue::new();

        let frame = opus_frame(&mut encoder);
        queue.add(&frame, 500, AudioCodec::Opus, 0).unwrap();

        // A much smaller sequence means a fresh talk burst: playout anchors
        // to the wallclock now, not 495 sequence steps before the old start.
        let before = Instant::now();
        let frame = opus_frame(&mut encoder);
        let chunk = queue.add(&frame, 5, AudioCodec::Opus, 0).unwrap();
        assert!(chunk.playout_time >= before);
    }

    #[test]
    fn first_sound_peeks_without_removing() {
        let mut encoder = Encoder::new(40_000, Duration::from_millis(10)).unwrap();
        let queue = SoundQueue::new();
        let frame = opus_frame(&mut encoder);
        queue.add(&frame, 1, AudioCodec::Opus, 0).unwrap();

        assert_eq!(queue.first_sound().unwrap().sequence, 1);
        assert!(queue.has_sound());
        assert_eq!(queue.get_sound(None).unwrap().sequence, 1);
        assert!(!queue.has_sound());
    }

    #[test]
    fn get_sound_splits_long_chunks() {
        let mut encoder = Encoder::new(40_000, Duration::from_millis(40)).unwrap();
        let queue = SoundQueue::new();
        let frame = opus_frame(&mut encoder);
        queue.add(&frame, 1, AudioCodec::Opus, 0).unwrap();

        let slice = queue.get_sound(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(slice.duration(), Duration::from_millis(10));

        let rest = queue.get_sound(None).unwrap();
        assert_eq!(rest.duration(), Duration::from_millis(30));
        assert_eq!(rest.playout_time, slice.playout_time + Duration::from_millis(10));
    }

    #[test]
    fn split_conserves_pcm_and_duration() {
        let pcm: Vec<u8> = (0..1920u32).map(|i| i as u8).collect(); // 20 ms
        let mut chunk = SoundChunk::new(pcm.clone(), 0, AudioCodec::Opus, 0, Instant::now());
        let original_duration = chunk.duration();
        let original_playout = chunk.playout_time;

        let head = chunk.split(Duration::from_millis(7));

        let mut joined = head.pcm.clone();
        joined.extend_from_slice(&chunk.pcm);
        assert_eq!(joined, pcm);
        assert_eq!(head.duration() + chunk.duration(), original_duration);
        assert_eq!(chunk.playout_time, original_playout + head.duration());
        assert_eq!(head.size + chunk.size, pcm.len());
    }

    #[test]
    fn unsupported_codec_is_dropped() {
        let queue = SoundQueue::new();
        assert!(queue.add(b"speex??", 1, AudioCodec::Speex, 0).is_none());
        assert!(!queue.has_sound());
    }

    #[test]
    fn decode_failure_leaves_burst_anchor_alone() {
        let mut encoder = Encoder::new(40_000, Duration::from_millis(20)).unwrap();
        let queue = SoundQueue::new();

        let frame = opus_frame(&mut encoder);
        let first = queue.add(&frame, 10, AudioCodec::Opus, 0).unwrap();

        // An empty payload is not a decodable Opus packet.
        assert!(queue.add(b"", 11, AudioCodec::Opus, 0).is_none());

        // The burst anchor still extrapolates from sequence 10.
        let frame = opus_frame(&mut encoder);
        let next = queue.add(&frame, 12, AudioCodec::Opus, 0).unwrap();
        assert_eq!(
            next.playout_time,
            first.playout_time + SEQUENCE_DURATION * 2
        );
    }

    #[test]
    fn disabled_queue_discards_frames() {
        let mut encoder = Encoder::new(40_000, Duration::from_millis(10)).unwrap();
        let queue = SoundQueue::new();
        queue.set_receive_sound(false);

        let frame = opus_frame(&mut encoder);
        assert!(queue.add(&frame, 1, AudioCodec::Opus, 0).is_none());
        assert!(!queue.has_sound());
    }
}
