//! Audio pipeline pieces: Opus encode/decode wrappers and the per-user
//! jitter-ordered inbound sound queue.

use std::time::Duration;

pub mod decoder;
pub mod encoder;
pub mod error;
pub mod queue;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use error::AudioError;
pub use queue::{SoundChunk, SoundQueue};

/// The only sample rate the pipeline speaks.
pub const SAMPLE_RATE: u32 = 48_000;

/// Mono everywhere; stereo is not supported.
pub const CHANNELS: u32 = 1;

/// s16le PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// One sequence unit of audio (voice packet sequence numbers count in
/// 10 ms steps).
pub const SEQUENCE_DURATION: Duration = Duration::from_millis(10);

/// Default outbound Opus bitrate.
pub const DEFAULT_BITRATE: i32 = 40_000;

/// Samples in one millisecond of audio.
pub const SAMPLES_PER_MS: usize = SAMPLE_RATE as usize / 1000;

/// Convert a byte count of s16le PCM into its play duration.
pub fn pcm_duration(bytes: usize) -> Duration {
    Duration::from_secs_f64(bytes as f64 / BYTES_PER_SAMPLE as f64 / SAMPLE_RATE as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_duration_of_twenty_ms() {
        // 960 samples = 1920 bytes = 20 ms at 48 kHz mono
        assert_eq!(pcm_duration(1920), Duration::from_millis(20));
    }
}
