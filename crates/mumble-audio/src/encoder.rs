use std::time::Duration;

use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bitrate, Channels, SampleRate, Signal};

use crate::error::AudioError;
use crate::{SAMPLES_PER_MS, SEQUENCE_DURATION};

/// Wraps the Opus encoder with voice-chat settings.
pub struct Encoder {
    inner: OpusEncoder,
    frame_samples: usize,
    frame_duration: Duration,
}

impl Encoder {
    /// Create an encoder emitting frames of `frame_duration` (10, 20 or
    /// 40 ms) at the given bitrate.
    pub fn new(bitrate: i32, frame_duration: Duration) -> Result<Self, AudioError> {
        let millis = frame_duration.as_millis() as u64;
        if !matches!(millis, 10 | 20 | 40) {
            return Err(AudioError::InvalidFrameDuration(millis));
        }

        let mut encoder = OpusEncoder::new(SampleRate::Hz48000, Channels::Mono, Application::Voip)?;
        encoder.set_bitrate(Bitrate::BitsPerSecond(bitrate))?;
        encoder.set_signal(Signal::Voice)?;

        Ok(Self {
            inner: encoder,
            frame_samples: millis as usize * SAMPLES_PER_MS,
            frame_duration,
        })
    }

    /// Encode one frame of PCM i16 samples into Opus.
    ///
    /// `pcm` must contain exactly [`Self::frame_samples`] samples.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, AudioError> {
        assert_eq!(
            pcm.len(),
            self.frame_samples,
            "PCM frame must be exactly {} samples",
            self.frame_samples
        );

        let mut output = vec![0u8; 1024];
        let len = self.inner.encode(pcm, &mut output)?;
        output.truncate(len);
        Ok(output)
    }

    /// Samples expected per input frame.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Bytes of s16le PCM consumed per frame.
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples * 2
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// How many sequence units (10 ms steps) one frame advances.
    pub fn sequence_increment(&self) -> i64 {
        (self.frame_duration.as_millis() / SEQUENCE_DURATION.as_millis()) as i64
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("frame_samples", &self.frame_samples)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_odd_frame_durations() {
        assert!(matches!(
            Encoder::new(40_000, Duration::from_millis(25)),
            Err(AudioError::InvalidFrameDuration(25))
        ));
    }

    #[test]
    fn frame_geometry() {
        let encoder = Encoder::new(40_000, Duration::from_millis(20)).unwrap();
        assert_eq!(encoder.frame_samples(), 960);
        assert_eq!(encoder.frame_bytes(), 1920);
        assert_eq!(encoder.sequence_increment(), 2);
    }

    #[test]
    fn encodes_a_frame_of_silence() {
        let mut encoder = Encoder::new(40_000, Duration::from_millis(10)).unwrap();
        let pcm = vec![0i16; encoder.frame_samples()];
        let opus = encoder.encode(&pcm).unwrap();
        assert!(!opus.is_empty());
    }
}
