use audiopus::coder::Decoder as OpusDecoder;
use audiopus::packet::Packet;
use audiopus::{Channels, MutSignals, SampleRate};

use crate::error::AudioError;

/// Largest Opus frame the decoder accepts: 120 ms at 48 kHz mono.
const MAX_FRAME_SAMPLES: usize = 5760;

/// Wraps the Opus decoder. One instance per sending user, since Opus
/// carries inter-frame state.
pub struct Decoder {
    inner: OpusDecoder,
}

impl Decoder {
    pub fn new() -> Result<Self, AudioError> {
        let decoder = OpusDecoder::new(SampleRate::Hz48000, Channels::Mono)?;
        Ok(Self { inner: decoder })
    }

    /// Decode an Opus frame into s16le PCM bytes.
    pub fn decode(&mut self, opus_data: &[u8]) -> Result<Vec<u8>, AudioError> {
        let mut output = vec![0i16; MAX_FRAME_SAMPLES];
        let packet = Packet::try_from(opus_data)?;
        let signals = MutSignals::try_from(&mut output)?;
        let samples = self.inner.decode(Some(packet), signals, false)?;
        output.truncate(samples);

        let mut pcm = Vec::with_capacity(output.len() * 2);
        for sample in output {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(pcm)
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder").finish_non_exhaustive()
    }
}
