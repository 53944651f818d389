use mumble_protocol::voice::AudioCodec;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no decoder installed for codec {0:?}")]
    UnknownCodec(AudioCodec),

    #[error("opus codec error: {0}")]
    Opus(#[from] audiopus::Error),

    #[error("invalid frame duration: {0} ms (must be 10, 20 or 40)")]
    InvalidFrameDuration(u64),
}
