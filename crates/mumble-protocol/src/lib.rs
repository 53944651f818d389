//! Wire-level types for the Mumble protocol: control-channel framing,
//! protobuf message bodies, the Mumble varint, and the voice packet codec.

pub mod control;
pub mod error;
pub mod proto;
pub mod varint;
pub mod voice;

pub use control::{ControlMessage, MessageKind};
pub use error::{ProtocolError, VarintError};

/// Default Mumble server port.
pub const DEFAULT_PORT: u16 = 64738;

/// Protocol version reported in the `Version` handshake message (1.2.4),
/// encoded as `(major << 16) | (minor << 8) | patch`.
pub const CLIENT_PROTOCOL_VERSION: u32 = 0x0001_0204;
