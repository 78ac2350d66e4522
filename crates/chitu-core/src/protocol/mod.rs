//! SDCP protocol module: message types, the JSON codec, and sequence numbering.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{decode_frame, encode_request, parse_discovery_reply, ProtocolError};
pub use messages::*;
pub use sequence::SequenceCounter;
