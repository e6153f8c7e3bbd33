//! Network messages for the Umbra consensus protocol.
//!
//! The core never parses transport framing. It consumes already-categorised
//! envelopes (topic + header bytes + payload bytes) from the network
//! collaborator and emits the same shape for broadcast. This crate defines
//! the topics, the payload types and the wire codec, plus the duplicate
//! filter used to drop re-propagations at ingress.

pub mod consensus;
pub mod dupemap;
pub mod sync;
mod topics;
mod wire;

pub use consensus::{Agreement, ConsensusHeader, Reduction, Score};
pub use dupemap::DupeMap;
pub use sync::{Addr, GetBlocks, GetData, Inv, InvItem, InvKind};
pub use topics::Topic;
pub use wire::{decode_message, encode_message, CodecError, Payload, WIRE_VERSION};
