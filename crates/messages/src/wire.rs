//! Wire codec.
//!
//! # Format
//!
//! ```text
//! [version: u8][bincode-encoded payload]
//! ```
//!
//! The payload type is determined by the envelope's topic, not by a field in
//! the bytes; the transport layer carries the topic out of band. Transport
//! headers (for instance the kadcast hop height) travel as an opaque byte
//! string next to the payload.

use crate::consensus::{Agreement, Reduction, Score};
use crate::sync::{Addr, GetBlocks, GetData, Inv};
use crate::topics::Topic;
use serde::Serialize;
use thiserror::Error;
use umbra_types::{Block, Transaction};

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Errors from message encoding and decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("message too short")]
    MessageTooShort,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("unknown topic byte: {0}")]
    UnknownTopic(u8),
}

/// A decoded payload, one variant per topic.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Score(Score),
    Candidate(Box<Block>),
    Reduction(Reduction),
    Agreement(Agreement),
    Block(Box<Block>),
    Tx(Box<Transaction>),
    GetBlocks(GetBlocks),
    GetData(GetData),
    Inv(Inv),
    Addr(Addr),
    /// Inventory-shaped reply for data a peer does not have.
    NotFound(Inv),
}

impl Payload {
    pub fn topic(&self) -> Topic {
        match self {
            Payload::Score(_) => Topic::Score,
            Payload::Candidate(_) => Topic::Candidate,
            Payload::Reduction(_) => Topic::Reduction,
            Payload::Agreement(_) => Topic::Agreement,
            Payload::Block(_) => Topic::Block,
            Payload::Tx(_) => Topic::Tx,
            Payload::GetBlocks(_) => Topic::GetBlocks,
            Payload::GetData(_) => Topic::GetData,
            Payload::Inv(_) => Topic::Inv,
            Payload::Addr(_) => Topic::Addr,
            Payload::NotFound(_) => Topic::NotFound,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    let mut bytes = Vec::with_capacity(1 + body.len());
    bytes.push(WIRE_VERSION);
    bytes.extend(body);
    Ok(bytes)
}

fn decode<'a, T: serde::Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Encode a payload to wire bytes.
pub fn encode_message(payload: &Payload) -> Result<Vec<u8>, CodecError> {
    match payload {
        Payload::Score(v) => encode(v),
        Payload::Candidate(v) => encode(v.as_ref()),
        Payload::Reduction(v) => encode(v),
        Payload::Agreement(v) => encode(v),
        Payload::Block(v) => encode(v.as_ref()),
        Payload::Tx(v) => encode(v.as_ref()),
        Payload::GetBlocks(v) => encode(v),
        Payload::GetData(v) => encode(v),
        Payload::Inv(v) => encode(v),
        Payload::Addr(v) => encode(v),
        Payload::NotFound(v) => encode(v),
    }
}

/// Decode wire bytes under a topic.
pub fn decode_message(topic: Topic, data: &[u8]) -> Result<Payload, CodecError> {
    if data.is_empty() {
        return Err(CodecError::MessageTooShort);
    }

    let version = data[0];
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    let body = &data[1..];

    Ok(match topic {
        Topic::Score => Payload::Score(decode(body)?),
        Topic::Candidate => Payload::Candidate(Box::new(decode(body)?)),
        Topic::Reduction => Payload::Reduction(decode(body)?),
        Topic::Agreement => Payload::Agreement(decode(body)?),
        Topic::Block => Payload::Block(Box::new(decode(body)?)),
        Topic::Tx => Payload::Tx(Box::new(decode(body)?)),
        Topic::GetBlocks => Payload::GetBlocks(decode(body)?),
        Topic::GetData => Payload::GetData(decode(body)?),
        Topic::Inv => Payload::Inv(decode(body)?),
        Topic::Addr => Payload::Addr(decode(body)?),
        Topic::NotFound => Payload::NotFound(decode(body)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_types::test_utils::{test_keys, test_transaction};
    use umbra_types::{Block, Hash};

    #[test]
    fn block_round_trip() {
        let block = Block::genesis(Hash::digest(b"root"));
        let payload = Payload::Block(Box::new(block));

        let bytes = encode_message(&payload).unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);

        let back = decode_message(Topic::Block, &bytes).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn reduction_round_trip() {
        let keys = test_keys(1);
        let red = Reduction::sign(&keys, 4, 1, Hash::digest(b"hash"));
        let payload = Payload::Reduction(red);

        let bytes = encode_message(&payload).unwrap();
        let back = decode_message(Topic::Reduction, &bytes).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn agreement_round_trip() {
        let keys = test_keys(2);
        let agr = Agreement::sign(
            &keys,
            4,
            3,
            Hash::digest(b"hash"),
            umbra_types::StepVotes::empty(1),
            umbra_types::StepVotes::empty(2),
        );
        let payload = Payload::Agreement(agr);

        let bytes = encode_message(&payload).unwrap();
        let back = decode_message(Topic::Agreement, &bytes).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn tx_round_trip() {
        let payload = Payload::Tx(Box::new(test_transaction(5)));
        let bytes = encode_message(&payload).unwrap();
        let back = decode_message(Topic::Tx, &bytes).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn bad_version_rejected() {
        let payload = Payload::Inv(Inv::default());
        let mut bytes = encode_message(&payload).unwrap();
        bytes[0] = 99;
        assert!(matches!(
            decode_message(Topic::Inv, &bytes),
            Err(CodecError::UnknownVersion(99))
        ));
    }

    #[test]
    fn empty_input_rejected() {
        assert!(matches!(
            decode_message(Topic::Inv, &[]),
            Err(CodecError::MessageTooShort)
        ));
    }
}
