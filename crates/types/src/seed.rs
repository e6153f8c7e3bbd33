//! Block seed.

use crate::bls::{BytesVisitor, Signature};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Seed size in bytes.
pub const SEED_SIZE: usize = 33;

/// The 33-byte sortition seed carried in every block header.
///
/// Committee sampling for round `r` derives from the seed of the block at
/// height `r - 1`. The seed advances with each block: the generator signs
/// the seed-advance commitment (see [`crate::signing::seed_message`]) and the
/// successor seed is derived from that signature via [`Seed::advance`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Seed([u8; SEED_SIZE]);

impl Seed {
    pub const ZERO: Seed = Seed([0u8; SEED_SIZE]);

    pub fn from_bytes(bytes: [u8; SEED_SIZE]) -> Self {
        Seed(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SEED_SIZE] {
        &self.0
    }

    /// Derive the successor seed from the generator's seed-advance signature.
    ///
    /// The digest is prefixed with a constant 0x02 byte to fill the fixed
    /// 33-byte layout.
    pub fn advance(signature: &Signature) -> Self {
        let mut out = [0u8; SEED_SIZE];
        out[0] = 0x02;
        let mut hasher = Sha256::new();
        hasher.update(signature.to_bytes());
        out[1..].copy_from_slice(&hasher.finalize());
        Seed(out)
    }
}

impl Default for Seed {
    fn default() -> Self {
        Seed::ZERO
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..12])
    }
}

impl Serialize for Seed {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Seed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Seed(deserializer.deserialize_bytes(BytesVisitor::<SEED_SIZE>)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::Keys;

    #[test]
    fn advance_is_deterministic() {
        let keys = Keys::from_seed(&[4u8; 32]);
        let sig = keys.sign(b"seed advance");
        assert_eq!(Seed::advance(&sig), Seed::advance(&sig));
        assert_ne!(Seed::advance(&sig), Seed::ZERO);
    }
}
