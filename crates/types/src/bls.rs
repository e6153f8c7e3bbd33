//! BLS12-381 keys and signatures.
//!
//! Uses the blst crate (min_pk: 48-byte public keys on G1, 96-byte
//! signatures on G2). Reduction and agreement votes are signatures over the
//! signable forms in [`crate::signing`]; quorum certificates carry one
//! group-added signature per reduction step, verified against the aggregate
//! public key of the committee members selected by the step's bitset.

use blst::min_pk::{
    AggregatePublicKey, AggregateSignature, PublicKey as BlstPublicKey, SecretKey as BlstSecretKey,
    Signature as BlstSignature,
};
use blst::BLST_ERROR;
use serde::de::{SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// BLS secret key size in bytes.
pub const SECRET_KEY_SIZE: usize = 32;
/// Compressed G1 public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 48;
/// Compressed G2 signature size in bytes.
pub const SIGNATURE_SIZE: usize = 96;

/// Ciphersuite domain separation tag.
const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Errors from key handling, signing and verification.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("aggregation failed: {0}")]
    AggregationFailed(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// A BLS secret key.
#[derive(Clone)]
pub struct SecretKey {
    inner: BlstSecretKey,
}

impl SecretKey {
    /// Generate a fresh random secret key.
    pub fn generate() -> Self {
        let mut ikm = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut ikm);
        Self::from_seed(&ikm)
    }

    /// Derive a secret key from 32 bytes of keying material.
    ///
    /// Deterministic: the same seed always yields the same key.
    pub fn from_seed(ikm: &[u8; 32]) -> Self {
        let inner = BlstSecretKey::key_gen(ikm, &[])
            .expect("key generation cannot fail with 32 bytes of ikm");
        Self { inner }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = BlstSecretKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("{e:?}")))?;
        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.inner.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.sk_to_pk(),
        }
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            inner: self.inner.sign(message, DST, &[]),
        }
    }
}

impl std::fmt::Debug for SecretKey {
    // Never print key material.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey").finish_non_exhaustive()
    }
}

/// A BLS public key (a provisioner's identity).
#[derive(Clone)]
pub struct PublicKey {
    inner: BlstPublicKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = BlstPublicKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("{e:?}")))?;
        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.inner.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Verify a signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let err = signature
            .inner
            .verify(true, message, DST, &[], &self.inner, true);
        if err == BLST_ERROR::BLST_SUCCESS {
            Ok(())
        } else {
            Err(CryptoError::VerificationFailed(format!("{err:?}")))
        }
    }

    /// Aggregate public keys by group addition.
    ///
    /// The result verifies signatures that were group-added over the same
    /// message by the corresponding secret keys.
    pub fn aggregate(keys: &[PublicKey]) -> Result<Self> {
        if keys.is_empty() {
            return Err(CryptoError::InvalidKey("empty key set".into()));
        }
        let refs: Vec<&BlstPublicKey> = keys.iter().map(|k| &k.inner).collect();
        let agg = AggregatePublicKey::aggregate(&refs, true)
            .map_err(|e| CryptoError::AggregationFailed(format!("{e:?}")))?;
        Ok(Self {
            inner: agg.to_public_key(),
        })
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKey {}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

/// A BLS signature, possibly the group addition of several votes.
#[derive(Clone)]
pub struct Signature {
    inner: BlstSignature,
}

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = BlstSignature::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidSignature(format!("{e:?}")))?;
        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        self.inner.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Group-add another signature into this one.
    ///
    /// Used by the vote aggregator to fold each incoming reduction vote into
    /// the step's running aggregate.
    pub fn combine(&self, other: &Signature) -> Result<Signature> {
        let mut agg = AggregateSignature::from_signature(&self.inner);
        agg.add_signature(&other.inner, true)
            .map_err(|e| CryptoError::AggregationFailed(format!("{e:?}")))?;
        Ok(Signature {
            inner: agg.to_signature(),
        })
    }

    /// Aggregate a batch of signatures.
    pub fn aggregate(signatures: &[Signature]) -> Result<Self> {
        if signatures.is_empty() {
            return Err(CryptoError::InvalidSignature("empty signature set".into()));
        }
        let refs: Vec<&BlstSignature> = signatures.iter().map(|s| &s.inner).collect();
        let agg = AggregateSignature::aggregate(&refs, true)
            .map_err(|e| CryptoError::AggregationFailed(format!("{e:?}")))?;
        Ok(Self {
            inner: agg.to_signature(),
        })
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for Signature {}

/// A node's consensus identity: the BLS keypair it votes with.
#[derive(Clone)]
pub struct Keys {
    secret: SecretKey,
    public: PublicKey,
}

impl Keys {
    pub fn generate() -> Self {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn from_seed(ikm: &[u8; 32]) -> Self {
        let secret = SecretKey::from_seed(ikm);
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.secret.sign(message)
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys").field("public", &self.public).finish()
    }
}

// Serde: compressed point bytes on the wire. Fixed-size arrays above 32
// elements have no serde impls, so both types go through serialize_bytes.

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = deserializer.deserialize_bytes(BytesVisitor::<PUBLIC_KEY_SIZE>)?;
        PublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = deserializer.deserialize_bytes(BytesVisitor::<SIGNATURE_SIZE>)?;
        Signature::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

pub(crate) struct BytesVisitor<const N: usize>;

impl<'de, const N: usize> Visitor<'de> for BytesVisitor<N> {
    type Value = [u8; N];

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{N} bytes")
    }

    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<Self::Value, E> {
        v.try_into()
            .map_err(|_| E::invalid_length(v.len(), &self))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
        let mut out = [0u8; N];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = seq
                .next_element()?
                .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let keys = Keys::from_seed(&[7u8; 32]);
        let sig = keys.sign(b"round one");
        assert!(keys.public().verify(b"round one", &sig).is_ok());
        assert!(keys.public().verify(b"round two", &sig).is_err());
    }

    #[test]
    fn key_derivation_is_deterministic() {
        let a = Keys::from_seed(&[1u8; 32]);
        let b = Keys::from_seed(&[1u8; 32]);
        assert_eq!(a.public(), b.public());
    }

    #[test]
    fn combined_signature_verifies_against_aggregate_key() {
        let msg = b"same message, many signers";
        let k1 = Keys::from_seed(&[1u8; 32]);
        let k2 = Keys::from_seed(&[2u8; 32]);
        let k3 = Keys::from_seed(&[3u8; 32]);

        let agg_sig = k1
            .sign(msg)
            .combine(&k2.sign(msg))
            .unwrap()
            .combine(&k3.sign(msg))
            .unwrap();

        let apk = PublicKey::aggregate(&[
            k1.public().clone(),
            k2.public().clone(),
            k3.public().clone(),
        ])
        .unwrap();

        assert!(apk.verify(msg, &agg_sig).is_ok());

        // A subset key must not verify the full aggregate.
        let partial =
            PublicKey::aggregate(&[k1.public().clone(), k2.public().clone()]).unwrap();
        assert!(partial.verify(msg, &agg_sig).is_err());
    }

    #[test]
    fn serde_round_trip() {
        let keys = Keys::from_seed(&[9u8; 32]);
        let sig = keys.sign(b"payload");

        let pk_bytes = bincode::serialize(keys.public()).unwrap();
        let pk: PublicKey = bincode::deserialize(&pk_bytes).unwrap();
        assert_eq!(&pk, keys.public());

        let sig_bytes = bincode::serialize(&sig).unwrap();
        let back: Signature = bincode::deserialize(&sig_bytes).unwrap();
        assert_eq!(back, sig);
    }
}
