//! Abstractions over different crypto hash digest algorithms.

#[cfg(feature = "crypto_hash_ring_sha2")]
mod ring_sha2;

#[cfg(feature = "crypto_hash_blake3_blake3")]
mod blake3_blake3;

#[cfg(feature = "crypto_hash_ring_sha2")]
use ring_sha2 as hash_impl;

#[cfg(feature = "crypto_hash_blake3_blake3")]
use blake3_blake3 as hash_impl;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pbft::error::*;

/// The type of the digests of the configured hash algorithm.
#[derive(Copy, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

/// The context of a hash operation.
pub struct Context {
    inner: hash_impl::Context,
}

impl Context {
    /// Creates a new hashing context.
    pub fn new() -> Self {
        Self {
            inner: hash_impl::Context::new(),
        }
    }

    /// Feeds data into the hashing context.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Extracts the digest of the consumed data.
    pub fn finish(self) -> Digest {
        Digest(self.inner.finish())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Digest {
    /// The length of a `Digest`, in bytes.
    pub const LENGTH: usize = hash_impl::LENGTH;

    /// Hashes `data` in a one-shot operation.
    pub fn hash(data: &[u8]) -> Digest {
        let mut ctx = Context::new();
        ctx.update(data);
        ctx.finish()
    }

    /// Constructs a `Digest` from a byte buffer of appropriate size.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Digest has an invalid length").wrapped(hash_impl::ERR);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Ok(Self(inner))
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl fmt::LowerHex for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({:x})", self)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_length() {
        let d = Digest::hash(b"I am a cool payload!");
        assert_eq!(d.as_ref().len(), Digest::LENGTH);
    }

    #[test]
    fn test_digest_deterministic() {
        assert_eq!(Digest::hash(b"x"), Digest::hash(b"x"));
        assert_ne!(Digest::hash(b"x"), Digest::hash(b"y"));
    }

    #[test]
    fn test_from_bytes() {
        let d = Digest::hash(b"z");
        let d2 = Digest::from_bytes(d.as_ref()).expect("Invalid digest length");
        assert_eq!(d, d2);
        assert!(Digest::from_bytes(&[0; 4][..]).is_err());
    }
}
