//! Batch Digests
//!
//! Peers acknowledge a batch by its SHA-256 digest, so the digest must be a
//! pure function of the batch contents. Every value is fed through
//! [`DigestInput`], which fixes its byte encoding (little-endian integers,
//! a presence byte for optional fields).

use sha2::{Sha256, Digest};
use super::vec2::FixedVec2;

/// Digest output type (256 bits / 32 bytes)
pub type BatchDigest = [u8; 32];

/// Domain separator for command batch digests.
pub const BATCH_DOMAIN: &[u8] = b"RTS_LOCKSTEP_BATCH_V1";

/// A value with a canonical encoding inside a digest.
pub trait DigestInput {
    /// Append the canonical bytes of `self`.
    fn feed(&self, sha: &mut Sha256);
}

macro_rules! le_digest_input {
    ($($ty:ty),*) => {
        $(impl DigestInput for $ty {
            #[inline]
            fn feed(&self, sha: &mut Sha256) {
                sha.update(self.to_le_bytes());
            }
        })*
    };
}

le_digest_input!(u8, u32, u64, i32);

impl DigestInput for FixedVec2 {
    #[inline]
    fn feed(&self, sha: &mut Sha256) {
        self.x.feed(sha);
        self.y.feed(sha);
    }
}

// `None` and `Some(0)` must not collide.
impl<T: DigestInput> DigestInput for Option<T> {
    fn feed(&self, sha: &mut Sha256) {
        match self {
            Some(inner) => {
                1u8.feed(sha);
                inner.feed(sha);
            }
            None => 0u8.feed(sha),
        }
    }
}

/// Domain-separated SHA-256 over [`DigestInput`] values.
///
/// Order of writes is part of the digest.
pub struct LockstepHasher {
    sha: Sha256,
}

impl LockstepHasher {
    /// Start a digest in `domain`.
    pub fn new(domain: &[u8]) -> Self {
        let mut sha = Sha256::new();
        sha.update(domain);
        Self { sha }
    }

    /// Start a command batch digest.
    pub fn for_batch() -> Self {
        Self::new(BATCH_DOMAIN)
    }

    /// Append one value.
    #[inline]
    pub fn write<T: DigestInput + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.feed(&mut self.sha);
        self
    }

    /// Finish and return the digest.
    pub fn finalize(self) -> BatchDigest {
        self.sha.finalize().into()
    }
}

/// Short hex form of a digest for log lines.
pub fn short_hex(digest: &BatchDigest) -> String {
    hex::encode(&digest[..6])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixed::to_fixed;

    fn digest_of(write: impl FnOnce(&mut LockstepHasher)) -> BatchDigest {
        let mut hasher = LockstepHasher::for_batch();
        write(&mut hasher);
        hasher.finalize()
    }

    #[test]
    fn test_same_writes_same_digest() {
        let write = |h: &mut LockstepHasher| {
            h.write(&7u64)
                .write(&to_fixed(5.5))
                .write(&FixedVec2::new(to_fixed(1.0), to_fixed(2.0)));
        };
        assert_eq!(digest_of(write), digest_of(write));
    }

    #[test]
    fn test_write_order_changes_digest() {
        let forward = digest_of(|h| {
            h.write(&1u32).write(&2u32);
        });
        let reversed = digest_of(|h| {
            h.write(&2u32).write(&1u32);
        });
        assert_ne!(forward, reversed);
    }

    #[test]
    fn test_none_differs_from_some_zero() {
        let none = digest_of(|h| {
            h.write(&None::<u32>);
        });
        let zero = digest_of(|h| {
            h.write(&Some(0u32));
        });
        assert_ne!(none, zero);
    }

    #[test]
    fn test_vec2_is_x_then_y() {
        let v = FixedVec2::new(3, 9);
        assert_eq!(
            digest_of(|h| {
                h.write(&v);
            }),
            digest_of(|h| {
                h.write(&3i32).write(&9i32);
            })
        );
    }

    #[test]
    fn test_domains_are_separated() {
        let batch = LockstepHasher::for_batch().finalize();
        let other = LockstepHasher::new(b"RTS_LOCKSTEP_OTHER").finalize();
        assert_ne!(batch, other);
    }

    #[test]
    fn test_short_hex() {
        assert_eq!(short_hex(&[0xABu8; 32]), "abababababab");
    }
}
