//! Cryptographic services used by offline data authentication.
//!
//! The RSA recovery primitive is deliberately a seam: certificates are
//! recovered with a raw public-key operation supplied by the embedder
//! through [`ModExp`], so the engine carries no bignum arithmetic and tests
//! can substitute canned plaintexts. Hashing is done in-process with the
//! SHA-1/SHA-256 digests, which is all EMV certificate chains use.

use num_enum::TryFromPrimitive;
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Raw RSA public-key operation: `input ^ exponent mod modulus`, big-endian.
///
/// The result must be exactly as long as the modulus. Implementations
/// usually delegate to whatever bignum or HSM facility the terminal has.
pub trait ModExp {
    fn mod_exp(&self, modulus: &[u8], exponent: &[u8], input: &[u8]) -> Vec<u8>;
}

/// EMV hash algorithm indicators (Book 2, Annex B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum HashAlgo {
    Sha1 = 0x01,
    Sha256 = 0x02,
}

impl HashAlgo {
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
        }
    }
}

/// EMV signature algorithm indicator for RSA (Book 2, Annex B).
pub const SIG_ALGO_RSA: u8 = 0x01;

/// Hashes the concatenation of `parts`.
pub fn digest(algo: HashAlgo, parts: &[&[u8]]) -> Vec<u8> {
    match algo {
        HashAlgo::Sha1 => {
            let mut h = Sha1::new();
            for p in parts {
                h.update(p);
            }
            h.finalize().to_vec()
        }
        HashAlgo::Sha256 => {
            let mut h = Sha256::new();
            for p in parts {
                h.update(p);
            }
            h.finalize().to_vec()
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::ModExp;

    /// "Decrypts" by handing the signature back unchanged, so tests can
    /// script certificates as ready-made plaintexts.
    pub struct Identity;

    impl ModExp for Identity {
        fn mod_exp(&self, _modulus: &[u8], _exponent: &[u8], input: &[u8]) -> Vec<u8> {
            input.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_abc() {
        assert_eq!(
            digest(HashAlgo::Sha1, &[b"a", b"bc"]),
            hex::decode("a9993e364706816aba3e25717850c26c9cd0d89d").unwrap()
        );
    }

    #[test]
    fn test_sha256_abc() {
        assert_eq!(
            digest(HashAlgo::Sha256, &[b"abc"]),
            hex::decode("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
                .unwrap()
        );
    }

    #[test]
    fn test_indicators() {
        assert_eq!(HashAlgo::try_from(0x01), Ok(HashAlgo::Sha1));
        assert_eq!(HashAlgo::try_from(0x02), Ok(HashAlgo::Sha256));
        assert!(HashAlgo::try_from(0x03).is_err());
        assert_eq!(HashAlgo::Sha1.digest_len(), 20);
    }
}
