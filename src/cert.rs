//! RSA certificate recovery for offline data authentication.
//!
//! EMV chains are two or three deep: a CA public key (from the terminal's
//! CAPK table) certifies the issuer public key, which certifies either the
//! Signed Static Application Data (SDA) or the ICC public key, which in turn
//! signs dynamic data (DDA/CDA). Recovery is the textbook RSA digital
//! signature scheme giving message recovery from ISO 9796-2; formats and
//! offsets are from EMV Book 2, sections 5 and 6.
//!
//! Every recovered plaintext carries up to eight PAN digits, so buffers and
//! key structures are wiped when dropped.

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::capk::Capk;
use crate::crypto::{self, HashAlgo, ModExp, SIG_ALGO_RSA};
use crate::errors::CertError;
use crate::tags;
use crate::tlv::TlvList;

const HEADER: u8 = 0x6A;
const TRAILER: u8 = 0xBC;

const FORMAT_ISSUER: u8 = 0x02;
const FORMAT_SSAD: u8 = 0x03;
const FORMAT_ICC: u8 = 0x04;
const FORMAT_SDAD: u8 = 0x05;

/// Issuer public keys are at most 1984 bits.
pub const MAX_ISSUER_MODULUS: usize = 248;

/// An issuer public key recovered from its certificate (tag 90).
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct IssuerPublicKey {
    pub issuer_id: [u8; 4],
    pub expiry_mmyy: [u8; 2],
    pub serial: [u8; 3],
    #[zeroize(skip)]
    pub hash_algo: HashAlgo,
    pub modulus: Vec<u8>,
    pub exponent: Vec<u8>,
}

/// An ICC public key recovered from its certificate (tag 9F46).
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct IccPublicKey {
    /// Application PAN, ten bytes, right-padded with 0xF nibbles.
    pub pan: [u8; 10],
    pub expiry_mmyy: [u8; 2],
    pub serial: [u8; 3],
    #[zeroize(skip)]
    pub hash_algo: HashAlgo,
    pub modulus: Vec<u8>,
    pub exponent: Vec<u8>,
    /// The certificate's own hash, kept for combined authentication.
    pub cert_hash: [u8; 20],
}

/// Inputs that were absent during a recovery. The decryption itself
/// succeeded; the caller decides whether partial authentication is enough.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Missing {
    pub remainder: bool,
    pub exponent: bool,
    pub pan: bool,
}

impl Missing {
    pub fn any(&self) -> bool {
        self.remainder || self.exponent || self.pan
    }
}

/// Result of a key recovery: fatal problems are `Err`, absent optional
/// inputs are flagged here. `key` is `None` when the modulus or exponent
/// could not be assembled.
#[derive(Debug)]
pub struct Recovery<K> {
    pub key: Option<K>,
    pub missing: Missing,
}

impl<K> Recovery<K> {
    pub fn is_full(&self) -> bool {
        self.key.is_some() && !self.missing.any()
    }
}

/// Data authentication results carried out of an SSAD verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ssad {
    /// Data Authentication Code (becomes tag 9F45).
    pub dac: [u8; 2],
}

/// Contents of a verified Signed Dynamic Application Data (tag 9F4B).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdad {
    /// ICC Dynamic Number (becomes tag 9F4C).
    pub icc_dynamic_number: Vec<u8>,
    /// Cryptogram Information Data; combined authentication only.
    pub cid: Option<u8>,
    /// Application Cryptogram; combined authentication only.
    pub cryptogram: Option<[u8; 8]>,
    /// Transaction Data Hash Code; combined authentication only.
    pub tx_data_hash: Option<[u8; 20]>,
}

fn decrypt(
    crypto: &dyn ModExp,
    modulus: &[u8],
    exponent: &[u8],
    data: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CertError> {
    if data.len() != modulus.len() {
        return Err(CertError::UnsuitableKeyLength);
    }
    let plain = Zeroizing::new(crypto.mod_exp(modulus, exponent, data));
    if plain.len() != modulus.len() {
        return Err(CertError::Malformed);
    }
    Ok(plain)
}

/// Checks the ISO 9796-2 frame around a recovered plaintext.
fn check_frame(plain: &[u8], format: u8) -> Result<(), CertError> {
    if plain[plain.len() - 1] != TRAILER || plain[0] != HEADER || plain[1] != format {
        return Err(CertError::WrongCapk);
    }
    Ok(())
}

/// Nibble-wise comparison of a recovered identifier against the application
/// PAN. 0xF nibbles in the recovered field are wildcards.
fn pan_matches(recovered: &[u8], pan: &[u8]) -> bool {
    let mut pan_nibbles = pan.iter().flat_map(|b| [b >> 4, b & 0x0F]);
    for b in recovered {
        for nibble in [b >> 4, b & 0x0F] {
            if nibble == 0x0F {
                continue;
            }
            match pan_nibbles.next() {
                Some(p) if p == nibble => {}
                _ => return false,
            }
        }
    }
    true
}

/// Recovers the issuer public key from its certificate.
///
/// `icc` supplies the Issuer Public Key Remainder (92) and Exponent (9F32)
/// when the card returned them; `pan` is the Application PAN (5A) if already
/// read. Fatal errors mean the chain is broken; missing optional inputs come
/// back as [`Recovery::missing`].
pub fn recover_issuer_key(
    crypto: &dyn ModExp,
    capk: &Capk,
    cert: &[u8],
    icc: &TlvList,
    pan: Option<&[u8]>,
) -> Result<Recovery<IssuerPublicKey>, CertError> {
    let n = capk.modulus.len();
    if n < 36 {
        return Err(CertError::UnsuitableKeyLength);
    }
    let plain = decrypt(crypto, &capk.modulus, &capk.exponent, cert)?;
    check_frame(&plain, FORMAT_ISSUER)?;
    let hash_algo = HashAlgo::try_from(plain[11]).map_err(|_| CertError::UnsupportedHash(plain[11]))?;
    if hash_algo != HashAlgo::Sha1 {
        return Err(CertError::UnsupportedHash(plain[11]));
    }
    if plain[12] != SIG_ALGO_RSA {
        return Err(CertError::UnsupportedSig(plain[12]));
    }

    let mod_len = plain[13] as usize;
    let exp_len = plain[14] as usize;
    if mod_len == 0 || mod_len > MAX_ISSUER_MODULUS {
        return Err(CertError::Malformed);
    }
    let leftmost = &plain[15..n - 21];

    let mut missing = Missing::default();
    let remainder = icc.get_value(tags::ISSUER_REMAINDER);
    let exponent = icc.get_value(tags::ISSUER_EXPONENT);
    if mod_len > leftmost.len() && remainder.is_none() {
        missing.remainder = true;
    }
    if exponent.is_none() {
        missing.exponent = true;
    }
    if missing.remainder || missing.exponent {
        missing.pan = pan.is_none();
        return Ok(Recovery { key: None, missing });
    }
    let remainder = remainder.filter(|_| mod_len > leftmost.len()).unwrap_or(&[]);
    let exponent = exponent.unwrap_or(&[]);

    // The certificate hash spans every certified field, the full leftmost
    // modulus block (padding included), the remainder and the exponent.
    let hash = crypto::digest(HashAlgo::Sha1, &[&plain[1..15], leftmost, remainder, exponent]);
    if hash != plain[n - 21..n - 1] {
        return Err(CertError::HashMismatch);
    }

    let mut modulus = Zeroizing::new(Vec::with_capacity(mod_len));
    if mod_len <= leftmost.len() {
        modulus.extend_from_slice(&leftmost[..mod_len]);
    } else {
        modulus.extend_from_slice(leftmost);
        modulus.extend_from_slice(remainder);
        if modulus.len() != mod_len {
            return Err(CertError::Malformed);
        }
    }
    if exponent.len() != exp_len {
        return Err(CertError::Malformed);
    }

    let mut issuer_id = [0u8; 4];
    issuer_id.copy_from_slice(&plain[2..6]);
    match pan {
        Some(pan) if !pan_matches(&issuer_id, pan) => return Err(CertError::PanMismatch),
        Some(_) => {}
        None => missing.pan = true,
    }

    let mut expiry = [0u8; 2];
    expiry.copy_from_slice(&plain[6..8]);
    let mut serial = [0u8; 3];
    serial.copy_from_slice(&plain[8..11]);

    Ok(Recovery {
        key: Some(IssuerPublicKey {
            issuer_id,
            expiry_mmyy: expiry,
            serial,
            hash_algo,
            modulus: modulus.to_vec(),
            exponent: exponent.to_vec(),
        }),
        missing,
    })
}

/// Verifies the Signed Static Application Data (tag 93) against the static
/// data assembled during record reading.
pub fn verify_ssad(
    crypto: &dyn ModExp,
    issuer: &IssuerPublicKey,
    ssad: &[u8],
    static_data: &[u8],
) -> Result<Ssad, CertError> {
    let n = issuer.modulus.len();
    if n < 26 {
        return Err(CertError::UnsuitableKeyLength);
    }
    let plain = decrypt(crypto, &issuer.modulus, &issuer.exponent, ssad)?;
    check_frame(&plain, FORMAT_SSAD)?;
    if plain[2] != HashAlgo::Sha1 as u8 {
        return Err(CertError::UnsupportedHash(plain[2]));
    }
    let hash = crypto::digest(HashAlgo::Sha1, &[&plain[1..n - 21], static_data]);
    if hash != plain[n - 21..n - 1] {
        return Err(CertError::HashMismatch);
    }
    let mut dac = [0u8; 2];
    dac.copy_from_slice(&plain[3..5]);
    Ok(Ssad { dac })
}

/// Recovers the ICC public key from its certificate (tag 9F46). The
/// certificate hash also covers the static data, so the same buffer used
/// for SSAD verification is required here.
pub fn recover_icc_key(
    crypto: &dyn ModExp,
    issuer: &IssuerPublicKey,
    cert: &[u8],
    icc: &TlvList,
    pan: Option<&[u8]>,
    static_data: &[u8],
) -> Result<Recovery<IccPublicKey>, CertError> {
    let n = issuer.modulus.len();
    if n < 42 {
        return Err(CertError::UnsuitableKeyLength);
    }
    let plain = decrypt(crypto, &issuer.modulus, &issuer.exponent, cert)?;
    check_frame(&plain, FORMAT_ICC)?;
    let hash_algo = HashAlgo::try_from(plain[17]).map_err(|_| CertError::UnsupportedHash(plain[17]))?;
    if hash_algo != HashAlgo::Sha1 {
        return Err(CertError::UnsupportedHash(plain[17]));
    }
    if plain[18] != SIG_ALGO_RSA {
        return Err(CertError::UnsupportedSig(plain[18]));
    }

    let mod_len = plain[19] as usize;
    let exp_len = plain[20] as usize;
    if mod_len == 0 || mod_len > n {
        return Err(CertError::Malformed);
    }
    let leftmost = &plain[21..n - 21];

    let mut missing = Missing::default();
    let remainder = icc.get_value(tags::ICC_REMAINDER);
    let exponent = icc.get_value(tags::ICC_EXPONENT);
    if mod_len > leftmost.len() && remainder.is_none() {
        missing.remainder = true;
    }
    if exponent.is_none() {
        missing.exponent = true;
    }
    if missing.remainder || missing.exponent {
        missing.pan = pan.is_none();
        return Ok(Recovery { key: None, missing });
    }
    let remainder = remainder.filter(|_| mod_len > leftmost.len()).unwrap_or(&[]);
    let exponent = exponent.unwrap_or(&[]);

    let hash = crypto::digest(
        HashAlgo::Sha1,
        &[&plain[1..21], leftmost, remainder, exponent, static_data],
    );
    if hash != plain[n - 21..n - 1] {
        return Err(CertError::HashMismatch);
    }

    let mut recovered_pan = [0u8; 10];
    recovered_pan.copy_from_slice(&plain[2..12]);
    match pan {
        Some(pan) if !pan_matches(&recovered_pan, pan) => return Err(CertError::PanMismatch),
        Some(_) => {}
        None => missing.pan = true,
    }

    let mut modulus = Zeroizing::new(Vec::with_capacity(mod_len));
    if mod_len <= leftmost.len() {
        modulus.extend_from_slice(&leftmost[..mod_len]);
    } else {
        modulus.extend_from_slice(leftmost);
        modulus.extend_from_slice(remainder);
        if modulus.len() != mod_len {
            return Err(CertError::Malformed);
        }
    }
    if exponent.len() != exp_len {
        return Err(CertError::Malformed);
    }

    let mut expiry = [0u8; 2];
    expiry.copy_from_slice(&plain[12..14]);
    let mut serial = [0u8; 3];
    serial.copy_from_slice(&plain[14..17]);
    let mut cert_hash = [0u8; 20];
    cert_hash.copy_from_slice(&plain[n - 21..n - 1]);

    Ok(Recovery {
        key: Some(IccPublicKey {
            pan: recovered_pan,
            expiry_mmyy: expiry,
            serial,
            hash_algo,
            modulus: modulus.to_vec(),
            exponent: exponent.to_vec(),
            cert_hash,
        }),
        missing,
    })
}

/// Verifies a Signed Dynamic Application Data (tag 9F4B) and extracts the
/// ICC dynamic data. `dynamic_data` is the terminal's contribution to the
/// hash: the DDOL data for dynamic authentication, the Unpredictable Number
/// for combined authentication. `combined` selects the longer dynamic data
/// layout carrying CID, cryptogram and transaction data hash.
pub fn verify_sdad(
    crypto: &dyn ModExp,
    icc: &IccPublicKey,
    sdad: &[u8],
    dynamic_data: &[u8],
    combined: bool,
) -> Result<Sdad, CertError> {
    let n = icc.modulus.len();
    if n < 26 {
        return Err(CertError::UnsuitableKeyLength);
    }
    let plain = decrypt(crypto, &icc.modulus, &icc.exponent, sdad)?;
    check_frame(&plain, FORMAT_SDAD)?;
    if plain[2] != HashAlgo::Sha1 as u8 {
        return Err(CertError::UnsupportedHash(plain[2]));
    }
    let ldd = plain[3] as usize;
    if ldd > n - 25 {
        return Err(CertError::Malformed);
    }
    let hash = crypto::digest(HashAlgo::Sha1, &[&plain[1..n - 21], dynamic_data]);
    if hash != plain[n - 21..n - 1] {
        return Err(CertError::HashMismatch);
    }

    let dyn_data = &plain[4..4 + ldd];
    let Some((&num_len, rest)) = dyn_data.split_first() else {
        return Err(CertError::Malformed);
    };
    let num_len = num_len as usize;
    if num_len > rest.len() {
        return Err(CertError::Malformed);
    }
    let icc_dynamic_number = rest[..num_len].to_vec();

    if !combined {
        return Ok(Sdad { icc_dynamic_number, cid: None, cryptogram: None, tx_data_hash: None });
    }

    let rest = &rest[num_len..];
    if rest.len() < 1 + 8 + 20 {
        return Err(CertError::Malformed);
    }
    let cid = rest[0];
    let mut cryptogram = [0u8; 8];
    cryptogram.copy_from_slice(&rest[1..9]);
    let mut tx_data_hash = [0u8; 20];
    tx_data_hash.copy_from_slice(&rest[9..29]);
    Ok(Sdad {
        icc_dynamic_number,
        cid: Some(cid),
        cryptogram: Some(cryptogram),
        tx_data_hash: Some(tx_data_hash),
    })
}
