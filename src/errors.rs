//! Error and outcome taxonomy.
//!
//! Two axes, following EMV terminal convention: an [`Error`] is a hard
//! failure (malformed data, broken invariant, crypto failure, reader fault)
//! after which the transaction must be aborted and the session re-initialised;
//! an [`Outcome`] is a well-defined EMV disposition (card error, card blocked,
//! application not accepted, ...) that the embedding application presents to
//! the cardholder before moving on to the next transaction.
//!
//! Outcomes travel inside [`Error::Outcome`] so that `?` works throughout;
//! callers that care about the distinction match on [`Error::outcome`].

use crate::apdu::Status;
use crate::session::State;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An EMV transaction disposition. Not a failure of this library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Outcome {
    /// The card misbehaved (bad ATR, malformed data, unexpected status).
    #[error("card error")]
    CardError,
    /// The card or the Payment System Environment is blocked.
    #[error("card blocked")]
    CardBlocked,
    /// No remaining candidate application is accepted by the card.
    #[error("not accepted")]
    NotAccepted,
    /// The selected candidate was refused; others remain, select again.
    #[error("try again")]
    TryAgain,
    /// The card refused GET PROCESSING OPTIONS (SW 6985).
    #[error("processing options not accepted")]
    GpoNotAccepted,
}

/// BER-TLV decoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BerError {
    /// The input slice is empty. Iterators treat this as normal termination.
    #[error("end of data")]
    EndOfData,
    #[error("tag truncated")]
    TagTruncated,
    #[error("tag does not fit in 32 bits")]
    TagTooLarge,
    #[error("length truncated")]
    LengthTruncated,
    #[error("length too large")]
    LengthTooLarge,
    #[error("indefinite length on a primitive data object")]
    IndefiniteOnPrimitive,
    #[error("value truncated")]
    ValueTruncated,
}

/// Certificate recovery errors (offline data authentication).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CertError {
    /// Certificate length does not match the signer's modulus length.
    #[error("certificate length unsuitable for the recovery key")]
    UnsuitableKeyLength,
    /// Recovered header, trailer or format byte is wrong: either the wrong
    /// CA public key was used or the certificate is not genuine.
    #[error("wrong CA public key or forged certificate")]
    WrongCapk,
    /// The recovered hash does not match the rebuilt one.
    #[error("certificate hash mismatch")]
    HashMismatch,
    /// The certified identifier does not match the application PAN.
    #[error("certificate PAN mismatch")]
    PanMismatch,
    #[error("unsupported hash algorithm indicator {0:#04x}")]
    UnsupportedHash(u8),
    #[error("unsupported signature algorithm indicator {0:#04x}")]
    UnsupportedSig(u8),
    /// The recovered plaintext is internally inconsistent.
    #[error("malformed certificate plaintext")]
    Malformed,
}

/// Answer-to-Reset rejection reasons. All of them surface as
/// [`Outcome::CardError`] at the session level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AtrError {
    #[error("ATR truncated")]
    Truncated,
    #[error("ATR not eligible: {0}")]
    Rejected(&'static str),
    #[error("TCK checksum mismatch")]
    BadChecksum,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Ber(#[from] BerError),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error(transparent)]
    Atr(#[from] AtrError),

    #[error(transparent)]
    Outcome(#[from] Outcome),

    /// An unexpected status word where only 9000 was acceptable.
    #[error("status {0}")]
    Apdu(Status),

    /// Hardware failure reported by the card reader.
    #[error("reader failure ({0})")]
    Reader(i32),

    #[cfg(feature = "pcsc")]
    #[error(transparent)]
    Pcsc(#[from] pcsc::Error),

    /// The card broke the transport protocol (e.g. GET RESPONSE chaining on
    /// a case 1/3 command, or a chain that never converges).
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// The reader requested a facility this engine does not provide.
    #[error("unsupported reader operation: {0}")]
    UnsupportedReader(&'static str),

    /// A caller-provided output buffer was too small. Always a programming
    /// error on the caller's side.
    #[error("buffer too small")]
    BufferTooSmall,

    /// A record exceeded the negotiated offline authentication buffer.
    #[error("invalid record")]
    InvalidRecord,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A session operation was invoked out of order.
    #[error("operation requires state {expected:?}, session is {actual:?}")]
    State { expected: State, actual: State },
}

impl Error {
    /// The EMV disposition carried by this error, if it is one.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Error::Outcome(o) => Some(*o),
            _ => None,
        }
    }
}
