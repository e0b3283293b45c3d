//! The card reader contract.
//!
//! The engine drives exactly one reader per session through a blocking
//! transceive call; which framing the reader wants is a tagged mode, not a
//! type hierarchy. An APDU-mode reader (every PC/SC reader) takes whole
//! command APDUs and returns whole responses; a TPDU-mode reader exchanges
//! T=0 transport units and leaves procedure-byte handling to us.

#[cfg(feature = "pcsc")]
pub mod pcsc;
pub mod script;

use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The reader transports complete APDUs, including SW1-SW2.
    Apdu,
    /// The reader transports raw T=0 TPDUs; procedure bytes are ours.
    Tpdu,
}

pub trait CardReader {
    fn mode(&self) -> Mode;

    /// Transceives one unit: sends `tx`, writes the card's reply into `rx`
    /// and returns the number of bytes received. Blocks until the card
    /// answers. Hardware failures map to [`crate::Error::Reader`].
    fn transceive(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<usize>;
}

impl<R: CardReader + ?Sized> CardReader for &mut R {
    fn mode(&self) -> Mode {
        (**self).mode()
    }

    fn transceive(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<usize> {
        (**self).transceive(tx, rx)
    }
}
