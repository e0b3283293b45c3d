//! PC/SC reader adapter.
//!
//! PC/SC readers speak whole APDUs; the winscard layer does its own T=0/T=1
//! transport underneath, so this adapter always reports APDU mode.

use crate::errors::Result;
use crate::reader::{CardReader, Mode};

pub struct PcscReader<'c> {
    card: &'c pcsc::Card,
}

impl<'c> PcscReader<'c> {
    pub fn new(card: &'c pcsc::Card) -> Self {
        Self { card }
    }
}

impl CardReader for PcscReader<'_> {
    fn mode(&self) -> Mode {
        Mode::Apdu
    }

    fn transceive(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<usize> {
        let received = self.card.transmit(tx, rx)?;
        Ok(received.len())
    }
}
