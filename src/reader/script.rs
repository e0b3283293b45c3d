//! A scripted reader that replays canned exchanges.
//!
//! Used throughout the test suite and handy for replaying captured
//! transcripts against the engine without hardware.

use std::collections::VecDeque;

use crate::errors::{Error, Result};
use crate::reader::{CardReader, Mode};

pub struct ScriptReader {
    mode: Mode,
    steps: VecDeque<(Vec<u8>, Vec<u8>)>,
}

impl ScriptReader {
    pub fn new(mode: Mode) -> Self {
        Self { mode, steps: VecDeque::new() }
    }

    /// Appends an exchange: when `expect_tx` arrives, answer with `rx`.
    pub fn expect<T: Into<Vec<u8>>, R: Into<Vec<u8>>>(mut self, expect_tx: T, rx: R) -> Self {
        self.steps.push_back((expect_tx.into(), rx.into()));
        self
    }

    /// True once every scripted exchange has been consumed.
    pub fn done(&self) -> bool {
        self.steps.is_empty()
    }
}

impl CardReader for ScriptReader {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn transceive(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<usize> {
        let Some((expect_tx, reply)) = self.steps.pop_front() else {
            return Err(Error::Reader(-1));
        };
        if tx != expect_tx {
            // A diverging transcript is a scripting or engine bug; fail the
            // exchange rather than returning mismatched data.
            return Err(Error::Reader(-2));
        }
        if reply.len() > rx.len() {
            return Err(Error::BufferTooSmall);
        }
        rx[..reply.len()].copy_from_slice(&reply);
        Ok(reply.len())
    }
}
