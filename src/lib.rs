//! A terminal-side EMV payment card protocol engine.
//!
//! Three tightly coupled layers: a BER-TLV codec (with the Data Object List
//! machinery EMV builds its command payloads from), a terminal transport
//! layer driving ISO 7816 card readers in APDU or TPDU mode, and a
//! transaction orchestrator that walks a chip transaction from ATR
//! validation through application selection, GET PROCESSING OPTIONS, record
//! reading, offline data authentication and processing restrictions.
//!
//! The EMV specifications can be downloaded freely from EMVCo's website and
//! also contain a recap of ISO 7816. Data elements are defined in Book 3,
//! Annex A; offline data authentication in Book 2.
//!
//! What this crate deliberately does not do: raw reader I/O (bring a
//! [`reader::CardReader`]), RSA arithmetic (bring a [`crypto::ModExp`]),
//! CAPK provisioning (bring a [`capk::CapkTable`]), cardholder interaction,
//! and online authorisation.

pub mod apdu;
pub mod atr;
pub mod ber;
pub mod capk;
pub mod cert;
pub mod crypto;
pub mod dol;
pub mod errors;
pub mod fields;
pub mod reader;
pub mod select;
pub mod session;
pub mod status;
pub mod tags;
pub mod tlv;
pub mod ttl;

pub use errors::{Error, Outcome, Result};
pub use session::Session;
pub use tlv::{Tlv, TlvList};
