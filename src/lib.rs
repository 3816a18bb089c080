//! A MIFARE/FeliCa contactless smart-card protocol and cryptography
//! engine: session-level command engines for MIFARE Classic, MIFARE
//! DESFire, MIFARE Ultralight/NTAG21x, and FeliCa recognition, plus the
//! AN10922 key-diversification algorithm, independent of any particular
//! reader hardware.

pub mod classic;
pub mod crypto;
pub mod deriver;
pub mod desfire;
pub mod dispatch;
pub mod error;
pub mod key;
pub mod mad;
pub mod transport;
pub mod ultralight;

pub use error::Error;
pub use transport::Transport;
