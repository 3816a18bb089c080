//! Error taxonomy shared by every tag family engine.

use std::fmt;

/// Status byte taxonomy reported by a DESFire PICC, plus the locally
/// detected pseudo-codes used when no card ever answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiccStatus {
    OperationOk,
    NoChanges,
    OutOfEeprom,
    IllegalCommand,
    Integrity,
    NoSuchKey,
    Length,
    Permission,
    Parameter,
    ApplicationNotFound,
    ApplIntegrity,
    Authentication,
    AdditionalFrame,
    Boundary,
    PiccIntegrity,
    CommandAborted,
    PiccDisabled,
    Count,
    Duplicate,
    Eeprom,
    FileNotFound,
    FileIntegrity,
    Crypto,
    Unknown(u8),
}

impl PiccStatus {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => PiccStatus::OperationOk,
            0x0C => PiccStatus::NoChanges,
            0x0E => PiccStatus::OutOfEeprom,
            0x1C => PiccStatus::IllegalCommand,
            0x1E => PiccStatus::Integrity,
            0x40 => PiccStatus::NoSuchKey,
            0x7E => PiccStatus::Length,
            0x9D => PiccStatus::Permission,
            0x9E => PiccStatus::Parameter,
            0xA0 => PiccStatus::ApplicationNotFound,
            0xA1 => PiccStatus::ApplIntegrity,
            0xAE => PiccStatus::Authentication,
            0xAF => PiccStatus::AdditionalFrame,
            0xBE => PiccStatus::Boundary,
            0xC1 => PiccStatus::PiccIntegrity,
            0xCA => PiccStatus::CommandAborted,
            0xCD => PiccStatus::PiccDisabled,
            0xCE => PiccStatus::Count,
            0xDE => PiccStatus::Duplicate,
            0xEE => PiccStatus::Eeprom,
            0xF0 => PiccStatus::FileNotFound,
            0xF1 => PiccStatus::FileIntegrity,
            other => PiccStatus::Unknown(other),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, PiccStatus::OperationOk)
    }

    pub fn is_additional_frame(&self) -> bool {
        matches!(self, PiccStatus::AdditionalFrame)
    }
}

/// Errors surfaced to callers of any family engine (§7 of the design).
#[derive(Debug)]
pub enum Error {
    /// The reader/transport reported an I/O failure; session state becomes suspect.
    Transport(String),
    /// Operation called on an inactive tag, or on the wrong family.
    InvalidState(&'static str),
    /// Malformed key length, out-of-range page/block, unknown communication mode.
    InvalidArgument(&'static str),
    /// Card reports a permission, authentication, or access-rights violation.
    AccessDenied,
    /// CRC, MAC, or CMAC mismatch in a received payload, or a value-block
    /// self-consistency failure.
    Integrity(&'static str),
    /// Any other card-reported status; the verbatim byte is preserved.
    Card(PiccStatus),
    /// Diversifying into an unsupported key kind, or diversifier message overflow.
    CryptoConfig(&'static str),
    /// The tag dispatcher could not match the target descriptor.
    UnknownTagType,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(msg) => write!(f, "transport error: {msg}"),
            Error::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::AccessDenied => write!(f, "access denied"),
            Error::Integrity(msg) => write!(f, "integrity error: {msg}"),
            Error::Card(status) => write!(f, "card error: {status:?}"),
            Error::CryptoConfig(msg) => write!(f, "crypto configuration error: {msg}"),
            Error::UnknownTagType => write!(f, "unknown tag type"),
        }
    }
}

impl std::error::Error for Error {}

/// Maps a PICC status byte to the caller-visible error, per §7's
/// propagation policy (ADDITIONAL_FRAME is handled by callers before this
/// conversion is ever reached; it is not an error on its own).
pub fn error_from_status(status: PiccStatus) -> Error {
    match status {
        PiccStatus::OperationOk | PiccStatus::AdditionalFrame => {
            unreachable!("non-error status passed to error_from_status")
        }
        PiccStatus::Permission | PiccStatus::Authentication | PiccStatus::PiccDisabled => {
            Error::AccessDenied
        }
        PiccStatus::Integrity | PiccStatus::ApplIntegrity | PiccStatus::PiccIntegrity
        | PiccStatus::FileIntegrity | PiccStatus::Crypto => Error::Integrity("card reported integrity failure"),
        other => Error::Card(other),
    }
}
