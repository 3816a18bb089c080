//! The reader transport adapter (C1).
//!
//! Mirrors the connection-channel abstraction the Security Manager module
//! is built against: a thin `send`/`receive` seam that the protocol engines
//! drive, with the actual bytes-on-the-wire work left to whatever reader
//! driver the embedder plugs in.

use crate::error::Error;

/// Framing mode requested for the next `transceive` call.
///
/// Easy framing lets the reader handle CRC and parity; raw framing is used
/// for NTAG password verification and for DESFire's optional ISO 7816
/// wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Easy,
    Raw,
}

/// A single passive target as reported by the reader, before any family
/// engine has adopted it.
#[derive(Debug, Clone)]
pub struct TargetDescriptor {
    pub uid: Vec<u8>,
    pub sak: u8,
    pub ats: Vec<u8>,
    pub modulation: Modulation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulation {
    Iso14443A,
    FeliCa,
}

/// The one operation a reader driver must provide: forward a request byte
/// sequence and receive a response byte sequence from the card currently
/// selected on this channel.
///
/// A card-level authentication failure surfaces through the returned
/// `Error::AccessDenied`; a transport-level failure (timeout, reader
/// unplugged, bus error) surfaces as `Error::Transport`.
pub trait Transport {
    fn set_framing(&mut self, framing: Framing);
    fn transceive(&mut self, request: &[u8]) -> Result<Vec<u8>, Error>;
}

/// An in-memory transport that answers a fixed script of responses, used to
/// drive the DESFire/Classic/Ultralight engines in tests without a real
/// reader. Each call to `transceive` consumes one scripted response and
/// records the request it was given so a test can assert on wire bytes.
#[cfg(test)]
pub(crate) struct ScriptedTransport {
    pub requests: Vec<Vec<u8>>,
    responses: std::collections::VecDeque<Vec<u8>>,
    pub framing: Framing,
}

#[cfg(test)]
impl ScriptedTransport {
    pub fn new(responses: Vec<Vec<u8>>) -> Self {
        ScriptedTransport {
            requests: Vec::new(),
            responses: responses.into_iter().collect(),
            framing: Framing::Easy,
        }
    }
}

#[cfg(test)]
impl Transport for ScriptedTransport {
    fn set_framing(&mut self, framing: Framing) {
        self.framing = framing;
    }

    fn transceive(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        self.requests.push(request.to_vec());
        self.responses
            .pop_front()
            .ok_or(Error::Transport("scripted transport exhausted".into()))
    }
}
