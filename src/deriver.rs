//! AN10922 key diversification (C4).
//!
//! A stateful builder: accumulate a diversification message, then derive a
//! key of a chosen kind by running CMAC(master, DIV ∥ message) once, twice,
//! or three times depending on the master's cipher block size and the
//! requested output kind, and concatenating the results.

use crate::crypto::cmac;
use crate::error::Error;
use crate::key::DesfireKey;

const MAX_MESSAGE_LEN: usize = 48;

/// The kind of key AN10922 can emit. DES output is intentionally absent —
/// the algorithm does not support diversifying into a single-DES key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKeyKind {
    Aes128,
    TripleDes2Key,
    TripleK3Des,
}

/// Builder for one diversified key. Borrow the master key for the
/// builder's lifetime so the derived subkeys/schedule stay valid.
pub struct An10922Deriver<'a> {
    master: &'a DesfireKey,
    output_kind: OutputKeyKind,
    message: Vec<u8>,
    overflowed: bool,
    /// Accepted for API compatibility with callers that set it; this
    /// implementation does not reproduce the historical extra-iteration
    /// bug it once named (not observed in the reference source used to
    /// ground this crate — see DESIGN.md).
    pub emulate_issue_91: bool,
}

impl<'a> An10922Deriver<'a> {
    pub fn new(master: &'a DesfireKey, output_kind: OutputKeyKind) -> Result<Self, Error> {
        let block_size = master.cipher().block_size();
        let supported = matches!(
            (output_kind, block_size),
            (OutputKeyKind::Aes128, 16) | (OutputKeyKind::TripleDes2Key, 8) | (OutputKeyKind::TripleDes2Key, 16) | (OutputKeyKind::TripleK3Des, 8)
        );
        if !supported {
            return Err(Error::CryptoConfig("unsupported master key / output kind combination"));
        }

        let mut deriver = An10922Deriver {
            master,
            output_kind,
            message: Vec::new(),
            overflowed: false,
            emulate_issue_91: false,
        };
        deriver.begin();
        Ok(deriver)
    }

    /// Reset the accumulating message; byte 0 is a placeholder for the
    /// DIV constant written in at `end_raw` time.
    pub fn begin(&mut self) {
        self.message.clear();
        self.message.push(0);
        self.overflowed = false;
    }

    fn push(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.overflowed || self.message.len() + bytes.len() > MAX_MESSAGE_LEN {
            self.overflowed = true;
            return Err(Error::CryptoConfig("diversification message overflow"));
        }
        self.message.extend_from_slice(bytes);
        Ok(())
    }

    pub fn update_data(&mut self, data: &[u8]) -> Result<(), Error> {
        self.push(data)
    }

    pub fn update_cstr(&mut self, s: &str) -> Result<(), Error> {
        self.push(s.as_bytes())
    }

    pub fn update_aid(&mut self, aid: [u8; 3]) -> Result<(), Error> {
        self.push(&aid)
    }

    pub fn update_uid(&mut self, uid: &[u8]) -> Result<(), Error> {
        self.push(uid)
    }

    fn div_constants(&self) -> &'static [u8] {
        match (self.output_kind, self.master.cipher().block_size()) {
            (OutputKeyKind::Aes128, 16) => &[0x01],
            (OutputKeyKind::TripleDes2Key, 16) => &[0x21],
            (OutputKeyKind::TripleDes2Key, 8) => &[0x21, 0x22],
            (OutputKeyKind::TripleK3Des, 8) => &[0x31, 0x32, 0x33],
            _ => unreachable!("validated in new()"),
        }
    }

    /// Run the CMAC derivation and return the raw diversified bytes,
    /// without wrapping them into a typed key.
    pub fn end_raw(&self) -> Result<Vec<u8>, Error> {
        if self.overflowed {
            return Err(Error::CryptoConfig("diversification message overflow"));
        }

        let sk = self
            .master
            .cmac_subkeys()
            .ok_or(Error::CryptoConfig("master key has no CMAC subkeys"))?;
        let (sk1, sk2) = sk;

        let mut out = Vec::new();
        for &div in self.div_constants() {
            let mut message = self.message.clone();
            message[0] = div;
            // Each DIV iteration starts from a fresh zero IV: this is a
            // one-shot derivation, not a chained session CMAC.
            let mut ivect = vec![0u8; self.master.cipher().block_size()];
            out.extend(cmac(self.master.cipher(), sk1, sk2, &mut ivect, &message));
        }
        Ok(out)
    }

    /// Wrap `end_raw()`'s bytes into a typed key carrying the master's
    /// version.
    pub fn end(&self) -> Result<DesfireKey, Error> {
        let bytes = self.end_raw()?;
        let version = self.master.get_version();
        Ok(match self.output_kind {
            OutputKeyKind::Aes128 => {
                let mut arr = [0u8; 16];
                arr.copy_from_slice(&bytes);
                DesfireKey::aes128_with_version(arr, version)
            }
            OutputKeyKind::TripleDes2Key => {
                let mut arr = [0u8; 16];
                arr.copy_from_slice(&bytes);
                let mut key = DesfireKey::triple_des_with_version(arr);
                key.set_version(version);
                key
            }
            OutputKeyKind::TripleK3Des => {
                let mut arr = [0u8; 24];
                arr.copy_from_slice(&bytes);
                let mut key = DesfireKey::triple_k3des_with_version(arr);
                key.set_version(version);
                key
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn an10922_aes128_documentation_sample() {
        // §8 S3.
        let master = DesfireKey::aes128_with_version(
            [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
            16,
        );
        let mut deriver = An10922Deriver::new(&master, OutputKeyKind::Aes128).unwrap();
        deriver.update_data(&[0x04, 0x78, 0x2E, 0x21, 0x80, 0x1D, 0x80]).unwrap();
        deriver.update_data(&[0x30, 0x42, 0xF5]).unwrap();
        deriver.update_cstr("NXP Abu").unwrap();

        let derived = deriver.end_raw().unwrap();
        assert_eq!(
            derived,
            vec![0xA8, 0xDD, 0x63, 0xA3, 0xB8, 0x9D, 0x54, 0xB3, 0x7C, 0xA8, 0x02, 0x47, 0x3F, 0xDA, 0x91, 0x75]
        );
    }

    #[test]
    fn overflow_latches_until_begin() {
        let master = DesfireKey::aes128([0u8; 16]);
        let mut deriver = An10922Deriver::new(&master, OutputKeyKind::Aes128).unwrap();
        assert!(deriver.update_data(&[0u8; 48]).is_err());
        assert!(deriver.update_data(&[0u8; 1]).is_err());
        deriver.begin();
        assert!(deriver.update_data(&[0u8; 1]).is_ok());
    }
}
