//! Key model (C3): DESFire keys of the four supported kinds, MIFARE
//! Classic keys, and NTAG21x password/PACK pairs.

use crate::crypto::{cmac_subkeys, BlockCipher};
use zeroize::Zeroize;

/// The four DESFire key kinds, each carrying its raw bytes, expanded
/// schedule, and (for the New-scheme kinds) CMAC subkeys.
pub enum DesfireKey {
    Des {
        data: [u8; 16],
        cipher: BlockCipher,
    },
    TripleDes {
        data: [u8; 16],
        cipher: BlockCipher,
    },
    TripleK3Des {
        data: [u8; 24],
        cipher: BlockCipher,
        sk1: Vec<u8>,
        sk2: Vec<u8>,
    },
    Aes128 {
        data: [u8; 16],
        version: u8,
        cipher: BlockCipher,
        sk1: Vec<u8>,
        sk2: Vec<u8>,
    },
}

impl Drop for DesfireKey {
    fn drop(&mut self) {
        match self {
            DesfireKey::Des { data, .. } => data.zeroize(),
            DesfireKey::TripleDes { data, .. } => data.zeroize(),
            DesfireKey::TripleK3Des { data, sk1, sk2, .. } => {
                data.zeroize();
                sk1.zeroize();
                sk2.zeroize();
            }
            DesfireKey::Aes128 { data, sk1, sk2, .. } => {
                data.zeroize();
                sk1.zeroize();
                sk2.zeroize();
            }
        }
    }
}

impl DesfireKey {
    /// Construct a DES key from "raw" bytes: parity bits (bit 0 of every
    /// byte) are masked off before the key is stored.
    pub fn des(value: [u8; 8]) -> Self {
        let mut masked = value;
        for b in masked.iter_mut() {
            *b &= 0xfe;
        }
        Self::des_with_version(masked)
    }

    /// Construct a DES key preserving the supplied bytes verbatim (the
    /// low bit of each byte is taken as part of the encoded version).
    pub fn des_with_version(value: [u8; 8]) -> Self {
        let mut data = [0u8; 16];
        data[..8].copy_from_slice(&value);
        data[8..].copy_from_slice(&value);
        let cipher = BlockCipher::des(&value);
        DesfireKey::Des { data, cipher }
    }

    /// Construct a 2-key 3DES key from raw bytes (parity masked: first
    /// half bit 0 cleared, second half bit 0 set, so the two halves can
    /// never collapse into an unversioned DES key by accident).
    pub fn triple_des(value: [u8; 16]) -> Self {
        let mut masked = value;
        for b in masked[..8].iter_mut() {
            *b &= 0xfe;
        }
        for b in masked[8..].iter_mut() {
            *b |= 0x01;
        }
        Self::triple_des_with_version(masked)
    }

    pub fn triple_des_with_version(value: [u8; 16]) -> Self {
        let cipher = BlockCipher::triple_des_2key(&value);
        DesfireKey::TripleDes { data: value, cipher }
    }

    /// Construct a 3-key 3DES (ISO 3K3DES) key from raw bytes.
    pub fn triple_k3des(value: [u8; 24]) -> Self {
        let mut masked = value;
        for b in masked[..8].iter_mut() {
            *b &= 0xfe;
        }
        Self::triple_k3des_with_version(masked)
    }

    pub fn triple_k3des_with_version(value: [u8; 24]) -> Self {
        let cipher = BlockCipher::triple_des_3key(&value);
        let (sk1, sk2) = cmac_subkeys(&cipher);
        DesfireKey::TripleK3Des { data: value, cipher, sk1, sk2 }
    }

    /// Construct an AES-128 key; AES has no parity bits, so "raw" and
    /// "with version" differ only in the explicit version byte.
    pub fn aes128(value: [u8; 16]) -> Self {
        Self::aes128_with_version(value, 0)
    }

    pub fn aes128_with_version(value: [u8; 16], version: u8) -> Self {
        let cipher = BlockCipher::aes128(&value);
        let (sk1, sk2) = cmac_subkeys(&cipher);
        DesfireKey::Aes128 { data: value, version, cipher, sk1, sk2 }
    }

    pub fn cipher(&self) -> &BlockCipher {
        match self {
            DesfireKey::Des { cipher, .. } => cipher,
            DesfireKey::TripleDes { cipher, .. } => cipher,
            DesfireKey::TripleK3Des { cipher, .. } => cipher,
            DesfireKey::Aes128 { cipher, .. } => cipher,
        }
    }

    /// CMAC subkeys, for the New-scheme key kinds that use CMAC framing.
    pub fn cmac_subkeys(&self) -> Option<(&[u8], &[u8])> {
        match self {
            DesfireKey::TripleK3Des { sk1, sk2, .. } => Some((sk1, sk2)),
            DesfireKey::Aes128 { sk1, sk2, .. } => Some((sk1, sk2)),
            _ => None,
        }
    }

    pub fn raw_bytes(&self) -> &[u8] {
        match self {
            DesfireKey::Des { data, .. } => data,
            DesfireKey::TripleDes { data, .. } => data,
            DesfireKey::TripleK3Des { data, .. } => data,
            DesfireKey::Aes128 { data, .. } => data,
        }
    }

    pub fn get_version(&self) -> u8 {
        match self {
            DesfireKey::Aes128 { version, .. } => *version,
            _ => {
                let data = self.raw_bytes();
                let mut version = 0u8;
                for (n, byte) in data.iter().enumerate().take(8) {
                    version |= (byte & 1) << (7 - n);
                }
                version
            }
        }
    }

    /// Rewrite the encoded version, re-deriving the schedule (and, for
    /// 3K3DES, the CMAC subkeys) afterward.
    pub fn set_version(&mut self, version: u8) {
        match self {
            DesfireKey::Aes128 { version: v, .. } => *v = version,
            DesfireKey::Des { data, cipher } => {
                for n in 0..8 {
                    let bit = (version >> (7 - n)) & 1;
                    data[n] = (data[n] & 0xfe) | bit;
                    data[n + 8] = data[n];
                }
                let mut key8 = [0u8; 8];
                key8.copy_from_slice(&data[..8]);
                *cipher = BlockCipher::des(&key8);
            }
            DesfireKey::TripleDes { data, cipher } => {
                for n in 0..8 {
                    let bit = (version >> (7 - n)) & 1;
                    data[n] = (data[n] & 0xfe) | bit;
                    // Write the complement to avoid turning 3DES into DES.
                    data[n + 8] = (data[n + 8] & 0xfe) | (!bit & 1);
                }
                *cipher = BlockCipher::triple_des_2key(data);
            }
            DesfireKey::TripleK3Des { data, cipher, sk1, sk2 } => {
                for n in 0..8 {
                    let bit = (version >> (7 - n)) & 1;
                    data[n] = (data[n] & 0xfe) | bit;
                    data[n + 8] = (data[n + 8] & 0xfe) | (!bit & 1);
                }
                *cipher = BlockCipher::triple_des_3key(data);
                let (new_sk1, new_sk2) = cmac_subkeys(cipher);
                *sk1 = new_sk1;
                *sk2 = new_sk2;
            }
        }
    }

    /// Build the session key from both sides' random nonces after a
    /// successful authentication (§4.6.2), using the same halves the
    /// reference implementation slices out per key kind.
    pub fn session_key(rnd_a: &[u8], rnd_b: &[u8], authentication_key: &DesfireKey) -> DesfireKey {
        match authentication_key {
            DesfireKey::Des { .. } => {
                let mut buf = [0u8; 8];
                buf[..4].copy_from_slice(&rnd_a[..4]);
                buf[4..8].copy_from_slice(&rnd_b[..4]);
                DesfireKey::des_with_version(buf)
            }
            DesfireKey::TripleDes { .. } => {
                let mut buf = [0u8; 16];
                buf[..4].copy_from_slice(&rnd_a[..4]);
                buf[4..8].copy_from_slice(&rnd_b[..4]);
                buf[8..12].copy_from_slice(&rnd_a[4..8]);
                buf[12..16].copy_from_slice(&rnd_b[4..8]);
                DesfireKey::triple_des_with_version(buf)
            }
            DesfireKey::TripleK3Des { .. } => {
                let mut buf = [0u8; 24];
                buf[..4].copy_from_slice(&rnd_a[..4]);
                buf[4..8].copy_from_slice(&rnd_b[..4]);
                buf[8..12].copy_from_slice(&rnd_a[6..10]);
                buf[12..16].copy_from_slice(&rnd_b[6..10]);
                buf[16..20].copy_from_slice(&rnd_a[12..16]);
                buf[20..24].copy_from_slice(&rnd_b[12..16]);
                DesfireKey::triple_k3des(buf)
            }
            DesfireKey::Aes128 { .. } => {
                let mut buf = [0u8; 16];
                buf[..4].copy_from_slice(&rnd_a[..4]);
                buf[4..8].copy_from_slice(&rnd_b[..4]);
                buf[8..12].copy_from_slice(&rnd_a[12..16]);
                buf[12..16].copy_from_slice(&rnd_b[12..16]);
                DesfireKey::aes128(buf)
            }
        }
    }
}

/// The DESFire authentication command used to establish a session with a
/// given key kind; also the source of the Legacy-vs-New scheme split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationScheme {
    Legacy,
    New,
}

impl DesfireKey {
    pub fn authentication_scheme(&self) -> AuthenticationScheme {
        match self {
            DesfireKey::Des { .. } | DesfireKey::TripleDes { .. } => AuthenticationScheme::Legacy,
            DesfireKey::TripleK3Des { .. } | DesfireKey::Aes128 { .. } => AuthenticationScheme::New,
        }
    }
}

/// A plain 6-byte MIFARE Classic key (A or B).
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct ClassicKey(pub [u8; 6]);

/// An NTAG21x 4-byte password plus its 2-byte PACK acknowledgement.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct NtagPassword {
    pub pwd: [u8; 4],
    pub pack: [u8; 2],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn des_version_round_trips() {
        let mut key = DesfireKey::des([0xAAu8; 8]);
        key.set_version(0b1011_0010);
        assert_eq!(key.get_version(), 0b1011_0010);
        // §8 invariant 3.
        let data = key.raw_bytes();
        for i in 0..8 {
            let expected_bit = (0b1011_0010u8 >> (7 - i)) & 1;
            assert_eq!(data[i] & 0x01, expected_bit);
        }
    }

    #[test]
    fn triple_des_second_half_is_complemented() {
        let mut key = DesfireKey::triple_des([0x11u8; 16]);
        key.set_version(0xFF);
        let data = key.raw_bytes();
        for i in 0..8 {
            assert_eq!(data[i] & 1, 1);
            assert_eq!(data[i + 8] & 1, 0);
        }
    }

    #[test]
    fn aes_session_key_uses_expected_halves() {
        let master = DesfireKey::aes128([0u8; 16]);
        let rnd_a: Vec<u8> = (0..16).collect();
        let rnd_b: Vec<u8> = (100..116).collect();
        let session = DesfireKey::session_key(&rnd_a, &rnd_b, &master);
        if let DesfireKey::Aes128 { data, .. } = session {
            assert_eq!(&data[0..4], &rnd_a[0..4]);
            assert_eq!(&data[4..8], &rnd_b[0..4]);
            assert_eq!(&data[8..12], &rnd_a[12..16]);
            assert_eq!(&data[12..16], &rnd_b[12..16]);
        } else {
            panic!("expected an AES session key");
        }
    }
}
