//! Cryptographic primitives shared by every family engine (C2).
//!
//! The names here ape the Security Manager's toolbox module: small, mostly
//! free functions over raw bytes, with the CBC chaining and CMAC routines
//! built directly on top of the block ciphers instead of a dedicated
//! higher-level crate, because the exact Send/Receive, Legacy/New framing
//! this protocol needs does not match any off-the-shelf CBC-MAC API.

use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::{Des, TdesEde2, TdesEde3};

/// One of the four block ciphers DESFire authentication can select.
pub enum BlockCipher {
    Des(Des),
    TripleDes2Key(TdesEde2),
    TripleDes3Key(TdesEde3),
    Aes128(Aes128),
}

impl BlockCipher {
    pub fn des(key: &[u8; 8]) -> Self {
        BlockCipher::Des(Des::new(GenericArray::from_slice(key)))
    }

    pub fn triple_des_2key(key: &[u8; 16]) -> Self {
        BlockCipher::TripleDes2Key(TdesEde2::new(GenericArray::from_slice(key)))
    }

    pub fn triple_des_3key(key: &[u8; 24]) -> Self {
        BlockCipher::TripleDes3Key(TdesEde3::new(GenericArray::from_slice(key)))
    }

    pub fn aes128(key: &[u8; 16]) -> Self {
        BlockCipher::Aes128(Aes128::new(GenericArray::from_slice(key)))
    }

    pub fn block_size(&self) -> usize {
        match self {
            BlockCipher::Des(_) | BlockCipher::TripleDes2Key(_) | BlockCipher::TripleDes3Key(_) => 8,
            BlockCipher::Aes128(_) => 16,
        }
    }

    pub fn encrypt_block(&self, block: &mut [u8]) {
        match self {
            BlockCipher::Des(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::TripleDes2Key(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::TripleDes3Key(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Aes128(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
        }
    }

    pub fn decrypt_block(&self, block: &mut [u8]) {
        match self {
            BlockCipher::Des(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::TripleDes2Key(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::TripleDes3Key(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            BlockCipher::Aes128(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
        }
    }
}

/// Which side of the exchange a CBC call is processing. Determines whether
/// the IV is XORed in before or after the block operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Whether a CBC call should run the cipher forward or backward; named
/// after the terms the wire format uses rather than "encrypt"/"decrypt" so
/// call sites read like the framing tables they implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Encypher,
    Decypher,
}

fn xor_in_place(data: &mut [u8], mask: &[u8]) {
    for (d, m) in data.iter_mut().zip(mask) {
        *d ^= m;
    }
}

/// CBC-process a single cipher-sized block in place, updating `ivect`.
///
/// On `Send`, the plaintext is XORed with `ivect` before the block
/// operation and the resulting ciphertext becomes the new `ivect`. On
/// `Receive`, the incoming block is saved verbatim, the block operation
/// runs, the result is XORed with the *current* `ivect`, and the saved
/// original block becomes the new `ivect`. This asymmetry is what lets a
/// decrypting reader and an encrypting card stay in lock-step.
pub fn cbc_block(cipher: &BlockCipher, ivect: &mut [u8], block: &mut [u8], direction: Direction, op: Operation) {
    let bs = cipher.block_size();
    debug_assert_eq!(block.len(), bs);
    debug_assert_eq!(ivect.len(), bs);

    let mut saved = [0u8; 16];
    let saved = &mut saved[..bs];

    if direction == Direction::Send {
        xor_in_place(block, ivect);
    } else {
        saved.copy_from_slice(block);
    }

    match op {
        Operation::Encypher => cipher.encrypt_block(block),
        Operation::Decypher => cipher.decrypt_block(block),
    }

    if direction == Direction::Send {
        ivect.copy_from_slice(block);
    } else {
        xor_in_place(block, ivect);
        ivect.copy_from_slice(saved);
    }
}

/// CBC-process `data` (a whole multiple of the cipher's block size) in
/// place, chaining `ivect` block to block.
pub fn cbc_chain(cipher: &BlockCipher, ivect: &mut [u8], data: &mut [u8], direction: Direction, op: Operation) {
    let bs = cipher.block_size();
    debug_assert_eq!(data.len() % bs, 0);
    for block in data.chunks_mut(bs) {
        cbc_block(cipher, ivect, block, direction, op);
    }
}

/// Rotate `data` left by one bit, wrapping the top bit of the first
/// byte into the bottom bit of the last byte (used to roll RndB before
/// it is sent back as part of the authentication challenge).
pub fn rol(data: &mut [u8]) {
    let carry = data[0] & 0x80 != 0;
    let len = data.len();
    for i in 0..len - 1 {
        data[i] = (data[i] << 1) | (data[i + 1] >> 7);
    }
    data[len - 1] = (data[len - 1] << 1) | (carry as u8);
}

fn left_shift_one(data: &mut [u8]) -> bool {
    let len = data.len();
    let carry = data[0] & 0x80 != 0;
    for i in 0..len - 1 {
        data[i] = (data[i] << 1) | (data[i + 1] >> 7);
    }
    data[len - 1] <<= 1;
    carry
}

/// Derive the two CMAC subkeys (NIST SP 800-38B) for `cipher`.
pub fn cmac_subkeys(cipher: &BlockCipher) -> (Vec<u8>, Vec<u8>) {
    let bs = cipher.block_size();
    let r: u8 = if bs == 8 { 0x1B } else { 0x87 };

    let mut l = vec![0u8; bs];
    cipher.encrypt_block(&mut l);

    let mut sk1 = l;
    if left_shift_one(&mut sk1) {
        let last = sk1.len() - 1;
        sk1[last] ^= r;
    }

    let mut sk2 = sk1.clone();
    if left_shift_one(&mut sk2) {
        let last = sk2.len() - 1;
        sk2[last] ^= r;
    }

    (sk1, sk2)
}

/// Compute a CMAC over `data` under the *current* session `ivect`,
/// advancing `ivect` as a side effect — the rolling IV is what lets
/// plain exchanges stay chained for later verification (§4.2/§4.6.3).
pub fn cmac(cipher: &BlockCipher, sk1: &[u8], sk2: &[u8], ivect: &mut [u8], data: &[u8]) -> Vec<u8> {
    let bs = cipher.block_size();
    let mut buffer = data.to_vec();

    if buffer.is_empty() || !buffer.len().is_multiple_of(bs) {
        buffer.push(0x80);
        while !buffer.len().is_multiple_of(bs) {
            buffer.push(0x00);
        }
        let start = buffer.len() - bs;
        xor_in_place(&mut buffer[start..], sk2);
    } else {
        let start = buffer.len() - bs;
        xor_in_place(&mut buffer[start..], sk1);
    }

    cbc_chain(cipher, ivect, &mut buffer, Direction::Send, Operation::Encypher);
    ivect.to_vec()
}

fn crc16_byte(crc: &mut u16, value: u8) {
    const POLY: u16 = 0x8408;
    *crc ^= value as u16;
    for _ in 0..8 {
        let bit_out = *crc & 1;
        *crc >>= 1;
        if bit_out != 0 {
            *crc ^= POLY;
        }
    }
}

/// ISO 14443-A CRC-16 (poly 0x8408, preset 0x6363).
pub fn crc16_iso14443a(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x6363;
    for &b in data {
        crc16_byte(&mut crc, b);
    }
    crc
}

pub fn crc16_append(data: &mut Vec<u8>) {
    let crc = crc16_iso14443a(data);
    data.extend_from_slice(&crc.to_le_bytes());
}

fn crc32_byte(crc: &mut u32, value: u8) {
    const POLY: u32 = 0xEDB88320;
    *crc ^= value as u32;
    for _ in 0..8 {
        let bit_out = *crc & 1;
        *crc >>= 1;
        if bit_out != 0 {
            *crc ^= POLY;
        }
    }
}

/// DESFire CRC-32 (poly 0xEDB88320, preset 0xFFFFFFFF).
pub fn crc32_desfire(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for &b in data {
        crc32_byte(&mut crc, b);
    }
    crc
}

pub fn crc32_append(data: &mut Vec<u8>) {
    let crc = crc32_desfire(data);
    data.extend_from_slice(&crc.to_le_bytes());
}

fn crc8_byte(crc: &mut u8, value: u8) {
    const POLY: u8 = 0x1D;
    *crc ^= value;
    for _ in 0..8 {
        if *crc & 0x80 != 0 {
            *crc = (*crc << 1) ^ POLY;
        } else {
            *crc <<= 1;
        }
    }
}

/// NXP MAD CRC-8 (poly 0x1D, preset 0xC7, MSB-first).
pub fn crc8_mad(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xC7;
    for &b in data {
        crc8_byte(&mut crc, b);
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_of_empty_is_preset() {
        assert_eq!(crc16_iso14443a(&[]), 0x6363);
    }

    #[test]
    fn crc32_of_empty_is_preset() {
        assert_eq!(crc32_desfire(&[]), 0xFFFFFFFF);
    }

    #[test]
    fn crc8_mad_documentation_sample() {
        // §8 S2: MAD v1, info 0x01, AIDs as specified.
        let aids: &[(u8, u8)] = &[
            (0x01, 0x08),
            (0x01, 0x08),
            (0x01, 0x08),
            (0x00, 0x00),
            (0x00, 0x00),
            (0x00, 0x00),
            (0x04, 0x00),
            (0x03, 0x10),
            (0x03, 0x10),
            (0x02, 0x10),
            (0x02, 0x10),
            (0x00, 0x00),
            (0x00, 0x00),
            (0x00, 0x00),
            (0x11, 0x30),
        ];
        let mut bytes = vec![0x01u8];
        for (fcc, ac) in aids {
            bytes.push(*fcc);
            bytes.push(*ac);
        }
        assert_eq!(crc8_mad(&bytes), 0x89);
    }

    #[test]
    fn cbc_send_then_receive_round_trips() {
        let cipher = BlockCipher::aes128(&[0u8; 16]);
        let mut ivect = vec![0u8; 16];
        let mut block = b"0123456789abcdef".to_vec();
        let original = block.clone();

        cbc_block(&cipher, &mut ivect, &mut block, Direction::Send, Operation::Encypher);
        assert_ne!(block, original);

        let mut ivect2 = vec![0u8; 16];
        cbc_block(&cipher, &mut ivect2, &mut block, Direction::Receive, Operation::Decypher);
        assert_eq!(block, original);
    }

    #[test]
    fn cmac_subkeys_are_deterministic_and_distinct() {
        let cipher = BlockCipher::aes128(&[0x2bu8, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c]);
        let (sk1, sk2) = cmac_subkeys(&cipher);
        // RFC 4493 test vector.
        assert_eq!(sk1, vec![0xfb, 0xee, 0xd6, 0x18, 0x35, 0x71, 0x33, 0x66, 0x7c, 0x85, 0xe0, 0x8f, 0x72, 0x36, 0xa8, 0xde]);
        assert_eq!(sk2, vec![0xf7, 0xdd, 0xac, 0x30, 0x6a, 0xe2, 0x66, 0xcc, 0xf9, 0x0b, 0xc1, 0x1e, 0xe4, 0x6d, 0x51, 0x3b]);
    }
}
