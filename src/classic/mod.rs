//! MIFARE Classic engine (C7): access-bit decoding, sector geometry,
//! trailer construction, and the authenticate/read/write/value commands.

use std::collections::HashMap;

use crate::error::Error;
use crate::key::ClassicKey;
use crate::transport::{Framing, TargetDescriptor, Transport};

const MC_AUTH_A: u8 = 0x60;
const MC_AUTH_B: u8 = 0x61;
const MC_READ: u8 = 0x30;
const MC_WRITE: u8 = 0xA0;
const MC_TRANSFER: u8 = 0xB0;
const MC_DECREMENT: u8 = 0xC0;
const MC_INCREMENT: u8 = 0xC1;
const MC_RESTORE: u8 = 0xC2;

/// Which half of a sector's trailer was last presented to the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    A,
    B,
}

pub type BlockNumber = u8;

/// Per-operation permission flags for a data block (bits of
/// `mifare_data_access_permissions` table entries).
pub mod data_permission {
    pub const READ: u8 = 0x8;
    pub const WRITE: u8 = 0x4;
    pub const DECREMENT: u8 = 0x2;
    pub const INCREMENT_TRANSFER_RESTORE: u8 = 0x1;
}

/// Per-operation permission flags for a trailer block (bits of
/// `mifare_trailer_access_permissions` table entries).
pub mod trailer_permission {
    pub const READ_KEYA: u16 = 0x400;
    pub const WRITE_KEYA: u16 = 0x100;
    pub const READ_ACCESS_BITS: u16 = 0x040;
    pub const WRITE_ACCESS_BITS: u16 = 0x010;
    pub const READ_KEYB: u16 = 0x004;
    pub const WRITE_KEYB: u16 = 0x001;
}

const DATA_BLOCK_PERMISSIONS: [u8; 8] = [0xff, 0x8c, 0x88, 0xaf, 0xaa, 0x08, 0x0c, 0x00];
const TRAILER_BLOCK_PERMISSIONS: [u16; 8] = [0x28a, 0x1c1, 0x088, 0x0c0, 0x2aa, 0x0d0, 0x1d1, 0x0c0];

/// Sector number holding `block`.
pub fn block_sector(block: BlockNumber) -> u8 {
    if block < 128 {
        block / 4
    } else {
        32 + (block - 128) / 16
    }
}

/// First block number of `sector`.
pub fn sector_first_block(sector: u8) -> BlockNumber {
    if sector < 32 {
        4 * sector
    } else {
        128 + 16 * (sector - 32)
    }
}

/// Number of blocks in `sector` (4 for sectors 0-31, 16 for 32-39).
pub fn sector_block_count(sector: u8) -> u8 {
    if sector < 32 {
        4
    } else {
        16
    }
}

/// Last block number (the trailer) of `sector`.
pub fn sector_last_block(sector: u8) -> BlockNumber {
    sector_first_block(sector) + (sector_block_count(sector) - 1)
}

/// Bit position within the access-bit nibbles that `block` occupies.
/// A trailer block always resolves to shift 3, without special-casing,
/// because of how the 16-block sectors' grouping lines up.
pub fn block_access_bits_shift(block: BlockNumber) -> u8 {
    if block < 128 {
        block % 4
    } else {
        ((block - 128) % 16) / 5
    }
}

/// The decoded (C1, C2, C3) nibbles for a sector's trailer, plus whether
/// they validated against their stored complements.
#[derive(Debug, Clone, Copy)]
pub struct AccessBits {
    pub c1: u8,
    pub c2: u8,
    pub c3: u8,
}

/// Decode the three access-bit bytes (trailer bytes 6..9 less the GPB, i.e.
/// `trailer[6..9]`) validating the complement relationship. Returns
/// `Error::Integrity` if the sector is locked (complement mismatch).
pub fn decode_access_bits(raw: &[u8; 3]) -> Result<AccessBits, Error> {
    let (b6, b7, b8) = (raw[0], raw[1], raw[2]);
    let c1 = (b7 >> 4) & 0x0F;
    let c1_compl = b6 & 0x0F;
    let c2 = b8 & 0x0F;
    let c2_compl = (b6 >> 4) & 0x0F;
    let c3 = (b8 >> 4) & 0x0F;
    let c3_compl = b7 & 0x0F;

    if c1_compl != !c1 & 0x0F || c2_compl != !c2 & 0x0F || c3_compl != !c3 & 0x0F {
        return Err(Error::Integrity("trailer access bits fail complement check"));
    }

    Ok(AccessBits { c1, c2, c3 })
}

/// Encode the three access-bit bytes for four block positions, each given
/// as a 3-bit (C1,C2,C3) code (bit 0 = C1, bit 1 = C2, bit 2 = C3).
pub fn encode_access_bits(ab0: u8, ab1: u8, ab2: u8, ab_trailer: u8) -> [u8; 3] {
    let bit = |code: u8, n: u8| (code >> n) & 1;
    let nibble = |n: u8| bit(ab0, n) | (bit(ab1, n) << 1) | (bit(ab2, n) << 2) | (bit(ab_trailer, n) << 3);

    let c1 = nibble(0);
    let c2 = nibble(1);
    let c3 = nibble(2);

    let b6 = ((!c2 & 0x0F) << 4) | (!c1 & 0x0F);
    let b7 = ((c1 & 0x0F) << 4) | (!c3 & 0x0F);
    let b8 = ((c3 & 0x0F) << 4) | (c2 & 0x0F);

    [b6, b7, b8]
}

impl AccessBits {
    /// The 3-bit (C1,C2,C3) code for the block at `shift`, used to index
    /// the permission tables.
    pub fn triplet_at(&self, shift: u8) -> u8 {
        let bit = |nibble: u8| (nibble >> shift) & 1;
        bit(self.c1) | (bit(self.c2) << 1) | (bit(self.c3) << 2)
    }
}

/// Whether `permission` is granted for a data block's access triplet, for
/// the given key type.
pub fn data_block_permission(triplet: u8, permission: u8, key_type: KeyType) -> bool {
    let entry = DATA_BLOCK_PERMISSIONS[triplet as usize];
    match key_type {
        KeyType::A => entry & (permission << 4) != 0,
        KeyType::B => entry & permission != 0,
    }
}

/// Whether `permission` is granted for a trailer block's access triplet,
/// for the given key type.
pub fn trailer_block_permission(triplet: u8, permission: u16, key_type: KeyType) -> bool {
    let entry = TRAILER_BLOCK_PERMISSIONS[triplet as usize];
    match key_type {
        KeyType::A => entry & permission != 0,
        KeyType::B => (entry << 1) & permission != 0,
    }
}

/// Build a full 16-byte trailer block.
pub fn build_trailer_block(key_a: &ClassicKey, ab0: u8, ab1: u8, ab2: u8, ab_trailer: u8, gpb: u8, key_b: &ClassicKey) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..6].copy_from_slice(&key_a.0);
    block[6..9].copy_from_slice(&encode_access_bits(ab0, ab1, ab2, ab_trailer));
    block[9] = gpb;
    block[10..16].copy_from_slice(&key_b.0);
    block
}

/// Encode a 16-byte value block.
pub fn encode_value_block(value: i32, addr: u8) -> [u8; 16] {
    let mut block = [0u8; 16];
    let v = value.to_le_bytes();
    let nv = (!value).to_le_bytes();
    block[0..4].copy_from_slice(&v);
    block[4..8].copy_from_slice(&nv);
    block[8..12].copy_from_slice(&v);
    block[12] = addr;
    block[13] = !addr;
    block[14] = addr;
    block[15] = !addr;
    block
}

/// Decode and verify a 16-byte value block (§8 invariant 4).
pub fn decode_value_block(block: &[u8; 16]) -> Result<(i32, u8), Error> {
    let v1 = i32::from_le_bytes(block[0..4].try_into().unwrap());
    let nv1 = i32::from_le_bytes(block[4..8].try_into().unwrap());
    let v2 = i32::from_le_bytes(block[8..12].try_into().unwrap());
    if v1 != v2 || nv1 != !v1 {
        return Err(Error::Integrity("value block value/complement mismatch"));
    }
    let (a0, a1, a2, a3) = (block[12], block[13], block[14], block[15]);
    if a0 != a2 || a1 != !a0 || a3 != !a2 {
        return Err(Error::Integrity("value block address/complement mismatch"));
    }
    Ok((v1, a0))
}

/// Two-level cache mirroring §9's design note: a cached trailer block
/// number + its decoded access bits, plus a per-block triplet cache that
/// is invalidated whenever the trailer cache is.
#[derive(Default)]
struct AccessCache {
    trailer_block: Option<BlockNumber>,
    access_bits: Option<AccessBits>,
    block_triplets: HashMap<BlockNumber, u8>,
}

impl AccessCache {
    fn invalidate(&mut self) {
        self.trailer_block = None;
        self.access_bits = None;
        self.block_triplets.clear();
    }

    fn populate(&mut self, trailer_block: BlockNumber, access_bits: AccessBits) {
        self.trailer_block = Some(trailer_block);
        self.access_bits = Some(access_bits);
        self.block_triplets.clear();
    }
}

/// A connected MIFARE Classic tag.
pub struct ClassicTag<T: Transport> {
    transport: T,
    target: TargetDescriptor,
    active: bool,
    last_key_type: Option<KeyType>,
    cache: AccessCache,
}

impl<T: Transport> ClassicTag<T> {
    pub fn new(transport: T, target: TargetDescriptor) -> Self {
        ClassicTag {
            transport,
            target,
            active: false,
            last_key_type: None,
            cache: AccessCache::default(),
        }
    }

    pub fn connect(&mut self) -> Result<(), Error> {
        if self.active {
            return Err(Error::InvalidState("tag already connected"));
        }
        self.active = true;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.active = false;
        self.cache.invalidate();
        self.last_key_type = None;
    }

    pub fn uid(&self) -> &[u8] {
        &self.target.uid
    }

    /// Authenticate against `block`'s sector; invalidates the access
    /// cache's trailer level (a fresh authenticate may run against a
    /// sector whose permissions have since changed on the card).
    pub fn authenticate(&mut self, block: BlockNumber, key: &ClassicKey, key_type: KeyType) -> Result<(), Error> {
        if !self.active {
            return Err(Error::InvalidState("tag not connected"));
        }
        let cmd = match key_type {
            KeyType::A => MC_AUTH_A,
            KeyType::B => MC_AUTH_B,
        };
        let uid_tail = last_four(&self.target.uid);
        let mut request = vec![cmd, block];
        request.extend_from_slice(&key.0);
        request.extend_from_slice(&uid_tail);

        self.transport.set_framing(Framing::Easy);
        let response = self.transport.transceive(&request)?;
        if response.first() != Some(&0x00) {
            return Err(Error::AccessDenied);
        }
        self.last_key_type = Some(key_type);
        self.cache.invalidate();
        Ok(())
    }

    fn ensure_access_bits(&mut self, block: BlockNumber) -> Result<AccessBits, Error> {
        let trailer = sector_last_block(block_sector(block));
        if self.cache.trailer_block != Some(trailer) {
            let raw = self.read(trailer)?;
            let access_bits = decode_access_bits(&raw[6..9].try_into().unwrap())?;
            self.cache.populate(trailer, access_bits);
        }
        Ok(self.cache.access_bits.expect("populated above"))
    }

    pub fn get_data_block_permission(&mut self, block: BlockNumber, permission: u8) -> Result<bool, Error> {
        let key_type = self.last_key_type.ok_or(Error::InvalidState("not authenticated"))?;
        let access_bits = self.ensure_access_bits(block)?;
        let shift = block_access_bits_shift(block);
        let triplet = *self
            .cache
            .block_triplets
            .entry(block)
            .or_insert_with(|| access_bits.triplet_at(shift));
        Ok(data_block_permission(triplet, permission, key_type))
    }

    pub fn get_trailer_block_permission(&mut self, block: BlockNumber, permission: u16) -> Result<bool, Error> {
        let key_type = self.last_key_type.ok_or(Error::InvalidState("not authenticated"))?;
        let access_bits = self.ensure_access_bits(block)?;
        Ok(trailer_block_permission(access_bits.triplet_at(3), permission, key_type))
    }

    pub fn read(&mut self, block: BlockNumber) -> Result<[u8; 16], Error> {
        self.transport.set_framing(Framing::Easy);
        let response = self.transport.transceive(&[MC_READ, block])?;
        if response.len() != 16 {
            return Err(Error::Integrity("short read response"));
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(&response);
        Ok(out)
    }

    pub fn write(&mut self, block: BlockNumber, data: &[u8; 16]) -> Result<(), Error> {
        let mut request = vec![MC_WRITE, block];
        request.extend_from_slice(data);
        self.transport.set_framing(Framing::Easy);
        let response = self.transport.transceive(&request)?;
        if response.first() != Some(&0x00) {
            return Err(Error::Card(crate::error::PiccStatus::from_byte(*response.first().unwrap_or(&0xFF))));
        }
        self.cache.block_triplets.remove(&block);
        Ok(())
    }

    pub fn init_value(&mut self, block: BlockNumber, value: i32, addr: u8) -> Result<(), Error> {
        self.write(block, &encode_value_block(value, addr))
    }

    pub fn read_value(&mut self, block: BlockNumber) -> Result<(i32, u8), Error> {
        let raw = self.read(block)?;
        decode_value_block(&raw)
    }

    fn value_op(&mut self, cmd: u8, block: BlockNumber, amount: Option<i32>) -> Result<(), Error> {
        let mut request = vec![cmd, block];
        if let Some(amount) = amount {
            request.extend_from_slice(&amount.to_le_bytes());
        }
        self.transport.set_framing(Framing::Easy);
        let response = self.transport.transceive(&request)?;
        if response.first() != Some(&0x00) {
            return Err(Error::AccessDenied);
        }
        Ok(())
    }

    pub fn increment(&mut self, block: BlockNumber, amount: i32) -> Result<(), Error> {
        self.value_op(MC_INCREMENT, block, Some(amount))
    }

    pub fn decrement(&mut self, block: BlockNumber, amount: i32) -> Result<(), Error> {
        self.value_op(MC_DECREMENT, block, Some(amount))
    }

    pub fn restore(&mut self, block: BlockNumber) -> Result<(), Error> {
        self.value_op(MC_RESTORE, block, None)
    }

    pub fn transfer(&mut self, block: BlockNumber) -> Result<(), Error> {
        self.value_op(MC_TRANSFER, block, None)
    }

    /// Format every data block of `sector` to zero and reset its trailer
    /// to the public default (§8 invariant 1 / S1).
    pub fn format_sector(&mut self, sector: u8) -> Result<(), Error> {
        let first = sector_first_block(sector);
        let last = sector_last_block(sector);
        let start = if sector == 0 { first + 1 } else { first };
        for block in start..last {
            self.write(block, &[0u8; 16])?;
        }
        let key_a = ClassicKey([0xFF; 6]);
        let key_b = ClassicKey([0xFF; 6]);
        let mut trailer = [0u8; 16];
        trailer[0..6].copy_from_slice(&key_a.0);
        trailer[6..10].copy_from_slice(&[0xFF, 0x07, 0x80, 0x69]);
        trailer[10..16].copy_from_slice(&key_b.0);
        self.write(last, &trailer)
    }
}

#[cfg(test)]
impl ClassicTag<crate::transport::ScriptedTransport> {
    pub(crate) fn transport_requests(&self) -> &[Vec<u8>] {
        &self.transport.requests
    }
}

fn last_four(uid: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    let len = uid.len();
    out.copy_from_slice(&uid[len - 4..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_matches_spec() {
        assert_eq!(sector_first_block(0), 0);
        assert_eq!(sector_last_block(0), 3);
        assert_eq!(sector_first_block(31), 124);
        assert_eq!(sector_first_block(32), 128);
        assert_eq!(sector_last_block(32), 143);
        assert_eq!(sector_last_block(39), 255);
        assert_eq!(block_sector(128), 32);
        assert_eq!(block_sector(255), 39);
    }

    #[test]
    fn access_bits_shift_matches_spec() {
        assert_eq!(block_access_bits_shift(0), 0);
        assert_eq!(block_access_bits_shift(3), 3);
        assert_eq!(block_access_bits_shift(128), 0);
        assert_eq!(block_access_bits_shift(143), 3);
    }

    #[test]
    fn default_transport_key_encode_decode_round_trip() {
        let raw = encode_access_bits(0, 0, 0, 1); // FF 07 80 default-ish pattern
        let decoded = decode_access_bits(&raw).unwrap();
        assert_eq!(decoded.triplet_at(0), 0);
        assert_eq!(decoded.triplet_at(3), 1);
    }

    #[test]
    fn default_key_trailer_decodes_to_transport_configuration() {
        // FF 07 80 is the well-known default transport-configuration
        // access bits (everything open under key A).
        let decoded = decode_access_bits(&[0xFF, 0x07, 0x80]).unwrap();
        assert_eq!(decoded.triplet_at(0), 0);
        assert_eq!(decoded.triplet_at(3), 4);
    }

    #[test]
    fn value_block_round_trips() {
        let block = encode_value_block(42, 7);
        assert_eq!(decode_value_block(&block).unwrap(), (42, 7));
    }

    #[test]
    fn value_block_rejects_corrupted_complement() {
        let mut block = encode_value_block(42, 7);
        block[4] ^= 0xFF;
        assert!(decode_value_block(&block).is_err());
    }

    #[test]
    fn format_sector_zeroes_data_and_resets_trailer() {
        use crate::transport::ScriptedTransport;
        // S1: authenticate, write, format, then read back.
        let responses = vec![
            vec![0x00],       // authenticate
            vec![0x00],       // write block 60 (the setup write in S1)
            vec![0x00],       // format: write block 60
            vec![0x00],       // format: write block 61
            vec![0x00],       // format: write block 62
            vec![0x00],       // format: write trailer 63
            vec![0u8; 16],    // read block 60
        ];
        let transport = ScriptedTransport::new(responses);
        let target = TargetDescriptor {
            uid: vec![0x01, 0x02, 0x03, 0x04],
            sak: 0x08,
            ats: vec![],
            modulation: crate::transport::Modulation::Iso14443A,
        };
        let mut tag = ClassicTag::new(transport, target);
        tag.connect().unwrap();
        tag.authenticate(60, &ClassicKey([0xFF; 6]), KeyType::A).unwrap();
        tag.write(60, &[1u8; 16]).unwrap();
        tag.format_sector(15).unwrap();
        let read_back = tag.read(60).unwrap();
        assert_eq!(read_back, [0u8; 16]);
    }
}
