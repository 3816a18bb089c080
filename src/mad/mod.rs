//! MIFARE Application Directory (C8): v1/v2 structures, CRC-8 validation,
//! and the read/write/allocate operations built on top of the Classic
//! engine (C7).

use crate::classic::{self, ClassicTag, KeyType};
use crate::crypto::crc8_mad;
use crate::error::Error;
use crate::key::ClassicKey;
use crate::transport::Transport;

pub fn public_key_a() -> ClassicKey {
    ClassicKey([0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5])
}

/// A 2-byte MAD application identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Aid {
    pub function_cluster_code: u8,
    pub application_code: u8,
}

pub const FREE_AID: Aid = Aid { function_cluster_code: 0x00, application_code: 0x00 };
pub const DEFECT_AID: Aid = Aid { function_cluster_code: 0x00, application_code: 0x01 };
pub const RESERVED_AID: Aid = Aid { function_cluster_code: 0x00, application_code: 0x02 };
pub const CARD_HOLDER_AID: Aid = Aid { function_cluster_code: 0x00, application_code: 0x04 };

const V1_AID_COUNT: usize = 15;
const V2_AID_COUNT: usize = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MadVersion {
    V1,
    V2,
}

pub struct Mad {
    pub version: MadVersion,
    pub card_publisher_sector: u8,
    sectors_1_15: [Aid; V1_AID_COUNT],
    sectors_17_39: [Aid; V2_AID_COUNT],
}

impl Mad {
    pub fn new(version: MadVersion) -> Self {
        Mad {
            version,
            card_publisher_sector: 0,
            sectors_1_15: [FREE_AID; V1_AID_COUNT],
            sectors_17_39: [FREE_AID; V2_AID_COUNT],
        }
    }

    /// All MAD-managed sector numbers for this version (1..=15, plus
    /// 17..=39 for v2).
    fn managed_sectors(&self) -> Vec<u8> {
        let mut sectors: Vec<u8> = (1u8..=15).collect();
        if self.version == MadVersion::V2 {
            sectors.extend(17u8..=39);
        }
        sectors
    }

    fn index_of(&self, sector: u8) -> Option<(bool, usize)> {
        if (1..=15).contains(&sector) {
            Some((true, (sector - 1) as usize))
        } else if self.version == MadVersion::V2 && (17..=39).contains(&sector) {
            Some((false, (sector - 17) as usize))
        } else {
            None
        }
    }

    pub fn get_aid(&self, sector: u8) -> Result<Aid, Error> {
        let (low, idx) = self.index_of(sector).ok_or(Error::InvalidArgument("sector not managed by this MAD"))?;
        Ok(if low { self.sectors_1_15[idx] } else { self.sectors_17_39[idx] })
    }

    pub fn set_aid(&mut self, sector: u8, aid: Aid) -> Result<(), Error> {
        let (low, idx) = self.index_of(sector).ok_or(Error::InvalidArgument("sector not managed by this MAD"))?;
        if low {
            self.sectors_1_15[idx] = aid;
        } else {
            self.sectors_17_39[idx] = aid;
        }
        Ok(())
    }

    pub fn get_card_publisher_sector(&self) -> u8 {
        self.card_publisher_sector
    }

    /// §9: the intended bounds check, not the ambiguous-precedence form.
    pub fn set_card_publisher_sector(&mut self, sector: u8) -> Result<(), Error> {
        let out_of_range = match self.version {
            MadVersion::V1 => sector > 0x0F,
            MadVersion::V2 => sector > 0x27,
        };
        if out_of_range {
            return Err(Error::InvalidArgument("card publisher sector out of range"));
        }
        self.card_publisher_sector = sector;
        Ok(())
    }

    /// Allocate enough free sectors to hold `blocks_needed` data blocks,
    /// preferring the large 16-block sectors for v2 cards before falling
    /// back to the small 4-block ones (§4.8).
    pub fn application_alloc(&mut self, aid: Aid, blocks_needed: u32) -> Result<Vec<u8>, Error> {
        let mut remaining = blocks_needed as i64;
        let mut allocated = Vec::new();

        let mut candidates = self.managed_sectors();
        if self.version == MadVersion::V2 {
            candidates.sort_by_key(|&s| if s >= 17 { 0 } else { 1 });
        }

        for sector in candidates {
            if remaining <= 0 {
                break;
            }
            if self.get_aid(sector)? == FREE_AID {
                let data_blocks = classic::sector_block_count(sector) as i64 - 1;
                self.set_aid(sector, aid)?;
                allocated.push(sector);
                remaining -= data_blocks;
            }
        }

        if remaining > 0 {
            for sector in &allocated {
                self.set_aid(*sector, FREE_AID)?;
            }
            return Err(Error::InvalidArgument("not enough free sectors for application"));
        }
        Ok(allocated)
    }

    pub fn application_free(&mut self, aid: Aid) -> Result<(), Error> {
        for sector in self.managed_sectors() {
            if self.get_aid(sector)? == aid {
                self.set_aid(sector, FREE_AID)?;
            }
        }
        Ok(())
    }

    pub fn application_find(&self, aid: Aid) -> Vec<u8> {
        self.managed_sectors().into_iter().filter(|&s| self.get_aid(s).unwrap() == aid).collect()
    }

    /// Byte stream the CRC-8 runs over: info byte, then each AID's
    /// `function_cluster_code` followed by `application_code` — the struct's
    /// own field order, and the order the documented CRC-8 worked example
    /// requires.
    fn crc_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![self.card_publisher_sector];
        for aid in &self.sectors_1_15 {
            bytes.push(aid.function_cluster_code);
            bytes.push(aid.application_code);
        }
        if self.version == MadVersion::V2 {
            for aid in &self.sectors_17_39 {
                bytes.push(aid.function_cluster_code);
                bytes.push(aid.application_code);
            }
        }
        bytes
    }

    pub fn crc(&self) -> u8 {
        crc8_mad(&self.crc_bytes())
    }
}

fn gpb_byte(version: MadVersion) -> u8 {
    let version_bits = match version {
        MadVersion::V1 => 1,
        MadVersion::V2 => 2,
    };
    0x80 | 0x40 | (version_bits & 0x03)
}

fn decode_sector0(block1: &[u8; 16], block2: &[u8; 16]) -> (u8, u8, [Aid; V1_AID_COUNT]) {
    let crc = block1[0];
    let info = block1[1];
    let mut aids = [FREE_AID; V1_AID_COUNT];
    let mut raw = Vec::with_capacity(30);
    raw.extend_from_slice(&block1[2..16]);
    raw.extend_from_slice(block2);
    for (i, chunk) in raw.chunks(2).enumerate().take(V1_AID_COUNT) {
        aids[i] = Aid { application_code: chunk[0], function_cluster_code: chunk[1] };
    }
    (crc, info, aids)
}

fn encode_sector0(info: u8, aids: &[Aid; V1_AID_COUNT], crc: u8) -> ([u8; 16], [u8; 16]) {
    let mut raw = Vec::with_capacity(30);
    for aid in aids {
        raw.push(aid.application_code);
        raw.push(aid.function_cluster_code);
    }
    let mut block1 = [0u8; 16];
    let mut block2 = [0u8; 16];
    block1[0] = crc;
    block1[1] = info;
    block1[2..16].copy_from_slice(&raw[0..14]);
    block2.copy_from_slice(&raw[14..30]);
    (block1, block2)
}

fn decode_sector16(blocks: &[[u8; 16]; 3]) -> (u8, [Aid; V2_AID_COUNT]) {
    let crc = blocks[0][0];
    let mut raw = Vec::with_capacity(46);
    raw.extend_from_slice(&blocks[0][2..16]);
    raw.extend_from_slice(&blocks[1]);
    raw.extend_from_slice(&blocks[2]);
    let mut aids = [FREE_AID; V2_AID_COUNT];
    for (i, chunk) in raw.chunks(2).enumerate().take(V2_AID_COUNT) {
        aids[i] = Aid { application_code: chunk[0], function_cluster_code: chunk[1] };
    }
    (crc, aids)
}

fn encode_sector16(aids: &[Aid; V2_AID_COUNT], crc: u8) -> [[u8; 16]; 3] {
    let mut raw = Vec::with_capacity(46);
    for aid in aids {
        raw.push(aid.application_code);
        raw.push(aid.function_cluster_code);
    }
    let mut blocks = [[0u8; 16]; 3];
    blocks[0][0] = crc;
    blocks[0][1] = 0;
    blocks[0][2..16].copy_from_slice(&raw[0..14]);
    blocks[1].copy_from_slice(&raw[14..30]);
    blocks[2].copy_from_slice(&raw[30..46]);
    blocks
}

/// Read and validate a MAD from a MIFARE Classic tag.
pub fn mad_read<T: Transport>(tag: &mut ClassicTag<T>) -> Result<Mad, Error> {
    tag.authenticate(classic::sector_last_block(0), &public_key_a(), KeyType::A)?;
    let trailer = tag.read(classic::sector_last_block(0))?;
    let gpb = trailer[9];
    let version = match gpb & 0x03 {
        1 => MadVersion::V1,
        2 => MadVersion::V2,
        _ => return Err(Error::Integrity("unsupported MAD version in GPB")),
    };

    let block1: [u8; 16] = tag.read(0x01)?;
    let block2: [u8; 16] = tag.read(0x02)?;
    let (crc, info, sectors_1_15) = decode_sector0(&block1, &block2);

    let mut mad = Mad::new(version);
    mad.card_publisher_sector = info;
    mad.sectors_1_15 = sectors_1_15;

    if version == MadVersion::V2 {
        tag.authenticate(classic::sector_last_block(16), &public_key_a(), KeyType::A)?;
        let b40 = tag.read(0x40)?;
        let b41 = tag.read(0x41)?;
        let b42 = tag.read(0x42)?;
        let (crc2, sectors_17_39) = decode_sector16(&[b40, b41, b42]);
        mad.sectors_17_39 = sectors_17_39;
        if crc2 != mad.crc() {
            return Err(Error::Integrity("MAD v2 CRC-8 mismatch"));
        }
    }

    if crc != crc8_mad(&{
        let mut v1_only = Mad::new(MadVersion::V1);
        v1_only.card_publisher_sector = mad.card_publisher_sector;
        v1_only.sectors_1_15 = mad.sectors_1_15;
        v1_only.crc_bytes()
    }) {
        return Err(Error::Integrity("MAD v1 CRC-8 mismatch"));
    }

    Ok(mad)
}

/// Write a MAD back to the card, using `key_b_s0`/`key_b_s10` as the new
/// trailer key B for sector 0 and sector 16 respectively.
pub fn mad_write<T: Transport>(
    tag: &mut ClassicTag<T>,
    mad: &Mad,
    key_b_s0: &ClassicKey,
    key_b_s10: &ClassicKey,
) -> Result<(), Error> {
    tag.authenticate(classic::sector_last_block(0), &public_key_a(), KeyType::A)?;
    if !tag.get_trailer_block_permission(classic::sector_last_block(0), classic::trailer_permission::WRITE_KEYB)? {
        return Err(Error::AccessDenied);
    }

    let mut v1_only = Mad::new(MadVersion::V1);
    v1_only.card_publisher_sector = mad.card_publisher_sector;
    v1_only.sectors_1_15 = mad.sectors_1_15;
    let (block1, block2) = encode_sector0(mad.card_publisher_sector, &mad.sectors_1_15, v1_only.crc());
    tag.write(0x01, &block1)?;
    tag.write(0x02, &block2)?;

    let gpb = gpb_byte(mad.version);
    let trailer0 = classic::build_trailer_block(&public_key_a(), 0x0, 0x1, 0x1, 0x6, gpb, key_b_s0);
    tag.write(classic::sector_last_block(0), &trailer0)?;

    if mad.version == MadVersion::V2 {
        let blocks = encode_sector16(&mad.sectors_17_39, mad.crc());
        tag.write(0x40, &blocks[0])?;
        tag.write(0x41, &blocks[1])?;
        tag.write(0x42, &blocks[2])?;
        let trailer16 = classic::build_trailer_block(&public_key_a(), 0x0, 0x1, 0x1, 0x6, gpb, key_b_s10);
        tag.write(classic::sector_last_block(16), &trailer16)?;
    }

    Ok(())
}

/// Read an application's data blocks out of the sectors `mad` has allocated
/// to `aid`, authenticating each sector's first block with `key`/`key_type`
/// as it goes. Returns as many bytes as fit the allocated sectors, which may
/// be fewer than `buf.len()` if the application's directory entry spans less
/// space than requested.
pub fn mad_application_read<T: Transport>(
    tag: &mut ClassicTag<T>,
    mad: &Mad,
    aid: Aid,
    buf: &mut [u8],
    key: &ClassicKey,
    key_type: KeyType,
) -> Result<usize, Error> {
    let sectors = mad.application_find(aid);
    if sectors.is_empty() {
        return Err(Error::InvalidArgument("no sectors allocated to this AID"));
    }

    let mut written = 0usize;
    for sector in sectors {
        if written >= buf.len() {
            break;
        }
        let first_block = classic::sector_first_block(sector);
        let last_block = classic::sector_last_block(sector);
        tag.authenticate(first_block, key, key_type)?;

        let mut block = first_block;
        while block < last_block && written < buf.len() {
            let data = tag.read(block)?;
            let n = std::cmp::min(buf.len() - written, data.len());
            buf[written..written + n].copy_from_slice(&data[..n]);
            written += n;
            block += 1;
        }
    }

    Ok(written)
}

/// Write `data` into the sectors `mad` has allocated to `aid`, authenticating
/// each sector's first block with `key`/`key_type`. A final partial block is
/// read first so the untouched tail bytes survive the write.
pub fn mad_application_write<T: Transport>(
    tag: &mut ClassicTag<T>,
    mad: &Mad,
    aid: Aid,
    data: &[u8],
    key: &ClassicKey,
    key_type: KeyType,
) -> Result<usize, Error> {
    let sectors = mad.application_find(aid);
    if sectors.is_empty() {
        return Err(Error::InvalidArgument("no sectors allocated to this AID"));
    }

    let mut consumed = 0usize;
    for sector in sectors {
        if consumed >= data.len() {
            break;
        }
        let first_block = classic::sector_first_block(sector);
        let last_block = classic::sector_last_block(sector);
        tag.authenticate(first_block, key, key_type)?;

        let mut block = first_block;
        while block < last_block && consumed < data.len() {
            let remaining = data.len() - consumed;
            let mut to_write = [0u8; 16];
            if remaining >= 16 {
                to_write.copy_from_slice(&data[consumed..consumed + 16]);
            } else {
                let existing = tag.read(block)?;
                to_write.copy_from_slice(&existing);
                to_write[..remaining].copy_from_slice(&data[consumed..]);
            }
            tag.write(block, &to_write)?;
            consumed += std::cmp::min(remaining, 16);
            block += 1;
        }
    }

    Ok(consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc8_documentation_sample() {
        let mut mad = Mad::new(MadVersion::V1);
        mad.card_publisher_sector = 0x01;
        let layout: [(u8, u8); 15] = [
            (0x01, 0x08), (0x01, 0x08), (0x01, 0x08),
            (0x00, 0x00), (0x00, 0x00), (0x00, 0x00),
            (0x04, 0x00),
            (0x03, 0x10), (0x03, 0x10),
            (0x02, 0x10), (0x02, 0x10),
            (0x00, 0x00), (0x00, 0x00), (0x00, 0x00),
            (0x11, 0x30),
        ];
        for (sector, (fcc, ac)) in (1u8..=15).zip(layout) {
            mad.set_aid(sector, Aid { function_cluster_code: fcc, application_code: ac }).unwrap();
        }
        assert_eq!(mad.crc(), 0x89);
    }

    #[test]
    fn card_publisher_sector_bounds() {
        let mut v1 = Mad::new(MadVersion::V1);
        assert!(v1.set_card_publisher_sector(0x0F).is_ok());
        assert!(v1.set_card_publisher_sector(0x10).is_err());

        let mut v2 = Mad::new(MadVersion::V2);
        assert!(v2.set_card_publisher_sector(0x27).is_ok());
        assert!(v2.set_card_publisher_sector(0x28).is_err());
    }

    #[test]
    fn application_alloc_and_free_round_trip() {
        let mut mad = Mad::new(MadVersion::V1);
        let aid = Aid { function_cluster_code: 0x01, application_code: 0x08 };
        let sectors = mad.application_alloc(aid, 3).unwrap();
        assert!(!sectors.is_empty());
        assert_eq!(mad.application_find(aid), sectors);
        mad.application_free(aid).unwrap();
        assert!(mad.application_find(aid).is_empty());
    }

    fn test_tag(responses: Vec<Vec<u8>>) -> ClassicTag<crate::transport::ScriptedTransport> {
        use crate::transport::{Modulation, ScriptedTransport, TargetDescriptor};
        let transport = ScriptedTransport::new(responses);
        let target = TargetDescriptor {
            uid: vec![0x01, 0x02, 0x03, 0x04],
            sak: 0x08,
            ats: vec![],
            modulation: Modulation::Iso14443A,
        };
        let mut tag = ClassicTag::new(transport, target);
        tag.connect().unwrap();
        tag
    }

    #[test]
    fn mad_application_read_spans_sector_data_blocks() {
        let mut mad = Mad::new(MadVersion::V1);
        let aid = Aid { function_cluster_code: 0x01, application_code: 0x08 };
        let sectors = mad.application_alloc(aid, 3).unwrap();
        assert_eq!(sectors, vec![1]);

        let mut tag = test_tag(vec![
            vec![0x00],     // authenticate sector 1's first block (4)
            vec![0xAA; 16], // read block 4
            vec![0xBB; 16], // read block 5
            vec![0xCC; 16], // read block 6
        ]);

        let mut buf = [0u8; 48];
        let n = mad_application_read(&mut tag, &mad, aid, &mut buf, &public_key_a(), KeyType::A).unwrap();
        assert_eq!(n, 48);
        assert_eq!(&buf[0..16], &[0xAA; 16][..]);
        assert_eq!(&buf[16..32], &[0xBB; 16][..]);
        assert_eq!(&buf[32..48], &[0xCC; 16][..]);
    }

    #[test]
    fn mad_application_read_rejects_unallocated_aid() {
        let mad = Mad::new(MadVersion::V1);
        let aid = Aid { function_cluster_code: 0x01, application_code: 0x08 };
        let mut tag = test_tag(vec![]);
        let mut buf = [0u8; 16];
        assert!(mad_application_read(&mut tag, &mad, aid, &mut buf, &public_key_a(), KeyType::A).is_err());
    }

    #[test]
    fn mad_application_write_round_trip_exact_blocks() {
        let mut mad = Mad::new(MadVersion::V1);
        let aid = Aid { function_cluster_code: 0x01, application_code: 0x08 };
        mad.application_alloc(aid, 3).unwrap();

        let mut tag = test_tag(vec![
            vec![0x00], // authenticate
            vec![0x00], // write block 4
            vec![0x00], // write block 5
            vec![0x00], // write block 6
        ]);

        let data = [0x42u8; 48];
        let n = mad_application_write(&mut tag, &mad, aid, &data, &public_key_a(), KeyType::A).unwrap();
        assert_eq!(n, 48);
        assert_eq!(tag.transport_requests().len(), 4);
    }

    #[test]
    fn mad_application_write_merges_final_partial_block() {
        let mut mad = Mad::new(MadVersion::V1);
        let aid = Aid { function_cluster_code: 0x01, application_code: 0x08 };
        mad.application_alloc(aid, 3).unwrap();

        let mut tag = test_tag(vec![
            vec![0x00],        // authenticate
            vec![0x00],        // write block 4 (full)
            vec![0xFF; 16],    // read block 5 before partial write
            vec![0x00],        // write block 5 (merged)
        ]);

        let mut data = vec![0x11u8; 16];
        data.extend_from_slice(&[0x22u8; 4]);
        let n = mad_application_write(&mut tag, &mad, aid, &data, &public_key_a(), KeyType::A).unwrap();
        assert_eq!(n, 20);

        let requests = tag.transport_requests();
        let last_write = &requests[3];
        assert_eq!(last_write[0], 0xA0);
        assert_eq!(&last_write[2..6], &[0x22u8; 4][..]);
        assert_eq!(&last_write[6..18], &[0xFFu8; 12][..]);
    }
}
