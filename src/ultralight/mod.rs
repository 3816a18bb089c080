//! MIFARE Ultralight / NTAG21x engine (C9): 4-byte page I/O with a rolling
//! read cache, NTAG subtype detection, and password authentication.

use crate::error::Error;
use crate::key::NtagPassword;
use crate::transport::{Framing, TargetDescriptor, Transport};

const CMD_READ: u8 = 0x30;
const CMD_WRITE: u8 = 0xA2;
const CMD_FAST_READ: u8 = 0x3A;
const CMD_GET_VERSION: u8 = 0x60;
const CMD_AUTH: u8 = 0x1B;
const CMD_READ_SIG: u8 = 0x3C;

/// NTAG21x subtype, detected from the `GET_VERSION` storage-size byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtagSubtype {
    Ntag213,
    Ntag215,
    Ntag216,
}

impl NtagSubtype {
    pub fn from_storage_size_byte(byte: u8) -> Option<Self> {
        match byte {
            0x0F => Some(NtagSubtype::Ntag213),
            0x11 => Some(NtagSubtype::Ntag215),
            0x13 => Some(NtagSubtype::Ntag216),
            _ => None,
        }
    }

    pub fn max_page(&self) -> u8 {
        match self {
            NtagSubtype::Ntag213 => 0x2C,
            NtagSubtype::Ntag215 => 0x86,
            NtagSubtype::Ntag216 => 0xE6,
        }
    }
}

const CACHE_PAGES: usize = 0x100;

/// A rolling cache of page contents. `READ` always fills 4 consecutive
/// pages (with wraparound); any write invalidates just the written page.
struct PageCache {
    pages: Vec<Option<[u8; 4]>>,
}

impl PageCache {
    fn new() -> Self {
        PageCache { pages: vec![None; CACHE_PAGES] }
    }

    fn invalidate(&mut self, page: u8) {
        self.pages[page as usize] = None;
    }

    fn fill(&mut self, start_page: u8, data: &[u8]) {
        for (i, chunk) in data.chunks(4).enumerate() {
            let mut page = [0u8; 4];
            page.copy_from_slice(chunk);
            let idx = (start_page as usize + i) % CACHE_PAGES;
            self.pages[idx] = Some(page);
        }
    }

    fn get(&self, page: u8) -> Option<[u8; 4]> {
        self.pages[page as usize]
    }
}

/// Checks write-page validity: pages 0x00-0x02 (manufacturer/lock/OTP)
/// are never writable regardless of subtype; read has no such floor.
fn assert_valid_page(page: u8, subtype: Option<NtagSubtype>, for_write: bool) -> Result<(), Error> {
    if for_write && page <= 0x02 {
        return Err(Error::InvalidArgument("page is read-only (manufacturer/lock/OTP area)"));
    }
    if let Some(subtype) = subtype {
        if page > subtype.max_page() {
            return Err(Error::InvalidArgument("page exceeds tag's storage size"));
        }
    }
    Ok(())
}

pub struct UltralightTag<T: Transport> {
    transport: T,
    target: TargetDescriptor,
    active: bool,
    subtype: Option<NtagSubtype>,
    cache: PageCache,
}

impl<T: Transport> UltralightTag<T> {
    pub fn new(transport: T, target: TargetDescriptor) -> Self {
        UltralightTag {
            transport,
            target,
            active: false,
            subtype: None,
            cache: PageCache::new(),
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
        self.cache = PageCache::new();
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    pub fn uid(&self) -> &[u8] {
        &self.target.uid
    }

    /// `GET_VERSION`; on NTAG21x this also fixes the cached subtype used
    /// by subsequent page-bounds checks.
    pub fn get_info(&mut self) -> Result<Vec<u8>, Error> {
        self.transport.set_framing(Framing::Raw);
        let response = self.transport.transceive(&[CMD_GET_VERSION])?;
        if response.len() >= 7 {
            self.subtype = NtagSubtype::from_storage_size_byte(response[6]);
        }
        Ok(response)
    }

    pub fn read(&mut self, page: u8) -> Result<[u8; 4], Error> {
        assert_valid_page(page, self.subtype, false)?;
        if let Some(cached) = self.cache.get(page) {
            return Ok(cached);
        }
        self.transport.set_framing(Framing::Easy);
        let response = self.transport.transceive(&[CMD_READ, page])?;
        if response.len() != 16 {
            return Err(Error::Integrity("short read response"));
        }
        self.cache.fill(page, &response);
        Ok(self.cache.get(page).expect("just filled"))
    }

    pub fn fast_read(&mut self, start_page: u8, end_page: u8) -> Result<Vec<u8>, Error> {
        assert_valid_page(start_page, self.subtype, false)?;
        assert_valid_page(end_page, self.subtype, false)?;
        self.transport.set_framing(Framing::Easy);
        let response = self.transport.transceive(&[CMD_FAST_READ, start_page, end_page])?;
        self.cache.fill(start_page, &response);
        Ok(response)
    }

    pub fn write(&mut self, page: u8, data: &[u8; 4]) -> Result<(), Error> {
        assert_valid_page(page, self.subtype, true)?;
        let mut request = vec![CMD_WRITE, page];
        request.extend_from_slice(data);
        self.transport.set_framing(Framing::Easy);
        let response = self.transport.transceive(&request)?;
        if response.first() != Some(&0x00) {
            return Err(Error::AccessDenied);
        }
        self.cache.invalidate(page);
        Ok(())
    }

    pub fn read_signature(&mut self) -> Result<Vec<u8>, Error> {
        self.transport.set_framing(Framing::Easy);
        self.transport.transceive(&[CMD_READ_SIG, 0x00])
    }

    /// NTAG21x password authentication: success iff the returned PACK
    /// matches the one supplied.
    pub fn authenticate(&mut self, password: &NtagPassword) -> Result<(), Error> {
        let mut request = vec![CMD_AUTH];
        request.extend_from_slice(&password.pwd);
        self.transport.set_framing(Framing::Raw);
        let response = self.transport.transceive(&request)?;
        if response.len() != 2 || response != password.pack {
            return Err(Error::AccessDenied);
        }
        Ok(())
    }

    fn config_page(&self) -> Result<u8, Error> {
        let subtype = self.subtype.ok_or(Error::InvalidState("subtype unknown; call get_info first"))?;
        // The first configuration page immediately follows the last user page.
        Ok(subtype.max_page() - 4)
    }

    pub fn set_pwd(&mut self, pwd: [u8; 4]) -> Result<(), Error> {
        let page = self.config_page()? + 2;
        self.write(page, &pwd)
    }

    pub fn set_pack(&mut self, pack: [u8; 2]) -> Result<(), Error> {
        let page = self.config_page()? + 3;
        let data = [pack[0], pack[1], 0x00, 0x00];
        self.write(page, &data)
    }

    /// Sets `AUTH0` to the page at which password protection begins.
    pub fn set_auth(&mut self, auth0_page: u8) -> Result<(), Error> {
        let page = self.config_page()?;
        let mut current = self.read(page)?;
        current[3] = auth0_page;
        self.write(page, &current)
    }

    pub fn get_auth(&mut self) -> Result<u8, Error> {
        let page = self.config_page()?;
        Ok(self.read(page)?[3])
    }

    pub fn access_disable(&mut self) -> Result<(), Error> {
        self.set_auth(0xFF)
    }

    pub fn access_enable(&mut self, from_page: u8) -> Result<(), Error> {
        self.set_auth(from_page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Modulation, ScriptedTransport};

    fn target() -> TargetDescriptor {
        TargetDescriptor { uid: vec![1, 2, 3, 4, 5, 6, 7], sak: 0x00, ats: vec![], modulation: Modulation::Iso14443A }
    }

    #[test]
    fn subtype_detection_matches_spec() {
        assert_eq!(NtagSubtype::from_storage_size_byte(0x0F), Some(NtagSubtype::Ntag213));
        assert_eq!(NtagSubtype::from_storage_size_byte(0x11).unwrap().max_page(), 0x86);
        assert_eq!(NtagSubtype::from_storage_size_byte(0x13).unwrap().max_page(), 0xE6);
    }

    #[test]
    fn write_rejects_manufacturer_pages() {
        let transport = ScriptedTransport::new(vec![]);
        let mut tag = UltralightTag::new(transport, target());
        tag.connect().unwrap();
        assert!(tag.write(0x02, &[0u8; 4]).is_err());
    }

    #[test]
    fn password_authentication_checks_pack() {
        let transport = ScriptedTransport::new(vec![vec![0xAA, 0xAA]]);
        let mut tag = UltralightTag::new(transport, target());
        tag.connect().unwrap();
        let pwd = NtagPassword { pwd: [0xFF; 4], pack: [0xAA, 0xAA] };
        assert!(tag.authenticate(&pwd).is_ok());
    }

    #[test]
    fn read_fills_rolling_cache() {
        let response = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];
        let transport = ScriptedTransport::new(vec![response]);
        let mut tag = UltralightTag::new(transport, target());
        tag.connect().unwrap();
        let page0 = tag.read(0).unwrap();
        assert_eq!(page0, [1, 2, 3, 4]);
        // Page 1 should now be served from cache with no further transceive.
        let page1 = tag.read(1).unwrap();
        assert_eq!(page1, [5, 6, 7, 8]);
    }
}
