//! MIFARE DESFire session engine (C6): wire framing, the three
//! authentication schemes, PLAIN/MACED/ENCIPHERED pre/postprocessing,
//! and the application/file command set.

use std::collections::HashMap;

use crate::crypto::{cbc_chain, cmac, crc16_append, crc32_append, rol, BlockCipher, Direction, Operation};
use crate::error::{error_from_status, Error, PiccStatus};
use crate::key::{AuthenticationScheme, DesfireKey};
use crate::transport::{Framing, TargetDescriptor, Transport};

const CMD_AUTHENTICATE_LEGACY: u8 = 0x0A;
const CMD_AUTHENTICATE_ISO: u8 = 0x1A;
const CMD_AUTHENTICATE_AES: u8 = 0xAA;
const CMD_ADDITIONAL_FRAME: u8 = 0xAF;
const CMD_CHANGE_KEY_SETTINGS: u8 = 0x54;
const CMD_GET_KEY_SETTINGS: u8 = 0x45;
const CMD_CHANGE_KEY: u8 = 0xC4;
const CMD_GET_KEY_VERSION: u8 = 0x64;
const CMD_CREATE_APPLICATION: u8 = 0xCA;
const CMD_DELETE_APPLICATION: u8 = 0xDA;
const CMD_GET_APPLICATION_IDS: u8 = 0x6A;
const CMD_SELECT_APPLICATION: u8 = 0x5A;
const CMD_FORMAT_PICC: u8 = 0xFC;
const CMD_GET_VERSION: u8 = 0x60;
const CMD_GET_DF_NAMES: u8 = 0x6D;
const CMD_FREE_MEM: u8 = 0x6E;
const CMD_SET_CONFIGURATION: u8 = 0x5C;
const CMD_GET_CARD_UID: u8 = 0x51;
const CMD_SET_ATS: u8 = 0xA9;
const CMD_GET_FILE_IDS: u8 = 0x6F;
const CMD_GET_FILE_SETTINGS: u8 = 0xF5;
const CMD_CHANGE_FILE_SETTINGS: u8 = 0x5F;
const CMD_CREATE_STD_DATA_FILE: u8 = 0xCD;
const CMD_CREATE_BACKUP_DATA_FILE: u8 = 0xCB;
const CMD_CREATE_VALUE_FILE: u8 = 0xCC;
const CMD_CREATE_LINEAR_RECORD_FILE: u8 = 0xC1;
const CMD_CREATE_CYCLIC_RECORD_FILE: u8 = 0xC0;
const CMD_DELETE_FILE: u8 = 0xDF;
const CMD_READ_DATA: u8 = 0xBD;
const CMD_WRITE_DATA: u8 = 0x3D;
const CMD_GET_VALUE: u8 = 0x6C;
const CMD_CREDIT: u8 = 0x0C;
const CMD_DEBIT: u8 = 0xDC;
const CMD_LIMITED_CREDIT: u8 = 0x1C;
const CMD_WRITE_RECORD: u8 = 0x3B;
const CMD_READ_RECORDS: u8 = 0xBB;
const CMD_CLEAR_RECORD_FILE: u8 = 0xEB;
const CMD_COMMIT_TRANSACTION: u8 = 0xC7;
const CMD_ABORT_TRANSACTION: u8 = 0xA7;

/// Conservative native-frame payload size used to split long native
/// writes across `0xAF` continuations; well under any FSD a reader is
/// likely to negotiate, so no command ever needs further fragmentation.
const MAX_FRAME_PAYLOAD: usize = 52;

/// The three PICC communication modes (AN10922/DESFire functional spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommMode {
    Plain,
    Maced,
    Enciphered,
}

/// Per-command processing flags layered on top of a [`CommMode`],
/// mirroring the reference implementation's bit-flag communication
/// settings but expressed as named booleans.
#[derive(Debug, Clone, Copy)]
pub struct CommSettings {
    pub mode: CommMode,
    pub cmac_command: bool,
    pub cmac_verify: bool,
    pub mac_command: bool,
    pub mac_verify: bool,
    pub enc_command: bool,
    pub no_crc: bool,
}

impl CommSettings {
    pub const fn plain() -> Self {
        CommSettings {
            mode: CommMode::Plain,
            cmac_command: true,
            cmac_verify: false,
            mac_command: false,
            mac_verify: false,
            enc_command: false,
            no_crc: false,
        }
    }

    pub const fn plain_verified() -> Self {
        CommSettings { cmac_verify: true, ..Self::plain() }
    }

    pub const fn enciphered() -> Self {
        CommSettings {
            mode: CommMode::Enciphered,
            cmac_command: false,
            cmac_verify: false,
            mac_command: false,
            mac_verify: false,
            enc_command: true,
            no_crc: false,
        }
    }
}

/// Application identifier: a little-endian 3-byte value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Aid(pub [u8; 3]);

impl Aid {
    pub fn new(value: u32) -> Result<Self, Error> {
        if value > 0x00ff_ffff {
            return Err(Error::InvalidArgument("AID exceeds 24 bits"));
        }
        Ok(Aid([(value & 0xff) as u8, ((value >> 8) & 0xff) as u8, ((value >> 16) & 0xff) as u8]))
    }

    /// Builds a DESFire AID from a 2-byte MAD AID, per AN10787 §3.10:
    /// `0xF00000 | function_cluster_code<<12 | application_code<<4 | n`.
    pub fn from_mad_aid(mad_aid: crate::mad::Aid, n: u8) -> Result<Self, Error> {
        if n > 0x0f {
            return Err(Error::InvalidArgument("sub-application index must fit in 4 bits"));
        }
        let value = 0xf0_0000u32
            | ((mad_aid.function_cluster_code as u32) << 12)
            | ((mad_aid.application_code as u32) << 4)
            | n as u32;
        Aid::new(value)
    }

    pub fn value(&self) -> u32 {
        self.0[0] as u32 | (self.0[1] as u32) << 8 | (self.0[2] as u32) << 16
    }
}

pub const MASTER_APPLICATION: Aid = Aid([0, 0, 0]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    StandardData,
    BackupData,
    Value,
    LinearRecord,
    CyclicRecord,
}

impl FileType {
    fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            0x00 => Ok(FileType::StandardData),
            0x01 => Ok(FileType::BackupData),
            0x02 => Ok(FileType::Value),
            0x03 => Ok(FileType::LinearRecord),
            0x04 => Ok(FileType::CyclicRecord),
            _ => Err(Error::Integrity("unknown file type byte")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FileSettingsBody {
    Data { file_size: u32 },
    Value { lower_limit: i32, upper_limit: i32, limited_credit_value: i32, limited_credit_enabled: bool },
    Record { record_size: u32, max_number_of_records: u32, current_number_of_records: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct FileSettings {
    pub file_type: FileType,
    pub communication_settings: u8,
    pub access_rights: u16,
    pub body: FileSettingsBody,
}

/// One DESFire session: transport plus whatever authentication and
/// selected-application state the session has accumulated.
pub struct DesfireTag<T: Transport> {
    transport: T,
    target: TargetDescriptor,
    active: bool,
    session_key: Option<DesfireKey>,
    ivect: Vec<u8>,
    authenticated_key_no: Option<u8>,
    selected_application: Aid,
    file_settings_cache: HashMap<u8, FileSettings>,
}

/// Change-access-rights nibble value meaning "free" (§3, §4.6.6): with
/// this value set, `change_file_settings` itself runs as a plain
/// command instead of enciphered.
const ACCESS_RIGHTS_FREE: u8 = 0x0e;

fn change_access_rights(access_rights: u16) -> u8 {
    (access_rights & 0x000f) as u8
}

impl<T: Transport> DesfireTag<T> {
    pub fn new(transport: T, target: TargetDescriptor) -> Self {
        DesfireTag {
            transport,
            target,
            active: false,
            session_key: None,
            ivect: Vec::new(),
            authenticated_key_no: None,
            selected_application: MASTER_APPLICATION,
            file_settings_cache: HashMap::new(),
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
        self.session_key = None;
        self.ivect.clear();
        self.authenticated_key_no = None;
        self.file_settings_cache.clear();
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    pub fn uid(&self) -> &[u8] {
        &self.target.uid
    }

    fn require_active(&self) -> Result<(), Error> {
        if !self.active {
            return Err(Error::InvalidState("tag is not connected"));
        }
        Ok(())
    }

    /// Sends one native command frame, replaying `0xAF` continuations
    /// until the PICC returns a final status byte, concatenating the
    /// data portion of every frame.
    fn transceive_chain(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        self.transport.set_framing(Framing::Easy);
        let mut out = Vec::new();
        let mut response = self.transport.transceive(request)?;
        loop {
            let status = *response.last().ok_or(Error::Integrity("empty PICC response"))?;
            out.extend_from_slice(&response[..response.len() - 1]);
            let picc_status = PiccStatus::from_byte(status);
            if picc_status.is_ok() {
                out.push(0x00);
                return Ok(out);
            }
            if !picc_status.is_additional_frame() {
                return Err(error_from_status(picc_status));
            }
            response = self.transport.transceive(&[CMD_ADDITIONAL_FRAME])?;
        }
    }

    /// One non-chained command/response exchange: used by commands that
    /// never return `0xAF` (authentication, key/app/file management).
    fn transceive_once(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        self.transport.set_framing(Framing::Easy);
        let response = self.transport.transceive(request)?;
        let status = *response.last().ok_or(Error::Integrity("empty PICC response"))?;
        let picc_status = PiccStatus::from_byte(status);
        if !picc_status.is_ok() && !picc_status.is_additional_frame() {
            return Err(error_from_status(picc_status));
        }
        Ok(response)
    }

    fn preprocess(&mut self, data: &[u8], offset: usize, settings: CommSettings) -> Vec<u8> {
        let Some(key) = &self.session_key else { return data.to_vec() };

        match settings.mode {
            CommMode::Plain => {
                if matches!(key, DesfireKey::Des { .. } | DesfireKey::TripleDes { .. }) {
                    return data.to_vec();
                }
                // New-scheme PLAIN still runs the data through CMAC to
                // keep the session IV current, without appending it.
                if settings.cmac_command {
                    let (sk1, sk2) = key.cmac_subkeys().expect("New scheme key has CMAC subkeys");
                    let sk1 = sk1.to_vec();
                    let sk2 = sk2.to_vec();
                    cmac(key.cipher(), &sk1, &sk2, &mut self.ivect, data);
                }
                data.to_vec()
            }
            CommMode::Maced => match key {
                DesfireKey::Des { .. } | DesfireKey::TripleDes { .. } => {
                    if !settings.mac_command {
                        return data.to_vec();
                    }
                    let block_size = key.cipher().block_size();
                    let body_len = data.len() - offset;
                    let padded = body_len.div_ceil(block_size) * block_size;
                    let mut scratch = data[offset..].to_vec();
                    scratch.resize(padded, 0);
                    self.ivect.fill(0);
                    cbc_chain(key.cipher(), &mut self.ivect, &mut scratch, Direction::Send, Operation::Encypher);
                    let mac = &scratch[padded - block_size..padded - block_size + 4];
                    let mut out = data.to_vec();
                    out.extend_from_slice(mac);
                    out
                }
                _ => {
                    if !settings.cmac_command {
                        return data.to_vec();
                    }
                    let (sk1, sk2) = key.cmac_subkeys().expect("New scheme key has CMAC subkeys");
                    let sk1 = sk1.to_vec();
                    let sk2 = sk2.to_vec();
                    let tag = cmac(key.cipher(), &sk1, &sk2, &mut self.ivect, data);
                    let mut out = data.to_vec();
                    out.extend_from_slice(&tag);
                    out
                }
            },
            CommMode::Enciphered => {
                if !settings.enc_command {
                    return data.to_vec();
                }
                let block_size = key.cipher().block_size();
                match key {
                    DesfireKey::Des { .. } | DesfireKey::TripleDes { .. } => {
                        let mut body = data[offset..].to_vec();
                        if !settings.no_crc {
                            crc16_append(&mut body);
                        } else {
                            body.extend_from_slice(&[0, 0]);
                        }
                        let padded = body.len().div_ceil(block_size) * block_size;
                        body.resize(padded, 0);
                        self.ivect.fill(0);
                        cbc_chain(key.cipher(), &mut self.ivect, &mut body, Direction::Send, Operation::Encypher);
                        let mut out = data[..offset].to_vec();
                        out.extend_from_slice(&body);
                        out
                    }
                    _ => {
                        let mut body = data[offset..].to_vec();
                        if !settings.no_crc {
                            crc32_append(&mut body);
                        }
                        let padded = body.len().div_ceil(block_size) * block_size;
                        body.resize(padded, 0);
                        cbc_chain(key.cipher(), &mut self.ivect, &mut body, Direction::Send, Operation::Encypher);
                        let mut out = data[..offset].to_vec();
                        out.extend_from_slice(&body);
                        out
                    }
                }
            }
        }
    }

    fn postprocess(&mut self, data: &[u8], settings: CommSettings) -> Result<Vec<u8>, Error> {
        let Some(key) = &self.session_key else { return Ok(data.to_vec()) };
        if data.len() == 1 {
            return Ok(data.to_vec());
        }

        match settings.mode {
            CommMode::Plain => {
                if matches!(key, DesfireKey::Des { .. } | DesfireKey::TripleDes { .. }) {
                    return Ok(data.to_vec());
                }
                Ok(data.to_vec())
            }
            CommMode::Maced => match key {
                DesfireKey::Des { .. } | DesfireKey::TripleDes { .. } => {
                    if !settings.mac_verify {
                        return Ok(data.to_vec());
                    }
                    let block_size = key.cipher().block_size();
                    let body_len = data.len() - 4;
                    let padded = body_len.div_ceil(block_size) * block_size;
                    let mut scratch = data[..body_len].to_vec();
                    scratch.resize(padded, 0);
                    self.ivect.fill(0);
                    cbc_chain(key.cipher(), &mut self.ivect.clone(), &mut scratch, Direction::Send, Operation::Encypher);
                    if scratch[padded - block_size..padded - block_size + 4] != data[body_len..body_len + 4] {
                        return Err(Error::Integrity("DESFire MAC verification failed"));
                    }
                    Ok(data[..body_len].to_vec())
                }
                _ => {
                    if !settings.cmac_command {
                        return Ok(data.to_vec());
                    }
                    let (sk1, sk2) = key.cmac_subkeys().expect("New scheme key has CMAC subkeys");
                    let sk1 = sk1.to_vec();
                    let sk2 = sk2.to_vec();

                    if !settings.cmac_verify {
                        let tag = cmac(key.cipher(), &sk1, &sk2, &mut self.ivect, data);
                        let _ = tag;
                        return Ok(data.to_vec());
                    }

                    if data.len() < 9 {
                        return Err(Error::Integrity("response too short to carry a CMAC"));
                    }
                    // Swap the trailing status byte into the CMAC's
                    // first byte position so the whole buffer (status
                    // included) feeds the CMAC in wire order, then swap
                    // back before comparing.
                    let mut scratch = data.to_vec();
                    let n = scratch.len();
                    let saved = scratch[n - 9];
                    scratch[n - 9] = scratch[n - 1];
                    let tag = cmac(key.cipher(), &sk1, &sk2, &mut self.ivect, &scratch[..n - 8]);
                    scratch[n - 9] = saved;

                    if tag != scratch[n - 9..n - 1] {
                        return Err(Error::Integrity("DESFire CMAC verification failed"));
                    }
                    Ok(scratch[..n - 9].to_vec())
                }
            },
            CommMode::Enciphered => match key {
                DesfireKey::Des { .. } | DesfireKey::TripleDes { .. } => {
                    let mut body = data.to_vec();
                    self.ivect.fill(0);
                    cbc_chain(key.cipher(), &mut self.ivect, &mut body, Direction::Receive, Operation::Decypher);

                    let mut end_crc_pos = body.len() as isize - 7;
                    let mut verified = false;
                    while !verified && end_crc_pos < body.len() as isize - 1 {
                        if end_crc_pos < 0 {
                            end_crc_pos += 1;
                            continue;
                        }
                        let pos = end_crc_pos as usize;
                        let mut check = body[..pos].to_vec();
                        crc16_append(&mut check);
                        let crc_ok = check[pos] == 0 && check[pos + 1] == 0;
                        if crc_ok {
                            verified = (pos..body.len() - 1)
                                .all(|n| body[n] == 0x00 || (body[n] == 0x80 && n == pos));
                        }
                        if !verified {
                            end_crc_pos += 1;
                        }
                    }
                    if !verified {
                        return Err(Error::Integrity("DESFire response CRC16 not verified"));
                    }
                    Ok(body[..(end_crc_pos as usize).saturating_sub(2)].to_vec())
                }
                _ => {
                    let mut body = data[..data.len() - 1].to_vec();
                    cbc_chain(key.cipher(), &mut self.ivect, &mut body, Direction::Receive, Operation::Decypher);
                    let mut p = body.len() - 1;
                    while body[p] == 0 {
                        p -= 1;
                    }
                    if body[p] == 0x80 {
                        p -= 1;
                    }
                    if p < 3 {
                        return Err(Error::Integrity("DESFire response too short for CRC32"));
                    }
                    let data_end = p - 3;
                    let mut check = body[..data_end].to_vec();
                    crc32_append(&mut check);
                    if check[data_end..data_end + 4] != body[data_end..data_end + 4] {
                        return Err(Error::Integrity("DESFire response CRC32 not verified"));
                    }
                    Ok(body[..data_end].to_vec())
                }
            },
        }
    }

    /// Runs one of the three authentication schemes (§4.6.2): a 3-pass
    /// mutual challenge built on `key`'s cipher, establishing a fresh
    /// session key and (for New-scheme keys) CMAC subkeys on success.
    fn authenticate_with(&mut self, scheme_cmd: u8, key_no: u8, key: &DesfireKey) -> Result<(), Error> {
        log::debug!("DESFire authenticate: scheme {:#04x}, key slot {}", scheme_cmd, key_no);
        self.require_active()?;
        self.session_key = None;
        self.ivect = vec![0u8; key.cipher().block_size()];

        let response = self.transceive_once(&[scheme_cmd, key_no])?;
        let key_length = response.len() - 1;
        let mut picc_rnd_b = response[..key_length].to_vec();
        let mut cipher_copy = clone_cipher(key);
        cbc_chain_with(&mut cipher_copy, &mut self.ivect, &mut picc_rnd_b, Direction::Receive);

        let mut pcd_rnd_a = vec![0u8; key_length];
        fill_random(&mut pcd_rnd_a);

        let mut pcd_r_rnd_b = picc_rnd_b.clone();
        rol(&mut pcd_r_rnd_b);

        let mut token = pcd_rnd_a.clone();
        token.extend_from_slice(&pcd_r_rnd_b);
        cbc_chain_with(&mut cipher_copy, &mut self.ivect, &mut token, Direction::Send);

        let mut request = vec![CMD_ADDITIONAL_FRAME];
        request.extend_from_slice(&token);
        let response = self.transceive_once(&request)?;

        let mut picc_rnd_a_s = response[..key_length].to_vec();
        cbc_chain_with(&mut cipher_copy, &mut self.ivect, &mut picc_rnd_a_s, Direction::Receive);

        let mut pcd_rnd_a_s = pcd_rnd_a.clone();
        rol(&mut pcd_rnd_a_s);

        if pcd_rnd_a_s != picc_rnd_a_s {
            return Err(Error::AccessDenied);
        }

        self.authenticated_key_no = Some(key_no);
        self.session_key = Some(DesfireKey::session_key(&pcd_rnd_a, &picc_rnd_b, key));
        self.ivect = vec![0u8; self.session_key.as_ref().unwrap().cipher().block_size()];
        Ok(())
    }

    pub fn authenticate(&mut self, key_no: u8, key: &DesfireKey) -> Result<(), Error> {
        if key.authentication_scheme() != AuthenticationScheme::Legacy {
            return Err(Error::CryptoConfig("use authenticate_iso/authenticate_aes for this key kind"));
        }
        self.authenticate_with(CMD_AUTHENTICATE_LEGACY, key_no, key)
    }

    pub fn authenticate_iso(&mut self, key_no: u8, key: &DesfireKey) -> Result<(), Error> {
        self.authenticate_with(CMD_AUTHENTICATE_ISO, key_no, key)
    }

    pub fn authenticate_aes(&mut self, key_no: u8, key: &DesfireKey) -> Result<(), Error> {
        self.authenticate_with(CMD_AUTHENTICATE_AES, key_no, key)
    }

    fn plain_cmac_command(&mut self, cmd: &[u8]) -> Result<Vec<u8>, Error> {
        let p = self.preprocess(cmd, 0, CommSettings::plain());
        let response = self.transceive_once(&p)?;
        self.postprocess(&response, CommSettings::plain_verified())
    }

    pub fn select_application(&mut self, aid: Aid) -> Result<(), Error> {
        self.require_active()?;
        let mut cmd = vec![CMD_SELECT_APPLICATION];
        cmd.extend_from_slice(&aid.0);
        let p = self.preprocess(&cmd, 0, CommSettings::plain());
        let response = self.transceive_once(&p)?;
        self.postprocess(&response, CommSettings::plain())?;
        self.session_key = None;
        self.selected_application = aid;
        self.file_settings_cache.clear();
        Ok(())
    }

    /// Creates an application with an additional ISO/IEC 7816-4 file
    /// identifier and DF name, beyond the plain `create_application`.
    pub fn create_application_iso(
        &mut self,
        aid: Aid,
        settings1: u8,
        settings2: u8,
        iso_file_id: Option<u16>,
        df_name: &[u8],
    ) -> Result<(), Error> {
        let mut cmd = vec![CMD_CREATE_APPLICATION];
        cmd.extend_from_slice(&aid.0);
        cmd.push(settings1);
        cmd.push(settings2 | 0x20);
        if let Some(id) = iso_file_id {
            cmd.extend_from_slice(&id.to_le_bytes());
        }
        cmd.extend_from_slice(df_name);
        self.plain_cmac_command(&cmd).map(|_| ())
    }

    pub fn create_application(&mut self, aid: Aid, settings1: u8, settings2: u8) -> Result<(), Error> {
        let mut cmd = vec![CMD_CREATE_APPLICATION];
        cmd.extend_from_slice(&aid.0);
        cmd.push(settings1);
        cmd.push(settings2);
        self.plain_cmac_command(&cmd).map(|_| ())
    }

    pub fn delete_application(&mut self, aid: Aid) -> Result<(), Error> {
        let mut cmd = vec![CMD_DELETE_APPLICATION];
        cmd.extend_from_slice(&aid.0);
        self.plain_cmac_command(&cmd)?;
        if self.selected_application == aid {
            self.session_key = None;
            self.selected_application = MASTER_APPLICATION;
            self.file_settings_cache.clear();
        }
        Ok(())
    }

    pub fn get_application_ids(&mut self) -> Result<Vec<Aid>, Error> {
        let response = self.plain_cmac_command(&[CMD_GET_APPLICATION_IDS])?;
        Ok(response.chunks(3).filter(|c| c.len() == 3).map(|c| Aid([c[0], c[1], c[2]])).collect())
    }

    /// Lists the ISO/IEC 7816-4 DF names of every application on the
    /// PICC, replaying `0xAF` like [`Self::get_application_ids`].
    pub fn get_df_names(&mut self) -> Result<Vec<(Aid, Vec<u8>)>, Error> {
        self.require_active()?;
        let mut names = Vec::new();
        let p = self.preprocess(&[CMD_GET_DF_NAMES], 0, CommSettings::plain());
        let mut response = self.transceive_once(&p)?;
        loop {
            let status = *response.last().ok_or(Error::Integrity("empty PICC response"))?;
            let picc_status = PiccStatus::from_byte(status);
            if !picc_status.is_ok() && !picc_status.is_additional_frame() {
                return Err(error_from_status(picc_status));
            }
            let body = self.postprocess(&response[..response.len() - 1], CommSettings::plain())?;
            if body.len() >= 3 {
                names.push((Aid([body[0], body[1], body[2]]), body[3..].to_vec()));
            }
            if picc_status.is_ok() {
                break;
            }
            response = self.transceive_once(&[CMD_ADDITIONAL_FRAME])?;
        }
        Ok(names)
    }

    pub fn format_picc(&mut self) -> Result<(), Error> {
        if self.authenticated_key_no.is_none() {
            return Err(Error::InvalidState("format_picc requires a prior authenticate"));
        }
        self.plain_cmac_command(&[CMD_FORMAT_PICC])?;
        self.session_key = None;
        self.selected_application = MASTER_APPLICATION;
        self.file_settings_cache.clear();
        Ok(())
    }

    pub fn get_version(&mut self) -> Result<Vec<u8>, Error> {
        self.plain_cmac_command(&[CMD_GET_VERSION])
    }

    /// Free EEPROM memory remaining on the PICC, in bytes.
    pub fn free_mem(&mut self) -> Result<u32, Error> {
        let raw = self.plain_cmac_command(&[CMD_FREE_MEM])?;
        Ok(le24(&raw[..3]))
    }

    /// EV1 `SetConfiguration`: optionally disables the format command
    /// and/or enables per-UID random-ID mode. Requires authentication
    /// against the PICC master key.
    pub fn set_configuration(&mut self, disable_format: bool, enable_random_uid: bool) -> Result<(), Error> {
        let flags = (enable_random_uid as u8) << 1 | disable_format as u8;
        let cmd = vec![CMD_SET_CONFIGURATION, 0x00, flags];
        let p = self.preprocess(&cmd, 2, CommSettings::enciphered());
        let response = self.transceive_once(&p)?;
        self.postprocess(&response, CommSettings::plain_verified())?;
        Ok(())
    }

    /// EV1 `GetCardUID`: returns the factory UID even when random-UID
    /// mode (set via [`Self::set_configuration`]) hides it from ATQA/SAK.
    pub fn get_card_uid(&mut self) -> Result<Vec<u8>, Error> {
        let p = self.preprocess(&[CMD_GET_CARD_UID], 0, CommSettings::plain());
        let response = self.transceive_once(&p)?;
        self.postprocess(&response, CommSettings { mode: CommMode::Enciphered, ..CommSettings::plain() })
    }

    /// EV1 `SetATS`: reconfigures the ATS returned on the next
    /// activation. Requires authentication against the PICC master key.
    pub fn set_ats(&mut self, ats: &[u8]) -> Result<(), Error> {
        let mut cmd = vec![CMD_SET_ATS];
        cmd.push(ats.len() as u8);
        cmd.extend_from_slice(ats);
        let offset = cmd.len();
        let p = self.preprocess(&cmd, offset, CommSettings::enciphered());
        let response = self.transceive_once(&p)?;
        self.postprocess(&response, CommSettings::plain_verified())?;
        Ok(())
    }

    /// Sugar over [`Self::change_key`] for replacing the key this
    /// session is currently authenticated against, matching the shape
    /// of the reference library's "configure default key" examples.
    pub fn set_default_key(&mut self, new_key: &DesfireKey) -> Result<(), Error> {
        let key_no = self.authenticated_key_no.ok_or(Error::InvalidState("set_default_key requires a prior authenticate"))?;
        self.change_key(key_no, new_key, None)
    }

    pub fn change_key_settings(&mut self, settings: u8) -> Result<(), Error> {
        let cmd = vec![CMD_CHANGE_KEY_SETTINGS, settings];
        let p = self.preprocess(&cmd, 1, CommSettings::enciphered());
        let response = self.transceive_once(&p)?;
        self.postprocess(&response, CommSettings::plain_verified())?;
        Ok(())
    }

    pub fn get_key_settings(&mut self) -> Result<(u8, u8), Error> {
        let response = self.plain_cmac_command(&[CMD_GET_KEY_SETTINGS])?;
        Ok((response[0], response[1] & 0x0f))
    }

    pub fn get_key_version(&mut self, key_no: u8) -> Result<u8, Error> {
        let response = self.plain_cmac_command(&[CMD_GET_KEY_VERSION, key_no])?;
        Ok(response[0])
    }

    /// Changes application key `key_no` to `new_key`; `old_key` is
    /// required unless `new_key` is the currently authenticated key.
    pub fn change_key(&mut self, key_no: u8, new_key: &DesfireKey, old_key: Option<&DesfireKey>) -> Result<(), Error> {
        self.require_active()?;
        let changing_own_key = self.authenticated_key_no == Some(key_no);

        let mut cmd = vec![CMD_CHANGE_KEY, key_no];
        cmd.extend_from_slice(new_key.raw_bytes());
        if !changing_own_key {
            if let Some(old_key) = old_key {
                for (a, b) in cmd[2..].iter_mut().zip(old_key.raw_bytes().iter()) {
                    *a ^= b;
                }
            }
        }
        if matches!(new_key, DesfireKey::Aes128 { .. }) {
            cmd.push(new_key.get_version());
        }

        let p = self.preprocess(&cmd, 2, CommSettings::enciphered());
        let response = self.transceive_once(&p)?;
        self.postprocess(&response, CommSettings::plain_verified())?;
        Ok(())
    }

    pub fn get_file_ids(&mut self) -> Result<Vec<u8>, Error> {
        self.plain_cmac_command(&[CMD_GET_FILE_IDS])
    }

    pub fn get_file_settings(&mut self, file_no: u8) -> Result<FileSettings, Error> {
        let p = self.preprocess(&[CMD_GET_FILE_SETTINGS, file_no], 0, CommSettings::plain());
        let response = self.transceive_once(&p)?;
        let raw = self.postprocess(&response, CommSettings::plain_verified())?;

        let file_type = FileType::from_byte(raw[0])?;
        let communication_settings = raw[1];
        let access_rights = u16::from_le_bytes([raw[2], raw[3]]);
        let body = match file_type {
            FileType::StandardData | FileType::BackupData => {
                FileSettingsBody::Data { file_size: le24(&raw[4..7]) }
            }
            FileType::Value => FileSettingsBody::Value {
                lower_limit: le32(&raw[4..8]) as i32,
                upper_limit: le32(&raw[8..12]) as i32,
                limited_credit_value: le32(&raw[12..16]) as i32,
                limited_credit_enabled: raw[16] != 0,
            },
            FileType::LinearRecord | FileType::CyclicRecord => FileSettingsBody::Record {
                record_size: le24(&raw[4..7]),
                max_number_of_records: le24(&raw[7..10]),
                current_number_of_records: le24(&raw[10..13]),
            },
        };
        let settings = FileSettings { file_type, communication_settings, access_rights, body };
        self.file_settings_cache.insert(file_no, settings);
        Ok(settings)
    }

    fn cached_file_settings(&mut self, file_no: u8) -> Result<FileSettings, Error> {
        if let Some(settings) = self.file_settings_cache.get(&file_no) {
            return Ok(*settings);
        }
        self.get_file_settings(file_no)
    }

    fn comm_mode_for(&mut self, file_no: u8) -> Result<CommMode, Error> {
        let settings = self.cached_file_settings(file_no)?;
        Ok(match settings.communication_settings & 0x03 {
            0x01 => CommMode::Maced,
            0x03 => CommMode::Enciphered,
            _ => CommMode::Plain,
        })
    }

    /// Changes `file_no`'s communication settings and access rights.
    /// Per §4.6.6 the command itself runs plain when the file's
    /// *current* change-access-rights field is free, enciphered
    /// otherwise.
    pub fn change_file_settings(&mut self, file_no: u8, communication_settings: u8, access_rights: u16) -> Result<(), Error> {
        let current = self.cached_file_settings(file_no)?;
        self.file_settings_cache.remove(&file_no);

        let mut cmd = vec![CMD_CHANGE_FILE_SETTINGS, file_no, communication_settings];
        cmd.extend_from_slice(&access_rights.to_le_bytes());

        if change_access_rights(current.access_rights) == ACCESS_RIGHTS_FREE {
            self.plain_cmac_command(&cmd).map(|_| ())
        } else {
            let p = self.preprocess(&cmd, 2, CommSettings::enciphered());
            let response = self.transceive_once(&p)?;
            self.postprocess(&response, CommSettings::plain_verified())?;
            Ok(())
        }
    }

    fn create_file1(&mut self, cmd_byte: u8, file_no: u8, communication_settings: u8, access_rights: u16, file_size: u32) -> Result<(), Error> {
        let mut cmd = vec![cmd_byte, file_no, communication_settings];
        cmd.extend_from_slice(&access_rights.to_le_bytes());
        cmd.extend_from_slice(&file_size.to_le_bytes()[..3]);
        self.plain_cmac_command(&cmd)?;
        self.file_settings_cache.remove(&file_no);
        Ok(())
    }

    pub fn create_std_data_file(&mut self, file_no: u8, communication_settings: u8, access_rights: u16, file_size: u32) -> Result<(), Error> {
        self.create_file1(CMD_CREATE_STD_DATA_FILE, file_no, communication_settings, access_rights, file_size)
    }

    pub fn create_backup_data_file(&mut self, file_no: u8, communication_settings: u8, access_rights: u16, file_size: u32) -> Result<(), Error> {
        self.create_file1(CMD_CREATE_BACKUP_DATA_FILE, file_no, communication_settings, access_rights, file_size)
    }

    pub fn create_value_file(
        &mut self,
        file_no: u8,
        communication_settings: u8,
        access_rights: u16,
        lower_limit: i32,
        upper_limit: i32,
        value: i32,
        limited_credit_enabled: bool,
    ) -> Result<(), Error> {
        let mut cmd = vec![CMD_CREATE_VALUE_FILE, file_no, communication_settings];
        cmd.extend_from_slice(&access_rights.to_le_bytes());
        cmd.extend_from_slice(&lower_limit.to_le_bytes());
        cmd.extend_from_slice(&upper_limit.to_le_bytes());
        cmd.extend_from_slice(&value.to_le_bytes());
        cmd.push(limited_credit_enabled as u8);
        self.plain_cmac_command(&cmd)?;
        self.file_settings_cache.remove(&file_no);
        Ok(())
    }

    fn create_file2(&mut self, cmd_byte: u8, file_no: u8, communication_settings: u8, access_rights: u16, record_size: u32, max_number_of_records: u32) -> Result<(), Error> {
        let mut cmd = vec![cmd_byte, file_no, communication_settings];
        cmd.extend_from_slice(&access_rights.to_le_bytes());
        cmd.extend_from_slice(&record_size.to_le_bytes()[..3]);
        cmd.extend_from_slice(&max_number_of_records.to_le_bytes()[..3]);
        self.plain_cmac_command(&cmd)?;
        self.file_settings_cache.remove(&file_no);
        Ok(())
    }

    pub fn create_linear_record_file(&mut self, file_no: u8, communication_settings: u8, access_rights: u16, record_size: u32, max_number_of_records: u32) -> Result<(), Error> {
        self.create_file2(CMD_CREATE_LINEAR_RECORD_FILE, file_no, communication_settings, access_rights, record_size, max_number_of_records)
    }

    pub fn create_cyclic_record_file(&mut self, file_no: u8, communication_settings: u8, access_rights: u16, record_size: u32, max_number_of_records: u32) -> Result<(), Error> {
        self.create_file2(CMD_CREATE_CYCLIC_RECORD_FILE, file_no, communication_settings, access_rights, record_size, max_number_of_records)
    }

    pub fn delete_file(&mut self, file_no: u8) -> Result<(), Error> {
        self.plain_cmac_command(&[CMD_DELETE_FILE, file_no])?;
        self.file_settings_cache.remove(&file_no);
        Ok(())
    }

    /// Reads `length` bytes from `file_no` at `offset`, using the
    /// communication mode from the file's (cached) settings.
    pub fn read_data(&mut self, file_no: u8, offset: u32, length: u32) -> Result<Vec<u8>, Error> {
        let mode = self.comm_mode_for(file_no)?;
        self.read_data_ex(file_no, offset, length, mode)
    }

    /// As [`Self::read_data`], with an explicit communication mode
    /// overriding the file's cached settings.
    pub fn read_data_ex(&mut self, file_no: u8, offset: u32, length: u32, mode: CommMode) -> Result<Vec<u8>, Error> {
        self.require_active()?;
        let mut cmd = vec![CMD_READ_DATA, file_no];
        cmd.extend_from_slice(&offset.to_le_bytes()[..3]);
        cmd.extend_from_slice(&length.to_le_bytes()[..3]);

        let settings = CommSettings { mode: CommMode::Plain, ..CommSettings::plain() };
        let p = self.preprocess(&cmd, 8, settings);
        let response = self.transceive_chain(&p)?;

        let verify_settings = CommSettings {
            mode,
            cmac_command: true,
            cmac_verify: true,
            mac_command: false,
            mac_verify: true,
            enc_command: false,
            no_crc: false,
        };
        self.postprocess(&response, verify_settings)
    }

    /// Writes `data` to `file_no` at `offset`, using the communication
    /// mode from the file's (cached) settings.
    pub fn write_data(&mut self, file_no: u8, offset: u32, data: &[u8]) -> Result<(), Error> {
        let mode = self.comm_mode_for(file_no)?;
        self.write_data_ex(file_no, offset, data, mode)
    }

    /// As [`Self::write_data`], with an explicit communication mode.
    pub fn write_data_ex(&mut self, file_no: u8, offset: u32, data: &[u8], mode: CommMode) -> Result<(), Error> {
        self.require_active()?;
        let mut cmd = vec![CMD_WRITE_DATA, file_no];
        cmd.extend_from_slice(&offset.to_le_bytes()[..3]);
        cmd.extend_from_slice(&(data.len() as u32).to_le_bytes()[..3]);
        cmd.extend_from_slice(data);

        let settings = CommSettings { mode, enc_command: true, cmac_command: true, ..CommSettings::plain() };
        let p = self.preprocess(&cmd, 8, settings);

        let mut frames: Vec<Vec<u8>> = p
            .chunks(MAX_FRAME_PAYLOAD)
            .enumerate()
            .map(|(i, chunk)| if i == 0 { chunk.to_vec() } else { [&[CMD_ADDITIONAL_FRAME][..], chunk].concat() })
            .collect();
        if frames.is_empty() {
            frames.push(vec![]);
        }

        let mut response = Vec::new();
        for frame in &frames {
            response = self.transceive_once(frame)?;
        }
        self.postprocess(&response, CommSettings::plain_verified())?;
        self.file_settings_cache.remove(&file_no);
        Ok(())
    }

    fn value_command(&mut self, cmd_byte: u8, file_no: u8, amount: i32, mode: CommMode) -> Result<(), Error> {
        let mut cmd = vec![cmd_byte, file_no];
        cmd.extend_from_slice(&amount.to_le_bytes());
        let settings = CommSettings { mode, enc_command: true, mac_command: true, cmac_command: true, ..CommSettings::plain() };
        let p = self.preprocess(&cmd, 2, settings);
        let response = self.transceive_once(&p)?;
        self.postprocess(&response, CommSettings::plain_verified())?;
        self.file_settings_cache.remove(&file_no);
        Ok(())
    }

    /// Reads `file_no`'s current value, using the communication mode
    /// from the file's (cached) settings.
    pub fn get_value(&mut self, file_no: u8) -> Result<i32, Error> {
        let mode = self.comm_mode_for(file_no)?;
        self.get_value_ex(file_no, mode)
    }

    /// As [`Self::get_value`], with an explicit communication mode.
    pub fn get_value_ex(&mut self, file_no: u8, mode: CommMode) -> Result<i32, Error> {
        let p = self.preprocess(&[CMD_GET_VALUE, file_no], 0, CommSettings::plain());
        let response = self.transceive_once(&p)?;
        let verify_settings = CommSettings { mode, cmac_command: true, cmac_verify: true, mac_verify: true, ..CommSettings::plain() };
        let raw = self.postprocess(&response, verify_settings)?;
        Ok(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn credit(&mut self, file_no: u8, amount: i32) -> Result<(), Error> {
        let mode = self.comm_mode_for(file_no)?;
        self.credit_ex(file_no, amount, mode)
    }

    pub fn credit_ex(&mut self, file_no: u8, amount: i32, mode: CommMode) -> Result<(), Error> {
        self.value_command(CMD_CREDIT, file_no, amount, mode)
    }

    pub fn debit(&mut self, file_no: u8, amount: i32) -> Result<(), Error> {
        let mode = self.comm_mode_for(file_no)?;
        self.debit_ex(file_no, amount, mode)
    }

    pub fn debit_ex(&mut self, file_no: u8, amount: i32, mode: CommMode) -> Result<(), Error> {
        self.value_command(CMD_DEBIT, file_no, amount, mode)
    }

    pub fn limited_credit(&mut self, file_no: u8, amount: i32) -> Result<(), Error> {
        let mode = self.comm_mode_for(file_no)?;
        self.limited_credit_ex(file_no, amount, mode)
    }

    pub fn limited_credit_ex(&mut self, file_no: u8, amount: i32, mode: CommMode) -> Result<(), Error> {
        self.value_command(CMD_LIMITED_CREDIT, file_no, amount, mode)
    }

    pub fn write_record(&mut self, file_no: u8, offset: u32, data: &[u8]) -> Result<(), Error> {
        let mode = self.comm_mode_for(file_no)?;
        self.write_record_ex(file_no, offset, data, mode)
    }

    pub fn write_record_ex(&mut self, file_no: u8, offset: u32, data: &[u8], mode: CommMode) -> Result<(), Error> {
        self.write_data_with_command(CMD_WRITE_RECORD, file_no, offset, data, mode)
    }

    fn write_data_with_command(&mut self, cmd_byte: u8, file_no: u8, offset: u32, data: &[u8], mode: CommMode) -> Result<(), Error> {
        self.require_active()?;
        let mut cmd = vec![cmd_byte, file_no];
        cmd.extend_from_slice(&offset.to_le_bytes()[..3]);
        cmd.extend_from_slice(&(data.len() as u32).to_le_bytes()[..3]);
        cmd.extend_from_slice(data);
        let settings = CommSettings { mode, enc_command: true, cmac_command: true, ..CommSettings::plain() };
        let p = self.preprocess(&cmd, 8, settings);
        let response = self.transceive_once(&p)?;
        self.postprocess(&response, CommSettings::plain_verified())?;
        self.file_settings_cache.remove(&file_no);
        Ok(())
    }

    pub fn read_records(&mut self, file_no: u8, offset: u32, length: u32) -> Result<Vec<u8>, Error> {
        let mode = self.comm_mode_for(file_no)?;
        self.read_records_ex(file_no, offset, length, mode)
    }

    pub fn read_records_ex(&mut self, file_no: u8, offset: u32, length: u32, mode: CommMode) -> Result<Vec<u8>, Error> {
        self.require_active()?;
        let mut cmd = vec![CMD_READ_RECORDS, file_no];
        cmd.extend_from_slice(&offset.to_le_bytes()[..3]);
        cmd.extend_from_slice(&length.to_le_bytes()[..3]);
        let p = self.preprocess(&cmd, 8, CommSettings::plain());
        let response = self.transceive_chain(&p)?;
        let verify_settings = CommSettings { mode, cmac_verify: true, mac_verify: true, ..CommSettings::plain() };
        self.postprocess(&response, verify_settings)
    }

    pub fn clear_record_file(&mut self, file_no: u8) -> Result<(), Error> {
        self.plain_cmac_command(&[CMD_CLEAR_RECORD_FILE, file_no]).map(|_| ())
    }

    pub fn commit_transaction(&mut self) -> Result<(), Error> {
        self.plain_cmac_command(&[CMD_COMMIT_TRANSACTION]).map(|_| ())
    }

    pub fn abort_transaction(&mut self) -> Result<(), Error> {
        self.plain_cmac_command(&[CMD_ABORT_TRANSACTION]).map(|_| ())
    }
}

fn le24(bytes: &[u8]) -> u32 {
    bytes[0] as u32 | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16
}

fn le32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn fill_random(buf: &mut [u8]) {
    use rand_core::{OsRng, RngCore};
    OsRng.fill_bytes(buf);
}

/// Authentication needs to run the *authentication key*'s cipher
/// directly (not the not-yet-derived session key's); building a fresh
/// `BlockCipher` of the same kind keeps `DesfireTag` from needing a
/// public "raw cipher" accessor on `DesfireKey` beyond `cipher()`.
fn clone_cipher(key: &DesfireKey) -> BlockCipher {
    match key {
        DesfireKey::Des { .. } => BlockCipher::des(key.raw_bytes()[..8].try_into().unwrap()),
        DesfireKey::TripleDes { .. } => BlockCipher::triple_des_2key(key.raw_bytes()[..16].try_into().unwrap()),
        DesfireKey::TripleK3Des { .. } => BlockCipher::triple_des_3key(key.raw_bytes()[..24].try_into().unwrap()),
        DesfireKey::Aes128 { .. } => BlockCipher::aes128(key.raw_bytes()[..16].try_into().unwrap()),
    }
}

fn cbc_chain_with(cipher: &mut BlockCipher, ivect: &mut [u8], data: &mut [u8], direction: Direction) {
    cbc_chain(cipher, ivect, data, direction, if direction == Direction::Send { Operation::Encypher } else { Operation::Decypher });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Modulation, ScriptedTransport};

    fn target() -> TargetDescriptor {
        TargetDescriptor { uid: vec![1, 2, 3, 4, 5, 6, 7], sak: 0x20, ats: vec![], modulation: Modulation::Iso14443A }
    }

    #[test]
    fn aid_from_mad_aid_packs_expected_bits() {
        let mad_aid = crate::mad::Aid { function_cluster_code: 0x08, application_code: 0x01 };
        let aid = Aid::from_mad_aid(mad_aid, 0x03).unwrap();
        assert_eq!(aid.value(), 0xf0_0000 | (0x08 << 12) | (0x01 << 4) | 0x03);
    }

    #[test]
    fn authenticate_legacy_full_round_trip() {
        let key = DesfireKey::des([0u8; 8]);
        let cipher = clone_cipher(&key);
        let mut ivect = vec![0u8; 8];

        let picc_rnd_b = [0xBBu8; 8];
        let mut enc_rnd_b = picc_rnd_b;
        cbc_chain(&cipher, &mut ivect, &mut enc_rnd_b, Direction::Send, Operation::Encypher);

        // PCD_RndA is drawn from OS randomness inside the engine, so the
        // PICC's final-frame reply can't be precomputed here; script a
        // final frame that can never match and assert authentication
        // fails closed rather than panicking or silently succeeding.
        let transport = ScriptedTransport::new(vec![
            {
                let mut v = enc_rnd_b.to_vec();
                v.push(CMD_ADDITIONAL_FRAME);
                v
            },
            vec![0u8; 9],
        ]);
        let mut tag = DesfireTag::new(transport, target());
        tag.connect().unwrap();
        assert!(matches!(tag.authenticate(0, &key), Err(Error::AccessDenied)));
    }

    #[test]
    fn get_application_ids_parses_three_byte_chunks() {
        let transport = ScriptedTransport::new(vec![vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x00]]);
        let mut tag = DesfireTag::new(transport, target());
        tag.connect().unwrap();
        let aids = tag.get_application_ids().unwrap();
        assert_eq!(aids, vec![Aid([1, 2, 3]), Aid([4, 5, 6])]);
    }

    #[test]
    fn select_application_clears_session_key_and_updates_state() {
        let transport = ScriptedTransport::new(vec![vec![0x00]]);
        let mut tag = DesfireTag::new(transport, target());
        tag.connect().unwrap();
        let aid = Aid::new(0x1234).unwrap();
        tag.select_application(aid).unwrap();
        assert_eq!(tag.selected_application, aid);
        assert!(tag.session_key.is_none());
    }

    #[test]
    fn free_mem_parses_three_byte_little_endian_size() {
        let transport = ScriptedTransport::new(vec![vec![0x00, 0x10, 0x00, 0x00]]);
        let mut tag = DesfireTag::new(transport, target());
        tag.connect().unwrap();
        assert_eq!(tag.free_mem().unwrap(), 0x1000);
    }

    #[test]
    fn get_df_names_collects_aid_and_name_across_frames() {
        let transport = ScriptedTransport::new(vec![
            {
                let mut v = vec![0x01, 0x02, 0x03];
                v.extend_from_slice(b"first");
                v.push(CMD_ADDITIONAL_FRAME);
                v
            },
            {
                let mut v = vec![0x04, 0x05, 0x06];
                v.extend_from_slice(b"second");
                v.push(0x00);
                v
            },
        ]);
        let mut tag = DesfireTag::new(transport, target());
        tag.connect().unwrap();
        let names = tag.get_df_names().unwrap();
        assert_eq!(names, vec![(Aid([1, 2, 3]), b"first".to_vec()), (Aid([4, 5, 6]), b"second".to_vec())]);
    }

    #[test]
    fn set_configuration_builds_enciphered_command_frame() {
        let transport = ScriptedTransport::new(vec![vec![0x00]]);
        let mut tag = DesfireTag::new(transport, target());
        tag.connect().unwrap();
        tag.set_configuration(true, true).unwrap();
        assert_eq!(tag.transport.requests[0][0], CMD_SET_CONFIGURATION);
        assert_eq!(tag.transport.requests[0][2], 0x03);
    }

    #[test]
    fn get_card_uid_sends_expected_opcode() {
        let transport = ScriptedTransport::new(vec![vec![1, 2, 3, 4, 5, 6, 7, 0x00]]);
        let mut tag = DesfireTag::new(transport, target());
        tag.connect().unwrap();
        tag.get_card_uid().unwrap();
        assert_eq!(tag.transport.requests[0], vec![CMD_GET_CARD_UID]);
    }

    #[test]
    fn set_ats_sends_length_prefixed_payload() {
        let transport = ScriptedTransport::new(vec![vec![0x00]]);
        let mut tag = DesfireTag::new(transport, target());
        tag.connect().unwrap();
        tag.set_ats(&[0x75, 0x33, 0x80]).unwrap();
        assert_eq!(tag.transport.requests[0], vec![CMD_SET_ATS, 0x03, 0x75, 0x33, 0x80]);
    }

    #[test]
    fn create_application_iso_appends_file_id_and_df_name() {
        let transport = ScriptedTransport::new(vec![vec![0x00]]);
        let mut tag = DesfireTag::new(transport, target());
        tag.connect().unwrap();
        let aid = Aid::new(0x112233).unwrap();
        tag.create_application_iso(aid, 0x0f, 0x01, Some(0xabcd), b"app").unwrap();
        let req = &tag.transport.requests[0];
        assert_eq!(req[0], CMD_CREATE_APPLICATION);
        assert_eq!(&req[1..4], &aid.0);
        assert_eq!(req[4], 0x0f);
        assert_eq!(req[5], 0x01 | 0x20);
        assert_eq!(&req[6..8], &0xabcdu16.to_le_bytes());
        assert_eq!(&req[8..], b"app");
    }

    #[test]
    fn set_default_key_requires_prior_authentication() {
        let transport = ScriptedTransport::new(vec![]);
        let mut tag = DesfireTag::new(transport, target());
        tag.connect().unwrap();
        let key = DesfireKey::des([0u8; 8]);
        assert!(matches!(tag.set_default_key(&key), Err(Error::InvalidState(_))));
    }

    #[test]
    fn change_file_settings_runs_plain_when_change_access_is_free() {
        // get_file_settings response: std data file, comm plain, access
        // rights with a free change-access nibble (0x0e), 3-byte size.
        let mut settings_response = vec![0x00, 0x00];
        settings_response.extend_from_slice(&0xee0eu16.to_le_bytes());
        settings_response.extend_from_slice(&[0x20, 0x00, 0x00]);
        settings_response.push(0x00);

        let transport = ScriptedTransport::new(vec![settings_response, vec![0x00]]);
        let mut tag = DesfireTag::new(transport, target());
        tag.connect().unwrap();
        tag.change_file_settings(3, 0x00, 0xee0e).unwrap();
        assert_eq!(tag.transport.requests[1][0], CMD_CHANGE_FILE_SETTINGS);
        assert!(!tag.file_settings_cache.contains_key(&3));
    }

    #[test]
    fn comm_mode_for_reads_cached_file_settings() {
        let mut settings_response = vec![0x00, 0x03];
        settings_response.extend_from_slice(&0xee0eu16.to_le_bytes());
        settings_response.extend_from_slice(&[0x20, 0x00, 0x00]);
        settings_response.push(0x00);

        let transport = ScriptedTransport::new(vec![settings_response]);
        let mut tag = DesfireTag::new(transport, target());
        tag.connect().unwrap();
        assert_eq!(tag.comm_mode_for(2).unwrap(), CommMode::Enciphered);
        assert!(tag.file_settings_cache.contains_key(&2));
    }
}
