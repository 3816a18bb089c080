//! Tag dispatcher (C5): from a low-level target descriptor, select one of
//! the supported card families and allocate its engine state.
//!
//! Steps through a table of signatures — (modulation, SAK, ATS-prefix,
//! optional predicate) — and takes the first match. Predicates cover the
//! two families that can't be told apart from SAK/ATS alone: Ultralight-C
//! (probed with an ISO authenticate-0 command) and NTAG21x (probed with
//! `GET_VERSION` under raw framing).

use crate::classic::ClassicTag;
use crate::desfire::DesfireTag;
use crate::error::Error;
use crate::transport::{Framing, Modulation, TargetDescriptor, Transport};
use crate::ultralight::UltralightTag;

/// MIFARE Classic sector layout, distinguished by SAK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassicSize {
    OneK,
    FourK,
}

/// MIFARE Ultralight variant, distinguished by the authenticate-0 probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UltralightKind {
    Plain,
    UltralightC,
}

/// A FeliCa target, recognized but not driven by a command engine.
#[derive(Debug, Clone)]
pub struct FeliCaTarget {
    pub manufacturer_id: Vec<u8>,
    pub system_code: [u8; 2],
}

/// The tagged sum of every card family the dispatcher can recognize.
pub enum Tag<T: Transport> {
    Classic(ClassicSize, ClassicTag<T>),
    DESFire(DesfireTag<T>),
    Ultralight(UltralightKind, UltralightTag<T>),
    Ntag21x(UltralightTag<T>),
    FeliCa(FeliCaTarget),
}

/// The family a `Tag` was dispatched into, independent of its connection
/// state or owned transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Classic(ClassicSize),
    DESFire,
    Ultralight(UltralightKind),
    Ntag21x,
    FeliCa,
}

impl<T: Transport> Tag<T> {
    /// The family this tag was dispatched into.
    pub fn tag_kind(&self) -> TagKind {
        match self {
            Tag::Classic(size, _) => TagKind::Classic(*size),
            Tag::DESFire(_) => TagKind::DESFire,
            Tag::Ultralight(kind, _) => TagKind::Ultralight(*kind),
            Tag::Ntag21x(_) => TagKind::Ntag21x,
            Tag::FeliCa(_) => TagKind::FeliCa,
        }
    }

    /// The target's UID as a lowercase hex string, the way `freefare_get_tag_uid`
    /// renders it.
    pub fn tag_uid(&self) -> String {
        let uid = match self {
            Tag::Classic(_, tag) => tag.uid(),
            Tag::DESFire(tag) => tag.uid(),
            Tag::Ultralight(_, tag) | Tag::Ntag21x(tag) => tag.uid(),
            Tag::FeliCa(target) => &target.manufacturer_id,
        };
        uid.iter().map(|b| format!("{b:02x}")).collect()
    }
}

const SAK_CLASSIC_1K: u8 = 0x08;
const SAK_CLASSIC_4K: u8 = 0x18;
const SAK_ULTRALIGHT: u8 = 0x00;
const SAK_DESFIRE: u8 = 0x20;

const DESFIRE_ATS_PREFIX: [u8; 3] = [0x75, 0x77, 0x81];

const CMD_ISO_AUTHENTICATE_0: u8 = 0x1A;
const CMD_GET_VERSION: u8 = 0x60;

/// Sends the Ultralight-C authenticate-0 probe and reports whether the
/// response has the shape of a 3DES challenge (an 8-byte encrypted
/// `RndB`, rather than an error status).
fn probe_ultralight_c<T: Transport>(transport: &mut T) -> bool {
    transport.set_framing(Framing::Raw);
    match transport.transceive(&[CMD_ISO_AUTHENTICATE_0, 0x00]) {
        Ok(response) => response.len() == 8,
        Err(_) => false,
    }
}

/// Sends `GET_VERSION` under raw framing and reports whether the card
/// answered with a well-formed version response (NTAG21x replies here;
/// plain Ultralight/Ultralight-C return an error status or nothing).
fn probe_ntag21x<T: Transport>(transport: &mut T) -> bool {
    transport.set_framing(Framing::Raw);
    match transport.transceive(&[CMD_GET_VERSION]) {
        Ok(response) => response.len() >= 7 && response[0] == 0x00,
        Err(_) => false,
    }
}

/// Given a target descriptor and the transport it arrived on, select the
/// matching family engine and hand both back as one tagged value.
///
/// Consumes `transport` unconditionally: a probe may have already spoken
/// to the card, so the transport is always threaded into the resulting
/// engine rather than handed back on a non-match.
pub fn dispatch<T: Transport>(mut transport: T, target: TargetDescriptor) -> Result<Tag<T>, Error> {
    if target.modulation == Modulation::FeliCa {
        if target.uid.len() < 8 {
            return Err(Error::UnknownTagType);
        }
        return Ok(Tag::FeliCa(FeliCaTarget {
            manufacturer_id: target.uid[..8].to_vec(),
            system_code: [target.uid.get(8).copied().unwrap_or(0), target.uid.get(9).copied().unwrap_or(0)],
        }));
    }

    match target.sak {
        SAK_CLASSIC_1K => return Ok(Tag::Classic(ClassicSize::OneK, ClassicTag::new(transport, target))),
        SAK_CLASSIC_4K => return Ok(Tag::Classic(ClassicSize::FourK, ClassicTag::new(transport, target))),
        SAK_DESFIRE if target.ats.starts_with(&DESFIRE_ATS_PREFIX) => {
            return Ok(Tag::DESFire(DesfireTag::new(transport, target)))
        }
        SAK_ULTRALIGHT => {
            if probe_ntag21x(&mut transport) {
                return Ok(Tag::Ntag21x(UltralightTag::new(transport, target)));
            }
            let kind = if probe_ultralight_c(&mut transport) { UltralightKind::UltralightC } else { UltralightKind::Plain };
            return Ok(Tag::Ultralight(kind, UltralightTag::new(transport, target)));
        }
        _ => {}
    }

    Err(Error::UnknownTagType)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;

    fn descriptor(modulation: Modulation, sak: u8, ats: Vec<u8>, uid: Vec<u8>) -> TargetDescriptor {
        TargetDescriptor { uid, sak, ats, modulation }
    }

    #[test]
    fn recognizes_classic_1k_by_sak() {
        let transport = ScriptedTransport::new(vec![]);
        let target = descriptor(Modulation::Iso14443A, SAK_CLASSIC_1K, vec![], vec![1, 2, 3, 4]);
        match dispatch(transport, target).unwrap() {
            Tag::Classic(ClassicSize::OneK, _) => {}
            _ => panic!("expected Classic 1K"),
        }
    }

    #[test]
    fn recognizes_desfire_by_sak_and_ats() {
        let transport = ScriptedTransport::new(vec![]);
        let target = descriptor(Modulation::Iso14443A, SAK_DESFIRE, vec![0x75, 0x77, 0x81, 0x02], vec![1, 2, 3, 4, 5, 6, 7]);
        match dispatch(transport, target).unwrap() {
            Tag::DESFire(_) => {}
            _ => panic!("expected DESFire"),
        }
    }

    #[test]
    fn rejects_sak_without_matching_signature() {
        let transport = ScriptedTransport::new(vec![]);
        let target = descriptor(Modulation::Iso14443A, 0xFF, vec![], vec![1, 2, 3, 4]);
        assert!(matches!(dispatch(transport, target), Err(Error::UnknownTagType)));
    }

    #[test]
    fn ultralight_probe_falls_back_to_plain_when_both_probes_fail() {
        // Neither probe gets a recognizable response; falls back to plain Ultralight.
        let transport = ScriptedTransport::new(vec![vec![0x6A, 0x81], vec![0x6A, 0x81]]);
        let target = descriptor(Modulation::Iso14443A, SAK_ULTRALIGHT, vec![], vec![1, 2, 3, 4]);
        match dispatch(transport, target).unwrap() {
            Tag::Ultralight(UltralightKind::Plain, _) => {}
            other => panic!("expected plain Ultralight, got a different variant: {}", matches!(other, Tag::Ultralight(_, _))),
        }
    }

    #[test]
    fn ntag21x_probe_matches_on_well_formed_get_version() {
        let response = vec![0x00, 0x04, 0x04, 0x02, 0x01, 0x00, 0x11, 0x03];
        let transport = ScriptedTransport::new(vec![response]);
        let target = descriptor(Modulation::Iso14443A, SAK_ULTRALIGHT, vec![], vec![1, 2, 3, 4]);
        match dispatch(transport, target).unwrap() {
            Tag::Ntag21x(_) => {}
            _ => panic!("expected NTAG21x"),
        }
    }

    #[test]
    fn tag_kind_and_uid_reflect_the_dispatched_family() {
        let transport = ScriptedTransport::new(vec![]);
        let target = descriptor(Modulation::Iso14443A, SAK_CLASSIC_1K, vec![], vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let tag = dispatch(transport, target).unwrap();
        assert_eq!(tag.tag_kind(), TagKind::Classic(ClassicSize::OneK));
        assert_eq!(tag.tag_uid(), "deadbeef");
    }

    #[test]
    fn felica_recognized_by_modulation_only() {
        let transport = ScriptedTransport::new(vec![]);
        let target = descriptor(Modulation::FeliCa, 0x00, vec![], vec![1, 2, 3, 4, 5, 6, 7, 8, 0x03, 0x00]);
        match dispatch(transport, target).unwrap() {
            Tag::FeliCa(info) => assert_eq!(info.system_code, [0x03, 0x00]),
            _ => panic!("expected FeliCa"),
        }
    }
}
