//! SRTP/SRTCP session context: protect and unprotect in place.

use crate::key_derivation::{
    derive_session_key, LABEL_RTCP_AUTH, LABEL_RTCP_ENCRYPTION, LABEL_RTCP_SALT, LABEL_RTP_AUTH,
    LABEL_RTP_ENCRYPTION, LABEL_RTP_SALT,
};
use crate::protection_profile::ProtectionProfile;
use bytes::BytesMut;
use hmac::{Hmac, Mac};
use openssl::symm::{encrypt, Cipher};
use sha1::Sha1;
use shared::error::{Error, Result};
use std::collections::HashMap;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

const SRTCP_INDEX_E_FLAG: u32 = 0x8000_0000;
const REPLAY_WINDOW: u64 = 64;

struct ReplayWindow {
    max_index: u64,
    bitmap: u64,
    primed: bool,
}

impl ReplayWindow {
    fn new() -> Self {
        Self {
            max_index: 0,
            bitmap: 0,
            primed: false,
        }
    }

    /// Accepts the index and records it, or rejects a replay/too-old index.
    fn check_and_update(&mut self, index: u64) -> bool {
        if !self.primed {
            self.primed = true;
            self.max_index = index;
            self.bitmap = 1;
            return true;
        }
        if index > self.max_index {
            let shift = index - self.max_index;
            self.bitmap = if shift >= REPLAY_WINDOW {
                1
            } else {
                (self.bitmap << shift) | 1
            };
            self.max_index = index;
            return true;
        }
        let behind = self.max_index - index;
        if behind >= REPLAY_WINDOW {
            return false;
        }
        if self.bitmap & (1 << behind) != 0 {
            return false;
        }
        self.bitmap |= 1 << behind;
        true
    }
}

#[derive(Default)]
struct SsrcState {
    rollover_counter: u32,
    highest_seq: u16,
    primed: bool,
}

impl SsrcState {
    /// RFC 3711 appendix A rollover estimation for inbound packets.
    fn estimate_roc(&self, seq: u16) -> u32 {
        if !self.primed {
            return 0;
        }
        let s_l = self.highest_seq;
        if s_l < 0x8000 {
            if seq > s_l && seq.wrapping_sub(s_l) > 0x8000 {
                self.rollover_counter.wrapping_sub(1)
            } else {
                self.rollover_counter
            }
        } else if seq < s_l && s_l.wrapping_sub(seq) > 0x8000 {
            self.rollover_counter.wrapping_add(1)
        } else {
            self.rollover_counter
        }
    }

    fn commit(&mut self, seq: u16, roc: u32) {
        let index = ((roc as u64) << 16) | seq as u64;
        let current = ((self.rollover_counter as u64) << 16) | self.highest_seq as u64;
        if !self.primed || index > current {
            self.primed = true;
            self.rollover_counter = roc;
            self.highest_seq = seq;
        }
    }
}

/// One direction of SRTP protection.
///
/// A session installs two contexts out of the DTLS keying material: one that
/// protects outbound packets, one that unprotects inbound ones. Both work in
/// place on a `BytesMut` and adjust its length.
pub struct SrtpContext {
    profile: ProtectionProfile,
    rtp_session_key: Vec<u8>,
    rtp_session_salt: Vec<u8>,
    rtp_auth_key: Vec<u8>,
    rtcp_session_key: Vec<u8>,
    rtcp_session_salt: Vec<u8>,
    rtcp_auth_key: Vec<u8>,
    rtp_ssrc_states: HashMap<u32, SsrcState>,
    rtp_replay: HashMap<u32, ReplayWindow>,
    rtcp_replay: HashMap<u32, ReplayWindow>,
    /// Outbound SRTCP index, incremented per protected compound.
    rtcp_index: u32,
}

impl SrtpContext {
    pub fn new(
        profile: ProtectionProfile,
        master_key: &[u8],
        master_salt: &[u8],
    ) -> Result<Self> {
        Ok(Self {
            profile,
            rtp_session_key: derive_session_key(
                master_key,
                master_salt,
                LABEL_RTP_ENCRYPTION,
                profile.key_len(),
            )?,
            rtp_session_salt: derive_session_key(
                master_key,
                master_salt,
                LABEL_RTP_SALT,
                profile.salt_len(),
            )?,
            rtp_auth_key: derive_session_key(
                master_key,
                master_salt,
                LABEL_RTP_AUTH,
                profile.auth_key_len(),
            )?,
            rtcp_session_key: derive_session_key(
                master_key,
                master_salt,
                LABEL_RTCP_ENCRYPTION,
                profile.key_len(),
            )?,
            rtcp_session_salt: derive_session_key(
                master_key,
                master_salt,
                LABEL_RTCP_SALT,
                profile.salt_len(),
            )?,
            rtcp_auth_key: derive_session_key(
                master_key,
                master_salt,
                LABEL_RTCP_AUTH,
                profile.auth_key_len(),
            )?,
            rtp_ssrc_states: HashMap::new(),
            rtp_replay: HashMap::new(),
            rtcp_replay: HashMap::new(),
            rtcp_index: 0,
        })
    }

    /// Encrypts and authenticates an RTP packet in place.
    pub fn protect_rtp(&mut self, packet: &mut BytesMut) -> Result<()> {
        let header_len = rtp_header_len(packet)?;
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        let seq = u16::from_be_bytes([packet[2], packet[3]]);

        let state = self.rtp_ssrc_states.entry(ssrc).or_default();
        // sender side: wrap forward increments the rollover counter
        let roc = if state.primed && seq < state.highest_seq && state.highest_seq - seq > 0x8000
        {
            state.rollover_counter.wrapping_add(1)
        } else if state.primed {
            state.rollover_counter
        } else {
            0
        };
        state.commit(seq, roc);

        let iv = rtp_iv(&self.rtp_session_salt, ssrc, roc, seq);
        let ciphertext = encrypt(
            Cipher::aes_128_ctr(),
            &self.rtp_session_key,
            Some(&iv),
            &packet[header_len..],
        )
        .map_err(|e| Error::Internal(format!("srtp encrypt: {e}")))?;
        packet.truncate(header_len);
        packet.extend_from_slice(&ciphertext);

        let tag = self.rtp_tag(packet, roc)?;
        packet.extend_from_slice(&tag);
        Ok(())
    }

    /// Verifies and decrypts an RTP packet in place.
    pub fn unprotect_rtp(&mut self, packet: &mut BytesMut) -> Result<()> {
        let tag_len = self.profile.auth_tag_len();
        if packet.len() < 12 + tag_len {
            return Err(Error::SrtpShortPacket(packet.len()));
        }
        let header_len = rtp_header_len(packet)?;
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        let seq = u16::from_be_bytes([packet[2], packet[3]]);

        let roc = self.rtp_ssrc_states.entry(ssrc).or_default().estimate_roc(seq);
        let index = ((roc as u64) << 16) | seq as u64;

        let body_len = packet.len() - tag_len;
        let expect_tag = packet[body_len..].to_vec();
        let tag = self.rtp_tag(&packet[..body_len], roc)?;
        if tag.ct_eq(expect_tag.as_slice()).unwrap_u8() != 1 {
            return Err(Error::SrtpAuthFailed);
        }

        let replay = self.rtp_replay.entry(ssrc).or_insert_with(ReplayWindow::new);
        if !replay.check_and_update(index) {
            return Err(Error::SrtpReplayed { ssrc, index });
        }

        let iv = rtp_iv(&self.rtp_session_salt, ssrc, roc, seq);
        let plaintext = encrypt(
            Cipher::aes_128_ctr(),
            &self.rtp_session_key,
            Some(&iv),
            &packet[header_len..body_len],
        )
        .map_err(|e| Error::Internal(format!("srtp decrypt: {e}")))?;
        packet.truncate(header_len);
        packet.extend_from_slice(&plaintext);

        self.rtp_ssrc_states
            .entry(ssrc)
            .or_default()
            .commit(seq, roc);
        Ok(())
    }

    /// Encrypts and authenticates an RTCP compound in place.
    pub fn protect_rtcp(&mut self, packet: &mut BytesMut) -> Result<()> {
        if packet.len() < 8 {
            return Err(Error::SrtpShortPacket(packet.len()));
        }
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        self.rtcp_index = (self.rtcp_index + 1) & 0x7FFF_FFFF;
        let index = self.rtcp_index;

        let iv = rtcp_iv(&self.rtcp_session_salt, ssrc, index);
        let ciphertext = encrypt(
            Cipher::aes_128_ctr(),
            &self.rtcp_session_key,
            Some(&iv),
            &packet[8..],
        )
        .map_err(|e| Error::Internal(format!("srtcp encrypt: {e}")))?;
        packet.truncate(8);
        packet.extend_from_slice(&ciphertext);
        packet.extend_from_slice(&(index | SRTCP_INDEX_E_FLAG).to_be_bytes());

        let mut mac = HmacSha1::new_from_slice(&self.rtcp_auth_key)
            .map_err(|_| Error::Internal("srtcp auth key".into()))?;
        mac.update(packet);
        let tag = mac.finalize().into_bytes();
        packet.extend_from_slice(&tag[..self.profile.auth_tag_len()]);
        Ok(())
    }

    /// Verifies and decrypts an RTCP compound in place.
    pub fn unprotect_rtcp(&mut self, packet: &mut BytesMut) -> Result<()> {
        let tag_len = self.profile.auth_tag_len();
        if packet.len() < 8 + 4 + tag_len {
            return Err(Error::SrtpShortPacket(packet.len()));
        }
        let body_len = packet.len() - tag_len;
        let expect_tag = packet[body_len..].to_vec();

        let mut mac = HmacSha1::new_from_slice(&self.rtcp_auth_key)
            .map_err(|_| Error::Internal("srtcp auth key".into()))?;
        mac.update(&packet[..body_len]);
        let tag = mac.finalize().into_bytes();
        if tag[..tag_len].ct_eq(expect_tag.as_slice()).unwrap_u8() != 1 {
            return Err(Error::SrtpAuthFailed);
        }

        let index_off = body_len - 4;
        let raw_index = u32::from_be_bytes([
            packet[index_off],
            packet[index_off + 1],
            packet[index_off + 2],
            packet[index_off + 3],
        ]);
        let encrypted = raw_index & SRTCP_INDEX_E_FLAG != 0;
        let index = raw_index & 0x7FFF_FFFF;
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);

        let replay = self
            .rtcp_replay
            .entry(ssrc)
            .or_insert_with(ReplayWindow::new);
        if !replay.check_and_update(index as u64) {
            return Err(Error::SrtpReplayed {
                ssrc,
                index: index as u64,
            });
        }

        let payload = if encrypted {
            let iv = rtcp_iv(&self.rtcp_session_salt, ssrc, index);
            encrypt(
                Cipher::aes_128_ctr(),
                &self.rtcp_session_key,
                Some(&iv),
                &packet[8..index_off],
            )
            .map_err(|e| Error::Internal(format!("srtcp decrypt: {e}")))?
        } else {
            packet[8..index_off].to_vec()
        };
        packet.truncate(8);
        packet.extend_from_slice(&payload);
        Ok(())
    }

    fn rtp_tag(&self, data: &[u8], roc: u32) -> Result<Vec<u8>> {
        let mut mac = HmacSha1::new_from_slice(&self.rtp_auth_key)
            .map_err(|_| Error::Internal("srtp auth key".into()))?;
        mac.update(data);
        mac.update(&roc.to_be_bytes());
        Ok(mac.finalize().into_bytes()[..self.profile.auth_tag_len()].to_vec())
    }
}

/// RTP fixed header plus CSRCs and extension, i.e. where the payload begins.
fn rtp_header_len(packet: &[u8]) -> Result<usize> {
    if packet.len() < 12 {
        return Err(Error::SrtpShortPacket(packet.len()));
    }
    let cc = (packet[0] & 0x0F) as usize;
    let has_ext = packet[0] & 0x10 != 0;
    let mut len = 12 + cc * 4;
    if has_ext {
        if packet.len() < len + 4 {
            return Err(Error::SrtpShortPacket(packet.len()));
        }
        let words = u16::from_be_bytes([packet[len + 2], packet[len + 3]]) as usize;
        len += 4 + words * 4;
    }
    if packet.len() < len {
        return Err(Error::SrtpShortPacket(packet.len()));
    }
    Ok(len)
}

fn rtp_iv(salt: &[u8], ssrc: u32, roc: u32, seq: u16) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..14].copy_from_slice(salt);
    for (i, b) in ssrc.to_be_bytes().iter().enumerate() {
        iv[4 + i] ^= b;
    }
    let index = ((roc as u64) << 16) | seq as u64;
    for (i, b) in index.to_be_bytes()[2..].iter().enumerate() {
        iv[8 + i] ^= b;
    }
    iv
}

fn rtcp_iv(salt: &[u8], ssrc: u32, index: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..14].copy_from_slice(salt);
    for (i, b) in ssrc.to_be_bytes().iter().enumerate() {
        iv[4 + i] ^= b;
    }
    for (i, b) in index.to_be_bytes().iter().enumerate() {
        iv[10 + i] ^= b;
    }
    iv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SrtpContext, SrtpContext) {
        let key = [0x11u8; 16];
        let salt = [0x22u8; 14];
        (
            SrtpContext::new(ProtectionProfile::default(), &key, &salt).unwrap(),
            SrtpContext::new(ProtectionProfile::default(), &key, &salt).unwrap(),
        )
    }

    fn rtp_packet(seq: u16, ssrc: u32, payload: &[u8]) -> BytesMut {
        let mut p = BytesMut::new();
        p.extend_from_slice(&[0x80, 96]);
        p.extend_from_slice(&seq.to_be_bytes());
        p.extend_from_slice(&1000u32.to_be_bytes());
        p.extend_from_slice(&ssrc.to_be_bytes());
        p.extend_from_slice(payload);
        p
    }

    #[test]
    fn test_rtp_protect_unprotect_round_trip() {
        let (mut tx, mut rx) = pair();
        let original = rtp_packet(100, 7, b"media payload");
        let mut wire = original.clone();
        tx.protect_rtp(&mut wire).unwrap();

        assert_eq!(wire.len(), original.len() + 10);
        assert_ne!(&wire[12..original.len()], &original[12..]);

        rx.unprotect_rtp(&mut wire).unwrap();
        assert_eq!(wire, original);
    }

    #[test]
    fn test_rtp_tampered_auth_fails() {
        let (mut tx, mut rx) = pair();
        let mut wire = rtp_packet(1, 7, b"x");
        tx.protect_rtp(&mut wire).unwrap();
        wire[14] ^= 0xFF;
        assert!(matches!(
            rx.unprotect_rtp(&mut wire),
            Err(Error::SrtpAuthFailed)
        ));
    }

    #[test]
    fn test_rtp_replay_rejected() {
        let (mut tx, mut rx) = pair();
        let mut wire = rtp_packet(5, 7, b"x");
        tx.protect_rtp(&mut wire).unwrap();
        let replayed = wire.clone();

        rx.unprotect_rtp(&mut wire).unwrap();
        let mut again = replayed.clone();
        assert!(matches!(
            rx.unprotect_rtp(&mut again),
            Err(Error::SrtpReplayed { .. })
        ));
    }

    #[test]
    fn test_rtp_seq_wraparound_roc() {
        let (mut tx, mut rx) = pair();
        for seq in [65534u16, 65535, 0, 1] {
            let original = rtp_packet(seq, 9, b"wrap");
            let mut wire = original.clone();
            tx.protect_rtp(&mut wire).unwrap();
            rx.unprotect_rtp(&mut wire).unwrap();
            assert_eq!(wire, original, "seq {seq}");
        }
        // sender rolled over
        assert_eq!(tx.rtp_ssrc_states[&9].rollover_counter, 1);
    }

    #[test]
    fn test_rtcp_round_trip() {
        let (mut tx, mut rx) = pair();
        // minimal RR: header + ssrc
        let mut packet = BytesMut::new();
        packet.extend_from_slice(&[0x80, 201, 0x00, 0x01]);
        packet.extend_from_slice(&42u32.to_be_bytes());
        let original = packet.clone();

        tx.protect_rtcp(&mut packet).unwrap();
        assert_eq!(packet.len(), original.len() + 4 + 10);
        rx.unprotect_rtcp(&mut packet).unwrap();
        assert_eq!(packet, original);
    }

    #[test]
    fn test_rtcp_replay_rejected() {
        let (mut tx, mut rx) = pair();
        let mut packet = BytesMut::new();
        packet.extend_from_slice(&[0x80, 201, 0x00, 0x01]);
        packet.extend_from_slice(&42u32.to_be_bytes());
        tx.protect_rtcp(&mut packet).unwrap();
        let replayed = packet.clone();

        rx.unprotect_rtcp(&mut packet).unwrap();
        let mut again = replayed;
        assert!(rx.unprotect_rtcp(&mut again).is_err());
    }

    #[test]
    fn test_short_packet_rejected() {
        let (_, mut rx) = pair();
        let mut short = BytesMut::from(&[0x80u8, 96, 0, 1][..]);
        assert!(matches!(
            rx.unprotect_rtp(&mut short),
            Err(Error::SrtpShortPacket(_))
        ));
    }
}
