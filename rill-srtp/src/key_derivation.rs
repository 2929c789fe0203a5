//! RFC 3711 AES-CM key derivation.

use openssl::symm::{encrypt, Cipher};
use shared::error::{Error, Result};

pub const LABEL_RTP_ENCRYPTION: u8 = 0x00;
pub const LABEL_RTP_AUTH: u8 = 0x01;
pub const LABEL_RTP_SALT: u8 = 0x02;
pub const LABEL_RTCP_ENCRYPTION: u8 = 0x03;
pub const LABEL_RTCP_AUTH: u8 = 0x04;
pub const LABEL_RTCP_SALT: u8 = 0x05;

/// Derives one session key of `out_len` bytes from the master secret.
///
/// With a key derivation rate of zero the derivation input is just the
/// label XORed into byte 7 of the master salt, padded to a 16-byte IV.
pub fn derive_session_key(
    master_key: &[u8],
    master_salt: &[u8],
    label: u8,
    out_len: usize,
) -> Result<Vec<u8>> {
    if master_key.len() != 16 {
        return Err(Error::SrtpKeyLength {
            expect: 16,
            got: master_key.len(),
        });
    }
    if master_salt.len() != 14 {
        return Err(Error::SrtpKeyLength {
            expect: 14,
            got: master_salt.len(),
        });
    }

    let mut iv = [0u8; 16];
    iv[..14].copy_from_slice(master_salt);
    iv[7] ^= label;

    // AES-CM keystream over zeros
    let zeros = vec![0u8; (out_len + 15) / 16 * 16];
    let keystream = encrypt(Cipher::aes_128_ctr(), master_key, Some(&iv), &zeros)
        .map_err(|e| Error::Internal(format!("srtp kdf: {e}")))?;
    Ok(keystream[..out_len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 3711 appendix B.3 test vectors
    const MASTER_KEY: [u8; 16] = [
        0xE1, 0xF9, 0x7A, 0x0D, 0x3E, 0x01, 0x8B, 0xE0, 0xD6, 0x4F, 0xA3, 0x2C, 0x06, 0xDE,
        0x41, 0x39,
    ];
    const MASTER_SALT: [u8; 14] = [
        0x0E, 0xC6, 0x75, 0xAD, 0x49, 0x8A, 0xFE, 0xEB, 0xB6, 0x96, 0x0B, 0x3A, 0xAB, 0xE6,
    ];

    #[test]
    fn test_rfc3711_cipher_key() {
        let key =
            derive_session_key(&MASTER_KEY, &MASTER_SALT, LABEL_RTP_ENCRYPTION, 16).unwrap();
        assert_eq!(
            key,
            vec![
                0xC6, 0x1E, 0x7A, 0x93, 0x74, 0x4F, 0x39, 0xEE, 0x10, 0x73, 0x4A, 0xFE, 0x3F,
                0xF7, 0xA0, 0x87
            ]
        );
    }

    #[test]
    fn test_rfc3711_salt() {
        let salt = derive_session_key(&MASTER_KEY, &MASTER_SALT, LABEL_RTP_SALT, 14).unwrap();
        assert_eq!(
            salt,
            vec![
                0x30, 0xCB, 0xBC, 0x08, 0x86, 0x3D, 0x8C, 0x85, 0xD4, 0x9D, 0xB3, 0x4A, 0x9A,
                0xE1
            ]
        );
    }

    #[test]
    fn test_rfc3711_auth_key_prefix() {
        let auth = derive_session_key(&MASTER_KEY, &MASTER_SALT, LABEL_RTP_AUTH, 20).unwrap();
        assert_eq!(
            &auth[..10],
            &[0xCE, 0xBE, 0x32, 0x1F, 0x6F, 0xF7, 0x71, 0x6B, 0x6F, 0xD4]
        );
    }

    #[test]
    fn test_bad_lengths_rejected() {
        assert!(derive_session_key(&[0u8; 15], &MASTER_SALT, 0, 16).is_err());
        assert!(derive_session_key(&MASTER_KEY, &[0u8; 13], 0, 16).is_err());
    }
}
