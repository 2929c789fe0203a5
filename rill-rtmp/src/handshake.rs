//! RTMP handshake: the plain C0C1C2/S0S1S2 exchange and the FMS-compatible
//! complex variant with HMAC-SHA256 digests.
//!
//! The server first tries to validate C1 as a complex handshake (schema0,
//! then schema1); when neither digest verifies it falls back to the simple
//! scheme, which is what older encoders send.

use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use shared::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const C0_LEN: usize = 1;
pub const C1_LEN: usize = 1536;
pub const RTMP_VERSION: u8 = 3;

/// Genuine Flash Player key; the first 30 bytes sign C1.
const FP_KEY: [u8; 62] = [
    0x47, 0x65, 0x6E, 0x75, 0x69, 0x6E, 0x65, 0x20, 0x41, 0x64, 0x6F, 0x62, 0x65, 0x20, 0x46,
    0x6C, 0x61, 0x73, 0x68, 0x20, 0x50, 0x6C, 0x61, 0x79, 0x65, 0x72, 0x20, 0x30, 0x30, 0x31,
    0xF0, 0xEE, 0xC2, 0x4A, 0x80, 0x68, 0xBE, 0xE8, 0x2E, 0x00, 0xD0, 0xD1, 0x02, 0x9E, 0x7E,
    0x57, 0x6E, 0xEC, 0x5D, 0x2D, 0x29, 0x80, 0x6F, 0xAB, 0x93, 0xB8, 0xE6, 0x36, 0xCF, 0xEB,
    0x31, 0xAE,
];

/// Genuine Flash Media Server key; the first 36 bytes sign S1.
const FMS_KEY: [u8; 68] = [
    0x47, 0x65, 0x6e, 0x75, 0x69, 0x6e, 0x65, 0x20, 0x41, 0x64, 0x6f, 0x62, 0x65, 0x20, 0x46,
    0x6c, 0x61, 0x73, 0x68, 0x20, 0x4d, 0x65, 0x64, 0x69, 0x61, 0x20, 0x53, 0x65, 0x72, 0x76,
    0x65, 0x72, 0x20, 0x30, 0x30, 0x31, 0xf0, 0xee, 0xc2, 0x4a, 0x80, 0x68, 0xbe, 0xe8, 0x2e,
    0x00, 0xd0, 0xd1, 0x02, 0x9e, 0x7e, 0x57, 0x6e, 0xec, 0x5d, 0x2d, 0x29, 0x80, 0x6f, 0xab,
    0x93, 0xb8, 0xe6, 0x36, 0xcf, 0xeb, 0x31, 0xae,
];

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Digest chunk offset within a 764-byte digest block: the four offset
/// bytes summed, modulo the space left for the 32-byte digest.
fn digest_offset(block: &[u8]) -> usize {
    let sum = block[0] as usize + block[1] as usize + block[2] as usize + block[3] as usize;
    4 + sum % 728
}

/// Where the digest block starts in C1/S1 for each schema.
/// schema0: time, version, key block, digest block. schema1: time, version,
/// digest block, key block.
fn digest_block_base(schema: usize) -> usize {
    if schema == 0 {
        8 + 764
    } else {
        8
    }
}

/// C1 joined without its 32-byte digest chunk, the HMAC input.
fn join_without_digest(c1: &[u8], digest_at: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(C1_LEN - 32);
    out.extend_from_slice(&c1[..digest_at]);
    out.extend_from_slice(&c1[digest_at + 32..]);
    out
}

/// Validates C1 against one schema, returning the embedded digest.
fn validate_c1_schema(c1: &[u8], schema: usize) -> Option<[u8; 32]> {
    let base = digest_block_base(schema);
    let digest_at = base + digest_offset(&c1[base..base + 764]);
    if digest_at + 32 > C1_LEN {
        return None;
    }
    let expect = &c1[digest_at..digest_at + 32];
    let actual = hmac_sha256(&FP_KEY[..30], &join_without_digest(c1, digest_at));
    if actual == expect {
        let mut d = [0u8; 32];
        d.copy_from_slice(expect);
        Some(d)
    } else {
        None
    }
}

/// Result of inspecting C1.
pub enum C1Kind {
    Simple,
    /// Complex handshake with the client digest that S2 must countersign.
    Complex { c1_digest: [u8; 32] },
}

/// Tries both digest schemas on C1.
pub fn inspect_c1(c1: &[u8]) -> Result<C1Kind> {
    if c1.len() != C1_LEN {
        return Err(Error::HandshakeFailed(format!(
            "c1 must be {C1_LEN} bytes, got {}",
            c1.len()
        )));
    }
    for schema in [1usize, 0] {
        if let Some(c1_digest) = validate_c1_schema(c1, schema) {
            return Ok(C1Kind::Complex { c1_digest });
        }
    }
    Ok(C1Kind::Simple)
}

/// Builds S1 + S2 for the simple handshake: S1 is random, S2 echoes C1.
pub fn simple_s1s2(c1: &[u8]) -> (Bytes, Bytes) {
    let mut s1 = vec![0u8; C1_LEN];
    rand::thread_rng().fill_bytes(&mut s1);
    // zero time/version keeps old encoders happy
    s1[..8].fill(0);
    (Bytes::from(s1), Bytes::copy_from_slice(c1))
}

/// Builds S1 + S2 for the complex handshake.
///
/// S1 carries an FMS digest at the schema1 position; S2 is random and
/// countersigned with a key derived from the client's C1 digest.
pub fn complex_s1s2(c1_digest: &[u8; 32]) -> (Bytes, Bytes) {
    let mut s1 = vec![0u8; C1_LEN];
    rand::thread_rng().fill_bytes(&mut s1);
    s1[..4].fill(0); // time
    s1[4..8].copy_from_slice(&[4, 5, 0, 1]); // server version

    let base = digest_block_base(1);
    let digest_at = base + digest_offset(&s1[base..base + 764]);
    let digest = hmac_sha256(&FMS_KEY[..36], &join_without_digest(&s1, digest_at));
    s1[digest_at..digest_at + 32].copy_from_slice(&digest);

    let mut s2 = vec![0u8; C1_LEN];
    rand::thread_rng().fill_bytes(&mut s2);
    let s2_key = hmac_sha256(&FMS_KEY, c1_digest);
    let s2_digest = hmac_sha256(&s2_key, &s2[..C1_LEN - 32]);
    s2[C1_LEN - 32..].copy_from_slice(&s2_digest);

    (Bytes::from(s1), Bytes::from(s2))
}

/// Client-side C0 + C1 for the simple handshake (used by the forwarder).
pub fn client_c0c1() -> Bytes {
    let mut out = BytesMut::with_capacity(1 + C1_LEN);
    out.put_u8(RTMP_VERSION);
    let mut c1 = vec![0u8; C1_LEN];
    rand::thread_rng().fill_bytes(&mut c1);
    c1[..8].fill(0);
    out.extend_from_slice(&c1);
    out.freeze()
}
