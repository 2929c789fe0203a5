/// SRTP protection profiles the DTLS use_srtp negotiation can land on.
///
/// Only AES_CM_128_HMAC_SHA1_80 is offered; it is what the original server
/// installs and what every mainstream WebRTC stack accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtectionProfile {
    #[default]
    Aes128CmHmacSha1_80,
}

impl ProtectionProfile {
    pub fn key_len(&self) -> usize {
        16
    }

    pub fn salt_len(&self) -> usize {
        14
    }

    pub fn auth_key_len(&self) -> usize {
        20
    }

    pub fn auth_tag_len(&self) -> usize {
        10
    }

    /// The string form openssl's `set_tlsext_use_srtp` expects.
    pub fn openssl_name(&self) -> &'static str {
        "SRTP_AES128_CM_SHA1_80"
    }
}
