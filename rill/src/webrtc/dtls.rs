//! DTLS transport over openssl with in-memory datagram channels.
//!
//! The session feeds raw UDP payloads in and drains outbound flights; the
//! handshake itself, certificates and the SRTP keying-material export are
//! openssl's. The active role keeps its last flight around for the ARQ
//! retransmit coroutine.

use log::debug;
use openssl::asn1::Asn1Time;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{
    HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslContextBuilder, SslMethod,
    SslStream, SslVerifyMode,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use shared::error::{Error, Result};
use srtp::ProtectionProfile;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

pub const SRTP_MASTER_KEY_LEN: usize = 16;
pub const SRTP_MASTER_SALT_LEN: usize = 14;
const KEYING_MATERIAL_LABEL: &str = "EXTRACTOR-dtls_srtp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    /// Client: sends ClientHello first, retransmits on silence.
    Active,
    /// Server: answers.
    Passive,
}

/// Self-signed certificate whose fingerprint goes into the SDP.
pub struct DtlsCert {
    pkey: PKey<Private>,
    cert: X509,
    fingerprint: String,
}

impl DtlsCert {
    pub fn generate() -> Result<Self> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).map_err(ssl_err)?;
        let ec = EcKey::generate(&group).map_err(ssl_err)?;
        let pkey = PKey::from_ec_key(ec).map_err(ssl_err)?;

        let mut name = X509NameBuilder::new().map_err(ssl_err)?;
        name.append_entry_by_text("CN", "rill").map_err(ssl_err)?;
        let name = name.build();

        let mut builder = X509Builder::new().map_err(ssl_err)?;
        builder.set_version(2).map_err(ssl_err)?;
        builder.set_subject_name(&name).map_err(ssl_err)?;
        builder.set_issuer_name(&name).map_err(ssl_err)?;
        builder.set_pubkey(&pkey).map_err(ssl_err)?;
        builder
            .set_not_before(Asn1Time::days_from_now(0).map_err(ssl_err)?.as_ref())
            .map_err(ssl_err)?;
        builder
            .set_not_after(Asn1Time::days_from_now(365).map_err(ssl_err)?.as_ref())
            .map_err(ssl_err)?;
        let mut serial = openssl::bn::BigNum::new().map_err(ssl_err)?;
        serial.rand(64, openssl::bn::MsbOption::MAYBE_ZERO, false).map_err(ssl_err)?;
        builder
            .set_serial_number(serial.to_asn1_integer().map_err(ssl_err)?.as_ref())
            .map_err(ssl_err)?;
        builder.sign(&pkey, MessageDigest::sha256()).map_err(ssl_err)?;
        let cert = builder.build();

        let digest = cert.digest(MessageDigest::sha256()).map_err(ssl_err)?;
        let fingerprint = digest
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");

        Ok(Self {
            pkey,
            cert,
            fingerprint,
        })
    }

    /// `AB:CD:...` form used in `a=fingerprint:sha-256`.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn context(&self) -> Result<SslContext> {
        let mut b: SslContextBuilder = SslContext::builder(SslMethod::dtls()).map_err(ssl_err)?;
        b.set_private_key(&self.pkey).map_err(ssl_err)?;
        b.set_certificate(&self.cert).map_err(ssl_err)?;
        b.set_tlsext_use_srtp(ProtectionProfile::default().openssl_name())
            .map_err(ssl_err)?;
        // the peer's certificate is checked against the SDP fingerprint,
        // not a CA chain
        b.set_verify(SslVerifyMode::NONE);
        Ok(b.build())
    }
}

fn ssl_err(e: openssl::error::ErrorStack) -> Error {
    Error::Dtls(e.to_string())
}

/// In-memory datagram pipe: one `Read`/`Write` end handed to openssl, the
/// queue handles kept by the transport.
#[derive(Clone, Default)]
pub struct DatagramChan {
    rx: Rc<RefCell<VecDeque<Vec<u8>>>>,
    tx: Rc<RefCell<VecDeque<Vec<u8>>>>,
}

impl Read for DatagramChan {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.borrow_mut().pop_front() {
            Some(dgram) => {
                let n = dgram.len().min(buf.len());
                buf[..n].copy_from_slice(&dgram[..n]);
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no datagram")),
        }
    }
}

impl Write for DatagramChan {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.borrow_mut().push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// SRTP master secrets for both directions, as exported by DTLS.
#[derive(Clone)]
pub struct SrtpKeys {
    pub client_key: Vec<u8>,
    pub server_key: Vec<u8>,
    pub client_salt: Vec<u8>,
    pub server_salt: Vec<u8>,
}

enum DtlsState {
    Idle,
    Handshaking(MidHandshakeSslStream<DatagramChan>),
    Established(SslStream<DatagramChan>),
    Failed,
}

pub struct DtlsTransport {
    role: DtlsRole,
    context: SslContext,
    chan: DatagramChan,
    state: DtlsState,
    /// Last outbound flight, replayed by the ARQ path.
    last_flight: Vec<Vec<u8>>,
    retransmits: u32,
}

/// Bounded ARQ: after this many replays the handshake fails.
pub const MAX_RETRANSMITS: u32 = 12;

impl DtlsTransport {
    pub fn new(cert: &DtlsCert, role: DtlsRole) -> Result<Self> {
        Ok(Self {
            role,
            context: cert.context()?,
            chan: DatagramChan::default(),
            state: DtlsState::Idle,
            last_flight: Vec::new(),
            retransmits: 0,
        })
    }

    pub fn role(&self) -> DtlsRole {
        self.role
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, DtlsState::Established(_))
    }

    /// For the active role: emits the ClientHello flight.
    pub fn start_handshake(&mut self) -> Result<()> {
        if !matches!(self.state, DtlsState::Idle) {
            return Ok(());
        }
        let ssl = Ssl::new(&self.context).map_err(ssl_err)?;
        let result = match self.role {
            DtlsRole::Active => ssl.connect(self.chan.clone()),
            DtlsRole::Passive => ssl.accept(self.chan.clone()),
        };
        self.state = Self::advance(result)?;
        self.capture_flight();
        Ok(())
    }

    /// Feeds one inbound DTLS datagram; returns the exported keys when this
    /// packet completed the handshake.
    pub fn on_packet(&mut self, data: &[u8]) -> Result<Option<SrtpKeys>> {
        self.chan.rx.borrow_mut().push_back(data.to_vec());

        let state = std::mem::replace(&mut self.state, DtlsState::Failed);
        let was_established = matches!(state, DtlsState::Established(_));
        self.state = match state {
            DtlsState::Idle => {
                let ssl = Ssl::new(&self.context).map_err(ssl_err)?;
                Self::advance(match self.role {
                    DtlsRole::Active => ssl.connect(self.chan.clone()),
                    DtlsRole::Passive => ssl.accept(self.chan.clone()),
                })?
            }
            DtlsState::Handshaking(mid) => Self::advance(mid.handshake())?,
            established => established,
        };
        self.capture_flight();

        if !was_established {
            if let DtlsState::Established(stream) = &self.state {
                debug!("dtls handshake complete ({:?})", self.role);
                return Ok(Some(Self::export_keys(stream)?));
            }
        }
        Ok(None)
    }

    fn advance(
        result: std::result::Result<SslStream<DatagramChan>, HandshakeError<DatagramChan>>,
    ) -> Result<DtlsState> {
        match result {
            Ok(stream) => Ok(DtlsState::Established(stream)),
            Err(HandshakeError::WouldBlock(mid)) => Ok(DtlsState::Handshaking(mid)),
            Err(HandshakeError::SetupFailure(e)) => Err(Error::Dtls(e.to_string())),
            Err(HandshakeError::Failure(mid)) => {
                Err(Error::Dtls(format!("handshake failure: {}", mid.error())))
            }
        }
    }

    fn export_keys(stream: &SslStream<DatagramChan>) -> Result<SrtpKeys> {
        let mut material = [0u8; 2 * (SRTP_MASTER_KEY_LEN + SRTP_MASTER_SALT_LEN)];
        stream
            .ssl()
            .export_keying_material(&mut material, KEYING_MATERIAL_LABEL, None)
            .map_err(ssl_err)?;
        let (keys, salts) = material.split_at(2 * SRTP_MASTER_KEY_LEN);
        Ok(SrtpKeys {
            client_key: keys[..SRTP_MASTER_KEY_LEN].to_vec(),
            server_key: keys[SRTP_MASTER_KEY_LEN..].to_vec(),
            client_salt: salts[..SRTP_MASTER_SALT_LEN].to_vec(),
            server_salt: salts[SRTP_MASTER_SALT_LEN..].to_vec(),
        })
    }

    /// Records the current outbound flight for ARQ replay.
    fn capture_flight(&mut self) {
        let pending: Vec<Vec<u8>> = self.chan.tx.borrow().iter().cloned().collect();
        if !pending.is_empty() {
            self.last_flight = pending;
            self.retransmits = 0;
        }
    }

    /// Next outbound datagram.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.chan.tx.borrow_mut().pop_front()
    }

    /// ARQ tick: re-queues the last flight while handshaking. Errors once
    /// the retry budget is exhausted.
    pub fn handle_retransmit(&mut self) -> Result<()> {
        if self.is_established() || self.last_flight.is_empty() {
            return Ok(());
        }
        self.retransmits += 1;
        if self.retransmits > MAX_RETRANSMITS {
            self.state = DtlsState::Failed;
            return Err(Error::DtlsTimeout);
        }
        debug!("dtls retransmit flight #{}", self.retransmits);
        let mut tx = self.chan.tx.borrow_mut();
        for dgram in &self.last_flight {
            tx.push_back(dgram.clone());
        }
        Ok(())
    }
}
