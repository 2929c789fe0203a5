//! One WebRTC session: ICE-lite answering, DTLS, SRTP and the RTP paths.

use crate::webrtc::dtls::{DtlsRole, DtlsTransport, SrtpKeys};
use crate::webrtc::sdp::SdpOffer;
use crate::webrtc::track::{PliThrottle, RecvTrack, SendTrack, TrackKind, TrackSet};
use bytes::BytesMut;
use hub::{Consumer, MediaPacket, PacketKind, Request, Source};
use log::{debug, info, warn};
use rtp::rtcp::{self, RtcpPacket};
use rtp::twcc::{self, FeedbackRecorder};
use runtime::pithy::PithyPrint;
use runtime::Resource;
use shared::error::Result;
use shared::time::{compact_ntp, SystemInstant};
use srtp::{ProtectionProfile, SrtpContext};
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    WaitingStun,
    Dtls,
    Established,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Publish,
    Play,
}

/// Where outbound datagrams go; the server injects the UDP socket, tests
/// inject a sink.
pub trait RtcSender {
    fn send(&self, data: &[u8], to: SocketAddr);
}

/// Server-side SSRCs for play sessions.
pub const LOCAL_AUDIO_SSRC: u32 = 0x0A0A_0001;
pub const LOCAL_VIDEO_SSRC: u32 = 0x0A0A_0002;

const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RtcSession {
    pub id: String,
    pub role: SessionRole,
    pub req: Request,
    state: Cell<SessionState>,
    pub local_ufrag: String,
    pub local_pwd: String,
    remote_ufrag: String,

    peer: Cell<Option<SocketAddr>>,
    peer_switch_log: PithyPrint,
    dtls: RefCell<DtlsTransport>,
    srtp_rx: RefCell<Option<SrtpContext>>,
    srtp_tx: RefCell<Option<SrtpContext>>,

    pub recv_tracks: TrackSet<RecvTrack>,
    pub send_tracks: TrackSet<SendTrack>,
    remote_audio_ssrc: Option<u32>,
    remote_video_ssrc: Option<u32>,
    twcc_ext_id: Option<u8>,
    twcc: RefCell<Option<FeedbackRecorder>>,
    pli: PliThrottle,

    /// RTP-representation source: publish pushes into it, play consumes.
    rtc_source: Rc<Source>,
    /// Publish only: adapter producing FLV into the media source.
    bridge: RefCell<Option<Rc<crate::bridge::rtc2rtmp::RtcToRtmpBridge>>>,
    consumer: RefCell<Option<Rc<Consumer>>>,

    sender: Rc<dyn RtcSender>,
    epoch: SystemInstant,
    created_at: Instant,
    last_packet_at: Cell<Instant>,
    srtp_errors: Cell<u64>,
}

impl Resource for RtcSession {
    fn resource_id(&self) -> String {
        self.id.clone()
    }

    fn desc(&self) -> String {
        format!("rtc-{:?}-{}", self.role, self.req.stream_url())
    }
}

impl RtcSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: SessionRole,
        req: Request,
        offer: &SdpOffer,
        dtls: DtlsTransport,
        rtc_source: Rc<Source>,
        bridge: Option<Rc<crate::bridge::rtc2rtmp::RtcToRtmpBridge>>,
        sender: Rc<dyn RtcSender>,
    ) -> Rc<Self> {
        let id = format!("{:016x}", rand::random::<u64>());
        let local_ufrag = format!("{:08x}", rand::random::<u32>());
        let local_pwd = format!("{:032x}", rand::random::<u128>());

        let session = Rc::new(Self {
            id,
            role,
            req,
            state: Cell::new(SessionState::WaitingStun),
            local_ufrag,
            local_pwd,
            remote_ufrag: offer.ice_ufrag.clone(),
            peer: Cell::new(None),
            peer_switch_log: PithyPrint::new(Duration::from_secs(3)),
            dtls: RefCell::new(dtls),
            srtp_rx: RefCell::new(None),
            srtp_tx: RefCell::new(None),
            recv_tracks: TrackSet::new(),
            send_tracks: TrackSet::new(),
            remote_audio_ssrc: offer.audio_ssrc,
            remote_video_ssrc: offer.video_ssrc,
            twcc_ext_id: offer.twcc_ext_id,
            twcc: RefCell::new(None),
            pli: PliThrottle::new(Duration::from_millis(500)),
            rtc_source,
            bridge: RefCell::new(bridge),
            consumer: RefCell::new(None),
            sender,
            epoch: SystemInstant::now(),
            created_at: Instant::now(),
            last_packet_at: Cell::new(Instant::now()),
            srtp_errors: Cell::new(0),
        });

        if role == SessionRole::Play {
            let audio_pt = offer.audio_payload_type.unwrap_or(111);
            let video_pt = offer.video_payload_type.unwrap_or(102);
            session.send_tracks.insert(
                LOCAL_AUDIO_SSRC,
                SendTrack::new(LOCAL_AUDIO_SSRC, TrackKind::Audio, audio_pt),
            );
            session.send_tracks.insert(
                LOCAL_VIDEO_SSRC,
                SendTrack::new(LOCAL_VIDEO_SSRC, TrackKind::Video, video_pt),
            );
        }
        if let Some(ssrc) = offer.video_ssrc {
            if role == SessionRole::Publish {
                session.twcc.borrow_mut().replace(FeedbackRecorder::new(1, ssrc));
            }
        }
        session
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer.get()
    }

    pub fn remote_ufrag(&self) -> &str {
        &self.remote_ufrag
    }

    pub fn is_closed(&self) -> bool {
        self.state.get() == SessionState::Closed
    }

    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.state.set(SessionState::Closed);
        if let Some(c) = self.consumer.borrow_mut().take() {
            self.rtc_source.on_consumer_destroy(&c);
            c.wakeup();
        }
        info!("rtc session {} closed", self.id);
    }

    fn touch(&self) {
        self.last_packet_at.set(Instant::now());
    }

    fn send_to_peer(&self, data: &[u8]) {
        if let Some(peer) = self.peer.get() {
            self.sender.send(data, peer);
        }
    }

    /// STUN binding request: verify, answer, learn (or switch) the peer
    /// address, then kick DTLS for the active role.
    pub fn on_stun(&self, raw: &[u8], peer: SocketAddr) -> Result<()> {
        stun::Message::check_integrity(raw, &self.local_pwd)?;
        let msg = stun::Message::unmarshal(raw)?;
        if msg.message_type != stun::MessageType::BindingRequest {
            return Ok(());
        }
        self.touch();

        let previous = self.peer.get();
        if previous != Some(peer) {
            if previous.is_some() && self.peer_switch_log.can_print() {
                info!(
                    "rtc session {} peer switch {:?} -> {peer}",
                    self.id, previous
                );
            }
            self.peer.set(Some(peer));
        }

        let response = stun::Message::binding_response(
            &msg.transaction_id,
            peer,
            &self.local_pwd,
        )?;
        self.sender.send(&response, peer);

        if self.state.get() == SessionState::WaitingStun {
            self.state.set(SessionState::Dtls);
            let mut dtls = self.dtls.borrow_mut();
            if dtls.role() == DtlsRole::Active {
                dtls.start_handshake()?;
            }
            drop(dtls);
            self.flush_dtls();
        }
        Ok(())
    }

    pub fn on_dtls(&self, data: &[u8]) -> Result<()> {
        self.touch();
        let completed = self.dtls.borrow_mut().on_packet(data)?;
        self.flush_dtls();
        if let Some(keys) = completed {
            self.install_srtp(&keys)?;
            self.state.set(SessionState::Established);
            info!("rtc session {} established", self.id);
        }
        Ok(())
    }

    fn flush_dtls(&self) {
        loop {
            let next = self.dtls.borrow_mut().poll_transmit();
            match next {
                Some(d) => self.send_to_peer(&d),
                None => break,
            }
        }
    }

    fn install_srtp(&self, keys: &SrtpKeys) -> Result<()> {
        let profile = ProtectionProfile::default();
        // the DTLS server protects with the server write key and
        // unprotects with the client's
        let (tx_key, tx_salt, rx_key, rx_salt) =
            if self.dtls.borrow().role() == DtlsRole::Passive {
                (
                    &keys.server_key,
                    &keys.server_salt,
                    &keys.client_key,
                    &keys.client_salt,
                )
            } else {
                (
                    &keys.client_key,
                    &keys.client_salt,
                    &keys.server_key,
                    &keys.server_salt,
                )
            };
        *self.srtp_tx.borrow_mut() = Some(SrtpContext::new(profile, tx_key, tx_salt)?);
        *self.srtp_rx.borrow_mut() = Some(SrtpContext::new(profile, rx_key, rx_salt)?);
        Ok(())
    }

    /// Inbound RTP (publish side): unprotect, track, NACK bookkeeping,
    /// then fan out to the RTC source and the RTMP bridge.
    pub fn on_rtp(&self, mut data: BytesMut) -> Result<()> {
        self.touch();
        {
            let mut srtp = self.srtp_rx.borrow_mut();
            let Some(srtp) = srtp.as_mut() else {
                return Ok(()); // not established yet
            };
            if let Err(e) = srtp.unprotect_rtp(&mut data) {
                self.srtp_errors.set(self.srtp_errors.get() + 1);
                debug!("rtc session {} srtp rtp drop: {e}", self.id);
                return Ok(());
            }
        }

        let raw = data.freeze();
        let packet = rtp::Packet::unmarshal(&raw)?;
        let ssrc = packet.header.ssrc;
        let now = Instant::now();

        if let (Some(ext_id), Some(recorder)) =
            (self.twcc_ext_id, self.twcc.borrow_mut().as_mut())
        {
            if let Some(ext) = packet.header.extension(ext_id) {
                if let Some(seq) = twcc::transport_sequence(ext) {
                    recorder.record(seq, now);
                }
            }
        }

        let track = match self.recv_tracks.find(ssrc) {
            Some(t) => t,
            None => {
                let (kind, clock) = if Some(ssrc) == self.remote_audio_ssrc {
                    (TrackKind::Audio, 48_000)
                } else {
                    (TrackKind::Video, 90_000)
                };
                let t = RecvTrack::new(ssrc, kind, clock);
                self.recv_tracks.insert(ssrc, t.clone());
                t
            }
        };
        let outcome = track.on_rtp(&packet, now);
        if outcome == rtp::nack::ReceiveOutcome::Stale {
            return Ok(());
        }

        // request retransmits for fresh gaps right away
        let missing = track.poll_nacks(now);
        if !missing.is_empty() {
            self.send_rtcp(&[RtcpPacket::Nack {
                sender_ssrc: 1,
                media_ssrc: ssrc,
                pairs: rtp::nack::pack_nack_pairs(&missing),
            }]);
        }

        // fan out: RTC subscribers get the raw packet, the bridge turns it
        // into FLV for everything else
        let kind = match track.kind {
            TrackKind::Audio => PacketKind::Audio,
            TrackKind::Video => PacketKind::Video,
        };
        let media = MediaPacket {
            kind,
            timestamp: packet.header.timestamp as i64,
            stream_id: 0,
            payload: raw.clone(),
        };
        match kind {
            PacketKind::Audio => self.rtc_source.on_audio(media)?,
            _ => self.rtc_source.on_video(media)?,
        }
        if let Some(bridge) = self.bridge.borrow().as_ref() {
            // unexpected NALUs cost one packet, not the session
            if let Err(e) = bridge.on_rtp(&packet, track.kind) {
                debug!("rtc session {} bridge dropped a packet: {e}", self.id);
            }
        }
        Ok(())
    }

    /// Inbound RTCP compound.
    pub fn on_rtcp(&self, mut data: BytesMut) -> Result<()> {
        self.touch();
        {
            let mut srtp = self.srtp_rx.borrow_mut();
            let Some(srtp) = srtp.as_mut() else {
                return Ok(());
            };
            if let Err(e) = srtp.unprotect_rtcp(&mut data) {
                self.srtp_errors.set(self.srtp_errors.get() + 1);
                debug!("rtc session {} srtp rtcp drop: {e}", self.id);
                return Ok(());
            }
        }
        let now = Instant::now();
        for packet in rtcp::unmarshal_compound(&data)? {
            match packet {
                RtcpPacket::SenderReport { ssrc, ntp, .. } => {
                    if let Some(t) = self.recv_tracks.find(ssrc) {
                        t.on_sender_report(compact_ntp(ntp), now);
                    }
                }
                RtcpPacket::Nack {
                    media_ssrc, pairs, ..
                } => {
                    if let Some(track) = self.send_tracks.find(media_ssrc) {
                        let seqs = rtp::nack::unpack_nack_pairs(&pairs);
                        for pkt in track.retransmit(&seqs) {
                            self.protect_and_send_rtp(&pkt);
                        }
                    }
                }
                RtcpPacket::Pli { media_ssrc, .. } | RtcpPacket::Fir { media_ssrc, .. } => {
                    // cross-session: a player wants a keyframe from our
                    // publisher; surface it on the rtc source so the
                    // server can route it
                    debug!(
                        "rtc session {} got keyframe request for {media_ssrc:#x}",
                        self.id
                    );
                    self.rtc_source.request_keyframe();
                }
                RtcpPacket::XrRrtr { ssrc, ntp } => {
                    // answer with DLRR so the peer can measure RTT
                    let dlrr = RtcpPacket::XrDlrr {
                        ssrc: 1,
                        blocks: vec![(ssrc, compact_ntp(ntp), 0)],
                    };
                    self.send_rtcp(&[dlrr]);
                }
                RtcpPacket::XrDlrr { blocks, .. } => {
                    // lrr/dlrr from the peer: derive RTT for the nack pacing
                    let now_ntp = compact_ntp(self.epoch.ntp(now));
                    for (_ssrc, lrr, dlrr) in blocks {
                        let rtt_units =
                            now_ntp.wrapping_sub(lrr).wrapping_sub(dlrr) as u64;
                        let rtt = Duration::from_micros(rtt_units * 1_000_000 / 65_536);
                        for t in self.recv_tracks.values() {
                            t.update_rtt(rtt.min(Duration::from_secs(2)));
                        }
                    }
                }
                RtcpPacket::ReceiverReport { .. }
                | RtcpPacket::SourceDescription { .. }
                | RtcpPacket::Bye { .. }
                | RtcpPacket::Other { .. } => {}
            }
        }
        Ok(())
    }

    /// Sends a PLI for every subscribed video track (publish sessions).
    pub fn request_keyframe_from_peer(&self) {
        let now = Instant::now();
        let mut requests = Vec::new();
        for t in self.recv_tracks.values() {
            if t.kind == TrackKind::Video && self.pli.allow(t.ssrc, now) {
                requests.push(RtcpPacket::Pli {
                    sender_ssrc: 1,
                    media_ssrc: t.ssrc,
                });
            }
        }
        if !requests.is_empty() {
            self.send_rtcp(&requests);
        }
    }

    /// Outbound media for play sessions: rewrite onto the local track,
    /// protect, send.
    pub fn send_media(&self, pkt: &MediaPacket) -> Result<()> {
        let parsed = rtp::Packet::unmarshal(&pkt.payload)?;
        let ssrc = match pkt.kind {
            PacketKind::Audio => LOCAL_AUDIO_SSRC,
            _ => LOCAL_VIDEO_SSRC,
        };
        let Some(track) = self.send_tracks.find(ssrc) else {
            return Ok(());
        };
        let rewritten = track.on_send(parsed);
        self.protect_and_send_rtp(&rewritten);
        Ok(())
    }

    fn protect_and_send_rtp(&self, pkt: &rtp::Packet) {
        let mut srtp = self.srtp_tx.borrow_mut();
        let Some(srtp) = srtp.as_mut() else { return };
        let mut wire = BytesMut::from(&pkt.marshal()[..]);
        if srtp.protect_rtp(&mut wire).is_ok() {
            drop(srtp);
            self.send_to_peer(&wire);
        }
    }

    fn send_rtcp(&self, packets: &[RtcpPacket]) {
        let mut srtp = self.srtp_tx.borrow_mut();
        let Some(srtp) = srtp.as_mut() else { return };
        let mut wire = BytesMut::from(&rtcp::marshal_compound(packets)[..]);
        if srtp.protect_rtcp(&mut wire).is_ok() {
            drop(srtp);
            self.send_to_peer(&wire);
        }
    }

    /// Attaches the play consumer once established; returns it for the
    /// play coroutine to drive.
    pub fn attach_consumer(&self) -> Rc<Consumer> {
        let c = self.rtc_source.create_consumer(5_000);
        *self.consumer.borrow_mut() = Some(c.clone());
        c
    }

    pub fn rtc_source(&self) -> &Rc<Source> {
        &self.rtc_source
    }

    /// Periodic work: DTLS ARQ, NACK retries, reports, timeouts.
    pub fn tick(&self, now: Instant) -> Result<()> {
        match self.state.get() {
            SessionState::Closed => return Ok(()),
            SessionState::Established => {}
            _ => {
                if now.duration_since(self.created_at) > ESTABLISH_TIMEOUT {
                    warn!("rtc session {} establish timeout", self.id);
                    self.close();
                    return Ok(());
                }
                let mut dtls = self.dtls.borrow_mut();
                if !dtls.is_established() {
                    if let Err(e) = dtls.handle_retransmit() {
                        drop(dtls);
                        warn!("rtc session {} dtls: {e}", self.id);
                        self.close();
                        return Err(e);
                    }
                }
                drop(dtls);
                self.flush_dtls();
                return Ok(());
            }
        }

        if now.duration_since(self.last_packet_at.get()) > IDLE_TIMEOUT {
            info!("rtc session {} idle timeout", self.id);
            self.close();
            return Ok(());
        }

        // NACK retries that fell due between packets
        for t in self.recv_tracks.values() {
            let missing = t.poll_nacks(now);
            if !missing.is_empty() {
                self.send_rtcp(&[RtcpPacket::Nack {
                    sender_ssrc: 1,
                    media_ssrc: t.ssrc,
                    pairs: rtp::nack::pack_nack_pairs(&missing),
                }]);
            }
        }

        if self.role == SessionRole::Publish {
            // receiver reports + reference time + congestion feedback
            let reports: Vec<_> = self
                .recv_tracks
                .values()
                .iter()
                .map(|t| t.report_block(now))
                .collect();
            let mut out = vec![
                RtcpPacket::ReceiverReport { ssrc: 1, reports },
                RtcpPacket::XrRrtr {
                    ssrc: 1,
                    ntp: self.epoch.ntp(now),
                },
            ];
            if let Some(fb) = self.twcc.borrow_mut().as_mut().and_then(|r| r.build()) {
                out.push(fb);
            }
            self.send_rtcp(&out);
        } else {
            // sender report per active track
            for t in self.send_tracks.values() {
                if t.sent_packets() == 0 {
                    continue;
                }
                self.send_rtcp(&[RtcpPacket::SenderReport {
                    ssrc: t.ssrc,
                    ntp: self.epoch.ntp(now),
                    rtp_time: 0,
                    packet_count: t.sent_packets() as u32,
                    octet_count: t.sent_bytes() as u32,
                    reports: vec![],
                }]);
            }
        }
        Ok(())
    }
}
