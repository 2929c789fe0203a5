//! The WebRTC server: one UDP socket multiplexing every session.
//!
//! Each datagram is classified in constant time by its first byte: STUN
//! routes by the username's local ufrag, DTLS and RTP/RTCP by the 64-bit
//! fast id of the peer address.

use crate::bridge::rtc2rtmp::RtcToRtmpBridge;
use crate::bridge::rtmp2rtc::RtmpToRtcBridge;
use crate::bridge::transcode::PassthroughTranscoder;
use crate::server::ServerContext;
use crate::webrtc::dtls::{DtlsCert, DtlsRole, DtlsTransport};
use crate::webrtc::sdp::{build_answer, AnswerParams, SdpOffer};
use crate::webrtc::session::{
    RtcSender, RtcSession, SessionRole, SessionState, LOCAL_AUDIO_SSRC, LOCAL_VIDEO_SSRC,
};
use bytes::BytesMut;
use hub::token::PublishToken;
use hub::{JitterAlgorithm, Request, SourceManager};
use log::{debug, info, warn};
use runtime::{Coroutine, ResourceManager};
use shared::error::{Error, Result};
use shared::fast_id_of;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

/// First-byte classification of a mux'd datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Stun,
    Dtls,
    RtpOrRtcp,
    Unknown,
}

pub fn classify(data: &[u8]) -> PacketKind {
    match data.first() {
        Some(0..=1) => PacketKind::Stun,
        Some(20..=63) => PacketKind::Dtls,
        Some(128..=191) => PacketKind::RtpOrRtcp,
        _ => PacketKind::Unknown,
    }
}

struct UdpSender {
    socket: Rc<UdpSocket>,
}

impl RtcSender for UdpSender {
    fn send(&self, data: &[u8], to: SocketAddr) {
        // UDP is effectively always writable; a full socket buffer means
        // the packet is droppable anyway
        let _ = self.socket.try_send_to(data, to);
    }
}

pub struct RtcServer {
    sc: Rc<ServerContext>,
    cert: DtlsCert,
    sender: RefCell<Rc<dyn RtcSender>>,
    sessions: Rc<ResourceManager<RtcSession>>,
    /// Publish session per stream URL, for cross-session PLI routing.
    publishers: RefCell<HashMap<String, Weak<RtcSession>>>,
    /// Publish tokens held for the session's lifetime.
    tokens: RefCell<HashMap<String, PublishToken>>,
    /// RTP-representation sources, parallel to the media source pool.
    rtc_sources: SourceManager,
    candidate_port: u16,
    recv_co: RefCell<Option<Rc<Coroutine>>>,
    sweep_co: RefCell<Option<Rc<Coroutine>>>,
    play_cos: RefCell<HashMap<String, Rc<Coroutine>>>,
}

/// Sink sender used until the socket is bound (and by tests).
struct NullSender;

impl RtcSender for NullSender {
    fn send(&self, _data: &[u8], _to: SocketAddr) {}
}

impl RtcServer {
    pub fn new(sc: Rc<ServerContext>) -> Result<Rc<Self>> {
        let listen: SocketAddr = sc
            .config
            .borrow()
            .rtc
            .listen
            .parse()
            .map_err(|_| Error::ConfigInvalid("rtc.listen".into()))?;
        Ok(Rc::new(Self {
            sc,
            cert: DtlsCert::generate()?,
            sender: RefCell::new(Rc::new(NullSender)),
            sessions: ResourceManager::new("rtc"),
            publishers: RefCell::new(HashMap::new()),
            tokens: RefCell::new(HashMap::new()),
            rtc_sources: SourceManager::new(false),
            candidate_port: listen.port(),
            recv_co: RefCell::new(None),
            sweep_co: RefCell::new(None),
            play_cos: RefCell::new(HashMap::new()),
        }))
    }

    /// Replaces the outbound path; tests install a capturing sink.
    pub fn set_sender(&self, sender: Rc<dyn RtcSender>) {
        *self.sender.borrow_mut() = sender;
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Binds the UDP socket and launches the receive and sweep coroutines.
    pub async fn start(self: &Rc<Self>) -> Result<()> {
        let listen = self.sc.config.borrow().rtc.listen.clone();
        let socket = Rc::new(UdpSocket::bind(&listen).await?);
        info!("rtc server listening on {listen}");
        self.set_sender(Rc::new(UdpSender {
            socket: socket.clone(),
        }));
        self.sessions.start();

        let recv_co = Rc::new(Coroutine::new("rtc-recv"));
        {
            let this = Rc::clone(self);
            let socket = socket.clone();
            recv_co.start(move |ctx| async move {
                let mut buf = vec![0u8; 2048];
                loop {
                    ctx.pull()?;
                    let (n, peer) = ctx
                        .timeout(Duration::from_secs(3600), socket.recv_from(&mut buf))
                        .await
                        .or_else(|e| {
                            if e.is_timeout() {
                                Ok((0, "0.0.0.0:0".parse().unwrap()))
                            } else {
                                Err(e)
                            }
                        })?;
                    if n == 0 {
                        continue;
                    }
                    let data = BytesMut::from(&buf[..n]);
                    if let Err(e) = this.dispatch(data, peer) {
                        debug!("rtc dispatch from {peer}: {e}");
                    }
                }
            });
        }
        *self.recv_co.borrow_mut() = Some(recv_co);

        let sweep_co = Rc::new(Coroutine::new("rtc-sweep"));
        {
            let this = Rc::clone(self);
            sweep_co.start(move |ctx| async move {
                loop {
                    ctx.sleep(Duration::from_millis(200)).await?;
                    this.sweep().await;
                }
            });
        }
        *self.sweep_co.borrow_mut() = Some(sweep_co);
        Ok(())
    }

    pub async fn stop(&self) {
        for co in [
            self.recv_co.borrow_mut().take(),
            self.sweep_co.borrow_mut().take(),
        ]
        .into_iter()
        .flatten()
        {
            co.stop().await;
        }
        let play_cos: Vec<_> = self.play_cos.borrow_mut().drain().collect();
        for (_, co) in play_cos {
            co.stop().await;
        }
        for s in self.sessions.all() {
            s.close();
        }
        self.sessions.stop().await;
    }

    /// Routes one datagram. Exposed for tests, which drive the server
    /// without a bound socket.
    pub fn dispatch(&self, data: BytesMut, peer: SocketAddr) -> Result<()> {
        match classify(&data) {
            PacketKind::Stun => {
                let msg = stun::Message::unmarshal(&data)?;
                let ufrag = msg
                    .local_ufrag()
                    .ok_or_else(|| Error::StunDecode("binding without username".into()))?;
                let session = self
                    .sessions
                    .find_by_name(ufrag)
                    .ok_or_else(|| Error::StunDecode(format!("no session for {ufrag}")))?;
                let known_peer = session.peer();
                session.on_stun(&data, peer)?;
                // first (or switched) peer address enters the fast path
                if known_peer != Some(peer) {
                    if let Some(fast_id) = fast_id_of(&peer) {
                        self.sessions.add_with_fast_id(fast_id, session);
                    }
                }
                Ok(())
            }
            PacketKind::Dtls => {
                let session = self.session_by_peer(&peer)?;
                session.on_dtls(&data)
            }
            PacketKind::RtpOrRtcp => {
                let session = self.session_by_peer(&peer)?;
                if rtp::rtcp::is_rtcp(&data) {
                    session.on_rtcp(data)
                } else {
                    session.on_rtp(data)
                }
            }
            PacketKind::Unknown => Ok(()),
        }
    }

    fn session_by_peer(&self, peer: &SocketAddr) -> Result<Rc<RtcSession>> {
        fast_id_of(peer)
            .and_then(|id| self.sessions.find_by_fast_id(id))
            .ok_or_else(|| Error::Internal(format!("no rtc session for peer {peer}")))
    }

    fn dtls_role(&self) -> DtlsRole {
        if self.sc.config.borrow().rtc.dtls_role == "active" {
            DtlsRole::Active
        } else {
            DtlsRole::Passive
        }
    }

    fn answer_for(&self, session: &RtcSession, offer: &SdpOffer, sending: bool) -> String {
        let setup = match self.dtls_role() {
            DtlsRole::Active => "active",
            DtlsRole::Passive => "passive",
        };
        let candidate = self.sc.config.borrow().rtc.candidate.clone();
        build_answer(&AnswerParams {
            ice_ufrag: &session.local_ufrag,
            ice_pwd: &session.local_pwd,
            fingerprint: self.cert.fingerprint(),
            dtls_setup: setup,
            candidate_ip: &candidate,
            candidate_port: self.candidate_port,
            sending,
            audio_payload_type: offer.audio_payload_type.unwrap_or(111),
            video_payload_type: offer.video_payload_type.unwrap_or(102),
            audio_ssrc: LOCAL_AUDIO_SSRC,
            video_ssrc: LOCAL_VIDEO_SSRC,
        })
    }

    fn rtc_source_for(&self, req: &Request) -> Rc<hub::Source> {
        let source = self.rtc_sources.fetch_or_create(req);
        source.set_jitter_algorithm(JitterAlgorithm::Off);
        source.set_gop_cache(false);
        source
    }

    /// `POST /rtc/v1/publish`: parses the offer, builds the session and
    /// wires the RTC-to-RTMP bridge.
    pub async fn handle_publish(
        &self,
        stream_url: &str,
        offer_sdp: &str,
        client_ip: &str,
    ) -> Result<(String, String)> {
        let offer = SdpOffer::parse(offer_sdp)?;
        let mut req = parse_stream_url(stream_url)?;
        req.ip = client_ip.to_string();
        req.protocol = "webrtc".into();

        self.sc.hooks.on_publish(0, &req).await?;
        let token = self.sc.sources.acquire_publish(&req.stream_url())?;

        let media_source = self.sc.sources.fetch_or_create(&req);
        media_source.on_publish();
        let rtc_source = self.rtc_source_for(&req);
        rtc_source.on_publish();

        let bridge = RtcToRtmpBridge::new(media_source, PassthroughTranscoder::new(None));
        let dtls = DtlsTransport::new(&self.cert, self.dtls_role())?;
        let session = RtcSession::new(
            SessionRole::Publish,
            req.clone(),
            &offer,
            dtls,
            rtc_source,
            Some(bridge),
            self.sender.borrow().clone(),
        );
        let answer = self.answer_for(&session, &offer, false);

        self.sessions
            .add_with_name(&session.local_ufrag.clone(), session.clone());
        self.sessions.add_with_id(&session.id.clone(), session.clone());
        self.publishers
            .borrow_mut()
            .insert(req.stream_url(), Rc::downgrade(&session));
        self.tokens.borrow_mut().insert(session.id.clone(), token);
        info!("rtc publish session {} for {}", session.id, req.stream_url());
        Ok((answer, session.id.clone()))
    }

    /// `POST /rtc/v1/play`: builds the play session and, when the stream
    /// is an RTMP publish, attaches the RTMP-to-RTC bridge.
    pub async fn handle_play(
        self: &Rc<Self>,
        stream_url: &str,
        offer_sdp: &str,
        client_ip: &str,
    ) -> Result<(String, String)> {
        let offer = SdpOffer::parse(offer_sdp)?;
        let mut req = parse_stream_url(stream_url)?;
        req.ip = client_ip.to_string();
        req.protocol = "webrtc".into();

        self.sc.hooks.on_play(0, &req).await?;

        let rtc_source = self.rtc_source_for(&req);
        if !rtc_source.is_publishing() {
            // not an RTC publisher: bridge from the RTMP representation
            let media_source = self
                .sc
                .sources
                .fetch(&req.stream_url())
                .filter(|s| s.is_publishing())
                .ok_or_else(|| Error::HttpStatus(404))?;
            let bridge =
                RtmpToRtcBridge::new(rtc_source.clone(), PassthroughTranscoder::new(None));
            media_source.attach_bridge(bridge);
            rtc_source.on_publish();
        }

        let dtls = DtlsTransport::new(&self.cert, self.dtls_role())?;
        let session = RtcSession::new(
            SessionRole::Play,
            req.clone(),
            &offer,
            dtls,
            rtc_source,
            None,
            self.sender.borrow().clone(),
        );
        let answer = self.answer_for(&session, &offer, true);

        self.sessions
            .add_with_name(&session.local_ufrag.clone(), session.clone());
        self.sessions.add_with_id(&session.id.clone(), session.clone());
        self.spawn_play_loop(&session);
        info!("rtc play session {} for {}", session.id, req.stream_url());
        Ok((answer, session.id.clone()))
    }

    /// Play pump: waits for establishment, then drains the consumer into
    /// protected RTP, asking for keyframes on publisher change.
    fn spawn_play_loop(self: &Rc<Self>, session: &Rc<RtcSession>) {
        let co = Rc::new(Coroutine::new(&format!("rtc-play-{}", session.id)));
        let this = Rc::clone(self);
        let session = session.clone();
        let session_id = session.id.clone();
        co.start(move |ctx| async move {
            loop {
                ctx.pull()?;
                if session.is_closed() {
                    return Ok(());
                }
                if session.state() == SessionState::Established {
                    break;
                }
                ctx.sleep(Duration::from_millis(50)).await?;
            }

            let consumer = session.attach_consumer();
            // a fresh subscriber needs a decodable frame to start from
            this.request_keyframe(&session.req.stream_url());
            loop {
                ctx.pull()?;
                if session.is_closed() {
                    return Ok(());
                }
                if consumer.take_source_changed() {
                    this.request_keyframe(&session.req.stream_url());
                }
                consumer.wait(Duration::from_millis(100)).await;
                for pkt in consumer.dump_packets(64) {
                    session.send_media(&pkt)?;
                }
            }
        });
        self.play_cos.borrow_mut().insert(session_id, co);
    }

    /// Routes a keyframe request to the stream's RTC publisher, if any.
    pub fn request_keyframe(&self, stream_url: &str) {
        let publisher = self
            .publishers
            .borrow()
            .get(stream_url)
            .and_then(|w| w.upgrade());
        if let Some(p) = publisher {
            p.request_keyframe_from_peer();
        }
    }

    /// Periodic sweep: session timers, PLI routing, zombie removal.
    async fn sweep(&self) {
        let now = Instant::now();
        for session in self.sessions.all() {
            if session.role == SessionRole::Publish
                && session.rtc_source().take_keyframe_request()
            {
                session.request_keyframe_from_peer();
            }
            if let Err(e) = session.tick(now) {
                debug!("rtc session {} tick: {e}", session.id);
            }
            if session.is_closed() {
                self.teardown(&session).await;
            }
        }
    }

    async fn teardown(&self, session: &Rc<RtcSession>) {
        if session.role == SessionRole::Publish {
            warn!("rtc publisher {} leaving {}", session.id, session.req.stream_url());
            if let Some(media) = self.sc.sources.fetch(&session.req.stream_url()) {
                media.on_unpublish();
            }
            session.rtc_source().on_unpublish();
            self.publishers
                .borrow_mut()
                .remove(&session.req.stream_url());
            self.tokens.borrow_mut().remove(&session.id);
        } else {
            let co = self.play_cos.borrow_mut().remove(&session.id);
            if let Some(co) = co {
                co.stop().await;
            }
        }
        self.sessions.remove(session);
    }
}

/// Parses `webrtc://host/app/stream` or `/app/stream` into a request.
pub fn parse_stream_url(stream_url: &str) -> Result<Request> {
    let rest = stream_url
        .split_once("://")
        .map(|(_, r)| r)
        .unwrap_or(stream_url);
    let rest = rest.trim_start_matches('/');
    let mut parts = rest.splitn(3, '/');
    let (a, b, c) = (parts.next(), parts.next(), parts.next());
    let (host, app, stream) = match (a, b, c) {
        (Some(h), Some(app), Some(s)) => (h, app, s),
        (Some(app), Some(s), None) => ("__defaultVhost__", app, s),
        _ => {
            return Err(Error::HttpParse(format!(
                "stream url must be host/app/stream: {stream_url}"
            )))
        }
    };
    let (stream, param) = match stream.split_once('?') {
        Some((s, p)) => (s, p),
        None => (stream, ""),
    };
    let mut req = Request::default();
    req.vhost = host.to_string();
    req.host = host.to_string();
    req.app = app.to_string();
    req.stream = stream.to_string();
    req.param = param.to_string();
    req.schema = "webrtc".into();
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::session::SessionState;
    use srtp::{ProtectionProfile, SrtpContext};
    use tokio::task::LocalSet;

    #[test]
    fn test_classify_first_byte() {
        assert_eq!(classify(&[0x00]), PacketKind::Stun);
        assert_eq!(classify(&[0x01]), PacketKind::Stun);
        assert_eq!(classify(&[22]), PacketKind::Dtls);
        assert_eq!(classify(&[63]), PacketKind::Dtls);
        assert_eq!(classify(&[0x80]), PacketKind::RtpOrRtcp);
        assert_eq!(classify(&[0xBF]), PacketKind::RtpOrRtcp);
        assert_eq!(classify(&[0x42]), PacketKind::Unknown);
        assert_eq!(classify(&[]), PacketKind::Unknown);
    }

    #[test]
    fn test_parse_stream_url() {
        let r = parse_stream_url("webrtc://h.example/live/cam?k=1").unwrap();
        assert_eq!(r.vhost, "h.example");
        assert_eq!(r.app, "live");
        assert_eq!(r.stream, "cam");
        assert_eq!(r.param, "k=1");

        let r = parse_stream_url("/live/cam").unwrap();
        assert_eq!(r.app, "live");
        assert_eq!(r.stream, "cam");

        assert!(parse_stream_url("cam").is_err());
    }

    /// Captures everything the server sends, keyed by destination.
    struct SinkSender {
        sent: RefCell<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl RtcSender for SinkSender {
        fn send(&self, data: &[u8], to: SocketAddr) {
            self.sent.borrow_mut().push((data.to_vec(), to));
        }
    }

    const CLIENT_OFFER: &str = "v=0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=ice-ufrag:cliufrag\r\n\
        a=ice-pwd:clipassword0123456789012345\r\n\
        a=fingerprint:sha-256 AA:BB\r\n\
        a=setup:active\r\n\
        a=sendonly\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=ssrc:3001 cname:c\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
        a=rtpmap:102 H264/90000\r\n\
        a=ssrc:3002 cname:c\r\n";

    /// Drives a full publish session: signaling, STUN, DTLS, then one
    /// SRTP-protected RTP packet landing on the RTC source.
    #[tokio::test]
    async fn test_publish_session_end_to_end() {
        LocalSet::new()
            .run_until(async {
                let sc = ServerContext::for_tests();
                let server = RtcServer::new(sc.clone()).unwrap();
                let sink = Rc::new(SinkSender {
                    sent: RefCell::new(Vec::new()),
                });
                server.set_sender(sink.clone());

                let (answer, session_id) = server
                    .handle_publish("webrtc://test.host/live/cam", CLIENT_OFFER, "10.0.0.9")
                    .await
                    .unwrap();
                assert!(answer.contains("a=ice-lite"));
                assert!(answer.contains("a=recvonly"));

                let session = server.sessions.find_by_id(&session_id).unwrap();
                let peer: SocketAddr = "10.0.0.9:40000".parse().unwrap();

                // ICE: binding request signed with the server's password
                let username = format!("{}:cliufrag", session.local_ufrag);
                let (request, _tid) =
                    stun::Message::binding_request(&username, &session.local_pwd).unwrap();
                server
                    .dispatch(BytesMut::from(&request[..]), peer)
                    .unwrap();
                assert_eq!(session.state(), SessionState::Dtls);
                // the binding response went back to the peer
                assert!(sink
                    .sent
                    .borrow()
                    .iter()
                    .any(|(d, to)| *to == peer && stun::message::is_stun(d)));

                // DTLS: client side handshakes against the session
                let client_cert = DtlsCert::generate().unwrap();
                let mut client =
                    DtlsTransport::new(&client_cert, DtlsRole::Active).unwrap();
                client.start_handshake().unwrap();
                let mut client_keys = None;
                for _ in 0..30 {
                    while let Some(d) = client.poll_transmit() {
                        server.dispatch(BytesMut::from(&d[..]), peer).unwrap();
                    }
                    let outbound: Vec<Vec<u8>> = {
                        let mut sent = sink.sent.borrow_mut();
                        let drained = sent
                            .iter()
                            .filter(|(d, _)| classify(d) == PacketKind::Dtls)
                            .map(|(d, _)| d.clone())
                            .collect();
                        sent.retain(|(d, _)| classify(d) != PacketKind::Dtls);
                        drained
                    };
                    for d in outbound {
                        if let Some(k) = client.on_packet(&d).unwrap() {
                            client_keys = Some(k);
                        }
                    }
                    if session.state() == SessionState::Established
                        && client.is_established()
                    {
                        break;
                    }
                }
                assert_eq!(session.state(), SessionState::Established);
                let keys = client_keys.expect("client exported keys");

                // client protects with its write key; the session must
                // unprotect and land the packet on the rtc source
                let mut client_tx = SrtpContext::new(
                    ProtectionProfile::default(),
                    &keys.client_key,
                    &keys.client_salt,
                )
                .unwrap();
                let consumer = session.rtc_source().create_consumer(5_000);

                let rtp = rtp::Packet {
                    header: rtp::Header {
                        payload_type: 111,
                        sequence_number: 100,
                        timestamp: 960,
                        ssrc: 3001,
                        ..Default::default()
                    },
                    payload: bytes::Bytes::from_static(&[1, 2, 3, 4]),
                };
                let mut wire = BytesMut::from(&rtp.marshal()[..]);
                client_tx.protect_rtp(&mut wire).unwrap();
                server.dispatch(wire, peer).unwrap();

                let got = consumer.dump_packets(10);
                assert_eq!(got.len(), 1);
                assert!(got[0].is_audio());
                let parsed = rtp::Packet::unmarshal(&got[0].payload).unwrap();
                assert_eq!(parsed.header.ssrc, 3001);
                assert_eq!(parsed.payload.as_ref(), &[1, 2, 3, 4]);

                // the publish token is held
                assert!(sc.sources.acquire_publish("test.host/live/cam").is_err());

                session.close();
                server.sweep().await;
                assert!(sc.sources.acquire_publish("test.host/live/cam").is_ok());
            })
            .await;
    }
}
