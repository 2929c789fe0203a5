//! SRT server: caller-listener handshake, publisher ingest and player
//! egress over one UDP socket.

use crate::bridge::ts2rtmp::FrameBuilder;
use crate::http::stream::{LiveEncoder, TsEncoder};
use crate::server::ServerContext;
use crate::srt::packet::{
    encode_stream_id, HandshakeCif, SrtMode, SrtPacket, StreamId, CTRL_ACK, CTRL_ACKACK,
    CTRL_HANDSHAKE, CTRL_KEEPALIVE, CTRL_SHUTDOWN, EXT_TYPE_HSREQ, EXT_TYPE_HSRSP,
    EXT_TYPE_STREAMID, HS_TYPE_CONCLUSION, HS_TYPE_INDUCTION, SRT_MAGIC, SRT_VERSION_5,
};
use bytes::{BufMut, Bytes, BytesMut};
use hub::token::PublishToken;
use hub::{Consumer, Request, Source};
use log::{debug, info, warn};
use mpegts::{TsDemuxer, TS_PACKET_SIZE};
use runtime::hourglass::{HourGlass, HourGlassHandler};
use runtime::Coroutine;
use shared::error::{Error, Result};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

const ACK_EVERY_PACKETS: u64 = 64;

/// HourGlass events driving the periodic work.
const EVENT_PUMP_PLAYERS: u64 = 1;
const EVENT_REAP_IDLE: u64 = 2;

enum ConnState {
    /// Induction answered, waiting for the conclusion.
    Inducted { syn_cookie: u32 },
    Publishing {
        demuxer: TsDemuxer,
        builder: Rc<FrameBuilder>,
        _token: PublishToken,
        last_seq: u32,
        received: u64,
    },
    Playing {
        consumer: Rc<Consumer>,
        source: Rc<Source>,
        encoder: TsEncoder,
        next_seq: u32,
    },
    Closed,
}

struct SrtConn {
    peer: SocketAddr,
    remote_socket_id: u32,
    local_socket_id: u32,
    state: RefCell<ConnState>,
    started: Instant,
    last_packet_at: Cell<Instant>,
    req: RefCell<Option<Request>>,
}

impl SrtConn {
    fn timestamp(&self) -> u32 {
        self.started.elapsed().as_micros() as u32
    }
}

pub struct SrtServer {
    sc: Rc<ServerContext>,
    socket: RefCell<Option<Rc<UdpSocket>>>,
    conns: RefCell<HashMap<SocketAddr, Rc<SrtConn>>>,
    recv_co: RefCell<Option<Rc<Coroutine>>>,
    hourglass: RefCell<Option<Rc<HourGlass>>>,
}

impl HourGlassHandler for SrtServer {
    fn on_hourglass(&self, event: u64, _interval: Duration, _total: Duration) {
        match event {
            EVENT_PUMP_PLAYERS => self.pump_players(),
            EVENT_REAP_IDLE => self.reap_idle(),
            _ => {}
        }
    }
}

impl SrtServer {
    pub fn new(sc: Rc<ServerContext>) -> Rc<Self> {
        Rc::new(Self {
            sc,
            socket: RefCell::new(None),
            conns: RefCell::new(HashMap::new()),
            recv_co: RefCell::new(None),
            hourglass: RefCell::new(None),
        })
    }

    pub async fn start(self: &Rc<Self>) -> Result<()> {
        let listen = self.sc.config.borrow().srt.listen.clone();
        let socket = Rc::new(UdpSocket::bind(&listen).await?);
        info!("srt server listening on {listen}");
        *self.socket.borrow_mut() = Some(socket.clone());

        let recv_co = Rc::new(Coroutine::new("srt-recv"));
        {
            let this = Rc::clone(self);
            let socket = socket.clone();
            recv_co.start(move |ctx| async move {
                let mut buf = vec![0u8; 2048];
                loop {
                    ctx.pull()?;
                    let (n, peer) = match ctx
                        .timeout(Duration::from_secs(3600), socket.recv_from(&mut buf))
                        .await
                    {
                        Ok(v) => v,
                        Err(e) if e.is_timeout() => continue,
                        Err(e) => return Err(e),
                    };
                    if let Err(e) = this.on_datagram(&buf[..n], peer) {
                        debug!("srt datagram from {peer}: {e}");
                    }
                }
            });
        }
        *self.recv_co.borrow_mut() = Some(recv_co);

        // one hourglass carries all periodic work at a 100 ms resolution
        let hg = HourGlass::new(
            Rc::downgrade(self) as std::rc::Weak<dyn HourGlassHandler>,
            Duration::from_millis(100),
        );
        hg.tick(EVENT_PUMP_PLAYERS, Duration::from_millis(100));
        hg.tick(EVENT_REAP_IDLE, Duration::from_secs(1));
        hg.start("srt-hourglass");
        *self.hourglass.borrow_mut() = Some(hg);
        Ok(())
    }

    pub async fn stop(&self) {
        let recv = self.recv_co.borrow_mut().take();
        if let Some(co) = recv {
            co.stop().await;
        }
        let hg = self.hourglass.borrow_mut().take();
        if let Some(hg) = hg {
            hg.stop().await;
        }
        let conns: Vec<Rc<SrtConn>> = self.conns.borrow_mut().drain().map(|(_, c)| c).collect();
        for conn in conns {
            self.close_conn(&conn);
        }
    }

    fn send_to(&self, data: &[u8], to: SocketAddr) {
        if let Some(socket) = self.socket.borrow().as_ref() {
            let _ = socket.try_send_to(data, to);
        }
    }

    fn on_datagram(&self, data: &[u8], peer: SocketAddr) -> Result<()> {
        let packet = SrtPacket::unmarshal(data)?;
        match packet {
            SrtPacket::Control {
                control_type: CTRL_HANDSHAKE,
                cif,
                ..
            } => self.on_handshake(&cif, peer),
            SrtPacket::Control {
                control_type,
                type_specific,
                ..
            } => self.on_control(control_type, type_specific, peer),
            SrtPacket::Data {
                sequence, payload, ..
            } => self.on_data(sequence, payload, peer),
        }
    }

    fn on_handshake(&self, cif: &[u8], peer: SocketAddr) -> Result<()> {
        let hs = HandshakeCif::unmarshal(cif)?;
        match hs.handshake_type {
            HS_TYPE_INDUCTION => {
                let syn_cookie = rand::random::<u32>() | 1;
                let conn = Rc::new(SrtConn {
                    peer,
                    remote_socket_id: hs.socket_id,
                    local_socket_id: rand::random::<u32>() | 1,
                    state: RefCell::new(ConnState::Inducted { syn_cookie }),
                    started: Instant::now(),
                    last_packet_at: Cell::new(Instant::now()),
                    req: RefCell::new(None),
                });
                self.conns.borrow_mut().insert(peer, conn.clone());

                let response = HandshakeCif {
                    version: SRT_VERSION_5,
                    encryption: 0,
                    extension: SRT_MAGIC,
                    initial_sequence: hs.initial_sequence,
                    mtu: hs.mtu,
                    flow_window: hs.flow_window,
                    handshake_type: HS_TYPE_INDUCTION,
                    socket_id: conn.local_socket_id,
                    syn_cookie,
                    peer_ip: hs.peer_ip,
                    extensions: Vec::new(),
                };
                self.reply_handshake(&conn, &response);
                Ok(())
            }
            HS_TYPE_CONCLUSION => {
                let conn = self
                    .conns
                    .borrow()
                    .get(&peer)
                    .cloned()
                    .ok_or_else(|| Error::SrtHandshake("conclusion before induction".into()))?;
                let expected = match &*conn.state.borrow() {
                    ConnState::Inducted { syn_cookie } => *syn_cookie,
                    _ => return Ok(()), // retransmitted conclusion
                };
                if hs.syn_cookie != expected {
                    return Err(Error::SrtHandshake("syn cookie mismatch".into()));
                }

                let stream_id_raw = hs
                    .stream_id()
                    .ok_or_else(|| Error::SrtStreamId("missing streamid extension".into()))?;
                let stream_id = StreamId::parse(&stream_id_raw)?;
                let (app, stream) = stream_id.app_stream();
                let mut req = Request::default();
                if !stream_id.host.is_empty() {
                    req.vhost = stream_id.host.clone();
                    req.host = stream_id.host.clone();
                }
                req.app = app;
                req.stream = stream;
                req.schema = "srt".into();
                req.protocol = "srt".into();
                req.ip = peer.ip().to_string();

                self.establish(&conn, &stream_id, req.clone())?;
                *conn.req.borrow_mut() = Some(req);

                let mut response = HandshakeCif {
                    version: SRT_VERSION_5,
                    encryption: 0,
                    extension: 1, // HSREQ handled
                    initial_sequence: hs.initial_sequence,
                    mtu: hs.mtu,
                    flow_window: hs.flow_window,
                    handshake_type: HS_TYPE_CONCLUSION,
                    socket_id: conn.local_socket_id,
                    syn_cookie: 0,
                    peer_ip: hs.peer_ip,
                    extensions: Vec::new(),
                };
                // answer HSREQ with HSRSP carrying the configured latency
                if let Some(hsreq) = hs.extension(EXT_TYPE_HSREQ) {
                    let latency = self.sc.config.borrow().srt.latency_ms as u32;
                    let mut rsp = BytesMut::new();
                    rsp.extend_from_slice(&hsreq[..4.min(hsreq.len())]);
                    while rsp.len() < 8 {
                        rsp.put_u8(0);
                    }
                    rsp.put_u32((latency << 16) | latency);
                    response
                        .extensions
                        .push((EXT_TYPE_HSRSP, rsp.freeze()));
                }
                response
                    .extensions
                    .push((EXT_TYPE_STREAMID, encode_stream_id(&stream_id_raw)));
                self.reply_handshake(&conn, &response);
                Ok(())
            }
            other => Err(Error::SrtHandshake(format!("handshake type {other}"))),
        }
    }

    fn establish(&self, conn: &Rc<SrtConn>, stream_id: &StreamId, req: Request) -> Result<()> {
        match stream_id.mode {
            SrtMode::Publish => {
                let token = self.sc.sources.acquire_publish(&req.stream_url())?;
                let source = self.sc.sources.fetch_or_create(&req);
                source.update_request(req.clone());
                source.on_publish();
                info!("srt publish {} from {}", req.stream_url(), conn.peer);
                *conn.state.borrow_mut() = ConnState::Publishing {
                    demuxer: TsDemuxer::new(),
                    builder: FrameBuilder::new(source),
                    _token: token,
                    last_seq: 0,
                    received: 0,
                };
            }
            SrtMode::Request => {
                let source = self.sc.sources.fetch_or_create(&req);
                let consumer = source.create_consumer(
                    self.sc.config.borrow().rtmp.queue_size_ms,
                );
                info!("srt play {} to {}", req.stream_url(), conn.peer);
                *conn.state.borrow_mut() = ConnState::Playing {
                    consumer,
                    source,
                    encoder: TsEncoder::new(),
                    next_seq: 1,
                };
            }
        }
        Ok(())
    }

    fn reply_handshake(&self, conn: &SrtConn, cif: &HandshakeCif) {
        let packet = SrtPacket::Control {
            control_type: CTRL_HANDSHAKE,
            subtype: 0,
            type_specific: 0,
            timestamp: conn.timestamp(),
            dest_socket_id: conn.remote_socket_id,
            cif: cif.marshal(),
        };
        self.send_to(&packet.marshal(), conn.peer);
    }

    fn on_control(&self, control_type: u16, type_specific: u32, peer: SocketAddr) -> Result<()> {
        let Some(conn) = self.conns.borrow().get(&peer).cloned() else {
            return Ok(());
        };
        conn.last_packet_at.set(Instant::now());
        match control_type {
            CTRL_KEEPALIVE => {
                let reply = SrtPacket::Control {
                    control_type: CTRL_KEEPALIVE,
                    subtype: 0,
                    type_specific: 0,
                    timestamp: conn.timestamp(),
                    dest_socket_id: conn.remote_socket_id,
                    cif: Bytes::new(),
                };
                self.send_to(&reply.marshal(), peer);
            }
            CTRL_SHUTDOWN => {
                info!("srt peer {peer} shutdown");
                self.close_conn(&conn);
                self.conns.borrow_mut().remove(&peer);
            }
            CTRL_ACK => {
                // full ACK: answer ACKACK echoing the ack number
                let reply = SrtPacket::Control {
                    control_type: CTRL_ACKACK,
                    subtype: 0,
                    type_specific,
                    timestamp: conn.timestamp(),
                    dest_socket_id: conn.remote_socket_id,
                    cif: Bytes::new(),
                };
                self.send_to(&reply.marshal(), peer);
            }
            CTRL_ACKACK => {}
            other => debug!("srt control {other} ignored"),
        }
        Ok(())
    }

    fn on_data(&self, sequence: u32, payload: Bytes, peer: SocketAddr) -> Result<()> {
        let Some(conn) = self.conns.borrow().get(&peer).cloned() else {
            return Ok(());
        };
        conn.last_packet_at.set(Instant::now());

        let mut state = conn.state.borrow_mut();
        let ConnState::Publishing {
            demuxer,
            builder,
            last_seq,
            received,
            ..
        } = &mut *state
        else {
            return Ok(());
        };
        *last_seq = sequence;
        *received += 1;

        if payload.len() % TS_PACKET_SIZE != 0 {
            return Err(Error::SrtDecode(format!(
                "payload of {} bytes not 188-aligned",
                payload.len()
            )));
        }
        for pkt in payload.chunks(TS_PACKET_SIZE) {
            for frame in demuxer.feed(pkt)? {
                builder.on_frame(&frame)?;
            }
        }

        if *received % ACK_EVERY_PACKETS == 0 {
            let mut cif = BytesMut::new();
            cif.put_u32(sequence.wrapping_add(1)); // last ack'd + 1
            cif.put_u32(10_000); // rtt us
            cif.put_u32(5_000); // rtt var
            cif.put_u32(8192); // available buffer
            let ack = SrtPacket::Control {
                control_type: CTRL_ACK,
                subtype: 0,
                type_specific: (*received / ACK_EVERY_PACKETS) as u32,
                timestamp: conn.timestamp(),
                dest_socket_id: conn.remote_socket_id,
                cif: cif.freeze(),
            };
            drop(state);
            self.send_to(&ack.marshal(), peer);
        }
        Ok(())
    }

    /// Drains play consumers into 188-aligned data packets.
    fn pump_players(&self) {
        let conns: Vec<Rc<SrtConn>> = self.conns.borrow().values().cloned().collect();
        for conn in conns {
            let mut state = conn.state.borrow_mut();
            let ConnState::Playing {
                consumer,
                encoder,
                next_seq,
                ..
            } = &mut *state
            else {
                continue;
            };
            let packets = consumer.dump_packets(32);
            let mut ts_out = BytesMut::new();
            for pkt in &packets {
                match encoder.encode(pkt) {
                    Ok(pieces) => {
                        for p in pieces {
                            ts_out.extend_from_slice(&p);
                        }
                    }
                    Err(e) => warn!("srt play encode: {e}"),
                }
            }
            // 7 TS packets per datagram, the usual MTU fit
            for chunk in ts_out.chunks(7 * TS_PACKET_SIZE) {
                let data = SrtPacket::Data {
                    sequence: *next_seq,
                    message_flags: 0xE000_0000, // solo packet, in order
                    timestamp: conn.timestamp(),
                    dest_socket_id: conn.remote_socket_id,
                    payload: Bytes::copy_from_slice(chunk),
                };
                *next_seq = (*next_seq + 1) & 0x7FFF_FFFF;
                self.send_to(&data.marshal(), conn.peer);
            }
        }
    }

    fn reap_idle(&self) {
        let now = Instant::now();
        let dead: Vec<SocketAddr> = self
            .conns
            .borrow()
            .iter()
            .filter(|(_, c)| {
                now.duration_since(c.last_packet_at.get()) > Duration::from_secs(10)
            })
            .map(|(p, _)| *p)
            .collect();
        for peer in dead {
            let conn = self.conns.borrow_mut().remove(&peer);
            if let Some(conn) = conn {
                info!("srt conn {peer} idle, closing");
                self.close_conn(&conn);
            }
        }
    }

    fn close_conn(&self, conn: &Rc<SrtConn>) {
        let mut state = conn.state.borrow_mut();
        match &*state {
            ConnState::Publishing { builder, .. } => {
                builder.source().on_unpublish();
            }
            ConnState::Playing {
                consumer, source, ..
            } => {
                source.on_consumer_destroy(consumer);
            }
            _ => {}
        }
        *state = ConnState::Closed;
    }

    /// Test hook: one datagram in, replies captured by the caller's socket.
    #[cfg(test)]
    pub(crate) fn inject(&self, data: &[u8], peer: SocketAddr) -> Result<()> {
        self.on_datagram(data, peer)
    }
}
