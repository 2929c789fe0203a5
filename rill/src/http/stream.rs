//! HTTP live streaming mounts: `/{app}/{stream}.flv|.ts|.aac|.mp3`.

use crate::http::HttpRequest;
use crate::server::ServerContext;
use bytes::{Bytes, BytesMut};
use flv::{aac, avc, tag};
use hub::{Consumer, MediaPacket, Request, Source};
use log::{debug, info, warn};
use mpegts::TsMuxer;
use runtime::{Coroutine, CoroutineContext};
use shared::error::{Error, Result};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveFormat {
    Flv,
    Ts,
    Aac,
    Mp3,
}

impl LiveFormat {
    fn from_path(path: &str) -> Option<Self> {
        let ext = path.rsplit_once('.')?.1;
        match ext {
            "flv" => Some(LiveFormat::Flv),
            "ts" => Some(LiveFormat::Ts),
            "aac" => Some(LiveFormat::Aac),
            "mp3" => Some(LiveFormat::Mp3),
            _ => None,
        }
    }

    fn content_type(&self) -> &'static str {
        match self {
            LiveFormat::Flv => "video/x-flv",
            LiveFormat::Ts => "video/MP2T",
            LiveFormat::Aac => "audio/x-aac",
            LiveFormat::Mp3 => "audio/mpeg",
        }
    }

    /// Audio-only formats start from the rolling audio cache instead of
    /// the source gop.
    fn uses_audio_cache(&self) -> bool {
        matches!(self, LiveFormat::Aac | LiveFormat::Mp3)
    }
}

pub fn is_live_path(path: &str) -> bool {
    LiveFormat::from_path(path).is_some() && path.matches('/').count() >= 2
}

/// Rolling window of recent audio packets, fed by an invisible consumer on
/// the source, so AAC/MP3 subscribers start with sound immediately.
pub struct BufferCache {
    consumer: Rc<Consumer>,
    source: Rc<Source>,
    ring: RefCell<VecDeque<MediaPacket>>,
    window_ms: i64,
    co: RefCell<Option<Rc<Coroutine>>>,
}

impl BufferCache {
    pub fn new(source: Rc<Source>, window_ms: i64) -> Rc<Self> {
        let consumer = source.create_consumer(window_ms);
        Rc::new(Self {
            consumer,
            source,
            ring: RefCell::new(VecDeque::new()),
            window_ms,
            co: RefCell::new(None),
        })
    }

    pub fn start(self: &Rc<Self>, name: &str) {
        let co = Rc::new(Coroutine::new(name));
        let this = Rc::clone(self);
        co.start(move |ctx| async move {
            loop {
                ctx.pull()?;
                this.consumer.wait(Duration::from_millis(500)).await;
                let packets = this.consumer.dump_packets(64);
                let mut ring = this.ring.borrow_mut();
                for p in packets {
                    if p.is_audio() {
                        ring.push_back(p);
                    }
                }
                while ring.len() > 1 {
                    let span =
                        ring.back().unwrap().timestamp - ring.front().unwrap().timestamp;
                    if span <= this.window_ms {
                        break;
                    }
                    ring.pop_front();
                }
            }
        });
        *self.co.borrow_mut() = Some(co);
    }

    pub async fn stop(&self) {
        let co = self.co.borrow_mut().take();
        if let Some(co) = co {
            co.stop().await;
        }
        self.source.on_consumer_destroy(&self.consumer);
    }

    pub fn dump(&self) -> Vec<MediaPacket> {
        self.ring.borrow().iter().cloned().collect()
    }
}

/// One mounted live stream with its viewers and optional audio cache.
pub struct Mount {
    pub stream_url: String,
    pub cache: RefCell<Option<Rc<BufferCache>>>,
    pub viewers: Cell<usize>,
    /// Stamped when the last viewer left; the reaper unmounts after a
    /// grace delay so reconnecting players reuse the mount.
    pub die_at: Cell<Option<Instant>>,
}

/// Mount table shared by all HTTP connections.
#[derive(Default)]
pub struct Mounts {
    entries: RefCell<HashMap<String, Rc<Mount>>>,
}

impl Mounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    fn fetch_or_mount(
        &self,
        source: &Rc<Source>,
        format: LiveFormat,
        fast_cache: bool,
    ) -> Rc<Mount> {
        let url = source.stream_url();
        let mut entries = self.entries.borrow_mut();
        let mount = entries
            .entry(url.clone())
            .or_insert_with(|| {
                info!("mount live stream {url}");
                Rc::new(Mount {
                    stream_url: url.clone(),
                    cache: RefCell::new(None),
                    viewers: Cell::new(0),
                    die_at: Cell::new(None),
                })
            })
            .clone();
        if format.uses_audio_cache() && fast_cache && mount.cache.borrow().is_none() {
            let cache = BufferCache::new(source.clone(), 3000);
            cache.start(&format!("http-cache-{url}"));
            *mount.cache.borrow_mut() = Some(cache);
        }
        mount.viewers.set(mount.viewers.get() + 1);
        mount.die_at.set(None);
        mount
    }

    fn release(&self, mount: &Rc<Mount>) {
        let v = mount.viewers.get().saturating_sub(1);
        mount.viewers.set(v);
        if v == 0 {
            mount.die_at.set(Some(Instant::now()));
        }
    }

    /// Unmounts entries whose last viewer expired before `idle` ago; the
    /// audio caches are stopped asynchronously.
    pub async fn reap(&self, idle: Duration) {
        let now = Instant::now();
        let dead: Vec<Rc<Mount>> = self
            .entries
            .borrow()
            .values()
            .filter(|m| {
                m.viewers.get() == 0
                    && m.die_at
                        .get()
                        .map(|at| now.duration_since(at) >= idle)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        for m in dead {
            info!("unmount live stream {}", m.stream_url);
            self.entries.borrow_mut().remove(&m.stream_url);
            let cache = m.cache.borrow_mut().take();
            if let Some(c) = cache {
                c.stop().await;
            }
        }
    }
}

/// Serves one live viewer connection to completion.
pub async fn serve_live<S>(
    ctx: CoroutineContext,
    io: S,
    peer: SocketAddr,
    http_req: HttpRequest,
    sc: Rc<ServerContext>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let format = LiveFormat::from_path(&http_req.path)
        .ok_or_else(|| Error::HttpParse("not a live path".into()))?;
    let (app, stream_name) = parse_live_path(&http_req.path)?;

    let mut req = Request::default();
    req.schema = "http".into();
    req.protocol = format!("http-{:?}", format).to_lowercase();
    req.app = app;
    req.stream = stream_name;
    req.param = http_req.query.clone();
    if let Some(host) = http_req.host() {
        req.vhost = host.to_string();
        req.host = host.to_string();
    }
    req.ip = peer.ip().to_string();

    let client_id = ctx.cid();
    let (read_half, mut write_half) = tokio::io::split(io);

    if let Err(e) = sc.hooks.on_play(client_id, &req).await {
        super::write_response(&ctx, &mut write_half, 403, "application/json", b"{\"code\":403}")
            .await?;
        return Err(e);
    }

    let source = sc.sources.fetch_or_create(&req);
    let fast_cache = sc.config.borrow().http.fast_cache;
    let mount = sc.mounts.fetch_or_mount(&source, format, fast_cache);

    // streaming response headers
    let head = format!(
        "HTTP/1.1 200 OK\r\nServer: rill\r\nContent-Type: {}\r\n\
         Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
        format.content_type()
    );
    let timeout = Duration::from_secs(30);
    ctx.timeout(timeout, write_half.write_all(head.as_bytes()))
        .await?;

    let (queue_size, mw_msgs, mw_sleep) = {
        let c = sc.config.borrow();
        (
            c.rtmp.queue_size_ms,
            c.rtmp.mw_msgs,
            Duration::from_millis(c.rtmp.mw_sleep_ms),
        )
    };
    let consumer = source.create_consumer(queue_size);
    sc.stats.players.set(sc.stats.players.get() + 1);

    let mut encoder: Box<dyn LiveEncoder> = match format {
        LiveFormat::Flv => Box::new(FlvEncoder::new()),
        LiveFormat::Ts => Box::new(TsEncoder::new()),
        LiveFormat::Aac => Box::new(AacEncoder::default()),
        LiveFormat::Mp3 => Box::new(Mp3Encoder),
    };

    // audio-cache formats start from the encoder cache, not the gop dump
    if format.uses_audio_cache() {
        // the consumer was dumped the gop; replace with the audio window
        consumer.dump_packets(usize::MAX);
        if let Some(cache) = mount.cache.borrow().as_ref() {
            for p in cache.dump() {
                consumer.enqueue(&p, true, hub::JitterAlgorithm::Off);
            }
        }
    }

    // discard-reader coroutine: surfaces a half-closed socket promptly
    let closed = Rc::new(Cell::new(false));
    let reader_co = Rc::new(Coroutine::new(&format!("http-view-recv-{client_id}")));
    {
        let closed = closed.clone();
        let consumer = consumer.clone();
        let mut read_half = read_half;
        reader_co.start(move |rctx| async move {
            let mut sink = [0u8; 1024];
            loop {
                rctx.pull()?;
                match rctx
                    .timeout(Duration::from_secs(3600), read_half.read(&mut sink))
                    .await
                {
                    Ok(0) | Err(Error::Io(_)) | Err(Error::ConnectionClosed) => break,
                    Ok(_) => continue,
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => return Err(e),
                }
            }
            closed.set(true);
            consumer.wakeup();
            Ok(())
        });
    }

    // stream loop: dump a burst, encode, chunked-write
    let result = async {
        loop {
            ctx.pull()?;
            if closed.get() {
                return Ok(());
            }
            consumer.wait(mw_sleep).await;
            let packets = consumer.dump_packets(mw_msgs);
            if packets.is_empty() {
                continue;
            }
            let mut out = BytesMut::new();
            for pkt in &packets {
                for piece in encoder.encode(pkt)? {
                    write_chunk(&mut out, &piece);
                }
            }
            if out.is_empty() {
                continue;
            }
            ctx.timeout(timeout, write_half.write_all(&out)).await?;
            sc.stats.add_bytes_out(out.len() as u64);
        }
    }
    .await;

    reader_co.stop().await;
    source.on_consumer_destroy(&consumer);
    sc.mounts.release(&mount);
    sc.stats
        .players
        .set(sc.stats.players.get().saturating_sub(1));
    sc.hooks.on_stop(client_id, &req);
    debug!("[{client_id}] http viewer {} done", req.stream_url());
    result
}

fn parse_live_path(path: &str) -> Result<(String, String)> {
    let without_ext = path
        .rsplit_once('.')
        .map(|(p, _)| p)
        .unwrap_or(path)
        .trim_start_matches('/');
    let (app, stream) = without_ext
        .rsplit_once('/')
        .ok_or_else(|| Error::HttpParse(format!("bad live path {path}")))?;
    if app.is_empty() || stream.is_empty() {
        return Err(Error::HttpParse(format!("bad live path {path}")));
    }
    Ok((app.to_string(), stream.to_string()))
}

/// Appends one HTTP chunk.
fn write_chunk(out: &mut BytesMut, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Per-format transmuxer from hub packets to response body bytes.
pub(crate) trait LiveEncoder {
    fn encode(&mut self, pkt: &MediaPacket) -> Result<Vec<Bytes>>;
}

struct FlvEncoder {
    sent_header: bool,
}

impl FlvEncoder {
    fn new() -> Self {
        Self { sent_header: false }
    }
}

impl LiveEncoder for FlvEncoder {
    fn encode(&mut self, pkt: &MediaPacket) -> Result<Vec<Bytes>> {
        let mut out = Vec::new();
        if !self.sent_header {
            self.sent_header = true;
            out.push(tag::flv_header(true, true));
        }
        let ts = pkt.timestamp.max(0) as u32;
        let tag_type = match pkt.kind {
            hub::PacketKind::Audio => tag::TAG_AUDIO,
            hub::PacketKind::Video => tag::TAG_VIDEO,
            hub::PacketKind::Script => tag::TAG_SCRIPT,
        };
        out.push(tag::encode_tag(tag_type, ts, &pkt.payload));
        Ok(out)
    }
}

/// FLV tags to transport stream: AVC to Annex-B, AAC to ADTS.
pub(crate) struct TsEncoder {
    mux: TsMuxer,
    sps: Vec<Bytes>,
    pps: Vec<Bytes>,
    asc: Option<aac::AudioSpecificConfig>,
}

impl TsEncoder {
    pub(crate) fn new() -> Self {
        Self {
            mux: TsMuxer::new(),
            sps: Vec::new(),
            pps: Vec::new(),
            asc: None,
        }
    }
}

impl LiveEncoder for TsEncoder {
    fn encode(&mut self, pkt: &MediaPacket) -> Result<Vec<Bytes>> {
        let mut out = Vec::new();
        match pkt.kind {
            hub::PacketKind::Video => {
                if pkt.payload.len() < 5 || flv::hevc::is_enhanced(&pkt.payload) {
                    // HEVC-over-TS is not mounted; drop quietly
                    return Ok(out);
                }
                if avc::is_avc_sequence_header(&pkt.payload) {
                    let record = pkt.payload.slice(5..);
                    let (sps, pps) = avc::parse_configuration_record(&record)?;
                    self.sps = sps;
                    self.pps = pps;
                    return Ok(out);
                }
                let keyframe = pkt.payload[0] >> 4 == avc::FLV_FRAME_KEY;
                let cts = u32::from_be_bytes([
                    0,
                    pkt.payload[2],
                    pkt.payload[3],
                    pkt.payload[4],
                ]) as u64;
                let nalus = avc::avcc_to_nalus(&pkt.payload.slice(5..))?;
                let mut annexb = BytesMut::new();
                if keyframe {
                    for ps in self.sps.iter().chain(self.pps.iter()) {
                        annexb.extend_from_slice(&[0, 0, 0, 1]);
                        annexb.extend_from_slice(ps);
                    }
                }
                for n in &nalus {
                    annexb.extend_from_slice(&[0, 0, 0, 1]);
                    annexb.extend_from_slice(n);
                }
                let dts = pkt.timestamp.max(0) as u64 * 90;
                let pts = dts + cts * 90;
                out.push(self.mux.mux_video(pts, dts, keyframe, &annexb.freeze()));
            }
            hub::PacketKind::Audio => {
                if aac::is_aac_sequence_header(&pkt.payload) {
                    self.asc = aac::AudioSpecificConfig::parse(&pkt.payload[2..]).ok();
                    return Ok(out);
                }
                let Some(asc) = &self.asc else {
                    return Ok(out);
                };
                if pkt.payload.len() <= 2 {
                    return Ok(out);
                }
                let adts = aac::adts_frame(asc, &pkt.payload[2..]);
                out.push(self.mux.mux_audio(pkt.timestamp.max(0) as u64 * 90, &adts));
            }
            hub::PacketKind::Script => {}
        }
        Ok(out)
    }
}

#[derive(Default)]
struct AacEncoder {
    asc: Option<aac::AudioSpecificConfig>,
}

impl LiveEncoder for AacEncoder {
    fn encode(&mut self, pkt: &MediaPacket) -> Result<Vec<Bytes>> {
        if !pkt.is_audio() || pkt.payload.len() <= 2 {
            return Ok(Vec::new());
        }
        if aac::is_aac_sequence_header(&pkt.payload) {
            self.asc = aac::AudioSpecificConfig::parse(&pkt.payload[2..]).ok();
            return Ok(Vec::new());
        }
        match &self.asc {
            Some(asc) => Ok(vec![aac::adts_frame(asc, &pkt.payload[2..])]),
            None => Ok(Vec::new()),
        }
    }
}

struct Mp3Encoder;

impl LiveEncoder for Mp3Encoder {
    fn encode(&mut self, pkt: &MediaPacket) -> Result<Vec<Bytes>> {
        if !pkt.is_audio() || pkt.payload.len() <= 1 {
            return Ok(Vec::new());
        }
        if aac::sound_format(&pkt.payload) != Some(aac::SOUND_FORMAT_MP3) {
            warn!("mp3 mount got non-mp3 audio, dropping");
            return Ok(Vec::new());
        }
        Ok(vec![pkt.payload.slice(1..)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerContext;
    use tokio::task::LocalSet;

    #[test]
    fn test_live_path_detection() {
        assert!(is_live_path("/live/cam.flv"));
        assert!(is_live_path("/live/cam.ts"));
        assert!(is_live_path("/live/cam.aac"));
        assert!(is_live_path("/live/cam.mp3"));
        assert!(!is_live_path("/api/v1/streams"));
        assert!(!is_live_path("/cam.flv"));
    }

    #[test]
    fn test_parse_live_path() {
        assert_eq!(
            parse_live_path("/live/cam.flv").unwrap(),
            ("live".to_string(), "cam".to_string())
        );
        assert!(parse_live_path("/cam.flv").is_err());
    }

    #[test]
    fn test_flv_encoder_header_once() {
        let mut e = FlvEncoder::new();
        let a = MediaPacket::audio(0, Bytes::from_static(&[0xAF, 1, 1]));
        let first = e.encode(&a).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(&first[0][..3], b"FLV");
        let second = e.encode(&a).unwrap();
        assert_eq!(second.len(), 1);
    }

    fn dechunk(mut body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(pos) = body.windows(2).position(|w| w == b"\r\n") {
            let size = usize::from_str_radix(
                std::str::from_utf8(&body[..pos]).unwrap().trim(),
                16,
            )
            .unwrap();
            if size == 0 {
                break;
            }
            let start = pos + 2;
            if start + size + 2 > body.len() {
                break; // partial chunk still in flight
            }
            out.extend_from_slice(&body[start..start + size]);
            body = &body[start + size + 2..];
        }
        out
    }

    /// HTTP-FLV single viewer lifecycle: exact body bytes, then consumer
    /// teardown and the source entering its dying state.
    #[tokio::test]
    async fn test_flv_viewer_lifecycle() {
        LocalSet::new()
            .run_until(async {
                let sc = ServerContext::for_tests();
                let req =
                    Request::from_tc_url("rtmp://test.host/live", "livestream").unwrap();
                let source = sc.sources.fetch_or_create(&req);
                source.on_publish();

                let (server_io, mut client) = tokio::io::duplex(256 * 1024);
                let co = Coroutine::new("http-flv");
                let sc2 = sc.clone();
                co.start(move |ctx| async move {
                    let http_req = HttpRequest {
                        method: "GET".into(),
                        path: "/live/livestream.flv".into(),
                        query: String::new(),
                        headers: vec![("Host".into(), "test.host".into())],
                        body: Bytes::new(),
                    };
                    let _ = serve_live(
                        ctx,
                        server_io,
                        "127.0.0.1:9999".parse().unwrap(),
                        http_req,
                        sc2,
                    )
                    .await;
                    Ok(())
                });

                // publisher pushes one audio + one video packet
                tokio::time::sleep(Duration::from_millis(20)).await;
                source
                    .on_video(MediaPacket::video(
                        0,
                        Bytes::from_static(&[0x17, 1, 0, 0, 0, 7, 7]),
                    ))
                    .unwrap();
                source
                    .on_audio(MediaPacket::audio(10, Bytes::from_static(&[0xAF, 1, 9])))
                    .unwrap();

                // read response until both tags arrived
                let mut raw = Vec::new();
                let mut buf = [0u8; 4096];
                let expected_body = 13 + (11 + 7 + 4) + (11 + 3 + 4);
                let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
                loop {
                    let header_end = raw
                        .windows(4)
                        .position(|w| w == b"\r\n\r\n")
                        .map(|p| p + 4);
                    if let Some(he) = header_end {
                        if dechunk(&raw[he..]).len() >= expected_body {
                            break;
                        }
                    }
                    let n = tokio::select! {
                        r = client.read(&mut buf) => r.unwrap(),
                        _ = tokio::time::sleep_until(deadline) => panic!("timeout"),
                    };
                    assert!(n > 0, "server closed early");
                    raw.extend_from_slice(&buf[..n]);
                }

                let he = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
                let body = dechunk(&raw[he..]);
                assert_eq!(body.len(), expected_body);
                assert_eq!(&body[..3], b"FLV");
                assert_eq!(source.consumer_count(), 1);

                // close the socket: the viewer must detach
                drop(client);
                tokio::time::sleep(Duration::from_millis(50)).await;
                co.stop().await;
                assert_eq!(source.consumer_count(), 0);

                // publisher leaves: source enters its dying state
                source.on_unpublish();
                assert!(source.stream_is_dead_for(
                    Duration::ZERO,
                    Instant::now() + Duration::from_millis(1)
                ));
                sc.mounts.reap(Duration::ZERO).await;
                assert_eq!(sc.mounts.len(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_ts_encoder_produces_aligned_packets() {
        let mut e = TsEncoder::new();
        // sequence header with a real record
        let sps = Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E, 0xDA]);
        let pps = Bytes::from_static(&[0x68, 0xCE]);
        let record = avc::decoder_configuration_record(&sps, &pps).unwrap();
        let sh = MediaPacket::video(0, flv::avc::video_sequence_header_tag(&record));
        assert!(e.encode(&sh).unwrap().is_empty());

        let frame = MediaPacket::video(
            40,
            flv::avc::video_nalu_tag(
                true,
                0,
                &avc::nalus_to_avcc(&[Bytes::from_static(&[0x65, 1, 2, 3])]),
            ),
        );
        let out = e.encode(&frame).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len() % mpegts::TS_PACKET_SIZE, 0);
    }
}
