//! GB28181 media ingest: length-prefixed program stream packs over TCP,
//! bridged to the media source through the shared frame builder.
//!
//! Signaling (SIP INVITE and friends) lives outside this server; the TCP
//! media channel arrives here already addressed to `gb/{ssrc}`.

use crate::bridge::ts2rtmp::FrameBuilder;
use crate::server::ServerContext;
use bytes::Bytes;
use hub::Request;
use log::{debug, info};
use runtime::CoroutineContext;
use shared::error::{Error, Result};
use shared::tcp_framing::TcpFrameDecoder;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Serves one accepted GB28181 media connection.
///
/// The first framed pack names the channel implicitly: the stream is keyed
/// by the peer address until signaling supplies a richer identity.
pub async fn serve<S>(
    ctx: CoroutineContext,
    mut stream: S,
    peer: SocketAddr,
    sc: Rc<ServerContext>,
) -> Result<()>
where
    S: AsyncRead + Unpin + 'static,
{
    let mut req = Request::default();
    req.app = "gb".into();
    req.stream = format!("{}-{}", peer.ip(), peer.port());
    req.schema = "gb28181".into();
    req.protocol = "gb28181".into();
    req.ip = peer.ip().to_string();

    let token = sc.sources.acquire_publish(&req.stream_url())?;
    let source = sc.sources.fetch_or_create(&req);
    source.update_request(req.clone());
    source.on_publish();
    info!("[{}] gb28181 publish {}", ctx.cid(), req.stream_url());

    let builder = FrameBuilder::new(source.clone());
    let mut demuxer = mpegts::ps::PsDemuxer::new();
    let mut framing = TcpFrameDecoder::new();
    let mut chunk = [0u8; 16 * 1024];
    let timeout = Duration::from_secs(10);

    let result: Result<()> = async {
        let mut processed = 0usize;
        loop {
            ctx.pull()?;
            while let Some(pack) = framing.next_packet() {
                processed += 1;
                match feed_pack(&mut demuxer, &builder, &pack) {
                    Ok(()) => {}
                    // one bad pack is a codec hiccup, not a dead peer
                    Err(e @ Error::PsDecode(_)) => debug!("gb pack dropped: {e}"),
                    Err(e) => return Err(e),
                }
                if processed % 15 == 0 {
                    ctx.yield_now().await;
                }
            }
            let n = ctx.timeout(timeout, stream.read(&mut chunk)).await?;
            if n == 0 {
                return Ok(());
            }
            sc.stats.add_bytes_in(n as u64);
            framing.extend_from_slice(&chunk[..n]);
        }
    }
    .await;

    if let Some(frame) = demuxer.flush() {
        let _ = builder.on_frame(&frame);
    }
    source.on_unpublish();
    drop(token);
    info!("[{}] gb28181 {} done", ctx.cid(), req.stream_url());
    result
}

fn feed_pack(
    demuxer: &mut mpegts::ps::PsDemuxer,
    builder: &Rc<FrameBuilder>,
    pack: &Bytes,
) -> Result<()> {
    for frame in demuxer.feed(pack)? {
        builder.on_frame(&frame)?;
    }
    Ok(())
}
