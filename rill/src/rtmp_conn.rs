//! RTMP server connection: handshake -> connect -> identify -> publish|play.
//!
//! Publishing splits into a dedicated receive coroutine feeding the source
//! while the owning coroutine waits on an error condition; playing runs a
//! merged-write loop in the owning coroutine while a queue-recv coroutine
//! drains control messages (pause, buffer length) from the client.

use crate::server::ServerContext;
use bytes::BytesMut;
use hub::{Consumer, MediaPacket, Request, Source};
use log::{debug, info, warn};
use rtmp::chunk::{ChunkDecoder, ChunkEncoder, CSID_COMMAND, CSID_MEDIA, CSID_PROTOCOL};
use rtmp::handshake::{complex_s1s2, inspect_c1, simple_s1s2, C1Kind, C1_LEN, RTMP_VERSION};
use rtmp::message::{
    self, Command, RtmpMessage, MSG_AUDIO, MSG_COMMAND_AMF0, MSG_DATA_AMF0, MSG_VIDEO,
    USER_CONTROL_STREAM_BEGIN,
};
use runtime::{CondWaiter, Coroutine, CoroutineContext};
use shared::error::{Error, Result};
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SERVER_STREAM_ID: u32 = 1;
const WINDOW_ACK_SIZE: u32 = 2_500_000;
/// Yield to the scheduler after this many messages in the publish loop.
const PUBLISH_YIELD_EVERY: usize = 15;

/// Serves one accepted RTMP connection to completion.
pub async fn serve<S>(
    ctx: CoroutineContext,
    mut stream: S,
    peer: SocketAddr,
    sc: Rc<ServerContext>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let timeout = Duration::from_millis(sc.config.borrow().rtmp.timeout_ms);
    handshake(&ctx, &mut stream, timeout).await?;

    let mut decoder = ChunkDecoder::new();
    let mut encoder = ChunkEncoder::new();

    // connect_app
    let connect = wait_for_command(&ctx, &mut stream, &mut decoder, timeout, "connect").await?;
    let tc_url = connect
        .arguments
        .first()
        .and_then(|o| o.get("tcUrl"))
        .and_then(|v| v.as_str())
        .unwrap_or("rtmp://127.0.0.1/live")
        .to_string();

    let chunk_size = sc.config.borrow().rtmp.chunk_size;
    write_msgs(
        &ctx,
        &mut stream,
        &encoder,
        timeout,
        &[
            (RtmpMessage::window_ack_size(WINDOW_ACK_SIZE), CSID_PROTOCOL),
            (RtmpMessage::set_peer_bandwidth(WINDOW_ACK_SIZE, 2), CSID_PROTOCOL),
            (RtmpMessage::set_chunk_size(chunk_size as u32), CSID_PROTOCOL),
            (message::connect_result(connect.transaction_id), CSID_COMMAND),
        ],
    )
    .await?;
    encoder.set_chunk_size(chunk_size);

    // identify_client: commands until publish or play
    let client_id = ctx.cid();
    loop {
        ctx.pull()?;
        let msg = recv_message(&ctx, &mut stream, &mut decoder, timeout).await?;
        if !msg.is_command() {
            continue;
        }
        let cmd = msg.parse_command()?;
        match cmd.name.as_str() {
            "createStream" => {
                let reply = message::create_stream_result(cmd.transaction_id, SERVER_STREAM_ID);
                write_msgs(&ctx, &mut stream, &encoder, timeout, &[(reply, CSID_COMMAND)])
                    .await?;
            }
            "releaseStream" | "FCPublish" => {
                let reply = RtmpMessage::command(
                    0,
                    &[
                        rtmp::Amf0Value::String("_result".into()),
                        rtmp::Amf0Value::Number(cmd.transaction_id),
                        rtmp::Amf0Value::Null,
                        rtmp::Amf0Value::Undefined,
                    ],
                );
                write_msgs(&ctx, &mut stream, &encoder, timeout, &[(reply, CSID_COMMAND)])
                    .await?;
            }
            "publish" => {
                let stream_name = cmd.stream_name().unwrap_or_default().to_string();
                let mut req = Request::from_tc_url(&tc_url, &stream_name)?;
                req.ip = peer.ip().to_string();
                return publish_cycle(ctx, stream, decoder, encoder, req, client_id, sc).await;
            }
            "play" => {
                let stream_name = cmd.stream_name().unwrap_or_default().to_string();
                let mut req = Request::from_tc_url(&tc_url, &stream_name)?;
                req.ip = peer.ip().to_string();
                return play_cycle(ctx, stream, decoder, encoder, req, client_id, sc).await;
            }
            other => debug!("[{client_id}] ignore command {other} while identifying"),
        }
    }
}

async fn handshake<S>(ctx: &CoroutineContext, stream: &mut S, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let c0c1 = crate::io::read_exact(ctx, stream, 1 + C1_LEN, timeout).await?;
    if c0c1[0] != RTMP_VERSION {
        return Err(Error::HandshakeFailed(format!(
            "unsupported rtmp version {}",
            c0c1[0]
        )));
    }
    let c1 = &c0c1[1..];
    let (s1, s2) = match inspect_c1(c1)? {
        C1Kind::Complex { c1_digest } => {
            debug!("[{}] complex handshake", ctx.cid());
            complex_s1s2(&c1_digest)
        }
        C1Kind::Simple => simple_s1s2(c1),
    };
    let mut out = BytesMut::with_capacity(1 + 2 * C1_LEN);
    out.extend_from_slice(&[RTMP_VERSION]);
    out.extend_from_slice(&s1);
    out.extend_from_slice(&s2);
    ctx.timeout(timeout, stream.write_all(&out)).await?;

    let _c2 = crate::io::read_exact(ctx, stream, C1_LEN, timeout).await?;
    Ok(())
}

async fn recv_message<S: AsyncRead + Unpin>(
    ctx: &CoroutineContext,
    stream: &mut S,
    decoder: &mut ChunkDecoder,
    timeout: Duration,
) -> Result<RtmpMessage> {
    let mut chunk = [0u8; 16 * 1024];
    loop {
        if let Some(msg) = decoder.poll_message()? {
            return Ok(msg);
        }
        let n = ctx.timeout(timeout, stream.read(&mut chunk)).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        decoder.extend_from_slice(&chunk[..n]);
    }
}

async fn wait_for_command<S: AsyncRead + Unpin>(
    ctx: &CoroutineContext,
    stream: &mut S,
    decoder: &mut ChunkDecoder,
    timeout: Duration,
    name: &str,
) -> Result<Command> {
    loop {
        ctx.pull()?;
        let msg = recv_message(ctx, stream, decoder, timeout).await?;
        if !msg.is_command() {
            continue;
        }
        let cmd = msg.parse_command()?;
        if cmd.name == name {
            return Ok(cmd);
        }
    }
}

async fn write_msgs<S: AsyncWrite + Unpin>(
    ctx: &CoroutineContext,
    stream: &mut S,
    encoder: &ChunkEncoder,
    timeout: Duration,
    msgs: &[(RtmpMessage, u32)],
) -> Result<()> {
    let mut out = BytesMut::new();
    for (msg, csid) in msgs {
        out.extend_from_slice(&encoder.encode(msg, *csid));
    }
    ctx.timeout(timeout, stream.write_all(&out)).await?;
    Ok(())
}

/// Publish: a receive coroutine feeds the source; the owning coroutine
/// blocks on the error condition until the publisher leaves.
async fn publish_cycle<S>(
    ctx: CoroutineContext,
    stream: S,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    req: Request,
    client_id: u64,
    sc: Rc<ServerContext>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let timeout = Duration::from_millis(sc.config.borrow().rtmp.timeout_ms);
    let (read_half, mut write_half) = tokio::io::split(stream);

    let url = req.stream_url();
    let token = match sc.sources.acquire_publish(&url) {
        Ok(t) => t,
        Err(e) => {
            warn!("[{client_id}] publish {url}: {e}");
            let status = message::on_status(
                SERVER_STREAM_ID,
                "error",
                "NetStream.Publish.BadName",
                "stream is already publishing",
            );
            write_msgs(&ctx, &mut write_half, &encoder, timeout, &[(status, CSID_COMMAND)])
                .await?;
            return Err(e);
        }
    };

    if let Err(e) = sc.hooks.on_publish(client_id, &req).await {
        let status = message::on_status(
            SERVER_STREAM_ID,
            "error",
            "NetStream.Publish.Denied",
            "publish denied by hook",
        );
        write_msgs(&ctx, &mut write_half, &encoder, timeout, &[(status, CSID_COMMAND)])
            .await?;
        return Err(e);
    }

    let source = sc.sources.fetch_or_create(&req);
    {
        let conf = sc.config.borrow();
        source.set_atc(conf.rtmp.atc);
        source.set_gop_cache(conf.rtmp.gop_cache);
    }
    source.update_request(req.clone());
    source.on_publish();
    sc.stats.publishers.set(sc.stats.publishers.get() + 1);

    let status = message::on_status(
        SERVER_STREAM_ID,
        "status",
        "NetStream.Publish.Start",
        "publishing started",
    );
    write_msgs(&ctx, &mut write_half, &encoder, timeout, &[(status, CSID_COMMAND)])
        .await?;

    // forwarders follow the publisher's lifetime
    let mut forwarders = Vec::new();
    for dest in sc.config.borrow().forwards.clone() {
        let f = crate::forward::Forwarder::new(&dest, source.clone());
        f.start();
        forwarders.push(f);
    }

    // recv coroutine: socket -> source; errors surface via the condition
    let recv_error: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));
    let recv_done = CondWaiter::new();
    let recv_co = Rc::new(Coroutine::new(&format!("rtmp-recv-{client_id}")));
    {
        let source = source.clone();
        let recv_error = recv_error.clone();
        let recv_done = recv_done.clone();
        let sc = sc.clone();
        recv_co.start(move |rctx| async move {
            let r = publish_recv_loop(&rctx, read_half, decoder, &source, &sc).await;
            if let Err(e) = &r {
                if !e.is_interrupt() {
                    *recv_error.borrow_mut() = Some(Error::Internal(e.to_string()));
                }
            }
            recv_done.signal();
            r
        });
    }

    // the owning coroutine parks here until the receive side finishes
    loop {
        if ctx.pull().is_err() {
            break;
        }
        if recv_done.wait_timeout(Duration::from_secs(1)).await {
            break;
        }
        if recv_error.borrow().is_some() {
            break;
        }
    }
    recv_co.stop().await;

    for f in &forwarders {
        f.stop().await;
    }
    source.on_unpublish();
    drop(token);
    sc.stats
        .publishers
        .set(sc.stats.publishers.get().saturating_sub(1));
    sc.hooks.on_unpublish(client_id, &req);
    info!("[{client_id}] publish {url} done");

    let result = match recv_error.borrow_mut().take() {
        Some(e) => Err(e),
        None => Ok(()),
    };
    result
}

async fn publish_recv_loop<R: AsyncRead + Unpin>(
    ctx: &CoroutineContext,
    mut read_half: R,
    mut decoder: ChunkDecoder,
    source: &Rc<Source>,
    sc: &Rc<ServerContext>,
) -> Result<()> {
    let (timeout, mr_enabled, mr_sleep) = {
        let c = sc.config.borrow();
        (
            Duration::from_millis(c.rtmp.timeout_ms),
            c.rtmp.mr_enabled,
            Duration::from_millis(c.rtmp.mr_sleep_ms),
        )
    };
    let mut processed = 0usize;
    let mut chunk = [0u8; 64 * 1024];
    loop {
        ctx.pull()?;
        while let Some(msg) = decoder.poll_message()? {
            processed += 1;
            match msg.message_type {
                MSG_AUDIO => {
                    source.on_audio(MediaPacket::audio(
                        msg.timestamp as i64,
                        msg.payload,
                    ))?;
                }
                MSG_VIDEO => {
                    source.on_video(MediaPacket::video(
                        msg.timestamp as i64,
                        msg.payload,
                    ))?;
                }
                MSG_DATA_AMF0 => {
                    source.on_meta_data(MediaPacket::script(
                        msg.timestamp as i64,
                        msg.payload,
                    ))?;
                }
                MSG_COMMAND_AMF0 => {
                    let cmd = msg.parse_command()?;
                    if matches!(
                        cmd.name.as_str(),
                        "FCUnpublish" | "unpublish" | "closeStream" | "deleteStream"
                    ) {
                        debug!("publisher sent {}", cmd.name);
                        return Ok(());
                    }
                }
                _ => {}
            }
            // yield so consumers run even under a hot publisher
            if processed % PUBLISH_YIELD_EVERY == 0 {
                ctx.yield_now().await;
            }
        }
        // merged read trades latency for fewer, larger socket reads
        if mr_enabled {
            ctx.sleep(mr_sleep).await?;
        }
        let n = ctx.timeout(timeout, read_half.read(&mut chunk)).await?;
        if n == 0 {
            return Ok(());
        }
        sc.stats.add_bytes_in(n as u64);
        decoder.extend_from_slice(&chunk[..n]);
    }
}

/// Play: merged-write loop in the owning coroutine, control messages on a
/// queue-recv coroutine.
async fn play_cycle<S>(
    ctx: CoroutineContext,
    stream: S,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    req: Request,
    client_id: u64,
    sc: Rc<ServerContext>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let timeout = Duration::from_millis(sc.config.borrow().rtmp.timeout_ms);
    let (read_half, mut write_half) = tokio::io::split(stream);

    if let Err(e) = sc.hooks.on_play(client_id, &req).await {
        let status = message::on_status(
            SERVER_STREAM_ID,
            "error",
            "NetStream.Play.Failed",
            "play denied by hook",
        );
        write_msgs(&ctx, &mut write_half, &encoder, timeout, &[(status, CSID_COMMAND)])
            .await?;
        return Err(e);
    }

    // empty local stream: consult the backend and bounce the client
    let source = sc.sources.fetch_or_create(&req);
    if !source.is_publishing() {
        if let Some(redirect) = sc.hooks.on_forward_backend(client_id, &req).await? {
            info!("[{client_id}] redirect {} to {redirect}", req.stream_url());
            let status = message::redirect_status(SERVER_STREAM_ID, &redirect);
            write_msgs(&ctx, &mut write_half, &encoder, timeout, &[(status, CSID_COMMAND)])
                .await?;
            return Ok(());
        }
    }

    write_msgs(
        &ctx,
        &mut write_half,
        &encoder,
        timeout,
        &[
            (
                RtmpMessage::user_control(USER_CONTROL_STREAM_BEGIN, SERVER_STREAM_ID),
                CSID_PROTOCOL,
            ),
            (
                message::on_status(SERVER_STREAM_ID, "status", "NetStream.Play.Reset", "reset"),
                CSID_COMMAND,
            ),
            (
                message::on_status(SERVER_STREAM_ID, "status", "NetStream.Play.Start", "start"),
                CSID_COMMAND,
            ),
        ],
    )
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

    // queue-recv coroutine: pause/buffer-length and prompt half-close
    let stopped = Rc::new(Cell::new(false));
    let queue_co = Rc::new(Coroutine::new(&format!("rtmp-queue-{client_id}")));
    {
        let consumer = consumer.clone();
        let stopped = stopped.clone();
        queue_co.start(move |qctx| async move {
            let r = queue_recv_loop(&qctx, read_half, decoder, &consumer).await;
            stopped.set(true);
            consumer.wakeup();
            r
        });
    }

    let r = play_send_loop(
        &ctx,
        &mut write_half,
        &encoder,
        &consumer,
        &stopped,
        mw_msgs,
        mw_sleep,
        timeout,
        &sc,
    )
    .await;

    queue_co.stop().await;
    source.on_consumer_destroy(&consumer);
    sc.stats
        .players
        .set(sc.stats.players.get().saturating_sub(1));
    sc.hooks.on_stop(client_id, &req);
    info!("[{client_id}] play {} done", req.stream_url());
    r
}

async fn queue_recv_loop<R: AsyncRead + Unpin>(
    ctx: &CoroutineContext,
    mut read_half: R,
    mut decoder: ChunkDecoder,
    consumer: &Rc<Consumer>,
) -> Result<()> {
    let mut chunk = [0u8; 4096];
    loop {
        ctx.pull()?;
        while let Some(msg) = decoder.poll_message()? {
            if !msg.is_command() {
                continue;
            }
            let cmd = msg.parse_command()?;
            match cmd.name.as_str() {
                "pause" => {
                    let paused = cmd
                        .arguments
                        .iter()
                        .find_map(|v| match v {
                            rtmp::Amf0Value::Boolean(b) => Some(*b),
                            _ => None,
                        })
                        .unwrap_or(false);
                    consumer.set_paused(paused);
                    debug!("player pause={paused}");
                }
                "closeStream" | "deleteStream" => return Ok(()),
                other => debug!("player command {other} ignored"),
            }
        }
        // a long timeout here: players may send nothing for the whole
        // session, but a half-closed socket must still surface quickly
        let n = match ctx.timeout(Duration::from_secs(3600), read_half.read(&mut chunk)).await {
            Ok(n) => n,
            Err(e) if e.is_timeout() => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Ok(());
        }
        decoder.extend_from_slice(&chunk[..n]);
    }
}

#[allow(clippy::too_many_arguments)]
async fn play_send_loop<W: AsyncWrite + Unpin>(
    ctx: &CoroutineContext,
    write_half: &mut W,
    encoder: &ChunkEncoder,
    consumer: &Rc<Consumer>,
    stopped: &Rc<Cell<bool>>,
    mw_msgs: usize,
    mw_sleep: Duration,
    timeout: Duration,
    sc: &Rc<ServerContext>,
) -> Result<()> {
    let mut out = BytesMut::new();
    loop {
        ctx.pull()?;
        if stopped.get() {
            return Ok(());
        }
        // block until the producer signals, capped by the merged-write
        // window so a quiet stream still flushes on time
        consumer.wait(mw_sleep).await;

        out.clear();
        for pkt in consumer.dump_packets(mw_msgs) {
            let ts = pkt.timestamp.max(0) as u32;
            let msg = match pkt.kind {
                hub::PacketKind::Audio => {
                    RtmpMessage::audio(ts, SERVER_STREAM_ID, pkt.payload)
                }
                hub::PacketKind::Video => {
                    RtmpMessage::video(ts, SERVER_STREAM_ID, pkt.payload)
                }
                hub::PacketKind::Script => RtmpMessage {
                    message_type: MSG_DATA_AMF0,
                    timestamp: ts,
                    stream_id: SERVER_STREAM_ID,
                    payload: pkt.payload,
                },
            };
            out.extend_from_slice(&encoder.encode(&msg, CSID_MEDIA));
        }
        if out.is_empty() {
            continue;
        }
        // one syscall per burst: the merged write
        ctx.timeout(timeout, write_half.write_all(&out)).await?;
        sc.stats.add_bytes_out(out.len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerContext;
    use rtmp::amf0::Amf0Value;
    use rtmp::handshake::client_c0c1;
    use tokio::io::DuplexStream;
    use tokio::task::LocalSet;

    async fn client_handshake(client: &mut DuplexStream) {
        client.write_all(&client_c0c1()).await.unwrap();
        let mut s0s1s2 = vec![0u8; 1 + 2 * C1_LEN];
        client.read_exact(&mut s0s1s2).await.unwrap();
        client.write_all(&s0s1s2[1..1 + C1_LEN]).await.unwrap();
    }

    async fn client_send(
        client: &mut DuplexStream,
        encoder: &ChunkEncoder,
        msg: &RtmpMessage,
        csid: u32,
    ) {
        client.write_all(&encoder.encode(msg, csid)).await.unwrap();
    }

    /// Reads server messages until a command with `name` arrives.
    async fn client_wait_command(
        client: &mut DuplexStream,
        decoder: &mut ChunkDecoder,
        name: &str,
    ) -> Command {
        let mut buf = [0u8; 8192];
        loop {
            while let Some(msg) = decoder.poll_message().unwrap() {
                if msg.is_command() {
                    let cmd = msg.parse_command().unwrap();
                    if cmd.name == name {
                        return cmd;
                    }
                }
            }
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed while waiting for {name}");
            decoder.extend_from_slice(&buf[..n]);
        }
    }

    fn connect_cmd(app: &str) -> RtmpMessage {
        RtmpMessage::command(
            0,
            &[
                Amf0Value::String("connect".into()),
                Amf0Value::Number(1.0),
                Amf0Value::Object(vec![
                    ("app".into(), Amf0Value::String(app.into())),
                    (
                        "tcUrl".into(),
                        Amf0Value::String(format!("rtmp://test.host/{app}")),
                    ),
                ]),
            ],
        )
    }

    fn publish_cmd(stream: &str) -> RtmpMessage {
        RtmpMessage::command(
            SERVER_STREAM_ID,
            &[
                Amf0Value::String("publish".into()),
                Amf0Value::Number(3.0),
                Amf0Value::Null,
                Amf0Value::String(stream.into()),
                Amf0Value::String("live".into()),
            ],
        )
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_publish_feeds_source() {
        LocalSet::new()
            .run_until(async {
                let sc = ServerContext::for_tests();
                let (server_io, mut client) = tokio::io::duplex(256 * 1024);

                let co = Coroutine::new("rtmp-test");
                let sc2 = sc.clone();
                co.start(move |ctx| async move {
                    let _ = serve(ctx, server_io, peer(), sc2).await;
                    Ok(())
                });

                client_handshake(&mut client).await;
                let enc = ChunkEncoder::new();
                let mut dec = ChunkDecoder::new();
                client_send(&mut client, &enc, &connect_cmd("live"), CSID_COMMAND).await;
                client_wait_command(&mut client, &mut dec, "_result").await;
                client_send(&mut client, &enc, &publish_cmd("cam"), CSID_COMMAND).await;
                let status = client_wait_command(&mut client, &mut dec, "onStatus").await;
                assert_eq!(
                    status.arguments[1].get("code").and_then(|v| v.as_str()),
                    Some("NetStream.Publish.Start")
                );

                // push one video keyframe + one audio message
                client_send(
                    &mut client,
                    &enc,
                    &RtmpMessage::video(
                        20,
                        SERVER_STREAM_ID,
                        bytes::Bytes::from_static(&[0x17, 1, 0, 0, 0, 7]),
                    ),
                    CSID_MEDIA,
                )
                .await;
                client_send(
                    &mut client,
                    &enc,
                    &RtmpMessage::audio(
                        30,
                        SERVER_STREAM_ID,
                        bytes::Bytes::from_static(&[0xAF, 1, 9]),
                    ),
                    CSID_MEDIA,
                )
                .await;
                tokio::time::sleep(Duration::from_millis(50)).await;

                let source = sc.sources.fetch("test.host/live/cam").unwrap();
                assert!(source.is_publishing());
                // attach a consumer and verify the gop-cached media
                let consumer = source.create_consumer(30_000);
                let got = consumer.dump_packets(10);
                assert_eq!(got.len(), 2);
                assert!(got[0].is_video_keyframe());
                assert!(got[1].is_audio());

                co.stop().await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_second_publisher_rejected() {
        LocalSet::new()
            .run_until(async {
                let sc = ServerContext::for_tests();
                let _token = sc.sources.acquire_publish("test.host/live/cam").unwrap();

                let (server_io, mut client) = tokio::io::duplex(256 * 1024);
                let co = Coroutine::new("rtmp-test2");
                let sc2 = sc.clone();
                co.start(move |ctx| async move {
                    let _ = serve(ctx, server_io, peer(), sc2).await;
                    Ok(())
                });

                client_handshake(&mut client).await;
                let enc = ChunkEncoder::new();
                let mut dec = ChunkDecoder::new();
                client_send(&mut client, &enc, &connect_cmd("live"), CSID_COMMAND).await;
                client_wait_command(&mut client, &mut dec, "_result").await;
                client_send(&mut client, &enc, &publish_cmd("cam"), CSID_COMMAND).await;
                let status = client_wait_command(&mut client, &mut dec, "onStatus").await;
                assert_eq!(
                    status.arguments[1].get("code").and_then(|v| v.as_str()),
                    Some("NetStream.Publish.BadName")
                );
                co.stop().await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_play_receives_merged_writes() {
        LocalSet::new()
            .run_until(async {
                let sc = ServerContext::for_tests();
                // pre-publish a source with one cached keyframe
                let req = Request::from_tc_url("rtmp://test.host/live", "cam").unwrap();
                let source = sc.sources.fetch_or_create(&req);
                source.on_publish();
                source
                    .on_video(MediaPacket::video(
                        0,
                        bytes::Bytes::from_static(&[0x17, 1, 0, 0, 0, 1]),
                    ))
                    .unwrap();

                let (server_io, mut client) = tokio::io::duplex(256 * 1024);
                let co = Coroutine::new("rtmp-play");
                let sc2 = sc.clone();
                co.start(move |ctx| async move {
                    let _ = serve(ctx, server_io, peer(), sc2).await;
                    Ok(())
                });

                client_handshake(&mut client).await;
                let enc = ChunkEncoder::new();
                let mut dec = ChunkDecoder::new();
                client_send(&mut client, &enc, &connect_cmd("live"), CSID_COMMAND).await;
                client_wait_command(&mut client, &mut dec, "_result").await;
                client_send(
                    &mut client,
                    &enc,
                    &RtmpMessage::command(
                        SERVER_STREAM_ID,
                        &[
                            Amf0Value::String("play".into()),
                            Amf0Value::Number(4.0),
                            Amf0Value::Null,
                            Amf0Value::String("cam".into()),
                        ],
                    ),
                    CSID_COMMAND,
                )
                .await;

                // server sends Play.Reset / Play.Start then the gop
                client_wait_command(&mut client, &mut dec, "onStatus").await;

                // a live packet flows through
                source
                    .on_video(MediaPacket::video(
                        40,
                        bytes::Bytes::from_static(&[0x27, 1, 0, 0, 0, 2]),
                    ))
                    .unwrap();

                let mut got_video = 0;
                let mut buf = [0u8; 8192];
                let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
                while got_video < 2 {
                    while let Some(msg) = dec.poll_message().unwrap() {
                        if msg.is_video() {
                            got_video += 1;
                        }
                    }
                    if got_video >= 2 {
                        break;
                    }
                    let n = tokio::select! {
                        r = client.read(&mut buf) => r.unwrap(),
                        _ = tokio::time::sleep_until(deadline) => panic!("timed out"),
                    };
                    assert!(n > 0);
                    dec.extend_from_slice(&buf[..n]);
                }
                assert_eq!(got_video, 2);
                assert_eq!(source.consumer_count(), 1);

                co.stop().await;
                source.on_unpublish();
            })
            .await;
    }
}
