//! Stream forwarder: republishes a local stream to another RTMP server.

use bytes::BytesMut;
use hub::request::query_value;
use hub::{MediaPacket, PacketKind, Request, Source};
use log::{info, warn};
use rtmp::amf0::Amf0Value;
use rtmp::chunk::{ChunkDecoder, ChunkEncoder, CSID_COMMAND, CSID_MEDIA};
use rtmp::handshake::{client_c0c1, C1_LEN};
use rtmp::message::{self, RtmpMessage};
use runtime::{Coroutine, CoroutineContext};
use shared::error::{Error, Result};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Builds the outbound publish URL for a forward destination.
///
/// The stream's own query rides along and the vhost lands at the end, so
/// token-authenticated edges receive everything the client sent plus the
/// originating vhost.
pub fn output_url(dest: &str, req: &Request) -> String {
    let mut params: Vec<String> = req
        .param
        .split('&')
        .filter(|kv| !kv.is_empty() && query_value(kv, "vhost").is_none())
        .map(str::to_string)
        .collect();
    params.push(format!("vhost={}", req.vhost));
    format!(
        "rtmp://{}/{}/{}?{}",
        dest,
        req.app,
        req.stream,
        params.join("&")
    )
}

/// Push client: consumes the local source and re-publishes it to `dest`.
pub struct Forwarder {
    dest: String,
    source: Rc<Source>,
    co: RefCell<Option<Rc<Coroutine>>>,
}

impl Forwarder {
    pub fn new(dest: &str, source: Rc<Source>) -> Rc<Self> {
        Rc::new(Self {
            dest: dest.to_string(),
            source,
            co: RefCell::new(None),
        })
    }

    pub fn start(self: &Rc<Self>) {
        let co = Rc::new(Coroutine::new(&format!("forward-{}", self.dest)));
        let this = Rc::clone(self);
        co.start(move |ctx| async move {
            if let Err(e) = this.cycle(&ctx).await {
                if !e.is_interrupt() {
                    warn!("forwarder to {} failed: {e}", this.dest);
                }
                return Err(e);
            }
            Ok(())
        });
        *self.co.borrow_mut() = Some(co);
    }

    pub async fn stop(&self) {
        let co = self.co.borrow_mut().take();
        if let Some(co) = co {
            co.stop().await;
        }
    }

    async fn cycle(&self, ctx: &CoroutineContext) -> Result<()> {
        let req = self.source.request();
        let url = output_url(&self.dest, &req);
        info!("[{}] forward {} -> {url}", ctx.cid(), req.stream_url());

        let timeout = Duration::from_secs(10);
        let mut stream = ctx.timeout(timeout, TcpStream::connect(&self.dest)).await?;

        // simple client handshake
        ctx.timeout(timeout, stream.write_all(&client_c0c1())).await?;
        let mut s0s1s2 = vec![0u8; 1 + 2 * C1_LEN];
        ctx.timeout(timeout, stream.read_exact(&mut s0s1s2)).await?;
        let c2 = &s0s1s2[1..1 + C1_LEN];
        ctx.timeout(timeout, stream.write_all(c2)).await?;

        let mut encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();

        // connect
        let tc_url = format!("rtmp://{}/{}", self.dest, req.app);
        let connect = RtmpMessage::command(
            0,
            &[
                Amf0Value::String("connect".into()),
                Amf0Value::Number(1.0),
                Amf0Value::Object(vec![
                    ("app".into(), Amf0Value::String(req.app.clone())),
                    ("tcUrl".into(), Amf0Value::String(tc_url)),
                    ("type".into(), Amf0Value::String("nonprivate".into())),
                ]),
            ],
        );
        ctx.timeout(timeout, stream.write_all(&encoder.encode(&connect, CSID_COMMAND)))
            .await?;
        self.expect_result(ctx, &mut stream, &mut decoder, "connect").await?;

        // bump the chunk size before media flows
        let set = RtmpMessage::set_chunk_size(60000);
        ctx.timeout(timeout, stream.write_all(&encoder.encode(&set, rtmp::chunk::CSID_PROTOCOL)))
            .await?;
        encoder.set_chunk_size(60000);

        // createStream + publish
        let create = RtmpMessage::command(
            0,
            &[
                Amf0Value::String("createStream".into()),
                Amf0Value::Number(2.0),
                Amf0Value::Null,
            ],
        );
        ctx.timeout(timeout, stream.write_all(&encoder.encode(&create, CSID_COMMAND)))
            .await?;
        let stream_id = self
            .expect_result(ctx, &mut stream, &mut decoder, "createStream")
            .await?
            .arguments
            .iter()
            .find_map(|v| v.as_number())
            .unwrap_or(1.0) as u32;

        let stream_with_param = if req.param.is_empty() {
            req.stream.clone()
        } else {
            let query: Vec<&str> = req
                .param
                .split('&')
                .filter(|kv| query_value(kv, "vhost").is_none())
                .collect();
            format!("{}?{}&vhost={}", req.stream, query.join("&"), req.vhost)
        };
        let publish = RtmpMessage::command(
            stream_id,
            &[
                Amf0Value::String("publish".into()),
                Amf0Value::Number(3.0),
                Amf0Value::Null,
                Amf0Value::String(stream_with_param),
                Amf0Value::String(req.app.clone()),
            ],
        );
        ctx.timeout(timeout, stream.write_all(&encoder.encode(&publish, CSID_COMMAND)))
            .await?;

        // relay loop; the consumer detaches on every exit path
        let consumer = self.source.create_consumer(30_000);
        let result: Result<()> = async {
            let mut out = BytesMut::new();
            loop {
                ctx.pull()?;
                if !consumer.wait(Duration::from_millis(350)).await {
                    if !self.source.is_publishing() {
                        return Ok(());
                    }
                    continue;
                }
                out.clear();
                for pkt in consumer.dump_packets(16) {
                    let msg = to_rtmp_message(&pkt, stream_id);
                    out.extend_from_slice(&encoder.encode(&msg, CSID_MEDIA));
                }
                if !out.is_empty() {
                    ctx.timeout(timeout, stream.write_all(&out)).await?;
                }
            }
        }
        .await;
        self.source.on_consumer_destroy(&consumer);
        result
    }

    async fn expect_result(
        &self,
        ctx: &CoroutineContext,
        stream: &mut TcpStream,
        decoder: &mut ChunkDecoder,
        what: &str,
    ) -> Result<message::Command> {
        let timeout = Duration::from_secs(10);
        let mut chunk = [0u8; 4096];
        loop {
            while let Some(msg) = decoder.poll_message()? {
                if !msg.is_command() {
                    continue;
                }
                let cmd = msg.parse_command()?;
                match cmd.name.as_str() {
                    "_result" => return Ok(cmd),
                    "_error" => {
                        return Err(Error::RtmpCommand(format!("{what} rejected upstream")))
                    }
                    _ => continue,
                }
            }
            let n = ctx.timeout(timeout, stream.read(&mut chunk)).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            decoder.extend_from_slice(&chunk[..n]);
        }
    }
}

fn to_rtmp_message(pkt: &MediaPacket, stream_id: u32) -> RtmpMessage {
    let ts = pkt.timestamp.max(0) as u32;
    match pkt.kind {
        PacketKind::Audio => RtmpMessage::audio(ts, stream_id, pkt.payload.clone()),
        PacketKind::Video => RtmpMessage::video(ts, stream_id, pkt.payload.clone()),
        PacketKind::Script => RtmpMessage {
            message_type: rtmp::message::MSG_DATA_AMF0,
            timestamp: ts,
            stream_id,
            payload: pkt.payload.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_url_with_tokens() {
        let req = Request::from_tc_url(
            "rtmp://in.host/live?vhost=test.vhost",
            "stream1?sdkappid=1007&userid=5fe6e61e&usersig=eJyToken123",
        )
        .unwrap();
        assert_eq!(
            output_url("127.0.0.1:19350", &req),
            "rtmp://127.0.0.1:19350/live/stream1?sdkappid=1007&userid=5fe6e61e&usersig=eJyToken123&vhost=test.vhost"
        );
    }

    #[test]
    fn test_output_url_no_params() {
        let req = Request::from_tc_url("rtmp://h/live", "cam").unwrap();
        assert_eq!(
            output_url("origin:1935", &req),
            "rtmp://origin:1935/live/cam?vhost=h"
        );
    }
}
