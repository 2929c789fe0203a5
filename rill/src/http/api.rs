//! HTTP API and signaling endpoints: `/api/v1/*`, `/rtc/v1/publish|play`.

use crate::http::{write_response, HttpRequest};
use crate::server::ServerContext;
use crate::webrtc::server::RtcServer;
use hub::request::query_value;
use log::warn;
use runtime::CoroutineContext;
use serde_json::json;
use shared::error::{Error, Result};
use std::net::SocketAddr;
use std::rc::Rc;
use tokio::io::AsyncWrite;

pub async fn handle<S: AsyncWrite + Unpin>(
    ctx: &CoroutineContext,
    io: &mut S,
    peer: SocketAddr,
    req: HttpRequest,
    sc: Rc<ServerContext>,
    rtc: Option<Rc<RtcServer>>,
) -> Result<()> {
    let body = match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/api/v1/versions") => json!({
            "code": 0,
            "server": env!("CARGO_PKG_NAME"),
            "data": { "version": env!("CARGO_PKG_VERSION") }
        }),
        ("GET", "/api/v1/summaries") => sc.stats.summary_json(),
        ("GET", "/api/v1/streams") => {
            json!({ "code": 0, "data": { "streams": sc.sources.len() } })
        }
        ("POST", "/gb/v1/publish") => {
            // media arrives on the TCP channel; signaling only learns where
            let c = sc.config.borrow();
            if c.gb.enabled {
                json!({ "code": 0, "data": { "listen": c.gb.listen } })
            } else {
                json!({ "code": 404, "error": "gb28181 disabled" })
            }
        }
        ("POST", "/rtc/v1/publish") | ("POST", "/rtc/v1/play") => {
            let Some(rtc) = rtc else {
                return write_response(ctx, io, 404, "application/json", b"{\"code\":404}")
                    .await;
            };
            let parsed: serde_json::Value = serde_json::from_slice(&req.body)
                .map_err(|e| Error::HttpParse(format!("signaling body: {e}")))?;
            let sdp = parsed["sdp"].as_str().unwrap_or_default();
            let streamurl = parsed["streamurl"].as_str().unwrap_or_default();
            let client_ip = parsed["clientip"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| peer.ip().to_string());

            let result = if req.path.ends_with("publish") {
                rtc.handle_publish(streamurl, sdp, &client_ip).await
            } else {
                rtc.handle_play(streamurl, sdp, &client_ip).await
            };
            match result {
                Ok((answer, session_id)) => json!({
                    "code": 0,
                    "server": env!("CARGO_PKG_NAME"),
                    "sdp": answer,
                    "sessionid": session_id,
                }),
                Err(e) => {
                    warn!("rtc signaling {} failed: {e}", req.path);
                    let code = match e {
                        Error::HttpStatus(s) => s,
                        Error::StreamBusy(_) => 409,
                        _ => 400,
                    };
                    json!({ "code": code, "error": e.to_string() })
                }
            }
        }
        _ => json!({ "code": 404 }),
    };

    let mut text = serde_json::to_string(&body)
        .map_err(|e| Error::Internal(format!("api json: {e}")))?;
    // JSONP for dashboard pages
    let mut content_type = "application/json";
    if req.method == "GET" {
        if let Some(callback) = query_value(&req.query, "callback") {
            text = format!("{callback}({text})");
            content_type = "application/javascript";
        }
    }
    write_response(ctx, io, 200, content_type, text.as_bytes()).await
}
