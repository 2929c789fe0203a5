//! Parsed stream identity shared by every protocol front-end.

use shared::error::{Error, Result};

pub const DEFAULT_VHOST: &str = "__defaultVhost__";
pub const DEFAULT_RTMP_PORT: u16 = 1935;

/// Identity of one stream request: who is asking for what, over which
/// schema. Cloned per consumer so each attachment carries an independent
/// auth context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub vhost: String,
    pub app: String,
    pub stream: String,
    /// Query string without the leading `?`, empty when absent.
    pub param: String,
    pub tc_url: String,
    pub schema: String,
    pub host: String,
    pub port: u16,
    /// Client peer IP, filled in by the connection.
    pub ip: String,
    pub protocol: String,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            vhost: DEFAULT_VHOST.to_string(),
            app: "live".to_string(),
            stream: String::new(),
            param: String::new(),
            tc_url: String::new(),
            schema: "rtmp".to_string(),
            host: String::new(),
            port: DEFAULT_RTMP_PORT,
            ip: String::new(),
            protocol: "rtmp".to_string(),
        }
    }
}

impl Request {
    /// Parses an RTMP tcUrl (`rtmp://host[:port]/app[?param]`) plus the
    /// stream name the client passed to publish/play (which may carry its
    /// own query).
    pub fn from_tc_url(tc_url: &str, stream: &str) -> Result<Self> {
        let mut req = Request {
            tc_url: tc_url.to_string(),
            ..Default::default()
        };

        let rest = tc_url
            .split_once("://")
            .map(|(schema, rest)| {
                req.schema = schema.to_string();
                rest
            })
            .ok_or_else(|| Error::RtmpCommand(format!("tcUrl without schema: {tc_url}")))?;

        let (authority, app_part) = rest.split_once('/').unwrap_or((rest, "live"));
        let (host, port) = match authority.split_once(':') {
            Some((h, p)) => (
                h,
                p.parse::<u16>()
                    .map_err(|_| Error::RtmpCommand(format!("bad port in {tc_url}")))?,
            ),
            None => (authority, DEFAULT_RTMP_PORT),
        };
        req.host = host.to_string();
        req.port = port;
        // vhost defaults to the connect host unless ?vhost= overrides it
        req.vhost = host.to_string();

        let (app, app_param) = split_param(app_part);
        req.app = app.to_string();
        let (stream_name, stream_param) = split_param(stream);
        req.stream = stream_name.to_string();

        let mut params = Vec::new();
        if !app_param.is_empty() {
            params.push(app_param);
        }
        if !stream_param.is_empty() {
            params.push(stream_param);
        }
        req.param = params.join("&");

        if let Some(vhost) = query_value(&req.param, "vhost") {
            if !vhost.is_empty() {
                req.vhost = vhost.to_string();
            }
        }
        Ok(req)
    }

    /// Unique stream URL: `vhost/app/stream`.
    pub fn stream_url(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }

    /// `app/stream` with the query carried along, for log lines.
    pub fn stream_with_param(&self) -> String {
        if self.param.is_empty() {
            format!("{}/{}", self.app, self.stream)
        } else {
            format!("{}/{}?{}", self.app, self.stream, self.param)
        }
    }
}

fn split_param(s: &str) -> (&str, &str) {
    match s.split_once('?') {
        Some((name, param)) => (name, param),
        None => (s, ""),
    }
}

/// Value of `key` in an `a=b&c=d` query string.
pub fn query_value<'a>(param: &'a str, key: &str) -> Option<&'a str> {
    param.split('&').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        (k == key).then_some(v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_tc_url() {
        let req = Request::from_tc_url("rtmp://example.com/live", "cam1").unwrap();
        assert_eq!(req.schema, "rtmp");
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 1935);
        assert_eq!(req.app, "live");
        assert_eq!(req.stream, "cam1");
        assert_eq!(req.vhost, "example.com");
        assert_eq!(req.stream_url(), "example.com/live/cam1");
    }

    #[test]
    fn test_port_and_vhost_override() {
        let req =
            Request::from_tc_url("rtmp://10.0.0.5:19350/live?vhost=test.vhost", "s").unwrap();
        assert_eq!(req.port, 19350);
        assert_eq!(req.vhost, "test.vhost");
        assert_eq!(req.stream_url(), "test.vhost/live/s");
    }

    #[test]
    fn test_stream_query_merged() {
        let req = Request::from_tc_url(
            "rtmp://h/live?vhost=test.vhost",
            "stream1?sdkappid=1007&userid=5fe6e61e",
        )
        .unwrap();
        assert_eq!(req.stream, "stream1");
        assert_eq!(req.param, "vhost=test.vhost&sdkappid=1007&userid=5fe6e61e");
        assert_eq!(query_value(&req.param, "sdkappid"), Some("1007"));
    }

    #[test]
    fn test_no_schema_fails() {
        assert!(Request::from_tc_url("example.com/live", "s").is_err());
    }

    #[test]
    fn test_clone_is_independent() {
        let a = Request::from_tc_url("rtmp://h/live", "s").unwrap();
        let mut b = a.clone();
        b.ip = "1.2.3.4".into();
        assert!(a.ip.is_empty());
    }
}
