//! Server configuration: a toml file with per-protocol sections, validated
//! at startup, diffed on reload.

use serde::Deserialize;
use shared::error::{Error, Result};
use std::path::Path;

fn default_rtmp_listen() -> String {
    "0.0.0.0:1935".into()
}
fn default_http_listen() -> String {
    "0.0.0.0:8080".into()
}
fn default_rtc_listen() -> String {
    "0.0.0.0:8000".into()
}
fn default_srt_listen() -> String {
    "0.0.0.0:10080".into()
}
fn default_gb_listen() -> String {
    "0.0.0.0:9000".into()
}
fn default_chunk_size() -> usize {
    60000
}
fn default_queue_size_ms() -> i64 {
    30_000
}
fn default_mw_msgs() -> usize {
    8
}
fn default_mw_sleep_ms() -> u64 {
    350
}
fn default_mr_sleep_ms() -> u64 {
    350
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}
fn default_candidate() -> String {
    "127.0.0.1".into()
}
fn default_dtls_role() -> String {
    "passive".into()
}
fn default_srt_latency_ms() -> u64 {
    120
}
fn default_source_idle_secs() -> u64 {
    30
}
fn default_grace_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RtmpConfig {
    #[serde(default = "default_rtmp_listen")]
    pub listen: String,
    /// RTMPS listener; requires `tls_cert`/`tls_key`.
    #[serde(default)]
    pub tls_listen: Option<String>,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub atc: bool,
    #[serde(default = "default_true")]
    pub gop_cache: bool,
    #[serde(default = "default_queue_size_ms")]
    pub queue_size_ms: i64,
    /// Max packets per merged write burst.
    #[serde(default = "default_mw_msgs")]
    pub mw_msgs: usize,
    /// Max wait for a merged write burst to fill.
    #[serde(default = "default_mw_sleep_ms")]
    pub mw_sleep_ms: u64,
    /// Merged read: sleep between publisher socket reads.
    #[serde(default)]
    pub mr_enabled: bool,
    #[serde(default = "default_mr_sleep_ms")]
    pub mr_sleep_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults")
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "default_http_listen")]
    pub listen: String,
    /// Rolling seconds of audio kept for fast AAC/MP3 startup.
    #[serde(default = "default_true")]
    pub fast_cache: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults")
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RtcConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rtc_listen")]
    pub listen: String,
    /// Candidate IP advertised in SDP answers.
    #[serde(default = "default_candidate")]
    pub candidate: String,
    /// `passive` answers DTLS, `active` initiates with ARQ.
    #[serde(default = "default_dtls_role")]
    pub dtls_role: String,
}

impl Default for RtcConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults")
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SrtConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_srt_listen")]
    pub listen: String,
    #[serde(default = "default_srt_latency_ms")]
    pub latency_ms: u64,
}

impl Default for SrtConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults")
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GbConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_gb_listen")]
    pub listen: String,
}

impl Default for GbConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults")
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_connect: Vec<String>,
    #[serde(default)]
    pub on_publish: Vec<String>,
    #[serde(default)]
    pub on_unpublish: Vec<String>,
    #[serde(default)]
    pub on_play: Vec<String>,
    #[serde(default)]
    pub on_stop: Vec<String>,
    #[serde(default)]
    pub on_close: Vec<String>,
    #[serde(default)]
    pub on_forward_backend: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub rtmp: RtmpConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub rtc: RtcConfig,
    #[serde(default)]
    pub srt: SrtConfig,
    #[serde(default)]
    pub gb: GbConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    /// Forward destinations, `host:port`.
    #[serde(default)]
    pub forwards: Vec<String>,
    #[serde(default = "default_source_idle_secs")]
    pub source_idle_secs: u64,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    #[serde(default)]
    pub pid_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("defaults")
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;
        let config: Config =
            toml::from_str(&text).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<()> {
        for (name, listen) in [
            ("rtmp.listen", &self.rtmp.listen),
            ("http.listen", &self.http.listen),
        ] {
            listen
                .parse::<std::net::SocketAddr>()
                .map_err(|_| Error::ConfigInvalid(format!("{name}: bad address {listen}")))?;
        }
        if self.rtmp.tls_listen.is_some()
            && (self.rtmp.tls_cert.is_none() || self.rtmp.tls_key.is_none())
        {
            return Err(Error::ConfigInvalid(
                "rtmp.tls_listen requires tls_cert and tls_key".into(),
            ));
        }
        if !matches!(self.rtc.dtls_role.as_str(), "passive" | "active") {
            return Err(Error::ConfigInvalid(format!(
                "rtc.dtls_role must be passive or active, got {}",
                self.rtc.dtls_role
            )));
        }
        if self.rtmp.mw_msgs == 0 {
            return Err(Error::ConfigInvalid("rtmp.mw_msgs must be >= 1".into()));
        }
        for dest in &self.forwards {
            if !dest.contains(':') {
                return Err(Error::ConfigInvalid(format!(
                    "forward destination must be host:port, got {dest}"
                )));
            }
        }
        Ok(())
    }

    /// Names of directives that differ between `self` and `next`.
    ///
    /// Listener-bound directives are reported but never hot-applied; the
    /// server logs them and keeps the running listeners until restart.
    pub fn diff(&self, next: &Config) -> Vec<String> {
        let mut changed = Vec::new();
        if self.rtmp.listen != next.rtmp.listen {
            changed.push("rtmp.listen".to_string());
        }
        if self.http.listen != next.http.listen {
            changed.push("http.listen".to_string());
        }
        if self.rtc.listen != next.rtc.listen {
            changed.push("rtc.listen".to_string());
        }
        if self.rtmp.gop_cache != next.rtmp.gop_cache {
            changed.push("rtmp.gop_cache".to_string());
        }
        if self.rtmp.queue_size_ms != next.rtmp.queue_size_ms {
            changed.push("rtmp.queue_size_ms".to_string());
        }
        if (self.rtmp.mw_msgs, self.rtmp.mw_sleep_ms)
            != (next.rtmp.mw_msgs, next.rtmp.mw_sleep_ms)
        {
            changed.push("rtmp.merged_write".to_string());
        }
        if self.hooks != next.hooks {
            changed.push("hooks".to_string());
        }
        if self.forwards != next.forwards {
            changed.push("forwards".to_string());
        }
        changed
    }

    /// Whether a changed directive can be applied without listener restart.
    pub fn hot_reloadable(directive: &str) -> bool {
        !matches!(directive, "rtmp.listen" | "http.listen" | "rtc.listen")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let c = Config::default();
        c.check().unwrap();
        assert_eq!(c.rtmp.listen, "0.0.0.0:1935");
        assert_eq!(c.rtmp.queue_size_ms, 30_000);
        assert!(c.rtmp.gop_cache);
    }

    #[test]
    fn test_parse_overrides() {
        let c: Config = toml::from_str(
            r#"
            forwards = ["127.0.0.1:19351"]

            [rtmp]
            listen = "0.0.0.0:19350"
            gop_cache = false
            mw_msgs = 16

            [hooks]
            on_publish = ["http://127.0.0.1:8085/api/v1/streams"]
            "#,
        )
        .unwrap();
        c.check().unwrap();
        assert_eq!(c.rtmp.listen, "0.0.0.0:19350");
        assert!(!c.rtmp.gop_cache);
        assert_eq!(c.rtmp.mw_msgs, 16);
        assert_eq!(c.hooks.on_publish.len(), 1);
        assert_eq!(c.forwards, vec!["127.0.0.1:19351"]);
    }

    #[test]
    fn test_shipped_example_config_loads() {
        let path = std::path::Path::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../conf/rill.toml"
        ));
        let c = Config::load(path).unwrap();
        assert_eq!(c.rtmp.listen, "0.0.0.0:1935");
        assert!(!c.rtc.enabled);
    }

    #[test]
    fn test_bad_listen_rejected() {
        let c: Config = toml::from_str("[rtmp]\nlisten = \"nonsense\"").unwrap();
        assert!(c.check().is_err());
    }

    #[test]
    fn test_tls_requires_cert() {
        let c: Config = toml::from_str("[rtmp]\ntls_listen = \"0.0.0.0:443\"").unwrap();
        assert!(c.check().is_err());
    }

    #[test]
    fn test_diff_classifies_reloadable() {
        let a = Config::default();
        let mut b = a.clone();
        b.rtmp.listen = "0.0.0.0:2000".into();
        b.rtmp.gop_cache = false;
        let changed = a.diff(&b);
        assert!(changed.contains(&"rtmp.listen".to_string()));
        assert!(changed.contains(&"rtmp.gop_cache".to_string()));
        assert!(!Config::hot_reloadable("rtmp.listen"));
        assert!(Config::hot_reloadable("rtmp.gop_cache"));
    }
}
