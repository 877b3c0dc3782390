use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamSettings {
    /// Downstream protocol; currently only "socks5".
    pub protocol: String,
    /// Address the server listens on, e.g. "0.0.0.0:1080".
    pub listen: String,
    #[serde(default)]
    pub transport: Option<TransportSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSettings {
    /// Upstream protocol: "socks5" or "direct".
    pub protocol: String,
    /// Proxy server address for protocols that relay through one.
    pub address: Option<String>,
    #[serde(default)]
    pub transport: Option<TransportSettings>,
}

/// Transport under a downstream listener or upstream client. Plain TCP when
/// absent; `kcp` switches to the framed KCP transport.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransportSettings {
    pub kcp: Option<KcpSettings>,
}

#[serde_with::serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KcpSettings {
    /// Latency/bandwidth trade-off: "", "normal", "fast" or "fast2".
    #[serde(default)]
    pub mode: String,
    /// Window sizing: "", "balance", "receive", "send", "server".
    #[serde(default)]
    pub optimize: String,
    #[serde(default)]
    pub fec: bool,
    /// FEC shard distribution "data,parity"; defaults to "10,2".
    pub fec_dist: Option<String>,
    /// Keep-alive probe interval in seconds. Must be set together with
    /// `keep_alive_timeout`.
    #[serde_as(as = "Option<serde_with::DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    pub keep_alive_interval: Option<Duration>,
    /// Idle/stall limit after which a connection is declared lost.
    #[serde_as(as = "Option<serde_with::DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    pub keep_alive_timeout: Option<Duration>,
}

/// A routing rule: targets matching any listed domain suffix or IP network
/// are handled by one of the named upstreams. An empty upstream list denies
/// the request outright.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSettings {
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    pub upstreams: Vec<String>,
}

#[serde_with::serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MiscSettings {
    /// Upstream connect timeout in seconds; defaults to 60.
    #[serde_as(as = "Option<serde_with::DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    pub connect_timeout: Option<Duration>,
    #[serde(default)]
    pub enable_monitor: bool,
    pub monitor_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub downstreams: BTreeMap<String, DownstreamSettings>,
    pub upstreams: BTreeMap<String, UpstreamSettings>,
    #[serde(default)]
    pub rules: BTreeMap<String, RuleSettings>,
    #[serde(default)]
    pub misc: MiscSettings,
}

pub fn load(path: &Path) -> anyhow::Result<Settings> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw).context("failed to parse config file")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [misc]
        connect_timeout = 0.5
        enable_monitor = true
        monitor_path = "/debug/vars"

        [downstreams.local]
        protocol = "socks5"
        listen = "127.0.0.1:1080"

        [upstreams.relay]
        protocol = "socks5"
        address = "relay.example.com:1080"

        [upstreams.relay.transport.kcp]
        mode = "fast2"
        optimize = "send"
        fec = true
        fec_dist = "10,3"
        keep_alive_interval = 10.0
        keep_alive_timeout = 40.0

        [upstreams.direct]
        protocol = "direct"

        [rules.block]
        ips = ["10.0.0.0/8"]
        domains = ["ads.example.com"]
        upstreams = []

        [rules.default]
        upstreams = ["relay"]
    "#;

    #[test]
    fn parses_full_sample() {
        let settings: Settings = toml::from_str(SAMPLE).unwrap();
        assert_eq!(
            settings.misc.connect_timeout,
            Some(Duration::from_millis(500))
        );
        assert!(settings.misc.enable_monitor);
        assert_eq!(settings.downstreams["local"].protocol, "socks5");
        assert!(settings.downstreams["local"].transport.is_none());

        let kcp = settings.upstreams["relay"]
            .transport
            .as_ref()
            .unwrap()
            .kcp
            .as_ref()
            .unwrap();
        assert_eq!(kcp.mode, "fast2");
        assert_eq!(kcp.keep_alive_interval, Some(Duration::from_secs(10)));
        assert!(kcp.fec);

        assert!(settings.rules["block"].upstreams.is_empty());
        assert_eq!(settings.rules["default"].upstreams, vec!["relay"]);
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [downstreams.d]
            protocol = "socks5"
            listen = "127.0.0.1:0"
            [upstreams.u]
            protocol = "direct"
            "#,
        )
        .unwrap();
        assert!(settings.misc.connect_timeout.is_none());
        assert!(!settings.misc.enable_monitor);
        assert!(settings.rules.is_empty());
    }
}
