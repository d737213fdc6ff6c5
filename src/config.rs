//! Scan configuration.
//!
//! A [`ScanConfig`] is built once, validated, and then shared read-only
//! (behind an `Arc`) by the engine, the prober and the dialers.
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::ConfigError;
use crate::ports::{random_port, WARP_PORTS};
use crate::types::AddressRecord;

/// Cloudflare's published edge ranges, the default search space.
pub const DEFAULT_CF_RANGES: &[&str] = &[
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "104.16.0.0/12",
    "108.162.192.0/18",
    "131.0.72.0/22",
    "141.101.64.0/18",
    "162.158.0.0/15",
    "172.64.0.0/13",
    "173.245.48.0/20",
    "188.114.96.0/20",
    "190.93.240.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "2400:cb00::/32",
    "2405:8100::/32",
    "2405:b500::/32",
    "2606:4700::/32",
    "2803:f800::/32",
    "2c0f:f248::/32",
    "2a06:98c0::/29",
];

/// Ranges WARP endpoints live in.
pub const DEFAULT_WARP_RANGES: &[&str] = &[
    "8.6.112.0/24",
    "8.34.70.0/24",
    "8.34.146.0/24",
    "8.35.211.0/24",
    "8.39.125.0/24",
    "8.39.204.0/24",
    "8.47.69.0/24",
    "162.159.192.0/24",
    "162.159.193.0/24",
    "162.159.195.0/24",
    "188.114.96.0/24",
    "188.114.97.0/24",
    "188.114.98.0/24",
    "188.114.99.0/24",
    "2606:4700:d0::/48",
    "2606:4700:d1::/48",
];

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Invoked with the full ordered pool after every structural change.
pub type ChangeHook = Arc<dyn Fn(&[AddressRecord]) + Send + Sync>;

/// Version the TLS handshake is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    #[default]
    Tls13,
}

/// Transport the HTTP probe speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersion {
    #[default]
    Http1,
    /// Offered through ALPN; falls back to HTTP/1.1 when the server declines.
    Http2,
    Http3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpOptions {
    pub version: HttpVersion,
    pub path: String,
    pub user_agent: String,
    pub referrer: Option<String>,
    pub disable_compression: bool,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            version: HttpVersion::Http1,
            path: "/".into(),
            user_agent: DEFAULT_USER_AGENT.into(),
            referrer: None,
            disable_compression: false,
        }
    }
}

/// Key material for the WireGuard handshake probe.
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelKeys {
    pub private_key: [u8; 32],
    pub peer_public_key: [u8; 32],
    pub preshared_key: Option<[u8; 32]>,
    /// Destination ports; one is picked at random per probe.
    pub ports: Vec<u16>,
}

impl TunnelKeys {
    /// Decode base64 keys as printed by `wg genkey` / WARP registration.
    pub fn from_base64(
        private_key: &str,
        peer_public_key: &str,
        preshared_key: Option<&str>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            private_key: decode_key("private key", private_key)?,
            peer_public_key: decode_key("peer public key", peer_public_key)?,
            preshared_key: preshared_key
                .filter(|k| !k.trim().is_empty())
                .map(|k| decode_key("preshared key", k))
                .transpose()?,
            ports: WARP_PORTS.to_vec(),
        })
    }
}

impl fmt::Debug for TunnelKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelKeys")
            .field("peer_public_key", &STANDARD.encode(self.peer_public_key))
            .field("preshared_key", &self.preshared_key.map(|_| "<redacted>"))
            .field("ports", &self.ports.len())
            .finish_non_exhaustive()
    }
}

fn decode_key(field: &'static str, value: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|e| ConfigError::InvalidKey { field, reason: e.to_string() })?;
    bytes.try_into().map_err(|b: Vec<u8>| ConfigError::InvalidKey {
        field,
        reason: format!("expected 32 bytes, got {}", b.len()),
    })
}

/// The handshake a candidate address must complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    Tcp,
    Tls,
    Http(HttpOptions),
    Quic,
    Warp(TunnelKeys),
}

impl ProbeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::Http(opts) => match opts.version {
                HttpVersion::Http1 => "http",
                HttpVersion::Http2 => "http2",
                HttpVersion::Http3 => "http3",
            },
            Self::Quic => "quic",
            Self::Warp(_) => "warp",
        }
    }
}

#[derive(Clone)]
pub struct ScanConfig {
    /// CIDR blocks (or bare addresses) to draw candidates from.
    pub cidrs: Vec<String>,
    pub use_ipv4: bool,
    pub use_ipv6: bool,
    pub probe: ProbeKind,
    /// Destination port for every probe kind except WARP.
    pub port: u16,
    /// SNI / Host override; the target IP is used when unset.
    pub hostname: Option<String>,
    pub insecure_skip_verify: bool,
    pub tls_version: TlsVersion,
    /// Acceptable-latency ceiling.
    pub max_rtt: Duration,
    pub queue_capacity: usize,
    pub queue_ttl: Duration,
    /// Stop on our own once this many addresses qualify.
    pub target_count: Option<usize>,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Wait for an HTTP response head once the transport is up.
    pub response_timeout: Duration,
    pub batch_size: usize,
    /// Probes in flight at once; 1 probes a batch sequentially.
    pub concurrency: usize,
    pub idle_interval: Duration,
    pub backoff: Duration,
    pub on_change: Option<ChangeHook>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            cidrs: DEFAULT_CF_RANGES.iter().map(|s| s.to_string()).collect(),
            use_ipv4: true,
            use_ipv6: false,
            probe: ProbeKind::Http(HttpOptions::default()),
            port: 443,
            hostname: Some("www.cloudflare.com".into()),
            insecure_skip_verify: true,
            tls_version: TlsVersion::Tls13,
            max_rtt: Duration::from_millis(400),
            queue_capacity: 8,
            queue_ttl: Duration::from_secs(30),
            target_count: None,
            connect_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(1),
            batch_size: 64,
            concurrency: 16,
            idle_interval: Duration::from_millis(200),
            backoff: Duration::from_secs(2),
            on_change: None,
        }
    }
}

impl fmt::Debug for ScanConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanConfig")
            .field("cidrs", &self.cidrs.len())
            .field("use_ipv4", &self.use_ipv4)
            .field("use_ipv6", &self.use_ipv6)
            .field("probe", &self.probe)
            .field("port", &self.port)
            .field("hostname", &self.hostname)
            .field("tls_version", &self.tls_version)
            .field("max_rtt", &self.max_rtt)
            .field("queue_capacity", &self.queue_capacity)
            .field("queue_ttl", &self.queue_ttl)
            .field("target_count", &self.target_count)
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("response_timeout", &self.response_timeout)
            .field("batch_size", &self.batch_size)
            .field("concurrency", &self.concurrency)
            .field("on_change", &self.on_change.is_some())
            .finish_non_exhaustive()
    }
}

impl ScanConfig {
    /// Check everything that can be checked without touching the network.
    /// CIDR syntax is checked when the address iterator is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cidrs.is_empty() {
            return Err(ConfigError::EmptyCidrList);
        }
        if !self.use_ipv4 && !self.use_ipv6 {
            return Err(ConfigError::NoAddressFamily);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if let Some(target) = self.target_count {
            if target > self.queue_capacity {
                return Err(ConfigError::TargetExceedsCapacity {
                    target,
                    capacity: self.queue_capacity,
                });
            }
        }
        if let ProbeKind::Warp(keys) = &self.probe {
            if keys.ports.is_empty() {
                return Err(ConfigError::EmptyPortSet);
            }
            if keys.private_key == [0u8; 32] {
                return Err(ConfigError::InvalidKey {
                    field: "private key",
                    reason: "all-zero key".into(),
                });
            }
        }
        Ok(())
    }

    /// Port to probe next. WARP picks one from its port set every time.
    pub fn probe_port(&self) -> u16 {
        match &self.probe {
            ProbeKind::Warp(keys) => random_port(&keys.ports),
            _ => self.port,
        }
    }

    /// SNI / Host value for a target.
    pub fn server_name(&self, ip: IpAddr) -> String {
        self.hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| ip.to_string())
    }

    /// ALPN protocols offered on TLS connections.
    pub fn alpn(&self) -> Vec<&'static str> {
        match &self.probe {
            ProbeKind::Http(HttpOptions { version: HttpVersion::Http2, .. }) => vec!["h2", "http/1.1"],
            _ => vec!["http/1.1"],
        }
    }
}
