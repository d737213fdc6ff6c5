use std::fmt;

use thiserror::Error;

/// Problems with a [`ScanConfig`](crate::config::ScanConfig) that make a scan impossible.
///
/// These are never retried: the engine refuses to start.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no CIDR blocks configured")]
    EmptyCidrList,
    #[error("invalid CIDR or address: {0}")]
    InvalidCidr(String),
    #[error("both IPv4 and IPv6 are disabled")]
    NoAddressFamily,
    #[error("no CIDR block matches the enabled address families")]
    NoUsableBlocks,
    #[error("invalid {field}: {reason}")]
    InvalidKey { field: &'static str, reason: String },
    #[error("queue capacity must be at least 1")]
    ZeroCapacity,
    #[error("target count {target} exceeds queue capacity {capacity}")]
    TargetExceedsCapacity { target: usize, capacity: usize },
    #[error("tunnel port set is empty")]
    EmptyPortSet,
    #[error("cannot set up probe client: {0}")]
    ClientSetup(String),
}

/// Which timeout a probe ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    Connect,
    Handshake,
    Response,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Handshake => "handshake",
            Self::Response => "response",
        })
    }
}

/// Failure of a single probe. Timeouts mean "no response"; everything else
/// is an I/O or protocol failure worth reporting.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{stage} timed out")]
    Timeout { stage: TimeoutStage },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("quic error: {0}")]
    Quic(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("handshake rejected: {0}")]
    Handshake(String),
}

impl ProbeError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

impl From<native_tls::Error> for ProbeError {
    fn from(e: native_tls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}

impl From<hyper::Error> for ProbeError {
    fn from(e: hyper::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<h3::Error> for ProbeError {
    fn from(e: h3::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<http::Error> for ProbeError {
    fn from(e: http::Error) -> Self {
        Self::Http(e.to_string())
    }
}
