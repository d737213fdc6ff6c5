//! One handshake against one address, timed.
//!
//! [`Probe`] is what the engine calls; [`Prober`] is the real implementation,
//! dispatching on [`ProbeKind`] and dialing through a [`Dialer`].
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::{ProbeKind, ScanConfig};
use crate::error::ProbeError;

pub mod dial;
pub mod http;
pub mod warp;

use dial::{DefaultDialer, Dialer};

#[async_trait]
pub trait Probe: Send + Sync {
    /// Round-trip time of a single handshake with `target`. Never retries.
    async fn probe(&self, target: SocketAddr) -> Result<Duration, ProbeError>;
}

pub struct Prober {
    config: Arc<ScanConfig>,
    dialer: Arc<dyn Dialer>,
}

impl Prober {
    pub fn new(config: Arc<ScanConfig>) -> Result<Self, ProbeError> {
        let dialer = Arc::new(DefaultDialer::new(Arc::clone(&config))?);
        Ok(Self::with_dialer(config, dialer))
    }

    pub fn with_dialer(config: Arc<ScanConfig>, dialer: Arc<dyn Dialer>) -> Self {
        Self { config, dialer }
    }
}

#[async_trait]
impl Probe for Prober {
    async fn probe(&self, target: SocketAddr) -> Result<Duration, ProbeError> {
        let dialer = self.dialer.as_ref();
        match &self.config.probe {
            ProbeKind::Tcp => {
                let start = Instant::now();
                let _stream = dialer.dial_tcp(target).await?;
                Ok(start.elapsed())
            }
            ProbeKind::Tls => {
                let start = Instant::now();
                let _tls = dialer
                    .dial_tls(target, &self.config.server_name(target.ip()))
                    .await?;
                Ok(start.elapsed())
            }
            ProbeKind::Http(opts) => http::probe(dialer, &self.config, opts, target).await,
            ProbeKind::Quic => {
                let start = Instant::now();
                let conn = dialer
                    .dial_quic(target, &self.config.server_name(target.ip()), &[b"h3"])
                    .await?;
                let rtt = start.elapsed();
                conn.close(quinn::VarInt::from_u32(0), b"");
                Ok(rtt)
            }
            ProbeKind::Warp(keys) => warp::probe(dialer, keys, &self.config, target).await,
        }
    }
}
