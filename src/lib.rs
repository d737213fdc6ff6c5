//! Continuous discovery of responsive, low-latency addresses in large IP
//! ranges, probed over TCP, TLS, HTTP/1.1-3, QUIC or a WireGuard handshake.
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod netdetect;
pub mod ports;
pub mod probe;
pub mod queue;
pub mod ranges;
pub mod server;
pub mod types;
