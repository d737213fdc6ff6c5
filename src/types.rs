use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One responsive address as it sits in the pool.
///
/// The port is the one that was actually probed and is meant to be reused
/// verbatim by whoever consumes the record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub ip: IpAddr,
    pub port: u16,
    pub rtt_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub discovered_at: OffsetDateTime,
}

impl AddressRecord {
    pub fn new(ip: IpAddr, port: u16, rtt: Duration) -> Self {
        Self::observed_at(ip, port, rtt, OffsetDateTime::now_utc())
    }

    pub fn observed_at(ip: IpAddr, port: u16, rtt: Duration, at: OffsetDateTime) -> Self {
        Self {
            ip,
            port,
            rtt_ms: u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX),
            discovered_at: at,
        }
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_millis(self.rtt_ms)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Time elapsed since discovery, zero if the clock went backwards.
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        Duration::try_from(now - self.discovered_at).unwrap_or(Duration::ZERO)
    }
}

/// Engine lifecycle as seen from outside.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Constructed, `run` not called yet.
    #[default]
    Ready,
    /// Pulling batches and probing.
    Running,
    /// Pool is full; expiring stale records between pauses.
    Sweeping,
    Stopped,
}

/// Pool summary served by the status API.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PoolStatus {
    pub state: EngineState,
    pub probe: String,
    pub capacity: usize,
    pub pooled: usize,
    pub best: Option<AddressRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shape() {
        let at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let rec = AddressRecord::observed_at(
            "162.159.192.7".parse().unwrap(),
            2408,
            Duration::from_micros(87_900),
            at,
        );
        assert_eq!(rec.rtt_ms, 87);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["ip"], "162.159.192.7");
        assert_eq!(json["port"], 2408);
        assert_eq!(json["discovered_at"], "2023-11-14T22:13:20Z");
    }

    #[test]
    fn age_never_negative() {
        let at = OffsetDateTime::now_utc();
        let rec = AddressRecord::observed_at("1.1.1.1".parse().unwrap(), 443, Duration::ZERO, at);
        assert_eq!(rec.age(at - time::Duration::seconds(5)), Duration::ZERO);
        assert_eq!(rec.age(at + time::Duration::seconds(5)), Duration::from_secs(5));
    }
}
