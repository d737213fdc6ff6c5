use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use edge_scan::config::ScanConfig;
use edge_scan::engine::{Engine, StopReason};
use edge_scan::error::ProbeError;
use edge_scan::probe::Probe;
use edge_scan::server::router;
use edge_scan::types::{AddressRecord, EngineState, PoolStatus};
use tower::ServiceExt;

/// RTT equals the last octet in milliseconds.
struct LastOctet;

#[async_trait]
impl Probe for LastOctet {
    async fn probe(&self, target: SocketAddr) -> Result<Duration, ProbeError> {
        match target.ip() {
            std::net::IpAddr::V4(v4) => Ok(Duration::from_millis(u64::from(v4.octets()[3]))),
            std::net::IpAddr::V6(_) => Err(ProbeError::Handshake("v4 only".into())),
        }
    }
}

async fn filled_engine() -> Arc<Engine> {
    let config = ScanConfig {
        cidrs: vec!["10.9.0.0/30".into()],
        queue_capacity: 4,
        target_count: Some(4),
        ..Default::default()
    };
    let engine = Arc::new(Engine::with_prober(config, Arc::new(LastOctet)));
    assert_eq!(engine.run().await, Ok(StopReason::GoalReached));
    engine
}

async fn get_json<T: serde::de::DeserializeOwned>(engine: Arc<Engine>, uri: &str) -> T {
    let res = router(engine)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["cache-control"], "no-store");
    let body = to_bytes(res.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn status_reports_best_record() {
    let engine = filled_engine().await;
    let status: PoolStatus = get_json(engine, "/api/status").await;
    assert_eq!(status.state, EngineState::Stopped);
    assert_eq!(status.probe, "http");
    assert_eq!(status.capacity, 4);
    assert_eq!(status.pooled, 4);
    assert_eq!(status.best.map(|r| r.rtt_ms), Some(0));
}

#[tokio::test]
async fn pool_honours_desc() {
    let engine = filled_engine().await;
    let asc: Vec<AddressRecord> = get_json(Arc::clone(&engine), "/api/pool").await;
    let desc: Vec<AddressRecord> = get_json(engine, "/api/pool?desc=true").await;
    assert_eq!(asc.iter().map(|r| r.rtt_ms).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert_eq!(desc.iter().map(|r| r.rtt_ms).collect::<Vec<_>>(), vec![3, 2, 1, 0]);
}

#[tokio::test]
async fn stop_endpoint_cancels_engine() {
    let engine = Arc::new(Engine::with_prober(ScanConfig::default(), Arc::new(LastOctet)));
    assert!(!engine.is_stopped());
    let res = router(Arc::clone(&engine))
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/stop")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    assert!(engine.is_stopped());
    assert_eq!(engine.run().await, Ok(StopReason::Cancelled));
}

#[tokio::test]
async fn unknown_route_is_404() {
    let engine = Arc::new(Engine::with_prober(ScanConfig::default(), Arc::new(LastOctet)));
    let res = router(engine)
        .oneshot(Request::builder().uri("/api/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
