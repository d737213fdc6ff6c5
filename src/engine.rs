//! The discover → probe → retain → expire loop.
//!
//! [`Engine::run`] drives everything from a single task: it pulls a batch
//! from the [`AddressIterator`] whenever the pool wants more candidates,
//! fans the probes out over a `JoinSet` bounded by a semaphore, and is the
//! only writer of the [`ResponsiveQueue`]. Callers read the pool at any time
//! through [`Engine::available_ips`].
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ScanConfig;
use crate::error::{ConfigError, ProbeError};
use crate::probe::{Probe, Prober};
use crate::queue::ResponsiveQueue;
use crate::ranges::AddressIterator;
use crate::types::{AddressRecord, EngineState, PoolStatus};

/// Why [`Engine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop` was called or the run deadline passed.
    Cancelled,
    /// The configured target count of qualifying addresses was reached.
    GoalReached,
}

type ProbeOutcome = (SocketAddr, Result<Duration, ProbeError>);

pub struct Engine {
    config: Arc<ScanConfig>,
    queue: Arc<ResponsiveQueue>,
    prober: Option<Arc<dyn Probe>>,
    cancel: CancellationToken,
    state: Mutex<EngineState>,
}

impl Engine {
    /// Engine probing with the real network prober built from `config`.
    pub fn new(config: ScanConfig) -> Self {
        Self::build(config, None)
    }

    /// Engine probing through a caller-supplied [`Probe`].
    pub fn with_prober(config: ScanConfig, prober: Arc<dyn Probe>) -> Self {
        Self::build(config, Some(prober))
    }

    fn build(config: ScanConfig, prober: Option<Arc<dyn Probe>>) -> Self {
        let queue = Arc::new(ResponsiveQueue::from_config(&config));
        Self {
            config: Arc::new(config),
            queue,
            prober,
            cancel: CancellationToken::new(),
            state: Mutex::new(EngineState::Ready),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, next: EngineState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state != next {
            debug!("engine {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Ask the loop to stop. Safe to call any number of times, from anywhere.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once a stop was requested or the goal was reached.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    /// Current pool, best RTT first unless `descending`.
    pub fn available_ips(&self, descending: bool) -> Vec<AddressRecord> {
        self.queue.snapshot(descending)
    }

    pub fn status(&self) -> PoolStatus {
        let pool = self.queue.snapshot(false);
        PoolStatus {
            state: self.state(),
            probe: self.config.probe.name().to_string(),
            capacity: self.queue.capacity(),
            pooled: pool.len(),
            best: pool.into_iter().next(),
        }
    }

    /// Like [`run`](Self::run), but cancels itself once `limit` has elapsed.
    pub async fn run_for(&self, limit: Duration) -> Result<StopReason, ConfigError> {
        let cancel = self.cancel.clone();
        let timer = tokio::spawn(async move {
            time::sleep(limit).await;
            cancel.cancel();
        });
        let res = self.run().await;
        timer.abort();
        res
    }

    /// Scan until stopped or until the target count is reached.
    ///
    /// Configuration problems are returned before any probe is sent; nothing
    /// that happens afterwards (failed probes, exhausted ranges) ends the run.
    pub async fn run(&self) -> Result<StopReason, ConfigError> {
        self.config.validate()?;
        let mut addresses = AddressIterator::from_config(&self.config)?;
        let prober = match &self.prober {
            Some(p) => Arc::clone(p),
            None => Arc::new(
                Prober::new(Arc::clone(&self.config))
                    .map_err(|e| ConfigError::ClientSetup(e.to_string()))?,
            ),
        };

        info!(
            "scanning {} block(s) with {} probe, pool of {}",
            addresses.blocks().count(),
            self.config.probe.name(),
            self.queue.capacity()
        );
        self.set_state(EngineState::Running);
        let mut pass = addresses.passes();

        let reason = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if self.goal_reached() {
                break StopReason::GoalReached;
            }

            if self.queue.needs_refill() {
                self.set_state(EngineState::Running);
                match addresses.next_batch() {
                    Ok(batch) if !batch.is_empty() => {
                        if addresses.passes() != pass {
                            pass = addresses.passes();
                            debug!("address space covered {pass} time(s), backing off");
                            self.pause(self.config.backoff).await;
                            if self.cancel.is_cancelled() {
                                continue;
                            }
                        }
                        debug!("probing batch of {} (pass {pass})", batch.len());
                        self.probe_batch(&prober, batch).await;
                    }
                    Ok(_) => {
                        debug!("address space exhausted, backing off");
                        self.pause(self.config.backoff).await;
                    }
                    Err(e) => {
                        error!("address generation failed: {e}");
                        self.pause(self.config.backoff).await;
                    }
                }
            } else {
                self.set_state(EngineState::Sweeping);
                let expired = self.queue.expire(OffsetDateTime::now_utc());
                if expired > 0 {
                    debug!("expired {expired} stale address(es)");
                }
                self.pause(self.config.idle_interval).await;
            }
        };

        if reason == StopReason::GoalReached {
            info!("target of {} address(es) reached", self.config.target_count.unwrap_or(0));
            self.cancel.cancel();
        } else {
            info!("scan stopped");
        }
        self.set_state(EngineState::Stopped);
        Ok(reason)
    }

    fn goal_reached(&self) -> bool {
        self.config
            .target_count
            .is_some_and(|target| self.queue.qualifying(OffsetDateTime::now_utc()) >= target)
    }

    /// Sleep unless cancelled first.
    async fn pause(&self, d: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = time::sleep(d) => {}
        }
    }

    async fn probe_batch(&self, prober: &Arc<dyn Probe>, batch: Vec<IpAddr>) {
        let sem = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut set = JoinSet::new();

        for ip in batch {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&sem).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            while let Some(done) = set.try_join_next() {
                self.record(done);
            }
            if self.cancel.is_cancelled() || self.goal_reached() {
                break;
            }

            let target = SocketAddr::new(ip, self.config.probe_port());
            let prober = Arc::clone(prober);
            set.spawn(async move {
                let _permit = permit;
                (target, prober.probe(target).await)
            });
        }

        // In-flight probes are bounded by their own timeouts.
        while let Some(done) = set.join_next().await {
            self.record(done);
        }
    }

    fn record(&self, done: Result<ProbeOutcome, JoinError>) {
        let (target, outcome) = match done {
            Ok(v) => v,
            Err(e) => {
                error!("probe task failed: {e}");
                return;
            }
        };
        match outcome {
            Ok(rtt) if rtt > self.config.max_rtt => {
                debug!("{target} answered in {rtt:?}, over the {:?} ceiling", self.config.max_rtt);
            }
            Ok(rtt) => {
                let record = AddressRecord::new(target.ip(), target.port(), rtt);
                if self.queue.insert(record) {
                    debug!("{target} pooled at {} ms", rtt.as_millis());
                }
            }
            Err(e) if e.is_timeout() => debug!("{target}: {e}"),
            Err(e) => error!("{target}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimeoutStage;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers from a fixed table; unknown addresses time out.
    struct Scripted {
        rtts: HashMap<IpAddr, u64>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(rtts: &[(&str, u64)]) -> Arc<Self> {
            Arc::new(Self {
                rtts: rtts.iter().map(|(ip, ms)| (ip.parse().unwrap(), *ms)).collect(),
                delay: Duration::from_millis(1),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Probe for Scripted {
        async fn probe(&self, target: SocketAddr) -> Result<Duration, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            time::sleep(self.delay).await;
            match self.rtts.get(&target.ip()) {
                Some(ms) => Ok(Duration::from_millis(*ms)),
                None => Err(ProbeError::Timeout { stage: TimeoutStage::Connect }),
            }
        }
    }

    fn config(cidr: &str) -> ScanConfig {
        ScanConfig {
            cidrs: vec![cidr.to_string()],
            idle_interval: Duration::from_millis(10),
            backoff: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_cidr_list_fails_fast() {
        let engine = Engine::with_prober(
            ScanConfig { cidrs: vec![], ..Default::default() },
            Scripted::new(&[]),
        );
        assert_eq!(engine.run().await, Err(ConfigError::EmptyCidrList));
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn stops_itself_at_target_count() {
        let prober = Scripted::new(&[
            ("10.0.0.1", 40),
            ("10.0.0.2", 10),
            ("10.0.0.3", 30),
            ("10.0.0.4", 20),
            ("10.0.0.5", 50),
        ]);
        let engine = Engine::with_prober(
            ScanConfig { target_count: Some(5), ..config("10.0.0.0/29") },
            prober.clone(),
        );
        let reason = time::timeout(Duration::from_secs(5), engine.run()).await.unwrap();
        assert_eq!(reason, Ok(StopReason::GoalReached));
        assert_eq!(engine.state(), EngineState::Stopped);

        let rtts: Vec<u64> = engine.available_ips(false).iter().map(|r| r.rtt_ms).collect();
        assert_eq!(rtts, vec![10, 20, 30, 40, 50]);
        assert!(prober.calls.load(Ordering::SeqCst) <= 8);
    }

    #[tokio::test]
    async fn over_ceiling_results_are_dropped() {
        let prober = Scripted::new(&[("10.0.0.1", 10), ("10.0.0.2", 900)]);
        let engine = Arc::new(Engine::with_prober(config("10.0.0.0/30"), prober));
        let run = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run().await }
        });
        time::sleep(Duration::from_millis(100)).await;
        engine.stop();
        run.await.unwrap().unwrap();

        let pool = engine.available_ips(false);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(pool[0].port, 443);
    }

    #[tokio::test]
    async fn stop_is_prompt_and_pool_stays_readable() {
        let prober = Scripted::new(&[("10.0.0.1", 15), ("10.0.0.9", 5)]);
        let engine = Arc::new(Engine::with_prober(config("10.0.0.0/24"), prober));
        let run = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run().await }
        });

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(engine.state(), EngineState::Running);
        engine.stop();
        engine.stop();
        let reason = time::timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
        assert_eq!(reason, Ok(StopReason::Cancelled));
        assert_eq!(engine.state(), EngineState::Stopped);

        let asc = engine.available_ips(false);
        let mut desc = engine.available_ips(true);
        desc.reverse();
        assert_eq!(asc, desc);
        assert_eq!(asc.len(), 2);
        assert_eq!(asc[0].rtt_ms, 5);
    }

    #[tokio::test]
    async fn full_pool_switches_to_sweeping() {
        let prober = Scripted::new(&[("10.0.0.1", 10), ("10.0.0.2", 20), ("10.0.0.3", 30)]);
        let engine = Arc::new(Engine::with_prober(
            ScanConfig { queue_capacity: 2, ..config("10.0.0.0/30") },
            prober,
        ));
        let run = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run().await }
        });
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.state(), EngineState::Sweeping);
        assert_eq!(engine.status().pooled, 2);
        assert_eq!(engine.status().best.map(|r| r.rtt_ms), Some(10));
        engine.stop();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_before_run_returns_immediately() {
        let prober = Scripted::new(&[("10.0.0.1", 10)]);
        let engine = Engine::with_prober(config("10.0.0.0/30"), prober.clone());
        engine.stop();
        assert_eq!(engine.run().await, Ok(StopReason::Cancelled));
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_for_cancels_at_deadline() {
        let engine = Engine::with_prober(config("10.0.0.0/24"), Scripted::new(&[]));
        let reason = time::timeout(Duration::from_secs(2), engine.run_for(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(reason, Ok(StopReason::Cancelled));
    }

    #[tokio::test]
    async fn change_hook_sees_every_insert() {
        let seen = Arc::new(Mutex::new(Vec::<usize>::new()));
        let sink = Arc::clone(&seen);
        let engine = Engine::with_prober(
            ScanConfig {
                target_count: Some(2),
                on_change: Some(Arc::new(move |pool: &[AddressRecord]| {
                    sink.lock().unwrap().push(pool.len());
                })),
                ..config("10.0.0.0/30")
            },
            Scripted::new(&[("10.0.0.1", 10), ("10.0.0.2", 20)]),
        );
        assert_eq!(engine.run().await, Ok(StopReason::GoalReached));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }
}
