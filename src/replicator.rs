//! # Replicator
//!
//! Drains leased batches of queue items from the [`LocalStore`] and posts them to the
//! remote datastore's per-kind endpoint. Failure handling is layered:
//!
//! - Each item failing within a batch is `nack`ed individually (its own backoff clock,
//!   its own attempt count) rather than failing the whole batch together.
//! - A sliding window of recent attempt outcomes feeds a circuit breaker: once over half
//!   of at least three attempts in the last minute failed, the breaker opens and the
//!   replicator stops sending for five minutes, then allows exactly one probe request
//!   through before deciding whether to close again.
//!
//! A `Transport` trait isolates the bearer-token HTTP client so the retry/backoff/circuit
//! logic can be tested against a fake transport without a live endpoint.

use crate::error::VisionOpsError;
use crate::model::{EntityKind, QueueItem};
use crate::store::LocalStore;
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);
const CIRCUIT_WINDOW: Duration = Duration::from_secs(60);
const CIRCUIT_MIN_ATTEMPTS: usize = 3;
const CIRCUIT_FAILURE_RATIO: f64 = 0.5;
const CIRCUIT_OPEN_DURATION: Duration = Duration::from_secs(5 * 60);

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, kind: EntityKind, payload: &serde_json::Value) -> Result<(), VisionOpsError>;
}

/// Bearer-token HTTP transport to the remote datastore's REST surface.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: zeroize::Zeroizing<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: zeroize::Zeroizing::new(token),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, kind: EntityKind, payload: &serde_json::Value) -> Result<(), VisionOpsError> {
        let url = format!("{}{}", self.base_url, kind.endpoint_path());
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token.as_str())
            .json(payload)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else if response.status().is_server_error() || response.status().as_u16() == 429 {
            Err(VisionOpsError::transient_io("replicator_http", format!("{} returned {}", url, response.status())))
        } else {
            Err(VisionOpsError::integrity("replicator_http", format!("{} rejected payload: {}", url, response.status())))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitBreaker {
    state: CircuitState,
    opened_at: Option<Instant>,
    recent: VecDeque<(Instant, bool)>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self { state: CircuitState::Closed, opened_at: None, recent: VecDeque::new() }
    }

    fn record(&mut self, success: bool) {
        let now = Instant::now();
        self.recent.push_back((now, success));
        while let Some(&(t, _)) = self.recent.front() {
            if now.duration_since(t) > CIRCUIT_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        match self.state {
            CircuitState::HalfOpen => {
                self.state = if success { CircuitState::Closed } else { CircuitState::Open };
                if self.state == CircuitState::Open {
                    self.opened_at = Some(now);
                } else {
                    self.opened_at = None;
                }
            }
            CircuitState::Closed => {
                if self.recent.len() >= CIRCUIT_MIN_ATTEMPTS {
                    let failures = self.recent.iter().filter(|(_, ok)| !ok).count();
                    if failures as f64 / self.recent.len() as f64 > CIRCUIT_FAILURE_RATIO {
                        self.state = CircuitState::Open;
                        self.opened_at = Some(now);
                    }
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Returns whether a send attempt may proceed right now, transitioning Open ->
    /// HalfOpen once the open duration has elapsed.
    fn allow_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.opened_at.map(|t| t.elapsed() >= CIRCUIT_OPEN_DURATION).unwrap_or(false) {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }
}

pub struct Replicator {
    store: std::sync::Arc<LocalStore>,
    transport: Box<dyn Transport>,
    batch_size: usize,
    lease_seconds: i64,
    max_attempts: u32,
    breaker: Mutex<CircuitBreaker>,
}

impl Replicator {
    pub fn new(store: std::sync::Arc<LocalStore>, transport: Box<dyn Transport>, batch_size: usize, lease_seconds: i64, max_attempts: u32) -> Self {
        Self {
            store,
            transport,
            batch_size,
            lease_seconds,
            max_attempts,
            breaker: Mutex::new(CircuitBreaker::new()),
        }
    }

    /// Drains and sends one batch per entity kind. Returns the number of items acked.
    pub async fn drain_once(&self) -> Result<usize, VisionOpsError> {
        if !self.breaker.lock().unwrap().allow_attempt() {
            return Ok(0);
        }

        let mut acked = 0;
        for kind in [EntityKind::Detection, EntityKind::KeyFrame, EntityKind::WindowedMetric, EntityKind::CameraSpec] {
            let batch = self.store.lease_batch(kind, self.batch_size, self.lease_seconds)?;
            for item in batch {
                acked += self.send_one(kind, item).await;
            }
        }
        Ok(acked)
    }

    async fn send_one(&self, kind: EntityKind, item: QueueItem) -> usize {
        let backoff = backoff_for_attempt(item.attempts);
        if backoff > Duration::ZERO {
            tokio::time::sleep(backoff).await;
        }

        let result = self.transport.send(kind, &item.payload).await;
        let success = result.is_ok();
        self.breaker.lock().unwrap().record(success);

        match result {
            Ok(()) => {
                let _ = self.store.ack(item.id);
                1
            }
            Err(e) => {
                let _ = self.store.nack(item.id, &e.to_string(), self.max_attempts);
                0
            }
        }
    }
}

fn backoff_for_attempt(attempts: u32) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    let exponent = attempts.min(12);
    let raw = BACKOFF_BASE.saturating_mul(1u32.wrapping_shl(exponent).max(1));
    let capped = raw.min(BACKOFF_CAP);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4 + 1);
    capped + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct AlwaysFail;
    #[async_trait]
    impl Transport for AlwaysFail {
        async fn send(&self, _kind: EntityKind, _payload: &serde_json::Value) -> Result<(), VisionOpsError> {
            Err(VisionOpsError::transient_io("test", "forced failure"))
        }
    }

    struct CountingTransport(Arc<AtomicUsize>);
    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(&self, _kind: EntityKind, _payload: &serde_json::Value) -> Result<(), VisionOpsError> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn circuit_opens_after_majority_failures() {
        let mut breaker = CircuitBreaker::new();
        breaker.record(false);
        breaker.record(false);
        breaker.record(true);
        assert_eq!(breaker.state, CircuitState::Open);
        assert!(!breaker.allow_attempt());
    }

    #[test]
    fn circuit_stays_closed_with_majority_success() {
        let mut breaker = CircuitBreaker::new();
        breaker.record(true);
        breaker.record(true);
        breaker.record(false);
        assert_eq!(breaker.state, CircuitState::Closed);
        assert!(breaker.allow_attempt());
    }

    #[tokio::test]
    async fn drain_once_acks_successful_sends() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let detection = crate::model::Detection {
            camera_id: "cam-1".into(), class_label: "person".into(), confidence: 0.9,
            x: 0, y: 0, w: 1, h: 1, zone_label: None, captured_at: chrono::Utc::now(), processing_latency_ms: 1,
        };
        store.insert_detection(&detection, 1).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let replicator = Replicator::new(store.clone(), Box::new(CountingTransport(count.clone())), 10, 300, 20);
        let acked = replicator.drain_once().await.unwrap();
        assert_eq!(acked, 1);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(store.dead_letter_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_sends_are_nacked_not_acked() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let detection = crate::model::Detection {
            camera_id: "cam-1".into(), class_label: "person".into(), confidence: 0.9,
            x: 0, y: 0, w: 1, h: 1, zone_label: None, captured_at: chrono::Utc::now(), processing_latency_ms: 1,
        };
        store.insert_detection(&detection, 1).unwrap();

        let replicator = Replicator::new(store.clone(), Box::new(AlwaysFail), 10, 300, 20);
        let acked = replicator.drain_once().await.unwrap();
        assert_eq!(acked, 0);
    }
}
