//! Time-series store adapter.
//!
//! Maps frames, change events and status records onto a Redis key schema
//! under a configured prefix. Everything for one tick travels in a single
//! atomic pipeline so current scalars are never reordered against their
//! history appends. Writes are best-effort: a failing pipeline marks the
//! adapter disconnected, the producer keeps going and the next write probes
//! the connection again.
//!
//! Key layout (prefix elided):
//!
//! ```text
//! status, timestamp                    current status tag / ms epoch
//! pos{1..7}, vel{1..7}                 current channel values
//! pos{n}:history, vel{n}:history       sorted set, score = ms, cap 1000,
//!                                      member = "{ms}:{value}"
//! velocity_change:{n}:{ms}             change-event detail (JSON)
//! vel{n}:changes, velocity_changes     change indices, cap 100
//! vel{n}:change_count                  monotonic counter
//! latest_update                        last change batch (JSON)
//! last_error, consecutive_errors       status detail
//! ```
//!
//! History members carry the sample timestamp as a prefix: ZADD upserts by
//! member, so a bare value would collapse a stationary channel (exactly
//! `0.0` tick after tick) into one entry instead of `min(k, H)`.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::models::{
    now_ms, HistoryPoint, LatestUpdate, RadarFrame, RadarStatus, StatusKind, VelocityChange,
    CHANNELS,
};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Pending write batches; the oldest is dropped once this overflows.
const PERSIST_QUEUE_SIZE: usize = 64;

/// One tick's worth of persistence work, dispatched off the acquisition path.
#[derive(Debug, Clone)]
pub enum WriteBatch {
    Frame {
        frame: RadarFrame,
        changes: Vec<VelocityChange>,
    },
    Status(RadarStatus),
}

#[derive(Clone)]
pub struct StoreService {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: StoreConfig,
    manager: tokio::sync::Mutex<Option<ConnectionManager>>,
    connected: AtomicBool,
}

impl StoreService {
    /// Builds the adapter and probes the store once. A dead store is not
    /// fatal: the adapter starts offline and re-probes on the write path.
    pub async fn connect(config: StoreConfig) -> Self {
        let service = Self {
            inner: Arc::new(StoreInner {
                config,
                manager: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
            }),
        };

        if !service.inner.config.enabled {
            info!("store disabled by configuration");
            return service;
        }

        match service.probe().await {
            Ok(()) => info!(
                "store connection established at {}:{}",
                service.inner.config.host, service.inner.config.port
            ),
            Err(e) => warn!("store unreachable ({e}), continuing in offline mode"),
        }
        service
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    pub fn is_connected(&self) -> bool {
        self.inner.config.enabled && self.inner.connected.load(Ordering::Relaxed)
    }

    pub fn prefix(&self) -> &str {
        &self.inner.config.prefix
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.inner.config.prefix, suffix)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        if !self.inner.config.enabled {
            return Err(Error::StoreUnavailable("store disabled".into()));
        }

        let mut guard = self.inner.manager.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }

        let client = redis::Client::open(self.inner.config.url())
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        let manager = timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::StoreUnavailable("store connect timed out".into()))?
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;

        *guard = Some(manager.clone());
        Ok(manager)
    }

    /// PINGs the store and refreshes the connected flag.
    pub async fn probe(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let result: std::result::Result<String, _> =
            match timeout(PROBE_TIMEOUT, redis::cmd("PING").query_async(&mut conn)).await {
                Ok(r) => r,
                Err(_) => {
                    self.inner.connected.store(false, Ordering::Relaxed);
                    return Err(Error::StoreUnavailable("store probe timed out".into()));
                }
            };
        match result {
            Ok(_) => {
                self.inner.connected.store(true, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.inner.connected.store(false, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Re-probes a downed connection before a write. Returns false when the
    /// write should be skipped (disabled or still unreachable).
    async fn writable(&self) -> bool {
        if !self.inner.config.enabled {
            return false;
        }
        if self.inner.connected.load(Ordering::Relaxed) {
            return true;
        }
        self.probe().await.is_ok()
    }

    fn note_failure(&self, context: &str, e: &redis::RedisError) {
        self.inner.connected.store(false, Ordering::Relaxed);
        warn!("store {context} failed, marking adapter disconnected: {e}");
    }

    /// Persists one frame: current scalars, history appends, ring trims.
    pub async fn write_frame(&self, frame: &RadarFrame) -> Result<()> {
        if !self.writable().await {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let trim_rank = -(self.inner.config.history_size as isize) - 1;
        let ts = frame.timestamp;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(self.key("status"), frame.status.as_str()).ignore();
        pipe.set(self.key("timestamp"), ts).ignore();

        for i in 0..CHANNELS {
            let pos_key = self.key(&format!("pos{}", i + 1));
            let pos_hist = format!("{pos_key}:history");
            pipe.set(&pos_key, frame.positions[i]).ignore();
            pipe.zadd(&pos_hist, history_member(frame.positions[i], ts), ts).ignore();
            pipe.zremrangebyrank(&pos_hist, 0, trim_rank).ignore();

            let vel_key = self.key(&format!("vel{}", i + 1));
            let vel_hist = format!("{vel_key}:history");
            pipe.set(&vel_key, frame.velocities[i]).ignore();
            pipe.zadd(&vel_hist, history_member(frame.velocities[i], ts), ts).ignore();
            pipe.zremrangebyrank(&vel_hist, 0, trim_rank).ignore();
        }

        let result: std::result::Result<(), _> = pipe.query_async(&mut conn).await;
        result.map_err(|e| {
            self.note_failure("frame pipeline", &e);
            Error::from(e)
        })
    }

    /// Persists a change batch: detail scalars, per-channel and global
    /// indices, counters, and the `latest_update` document.
    pub async fn write_changes(&self, changes: &[VelocityChange]) -> Result<()> {
        if changes.is_empty() || !self.writable().await {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let trim_rank = -(self.inner.config.change_log_size as isize) - 1;
        let global_key = self.key("velocity_changes");

        let mut pipe = redis::pipe();
        pipe.atomic();

        for change in changes {
            let detail = match serde_json::to_string(change) {
                Ok(json) => json,
                Err(e) => {
                    warn!("failed to serialize change event, skipping: {e}");
                    continue;
                }
            };
            let change_key = self.change_key(change);
            let channel_key = self.key(&format!("vel{}:changes", change.index + 1));
            let counter_key = self.key(&format!("vel{}:change_count", change.index + 1));

            pipe.set(&change_key, detail).ignore();
            pipe.zadd(&channel_key, &change_key, change.timestamp).ignore();
            pipe.zremrangebyrank(&channel_key, 0, trim_rank).ignore();
            pipe.zadd(&global_key, &change_key, change.timestamp).ignore();
            pipe.zremrangebyrank(&global_key, 0, trim_rank).ignore();
            pipe.incr(&counter_key, 1).ignore();
        }

        let latest = LatestUpdate {
            timestamp: now_ms(),
            changes: changes.to_vec(),
        };
        if let Ok(json) = serde_json::to_string(&latest) {
            pipe.set(self.key("latest_update"), json).ignore();
        }

        let result: std::result::Result<(), _> = pipe.query_async(&mut conn).await;
        match result {
            Ok(()) => {
                debug!("persisted {} velocity changes", changes.len());
                Ok(())
            }
            Err(e) => {
                self.note_failure("change pipeline", &e);
                Err(e.into())
            }
        }
    }

    pub async fn write_status(&self, status: &RadarStatus) -> Result<()> {
        if !self.writable().await {
            return Ok(());
        }
        let mut conn = self.connection().await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(self.key("status"), status.status.as_str()).ignore();
        pipe.set(self.key("timestamp"), status.timestamp).ignore();
        if let Some(last_error) = &status.last_error {
            pipe.set(self.key("last_error"), last_error).ignore();
        }
        if status.error_count > 0 {
            pipe.set(self.key("consecutive_errors"), status.error_count).ignore();
        }

        let result: std::result::Result<(), _> = pipe.query_async(&mut conn).await;
        result.map_err(|e| {
            self.note_failure("status pipeline", &e);
            Error::from(e)
        })
    }

    /// Current status record. Absent keys mean the store has never seen a
    /// status; the caller falls back to its in-memory record.
    pub async fn get_status(&self) -> Result<RadarStatus> {
        let mut conn = self.connection().await?;

        let tag: Option<String> = conn.get(self.key("status")).await?;
        let Some(tag) = tag else {
            return Err(Error::StoreUnavailable("no status recorded".into()));
        };
        let timestamp: Option<i64> = conn.get(self.key("timestamp")).await?;
        let last_error: Option<String> = conn.get(self.key("last_error")).await?;
        let error_count: Option<u32> = conn.get(self.key("consecutive_errors")).await?;

        Ok(RadarStatus {
            status: StatusKind::parse(&tag),
            timestamp: timestamp.unwrap_or_else(now_ms),
            last_error,
            error_count: error_count.unwrap_or(0),
            connection_info: None,
        })
    }

    /// Current snapshot; missing keys default to zero, status to `unknown`.
    pub async fn get_snapshot(&self) -> Result<RadarFrame> {
        let mut conn = self.connection().await?;
        let mut frame = RadarFrame::new();

        let tag: Option<String> = conn.get(self.key("status")).await?;
        frame.status = tag.as_deref().map(StatusKind::parse).unwrap_or(StatusKind::Unknown);
        if let Some(ts) = conn.get::<_, Option<i64>>(self.key("timestamp")).await? {
            frame.timestamp = ts;
        }

        for i in 0..CHANNELS {
            if let Some(pos) = conn.get::<_, Option<f64>>(self.key(&format!("pos{}", i + 1))).await? {
                frame.positions[i] = pos;
            }
            if let Some(vel) = conn.get::<_, Option<f64>>(self.key(&format!("vel{}", i + 1))).await? {
                frame.velocities[i] = vel;
            }
        }

        Ok(frame)
    }

    /// Newest `limit` change events, descending by timestamp.
    pub async fn get_changes(&self, limit: usize) -> Result<Vec<VelocityChange>> {
        let mut conn = self.connection().await?;

        let keys: Vec<String> = conn
            .zrevrange(self.key("velocity_changes"), 0, limit as isize - 1)
            .await?;

        let mut changes = Vec::with_capacity(keys.len());
        for key in keys {
            let detail: Option<String> = conn.get(&key).await?;
            let Some(detail) = detail else { continue };
            match serde_json::from_str::<VelocityChange>(&detail) {
                Ok(change) => changes.push(change),
                Err(e) => warn!("skipping unparsable change event {key}: {e}"),
            }
        }
        Ok(changes)
    }

    /// Full velocity ring for channel `index` (1-based), ascending.
    pub async fn get_channel_history(&self, index: i64) -> Result<Vec<HistoryPoint>> {
        if !(1..=CHANNELS as i64).contains(&index) {
            return Err(Error::BadArgument(format!(
                "channel index {index} out of range 1..={CHANNELS}"
            )));
        }
        let mut conn = self.connection().await?;

        let entries: Vec<(String, f64)> = conn
            .zrange_withscores(self.key(&format!("vel{index}:history")), 0, -1)
            .await?;

        Ok(entries
            .into_iter()
            .filter_map(|(member, score)| {
                let (_, value) = member.split_once(':')?;
                let value = value.parse::<f64>().ok()?;
                Some(HistoryPoint {
                    value,
                    timestamp: score as i64,
                })
            })
            .collect())
    }

    pub async fn get_latest_update(&self) -> Result<Option<LatestUpdate>> {
        let mut conn = self.connection().await?;
        let json: Option<String> = conn.get(self.key("latest_update")).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn change_key(&self, change: &VelocityChange) -> String {
        self.key(&format!(
            "velocity_change:{}:{}",
            change.index + 1,
            change.timestamp
        ))
    }

    /// Spawns the persistence worker. The returned sender is lossy by
    /// design: once [`PERSIST_QUEUE_SIZE`] batches are pending, the oldest
    /// ones are dropped (with a warning) rather than stalling the producer.
    pub fn spawn_writer(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> (broadcast::Sender<WriteBatch>, JoinHandle<()>) {
        let (tx, mut rx) = broadcast::channel::<WriteBatch>(PERSIST_QUEUE_SIZE);
        let store = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    batch = rx.recv() => match batch {
                        Ok(batch) => store.apply(batch).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("persistence queue overflow, dropped {n} pending batches");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }

            // flush what is still queued; the server bounds this drain
            // with the shutdown grace period
            loop {
                match rx.try_recv() {
                    Ok(batch) => store.apply(batch).await,
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        warn!("persistence queue overflow, dropped {n} pending batches");
                    }
                    Err(_) => break,
                }
            }
            debug!("persistence worker stopped");
        });

        (tx, handle)
    }

    async fn apply(&self, batch: WriteBatch) {
        match batch {
            WriteBatch::Frame { frame, changes } => {
                if let Err(e) = self.write_frame(&frame).await {
                    warn!("failed to persist frame: {e}");
                    return;
                }
                if let Err(e) = self.write_changes(&changes).await {
                    warn!("failed to persist velocity changes: {e}");
                }
            }
            WriteBatch::Status(status) => {
                if let Err(e) = self.write_status(&status).await {
                    warn!("failed to persist status: {e}");
                }
            }
        }
    }

    pub async fn close(&self) {
        let mut guard = self.inner.manager.lock().await;
        if guard.take().is_some() {
            info!("store connection closed");
        }
        self.inner.connected.store(false, Ordering::Relaxed);
    }
}

/// Ring member for one sample. The timestamp prefix keeps repeated values
/// distinct under ZADD's upsert-by-member semantics.
fn history_member(value: f64, timestamp: i64) -> String {
    format!("{timestamp}:{value}")
}
