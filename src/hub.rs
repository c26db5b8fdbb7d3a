//! Realtime subscriber hub.
//!
//! A read-mostly registry of subscribers, each owning a bounded outbound
//! queue. Broadcast never blocks: a queue with no room left costs the
//! subscriber its membership, not the stream its cadence. Eviction happens
//! after the registry read lock is released so a slow consumer cannot stall
//! the others.
//!
//! Per-frame metric broadcasts are coalesced under a dual predicate: a frame
//! inside the 50 ms window after the previous broadcast is suppressed unless
//! some channel's velocity moved by more than 0.05 m/s. Status updates,
//! change batches and initial snapshots always go out.

use crate::models::{
    now_ms, ClientMessage, RadarFrame, RadarStatus, ServerMessage, CHANNELS,
};
use crate::state::Shared;
use crate::store::StoreService;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default per-subscriber outbound queue bound.
pub const SEND_QUEUE_SIZE: usize = 256;
/// Hub-level liveness ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(5);
/// Minimum spacing of coalesced metric broadcasts.
const COALESCE_WINDOW: Duration = Duration::from_millis(50);
/// A velocity move past this forces a broadcast through the window.
const SIGNIFICANT_DELTA: f64 = 0.05;

pub struct Subscriber {
    tx: mpsc::Sender<ServerMessage>,
    pub remote_addr: String,
    pub user_agent: String,
}

struct Coalesce {
    last_sent: Option<Instant>,
    last_velocities: [f64; CHANNELS],
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    coalesce: Mutex<Coalesce>,
    queue_capacity: usize,
    status: Shared<RadarStatus>,
    last_frame: Shared<Option<RadarFrame>>,
    store: StoreService,
}

impl Hub {
    pub fn new(
        queue_capacity: usize,
        status: Shared<RadarStatus>,
        last_frame: Shared<Option<RadarFrame>>,
        store: StoreService,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: RwLock::new(HashMap::new()),
                coalesce: Mutex::new(Coalesce {
                    last_sent: None,
                    last_velocities: [0.0; CHANNELS],
                }),
                queue_capacity,
                status,
                last_frame,
                store,
            }),
        }
    }

    /// Admits a subscriber: registers it, greets it with its assigned id and
    /// queues the current status and metrics snapshot. The returned receiver
    /// is the subscriber's outbound queue; dropping its sender side (via
    /// [`Hub::evict`]) is how the transport learns to tear down.
    pub fn admit(
        &self,
        remote_addr: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> (Uuid, mpsc::Receiver<ServerMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);

        let welcome = ServerMessage::Welcome {
            timestamp: now_ms(),
            client_id: id.to_string(),
        };
        let status = ServerMessage::status(&self.inner.status.read());
        let snapshot = self
            .inner
            .last_frame
            .read()
            .as_ref()
            .map(ServerMessage::metrics);

        // fresh queue, these cannot fail
        let _ = tx.try_send(welcome);
        let _ = tx.try_send(status);
        if let Some(snapshot) = snapshot {
            let _ = tx.try_send(snapshot);
        }

        let subscriber = Subscriber {
            tx,
            remote_addr: remote_addr.into(),
            user_agent: user_agent.into(),
        };

        let total = {
            let mut subs = self.inner.subscribers.write();
            subs.insert(id, subscriber);
            subs.len()
        };
        info!("subscriber {id} admitted ({total} connected)");
        (id, rx)
    }

    /// Removes a subscriber and closes its queue. Idempotent.
    pub fn evict(&self, id: Uuid) {
        let removed = self.inner.subscribers.write().remove(&id);
        if removed.is_some() {
            let total = self.inner.subscribers.read().len();
            info!("subscriber {id} evicted ({total} connected)");
        }
    }

    /// Enqueues `msg` for every subscriber. Queues without capacity mark
    /// their owner for eviction, performed outside the read lock.
    pub fn broadcast(&self, msg: ServerMessage) {
        let mut to_evict = Vec::new();
        {
            let subs = self.inner.subscribers.read();
            for (id, sub) in subs.iter() {
                match sub.tx.try_send(msg.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("subscriber {id} outbound queue overflow, evicting");
                        to_evict.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => to_evict.push(*id),
                }
            }
        }
        for id in to_evict {
            self.evict(id);
        }
    }

    /// Per-frame broadcast, subject to coalescing.
    pub fn broadcast_metrics(&self, frame: &RadarFrame) {
        if !self.metrics_due(&frame.velocities) {
            return;
        }
        self.broadcast(ServerMessage::metrics(frame));
    }

    fn metrics_due(&self, velocities: &[f64; CHANNELS]) -> bool {
        let mut coalesce = self.inner.coalesce.lock();
        let now = Instant::now();
        let within_window = coalesce
            .last_sent
            .is_some_and(|t| now.duration_since(t) < COALESCE_WINDOW);
        let significant = velocities
            .iter()
            .zip(coalesce.last_velocities.iter())
            .any(|(v, last)| (v - last).abs() > SIGNIFICANT_DELTA);

        if within_window && !significant {
            return false;
        }
        coalesce.last_sent = Some(now);
        coalesce.last_velocities = *velocities;
        true
    }

    pub fn broadcast_changes(&self, changes: &[crate::models::VelocityChange]) {
        if changes.is_empty() {
            return;
        }
        self.broadcast(ServerMessage::VelocityChanges {
            timestamp: now_ms(),
            changes: changes.to_vec(),
        });
    }

    pub fn broadcast_status(&self, status: &RadarStatus) {
        self.broadcast(ServerMessage::status(status));
    }

    /// Enqueues a message for one subscriber, with the same overflow policy
    /// as a broadcast.
    pub fn send_to(&self, id: Uuid, msg: ServerMessage) {
        let overflow = {
            let subs = self.inner.subscribers.read();
            match subs.get(&id) {
                Some(sub) => match sub.tx.try_send(msg) {
                    Ok(()) => false,
                    Err(TrySendError::Full(_)) => {
                        warn!("subscriber {id} outbound queue overflow, evicting");
                        true
                    }
                    Err(TrySendError::Closed(_)) => true,
                },
                None => false,
            }
        };
        if overflow {
            self.evict(id);
        }
    }

    /// Routes a subscriber-originated command.
    pub async fn dispatch(&self, id: Uuid, cmd: ClientMessage) {
        match cmd {
            ClientMessage::Ping { time } => {
                self.send_to(
                    id,
                    ServerMessage::Pong {
                        timestamp: now_ms(),
                        time,
                        server_time: now_ms(),
                    },
                );
            }
            ClientMessage::GetStatus => {
                let msg = ServerMessage::status(&self.inner.status.read());
                self.send_to(id, msg);
            }
            ClientMessage::GetHistory { index } => {
                match self.inner.store.get_channel_history(index).await {
                    Ok(history) => self.send_to(
                        id,
                        ServerMessage::VelocityHistory {
                            timestamp: now_ms(),
                            index: index as usize,
                            history,
                        },
                    ),
                    Err(e) => {
                        debug!("history request from {id} failed: {e}");
                        self.send_to(id, ServerMessage::error(e.code(), e.to_string()));
                    }
                }
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Periodic liveness ping to every subscriber.
    pub fn spawn_ping_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        hub.broadcast(ServerMessage::Ping {
                            timestamp: now_ms(),
                            time: now_ms(),
                        });
                    }
                }
            }
            debug!("hub ping task stopped");
        })
    }

    /// Closes every subscriber queue; transports tear down on observing it.
    pub fn shutdown(&self) {
        let count = {
            let mut subs = self.inner.subscribers.write();
            let count = subs.len();
            subs.clear();
            count
        };
        if count > 0 {
            info!("closed {count} subscriber queues");
        }
    }
}
