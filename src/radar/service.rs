//! Acquisition loop: polls the sensor at the configured tick, runs change
//! detection and drives fan-out and persistence in strict priority order.
//!
//! The loop owns the radar session, the change detector and the last-frame
//! cache. Sensor errors never terminate it: they are counted, reflected in
//! the status record past a threshold, and retried after a reconnect delay.
//! Fan-out always happens before persistence — the store must never gate
//! the realtime path.

use crate::config::RadarConfig;
use crate::error::Error;
use crate::hub::Hub;
use crate::models::{now_ms, LatestUpdate, RadarFrame, RadarStatus, StatusKind};
use crate::radar::decoder::decode;
use crate::radar::{ChangeDetector, RadarClient, POLL_COMMAND};
use crate::state::Shared;
use crate::store::WriteBatch;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// In-process observer of published frames (e.g. the controller mirror).
pub type MetricsHandler = Arc<dyn Fn(&RadarFrame) + Send + Sync>;

pub struct RadarService {
    client: RadarClient,
    detector: ChangeDetector,
    config: RadarConfig,
    hub: Hub,
    writer: broadcast::Sender<WriteBatch>,
    status: Shared<RadarStatus>,
    last_frame: Shared<Option<RadarFrame>>,
    last_update: Shared<Option<LatestUpdate>>,
    handlers: Vec<MetricsHandler>,
    consecutive_errors: u32,
    running: Arc<AtomicBool>,
}

impl RadarService {
    pub fn new(
        config: RadarConfig,
        hub: Hub,
        writer: broadcast::Sender<WriteBatch>,
        status: Shared<RadarStatus>,
        last_frame: Shared<Option<RadarFrame>>,
        last_update: Shared<Option<LatestUpdate>>,
    ) -> Self {
        let client = RadarClient::new(config.host.clone(), config.port);
        let detector = ChangeDetector::new(config.min_velocity_change);
        Self {
            client,
            detector,
            config,
            hub,
            writer,
            status,
            last_frame,
            last_update,
            handlers: Vec::new(),
            consecutive_errors: 0,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers an in-process observer, called synchronously per frame
    /// after fan-out.
    pub fn register_metrics_handler(&mut self, handler: MetricsHandler) {
        self.handlers.push(handler);
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Starts the loop. It stops on the shutdown signal, closing the sensor
    /// session on the way out.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.running.store(true, Ordering::Relaxed);
            info!(
                "acquisition loop started (sensor {}, period {:?})",
                self.client.addr(),
                self.config.sample_period()
            );

            if let Err(e) = self.client.connect().await {
                warn!("initial sensor connection failed: {e}; retrying in the poll loop");
            }

            let mut ticker = tokio::time::interval(self.config.sample_period());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Some(backoff) = self.tick().await {
                            // reconnect pause, interruptible by shutdown
                            tokio::select! {
                                result = shutdown.changed() => {
                                    if result.is_err() || *shutdown.borrow() {
                                        break;
                                    }
                                }
                                _ = tokio::time::sleep(backoff) => {}
                            }
                        }
                    }
                }
            }

            self.client.close().await;
            self.running.store(false, Ordering::Relaxed);
            info!("acquisition loop stopped");
        })
    }

    /// One tick. Returns a backoff to sleep when the error threshold is
    /// exceeded.
    async fn tick(&mut self) -> Option<Duration> {
        let reply = match self.client.send_command(POLL_COMMAND).await {
            Ok(reply) => reply,
            Err(e) => return self.handle_poll_error(e),
        };

        if self.consecutive_errors > 0 {
            info!(
                "sensor communication restored after {} attempts",
                self.consecutive_errors
            );
            self.consecutive_errors = 0;
            self.publish_status(StatusKind::Ok, None);
        }

        let mut frame = decode(&reply);

        if frame.all_positions_zero() {
            frame.status = StatusKind::Obstructed;
            warn!("sensor possibly obstructed: all positions are zero");
        }

        // broadcast status only on a transition, the frame itself carries
        // the tag every tick
        let current = self.status.read().status;
        if current != frame.status {
            self.publish_status(frame.status, None);
        }

        let changes = self.detector.detect(&frame);

        *self.last_frame.write() = Some(frame.clone());
        if !changes.is_empty() {
            *self.last_update.write() = Some(LatestUpdate {
                timestamp: now_ms(),
                changes: changes.clone(),
            });
        }

        // fan-out first, persistence never gates the realtime path
        self.hub.broadcast_metrics(&frame);
        if !changes.is_empty() {
            debug!("{} velocity changes detected", changes.len());
            self.hub.broadcast_changes(&changes);
        }

        for handler in &self.handlers {
            handler(&frame);
        }

        if self.writer.receiver_count() > 0 {
            let _ = self.writer.send(WriteBatch::Frame { frame, changes });
        }

        None
    }

    fn handle_poll_error(&mut self, e: Error) -> Option<Duration> {
        self.consecutive_errors += 1;
        error!(
            "sensor poll failed (attempt {}): {e}",
            self.consecutive_errors
        );
        self.client.mark_disconnected();

        if self.consecutive_errors > self.config.max_consecutive_errors {
            self.publish_status(StatusKind::CommFailure, Some(e.to_string()));
            return Some(self.config.reconnect_delay());
        }
        None
    }

    /// Updates the status record, broadcasts it and queues its persistence.
    fn publish_status(&mut self, kind: StatusKind, last_error: Option<String>) {
        let record = RadarStatus {
            status: kind,
            timestamp: now_ms(),
            last_error,
            error_count: self.consecutive_errors,
            connection_info: Some(self.client.addr()),
        };

        *self.status.write() = record.clone();
        self.hub.broadcast_status(&record);
        if self.writer.receiver_count() > 0 {
            let _ = self.writer.send(WriteBatch::Status(record));
        }

        if kind != StatusKind::Ok {
            warn!("sensor status changed to {kind}");
        } else {
            info!("sensor status is ok");
        }
    }
}
