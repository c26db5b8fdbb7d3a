//! Optional industrial-controller mirror.
//!
//! The acquisition loop pushes every frame into this service through a
//! small lossy channel; a mirror loop holds the latest frame and writes it
//! to the controller's data block at its own cadence. The fieldbus driver
//! itself lives behind the [`ControllerLink`] trait — this crate ships only
//! the register layout and the mirroring policy, not an S7 implementation.

use crate::config::PlcConfig;
use crate::models::{RadarFrame, CHANNELS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pending frames between the acquisition loop and the mirror loop. Only
/// the freshest matters, so the queue is tiny and overflow drops.
const MIRROR_QUEUE_SIZE: usize = 10;

/// Seam for a concrete fieldbus driver.
pub trait ControllerLink: Send + 'static {
    fn connect(&mut self) -> std::io::Result<()>;
    fn write_real(&mut self, data_block: u16, byte_offset: u16, value: f32) -> std::io::Result<()>;
    fn write_int(&mut self, data_block: u16, byte_offset: u16, value: i16) -> std::io::Result<()>;
    fn disconnect(&mut self);
}

/// One mapped controller register.
#[derive(Debug, Clone, Copy)]
pub struct MapPoint {
    pub data_block: u16,
    pub byte_offset: u16,
}

/// Register layout mirrored into the controller: seven velocity REALs,
/// seven position REALs, one status INT, packed into a single data block.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    pub velocities: [MapPoint; CHANNELS],
    pub positions: [MapPoint; CHANNELS],
    pub status: MapPoint,
}

impl Default for RegisterMap {
    fn default() -> Self {
        const DB: u16 = 10;
        let mut velocities = [MapPoint { data_block: DB, byte_offset: 0 }; CHANNELS];
        let mut positions = [MapPoint { data_block: DB, byte_offset: 0 }; CHANNELS];
        for i in 0..CHANNELS {
            velocities[i].byte_offset = (i as u16) * 4;
            positions[i].byte_offset = 28 + (i as u16) * 4;
        }
        Self {
            velocities,
            positions,
            status: MapPoint { data_block: DB, byte_offset: 56 },
        }
    }
}

#[derive(Clone)]
pub struct PlcService {
    inner: Arc<PlcInner>,
}

struct PlcInner {
    config: PlcConfig,
    tx: mpsc::Sender<RadarFrame>,
    running: Arc<AtomicBool>,
}

impl PlcService {
    /// Spawns the mirror loop and returns the handle the acquisition loop
    /// registers as a metrics handler.
    pub fn start(
        config: PlcConfig,
        link: Box<dyn ControllerLink>,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RadarFrame>(MIRROR_QUEUE_SIZE);
        let running = Arc::new(AtomicBool::new(config.enabled));
        let map = RegisterMap::default();

        let loop_config = config.clone();
        let loop_running = running.clone();
        let handle = tokio::spawn(async move {
            if !loop_config.enabled {
                return;
            }
            info!(
                "controller mirror started for {} (rack {}, slot {})",
                loop_config.host, loop_config.rack, loop_config.slot
            );

            let mut link = link;
            let mut connected = false;
            let mut latest: Option<RadarFrame> = None;
            let mut ticker =
                tokio::time::interval(Duration::from_millis(loop_config.update_rate_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    frame = rx.recv() => match frame {
                        Some(frame) => latest = Some(frame),
                        None => break,
                    },
                    _ = ticker.tick() => {
                        let Some(frame) = latest.as_ref() else { continue };
                        if !connected {
                            match link.connect() {
                                Ok(()) => connected = true,
                                Err(e) => {
                                    warn!("controller unreachable: {e}");
                                    continue;
                                }
                            }
                        }
                        if let Err(e) = mirror_frame(link.as_mut(), &map, frame) {
                            warn!("controller write failed: {e}");
                            connected = false;
                            link.disconnect();
                        }
                    }
                }
            }

            link.disconnect();
            loop_running.store(false, Ordering::Relaxed);
            info!("controller mirror stopped");
        });

        (
            Self {
                inner: Arc::new(PlcInner { config, tx, running }),
            },
            handle,
        )
    }

    /// Metrics handler entry point; lossy under mirror-loop back-pressure.
    pub fn handle_frame(&self, frame: &RadarFrame) {
        if !self.inner.config.enabled {
            return;
        }
        if self.inner.tx.try_send(frame.clone()).is_err() {
            warn!("controller mirror queue full, dropping update");
        }
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.inner.running.clone()
    }
}

fn mirror_frame(
    link: &mut dyn ControllerLink,
    map: &RegisterMap,
    frame: &RadarFrame,
) -> std::io::Result<()> {
    for i in 0..CHANNELS {
        let point = map.velocities[i];
        link.write_real(point.data_block, point.byte_offset, frame.velocities[i] as f32)?;
        let point = map.positions[i];
        link.write_real(point.data_block, point.byte_offset, frame.positions[i] as f32)?;
    }
    link.write_int(map.status.data_block, map.status.byte_offset, frame.status as i16)?;
    debug!("mirrored frame to controller");
    Ok(())
}

/// Placeholder link used until a real fieldbus driver is plugged in: it
/// accepts every write and only logs at trace level.
pub struct LoggingLink;

impl ControllerLink for LoggingLink {
    fn connect(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn write_real(&mut self, data_block: u16, byte_offset: u16, value: f32) -> std::io::Result<()> {
        tracing::trace!("DB{data_block}.{byte_offset} <- {value}");
        Ok(())
    }

    fn write_int(&mut self, data_block: u16, byte_offset: u16, value: i16) -> std::io::Result<()> {
        tracing::trace!("DB{data_block}.{byte_offset} <- {value}");
        Ok(())
    }

    fn disconnect(&mut self) {}
}
