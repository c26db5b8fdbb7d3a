//! Server assembly: builds every subcomponent from the configuration,
//! wires them together and owns the start/shutdown sequencing.

use crate::config::Config;
use crate::discovery::{DiscoveryAdvertiser, FRIENDLY_NAME};
use crate::http::{build_router, AppState};
use crate::hub::{Hub, SEND_QUEUE_SIZE};
use crate::models::RadarStatus;
use crate::plc::{LoggingLink, PlcService};
use crate::radar::RadarService;
use crate::state::new_state;
use crate::store::StoreService;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Static coordinates served by `/info` and `/api/discover`.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub ip: String,
    pub port: u16,
    pub ws_url: String,
    pub api_url: String,
    pub start_time: OffsetDateTime,
}

impl ServerInfo {
    pub fn new(ip: String, port: u16) -> Self {
        Self {
            name: FRIENDLY_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ws_url: format!("ws://{ip}:{port}/ws"),
            api_url: format!("http://{ip}:{port}/api"),
            ip,
            port,
            start_time: OffsetDateTime::now_utc(),
        }
    }
}

pub struct Server {
    config: Config,
    state: AppState,
    advertiser: DiscoveryAdvertiser,
    radar: Option<RadarService>,
    plc: Option<(PlcService, JoinHandle<()>)>,
    writer_handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self> {
        let (shutdown_tx, _) = watch::channel(false);

        // shared between the acquisition loop, the hub and the HTTP surface
        let status = new_state(RadarStatus::initializing());
        let last_frame = new_state(None);
        let last_update = new_state(None);

        let store = StoreService::connect(config.store.clone()).await;
        let (writer, writer_handle) = store.spawn_writer(shutdown_tx.subscribe());

        let hub = Hub::new(
            SEND_QUEUE_SIZE,
            status.clone(),
            last_frame.clone(),
            store.clone(),
        );

        let mut radar = RadarService::new(
            config.radar.clone(),
            hub.clone(),
            writer,
            status.clone(),
            last_frame.clone(),
            last_update.clone(),
        );

        let plc = if config.plc.enabled {
            let (service, handle) = PlcService::start(
                config.plc.clone(),
                Box::new(LoggingLink),
                shutdown_tx.subscribe(),
            );
            let mirror = service.clone();
            radar.register_metrics_handler(Arc::new(move |frame| mirror.handle_frame(frame)));
            Some((service, handle))
        } else {
            None
        };

        let advertiser = DiscoveryAdvertiser::new(config.server.port);
        let ip = DiscoveryAdvertiser::local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        let info = Arc::new(ServerInfo::new(ip, config.server.port));

        let state = AppState {
            hub,
            store,
            status,
            last_frame,
            last_update,
            info,
            radar_running: radar.running_flag(),
            advertiser_running: advertiser.running_flag(),
            plc_enabled: config.plc.enabled,
            plc_running: plc
                .as_ref()
                .map(|(service, _)| service.running_flag())
                .unwrap_or_else(|| Arc::new(AtomicBool::new(false))),
        };

        Ok(Self {
            config,
            state,
            advertiser,
            radar: Some(radar),
            plc,
            writer_handle,
            shutdown_tx,
        })
    }

    /// Runs until the process receives an interrupt, then shuts every
    /// component down under the configured grace period.
    pub async fn run(mut self) -> Result<()> {
        // advertiser failure is non-fatal, /api/discover still answers
        if let Err(e) = self.advertiser.start(&self.state.info.version) {
            warn!("discovery advertiser failed to start: {e:#}");
        }

        let ping_handle = self.state.hub.spawn_ping_task(self.shutdown_tx.subscribe());
        let radar = self.radar.take().expect("run is called once");
        let radar_handle = radar.spawn(self.shutdown_tx.subscribe());

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.server.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        self.log_startup();

        let app = build_router(self.state.clone());
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

        info!("shutting down");
        self.advertiser.stop();

        let _ = self.shutdown_tx.send(true);
        let grace = Duration::from_secs(self.config.server.shutdown_timeout_secs);

        // acquisition loop closes the sensor session on exit
        await_bounded("acquisition loop", radar_handle, grace).await;
        await_bounded("persistence worker", self.writer_handle, grace).await;
        await_bounded("hub ping task", ping_handle, grace).await;
        if let Some((_, plc_handle)) = self.plc.take() {
            await_bounded("controller mirror", plc_handle, grace).await;
        }

        self.state.hub.shutdown();
        self.state.store.close().await;

        info!("shutdown complete");
        Ok(())
    }

    fn log_startup(&self) {
        let info = &self.state.info;
        info!("{} v{} ready", info.name, info.version);
        info!("listening on {}:{}", info.ip, info.port);
        info!("realtime endpoint: {}", info.ws_url);
        info!("api endpoint: {}", info.api_url);
        info!(
            "sensor: {} ({} protocol)",
            self.config.radar.addr(),
            self.config.radar.protocol
        );
        info!(
            "store: {}:{} (enabled: {})",
            self.config.store.host, self.config.store.port, self.config.store.enabled
        );
    }
}

async fn await_bounded(name: &str, handle: JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{name} panicked: {e}"),
        Err(_) => warn!("{name} did not stop within {grace:?}"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
