//! LAN advertisement via multicast DNS service discovery.
//!
//! The service registers as `<hostname>-radar._sickradar._tcp.local.` with
//! the listening port and version/ip/name TXT records, so clients find the
//! server without hard-coded addresses. Failure to advertise is non-fatal:
//! the `/api/discover` endpoint keeps working either way.

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub const SERVICE_TYPE: &str = "_sickradar._tcp.local.";
pub const SERVICE_DOMAIN: &str = "local.";
pub const FRIENDLY_NAME: &str = "SICK Radar Monitor";

pub struct DiscoveryAdvertiser {
    daemon: Option<ServiceDaemon>,
    instance_name: String,
    host_name: String,
    port: u16,
    running: Arc<AtomicBool>,
}

impl DiscoveryAdvertiser {
    pub fn new(port: u16) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        Self {
            daemon: None,
            instance_name: format!("{hostname}-radar"),
            host_name: format!("{hostname}.{SERVICE_DOMAIN}"),
            port,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Detects the primary non-loopback IPv4 address to advertise.
    pub fn local_ip() -> Result<IpAddr> {
        local_ip_address::local_ip().context("failed to determine local IP address")
    }

    pub fn start(&mut self, version: &str) -> Result<()> {
        if self.running.load(Ordering::Relaxed) {
            return Ok(());
        }

        let ip = Self::local_ip()?;
        let daemon = ServiceDaemon::new().context("failed to start mDNS responder")?;

        let ip_text = ip.to_string();
        let properties = [
            ("version", version),
            ("ip", ip_text.as_str()),
            ("name", FRIENDLY_NAME),
        ];
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &self.instance_name,
            &self.host_name,
            ip,
            self.port,
            &properties[..],
        )
        .context("invalid mDNS service definition")?;

        daemon
            .register(service)
            .context("failed to register mDNS service")?;

        info!(
            "discovery advertiser started at {ip}:{} (mDNS: {}.{SERVICE_TYPE})",
            self.port, self.instance_name
        );
        self.daemon = Some(daemon);
        self.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            if let Err(e) = daemon.shutdown() {
                warn!("mDNS responder shutdown failed: {e}");
            }
            info!("discovery advertiser stopped");
        }
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }
}

impl Drop for DiscoveryAdvertiser {
    fn drop(&mut self) {
        self.stop();
    }
}
