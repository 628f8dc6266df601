//! Systemd integration and graceful shutdown for the vportsyncd daemon

use crate::error::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Systemd notification for notify-on-ready and watchdog
///
/// Enabled when run under systemd with Type=notify (NOTIFY_SOCKET set).
/// Every call is a no-op otherwise.
#[derive(Clone, Debug)]
pub struct SystemdNotifier {
    enabled: bool,
}

impl SystemdNotifier {
    pub fn new() -> Self {
        let enabled = std::env::var_os("NOTIFY_SOCKET").is_some();
        if enabled {
            debug!("Systemd notification socket detected");
        }
        Self { enabled }
    }

    /// Tell systemd initialization is complete
    pub fn notify_ready(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        sd_notify::notify(false, &[sd_notify::NotifyState::Ready])?;
        info!("Sent READY notification to systemd");
        Ok(())
    }

    /// Watchdog keepalive
    pub fn notify_watchdog(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog])?;
        Ok(())
    }

    /// Status line shown by `systemctl status`
    pub fn notify_status(&self, message: &str) -> Result<()> {
        if !self.enabled {
            debug!(status = message, "Status");
            return Ok(());
        }
        sd_notify::notify(false, &[sd_notify::NotifyState::Status(message)])?;
        Ok(())
    }

    /// Tell systemd the daemon is shutting down
    pub fn notify_stopping(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        sd_notify::notify(false, &[sd_notify::NotifyState::Stopping])?;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for SystemdNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Graceful shutdown coordinator
#[derive(Clone, Debug)]
pub struct ShutdownCoordinator {
    shutdown_requested: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// Request graceful shutdown
    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::Relaxed) {
            info!("Graceful shutdown requested");
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Bound on the time spent draining in-flight work
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Request shutdown on SIGINT/SIGTERM
    pub fn install_signal_handlers(&self) {
        let ctrl_c = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT");
                ctrl_c.request_shutdown();
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let term = self.clone();
            tokio::spawn(async move {
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    info!("Received SIGTERM");
                    term.request_shutdown();
                }
            });
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
