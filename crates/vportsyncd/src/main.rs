//! Datapath Vport Synchronization Daemon
//!
//! Main entry point for the vportsyncd daemon.
//! Listens for kernel link events and keeps the datapath port table, its
//! multicast listeners and its sysfs tree in step with them.

use anyhow::{Context, Result};
use clap::Parser;
use sonic_vportsyncd::{
    Delivery, DeviceEvent, DeviceEventDispatcher, DirSysfs, MetricsCollector, MetricsServerConfig,
    MulticastHub, PortBinder, ShutdownCoordinator, SystemdNotifier, VportInfoBuilder, VportTable,
    VportsyncConfig, config_file::DEFAULT_CONFIG_PATH, spawn_metrics_server,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Poll interval when no link events are queued
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Systemd watchdog keepalive interval
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

/// Datapath vport synchronization daemon
#[derive(Parser, Debug)]
#[command(name = "vportsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("vportsyncd: Starting datapath vport synchronization daemon");

    match run_daemon(args).await {
        Ok(()) => {
            info!("vportsyncd: Daemon exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "vportsyncd: Daemon exiting with error");
            Err(e)
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set logger")?;
    Ok(())
}

/// Everything the event loop needs
struct Daemon {
    table: Arc<VportTable>,
    binder: PortBinder,
    dispatcher: DeviceEventDispatcher,
    metrics: Arc<MetricsCollector>,
}

impl Daemon {
    fn build(config: &VportsyncConfig, hub: Arc<MulticastHub>) -> Result<Self> {
        let metrics = Arc::new(MetricsCollector::new().context("Failed to create metrics")?);
        let sysfs = Arc::new(
            DirSysfs::new(&config.sysfs.root, &config.datapath.name)
                .context("Failed to create sysfs tree")?,
        );
        let table = Arc::new(
            VportTable::new(config.datapath.name.clone(), config.datapath.ifindex)
                .with_sysfs(sysfs.clone()),
        );
        let builder = Arc::new(VportInfoBuilder::new(config.notify.max_message_size));

        let binder = PortBinder::new(table.clone(), sysfs.clone(), config.clone());
        let dispatcher =
            DeviceEventDispatcher::new(table.clone(), builder, hub, sysfs, config.group())
                .with_metrics(metrics.clone());

        Ok(Self {
            table,
            binder,
            dispatcher,
            metrics,
        })
    }

    fn process(&self, event: &DeviceEvent) {
        if let Err(e) = self.binder.on_event(event) {
            warn!(name = %event.dev.name(), error = %e, "Failed to bind port");
        }
        self.dispatcher.handle(event);
        self.metrics.set_ports(self.table.len());
    }
}

async fn run_daemon(args: Args) -> Result<()> {
    let config = VportsyncConfig::load_or_default(&args.config)?;
    config.validate()?;
    info!(
        datapath = %config.datapath.name,
        ports = config.datapath.ports.len(),
        group = %config.notify.group_name,
        "Loaded configuration"
    );

    let shutdown = ShutdownCoordinator::default();
    shutdown.install_signal_handlers();
    let notifier = SystemdNotifier::new();

    let hub = Arc::new(MulticastHub::new(config.notify.queue_depth));
    let daemon = Daemon::build(&config, hub.clone())?;

    if config.metrics.enabled {
        spawn_metrics_server(
            MetricsServerConfig::new(config.metrics.listen_addr),
            daemon.metrics.clone(),
        )
        .await?;
    }

    let log_task = spawn_notification_log(&hub, config.notify.group_id);
    run_event_loop(&daemon, &notifier, &shutdown).await?;

    notifier.notify_stopping()?;
    info!(ports = daemon.table.len(), "vportsyncd: Performing graceful shutdown");

    // The log listener ends once every hub handle is gone and its queue is empty
    drop(daemon);
    drop(hub);
    if !drain_within(log_task, shutdown.timeout()).await {
        warn!(
            timeout_secs = shutdown.timeout().as_secs(),
            "vportsyncd: Notification log not drained before shutdown timeout"
        );
    }
    Ok(())
}

/// Wait up to `timeout` for `task` to finish
async fn drain_within(task: JoinHandle<()>, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, task).await.is_ok()
}

/// Log every notification sent on the vport group
fn spawn_notification_log(hub: &MulticastHub, group: u32) -> JoinHandle<()> {
    let mut subscription = hub.subscribe(group, std::process::id());
    tokio::spawn(async move {
        while let Some(delivery) = subscription.recv().await {
            match delivery {
                Delivery::Message(msg) => info!(
                    command = ?msg.command(),
                    port_no = msg.port_no(),
                    bytes = msg.len(),
                    "Vport notification"
                ),
                Delivery::Error(errno) => warn!(errno, "Vport notification error"),
            }
        }
    })
}

#[cfg(target_os = "linux")]
async fn run_event_loop(
    daemon: &Daemon,
    notifier: &SystemdNotifier,
    shutdown: &ShutdownCoordinator,
) -> Result<()> {
    use sonic_vportsyncd::LinkMonitor;

    let mut monitor = LinkMonitor::new()?;
    daemon.metrics.set_netlink_connected(true);
    monitor.request_dump()?;

    notifier.notify_ready()?;
    notifier.notify_status("Processing link events")?;
    info!("vportsyncd: Starting event processing loop");

    let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
    while !shutdown.should_shutdown() {
        match monitor.try_receive_events() {
            Ok(Some(events)) => {
                for event in &events {
                    daemon.process(event);
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to receive link events"),
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = watchdog.tick() => notifier.notify_watchdog()?,
        }
    }

    daemon.metrics.set_netlink_connected(false);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run_event_loop(
    _daemon: &Daemon,
    _notifier: &SystemdNotifier,
    _shutdown: &ShutdownCoordinator,
) -> Result<()> {
    anyhow::bail!("link monitoring requires Linux netlink")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_vportsyncd::{DeviceEventKind, NetDevice, PortEntry, VportKind};
    use tempfile::TempDir;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["vportsyncd"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_daemon_binds_then_unbinds() {
        let dir = TempDir::new().unwrap();
        let mut config = VportsyncConfig::default();
        config.sysfs.root = dir.path().to_path_buf();
        config.datapath.ports.push(PortEntry {
            port_no: 1,
            interface: "Ethernet0".to_string(),
            kind: VportKind::Netdev,
            upcall_pid: 0,
        });

        let hub = Arc::new(MulticastHub::default());
        let mut listener = hub.subscribe(config.notify.group_id, 42);
        let daemon = Daemon::build(&config, hub).unwrap();

        let dev = NetDevice::new(10, "Ethernet0");
        daemon.process(&DeviceEvent::new(DeviceEventKind::Register, dev.clone()));
        assert_eq!(daemon.table.len(), 1);

        daemon.process(&DeviceEvent::new(DeviceEventKind::Unregister, dev));
        assert!(daemon.table.is_empty());
        assert_eq!(listener.drain().len(), 1);
        assert!(daemon.metrics.gather_metrics().contains("vportsyncd_ports 0"));
    }

    #[tokio::test]
    async fn test_notification_log_drains_once_hub_is_dropped() {
        let hub = MulticastHub::default();
        let log_task = spawn_notification_log(&hub, 1);
        drop(hub);
        assert!(drain_within(log_task, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_timeout() {
        let hub = MulticastHub::default();
        let log_task = spawn_notification_log(&hub, 1);
        assert!(!drain_within(log_task, Duration::from_millis(10)).await);
        drop(hub);
    }
}
