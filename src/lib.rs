use std::env;
use std::sync::Arc;

use log::{info, warn};
use tokio::time::Duration;

pub mod config;
pub mod device;
pub mod error;

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::connection::ConnectionManager;
use crate::device::constants::heart_rate_descriptor;
use crate::device::monitor::MonitorSession;
use crate::device::permission::PermissionGate;
use crate::device::scanner::DeviceScanner;
use crate::device::transport::BtleTransport;
use crate::device::types::{PeripheralHandle, StateCell};
use crate::error::AppRunError;

pub fn init_logging() {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        // btleplug is chatty about every advertisement
        .level_for("btleplug", log::LevelFilter::Warn)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}

#[derive(Debug, Default)]
pub struct RunOptions {
    /// Overrides the configured peripheral name.
    pub device_name: Option<String>,
}

/// Drives the whole pipeline once: authorize, scan until the configured
/// peripheral shows up, connect, discover, then log decoded heart rate
/// samples until Ctrl-C or the peripheral disconnects.
pub async fn run(options: RunOptions) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync()?;
    let mut config_locker = config_io.locker()?;
    // one monitor instance per config file
    let _config_lock = config_locker.lock()?;

    let mut config: Config = config_io.read().await?;
    if let Some(device_name) = options.device_name {
        config.device_name = device_name;
    }

    let transport = Arc::new(BtleTransport::new().await?);
    let state = StateCell::new();

    let gate = PermissionGate::new(Arc::clone(&transport));
    gate.ensure_authorized().await?;

    let scanner = DeviceScanner::new(Arc::clone(&transport), state.clone());
    let mut manager = ConnectionManager::with_state(Arc::clone(&transport), state);
    manager.set_connect_deadline(Duration::from_secs(config.connect_timeout_secs));

    info!("Looking for \"{}\"", config.device_name);
    let target = config.device_name.clone();
    let mut scan = scanner
        .scan(move |peripheral: &PeripheralHandle| {
            peripheral.name.as_deref() == Some(target.as_str())
        })
        .await?;

    let Some(found) = scan.next().await else {
        warn!("Scan ended without finding \"{}\"", config.device_name);
        scan.stop().await;
        return Ok(());
    };
    scan.stop().await;

    manager.connect(found).await?;
    manager.discover_services().await?;

    let mut session = MonitorSession::start(&manager, heart_rate_descriptor()).await?;

    let mut errors_done = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                break;
            }
            sample = session.samples.recv() => match sample {
                Some(sample) => info!("{} bpm (#{})", sample.bpm, sample.seq),
                None => {
                    warn!("Monitor session ended");
                    break;
                }
            },
            error = session.errors.recv(), if !errors_done => match error {
                Some(error) => warn!("Protocol error: {}", error),
                None => errors_done = true,
            },
        }
    }

    session.stop().await;
    manager.disconnect().await;

    config_io.save(&config).await?;
    Ok(())
}
