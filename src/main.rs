//! Command-line monitor for the aquasense smart bottle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use btleplug::api::{BDAddr, Central, Manager as _};
use btleplug::platform::Manager;
use human_panic::setup_panic;

use aquasense::bluetooth::BleTransport;
use aquasense::{
    configure_logging, logging, AppConfig, FileCalibrationStore, SessionCoordinator, SessionEvent,
    SubjectId,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_panic!();

    let config = AppConfig::load().context("loading settings")?;
    configure_logging(config.log_level, logging::default_log_path(), true)
        .map_err(anyhow::Error::msg)?;

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("adapters") {
        return run_adapters().await;
    }

    let transport = BleTransport::new()
        .await
        .context("initializing Bluetooth radio")?
        .with_connect_timeout(config.connect_timeout());
    let store = FileCalibrationStore::with_default_path().context("opening calibration store")?;
    let coordinator =
        SessionCoordinator::new(Arc::new(transport), Arc::new(store), config.clone());

    let result = match args.get(1).map(String::as_str) {
        Some("scan") | None => run_scan(&coordinator, config.scan_timeout()).await,
        Some("monitor") => run_monitor(&coordinator, config.scan_timeout(), args.get(2)).await,
        Some(_) => {
            print_usage();
            Ok(())
        }
    };

    coordinator.shutdown().await;
    result
}

async fn run_adapters() -> anyhow::Result<()> {
    let manager = Manager::new().await.context("initializing Bluetooth manager")?;
    let adapters = manager.adapters().await.context("listing adapters")?;
    if adapters.is_empty() {
        println!("No Bluetooth adapters found.");
    }
    for adapter in adapters {
        let info = adapter
            .adapter_info()
            .await
            .unwrap_or_else(|_| "unknown adapter".to_string());
        println!("  {}", info);
    }
    Ok(())
}

async fn run_scan(
    coordinator: &SessionCoordinator,
    timeout: Duration,
) -> anyhow::Result<()> {
    println!("Scanning for bottles ({}s)...", timeout.as_secs());
    coordinator.start_scan().await?;
    tokio::time::sleep(timeout + Duration::from_millis(500)).await;

    let devices = coordinator.devices().await;
    if devices.is_empty() {
        println!("No bottles found.");
    }
    for device in devices {
        println!("  {}", device);
    }
    Ok(())
}

async fn run_monitor(
    coordinator: &SessionCoordinator,
    scan_timeout: Duration,
    address_arg: Option<&String>,
) -> anyhow::Result<()> {
    coordinator.set_active_subject(SubjectId::from("default"))?;

    println!("Scanning for bottles ({}s)...", scan_timeout.as_secs());
    coordinator.start_scan().await?;
    tokio::time::sleep(scan_timeout + Duration::from_millis(500)).await;

    let devices = coordinator.devices().await;
    let address = match address_arg {
        Some(raw) => raw
            .parse::<BDAddr>()
            .map_err(|err| anyhow::anyhow!("invalid address {}: {}", raw, err))?,
        None => devices.first().context("no bottle found")?.address,
    };

    coordinator.connect(address).await?;
    println!("Connected to {}. Press Ctrl-C to stop.", address);

    let (subscription, mut events) = coordinator.subscribe_readings();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(SessionEvent::Reading { reading, level }) => {
                    let volume = level
                        .volume_ml
                        .map(|ml| format!("{:.0}ml", ml))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:>7.1}mm  {:>5.1}%  {:>7}  [{}]",
                        reading.distance_mm, level.level_pct, volume, level.source
                    );
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    subscription.cancel();
    coordinator.disconnect().await?;
    Ok(())
}

fn print_usage() {
    println!("Usage: aquasense [COMMAND]");
    println!();
    println!("Commands:");
    println!("  adapters           List Bluetooth adapters");
    println!("  scan               Scan for nearby bottles (default)");
    println!("  monitor [ADDRESS]  Connect and stream level readings");
}
