//! Lists cast receivers as they appear on the local network.
//!
//! Usage:
//!   cargo run -p pmocast --example discover -- [seconds]

use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pmocast::{
    CastConfig, Device, DeviceScanner, DeviceScannerListener, MdnsDeviceScanner, ScannerEvent,
};

struct PrintListener;

impl DeviceScannerListener for PrintListener {
    fn device_did_change(&self, device: &Device) {
        println!("~ {} now reports {:?}", device.friendly_name, device.status_text);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let seconds = env::args()
        .nth(1)
        .and_then(|arg| arg.parse::<u64>().ok())
        .unwrap_or(20);

    let config = CastConfig::load(None)?;
    let scanner = MdnsDeviceScanner::with_options(config.scan_options());
    let listener: Arc<dyn DeviceScannerListener> = Arc::new(PrintListener);
    scanner.add_listener(&listener);
    let events = scanner.subscribe();

    scanner.start_scan()?;
    tracing::info!(seconds, "Browsing for cast receivers");

    let deadline = Instant::now() + Duration::from_secs(seconds);
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(ScannerEvent::DeviceOnline(device)) => println!(
                "+ {} [{}] at {} model={}",
                device.friendly_name,
                device.device_id,
                device.address(),
                device.model_name.as_deref().unwrap_or("?")
            ),
            Ok(ScannerEvent::DeviceOffline(device)) => {
                println!("- {} [{}]", device.friendly_name, device.device_id)
            }
            Ok(ScannerEvent::DeviceChanged(_)) => {}
            Err(_) => break,
        }
    }

    scanner.stop_scan();

    println!("=====================");
    let devices = scanner.devices();
    println!("Receivers found : {}", devices.len());
    for device in &devices {
        println!("- {} ({})", device.friendly_name, device.address());
    }
    Ok(())
}
