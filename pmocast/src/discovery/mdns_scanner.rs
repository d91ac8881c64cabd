use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, bounded};
use futures_util::{StreamExt, pin_mut};
use tracing::{debug, info, warn};

use super::chromecast_discovery::{Advertisement, DEFAULT_CAST_PORT, GOOGLECAST_SERVICE};
use crate::errors::{CastError, CastResult};
use crate::events::ScannerEvent;
use crate::model::Device;
use crate::scanner::{DeviceScanner, DeviceScannerListener, ScannerCore};

/// Tuning of the mDNS browse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanOptions {
    pub service_name: String,
    /// Port assumed when a response has no SRV record.
    pub default_port: u16,
    /// Interval between mDNS queries.
    pub query_interval: Duration,
    /// A device not seen for this long goes offline.
    pub device_max_age: Duration,
    /// Granularity of the stop check and of expiry.
    pub tick: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            service_name: GOOGLECAST_SERVICE.to_string(),
            default_port: DEFAULT_CAST_PORT,
            query_interval: Duration::from_secs(15),
            device_max_age: Duration::from_secs(1800),
            tick: Duration::from_millis(500),
        }
    }
}

/// Scanner browsing for cast receivers over mDNS.
///
/// The browse runs on a dedicated thread between [`DeviceScanner::start_scan`]
/// and [`DeviceScanner::stop_scan`]. Devices found stay in the collection
/// after the scan stops.
pub struct MdnsDeviceScanner {
    core: ScannerCore,
    options: ScanOptions,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for MdnsDeviceScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl MdnsDeviceScanner {
    pub fn new() -> Self {
        Self::with_options(ScanOptions::default())
    }

    pub fn with_options(options: ScanOptions) -> Self {
        Self {
            core: ScannerCore::new(options.device_max_age),
            options,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Records a sighting obtained outside the mDNS browse.
    pub fn observe(&self, device: Device) {
        self.core.observe(device);
    }

    /// Reports `device_id` offline and drops it.
    pub fn forget(&self, device_id: &str) {
        self.core.forget(device_id);
    }

    /// Reports offline every device older than the max age.
    pub fn expire_stale(&self) {
        self.core.expire();
    }
}

impl DeviceScanner for MdnsDeviceScanner {
    fn add_listener(&self, listener: &Arc<dyn DeviceScannerListener>) {
        self.core.add_listener(listener);
    }

    fn subscribe(&self) -> Receiver<ScannerEvent> {
        self.core.subscribe()
    }

    fn devices(&self) -> Vec<Device> {
        self.core.devices()
    }

    fn start_scan(&self) -> CastResult<()> {
        let mut worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CastError::invalid_state("a scan is already running"));
        }
        // A previous browse may have ended on its own.
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }

        let (ready_tx, ready_rx) = bounded::<CastResult<()>>(1);
        let core = self.core.clone();
        let options = self.options.clone();
        let running = Arc::clone(&self.running);

        let spawned = thread::Builder::new()
            .name("pmocast-mdns".into())
            .spawn(move || {
                let discovery =
                    match mdns::discover::all(&options.service_name, options.query_interval) {
                        Ok(discovery) => discovery,
                        Err(err) => {
                            running.store(false, Ordering::SeqCst);
                            let _ = ready_tx.send(Err(CastError::network(format!(
                                "cannot start mDNS discovery: {err}"
                            ))));
                            return;
                        }
                    };
                let _ = ready_tx.send(Ok(()));
                browse(discovery, &core, &options, &running);
                running.store(false, Ordering::SeqCst);
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(CastError::network(format!(
                    "cannot spawn mDNS thread: {err}"
                )));
            }
        };

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(CastError::network("mDNS thread exited before starting"))
        });
        match ready {
            Ok(()) => {
                info!(service = %self.options.service_name, "Cast device scan started");
                *worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                let _ = handle.join();
                warn!(error = %err, "Cast device scan failed to start");
                Err(err)
            }
        }
    }

    fn stop_scan(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(handle) = handle {
            // A listener may stop the scan from the browse thread itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        info!("Cast device scan stopped");
    }

    fn is_scanning(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for MdnsDeviceScanner {
    fn drop(&mut self) {
        self.stop_scan();
    }
}

fn browse(
    discovery: mdns::discover::Discovery,
    core: &ScannerCore,
    options: &ScanOptions,
    running: &AtomicBool,
) {
    async_std::task::block_on(async {
        let stream = discovery.listen();
        pin_mut!(stream);

        while running.load(Ordering::SeqCst) {
            match async_std::future::timeout(options.tick, stream.next()).await {
                Ok(Some(Ok(response))) => {
                    if let Some(device) = Advertisement::from_response(&response)
                        .and_then(|ad| ad.to_device(&options.service_name, options.default_port))
                    {
                        core.observe(device);
                    }
                }
                Ok(Some(Err(err))) => warn!(error = %err, "mDNS receive error"),
                Ok(None) => {
                    warn!("mDNS stream ended");
                    break;
                }
                Err(_) => {}
            }
            core.expire();
        }
    });
    debug!("mDNS browse thread exiting");
}
