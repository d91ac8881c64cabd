//! Device scanning contract and the reconciliation shared by every scanner.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tracing::{debug, info};

use crate::errors::CastResult;
use crate::events::{EventBus, ScannerEvent};
use crate::model::Device;

/// Observer of scanner events. Every callback is optional.
pub trait DeviceScannerListener: Send + Sync {
    /// A device was discovered or came back online.
    fn device_did_come_online(&self, _device: &Device) {}

    /// A device went offline.
    fn device_did_go_offline(&self, _device: &Device) {}

    /// A property other than the device ID, IP address or service port
    /// changed. Changes to those three are reported as offline + online.
    fn device_did_change(&self, _device: &Device) {}
}

pub trait DeviceScanner: Send + Sync {
    /// Registers a listener. Only a weak reference is kept: the caller owns
    /// the listener's lifetime.
    fn add_listener(&self, listener: &Arc<dyn DeviceScannerListener>);

    /// Channel form of the listener callbacks.
    fn subscribe(&self) -> Receiver<ScannerEvent>;

    /// Devices currently known to be online, in no particular order.
    fn devices(&self) -> Vec<Device>;

    /// Starts discovery in the background.
    fn start_scan(&self) -> CastResult<()>;

    fn stop_scan(&self);

    fn is_scanning(&self) -> bool;
}

struct KnownDevice {
    device: Device,
    last_seen: Instant,
}

/// The set of online devices, keyed by device ID.
///
/// Turns raw sightings into online/offline/changed events.
pub struct DeviceDirectory {
    devices: HashMap<String, KnownDevice>,
    max_age: Duration,
}

impl DeviceDirectory {
    pub fn new(max_age: Duration) -> Self {
        Self {
            devices: HashMap::new(),
            max_age,
        }
    }

    /// Records a sighting of `device` at `now`.
    pub fn observe(&mut self, device: Device, now: Instant) -> Vec<ScannerEvent> {
        let mut events = Vec::new();

        match self.devices.get_mut(&device.device_id) {
            Some(known) if known.device.same_endpoint(&device) => {
                known.last_seen = now;
                if known.device != device {
                    known.device = device.clone();
                    events.push(ScannerEvent::DeviceChanged(device));
                }
            }
            Some(known) => {
                let old = std::mem::replace(&mut known.device, device.clone());
                known.last_seen = now;
                events.push(ScannerEvent::DeviceOffline(old));
                events.push(ScannerEvent::DeviceOnline(device));
            }
            None => {
                self.devices.insert(
                    device.device_id.clone(),
                    KnownDevice {
                        device: device.clone(),
                        last_seen: now,
                    },
                );
                events.push(ScannerEvent::DeviceOnline(device));
            }
        }

        events
    }

    /// Drops `device_id`, reporting it offline if it was known.
    pub fn remove(&mut self, device_id: &str) -> Option<ScannerEvent> {
        self.devices
            .remove(device_id)
            .map(|known| ScannerEvent::DeviceOffline(known.device))
    }

    /// Reports offline every device not seen for longer than the max age.
    pub fn expire(&mut self, now: Instant) -> Vec<ScannerEvent> {
        let max_age = self.max_age;
        let stale: Vec<String> = self
            .devices
            .iter()
            .filter(|(_, known)| now.saturating_duration_since(known.last_seen) > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    /// Removes everything, reporting each device offline.
    pub fn clear(&mut self) -> Vec<ScannerEvent> {
        self.devices
            .drain()
            .map(|(_, known)| ScannerEvent::DeviceOffline(known.device))
            .collect()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.values().map(|k| k.device.clone()).collect()
    }

    pub fn get(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id).map(|k| &k.device)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Directory + listeners + event bus, shared by scanner implementations.
#[derive(Clone)]
pub struct ScannerCore {
    directory: Arc<Mutex<DeviceDirectory>>,
    listeners: Arc<Mutex<Vec<Weak<dyn DeviceScannerListener>>>>,
    bus: EventBus<ScannerEvent>,
}

impl ScannerCore {
    pub fn new(max_age: Duration) -> Self {
        Self {
            directory: Arc::new(Mutex::new(DeviceDirectory::new(max_age))),
            listeners: Arc::new(Mutex::new(Vec::new())),
            bus: EventBus::new(),
        }
    }

    pub fn add_listener(&self, listener: &Arc<dyn DeviceScannerListener>) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.push(Arc::downgrade(listener));
    }

    pub fn subscribe(&self) -> Receiver<ScannerEvent> {
        self.bus.subscribe()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.with_directory(|directory| directory.devices())
    }

    pub fn observe(&self, device: Device) {
        let events = self.with_directory(|directory| directory.observe(device, Instant::now()));
        self.dispatch(events);
    }

    pub fn forget(&self, device_id: &str) {
        let events: Vec<ScannerEvent> = self
            .with_directory(|directory| directory.remove(device_id))
            .into_iter()
            .collect();
        self.dispatch(events);
    }

    pub fn expire(&self) {
        let events = self.with_directory(|directory| directory.expire(Instant::now()));
        self.dispatch(events);
    }

    pub fn clear(&self) {
        let events = self.with_directory(DeviceDirectory::clear);
        self.dispatch(events);
    }

    fn with_directory<R>(&self, f: impl FnOnce(&mut DeviceDirectory) -> R) -> R {
        let mut directory = self
            .directory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut directory)
    }

    /// Delivers events to listeners and subscribers, outside the directory lock.
    fn dispatch(&self, events: Vec<ScannerEvent>) {
        if events.is_empty() {
            return;
        }

        let listeners: Vec<Arc<dyn DeviceScannerListener>> = {
            let mut listeners = self
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            listeners.retain(|weak| weak.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };

        for event in events {
            match &event {
                ScannerEvent::DeviceOnline(device) => {
                    info!(device_id = %device.device_id, name = %device.friendly_name, address = %device.address(), "Device online");
                    listeners.iter().for_each(|l| l.device_did_come_online(device));
                }
                ScannerEvent::DeviceOffline(device) => {
                    info!(device_id = %device.device_id, name = %device.friendly_name, "Device offline");
                    listeners.iter().for_each(|l| l.device_did_go_offline(device));
                }
                ScannerEvent::DeviceChanged(device) => {
                    debug!(device_id = %device.device_id, name = %device.friendly_name, "Device changed");
                    listeners.iter().for_each(|l| l.device_did_change(device));
                }
            }
            self.bus.broadcast(event);
        }
    }
}
