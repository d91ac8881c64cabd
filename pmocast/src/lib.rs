//! # pmocast
//!
//! Discovery of cast receivers, connection and application session
//! management, and remote media playback control.
//!
//! A [`DeviceScanner`] finds receivers. A [`DeviceManager`] built for one of
//! them opens the link and launches a receiver application. A
//! [`MediaControlChannel`] attached to that session loads and controls
//! media. Every component reports what happens through a `subscribe()`
//! channel of typed events.
//!
//! ```no_run
//! use std::sync::Arc;
//! use pmocast::{
//!     CastDeviceManager, CastMediaChannel, DeviceManager, DeviceManagerEvent,
//!     DeviceScanner, MdnsDeviceScanner, ScannerEvent,
//! };
//!
//! let scanner = MdnsDeviceScanner::new();
//! let found = scanner.subscribe();
//! scanner.start_scan()?;
//!
//! if let Ok(ScannerEvent::DeviceOnline(device)) = found.recv() {
//!     let manager = CastDeviceManager::new(device, "pmocast-demo");
//!     let events = manager.subscribe();
//!     manager.connect();
//!     while let Ok(event) = events.recv() {
//!         if event == DeviceManagerEvent::Connected {
//!             manager.launch_application(pmocast::DEFAULT_MEDIA_RECEIVER_APP_ID)?;
//!         }
//!         if let DeviceManagerEvent::ApplicationConnected(_) = event {
//!             manager.add_channel(Arc::new(CastMediaChannel::new()))?;
//!             break;
//!         }
//!     }
//! }
//! # Ok::<(), pmocast::CastError>(())
//! ```

mod chromecast_transport;

pub mod channel;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod manager;
pub mod media;
pub mod model;
pub mod request;
pub mod scanner;
pub mod transport;

pub use channel::{CastChannel, CastMediaChannel, MediaControlChannel};
pub use chromecast_transport::RustCastTransport;
pub use config::CastConfig;
pub use discovery::{MdnsDeviceScanner, ScanOptions};
pub use errors::{CastError, CastErrorCode, CastResult};
pub use events::{DeviceManagerEvent, EventBus, MediaChannelEvent, MediaCommand, ScannerEvent};
pub use manager::{CastDeviceManager, ChannelLink, DeviceManager, ManagerOptions};
pub use media::{MediaInformation, MediaMetadata, MediaStatus, guess_content_type};
pub use model::{ConnectionState, Device, DeviceIdentity, IdleReason, PlayerState, StreamType};
pub use request::{RequestId, RequestKind};
pub use scanner::{DeviceDirectory, DeviceScanner, DeviceScannerListener};
pub use transport::{
    ApplicationMetadata, CastTransport, DEFAULT_MEDIA_RECEIVER_APP_ID, MEDIA_NAMESPACE,
    TransportFactory,
};
