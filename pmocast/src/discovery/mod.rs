//! Cast receiver discovery over mDNS.

pub mod chromecast_discovery;
pub mod mdns_scanner;

pub use chromecast_discovery::{
    Advertisement, DEFAULT_CAST_PORT, GOOGLECAST_SERVICE, friendly_name_from_instance,
    parse_txt_entries,
};
pub use mdns_scanner::{MdnsDeviceScanner, ScanOptions};
