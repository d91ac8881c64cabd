//! Chromecast advertisement parsing.
//!
//! Receivers advertise themselves over mDNS on `_googlecast._tcp.local`.
//! A response carries a PTR record naming the instance, A/AAAA records for
//! the host, an SRV record for the port and a TXT record with `id`, `fn`,
//! `md` and `rs` keys.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::{debug, warn};

use crate::model::Device;

/// mDNS service browsed for cast receivers.
pub const GOOGLECAST_SERVICE: &str = "_googlecast._tcp.local";

/// Port used when the SRV record is missing.
pub const DEFAULT_CAST_PORT: u16 = 8009;

/// The parts of an mDNS response a [`Device`] is built from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Instance name from the PTR record.
    pub instance_name: String,
    pub addresses: Vec<IpAddr>,
    pub port: Option<u16>,
    pub txt: HashMap<String, String>,
}

impl Advertisement {
    /// Collects the records of `response`. Returns `None` without a PTR record.
    pub fn from_response(response: &mdns::Response) -> Option<Self> {
        let instance_name = response.records().find_map(|r| match r.kind {
            mdns::RecordKind::PTR(ref name) => Some(name.clone()),
            _ => None,
        });
        let Some(instance_name) = instance_name else {
            warn!("No PTR record found in mDNS response");
            return None;
        };

        let addresses = response
            .records()
            .filter_map(|r| match r.kind {
                mdns::RecordKind::A(addr) => Some(IpAddr::V4(addr)),
                mdns::RecordKind::AAAA(addr) => Some(IpAddr::V6(addr)),
                _ => None,
            })
            .collect();

        let port = response.records().find_map(|r| match r.kind {
            mdns::RecordKind::SRV { port, .. } => Some(port),
            _ => None,
        });

        let txt = response
            .records()
            .filter_map(|r| match r.kind {
                mdns::RecordKind::TXT(ref entries) => Some(parse_txt_entries(entries)),
                _ => None,
            })
            .flatten()
            .collect();

        Some(Self {
            instance_name,
            addresses,
            port,
            txt,
        })
    }

    /// Preferred address: the first IPv4 one, else the first of any family.
    pub fn preferred_address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| self.addresses.first())
            .copied()
    }

    /// Builds the device, or `None` when the response carried no address.
    pub fn to_device(&self, service_name: &str, default_port: u16) -> Option<Device> {
        let Some(ip) = self.preferred_address() else {
            warn!(instance = %self.instance_name, "No IP address found for cast device");
            return None;
        };
        let port = self.port.unwrap_or(default_port);

        let device_id = self
            .txt
            .get("id")
            .cloned()
            .unwrap_or_else(|| format!("chromecast-{ip}-{port}"));
        let friendly_name = self
            .txt
            .get("fn")
            .cloned()
            .unwrap_or_else(|| friendly_name_from_instance(&self.instance_name, service_name));

        let mut device = Device::new(device_id, friendly_name, ip, port);
        if let Some(model) = self.txt.get("md") {
            device = device.with_model_name(model.clone());
        }
        if let Some(status) = self.txt.get("rs").filter(|s| !s.is_empty()) {
            device = device.with_status_text(status.clone());
        }

        debug!(
            device_id = %device.device_id,
            name = %device.friendly_name,
            address = %device.address(),
            model = ?device.model_name,
            "Parsed cast advertisement"
        );
        Some(device)
    }
}

/// Splits `key=value` TXT entries. Entries without `=` are dropped.
pub fn parse_txt_entries(entries: &[String]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Derives a display name from an instance name such as
/// `Chromecast-Audio-0123456789abcdef0123456789abcdef._googlecast._tcp.local`.
///
/// The service suffix and the 32-character hex id are removed.
pub fn friendly_name_from_instance(instance_name: &str, service_name: &str) -> String {
    let suffix = format!(".{}", service_name.trim_start_matches('.'));
    let base = instance_name
        .strip_suffix(&suffix)
        .unwrap_or(instance_name);

    let name = base
        .split('-')
        .take_while(|part| !(part.len() == 32 && part.chars().all(|c| c.is_ascii_hexdigit())))
        .collect::<Vec<_>>()
        .join("-");

    let name = name.trim();
    if name.is_empty() {
        "Unknown Chromecast".to_string()
    } else {
        name.to_string()
    }
}
