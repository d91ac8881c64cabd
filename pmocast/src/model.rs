use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::errors::{CastError, CastErrorCode};

/// Generates a fieldless enum with fixed wire values, its `code()` accessor
/// and a `TryFrom<i32>` that rejects anything outside the table.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(i32)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            pub fn code(self) -> i32 {
                self as i32
            }
        }

        impl TryFrom<i32> for $name {
            type Error = CastError;

            fn try_from(value: i32) -> Result<Self, CastError> {
                match value {
                    $( $value => Ok($name::$variant), )+
                    other => Err(CastError::new(
                        CastErrorCode::InvalidRequest,
                        format!("{} is not a valid {}", other, stringify!($name)),
                    )),
                }
            }
        }
    };
}

wire_enum! {
    /// Lifecycle of the link to a device or to an application on it.
    ConnectionState {
        /// Disconnected from the device or application.
        Disconnected = 0,
        /// Connecting to the device or application.
        Connecting = 1,
        /// Connected to the device or application.
        Connected = 2,
        /// Disconnecting from the device.
        Disconnecting = 3,
    }
}

impl ConnectionState {
    /// Transition table of the link state machine.
    ///
    /// `Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`,
    /// plus the two regressions: a failed attempt (`Connecting -> Disconnected`)
    /// and a lost link (`Connected -> Disconnected`). An attempt may also be
    /// aborted while in flight (`Connecting -> Disconnecting`).
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

wire_enum! {
    /// Classification of a media stream.
    StreamType {
        None = 0,
        Buffered = 1,
        Live = 2,
        Unknown = 99,
    }
}

wire_enum! {
    /// Why the remote player is idle.
    IdleReason {
        /// The player currently has no idle reason.
        None = 0,
        /// Playback has finished.
        Finished = 1,
        /// Playback was cancelled in response to a STOP command.
        Cancelled = 2,
        /// Playback was interrupted by a LOAD command.
        Interrupted = 3,
        /// A playback error occurred.
        Error = 4,
    }
}

wire_enum! {
    /// Remote playback state.
    PlayerState {
        Unknown = 0,
        Idle = 1,
        Playing = 2,
        Paused = 3,
        Buffering = 4,
    }
}

impl PlayerState {
    /// Returns a human-readable label for the player state.
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerState::Unknown => "UNKNOWN",
            PlayerState::Idle => "IDLE",
            PlayerState::Playing => "PLAYING",
            PlayerState::Paused => "PAUSED",
            PlayerState::Buffering => "BUFFERING",
        }
    }
}

/// Connectivity identity of a receiver.
///
/// Any change to one of these three fields means the old endpoint went
/// offline and a distinct one came online.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub ip_address: IpAddr,
    pub service_port: u16,
}

/// A cast receiver seen on the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub friendly_name: String,
    /// Model advertised in the `md` TXT record.
    pub model_name: Option<String>,
    /// Receiver status advertised in the `rs` TXT record.
    pub status_text: Option<String>,
    ip_address: IpAddr,
    service_port: u16,
}

impl Device {
    pub fn new(
        device_id: impl Into<String>,
        friendly_name: impl Into<String>,
        ip_address: IpAddr,
        service_port: u16,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            friendly_name: friendly_name.into(),
            model_name: None,
            status_text: None,
            ip_address,
            service_port,
        }
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = Some(status_text.into());
        self
    }

    pub fn ip_address(&self) -> IpAddr {
        self.ip_address
    }

    pub fn service_port(&self) -> u16 {
        self.service_port
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.device_id.clone(),
            ip_address: self.ip_address,
            service_port: self.service_port,
        }
    }

    /// True when both observations point at the same connectable endpoint.
    pub fn same_endpoint(&self, other: &Device) -> bool {
        self.device_id == other.device_id
            && self.ip_address == other.ip_address
            && self.service_port == other.service_port
    }

    /// `host:port` form used by logs and transports.
    pub fn address(&self) -> String {
        match self.ip_address {
            IpAddr::V4(ip) => format!("{}:{}", ip, self.service_port),
            IpAddr::V6(ip) => format!("[{}]:{}", ip, self.service_port),
        }
    }
}
