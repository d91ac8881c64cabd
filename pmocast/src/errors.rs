use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result/failure taxonomy shared by every cast operation.
///
/// The numeric values mirror the receiver-side protocol and are compared by
/// value on both ends: they must never be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum CastErrorCode {
    /// No error.
    NoError = 0,
    /// Network I/O error.
    NetworkError = 1,
    /// An operation has timed out.
    Timeout = 2,
    /// Authentication with the device failed.
    DeviceAuthenticationFailure = 3,
    /// An invalid request was made.
    InvalidRequest = 4,
    /// An in-progress request was cancelled, most likely because another
    /// action preempted it.
    Cancelled = 5,
    /// A request was replaced by another request of the same type.
    Replaced = 6,
    /// The request was disallowed and could not be completed.
    NotAllowed = 7,
    /// The same type of request is still in process.
    DuplicateRequest = 8,
    /// The request is not allowed in the current state.
    InvalidState = 9,
    /// The requested application could not be found.
    ApplicationNotFound = 20,
    /// The requested application is not currently running.
    ApplicationNotRunning = 21,
    /// The application session ID was not valid.
    InvalidApplicationSessionId = 22,
    /// A media load failed on the receiver side.
    MediaLoadFailed = 30,
    /// A media command failed because of the media player state.
    InvalidMediaPlayerState = 31,
    /// The host application entered the background.
    AppDidEnterBackground = 91,
    /// A disconnection occurred during the request.
    Disconnected = 92,
    /// An unknown, unexpected error occurred.
    Unknown = 99,
}

impl CastErrorCode {
    pub const ALL: [CastErrorCode; 18] = [
        CastErrorCode::NoError,
        CastErrorCode::NetworkError,
        CastErrorCode::Timeout,
        CastErrorCode::DeviceAuthenticationFailure,
        CastErrorCode::InvalidRequest,
        CastErrorCode::Cancelled,
        CastErrorCode::Replaced,
        CastErrorCode::NotAllowed,
        CastErrorCode::DuplicateRequest,
        CastErrorCode::InvalidState,
        CastErrorCode::ApplicationNotFound,
        CastErrorCode::ApplicationNotRunning,
        CastErrorCode::InvalidApplicationSessionId,
        CastErrorCode::MediaLoadFailed,
        CastErrorCode::InvalidMediaPlayerState,
        CastErrorCode::AppDidEnterBackground,
        CastErrorCode::Disconnected,
        CastErrorCode::Unknown,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Returns a stable label for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            CastErrorCode::NoError => "NO_ERROR",
            CastErrorCode::NetworkError => "NETWORK_ERROR",
            CastErrorCode::Timeout => "TIMEOUT",
            CastErrorCode::DeviceAuthenticationFailure => "DEVICE_AUTHENTICATION_FAILURE",
            CastErrorCode::InvalidRequest => "INVALID_REQUEST",
            CastErrorCode::Cancelled => "CANCELLED",
            CastErrorCode::Replaced => "REPLACED",
            CastErrorCode::NotAllowed => "NOT_ALLOWED",
            CastErrorCode::DuplicateRequest => "DUPLICATE_REQUEST",
            CastErrorCode::InvalidState => "INVALID_STATE",
            CastErrorCode::ApplicationNotFound => "APPLICATION_NOT_FOUND",
            CastErrorCode::ApplicationNotRunning => "APPLICATION_NOT_RUNNING",
            CastErrorCode::InvalidApplicationSessionId => "INVALID_APPLICATION_SESSION_ID",
            CastErrorCode::MediaLoadFailed => "MEDIA_LOAD_FAILED",
            CastErrorCode::InvalidMediaPlayerState => "INVALID_MEDIA_PLAYER_STATE",
            CastErrorCode::AppDidEnterBackground => "APP_DID_ENTER_BACKGROUND",
            CastErrorCode::Disconnected => "DISCONNECTED",
            CastErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// True for failures after which the device link cannot be trusted.
    pub fn is_link_failure(self) -> bool {
        matches!(
            self,
            CastErrorCode::NetworkError | CastErrorCode::Disconnected
        )
    }
}

impl fmt::Display for CastErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.code())
    }
}

impl TryFrom<i32> for CastErrorCode {
    type Error = CastError;

    fn try_from(value: i32) -> Result<Self, CastError> {
        CastErrorCode::ALL
            .iter()
            .copied()
            .find(|code| code.code() == value)
            .ok_or_else(|| {
                CastError::new(
                    CastErrorCode::InvalidRequest,
                    format!("{value} is not a cast error code"),
                )
            })
    }
}

/// Error carrier: one code from the taxonomy plus a diagnostic message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct CastError {
    code: CastErrorCode,
    message: String,
}

pub type CastResult<T> = Result<T, CastError>;

impl CastError {
    pub fn new(code: CastErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> CastErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(CastErrorCode::InvalidState, message)
    }

    pub fn duplicate_request(operation: &str) -> Self {
        Self::new(
            CastErrorCode::DuplicateRequest,
            format!("a {operation} request is already in progress"),
        )
    }

    pub fn replaced(operation: &str) -> Self {
        Self::new(
            CastErrorCode::Replaced,
            format!("{operation} request replaced by a newer one"),
        )
    }

    pub fn cancelled(operation: &str, by: &str) -> Self {
        Self::new(
            CastErrorCode::Cancelled,
            format!("{operation} request cancelled by {by}"),
        )
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(CastErrorCode::Disconnected, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(CastErrorCode::NetworkError, message)
    }
}
