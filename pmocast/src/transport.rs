//! Seam between the session logic and the cast wire protocol.
//!
//! A [`CastTransport`] performs one blocking exchange per call. The device
//! manager's worker thread builds the transport through a
//! [`TransportFactory`] and is its only caller, so the transport itself
//! never crosses threads.

use serde::{Deserialize, Serialize};

use crate::errors::CastResult;
use crate::media::{MediaInformation, MediaMetadata, MediaStatus};
use crate::model::Device;

/// Application ID of the Default Media Receiver.
pub const DEFAULT_MEDIA_RECEIVER_APP_ID: &str = "CC1AD845";

/// Namespace of the media control channel.
pub const MEDIA_NAMESPACE: &str = "urn:x-cast:com.google.cast.media";

/// An application running on the receiver after a successful launch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationMetadata {
    pub application_id: String,
    pub display_name: String,
    /// Receiver session ID, needed to stop the application.
    pub session_id: String,
    /// Destination ID used to address the application's channels.
    pub transport_id: String,
    pub namespaces: Vec<String>,
    pub metadata: MediaMetadata,
}

impl ApplicationMetadata {
    pub fn supports_namespace(&self, namespace: &str) -> bool {
        self.namespaces.is_empty() || self.namespaces.iter().any(|ns| ns == namespace)
    }
}

/// Builds a transport on the worker thread that will own it.
pub type TransportFactory = Box<dyn FnOnce() -> Box<dyn CastTransport> + Send>;

pub trait CastTransport {
    /// Opens the link to `device`.
    fn open(&mut self, device: &Device, client_package_name: &str) -> CastResult<()>;

    /// Closes the link. Must be safe to call when nothing is open.
    fn close(&mut self);

    /// Heartbeat; an error means the link is gone.
    fn keep_alive(&mut self) -> CastResult<()>;

    fn launch_application(&mut self, application_id: &str) -> CastResult<ApplicationMetadata>;

    fn stop_application(&mut self, session_id: &str) -> CastResult<()>;

    /// Loads `media` and returns the resulting status.
    fn load(
        &mut self,
        app: &ApplicationMetadata,
        media: &MediaInformation,
        autoplay: bool,
        play_position: f64,
    ) -> CastResult<MediaStatus>;

    fn play(&mut self, app: &ApplicationMetadata, media_session_id: i32) -> CastResult<MediaStatus>;

    fn pause(&mut self, app: &ApplicationMetadata, media_session_id: i32)
    -> CastResult<MediaStatus>;

    fn seek(
        &mut self,
        app: &ApplicationMetadata,
        media_session_id: i32,
        position: f64,
    ) -> CastResult<MediaStatus>;

    /// Current status; `None` when the receiver has no media session.
    fn media_status(
        &mut self,
        app: &ApplicationMetadata,
        media_session_id: Option<i32>,
    ) -> CastResult<Option<MediaStatus>>;
}
