//! Channels attached to an application session.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crossbeam_channel::Receiver;
use tracing::debug;

use crate::errors::{CastError, CastResult};
use crate::events::{EventBus, MediaChannelEvent, MediaCommand};
use crate::manager::ChannelLink;
use crate::media::{MediaInformation, MediaStatus, StatusSnapshot};
use crate::request::RequestId;
use crate::transport::MEDIA_NAMESPACE;

/// A namespace-scoped endpoint on an application session.
///
/// The device manager calls these hooks; only `namespace` is mandatory.
pub trait CastChannel: Send + Sync {
    fn namespace(&self) -> &str;

    /// The channel was attached; `link` is valid until [`Self::did_disconnect`].
    fn did_connect(&self, _link: ChannelLink) {}

    fn did_disconnect(&self) {}

    /// A request issued through this channel finished.
    fn did_complete_request(&self, _request: RequestId, _result: Result<(), CastError>) {}

    fn did_update_media_status(&self, _status: &MediaStatus) {}

    /// The receiver ended the media session.
    fn did_clear_media_status(&self) {}

    fn did_fail_command(&self, _command: MediaCommand, _error: CastError) {}
}

/// Remote playback control.
pub trait MediaControlChannel: CastChannel {
    /// Loads `media`, starting at `play_position` seconds.
    ///
    /// A newer load replaces this one (`Replaced`) and cancels an
    /// outstanding seek (`Cancelled`).
    fn load_media(
        &self,
        media: MediaInformation,
        autoplay: bool,
        play_position: f64,
    ) -> CastResult<RequestId>;

    /// Resumes playback. Failures are reported as
    /// [`MediaChannelEvent::CommandFailed`].
    fn play(&self) -> CastResult<()>;

    fn pause(&self) -> CastResult<()>;

    fn seek_to_time_interval(&self, position: f64) -> CastResult<RequestId>;

    fn request_status(&self) -> CastResult<RequestId>;

    /// Last reported position extrapolated to now. 0 without a status.
    fn approximate_stream_position(&self) -> f64;

    fn media_status(&self) -> Option<MediaStatus>;

    fn subscribe(&self) -> Receiver<MediaChannelEvent>;
}

/// Media channel of the Default Media Receiver and compatible receivers.
pub struct CastMediaChannel {
    link: Mutex<Option<ChannelLink>>,
    status: Mutex<Option<StatusSnapshot>>,
    events: EventBus<MediaChannelEvent>,
}

impl Default for CastMediaChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CastMediaChannel {
    pub fn new() -> Self {
        Self {
            link: Mutex::new(None),
            status: Mutex::new(None),
            events: EventBus::new(),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.link().is_some_and(|link| link.is_attached())
    }

    fn link(&self) -> Option<ChannelLink> {
        self.link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn attached_link(&self) -> CastResult<ChannelLink> {
        self.link()
            .ok_or_else(|| CastError::invalid_state("media channel is not attached"))
    }

    fn status(&self) -> MutexGuard<'_, Option<StatusSnapshot>> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CastChannel for CastMediaChannel {
    fn namespace(&self) -> &str {
        MEDIA_NAMESPACE
    }

    fn did_connect(&self, link: ChannelLink) {
        debug!(app = %link.application().display_name, "Media channel attached");
        *self
            .link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(link);
        self.events.broadcast(MediaChannelEvent::Attached);
    }

    fn did_disconnect(&self) {
        self.link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.status().take();
        debug!("Media channel detached");
        self.events.broadcast(MediaChannelEvent::Detached);
    }

    fn did_complete_request(&self, request: RequestId, result: Result<(), CastError>) {
        self.events
            .broadcast(MediaChannelEvent::RequestCompleted { request, result });
    }

    fn did_update_media_status(&self, status: &MediaStatus) {
        *self.status() = Some(StatusSnapshot::new(status.clone()));
        self.events
            .broadcast(MediaChannelEvent::StatusUpdated(status.clone()));
    }

    fn did_clear_media_status(&self) {
        if self.status().take().is_some() {
            debug!("Media session ended, status cleared");
            self.events.broadcast(MediaChannelEvent::StatusCleared);
        }
    }

    fn did_fail_command(&self, command: MediaCommand, error: CastError) {
        self.events
            .broadcast(MediaChannelEvent::CommandFailed { command, error });
    }
}

impl MediaControlChannel for CastMediaChannel {
    fn load_media(
        &self,
        media: MediaInformation,
        autoplay: bool,
        play_position: f64,
    ) -> CastResult<RequestId> {
        self.attached_link()?
            .load_media(media, autoplay, play_position)
    }

    fn play(&self) -> CastResult<()> {
        self.attached_link()?.send_command(MediaCommand::Play)
    }

    fn pause(&self) -> CastResult<()> {
        self.attached_link()?.send_command(MediaCommand::Pause)
    }

    fn seek_to_time_interval(&self, position: f64) -> CastResult<RequestId> {
        self.attached_link()?.seek(position)
    }

    fn request_status(&self) -> CastResult<RequestId> {
        self.attached_link()?.request_status()
    }

    fn approximate_stream_position(&self) -> f64 {
        self.status()
            .as_ref()
            .map(|snapshot| snapshot.approximate_position(Instant::now()))
            .unwrap_or(0.0)
    }

    fn media_status(&self) -> Option<MediaStatus> {
        self.status().as_ref().map(|snapshot| snapshot.status.clone())
    }

    fn subscribe(&self) -> Receiver<MediaChannelEvent> {
        self.events.subscribe()
    }
}
