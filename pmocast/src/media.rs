//! Media descriptions exchanged with the receiver.
//!
//! [`MediaInformation`] describes a playable item and is immutable once built.
//! [`MediaStatus`] is the receiver's view of the current playback, as last
//! reported through the media channel.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{IdleReason, PlayerState, StreamType};

/// Well-known metadata keys.
pub mod keys {
    pub const TITLE: &str = "title";
    pub const SUBTITLE: &str = "subtitle";
    pub const ARTIST: &str = "artist";
    pub const ALBUM_NAME: &str = "albumName";
    pub const RELEASE_DATE: &str = "releaseDate";
}

/// String key/value metadata attached to a media item.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMetadata {
    strings: BTreeMap<String, String>,
    #[serde(default)]
    images: Vec<String>,
}

impl MediaMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MediaMetadata::set_string`].
    pub fn with_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_string(key, value);
        self
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.images.push(url.into());
        self
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.strings.insert(key.into(), value.into());
    }

    pub fn string_for_key(&self, key: &str) -> Option<&str> {
        self.strings.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.strings.keys().map(String::as_str)
    }

    pub fn images(&self) -> &[String] {
        &self.images
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty() && self.images.is_empty()
    }
}

/// A playable item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaInformation {
    content_id: String,
    stream_type: StreamType,
    content_type: String,
    metadata: MediaMetadata,
    stream_duration: f64,
    custom_data: Option<Value>,
}

impl MediaInformation {
    pub fn new(
        content_id: impl Into<String>,
        stream_type: StreamType,
        content_type: impl Into<String>,
        metadata: MediaMetadata,
        stream_duration: f64,
        custom_data: Option<Value>,
    ) -> Self {
        Self {
            content_id: content_id.into(),
            stream_type,
            content_type: content_type.into(),
            metadata,
            stream_duration,
            custom_data,
        }
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn metadata(&self) -> &MediaMetadata {
        &self.metadata
    }

    /// Duration in seconds. Live streams usually report 0.
    pub fn stream_duration(&self) -> f64 {
        self.stream_duration
    }

    pub fn custom_data(&self) -> Option<&Value> {
        self.custom_data.as_ref()
    }
}

/// Guesses a MIME type from the content URL extension.
pub fn guess_content_type(content_id: &str) -> &'static str {
    let path = content_id
        .split(['?', '#'])
        .next()
        .unwrap_or(content_id)
        .to_ascii_lowercase();
    match path.rsplit('.').next() {
        Some("flac") => "audio/flac",
        Some("mp3") => "audio/mpeg",
        Some("ogg") | Some("oga") => "audio/ogg",
        Some("m4a") | Some("aac") => "audio/mp4",
        Some("wav") => "audio/wav",
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("webm") => "video/webm",
        Some("m3u8") => "application/x-mpegURL",
        Some("mpd") => "application/dash+xml",
        _ => "application/octet-stream",
    }
}

/// Playback status as last reported by the receiver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaStatus {
    pub media_session_id: i32,
    pub player_state: PlayerState,
    pub idle_reason: IdleReason,
    pub media_information: Option<MediaInformation>,
    /// Position in seconds at the time of the report.
    pub stream_position: f64,
    pub playback_rate: f64,
}

impl MediaStatus {
    pub fn new(media_session_id: i32, player_state: PlayerState) -> Self {
        Self {
            media_session_id,
            player_state,
            idle_reason: IdleReason::None,
            media_information: None,
            stream_position: 0.0,
            playback_rate: 1.0,
        }
    }

    pub fn stream_duration(&self) -> Option<f64> {
        self.media_information
            .as_ref()
            .map(MediaInformation::stream_duration)
            .filter(|d| *d > 0.0)
    }
}

/// A [`MediaStatus`] together with the instant it was received.
#[derive(Clone, Debug)]
pub(crate) struct StatusSnapshot {
    pub status: MediaStatus,
    pub received_at: Instant,
}

impl StatusSnapshot {
    pub fn new(status: MediaStatus) -> Self {
        Self {
            status,
            received_at: Instant::now(),
        }
    }

    /// Extrapolates the stream position to `now`.
    pub fn approximate_position(&self, now: Instant) -> f64 {
        let status = &self.status;
        let mut position = status.stream_position;
        if status.player_state == PlayerState::Playing {
            let elapsed = now.saturating_duration_since(self.received_at).as_secs_f64();
            position += elapsed * status.playback_rate;
        }
        if let Some(duration) = status.stream_duration() {
            position = position.min(duration);
        }
        position.max(0.0)
    }
}
