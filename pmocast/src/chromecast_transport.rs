//! [`CastTransport`] backed by the rust_cast library.
//!
//! rust_cast speaks CASTV2 (protobuf frames over TLS). Every call here is a
//! blocking request/response exchange on the socket held by this transport.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::sync::Once;

use rust_cast::CastDevice;
use rust_cast::channels::media::{
    GenericMediaMetadata, IdleReason as CastIdleReason, Image, Media, Metadata,
    MusicTrackMediaMetadata, PlayerState as CastPlayerState, ResumeState, StatusEntry,
    StreamType as CastStreamType,
};
use rust_cast::channels::receiver::CastDeviceApp;
use rust_cast::errors::Error as RustCastError;
use tracing::{debug, info, warn};

use crate::errors::{CastError, CastErrorCode, CastResult};
use crate::media::{MediaInformation, MediaMetadata, MediaStatus, keys};
use crate::model::{Device, IdleReason, PlayerState, StreamType};
use crate::transport::{ApplicationMetadata, CastTransport, DEFAULT_MEDIA_RECEIVER_APP_ID};

/// Destination of the platform receiver, before any application runs.
const RECEIVER_DESTINATION_ID: &str = "receiver-0";

const STATUS_TEXT_KEY: &str = "statusText";

/// Ensures the rustls CryptoProvider is installed exactly once.
fn ensure_crypto_provider_initialized() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::CryptoProvider::install_default(
            rustls::crypto::aws_lc_rs::default_provider(),
        );
    });
}

/// Maps a rust_cast error onto the taxonomy.
///
/// I/O failures are link failures; anything else gets the code of the
/// operation that failed.
fn classify(err: RustCastError, fallback: CastErrorCode, context: &str) -> CastError {
    let io_kind = match &err {
        RustCastError::Io(io) => Some(io.kind()),
        _ => None,
    };
    CastError::new(error_code(io_kind, fallback), format!("{context}: {err}"))
}

fn error_code(io_kind: Option<ErrorKind>, fallback: CastErrorCode) -> CastErrorCode {
    match io_kind {
        Some(ErrorKind::TimedOut | ErrorKind::WouldBlock) => CastErrorCode::Timeout,
        Some(_) => CastErrorCode::NetworkError,
        None => fallback,
    }
}

/// Cast transport over a rust_cast TLS connection.
#[derive(Default)]
pub struct RustCastTransport {
    device: Option<CastDevice<'static>>,
    /// Application transports we already opened a virtual connection to.
    connected_transports: HashSet<String>,
}

impl RustCastTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn device(&self) -> CastResult<&CastDevice<'static>> {
        self.device
            .as_ref()
            .ok_or_else(|| CastError::invalid_state("cast device link is not open"))
    }

    /// Opens the virtual connection to an application's transport once.
    fn ensure_app_connection(&mut self, transport_id: &str) -> CastResult<()> {
        if self.connected_transports.contains(transport_id) {
            return Ok(());
        }
        let device = self.device()?;
        device
            .connection
            .connect(transport_id.to_string())
            .map_err(|e| classify(e, CastErrorCode::ApplicationNotRunning, "connect to application"))?;
        debug!(transport_id, "Connected to application transport");
        self.connected_transports.insert(transport_id.to_string());
        Ok(())
    }

    fn fetch_status(
        &mut self,
        app: &ApplicationMetadata,
        media_session_id: Option<i32>,
    ) -> CastResult<Option<MediaStatus>> {
        self.ensure_app_connection(&app.transport_id)?;
        let device = self.device()?;
        let status = device
            .media
            .get_status(app.transport_id.clone(), media_session_id)
            .map_err(|e| classify(e, CastErrorCode::InvalidMediaPlayerState, "get media status"))?;
        Ok(status.entries.first().map(status_from_entry))
    }

    /// Status after a media command that must leave a media session behind.
    fn expect_status(
        &mut self,
        app: &ApplicationMetadata,
        media_session_id: i32,
    ) -> CastResult<MediaStatus> {
        self.fetch_status(app, Some(media_session_id))?
            .ok_or_else(|| {
                CastError::new(
                    CastErrorCode::InvalidMediaPlayerState,
                    "receiver reported no media session",
                )
            })
    }
}

impl CastTransport for RustCastTransport {
    fn open(&mut self, device: &Device, client_package_name: &str) -> CastResult<()> {
        ensure_crypto_provider_initialized();
        self.close();

        info!(
            device = %device.friendly_name,
            address = %device.address(),
            client = client_package_name,
            "Opening cast link"
        );

        let cast_device = CastDevice::connect_without_host_verification(
            device.ip_address().to_string(),
            device.service_port(),
        )
        .map_err(|e| classify(e, CastErrorCode::NetworkError, "connect to device"))?;

        cast_device
            .connection
            .connect(RECEIVER_DESTINATION_ID.to_string())
            .map_err(|e| classify(e, CastErrorCode::NetworkError, "connect to receiver"))?;

        cast_device
            .heartbeat
            .ping()
            .map_err(|e| classify(e, CastErrorCode::NetworkError, "initial ping"))?;

        self.device = Some(cast_device);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(device) = self.device.take() {
            for transport_id in self.connected_transports.drain() {
                if let Err(e) = device.connection.disconnect(transport_id.clone()) {
                    debug!(transport_id = %transport_id, error = %e, "Ignoring disconnect failure");
                }
            }
            debug!("Cast link closed");
        }
        self.connected_transports.clear();
    }

    fn keep_alive(&mut self) -> CastResult<()> {
        self.device()?
            .heartbeat
            .ping()
            .map_err(|e| classify(e, CastErrorCode::NetworkError, "heartbeat"))
    }

    fn launch_application(&mut self, application_id: &str) -> CastResult<ApplicationMetadata> {
        let app = if application_id == DEFAULT_MEDIA_RECEIVER_APP_ID {
            CastDeviceApp::DefaultMediaReceiver
        } else {
            CastDeviceApp::Custom(application_id.to_string())
        };

        let launched = self
            .device()?
            .receiver
            .launch_app(&app)
            .map_err(|e| classify(e, CastErrorCode::ApplicationNotFound, "launch application"))?;

        debug!(
            app_id = %launched.app_id,
            session_id = %launched.session_id,
            transport_id = %launched.transport_id,
            "Application launched"
        );

        let mut metadata = MediaMetadata::new();
        if !launched.status_text.is_empty() {
            metadata.set_string(STATUS_TEXT_KEY, launched.status_text.clone());
        }

        let application = ApplicationMetadata {
            application_id: launched.app_id.clone(),
            display_name: launched.display_name.clone(),
            session_id: launched.session_id.clone(),
            transport_id: launched.transport_id.clone(),
            namespaces: launched.namespaces.clone(),
            metadata,
        };

        self.ensure_app_connection(&application.transport_id)?;
        Ok(application)
    }

    fn stop_application(&mut self, session_id: &str) -> CastResult<()> {
        self.device()?
            .receiver
            .stop_app(session_id.to_string())
            .map_err(|e| classify(e, CastErrorCode::ApplicationNotRunning, "stop application"))
    }

    fn load(
        &mut self,
        app: &ApplicationMetadata,
        media: &MediaInformation,
        autoplay: bool,
        play_position: f64,
    ) -> CastResult<MediaStatus> {
        self.ensure_app_connection(&app.transport_id)?;
        if media.custom_data().is_some() {
            debug!("Custom data is not forwarded by the rust_cast transport");
        }

        let cast_media = media_to_cast(media);
        let status = self
            .device()?
            .media
            .load(app.transport_id.clone(), app.session_id.clone(), &cast_media)
            .map_err(|e| classify(e, CastErrorCode::MediaLoadFailed, "load media"))?;

        let entry = status.entries.first().ok_or_else(|| {
            CastError::new(
                CastErrorCode::MediaLoadFailed,
                "receiver returned no media status after LOAD",
            )
        })?;
        let media_session_id = entry.media_session_id;
        debug!(media_session_id, "Media loaded");

        let device = self.device()?;
        if play_position > 0.0 {
            let resume = if autoplay {
                ResumeState::PlaybackStart
            } else {
                ResumeState::PlaybackPause
            };
            device
                .media
                .seek(
                    app.transport_id.clone(),
                    media_session_id,
                    Some(play_position as f32),
                    Some(resume),
                )
                .map_err(|e| classify(e, CastErrorCode::MediaLoadFailed, "seek after load"))?;
        } else if !autoplay {
            device
                .media
                .pause(app.transport_id.clone(), media_session_id)
                .map_err(|e| classify(e, CastErrorCode::MediaLoadFailed, "pause after load"))?;
        }

        self.expect_status(app, media_session_id)
    }

    fn play(&mut self, app: &ApplicationMetadata, media_session_id: i32) -> CastResult<MediaStatus> {
        self.ensure_app_connection(&app.transport_id)?;
        self.device()?
            .media
            .play(app.transport_id.clone(), media_session_id)
            .map_err(|e| classify(e, CastErrorCode::InvalidMediaPlayerState, "play"))?;
        self.expect_status(app, media_session_id)
    }

    fn pause(
        &mut self,
        app: &ApplicationMetadata,
        media_session_id: i32,
    ) -> CastResult<MediaStatus> {
        self.ensure_app_connection(&app.transport_id)?;
        self.device()?
            .media
            .pause(app.transport_id.clone(), media_session_id)
            .map_err(|e| classify(e, CastErrorCode::InvalidMediaPlayerState, "pause"))?;
        self.expect_status(app, media_session_id)
    }

    fn seek(
        &mut self,
        app: &ApplicationMetadata,
        media_session_id: i32,
        position: f64,
    ) -> CastResult<MediaStatus> {
        self.ensure_app_connection(&app.transport_id)?;
        self.device()?
            .media
            .seek(
                app.transport_id.clone(),
                media_session_id,
                Some(position as f32),
                None,
            )
            .map_err(|e| classify(e, CastErrorCode::InvalidMediaPlayerState, "seek"))?;
        self.expect_status(app, media_session_id)
    }

    fn media_status(
        &mut self,
        app: &ApplicationMetadata,
        media_session_id: Option<i32>,
    ) -> CastResult<Option<MediaStatus>> {
        self.fetch_status(app, media_session_id)
    }
}

impl Drop for RustCastTransport {
    fn drop(&mut self) {
        if self.device.is_some() {
            warn!("RustCastTransport dropped with an open link");
            self.close();
        }
    }
}

fn stream_type_to_cast(stream_type: StreamType) -> CastStreamType {
    match stream_type {
        StreamType::Buffered => CastStreamType::Buffered,
        StreamType::Live => CastStreamType::Live,
        StreamType::None | StreamType::Unknown => CastStreamType::None,
    }
}

fn stream_type_from_cast(stream_type: &CastStreamType) -> StreamType {
    match stream_type {
        CastStreamType::None => StreamType::None,
        CastStreamType::Buffered => StreamType::Buffered,
        CastStreamType::Live => StreamType::Live,
    }
}

fn media_to_cast(media: &MediaInformation) -> Media {
    let meta = media.metadata();
    let images: Vec<Image> = meta
        .images()
        .iter()
        .map(|url| Image {
            url: url.clone(),
            dimensions: None,
        })
        .collect();
    let owned = |key: &str| meta.string_for_key(key).map(str::to_string);

    let metadata = if meta.is_empty() {
        None
    } else if meta.string_for_key(keys::ARTIST).is_some()
        || meta.string_for_key(keys::ALBUM_NAME).is_some()
    {
        Some(Metadata::MusicTrack(MusicTrackMediaMetadata {
            title: owned(keys::TITLE),
            artist: owned(keys::ARTIST),
            album_name: owned(keys::ALBUM_NAME),
            images,
            release_date: owned(keys::RELEASE_DATE),
            ..Default::default()
        }))
    } else {
        Some(Metadata::Generic(GenericMediaMetadata {
            title: owned(keys::TITLE),
            subtitle: owned(keys::SUBTITLE),
            images,
            release_date: owned(keys::RELEASE_DATE),
        }))
    };

    let duration = media.stream_duration();
    Media {
        content_id: media.content_id().to_string(),
        content_type: media.content_type().to_string(),
        stream_type: stream_type_to_cast(media.stream_type()),
        duration: (duration > 0.0).then_some(duration as f32),
        metadata,
    }
}

fn media_from_cast(media: &Media) -> MediaInformation {
    let mut metadata = MediaMetadata::new();
    match &media.metadata {
        Some(Metadata::Generic(generic)) => {
            if let Some(title) = &generic.title {
                metadata.set_string(keys::TITLE, title.clone());
            }
            if let Some(subtitle) = &generic.subtitle {
                metadata.set_string(keys::SUBTITLE, subtitle.clone());
            }
            if let Some(date) = &generic.release_date {
                metadata.set_string(keys::RELEASE_DATE, date.clone());
            }
        }
        Some(Metadata::MusicTrack(track)) => {
            if let Some(title) = &track.title {
                metadata.set_string(keys::TITLE, title.clone());
            }
            if let Some(artist) = &track.artist {
                metadata.set_string(keys::ARTIST, artist.clone());
            }
            if let Some(album) = &track.album_name {
                metadata.set_string(keys::ALBUM_NAME, album.clone());
            }
            if let Some(date) = &track.release_date {
                metadata.set_string(keys::RELEASE_DATE, date.clone());
            }
        }
        _ => {}
    }

    MediaInformation::new(
        media.content_id.clone(),
        stream_type_from_cast(&media.stream_type),
        media.content_type.clone(),
        metadata,
        media.duration.map(f64::from).unwrap_or(0.0),
        None,
    )
}

fn status_from_entry(entry: &StatusEntry) -> MediaStatus {
    let player_state = match entry.player_state {
        CastPlayerState::Idle => PlayerState::Idle,
        CastPlayerState::Playing => PlayerState::Playing,
        CastPlayerState::Paused => PlayerState::Paused,
        CastPlayerState::Buffering => PlayerState::Buffering,
    };
    let idle_reason = match entry.idle_reason {
        Some(CastIdleReason::Finished) => IdleReason::Finished,
        Some(CastIdleReason::Cancelled) => IdleReason::Cancelled,
        Some(CastIdleReason::Interrupted) => IdleReason::Interrupted,
        Some(CastIdleReason::Error) => IdleReason::Error,
        None => IdleReason::None,
    };

    MediaStatus {
        media_session_id: entry.media_session_id,
        player_state,
        idle_reason,
        media_information: entry.media.as_ref().map(media_from_cast),
        stream_position: entry.current_time.map(f64::from).unwrap_or(0.0),
        playback_rate: f64::from(entry.playback_rate),
    }
}
