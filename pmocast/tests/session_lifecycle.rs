use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use pmocast::{
    ApplicationMetadata, CastChannel, CastDeviceManager, CastError, CastErrorCode,
    CastMediaChannel, CastResult, CastTransport, ConnectionState, DEFAULT_MEDIA_RECEIVER_APP_ID,
    Device, DeviceManager, DeviceManagerEvent, MEDIA_NAMESPACE, ManagerOptions,
    MediaChannelEvent, MediaCommand, MediaControlChannel, MediaInformation, MediaMetadata,
    MediaStatus, PlayerState, StreamType,
};

const WAIT: Duration = Duration::from_secs(5);

/// Shared script driving a [`FakeTransport`].
#[derive(Default)]
struct Script {
    calls: Vec<String>,
    failures: HashMap<&'static str, CastError>,
    gates: HashMap<&'static str, Receiver<()>>,
    status: Option<MediaStatus>,
    next_media_session: i32,
}

type SharedScript = Arc<Mutex<Script>>;

impl Script {
    fn fail(script: &SharedScript, op: &'static str, error: CastError) {
        script.lock().unwrap().failures.insert(op, error);
    }

    /// Blocks the next `op` call until the returned sender fires.
    fn gate(script: &SharedScript, op: &'static str) -> Sender<()> {
        let (tx, rx) = bounded(1);
        script.lock().unwrap().gates.insert(op, rx);
        tx
    }

    fn called(script: &SharedScript, call: &str) -> bool {
        script.lock().unwrap().calls.iter().any(|c| c == call)
    }

    fn wait_for_call(script: &SharedScript, call: &str) {
        let deadline = Instant::now() + WAIT;
        while !Self::called(script, call) {
            assert!(Instant::now() < deadline, "transport never saw {call}");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

struct FakeTransport {
    script: SharedScript,
}

impl FakeTransport {
    fn enter(&self, op: &'static str, call: String) -> CastResult<()> {
        let gate = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(call);
            script.gates.remove(op)
        };
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(WAIT);
        }
        match self.script.lock().unwrap().failures.remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn update_status(&self, f: impl FnOnce(&mut MediaStatus)) -> CastResult<MediaStatus> {
        let mut script = self.script.lock().unwrap();
        let status = script.status.as_mut().ok_or_else(|| {
            CastError::new(CastErrorCode::InvalidMediaPlayerState, "no media loaded")
        })?;
        f(status);
        Ok(status.clone())
    }
}

impl CastTransport for FakeTransport {
    fn open(&mut self, device: &Device, _client_package_name: &str) -> CastResult<()> {
        self.enter("open", format!("open {}", device.address()))
    }

    fn close(&mut self) {
        self.script.lock().unwrap().calls.push("close".to_string());
    }

    fn keep_alive(&mut self) -> CastResult<()> {
        self.enter("keep_alive", "keep_alive".to_string())
    }

    fn launch_application(&mut self, application_id: &str) -> CastResult<ApplicationMetadata> {
        self.enter("launch", format!("launch {application_id}"))?;
        Ok(ApplicationMetadata {
            application_id: application_id.to_string(),
            display_name: "Default Media Receiver".to_string(),
            session_id: "session-1".to_string(),
            transport_id: "web-1".to_string(),
            namespaces: vec![MEDIA_NAMESPACE.to_string()],
            metadata: MediaMetadata::new(),
        })
    }

    fn stop_application(&mut self, session_id: &str) -> CastResult<()> {
        self.enter("stop", format!("stop {session_id}"))
    }

    fn load(
        &mut self,
        _app: &ApplicationMetadata,
        media: &MediaInformation,
        autoplay: bool,
        play_position: f64,
    ) -> CastResult<MediaStatus> {
        self.enter("load", format!("load {}", media.content_id()))?;
        let mut script = self.script.lock().unwrap();
        script.next_media_session += 1;
        let state = if autoplay {
            PlayerState::Playing
        } else {
            PlayerState::Paused
        };
        let mut status = MediaStatus::new(script.next_media_session, state);
        status.media_information = Some(media.clone());
        status.stream_position = play_position;
        script.status = Some(status.clone());
        Ok(status)
    }

    fn play(&mut self, _app: &ApplicationMetadata, _msid: i32) -> CastResult<MediaStatus> {
        self.enter("play", "play".to_string())?;
        self.update_status(|s| s.player_state = PlayerState::Playing)
    }

    fn pause(&mut self, _app: &ApplicationMetadata, _msid: i32) -> CastResult<MediaStatus> {
        self.enter("pause", "pause".to_string())?;
        self.update_status(|s| s.player_state = PlayerState::Paused)
    }

    fn seek(
        &mut self,
        _app: &ApplicationMetadata,
        _msid: i32,
        position: f64,
    ) -> CastResult<MediaStatus> {
        self.enter("seek", format!("seek {position}"))?;
        self.update_status(|s| s.stream_position = position)
    }

    fn media_status(
        &mut self,
        _app: &ApplicationMetadata,
        _msid: Option<i32>,
    ) -> CastResult<Option<MediaStatus>> {
        self.enter("status", "status".to_string())?;
        Ok(self.script.lock().unwrap().status.clone())
    }
}

fn device() -> Device {
    Device::new(
        "0123456789abcdef",
        "Living Room",
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 30)),
        8009,
    )
}

fn manager_with(poll: Duration) -> (CastDeviceManager, SharedScript) {
    let script: SharedScript = Arc::new(Mutex::new(Script::default()));
    let shared = Arc::clone(&script);
    let manager = CastDeviceManager::with_transport(
        device(),
        "pmocast-tests",
        Box::new(move || Box::new(FakeTransport { script: shared }) as Box<dyn CastTransport>),
        ManagerOptions {
            status_poll_interval: poll,
        },
    );
    (manager, script)
}

fn manager() -> (CastDeviceManager, SharedScript) {
    manager_with(Duration::from_secs(3600))
}

/// Waits for the first event matching `pred`, skipping the others.
fn wait_for<T: std::fmt::Debug>(rx: &Receiver<T>, pred: impl Fn(&T) -> bool) -> T {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(event) if pred(&event) => return event,
            Ok(_) => continue,
            Err(err) => panic!("expected event never arrived: {err}"),
        }
    }
}

/// Connects and launches the default receiver.
fn connected_session(manager: &CastDeviceManager) -> Receiver<DeviceManagerEvent> {
    let events = manager.subscribe();
    manager.connect();
    wait_for(&events, |e| *e == DeviceManagerEvent::Connected);
    let request = manager
        .launch_application(DEFAULT_MEDIA_RECEIVER_APP_ID)
        .unwrap();
    wait_for(&events, |e| {
        matches!(e, DeviceManagerEvent::RequestCompleted { request: id, result: Ok(()) } if *id == request)
    });
    events
}

fn attached_channel(
    manager: &CastDeviceManager,
) -> (Arc<CastMediaChannel>, Receiver<MediaChannelEvent>) {
    let channel = Arc::new(CastMediaChannel::new());
    let events = channel.subscribe();
    manager.add_channel(channel.clone()).unwrap();
    assert_eq!(events.try_recv().unwrap(), MediaChannelEvent::Attached);
    (channel, events)
}

fn track(id: &str) -> MediaInformation {
    MediaInformation::new(
        format!("http://media.local/{id}.flac"),
        StreamType::Buffered,
        "audio/flac",
        MediaMetadata::new().with_string("title", id),
        300.0,
        None,
    )
}

fn channel_completion(
    events: &Receiver<MediaChannelEvent>,
    request: pmocast::RequestId,
) -> Result<(), CastError> {
    match wait_for(events, |e| {
        matches!(e, MediaChannelEvent::RequestCompleted { request: id, .. } if *id == request)
    }) {
        MediaChannelEvent::RequestCompleted { result, .. } => result,
        _ => unreachable!(),
    }
}

#[test]
fn test_connect_then_launch_reports_lifecycle() {
    let (manager, script) = manager();
    let events = manager.subscribe();
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert_eq!(manager.client_package_name(), "pmocast-tests");

    manager.connect();
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        DeviceManagerEvent::StateChanged(ConnectionState::Connecting)
    );
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        DeviceManagerEvent::StateChanged(ConnectionState::Connected)
    );
    assert_eq!(events.recv_timeout(WAIT).unwrap(), DeviceManagerEvent::Connected);
    assert!(Script::called(&script, "open 192.168.1.30:8009"));

    // A second connect is ignored while connected.
    manager.connect();

    let request = manager
        .launch_application(DEFAULT_MEDIA_RECEIVER_APP_ID)
        .unwrap();
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        DeviceManagerEvent::ApplicationStateChanged(ConnectionState::Connecting)
    );
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        DeviceManagerEvent::ApplicationStateChanged(ConnectionState::Connected)
    );
    match events.recv_timeout(WAIT).unwrap() {
        DeviceManagerEvent::ApplicationConnected(app) => {
            assert_eq!(app.application_id, DEFAULT_MEDIA_RECEIVER_APP_ID);
            assert_eq!(app.session_id, "session-1");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        DeviceManagerEvent::RequestCompleted {
            request,
            result: Ok(())
        }
    );
    assert_eq!(
        manager.application_connection_state(),
        ConnectionState::Connected
    );
    assert_eq!(manager.application().unwrap().transport_id, "web-1");
    assert_eq!(
        script
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with("open"))
            .count(),
        1
    );
}

#[test]
fn test_operations_need_a_connected_link() {
    let (manager, _script) = manager();

    let err = manager
        .launch_application(DEFAULT_MEDIA_RECEIVER_APP_ID)
        .unwrap_err();
    assert_eq!(err.code(), CastErrorCode::InvalidState);

    let err = manager.stop_application("session-1").unwrap_err();
    assert_eq!(err.code(), CastErrorCode::InvalidState);

    let err = manager
        .add_channel(Arc::new(CastMediaChannel::new()))
        .unwrap_err();
    assert_eq!(err.code(), CastErrorCode::InvalidState);

    // Disconnect while disconnected is a no-op.
    let events = manager.subscribe();
    manager.disconnect();
    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_connection_failure() {
    let (manager, script) = manager();
    Script::fail(&script, "open", CastError::network("connection refused"));
    let events = manager.subscribe();

    manager.connect();
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        DeviceManagerEvent::StateChanged(ConnectionState::Connecting)
    );
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        DeviceManagerEvent::StateChanged(ConnectionState::Disconnected)
    );
    match events.recv_timeout(WAIT).unwrap() {
        DeviceManagerEvent::ConnectionFailed(err) => {
            assert_eq!(err.code(), CastErrorCode::NetworkError)
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);

    // A new attempt is allowed after a failure.
    manager.connect();
    wait_for(&events, |e| *e == DeviceManagerEvent::Connected);
}

#[test]
fn test_failed_launch_returns_application_to_disconnected() {
    let (manager, script) = manager();
    let events = manager.subscribe();
    manager.connect();
    wait_for(&events, |e| *e == DeviceManagerEvent::Connected);

    Script::fail(
        &script,
        "launch",
        CastError::new(CastErrorCode::ApplicationNotFound, "no such app"),
    );
    let request = manager.launch_application("DEADBEEF").unwrap();
    match wait_for(&events, |e| {
        matches!(e, DeviceManagerEvent::RequestCompleted { .. })
    }) {
        DeviceManagerEvent::RequestCompleted { request: id, result } => {
            assert_eq!(id, request);
            assert_eq!(result.unwrap_err().code(), CastErrorCode::ApplicationNotFound);
        }
        _ => unreachable!(),
    }
    assert_eq!(
        manager.application_connection_state(),
        ConnectionState::Disconnected
    );
    // Not a link failure: the device stays connected.
    assert_eq!(manager.connection_state(), ConnectionState::Connected);
}

#[test]
fn test_duplicate_launch_is_rejected() {
    let (manager, script) = manager();
    let events = manager.subscribe();
    manager.connect();
    wait_for(&events, |e| *e == DeviceManagerEvent::Connected);

    let release = Script::gate(&script, "launch");
    let first = manager
        .launch_application(DEFAULT_MEDIA_RECEIVER_APP_ID)
        .unwrap();
    let err = manager
        .launch_application(DEFAULT_MEDIA_RECEIVER_APP_ID)
        .unwrap_err();
    assert_eq!(err.code(), CastErrorCode::DuplicateRequest);

    release.send(()).unwrap();
    wait_for(&events, |e| {
        matches!(e, DeviceManagerEvent::RequestCompleted { request, result: Ok(()) } if *request == first)
    });
}

#[test]
fn test_channel_registration_rules() {
    let (manager, _script) = manager();
    let events = manager.subscribe();
    manager.connect();
    wait_for(&events, |e| *e == DeviceManagerEvent::Connected);

    // No application session yet.
    let err = manager
        .add_channel(Arc::new(CastMediaChannel::new()))
        .unwrap_err();
    assert_eq!(err.code(), CastErrorCode::InvalidState);

    let request = manager
        .launch_application(DEFAULT_MEDIA_RECEIVER_APP_ID)
        .unwrap();
    wait_for(&events, |e| {
        matches!(e, DeviceManagerEvent::RequestCompleted { request: id, .. } if *id == request)
    });

    let (channel, _channel_events) = attached_channel(&manager);
    assert!(channel.is_attached());

    let err = manager
        .add_channel(Arc::new(CastMediaChannel::new()))
        .unwrap_err();
    assert_eq!(err.code(), CastErrorCode::DuplicateRequest);

    struct CustomChannel;
    impl CastChannel for CustomChannel {
        fn namespace(&self) -> &str {
            "urn:x-cast:com.example.custom"
        }
    }
    let err = manager.add_channel(Arc::new(CustomChannel)).unwrap_err();
    assert_eq!(err.code(), CastErrorCode::NotAllowed);

    assert!(manager.remove_channel(MEDIA_NAMESPACE));
    assert!(!channel.is_attached());
    assert!(!manager.remove_channel(MEDIA_NAMESPACE));
    assert_eq!(channel.play().unwrap_err().code(), CastErrorCode::InvalidState);
}

#[test]
fn test_load_and_control_media() {
    let (manager, script) = manager();
    let _events = connected_session(&manager);
    let (channel, events) = attached_channel(&manager);

    let load = channel.load_media(track("intro"), true, 10.0).unwrap();
    match wait_for(&events, |e| matches!(e, MediaChannelEvent::StatusUpdated(_))) {
        MediaChannelEvent::StatusUpdated(status) => {
            assert_eq!(status.player_state, PlayerState::Playing);
            assert_eq!(status.stream_position, 10.0);
            assert_eq!(
                status.media_information.unwrap().content_id(),
                "http://media.local/intro.flac"
            );
        }
        _ => unreachable!(),
    }
    assert_eq!(channel_completion(&events, load), Ok(()));
    assert!(channel.approximate_stream_position() >= 10.0);
    assert_eq!(manager.media_status(), channel.media_status());

    channel.pause().unwrap();
    match wait_for(&events, |e| matches!(e, MediaChannelEvent::StatusUpdated(_))) {
        MediaChannelEvent::StatusUpdated(status) => {
            assert_eq!(status.player_state, PlayerState::Paused)
        }
        _ => unreachable!(),
    }

    let seek = channel.seek_to_time_interval(42.0).unwrap();
    assert_eq!(channel_completion(&events, seek), Ok(()));
    assert_eq!(channel.media_status().unwrap().stream_position, 42.0);
    assert_eq!(channel.approximate_stream_position(), 42.0);

    let status = channel.request_status().unwrap();
    assert_eq!(channel_completion(&events, status), Ok(()));
    assert!(Script::called(&script, "status"));

    let err = channel.seek_to_time_interval(-1.0).unwrap_err();
    assert_eq!(err.code(), CastErrorCode::InvalidRequest);
}

#[test]
fn test_commands_without_media_session_fail_asynchronously() {
    let (manager, _script) = manager();
    let _events = connected_session(&manager);
    let (channel, events) = attached_channel(&manager);

    // Accepted: the precondition is only checked by the worker.
    channel.play().unwrap();
    match wait_for(&events, |e| matches!(e, MediaChannelEvent::CommandFailed { .. })) {
        MediaChannelEvent::CommandFailed { command, error } => {
            assert_eq!(command, MediaCommand::Play);
            assert_eq!(error.code(), CastErrorCode::InvalidMediaPlayerState);
        }
        _ => unreachable!(),
    }

    let seek = channel.seek_to_time_interval(5.0).unwrap();
    assert_eq!(
        channel_completion(&events, seek).unwrap_err().code(),
        CastErrorCode::InvalidMediaPlayerState
    );
}

#[test]
fn test_newer_load_replaces_pending_load() {
    let (manager, script) = manager();
    let _events = connected_session(&manager);
    let (channel, events) = attached_channel(&manager);

    let release = Script::gate(&script, "load");
    let first = channel.load_media(track("first"), true, 0.0).unwrap();
    Script::wait_for_call(&script, "load http://media.local/first.flac");

    let second = channel.load_media(track("second"), true, 0.0).unwrap();
    assert_ne!(first, second);
    assert_eq!(
        channel_completion(&events, first).unwrap_err().code(),
        CastErrorCode::Replaced
    );

    release.send(()).unwrap();
    assert_eq!(channel_completion(&events, second), Ok(()));
    assert_eq!(
        channel
            .media_status()
            .unwrap()
            .media_information
            .unwrap()
            .content_id(),
        "http://media.local/second.flac"
    );
}

#[test]
fn test_load_cancels_pending_seek() {
    let (manager, script) = manager();
    let _events = connected_session(&manager);
    let (channel, events) = attached_channel(&manager);

    let load = channel.load_media(track("a"), true, 0.0).unwrap();
    assert_eq!(channel_completion(&events, load), Ok(()));

    let release = Script::gate(&script, "seek");
    let seek = channel.seek_to_time_interval(30.0).unwrap();
    Script::wait_for_call(&script, "seek 30");

    let next = channel.load_media(track("b"), true, 0.0).unwrap();
    assert_eq!(
        channel_completion(&events, seek).unwrap_err().code(),
        CastErrorCode::Cancelled
    );
    release.send(()).unwrap();
    assert_eq!(channel_completion(&events, next), Ok(()));
}

#[test]
fn test_duplicate_status_request_is_rejected() {
    let (manager, script) = manager();
    let _events = connected_session(&manager);
    let (channel, events) = attached_channel(&manager);

    let release = Script::gate(&script, "status");
    let first = channel.request_status().unwrap();
    let err = channel.request_status().unwrap_err();
    assert_eq!(err.code(), CastErrorCode::DuplicateRequest);

    release.send(()).unwrap();
    assert_eq!(channel_completion(&events, first), Ok(()));
    assert!(channel.request_status().is_ok());
}

#[test]
fn test_link_failure_drains_outstanding_requests() {
    let (manager, script) = manager();
    let manager_events = connected_session(&manager);
    let (channel, events) = attached_channel(&manager);

    let release = Script::gate(&script, "load");
    Script::fail(&script, "load", CastError::network("socket closed"));
    let load = channel.load_media(track("doomed"), true, 0.0).unwrap();
    Script::wait_for_call(&script, "load http://media.local/doomed.flac");
    let status = channel.request_status().unwrap();

    release.send(()).unwrap();
    assert_eq!(
        channel_completion(&events, load).unwrap_err().code(),
        CastErrorCode::NetworkError
    );
    assert_eq!(
        channel_completion(&events, status).unwrap_err().code(),
        CastErrorCode::Disconnected
    );
    wait_for(&events, |e| *e == MediaChannelEvent::Detached);

    wait_for(&manager_events, |e| {
        matches!(e, DeviceManagerEvent::ApplicationDisconnected(Some(_)))
    });
    match wait_for(&manager_events, |e| {
        matches!(e, DeviceManagerEvent::Disconnected(_))
    }) {
        DeviceManagerEvent::Disconnected(Some(err)) => {
            assert_eq!(err.code(), CastErrorCode::NetworkError)
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        manager.application_connection_state(),
        ConnectionState::Disconnected
    );
    assert!(manager.application().is_none());
    assert_eq!(
        channel.load_media(track("late"), true, 0.0).unwrap_err().code(),
        CastErrorCode::InvalidState
    );
}

#[test]
fn test_disconnect_detaches_channels() {
    let (manager, script) = manager();
    let manager_events = connected_session(&manager);
    let (channel, events) = attached_channel(&manager);

    manager.disconnect();
    wait_for(&manager_events, |e| {
        *e == DeviceManagerEvent::StateChanged(ConnectionState::Disconnecting)
    });
    wait_for(&manager_events, |e| *e == DeviceManagerEvent::Disconnected(None));
    wait_for(&events, |e| *e == MediaChannelEvent::Detached);

    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert!(Script::called(&script, "close"));
    assert_eq!(channel.pause().unwrap_err().code(), CastErrorCode::InvalidState);

    // The manager can connect again.
    manager.connect();
    wait_for(&manager_events, |e| *e == DeviceManagerEvent::Connected);
}

#[test]
fn test_stop_application() {
    let (manager, script) = manager();
    let manager_events = connected_session(&manager);
    let (_channel, events) = attached_channel(&manager);

    let err = manager.stop_application("other-session").unwrap_err();
    assert_eq!(err.code(), CastErrorCode::InvalidApplicationSessionId);

    let request = manager.stop_application("session-1").unwrap();
    wait_for(&manager_events, |e| {
        *e == DeviceManagerEvent::ApplicationStateChanged(ConnectionState::Disconnecting)
    });
    wait_for(&manager_events, |e| {
        *e == DeviceManagerEvent::ApplicationDisconnected(None)
    });
    wait_for(&manager_events, |e| {
        *e == DeviceManagerEvent::RequestCompleted {
            request,
            result: Ok(()),
        }
    });
    wait_for(&events, |e| *e == MediaChannelEvent::Detached);

    assert!(Script::called(&script, "stop session-1"));
    assert_eq!(
        manager.application_connection_state(),
        ConnectionState::Disconnected
    );
    assert_eq!(manager.connection_state(), ConnectionState::Connected);
    let err = manager.stop_application("session-1").unwrap_err();
    assert_eq!(err.code(), CastErrorCode::ApplicationNotRunning);
}

#[test]
fn test_status_polling_reports_changes() {
    let (manager, script) = manager_with(Duration::from_millis(20));
    let _events = connected_session(&manager);
    let (channel, events) = attached_channel(&manager);

    let load = channel.load_media(track("polled"), false, 0.0).unwrap();
    assert_eq!(channel_completion(&events, load), Ok(()));

    // The receiver moves on by itself.
    if let Some(status) = script.lock().unwrap().status.as_mut() {
        status.player_state = PlayerState::Buffering;
    }
    wait_for(&events, |e| {
        matches!(e, MediaChannelEvent::StatusUpdated(s) if s.player_state == PlayerState::Buffering)
    });
    assert!(Script::called(&script, "keep_alive"));
}

#[test]
fn test_heartbeat_failure_drops_the_link() {
    let (manager, script) = manager_with(Duration::from_millis(20));
    let events = manager.subscribe();
    manager.connect();
    wait_for(&events, |e| *e == DeviceManagerEvent::Connected);

    Script::fail(&script, "keep_alive", CastError::network("no pong"));
    match wait_for(&events, |e| matches!(e, DeviceManagerEvent::Disconnected(_))) {
        DeviceManagerEvent::Disconnected(Some(err)) => {
            assert_eq!(err.code(), CastErrorCode::NetworkError)
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
}

#[test]
fn test_removed_channel_requests_are_cancelled() {
    let (manager, script) = manager();
    let _events = connected_session(&manager);
    let (channel, events) = attached_channel(&manager);

    // Keep the worker busy so the load stays queued.
    let release = Script::gate(&script, "status");
    let status = channel.request_status().unwrap();
    Script::wait_for_call(&script, "status");
    let load = channel.load_media(track("orphan"), true, 0.0).unwrap();

    assert!(manager.remove_channel(MEDIA_NAMESPACE));
    assert_eq!(
        channel_completion(&events, status).unwrap_err().code(),
        CastErrorCode::Cancelled
    );
    assert_eq!(
        channel_completion(&events, load).unwrap_err().code(),
        CastErrorCode::Cancelled
    );
    wait_for(&events, |e| *e == MediaChannelEvent::Detached);

    // A new channel is not blocked by the removed one's requests.
    let (fresh, fresh_events) = attached_channel(&manager);
    let request = fresh.request_status().unwrap();
    release.send(()).unwrap();
    assert_eq!(channel_completion(&fresh_events, request), Ok(()));

    // Commands are handled in order: the cancelled load was skipped.
    assert!(!Script::called(&script, "load http://media.local/orphan.flac"));
}

#[test]
fn test_ended_media_session_clears_channel_status() {
    let (manager, script) = manager();
    let _events = connected_session(&manager);
    let (channel, events) = attached_channel(&manager);

    let load = channel.load_media(track("ending"), true, 0.0).unwrap();
    assert_eq!(channel_completion(&events, load), Ok(()));
    assert!(channel.media_status().is_some());

    script.lock().unwrap().status = None;
    let request = channel.request_status().unwrap();
    wait_for(&events, |e| *e == MediaChannelEvent::StatusCleared);
    assert_eq!(channel_completion(&events, request), Ok(()));

    assert_eq!(manager.media_status(), None);
    assert_eq!(channel.media_status(), None);
    assert_eq!(channel.approximate_stream_position(), 0.0);

    // No media session left to seek in.
    let seek = channel.seek_to_time_interval(3.0).unwrap();
    assert_eq!(
        channel_completion(&events, seek).unwrap_err().code(),
        CastErrorCode::InvalidMediaPlayerState
    );
}

#[test]
fn test_polling_notices_ended_media_session() {
    let (manager, script) = manager_with(Duration::from_millis(20));
    let _events = connected_session(&manager);
    let (channel, events) = attached_channel(&manager);

    let load = channel.load_media(track("short"), true, 0.0).unwrap();
    assert_eq!(channel_completion(&events, load), Ok(()));

    script.lock().unwrap().status = None;
    wait_for(&events, |e| *e == MediaChannelEvent::StatusCleared);
    assert_eq!(channel.media_status(), None);
    assert_eq!(manager.media_status(), None);
}

#[test]
fn test_relaunch_detaches_old_channels() {
    let (manager, _script) = manager();
    let manager_events = connected_session(&manager);
    let (old, old_events) = attached_channel(&manager);

    let load = old.load_media(track("before"), true, 0.0).unwrap();
    assert_eq!(channel_completion(&old_events, load), Ok(()));
    assert!(manager.media_status().is_some());

    let request = manager
        .launch_application(DEFAULT_MEDIA_RECEIVER_APP_ID)
        .unwrap();
    wait_for(&manager_events, |e| {
        matches!(e, DeviceManagerEvent::ApplicationConnected(_))
    });
    wait_for(&manager_events, |e| {
        *e == DeviceManagerEvent::RequestCompleted {
            request,
            result: Ok(()),
        }
    });
    wait_for(&old_events, |e| *e == MediaChannelEvent::Detached);

    assert!(!old.is_attached());
    assert_eq!(manager.media_status(), None);
    assert_eq!(
        manager.application_connection_state(),
        ConnectionState::Connected
    );

    // The new session takes a channel for the same namespace.
    let (fresh, fresh_events) = attached_channel(&manager);
    let load = fresh.load_media(track("after"), true, 0.0).unwrap();
    assert_eq!(channel_completion(&fresh_events, load), Ok(()));
}

#[test]
fn test_disconnect_while_connecting_aborts_the_attempt() {
    let (manager, script) = manager();
    let events = manager.subscribe();

    let release = Script::gate(&script, "open");
    manager.connect();
    Script::wait_for_call(&script, "open 192.168.1.30:8009");

    manager.disconnect();
    assert_eq!(manager.connection_state(), ConnectionState::Disconnecting);
    release.send(()).unwrap();

    let mut seen = Vec::new();
    loop {
        let event = events.recv_timeout(WAIT).unwrap();
        let done = event == DeviceManagerEvent::Disconnected(None);
        seen.push(event);
        if done {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![
            DeviceManagerEvent::StateChanged(ConnectionState::Connecting),
            DeviceManagerEvent::StateChanged(ConnectionState::Disconnecting),
            DeviceManagerEvent::StateChanged(ConnectionState::Disconnected),
            DeviceManagerEvent::Disconnected(None),
        ]
    );
    assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    assert!(Script::called(&script, "close"));
}
