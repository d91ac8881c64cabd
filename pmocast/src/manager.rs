//! Connection and application session lifecycle for one receiver.
//!
//! A [`CastDeviceManager`] owns a worker thread that owns the
//! [`CastTransport`]. Public calls validate preconditions against the shared
//! session state, register the request and queue a command. The worker runs
//! commands in order, polls media status and reports results as events.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, error, info, warn};

use crate::channel::CastChannel;
use crate::chromecast_transport::RustCastTransport;
use crate::config::CastConfig;
use crate::errors::{CastError, CastErrorCode, CastResult};
use crate::events::{DeviceManagerEvent, EventBus, MediaCommand};
use crate::media::{MediaInformation, MediaStatus};
use crate::model::{ConnectionState, Device};
use crate::request::{RequestId, RequestKind, RequestTracker, Superseded};
use crate::transport::{ApplicationMetadata, CastTransport, TransportFactory};

/// Request kinds issued through media channels.
const MEDIA_REQUESTS: [RequestKind; 3] = [
    RequestKind::LoadMedia,
    RequestKind::Seek,
    RequestKind::RequestStatus,
];

pub trait DeviceManager: Send + Sync {
    fn device(&self) -> &Device;

    fn client_package_name(&self) -> &str;

    fn connection_state(&self) -> ConnectionState;

    fn application_connection_state(&self) -> ConnectionState;

    /// The application session, once launched.
    fn application(&self) -> Option<ApplicationMetadata>;

    /// Opens the link. Outcome is reported through [`DeviceManagerEvent`]s.
    /// Ignored unless the link is `Disconnected`.
    fn connect(&self);

    /// Closes the link. Ignored when already disconnected or disconnecting.
    fn disconnect(&self);

    fn launch_application(&self, application_id: &str) -> CastResult<RequestId>;

    fn stop_application(&self, session_id: &str) -> CastResult<RequestId>;

    /// Registers a channel on the connected application session.
    fn add_channel(&self, channel: Arc<dyn CastChannel>) -> CastResult<()>;

    /// Detaches the channel registered for `namespace`, if any.
    fn remove_channel(&self, namespace: &str) -> bool;

    fn subscribe(&self) -> Receiver<DeviceManagerEvent>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Period of the heartbeat and of media status polling.
    pub status_poll_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            status_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Where a request completion goes.
#[derive(Clone)]
enum Sink {
    Manager,
    Channel(Weak<dyn CastChannel>),
}

/// Something to report once the session lock is released.
enum Notice {
    Event(DeviceManagerEvent),
    Completed {
        sink: Sink,
        request: RequestId,
        result: Result<(), CastError>,
    },
    Status {
        channel: Arc<dyn CastChannel>,
        status: MediaStatus,
    },
    Detached(Arc<dyn CastChannel>),
    Cleared(Arc<dyn CastChannel>),
}

#[derive(Default)]
struct Outbox(Vec<Notice>);

impl Outbox {
    fn event(&mut self, event: DeviceManagerEvent) {
        self.0.push(Notice::Event(event));
    }

    fn complete(&mut self, sink: Sink, request: RequestId, result: Result<(), CastError>) {
        self.0.push(Notice::Completed {
            sink,
            request,
            result,
        });
    }

    fn supersede(&mut self, superseded: Vec<Superseded<Sink>>) {
        for s in superseded {
            debug!(request = %s.request, kind = s.kind.as_str(), code = %s.error.code(), "Request superseded");
            self.complete(s.sink, s.request, Err(s.error));
        }
    }

    fn deliver(self, events: &EventBus<DeviceManagerEvent>) {
        for notice in self.0 {
            match notice {
                Notice::Event(event) => events.broadcast(event),
                Notice::Completed {
                    sink: Sink::Manager,
                    request,
                    result,
                } => events.broadcast(DeviceManagerEvent::RequestCompleted { request, result }),
                Notice::Completed {
                    sink: Sink::Channel(channel),
                    request,
                    result,
                } => {
                    if let Some(channel) = channel.upgrade() {
                        channel.did_complete_request(request, result);
                    }
                }
                Notice::Status { channel, status } => channel.did_update_media_status(&status),
                Notice::Detached(channel) => channel.did_disconnect(),
                Notice::Cleared(channel) => channel.did_clear_media_status(),
            }
        }
    }
}

struct Attachment {
    id: u64,
    channel: Arc<dyn CastChannel>,
}

struct SessionState {
    connection: ConnectionState,
    application_state: ConnectionState,
    application: Option<ApplicationMetadata>,
    channels: Vec<Attachment>,
    next_attachment: u64,
    media_session_id: Option<i32>,
    last_status: Option<MediaStatus>,
    requests: RequestTracker<Sink>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            application_state: ConnectionState::Disconnected,
            application: None,
            channels: Vec::new(),
            next_attachment: 1,
            media_session_id: None,
            last_status: None,
            requests: RequestTracker::new(),
        }
    }

    fn set_connection(&mut self, next: ConnectionState, outbox: &mut Outbox) {
        if self.connection == next {
            return;
        }
        if !self.connection.can_transition_to(next) {
            warn!(from = ?self.connection, to = ?next, "Refusing invalid link transition");
            return;
        }
        debug!(from = ?self.connection, to = ?next, "Link state changed");
        self.connection = next;
        outbox.event(DeviceManagerEvent::StateChanged(next));
    }

    fn set_application_state(&mut self, next: ConnectionState, outbox: &mut Outbox) {
        if self.application_state == next {
            return;
        }
        if !self.application_state.can_transition_to(next) {
            warn!(from = ?self.application_state, to = ?next, "Refusing invalid application transition");
            return;
        }
        debug!(from = ?self.application_state, to = ?next, "Application state changed");
        self.application_state = next;
        outbox.event(DeviceManagerEvent::ApplicationStateChanged(next));
    }

    fn require_connected(&self, operation: &str) -> CastResult<()> {
        if self.connection.is_connected() {
            Ok(())
        } else {
            Err(CastError::invalid_state(format!(
                "cannot {operation} while the device link is {:?}",
                self.connection
            )))
        }
    }

    fn require_attached(&self, attachment: u64, operation: &str) -> CastResult<()> {
        self.require_connected(operation)?;
        if !self.application_state.is_connected()
            || !self.channels.iter().any(|a| a.id == attachment)
        {
            return Err(CastError::invalid_state(format!(
                "cannot {operation}: channel is not attached"
            )));
        }
        Ok(())
    }

    fn detach_channels(&mut self, outbox: &mut Outbox) {
        for attachment in self.channels.drain(..) {
            outbox.0.push(Notice::Detached(attachment.channel));
        }
    }

    fn clear_media(&mut self) {
        self.media_session_id = None;
        self.last_status = None;
    }

    /// The receiver has no media session any more; attached channels drop
    /// their status.
    fn end_media(&mut self, outbox: &mut Outbox) {
        if self.media_session_id.is_none() && self.last_status.is_none() {
            return;
        }
        self.clear_media();
        for attachment in &self.channels {
            outbox.0.push(Notice::Cleared(Arc::clone(&attachment.channel)));
        }
    }

    /// Cancels the outstanding requests issued through `channel`.
    fn cancel_channel_requests(&mut self, channel: &Arc<dyn CastChannel>, outbox: &mut Outbox) {
        let channel = Arc::downgrade(channel);
        let cancelled = CastError::new(CastErrorCode::Cancelled, "channel was detached");
        let drained = self.requests.drain_matching(
            |sink| matches!(sink, Sink::Channel(owner) if Weak::ptr_eq(owner, &channel)),
            &cancelled,
        );
        outbox.supersede(drained);
    }

    /// Cancels every outstanding media request.
    fn cancel_media_requests(&mut self, reason: &str, outbox: &mut Outbox) {
        let cancelled = CastError::new(CastErrorCode::Cancelled, reason);
        let drained = self.requests.drain_kinds(&MEDIA_REQUESTS, &cancelled);
        outbox.supersede(drained);
    }

    /// Ends the application session, cancelling media requests.
    fn end_application(&mut self, reason: Option<CastError>, outbox: &mut Outbox) {
        self.cancel_media_requests("application session ended", outbox);
        self.detach_channels(outbox);
        self.clear_media();
        self.set_application_state(ConnectionState::Disconnected, outbox);
        if let Some(app) = self.application.take() {
            info!(app = %app.display_name, session = %app.session_id, "Application session ended");
            outbox.event(DeviceManagerEvent::ApplicationDisconnected(reason));
        }
    }

    fn record_status(&mut self, status: MediaStatus, outbox: &mut Outbox) {
        self.media_session_id = Some(status.media_session_id);
        self.last_status = Some(status.clone());
        for attachment in &self.channels {
            outbox.0.push(Notice::Status {
                channel: Arc::clone(&attachment.channel),
                status: status.clone(),
            });
        }
    }
}

struct Session {
    device: Device,
    client_package_name: String,
    state: Mutex<SessionState>,
    events: EventBus<DeviceManagerEvent>,
}

impl Session {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum Command {
    Connect,
    Disconnect,
    Launch {
        request: RequestId,
        application_id: String,
    },
    Stop {
        request: RequestId,
        session_id: String,
    },
    Load {
        request: RequestId,
        media: MediaInformation,
        autoplay: bool,
        play_position: f64,
    },
    Seek {
        request: RequestId,
        position: f64,
    },
    RequestStatus {
        request: RequestId,
    },
    Media {
        command: MediaCommand,
        sink: Weak<dyn CastChannel>,
    },
    Shutdown,
}

fn worker_gone() -> CastError {
    CastError::new(CastErrorCode::Unknown, "device manager worker is not running")
}

/// Handle given to a channel when it is attached to an application session.
///
/// It stops working as soon as the channel is detached.
#[derive(Clone)]
pub struct ChannelLink {
    session: Arc<Session>,
    commands: Sender<Command>,
    attachment: u64,
    channel: Weak<dyn CastChannel>,
    application: ApplicationMetadata,
}

impl ChannelLink {
    pub fn application(&self) -> &ApplicationMetadata {
        &self.application
    }

    pub fn device(&self) -> &Device {
        &self.session.device
    }

    pub fn is_attached(&self) -> bool {
        self.session
            .lock()
            .require_attached(self.attachment, "check attachment")
            .is_ok()
    }

    /// Registers a tracked request and queues its command.
    fn submit(
        &self,
        kind: RequestKind,
        command: impl FnOnce(RequestId) -> Command,
    ) -> CastResult<RequestId> {
        let mut outbox = Outbox::default();
        let request = {
            let mut state = self.session.lock();
            state.require_attached(self.attachment, kind.as_str())?;
            let (request, superseded) = state
                .requests
                .begin(kind, Sink::Channel(Weak::clone(&self.channel)))?;
            outbox.supersede(superseded);
            request
        };
        outbox.deliver(&self.session.events);

        self.commands
            .send(command(request))
            .map_err(|_| worker_gone())?;
        debug!(request = %request, kind = kind.as_str(), device = %self.session.device.friendly_name, "Request queued");
        Ok(request)
    }

    pub(crate) fn load_media(
        &self,
        media: MediaInformation,
        autoplay: bool,
        play_position: f64,
    ) -> CastResult<RequestId> {
        if !play_position.is_finite() || play_position < 0.0 {
            return Err(CastError::new(
                CastErrorCode::InvalidRequest,
                format!("invalid start position {play_position}"),
            ));
        }
        self.submit(RequestKind::LoadMedia, |request| Command::Load {
            request,
            media,
            autoplay,
            play_position,
        })
    }

    pub(crate) fn seek(&self, position: f64) -> CastResult<RequestId> {
        if !position.is_finite() || position < 0.0 {
            return Err(CastError::new(
                CastErrorCode::InvalidRequest,
                format!("invalid seek position {position}"),
            ));
        }
        self.submit(RequestKind::Seek, |request| Command::Seek { request, position })
    }

    pub(crate) fn request_status(&self) -> CastResult<RequestId> {
        self.submit(RequestKind::RequestStatus, |request| {
            Command::RequestStatus { request }
        })
    }

    pub(crate) fn send_command(&self, command: MediaCommand) -> CastResult<()> {
        self.session
            .lock()
            .require_attached(self.attachment, "send media command")?;
        self.commands
            .send(Command::Media {
                command,
                sink: Weak::clone(&self.channel),
            })
            .map_err(|_| worker_gone())
    }
}

/// [`DeviceManager`] backed by a worker thread.
pub struct CastDeviceManager {
    session: Arc<Session>,
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl CastDeviceManager {
    /// Manager talking to `device` through `rust_cast`.
    pub fn new(device: Device, client_package_name: impl Into<String>) -> Self {
        Self::with_transport(
            device,
            client_package_name,
            Box::new(|| Box::new(RustCastTransport::new()) as Box<dyn CastTransport>),
            ManagerOptions::default(),
        )
    }

    pub fn with_config(device: Device, config: &CastConfig) -> Self {
        Self::with_transport(
            device,
            config.client_package_name.clone(),
            Box::new(|| Box::new(RustCastTransport::new()) as Box<dyn CastTransport>),
            config.manager_options(),
        )
    }

    /// Manager using the transport built by `factory` on the worker thread.
    pub fn with_transport(
        device: Device,
        client_package_name: impl Into<String>,
        factory: TransportFactory,
        options: ManagerOptions,
    ) -> Self {
        let session = Arc::new(Session {
            device,
            client_package_name: client_package_name.into(),
            state: Mutex::new(SessionState::new()),
            events: EventBus::new(),
        });
        let (commands, receiver) = unbounded::<Command>();

        let worker_session = Arc::clone(&session);
        let worker = thread::Builder::new()
            .name(format!("pmocast-{}", session.device.friendly_name))
            .spawn(move || {
                Worker {
                    session: worker_session,
                    transport: factory(),
                    commands: receiver,
                    options,
                }
                .run()
            });

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(device = %session.device.friendly_name, error = %err, "Cannot spawn device manager worker");
                None
            }
        };

        Self {
            session,
            commands,
            worker,
        }
    }

    /// Last media status received on the application session.
    pub fn media_status(&self) -> Option<MediaStatus> {
        self.session.lock().last_status.clone()
    }

    fn queue(&self, command: Command) -> CastResult<()> {
        self.commands.send(command).map_err(|_| worker_gone())
    }

    /// Rolls back a request whose command could not be queued.
    fn abandon(&self, kind: RequestKind, request: RequestId) {
        self.session.lock().requests.finish(kind, request);
    }
}

impl DeviceManager for CastDeviceManager {
    fn device(&self) -> &Device {
        &self.session.device
    }

    fn client_package_name(&self) -> &str {
        &self.session.client_package_name
    }

    fn connection_state(&self) -> ConnectionState {
        self.session.lock().connection
    }

    fn application_connection_state(&self) -> ConnectionState {
        self.session.lock().application_state
    }

    fn application(&self) -> Option<ApplicationMetadata> {
        self.session.lock().application.clone()
    }

    fn connect(&self) {
        let mut outbox = Outbox::default();
        {
            let mut state = self.session.lock();
            if state.connection != ConnectionState::Disconnected {
                debug!(state = ?state.connection, "connect() ignored");
                return;
            }
            state.set_connection(ConnectionState::Connecting, &mut outbox);
        }
        outbox.deliver(&self.session.events);
        info!(device = %self.session.device.friendly_name, address = %self.session.device.address(), "Connecting");

        if let Err(err) = self.queue(Command::Connect) {
            let mut outbox = Outbox::default();
            self.session
                .lock()
                .set_connection(ConnectionState::Disconnected, &mut outbox);
            outbox.event(DeviceManagerEvent::ConnectionFailed(err));
            outbox.deliver(&self.session.events);
        }
    }

    fn disconnect(&self) {
        let mut outbox = Outbox::default();
        {
            let mut state = self.session.lock();
            match state.connection {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    state.set_connection(ConnectionState::Disconnecting, &mut outbox);
                }
                other => {
                    debug!(state = ?other, "disconnect() ignored");
                    return;
                }
            }
        }
        outbox.deliver(&self.session.events);
        info!(device = %self.session.device.friendly_name, "Disconnecting");

        if self.queue(Command::Disconnect).is_err() {
            warn!("Device manager worker is gone; link state left as disconnecting");
        }
    }

    fn launch_application(&self, application_id: &str) -> CastResult<RequestId> {
        let mut outbox = Outbox::default();
        let request = {
            let mut state = self.session.lock();
            state.require_connected("launch an application")?;
            let (request, superseded) = state
                .requests
                .begin(RequestKind::LaunchApplication, Sink::Manager)?;
            outbox.supersede(superseded);
            if state.application_state == ConnectionState::Disconnected {
                state.set_application_state(ConnectionState::Connecting, &mut outbox);
            }
            request
        };
        outbox.deliver(&self.session.events);

        if let Err(err) = self.queue(Command::Launch {
            request,
            application_id: application_id.to_string(),
        }) {
            self.abandon(RequestKind::LaunchApplication, request);
            return Err(err);
        }
        info!(request = %request, app = application_id, "Launching application");
        Ok(request)
    }

    fn stop_application(&self, session_id: &str) -> CastResult<RequestId> {
        let request = {
            let mut state = self.session.lock();
            state.require_connected("stop an application")?;
            let running = state
                .application
                .as_ref()
                .filter(|_| state.application_state.is_connected());
            match running {
                None => {
                    return Err(CastError::new(
                        CastErrorCode::ApplicationNotRunning,
                        "no application session is running",
                    ));
                }
                Some(app) if app.session_id != session_id => {
                    return Err(CastError::new(
                        CastErrorCode::InvalidApplicationSessionId,
                        format!("unknown application session {session_id}"),
                    ));
                }
                Some(_) => {}
            }
            let (request, _) = state
                .requests
                .begin(RequestKind::StopApplication, Sink::Manager)?;
            request
        };

        if let Err(err) = self.queue(Command::Stop {
            request,
            session_id: session_id.to_string(),
        }) {
            self.abandon(RequestKind::StopApplication, request);
            return Err(err);
        }
        info!(request = %request, session = session_id, "Stopping application");
        Ok(request)
    }

    fn add_channel(&self, channel: Arc<dyn CastChannel>) -> CastResult<()> {
        let link = {
            let mut state = self.session.lock();
            state.require_connected("add a channel")?;
            let application = match (&state.application, state.application_state) {
                (Some(app), ConnectionState::Connected) => app.clone(),
                _ => {
                    return Err(CastError::invalid_state(
                        "no application session is connected",
                    ));
                }
            };

            let namespace = channel.namespace().to_string();
            if state
                .channels
                .iter()
                .any(|a| a.channel.namespace() == namespace)
            {
                return Err(CastError::new(
                    CastErrorCode::DuplicateRequest,
                    format!("a channel is already registered for {namespace}"),
                ));
            }
            if !application.supports_namespace(&namespace) {
                return Err(CastError::new(
                    CastErrorCode::NotAllowed,
                    format!("{} does not support {namespace}", application.display_name),
                ));
            }

            let id = state.next_attachment;
            state.next_attachment += 1;
            state.channels.push(Attachment {
                id,
                channel: Arc::clone(&channel),
            });

            ChannelLink {
                session: Arc::clone(&self.session),
                commands: self.commands.clone(),
                attachment: id,
                channel: Arc::downgrade(&channel),
                application,
            }
        };

        info!(namespace = channel.namespace(), "Channel attached");
        channel.did_connect(link);
        Ok(())
    }

    fn remove_channel(&self, namespace: &str) -> bool {
        let mut outbox = Outbox::default();
        {
            let mut state = self.session.lock();
            let Some(index) = state
                .channels
                .iter()
                .position(|a| a.channel.namespace() == namespace)
            else {
                return false;
            };
            let attachment = state.channels.remove(index);
            state.cancel_channel_requests(&attachment.channel, &mut outbox);
            outbox.0.push(Notice::Detached(attachment.channel));
        }

        info!(namespace, "Channel removed");
        outbox.deliver(&self.session.events);
        true
    }

    fn subscribe(&self) -> Receiver<DeviceManagerEvent> {
        self.session.events.subscribe()
    }
}

impl Drop for CastDeviceManager {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

struct Worker {
    session: Arc<Session>,
    transport: Box<dyn CastTransport>,
    commands: Receiver<Command>,
    options: ManagerOptions,
}

impl Worker {
    fn run(mut self) {
        let interval = self.options.status_poll_interval;
        let mut last_poll = Instant::now();

        loop {
            match self.commands.recv_timeout(interval) {
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
            }

            if last_poll.elapsed() >= interval {
                self.poll();
                last_poll = Instant::now();
            }
        }

        let connected = self.session.lock().connection != ConnectionState::Disconnected;
        if connected {
            self.tear_down(None);
        } else {
            self.transport.close();
        }
        debug!(device = %self.session.device.friendly_name, "Device manager worker exiting");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect => self.open(),
            Command::Disconnect => {
                let connected = self.session.lock().connection != ConnectionState::Disconnected;
                if connected {
                    self.tear_down(None);
                } else {
                    self.transport.close();
                }
            }
            Command::Launch {
                request,
                application_id,
            } => self.launch(request, &application_id),
            Command::Stop {
                request,
                session_id,
            } => self.stop(request, &session_id),
            Command::Load {
                request,
                media,
                autoplay,
                play_position,
            } => self.load(request, &media, autoplay, play_position),
            Command::Seek { request, position } => self.seek(request, position),
            Command::RequestStatus { request } => self.request_status(request),
            Command::Media { command, sink } => self.media_command(command, sink),
            Command::Shutdown => {}
        }
    }

    fn open(&mut self) {
        let device = self.session.device.clone();
        let result = self
            .transport
            .open(&device, &self.session.client_package_name);

        let mut outbox = Outbox::default();
        {
            let mut state = self.session.lock();
            match result {
                Ok(()) if state.connection == ConnectionState::Connecting => {
                    info!(device = %device.friendly_name, "Connected");
                    state.set_connection(ConnectionState::Connected, &mut outbox);
                    outbox.event(DeviceManagerEvent::Connected);
                }
                Ok(()) => {
                    debug!(state = ?state.connection, "Link opened after disconnect was requested");
                }
                Err(err) => {
                    warn!(device = %device.friendly_name, error = %err, "Connection failed");
                    state.set_connection(ConnectionState::Disconnected, &mut outbox);
                    outbox.event(DeviceManagerEvent::ConnectionFailed(err));
                }
            }
        }
        outbox.deliver(&self.session.events);
    }

    /// Closes the link and resets the session.
    ///
    /// Every outstanding request completes with `Disconnected`.
    fn tear_down(&mut self, reason: Option<CastError>) {
        self.transport.close();

        let mut outbox = Outbox::default();
        {
            let mut state = self.session.lock();
            let message = match &reason {
                Some(err) => format!("link lost: {err}"),
                None => "disconnected from device".to_string(),
            };
            let drained = state.requests.drain(&CastError::disconnected(message));
            outbox.supersede(drained);

            state.end_application(reason.clone(), &mut outbox);
            state.set_connection(ConnectionState::Disconnected, &mut outbox);
            outbox.event(DeviceManagerEvent::Disconnected(reason.clone()));
        }

        match &reason {
            Some(err) => warn!(device = %self.session.device.friendly_name, error = %err, "Link lost"),
            None => info!(device = %self.session.device.friendly_name, "Disconnected"),
        }
        outbox.deliver(&self.session.events);
    }

    /// Finishes `request` with `result`.
    ///
    /// `apply` updates the session on success. Results of requests that were
    /// superseded meanwhile are dropped. A link failure tears the link down.
    fn settle<T>(
        &mut self,
        kind: RequestKind,
        request: RequestId,
        result: CastResult<T>,
        apply: impl FnOnce(&mut SessionState, &CastResult<T>, &mut Outbox),
    ) {
        let mut outbox = Outbox::default();
        let lost = {
            let mut state = self.session.lock();
            let Some(sink) = state.requests.finish(kind, request) else {
                debug!(request = %request, kind = kind.as_str(), "Dropping result of superseded request");
                return;
            };
            apply(&mut *state, &result, &mut outbox);
            match result {
                Ok(_) => {
                    debug!(request = %request, kind = kind.as_str(), "Request completed");
                    outbox.complete(sink, request, Ok(()));
                    None
                }
                Err(err) => {
                    warn!(request = %request, kind = kind.as_str(), error = %err, "Request failed");
                    outbox.complete(sink, request, Err(err.clone()));
                    err.code().is_link_failure().then_some(err)
                }
            }
        };
        outbox.deliver(&self.session.events);

        if let Some(err) = lost {
            self.tear_down(Some(err));
        }
    }

    fn is_current(&self, kind: RequestKind, request: RequestId) -> bool {
        self.session.lock().requests.is_current(kind, request)
    }

    fn launch(&mut self, request: RequestId, application_id: &str) {
        if !self.is_current(RequestKind::LaunchApplication, request) {
            return;
        }
        let result = self.transport.launch_application(application_id);

        self.settle(
            RequestKind::LaunchApplication,
            request,
            result,
            |state, result, outbox| match result {
                Ok(app) => {
                    info!(app = %app.display_name, session = %app.session_id, "Application connected");
                    if state.application.is_some() {
                        // The receiver runs one application at a time.
                        state.cancel_media_requests("application was relaunched", outbox);
                        state.detach_channels(outbox);
                        state.clear_media();
                    }
                    state.application = Some(app.clone());
                    state.set_application_state(ConnectionState::Connected, outbox);
                    outbox.event(DeviceManagerEvent::ApplicationConnected(app.clone()));
                }
                Err(_) => {
                    if state.application.is_none() {
                        state.set_application_state(ConnectionState::Disconnected, outbox);
                    }
                }
            },
        );
    }

    fn stop(&mut self, request: RequestId, session_id: &str) {
        if !self.is_current(RequestKind::StopApplication, request) {
            return;
        }
        let result = self.transport.stop_application(session_id);

        self.settle(
            RequestKind::StopApplication,
            request,
            result,
            |state, result, outbox| {
                if result.is_ok() {
                    state.set_application_state(ConnectionState::Disconnecting, outbox);
                    state.end_application(None, outbox);
                }
            },
        );
    }

    fn current_application(&self) -> CastResult<ApplicationMetadata> {
        self.session.lock().application.clone().ok_or_else(|| {
            CastError::new(
                CastErrorCode::ApplicationNotRunning,
                "no application session is running",
            )
        })
    }

    fn current_media_session(&self) -> CastResult<i32> {
        self.session.lock().media_session_id.ok_or_else(|| {
            CastError::new(
                CastErrorCode::InvalidMediaPlayerState,
                "no media session is active",
            )
        })
    }

    fn load(
        &mut self,
        request: RequestId,
        media: &MediaInformation,
        autoplay: bool,
        play_position: f64,
    ) {
        if !self.is_current(RequestKind::LoadMedia, request) {
            return;
        }
        debug!(request = %request, content = media.content_id(), autoplay, play_position, "Loading media");
        let result = self
            .current_application()
            .and_then(|app| self.transport.load(&app, media, autoplay, play_position));

        self.settle(RequestKind::LoadMedia, request, result, |state, result, outbox| {
            if let Ok(status) = result {
                state.record_status(status.clone(), outbox);
            }
        });
    }

    fn seek(&mut self, request: RequestId, position: f64) {
        if !self.is_current(RequestKind::Seek, request) {
            return;
        }
        let result = self.current_application().and_then(|app| {
            let media_session_id = self.current_media_session()?;
            self.transport.seek(&app, media_session_id, position)
        });

        self.settle(RequestKind::Seek, request, result, |state, result, outbox| {
            if let Ok(status) = result {
                state.record_status(status.clone(), outbox);
            }
        });
    }

    fn request_status(&mut self, request: RequestId) {
        if !self.is_current(RequestKind::RequestStatus, request) {
            return;
        }
        let media_session_id = self.session.lock().media_session_id;
        let result = self
            .current_application()
            .and_then(|app| self.transport.media_status(&app, media_session_id));

        self.settle(
            RequestKind::RequestStatus,
            request,
            result,
            |state, result, outbox| match result {
                Ok(Some(status)) => state.record_status(status.clone(), outbox),
                Ok(None) => state.end_media(outbox),
                Err(_) => {}
            },
        );
    }

    fn media_command(&mut self, command: MediaCommand, sink: Weak<dyn CastChannel>) {
        let result = self.current_application().and_then(|app| {
            let media_session_id = self.current_media_session()?;
            match command {
                MediaCommand::Play => self.transport.play(&app, media_session_id),
                MediaCommand::Pause => self.transport.pause(&app, media_session_id),
            }
        });

        match result {
            Ok(status) => {
                let mut outbox = Outbox::default();
                self.session.lock().record_status(status, &mut outbox);
                outbox.deliver(&self.session.events);
            }
            Err(err) => {
                warn!(?command, error = %err, "Media command failed");
                if let Some(channel) = sink.upgrade() {
                    channel.did_fail_command(command, err.clone());
                }
                if err.code().is_link_failure() {
                    self.tear_down(Some(err));
                }
            }
        }
    }

    /// Heartbeat plus media status polling.
    fn poll(&mut self) {
        let (connected, application, media_session_id) = {
            let state = self.session.lock();
            (
                state.connection.is_connected(),
                state
                    .application
                    .clone()
                    .filter(|_| state.application_state.is_connected()),
                state.media_session_id,
            )
        };
        if !connected {
            return;
        }

        if let Err(err) = self.transport.keep_alive() {
            self.tear_down(Some(err));
            return;
        }

        let (Some(app), Some(media_session_id)) = (application, media_session_id) else {
            return;
        };

        match self.transport.media_status(&app, Some(media_session_id)) {
            Ok(Some(status)) => {
                let mut outbox = Outbox::default();
                {
                    let mut state = self.session.lock();
                    if state.last_status.as_ref() != Some(&status) {
                        state.record_status(status, &mut outbox);
                    }
                }
                outbox.deliver(&self.session.events);
            }
            Ok(None) => {
                debug!("Media session ended on the receiver");
                let mut outbox = Outbox::default();
                self.session.lock().end_media(&mut outbox);
                outbox.deliver(&self.session.events);
            }
            Err(err) if err.code().is_link_failure() => self.tear_down(Some(err)),
            Err(err) => warn!(error = %err, "Status poll failed"),
        }
    }
}
