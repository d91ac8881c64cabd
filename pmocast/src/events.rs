use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::errors::CastError;
use crate::media::MediaStatus;
use crate::model::{ConnectionState, Device};
use crate::request::RequestId;
use crate::transport::ApplicationMetadata;

/// Events emitted by a device scanner.
#[derive(Clone, Debug, PartialEq)]
pub enum ScannerEvent {
    DeviceOnline(Device),
    DeviceOffline(Device),
    /// A property other than id/ip/port changed.
    DeviceChanged(Device),
}

/// Events emitted by a device manager.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceManagerEvent {
    /// The device link moved to a new state.
    StateChanged(ConnectionState),
    /// The application session moved to a new state.
    ApplicationStateChanged(ConnectionState),
    Connected,
    ConnectionFailed(CastError),
    /// The link is down; `Some` when it was lost rather than closed.
    Disconnected(Option<CastError>),
    ApplicationConnected(ApplicationMetadata),
    ApplicationDisconnected(Option<CastError>),
    RequestCompleted {
        request: RequestId,
        result: Result<(), CastError>,
    },
}

/// Fire-and-forget media commands, reported only when they fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaCommand {
    Play,
    Pause,
}

/// Events emitted by a media control channel.
#[derive(Clone, Debug, PartialEq)]
pub enum MediaChannelEvent {
    /// The channel was registered on a connected application session.
    Attached,
    /// The application session went away.
    Detached,
    StatusUpdated(MediaStatus),
    /// The receiver no longer has a media session.
    StatusCleared,
    RequestCompleted {
        request: RequestId,
        result: Result<(), CastError>,
    },
    CommandFailed {
        command: MediaCommand,
        error: CastError,
    },
}

/// Fan-out of events to every live subscriber.
///
/// Subscribers whose receiver was dropped are pruned on the next broadcast.
#[derive(Clone)]
pub struct EventBus<T: Clone> {
    subscribers: Arc<Mutex<Vec<Sender<T>>>>,
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = unbounded::<T>();
        {
            let mut subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscribers.push(tx);
        }
        rx
    }

    pub fn broadcast(&self, event: T) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}
