//! Platform event channel between a USB host and the device adapter
//!
//! USB permission prompts and hot-plug notifications arrive asynchronously on
//! threads owned by the host. They are forwarded through this channel and
//! applied by the adapter, which never blocks waiting for them.

use async_channel::{Receiver, Sender, TryRecvError, bounded};
use protocol::DeviceDescriptor;

/// Capacity of the platform event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Asynchronous notifications emitted by a USB host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// Outcome of a permission request
    PermissionResult {
        /// Device the decision applies to (absent if the host lost track of it)
        device: Option<DeviceDescriptor>,
        /// Whether access was granted
        granted: bool,
    },

    /// Device hot-plugged
    DeviceAttached {
        /// Descriptor of the new device
        device: DeviceDescriptor,
    },

    /// Device unplugged
    DeviceDetached {
        /// Host-assigned id of the removed device
        device_id: u32,
    },
}

/// Sending half, held by USB hosts
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<PlatformEvent>,
}

impl EventSink {
    /// Send an event from a blocking context (host threads)
    pub fn send(&self, event: PlatformEvent) -> crate::Result<()> {
        self.tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send without blocking; fails if the channel is full or closed
    ///
    /// Used from libusb callbacks, which must not block.
    pub fn try_send(&self, event: PlatformEvent) -> crate::Result<()> {
        self.tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send an event from async code
    pub async fn send_async(&self, event: PlatformEvent) -> crate::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Whether the receiving adapter is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, held by the device adapter
#[derive(Debug, Clone)]
pub struct EventStream {
    rx: Receiver<PlatformEvent>,
}

impl EventStream {
    /// Take the next pending event without blocking
    pub fn try_recv(&self) -> Option<PlatformEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Wait for the next event (blocking)
    pub fn recv_blocking(&self) -> crate::Result<PlatformEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Wait for the next event (async)
    pub async fn recv(&self) -> crate::Result<PlatformEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Close the channel; pending and future sends fail
    pub fn close(&self) {
        if self.rx.close() {
            tracing::debug!("Platform event channel closed ({} events pending)", self.rx.len());
        }
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the platform event channel
///
/// Returns (EventSink for hosts, EventStream for the adapter)
pub fn create_event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = bounded(EVENT_CHANNEL_CAPACITY);
    (EventSink { tx }, EventStream { rx })
}
