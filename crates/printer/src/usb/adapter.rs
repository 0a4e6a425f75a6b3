//! Printer device adapter
//!
//! Owns the connection state for a single printer: which device is selected,
//! whether permission is still pending, and the open connection with its
//! claimed interface, bulk-OUT endpoint and transfer worker.
//!
//! Operations never fail with an error; they log and return `false` (or an
//! empty list). Permission decisions and hot-plug notifications arrive on the
//! platform event channel and are applied before every operation, or
//! continuously by [`PrinterAdapter::spawn_event_pump`].

use crate::usb::host::{UsbConnection, UsbHost};
use crate::usb::transfers::{
    DEFAULT_QUEUE_DEPTH, DEFAULT_TRANSFER_TIMEOUT, TransferId, TransferOutcome, TransferTicket,
    TransferWorker,
};
use async_channel::{Receiver, Sender, bounded};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use common::{EventSink, EventStream, PlatformEvent, create_event_channel};
use protocol::DeviceDescriptor;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Capacity of the transfer outcome channel
const OUTCOME_CHANNEL_CAPACITY: usize = 256;

/// Interface index used for printing
const PRINTER_INTERFACE_INDEX: usize = 0;

/// Tunables for connections opened by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterSettings {
    /// Timeout applied to every bulk transfer
    pub transfer_timeout: Duration,
    /// Jobs that may wait behind the running transfer
    pub queue_depth: usize,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    DeviceSelected,
    PermissionPending,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::DeviceSelected => "device selected",
            ConnectionState::PermissionPending => "permission pending",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
enum Selection {
    #[default]
    None,
    /// Permission requested, decision not yet received
    Pending(DeviceDescriptor),
    Selected(DeviceDescriptor),
}

impl Selection {
    fn device_id(&self) -> Option<u32> {
        match self {
            Selection::None => None,
            Selection::Pending(d) | Selection::Selected(d) => Some(d.device_id),
        }
    }
}

/// Open connection, claimed interface and bulk-OUT endpoint, held together
struct ActiveConnection {
    device_id: u32,
    connection: Arc<dyn UsbConnection>,
    interface: u8,
    endpoint: u8,
    worker: TransferWorker,
}

#[derive(Default)]
struct AdapterState {
    host: Option<Arc<dyn UsbHost>>,
    selection: Selection,
    connection: Option<ActiveConnection>,
}

/// Printer device adapter
pub struct PrinterAdapter {
    settings: AdapterSettings,
    state: Mutex<AdapterState>,
    events_tx: EventSink,
    events: EventStream,
    outcomes_tx: Sender<TransferOutcome>,
    outcomes_rx: Receiver<TransferOutcome>,
    next_transfer_id: AtomicU64,
}

impl PrinterAdapter {
    /// Create an adapter with no host attached
    pub fn new(settings: AdapterSettings) -> Self {
        let (events_tx, events) = create_event_channel();
        let (outcomes_tx, outcomes_rx) = bounded(OUTCOME_CHANNEL_CAPACITY);

        Self {
            settings,
            state: Mutex::new(AdapterState::default()),
            events_tx,
            events,
            outcomes_tx,
            outcomes_rx,
            next_transfer_id: AtomicU64::new(1),
        }
    }

    /// Sink a host should publish its platform events to
    pub fn event_sink(&self) -> EventSink {
        self.events_tx.clone()
    }

    pub fn settings(&self) -> AdapterSettings {
        self.settings
    }

    /// Attach the adapter to a USB host
    ///
    /// Replacing an existing host drops the current selection and connection.
    pub fn init(&self, host: Arc<dyn UsbHost>) {
        let mut state = self.lock_state();
        if state.host.is_some() {
            debug!("Replacing USB host");
            Self::close_locked(&mut state);
            state.selection = Selection::None;
        }
        state.host = Some(host);
        info!("Printer adapter attached to USB host");
    }

    /// Detach from the host, closing any connection
    pub fn detach(&self) {
        let mut state = self.lock_state();
        Self::close_locked(&mut state);
        state.selection = Selection::None;
        if state.host.take().is_some() {
            info!("Printer adapter detached from USB host");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_state().host.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.process_pending_events();
        let state = self.lock_state();
        if state.connection.is_some() {
            return ConnectionState::Connected;
        }
        match state.selection {
            Selection::None => ConnectionState::Disconnected,
            Selection::Pending(_) => ConnectionState::PermissionPending,
            Selection::Selected(_) => ConnectionState::DeviceSelected,
        }
    }

    /// Current device, once permission is held
    pub fn selected_device(&self) -> Option<DeviceDescriptor> {
        self.process_pending_events();
        match &self.lock_state().selection {
            Selection::Selected(d) => Some(d.clone()),
            _ => None,
        }
    }

    /// Receiver of per-transfer outcome records
    pub fn transfer_outcomes(&self) -> Receiver<TransferOutcome> {
        self.outcomes_rx.clone()
    }

    /// Apply every queued platform event without blocking
    ///
    /// Returns the number of events applied.
    pub fn process_pending_events(&self) -> usize {
        let mut applied = 0;
        while let Some(event) = self.events.try_recv() {
            self.handle_event(event);
            applied += 1;
        }
        applied
    }

    /// Apply one platform event
    pub fn handle_event(&self, event: PlatformEvent) {
        let mut state = self.lock_state();
        Self::apply_event(&mut state, event);
    }

    /// Apply events on a background thread as they arrive
    ///
    /// The thread exits once the adapter is dropped.
    pub fn spawn_event_pump(self: &Arc<Self>) -> common::Result<JoinHandle<()>> {
        let adapter = Arc::downgrade(self);
        let events = self.events.clone();

        let handle = std::thread::Builder::new()
            .name("usb-event-pump".to_string())
            .spawn(move || {
                while let Ok(event) = events.recv_blocking() {
                    let Some(adapter) = adapter.upgrade() else {
                        break;
                    };
                    adapter.handle_event(event);
                }
                debug!("Event pump stopped");
            })?;

        Ok(handle)
    }

    /// Enumerate attached devices
    ///
    /// An unavailable host or a failed enumeration yields an empty list.
    pub fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.process_pending_events();
        let host = Self::host(&self.lock_state());

        match host.and_then(|host| host.devices()) {
            Ok(devices) => {
                debug!("Found {} USB devices", devices.len());
                devices
            }
            Err(e) => {
                warn!("Device listing failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Select the first device matching both ids
    ///
    /// Returns true when the device is selected or a permission request has
    /// been issued for it, false when no attached device matches.
    pub fn select_device(&self, vendor_id: u16, product_id: u16) -> bool {
        self.process_pending_events();
        let mut state = self.lock_state();

        if let Selection::Selected(current) = &state.selection
            && current.matches(vendor_id, product_id)
        {
            debug!("Device {:04x}:{:04x} already selected", vendor_id, product_id);
            return true;
        }

        let host = match Self::host(&state) {
            Ok(host) => host,
            Err(e) => {
                warn!("Cannot select {:04x}:{:04x}: {}", vendor_id, product_id, e);
                return false;
            }
        };

        let devices = match host.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Device enumeration failed: {}", e);
                return false;
            }
        };

        let Some(device) = devices
            .into_iter()
            .find(|d| d.matches(vendor_id, product_id))
        else {
            info!("No device matches {:04x}:{:04x}", vendor_id, product_id);
            return false;
        };

        Self::close_locked(&mut state);

        if host.has_permission(&device) {
            info!("Selected {}", device);
            state.selection = Selection::Selected(device);
            return true;
        }

        match host.request_permission(&device) {
            Ok(()) => {
                info!("Requested permission for {}", device);
                state.selection = Selection::Pending(device);
                true
            }
            Err(e) => {
                warn!("Permission request for {} failed: {}", device, e);
                state.selection = Selection::None;
                false
            }
        }
    }

    /// Open the selected device and claim its printer interface
    pub fn open_connection(&self) -> bool {
        self.process_pending_events();
        let mut state = self.lock_state();
        self.open_locked(&mut state)
    }

    /// Release the interface and close the connection, if one is open
    pub fn close_connection_if_exists(&self) {
        self.process_pending_events();
        let mut state = self.lock_state();
        Self::close_locked(&mut state);
    }

    /// Queue a payload on the open connection, opening it first if needed
    pub fn dispatch(&self, payload: Vec<u8>) -> Option<TransferTicket> {
        self.process_pending_events();
        let mut state = self.lock_state();
        if !self.open_locked(&mut state) {
            return None;
        }
        let active = state.connection.as_ref()?;

        let id = TransferId(self.next_transfer_id.fetch_add(1, Ordering::SeqCst));
        let len = payload.len();
        match active.worker.submit(id, payload) {
            Ok(ticket) => {
                debug!("Transfer {:?} queued ({} bytes)", id, len);
                Some(ticket)
            }
            Err(e) => {
                warn!("Transfer of {} bytes not queued: {}", len, e);
                None
            }
        }
    }

    /// Print UTF-8 text
    pub fn print_text(&self, text: &str) -> bool {
        self.dispatch(text.as_bytes().to_vec()).is_some()
    }

    /// Print a base64-encoded raw payload
    pub fn print_raw_data(&self, base64: &str) -> bool {
        match decode_base64(base64) {
            Ok(payload) => self.dispatch(payload).is_some(),
            Err(e) => {
                warn!("Raw print data rejected: {}", e);
                false
            }
        }
    }

    /// Write raw bytes
    pub fn write(&self, bytes: &[u8]) -> bool {
        self.dispatch(bytes.to_vec()).is_some()
    }

    fn lock_state(&self) -> MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn host(state: &AdapterState) -> common::Result<Arc<dyn UsbHost>> {
        state.host.clone().ok_or(common::Error::HostUnavailable)
    }

    fn open_locked(&self, state: &mut AdapterState) -> bool {
        if state.connection.is_some() {
            return true;
        }

        let device = match &state.selection {
            Selection::Selected(device) => device.clone(),
            Selection::Pending(device) => {
                info!("Permission for {} still pending", device);
                return false;
            }
            Selection::None => {
                warn!("No printer selected");
                return false;
            }
        };

        match Self::host(state).and_then(|host| self.connect(host.as_ref(), &device)) {
            Ok(active) => {
                state.connection = Some(active);
                true
            }
            Err(e) => {
                warn!("Failed to open {}: {}", device, e);
                false
            }
        }
    }

    fn connect(
        &self,
        host: &dyn UsbHost,
        device: &DeviceDescriptor,
    ) -> common::Result<ActiveConnection> {
        let interface = host.interface(device, PRINTER_INTERFACE_INDEX)?;
        let endpoint = interface.first_bulk_out().ok_or_else(|| {
            common::Error::Usb(format!("interface {} has no bulk OUT endpoint", interface.number))
        })?;

        let connection = host.open(device)?;
        if let Err(e) = connection.claim_interface(interface.number, true) {
            connection.close();
            return Err(e);
        }

        let worker = match TransferWorker::spawn(
            connection.clone(),
            endpoint.address,
            self.settings.transfer_timeout,
            self.settings.queue_depth,
            self.outcomes_tx.clone(),
        ) {
            Ok(worker) => worker,
            Err(e) => {
                if let Err(release) = connection.release_interface(interface.number) {
                    warn!("Failed to release interface {}: {}", interface.number, release);
                }
                connection.close();
                return Err(e);
            }
        };

        info!(
            "Connected to {} (interface {}, endpoint {:#04x})",
            device, interface.number, endpoint.address
        );

        Ok(ActiveConnection {
            device_id: device.device_id,
            connection,
            interface: interface.number,
            endpoint: endpoint.address,
            worker,
        })
    }

    fn close_locked(state: &mut AdapterState) {
        let Some(active) = state.connection.take() else {
            return;
        };

        let pending = active.worker.pending();
        if pending > 0 {
            warn!("Closing connection with {} queued transfers", pending);
        }
        active.worker.shutdown();

        if let Err(e) = active.connection.release_interface(active.interface) {
            warn!("Failed to release interface {}: {}", active.interface, e);
        }
        active.connection.close();
        info!(
            "Connection to device {} closed (endpoint {:#04x})",
            active.device_id, active.endpoint
        );
    }

    fn apply_event(state: &mut AdapterState, event: PlatformEvent) {
        match event {
            PlatformEvent::PermissionResult {
                device: Some(device),
                granted: true,
            } => {
                if state
                    .connection
                    .as_ref()
                    .is_some_and(|c| c.device_id != device.device_id)
                {
                    Self::close_locked(state);
                }
                info!("Permission granted for {}", device);
                state.selection = Selection::Selected(device);
            }
            PlatformEvent::PermissionResult {
                device: None,
                granted: true,
            } => {
                warn!("Permission granted for an unknown device, ignoring");
            }
            PlatformEvent::PermissionResult {
                device,
                granted: false,
            } => {
                let denied_id = device.as_ref().map(|d| d.device_id);
                let current = denied_id.is_none() || denied_id == state.selection.device_id();
                if current {
                    info!("Permission denied, clearing selection");
                    Self::close_locked(state);
                    state.selection = Selection::None;
                } else {
                    debug!("Permission denied for a device that is not selected");
                }
            }
            PlatformEvent::DeviceAttached { device } => {
                info!("Device attached: {}", device);
            }
            PlatformEvent::DeviceDetached { device_id } => {
                let selected = state.selection.device_id() == Some(device_id);
                let connected = state
                    .connection
                    .as_ref()
                    .is_some_and(|c| c.device_id == device_id);
                if selected || connected {
                    if connected {
                        error!("Printer {} detached while connected", device_id);
                    } else {
                        info!("Selected printer {} detached", device_id);
                    }
                    Self::close_locked(state);
                    state.selection = Selection::None;
                } else {
                    debug!("Device {} detached", device_id);
                }
            }
        }
    }
}

impl Default for PrinterAdapter {
    fn default() -> Self {
        Self::new(AdapterSettings::default())
    }
}

impl Drop for PrinterAdapter {
    fn drop(&mut self) {
        let mut state = self.lock_state();
        Self::close_locked(&mut state);
        drop(state);
        self.events.close();
    }
}

/// Decode standard padded base64, ignoring ASCII whitespace
pub fn decode_base64(data: &str) -> common::Result<Vec<u8>> {
    let compact: String = data
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(compact)
        .map_err(|e| common::Error::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::simulated::SimulatedHost;
    use common::test_utils::create_mock_printer;

    fn adapter_with_printer(id: u32) -> (PrinterAdapter, Arc<SimulatedHost>) {
        let adapter = PrinterAdapter::default();
        let host = Arc::new(SimulatedHost::new(adapter.event_sink()));
        host.add_printer(create_mock_printer(id));
        adapter.init(host.clone());
        (adapter, host)
    }

    #[test]
    fn test_uninitialized_adapter() {
        let adapter = PrinterAdapter::default();
        assert!(!adapter.is_initialized());
        assert!(adapter.list_devices().is_empty());
        assert!(!adapter.select_device(0x0483, 0x5743));
        assert!(!adapter.open_connection());
        assert!(!adapter.print_text("hello"));
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_decode_base64_ignores_whitespace() {
        assert_eq!(decode_base64("G0A=\n").unwrap(), vec![0x1B, 0x40]);
        assert_eq!(decode_base64(" SGVs\r\nbG8= ").unwrap(), b"Hello".to_vec());
        assert!(decode_base64("not base64!").is_err());
        assert!(decode_base64("").unwrap().is_empty());
    }

    #[test]
    fn test_select_with_permission() {
        let (adapter, host) = adapter_with_printer(1);
        let printer = create_mock_printer(1);
        host.set_permitted(1, true);

        assert!(adapter.select_device(printer.vendor_id, printer.product_id));
        assert_eq!(adapter.state(), ConnectionState::DeviceSelected);
        assert_eq!(adapter.selected_device(), Some(printer));
        assert!(host.permission_requests().is_empty());
    }

    #[test]
    fn test_detach_clears_everything() {
        let (adapter, host) = adapter_with_printer(1);
        let printer = create_mock_printer(1);
        host.set_permitted(1, true);

        assert!(adapter.select_device(printer.vendor_id, printer.product_id));
        assert!(adapter.open_connection());
        adapter.detach();

        assert!(!adapter.is_initialized());
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
        assert_eq!(host.release_count(), 1);
        assert_eq!(host.close_count(), 1);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::PermissionPending.to_string(), "permission pending");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }
}
