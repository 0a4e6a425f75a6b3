//! In-memory USB host
//!
//! Keeps a scripted set of devices and records every claim, release and bulk
//! write. Used for `--simulate` dry runs and by the test suites. Permission
//! requests are answered according to a [`PermissionPolicy`], or left pending
//! until [`SimulatedHost::grant`] / [`SimulatedHost::deny`] is called.

use crate::usb::host::{EndpointInfo, InterfaceInfo, UsbConnection, UsbHost};
use common::{EventSink, PlatformEvent};
use protocol::DeviceDescriptor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// How permission requests are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionPolicy {
    /// Leave requests pending until `grant`/`deny` is called
    #[default]
    Manual,
    /// Grant every request immediately
    AutoGrant,
    /// Deny every request immediately
    AutoDeny,
}

/// A bulk write that reached a simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWrite {
    pub device_id: u32,
    pub endpoint: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct SimDevice {
    descriptor: DeviceDescriptor,
    interfaces: Vec<InterfaceInfo>,
    permitted: bool,
}

#[derive(Debug, Default)]
struct SimState {
    devices: Vec<SimDevice>,
    policy: PermissionPolicy,
    permission_requests: Vec<u32>,
    opens: usize,
    claims: usize,
    releases: usize,
    closes: usize,
    writes: Vec<BulkWrite>,
    fail_enumeration: bool,
    fail_open: bool,
    fail_claim: bool,
    fail_transfers: bool,
    transfer_delay: Option<Duration>,
}

/// Scriptable in-memory USB host
pub struct SimulatedHost {
    events: EventSink,
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl SimulatedHost {
    pub fn new(events: EventSink) -> Self {
        Self {
            events,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Add a device with explicit interfaces
    pub fn add_device(&self, descriptor: DeviceDescriptor, interfaces: Vec<InterfaceInfo>) {
        debug!("Simulated device added: {}", descriptor);
        lock(&self.state).devices.push(SimDevice {
            descriptor,
            interfaces,
            permitted: false,
        });
    }

    /// Add a printer exposing interface 0 with bulk IN 0x81 and bulk OUT 0x02
    pub fn add_printer(&self, descriptor: DeviceDescriptor) {
        self.add_device(
            descriptor,
            vec![InterfaceInfo {
                number: 0,
                endpoints: vec![EndpointInfo::bulk_in(1), EndpointInfo::bulk_out(2)],
            }],
        );
    }

    /// Hot-plug a printer and announce it
    pub fn plug(&self, descriptor: DeviceDescriptor) {
        self.add_printer(descriptor.clone());
        self.emit(PlatformEvent::DeviceAttached { device: descriptor });
    }

    /// Remove a device and announce the detach
    pub fn unplug(&self, device_id: u32) {
        lock(&self.state)
            .devices
            .retain(|d| d.descriptor.device_id != device_id);
        self.emit(PlatformEvent::DeviceDetached { device_id });
    }

    pub fn set_permission_policy(&self, policy: PermissionPolicy) {
        lock(&self.state).policy = policy;
    }

    /// Mark a device as already accessible (no request needed)
    pub fn set_permitted(&self, device_id: u32, permitted: bool) {
        if let Some(device) = lock(&self.state)
            .devices
            .iter_mut()
            .find(|d| d.descriptor.device_id == device_id)
        {
            device.permitted = permitted;
        }
    }

    /// Answer a pending request positively
    pub fn grant(&self, device_id: u32) {
        self.set_permitted(device_id, true);
        let device = self.descriptor(device_id);
        self.emit(PlatformEvent::PermissionResult {
            device,
            granted: true,
        });
    }

    /// Answer a pending request negatively
    pub fn deny(&self, device_id: u32) {
        self.set_permitted(device_id, false);
        let device = self.descriptor(device_id);
        self.emit(PlatformEvent::PermissionResult {
            device,
            granted: false,
        });
    }

    pub fn fail_enumeration(&self, fail: bool) {
        lock(&self.state).fail_enumeration = fail;
    }

    pub fn fail_open(&self, fail: bool) {
        lock(&self.state).fail_open = fail;
    }

    pub fn fail_claim(&self, fail: bool) {
        lock(&self.state).fail_claim = fail;
    }

    pub fn fail_transfers(&self, fail: bool) {
        lock(&self.state).fail_transfers = fail;
    }

    /// Make every bulk write take at least `delay`
    pub fn set_transfer_delay(&self, delay: Option<Duration>) {
        lock(&self.state).transfer_delay = delay;
    }

    /// Device ids for which permission was requested, in order
    pub fn permission_requests(&self) -> Vec<u32> {
        lock(&self.state).permission_requests.clone()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn claim_count(&self) -> usize {
        lock(&self.state).claims
    }

    pub fn release_count(&self) -> usize {
        lock(&self.state).releases
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }

    /// All bulk writes so far
    pub fn writes(&self) -> Vec<BulkWrite> {
        lock(&self.state).writes.clone()
    }

    fn descriptor(&self, device_id: u32) -> Option<DeviceDescriptor> {
        lock(&self.state)
            .devices
            .iter()
            .find(|d| d.descriptor.device_id == device_id)
            .map(|d| d.descriptor.clone())
    }

    fn emit(&self, event: PlatformEvent) {
        if let Err(e) = self.events.send(event) {
            debug!("Simulated event dropped: {}", e);
        }
    }
}

impl UsbHost for SimulatedHost {
    fn devices(&self) -> common::Result<Vec<DeviceDescriptor>> {
        let state = lock(&self.state);
        if state.fail_enumeration {
            return Err(common::Error::Usb("enumeration failed".to_string()));
        }
        Ok(state.devices.iter().map(|d| d.descriptor.clone()).collect())
    }

    fn has_permission(&self, device: &DeviceDescriptor) -> bool {
        lock(&self.state)
            .devices
            .iter()
            .any(|d| d.descriptor.device_id == device.device_id && d.permitted)
    }

    fn request_permission(&self, device: &DeviceDescriptor) -> common::Result<()> {
        let policy = {
            let mut state = lock(&self.state);
            state.permission_requests.push(device.device_id);
            state.policy
        };

        match policy {
            PermissionPolicy::Manual => {}
            PermissionPolicy::AutoGrant => self.grant(device.device_id),
            PermissionPolicy::AutoDeny => self.deny(device.device_id),
        }
        Ok(())
    }

    fn interface(&self, device: &DeviceDescriptor, index: usize) -> common::Result<InterfaceInfo> {
        lock(&self.state)
            .devices
            .iter()
            .find(|d| d.descriptor.device_id == device.device_id)
            .ok_or_else(|| common::Error::Usb(format!("device {} not found", device)))?
            .interfaces
            .get(index)
            .cloned()
            .ok_or_else(|| common::Error::Usb(format!("device has no interface {}", index)))
    }

    fn open(&self, device: &DeviceDescriptor) -> common::Result<Arc<dyn UsbConnection>> {
        let mut state = lock(&self.state);
        if state.fail_open {
            return Err(common::Error::Usb("Access denied (insufficient permissions)".to_string()));
        }
        if !state
            .devices
            .iter()
            .any(|d| d.descriptor.device_id == device.device_id)
        {
            return Err(common::Error::Usb("No such device".to_string()));
        }
        state.opens += 1;

        Ok(Arc::new(SimulatedConnection {
            device_id: device.device_id,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct SimulatedConnection {
    device_id: u32,
    state: Arc<Mutex<SimState>>,
    closed: AtomicBool,
}

impl UsbConnection for SimulatedConnection {
    fn claim_interface(&self, _interface: u8, _force: bool) -> common::Result<()> {
        let mut state = lock(&self.state);
        if state.fail_claim {
            return Err(common::Error::Usb("Resource busy".to_string()));
        }
        state.claims += 1;
        Ok(())
    }

    fn release_interface(&self, _interface: u8) -> common::Result<()> {
        lock(&self.state).releases += 1;
        Ok(())
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> common::Result<usize> {
        let delay = lock(&self.state).transfer_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(common::Error::Usb("connection closed".to_string()));
        }

        let mut state = lock(&self.state);
        if state.fail_transfers {
            return Err(common::Error::Usb("Pipe error".to_string()));
        }
        state.writes.push(BulkWrite {
            device_id: self.device_id,
            endpoint,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            lock(&self.state).closes += 1;
        }
    }
}
