//! USB host abstraction
//!
//! The device adapter talks to the operating system's USB manager through
//! these traits. `RusbHost` backs them with libusb; `SimulatedHost` keeps
//! everything in memory for dry runs and tests.

use common::Result;
use protocol::DeviceDescriptor;
use std::sync::Arc;
use std::time::Duration;

/// Endpoint transfer direction (relative to the host)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint descriptor of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint address including the direction bit
    pub address: u8,
    pub direction: Direction,
    pub kind: TransferKind,
}

impl EndpointInfo {
    pub fn bulk_out(number: u8) -> Self {
        Self {
            address: number & 0x0F,
            direction: Direction::Out,
            kind: TransferKind::Bulk,
        }
    }

    pub fn bulk_in(number: u8) -> Self {
        Self {
            address: 0x80 | (number & 0x0F),
            direction: Direction::In,
            kind: TransferKind::Bulk,
        }
    }

    pub fn is_bulk_out(&self) -> bool {
        self.kind == TransferKind::Bulk && self.direction == Direction::Out
    }
}

/// Interface descriptor (alternate setting 0)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// bInterfaceNumber, used when claiming
    pub number: u8,
    pub endpoints: Vec<EndpointInfo>,
}

impl InterfaceInfo {
    /// First bulk-OUT endpoint in descriptor order
    pub fn first_bulk_out(&self) -> Option<EndpointInfo> {
        self.endpoints.iter().copied().find(EndpointInfo::is_bulk_out)
    }
}

/// The operating system's USB manager
///
/// Permission requests complete asynchronously: `request_permission` only
/// starts the request, the decision arrives later as a
/// [`common::PlatformEvent::PermissionResult`] on the host's event sink.
pub trait UsbHost: Send + Sync {
    /// Enumerate attached devices
    fn devices(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Whether this process may already open the device
    fn has_permission(&self, device: &DeviceDescriptor) -> bool;

    /// Start an asynchronous permission request for the device
    fn request_permission(&self, device: &DeviceDescriptor) -> Result<()>;

    /// Descriptor of the interface at `index` in the active configuration
    fn interface(&self, device: &DeviceDescriptor, index: usize) -> Result<InterfaceInfo>;

    /// Open a connection to the device
    fn open(&self, device: &DeviceDescriptor) -> Result<Arc<dyn UsbConnection>>;
}

/// An open device connection
pub trait UsbConnection: Send + Sync {
    /// Claim an interface; `force` detaches any kernel driver bound to it
    fn claim_interface(&self, interface: u8, force: bool) -> Result<()>;

    /// Release a previously claimed interface
    fn release_interface(&self, interface: u8) -> Result<()>;

    /// Blocking bulk write; returns the number of bytes written
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Close the connection; later writes fail
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_direction_bits() {
        assert_eq!(EndpointInfo::bulk_out(2).address, 0x02);
        assert_eq!(EndpointInfo::bulk_in(1).address, 0x81);
        assert!(EndpointInfo::bulk_out(1).is_bulk_out());
        assert!(!EndpointInfo::bulk_in(1).is_bulk_out());
    }

    #[test]
    fn test_first_bulk_out_skips_other_endpoints() {
        let interface = InterfaceInfo {
            number: 0,
            endpoints: vec![
                EndpointInfo::bulk_in(1),
                EndpointInfo {
                    address: 0x03,
                    direction: Direction::Out,
                    kind: TransferKind::Interrupt,
                },
                EndpointInfo::bulk_out(2),
                EndpointInfo::bulk_out(4),
            ],
        };

        assert_eq!(interface.first_bulk_out(), Some(EndpointInfo::bulk_out(2)));
    }

    #[test]
    fn test_no_bulk_out() {
        let interface = InterfaceInfo {
            number: 0,
            endpoints: vec![EndpointInfo::bulk_in(1)],
        };
        assert!(interface.first_bulk_out().is_none());
    }
}
