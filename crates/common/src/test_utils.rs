//! Test utilities for escpos-usb
//!
//! Provides descriptor builders and timing helpers shared by the test suites
//! of the workspace crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_descriptor;
//!
//! let device = create_mock_descriptor(1, 0x0483, 0x5743);
//! assert_eq!(device.vendor_id, 0x0483);
//! assert_eq!(device.name, "/dev/bus/usb/001/001");
//! ```

use protocol::DeviceDescriptor;
use std::future::Future;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor/product pair of a common 58mm POS thermal printer
pub const POS58_VENDOR_ID: u16 = 0x0483;
pub const POS58_PRODUCT_ID: u16 = 0x5743;

/// Create a mock DeviceDescriptor for testing
///
/// The device name follows the Linux device node layout, with the id used as
/// the device address on bus 1.
pub fn create_mock_descriptor(device_id: u32, vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        device_id,
        vendor_id,
        product_id,
        name: format!("/dev/bus/usb/001/{:03}", device_id),
        manufacturer: Some(format!("Test Manufacturer {}", device_id)),
        product: Some(format!("Test Printer {}", device_id)),
    }
}

/// Create the descriptor of the POS-58 printer used throughout the tests
pub fn create_mock_printer(device_id: u32) -> DeviceDescriptor {
    create_mock_descriptor(device_id, POS58_VENDOR_ID, POS58_PRODUCT_ID)
}

/// Create a list of mock descriptors with distinct product ids
pub fn create_mock_descriptor_list(count: u32) -> Vec<DeviceDescriptor> {
    (1..=count)
        .map(|i| create_mock_descriptor(i, 0x1000 + i as u16, 0x2000 + i as u16))
        .collect()
}

/// A short ESC/POS job: initialise, one line of text, partial cut
pub fn create_mock_print_job(text: &str) -> Vec<u8> {
    let mut job = vec![0x1B, 0x40];
    job.extend_from_slice(text.as_bytes());
    job.push(b'\n');
    job.extend_from_slice(&[0x1D, 0x56, 0x01]);
    job
}

/// Run an async operation with a timeout
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Poll `condition` until it holds or `timeout` elapses
///
/// Returns whether the condition was met.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
