//! USB subsystem
//!
//! Device enumeration, permission handling, and bulk-OUT printing.
//!
//! - [`host`]: traits standing in for the operating system's USB manager
//! - [`rusb_host`]: libusb-backed host with hot-plug support
//! - [`simulated`]: in-memory host for dry runs and tests
//! - [`transfers`]: per-connection transfer worker
//! - [`adapter`]: the printer connection state machine
//!
//! Bulk transfers block, so they run on a dedicated thread per connection and
//! never on the Tokio runtime.

pub mod adapter;
pub mod host;
pub mod rusb_host;
pub mod simulated;
pub mod transfers;

pub use adapter::{AdapterSettings, ConnectionState, PrinterAdapter, decode_base64};
pub use host::{Direction, EndpointInfo, InterfaceInfo, TransferKind, UsbConnection, UsbHost};
pub use rusb_host::RusbHost;
pub use simulated::{BulkWrite, PermissionPolicy, SimulatedHost};
pub use transfers::{
    CancelToken, DEFAULT_QUEUE_DEPTH, DEFAULT_TRANSFER_TIMEOUT, TransferId, TransferOutcome,
    TransferStatus, TransferTicket,
};
