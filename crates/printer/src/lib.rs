//! escpos-usb printer bridge
//!
//! Drives an ESC/POS thermal receipt printer over a USB bulk-OUT endpoint.
//!
//! # Architecture
//!
//! - [`usb::PrinterAdapter`] owns the connection state: device selection,
//!   asynchronous permission handling, interface claiming and the
//!   per-connection transfer worker.
//! - [`bridge::BridgeHandler`] maps named calls (`connectPrinter`,
//!   `printText`, ...) onto the adapter.
//! - [`serve::serve`] answers framed calls over a byte stream.
//! - [`config::PrinterConfig`] holds the TOML configuration.
//!
//! # Example
//!
//! ```no_run
//! use printer::usb::{PrinterAdapter, RusbHost};
//! use std::sync::Arc;
//!
//! let adapter = Arc::new(PrinterAdapter::default());
//! let host = RusbHost::new(adapter.event_sink())?;
//! adapter.init(Arc::new(host));
//!
//! if adapter.select_device(0x0483, 0x5743) {
//!     adapter.print_text("Hello\n");
//! }
//! # Ok::<(), common::Error>(())
//! ```

pub mod bridge;
pub mod config;
pub mod serve;
pub mod usb;

pub use bridge::BridgeHandler;
pub use config::PrinterConfig;
pub use usb::{ConnectionState, PrinterAdapter};
