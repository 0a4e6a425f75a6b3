//! Common utilities for escpos-usb
//!
//! This crate provides functionality shared by the printer library and its
//! binary: the error type, logging setup, and the platform event channel that
//! carries asynchronous USB notifications (permission results, hot-plug) from
//! a USB host to the device adapter.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{EventSink, EventStream, PlatformEvent, create_event_channel};
pub use error::{Error, Result};
pub use logging::setup_logging;
