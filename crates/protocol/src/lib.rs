//! Bridge protocol for escpos-usb
//!
//! This crate defines the values exchanged between a host application and the
//! printer bridge: device descriptors, method calls, and method responses.
//! It also provides the versioned message envelope and the postcard codec used
//! when the bridge is driven over a byte stream.
//!
//! # Example
//!
//! ```
//! use protocol::{CallId, Message, MessagePayload, MethodCall, CURRENT_VERSION};
//! use protocol::{decode_framed, encode_framed};
//!
//! let msg = Message {
//!     version: CURRENT_VERSION,
//!     payload: MessagePayload::Call {
//!         id: CallId(1),
//!         call: MethodCall::new("getUSBDeviceList"),
//!     },
//! };
//!
//! let framed = encode_framed(&msg).unwrap();
//! let decoded = decode_framed(&framed).unwrap();
//! assert_eq!(decoded.version, CURRENT_VERSION);
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;
pub mod version;

pub use codec::{
    MAX_FRAME_SIZE, decode_framed, decode_message, encode_framed, encode_message, read_framed,
    validate_version, write_framed,
};

#[cfg(feature = "async")]
pub use codec::{read_framed_async, write_framed_async};
pub use error::{ProtocolError, Result};
pub use messages::{CallId, Message, MessagePayload};
pub use types::{DeviceDescriptor, MethodCall, MethodResponse, Value};
pub use version::{CURRENT_VERSION, ProtocolVersion};
