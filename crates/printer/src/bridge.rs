//! Bridge handler
//!
//! Maps named method calls from the host application onto the printer
//! adapter. The handler keeps no state of its own; device lists are
//! marshalled into maps of strings and every print call answers `true` once
//! the request has been handed to the adapter.

use crate::usb::PrinterAdapter;
use protocol::{DeviceDescriptor, MethodCall, MethodResponse, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const METHOD_GET_DEVICE_LIST: &str = "getUSBDeviceList";
pub const METHOD_CONNECT_PRINTER: &str = "connectPrinter";
pub const METHOD_CLOSE_CONN: &str = "closeConn";
pub const METHOD_PRINT_TEXT: &str = "printText";
pub const METHOD_PRINT_RAW_DATA: &str = "printRawData";
pub const METHOD_WRITE: &str = "write";

/// Error code returned for malformed arguments
pub const INVALID_ARGUMENTS: &str = "INVALID_ARGUMENTS";

/// Argument validation failure
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("Missing {0} argument")]
    Missing(&'static str),

    #[error("Argument {name} must be {expected}, got {actual}")]
    WrongType {
        name: &'static str,
        expected: &'static str,
        actual: &'static str,
    },
}

type CallResult = std::result::Result<MethodResponse, ArgumentError>;

/// Dispatches bridge calls to an adapter
#[derive(Clone)]
pub struct BridgeHandler {
    adapter: Arc<PrinterAdapter>,
}

impl BridgeHandler {
    pub fn new(adapter: Arc<PrinterAdapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &Arc<PrinterAdapter> {
        &self.adapter
    }

    /// Handle one call
    ///
    /// Unknown methods answer `NotImplemented`; malformed arguments answer an
    /// `INVALID_ARGUMENTS` error. Adapter failures surface only as `false`.
    pub fn handle(&self, call: &MethodCall) -> MethodResponse {
        debug!("Bridge call: {}", call.method);

        let result = match call.method.as_str() {
            METHOD_GET_DEVICE_LIST => Ok(self.device_list()),
            METHOD_CONNECT_PRINTER => self.connect_printer(call),
            METHOD_CLOSE_CONN => {
                self.adapter.close_connection_if_exists();
                Ok(MethodResponse::success(true))
            }
            METHOD_PRINT_TEXT => self.print_text(call),
            METHOD_PRINT_RAW_DATA => self.print_raw_data(call),
            METHOD_WRITE => self.write(call),
            other => {
                debug!("No handler for method {}", other);
                Ok(MethodResponse::NotImplemented)
            }
        };

        result.unwrap_or_else(|e| {
            warn!("Rejected {} call: {}", call.method, e);
            MethodResponse::error(INVALID_ARGUMENTS, e.to_string())
        })
    }

    fn device_list(&self) -> MethodResponse {
        let devices = self
            .adapter
            .list_devices()
            .iter()
            .map(device_record)
            .collect();
        MethodResponse::Success(Value::List(devices))
    }

    fn connect_printer(&self, call: &MethodCall) -> CallResult {
        let vendor = int_argument(call, "vendor")?;
        let product = int_argument(call, "product")?;

        let (Ok(vendor_id), Ok(product_id)) = (u16::try_from(vendor), u16::try_from(product))
        else {
            warn!("Vendor/product id out of range: {}/{}", vendor, product);
            return Ok(MethodResponse::success(false));
        };

        Ok(MethodResponse::success(
            self.adapter.select_device(vendor_id, product_id),
        ))
    }

    fn print_text(&self, call: &MethodCall) -> CallResult {
        let text = string_argument(call, "text")?;
        self.adapter.print_text(text);
        Ok(MethodResponse::success(true))
    }

    fn print_raw_data(&self, call: &MethodCall) -> CallResult {
        let raw = string_argument(call, "raw")?;
        self.adapter.print_raw_data(raw);
        Ok(MethodResponse::success(true))
    }

    fn write(&self, call: &MethodCall) -> CallResult {
        let data = required(call, "data")?;
        let bytes = data.as_bytes().ok_or(ArgumentError::WrongType {
            name: "data",
            expected: "bytes",
            actual: data.type_name(),
        })?;
        self.adapter.write(bytes);
        Ok(MethodResponse::success(true))
    }
}

/// Marshal a descriptor into the record returned by `getUSBDeviceList`
///
/// Ids are rendered as decimal strings; unreadable strings become null.
pub fn device_record(device: &DeviceDescriptor) -> Value {
    let optional = |s: &Option<String>| s.clone().map(Value::String).unwrap_or(Value::Null);

    let mut record = BTreeMap::new();
    record.insert("name".to_string(), Value::String(device.name.clone()));
    record.insert("manufacturer".to_string(), optional(&device.manufacturer));
    record.insert("product".to_string(), optional(&device.product));
    record.insert("deviceid".to_string(), Value::String(device.device_id.to_string()));
    record.insert("vendorid".to_string(), Value::String(device.vendor_id.to_string()));
    record.insert("productid".to_string(), Value::String(device.product_id.to_string()));
    Value::Map(record)
}

fn required<'a>(call: &'a MethodCall, name: &'static str) -> Result<&'a Value, ArgumentError> {
    call.argument(name).ok_or(ArgumentError::Missing(name))
}

fn int_argument(call: &MethodCall, name: &'static str) -> Result<i64, ArgumentError> {
    let value = required(call, name)?;
    value.as_i64().ok_or(ArgumentError::WrongType {
        name,
        expected: "int",
        actual: value.type_name(),
    })
}

fn string_argument<'a>(call: &'a MethodCall, name: &'static str) -> Result<&'a str, ArgumentError> {
    let value = required(call, name)?;
    value.as_str().ok_or(ArgumentError::WrongType {
        name,
        expected: "string",
        actual: value.type_name(),
    })
}
