//! Bridge type definitions
//!
//! This module defines the values that cross the bridge between the host
//! application and the printer adapter: USB device descriptors, dynamically
//! typed argument values, method calls and their responses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot of a USB device as seen during enumeration
///
/// Descriptors are immutable copies; they are re-fetched on every selection
/// request and never cached across calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Host-assigned device identifier, stable while the device stays plugged in
    pub device_id: u32,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Host device name (e.g. `/dev/bus/usb/001/004`)
    pub name: String,
    /// Manufacturer string (if readable)
    pub manufacturer: Option<String>,
    /// Product string (if readable)
    pub product: Option<String>,
}

impl DeviceDescriptor {
    /// Whether this descriptor carries the given vendor/product pair
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

impl std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} ({}, id {})",
            self.vendor_id, self.product_id, self.name, self.device_id
        )
    }
}

/// Dynamically typed value carried by method arguments and results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Short type name used in argument error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// A named remote call with keyed arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    /// Operation name (e.g. `connectPrinter`)
    pub method: String,
    /// Named arguments
    pub arguments: BTreeMap<String, Value>,
}

impl MethodCall {
    /// Create a call without arguments
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            arguments: BTreeMap::new(),
        }
    }

    /// Add an argument, builder style
    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    /// Look up an argument by name
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }
}

/// Result of a method call as seen by the host application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MethodResponse {
    /// The call was handled and produced a value
    Success(Value),
    /// The call could not be handled (e.g. malformed arguments)
    Error {
        code: String,
        message: String,
        details: Option<String>,
    },
    /// No handler exists for the method name
    NotImplemented,
}

impl MethodResponse {
    pub fn success(value: impl Into<Value>) -> Self {
        MethodResponse::Success(value.into())
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        MethodResponse::Error {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, MethodResponse::Success(_))
    }

    /// The success value, if any
    pub fn value(&self) -> Option<&Value> {
        match self {
            MethodResponse::Success(v) => Some(v),
            _ => None,
        }
    }
}
