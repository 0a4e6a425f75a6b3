//! Protocol message definitions
//!
//! The bridge exchanges two kinds of messages: a host issues a `Call`, the
//! printer side answers with a `Reply` carrying the same call id.

use crate::types::{MethodCall, MethodResponse};
use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};

/// Identifier pairing a reply with its call
///
/// Chosen by the caller; the bridge echoes it back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub u64);

/// Top-level message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version of this message
    pub version: ProtocolVersion,
    /// Message payload
    pub payload: MessagePayload,
}

/// All message types in the protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessagePayload {
    /// Invoke a named bridge operation
    Call { id: CallId, call: MethodCall },

    /// Answer to a previous `Call`
    Reply {
        id: CallId,
        response: MethodResponse,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CURRENT_VERSION, Value};

    #[test]
    fn test_call_id_copy() {
        let a = CallId(7);
        let b = a;
        assert_eq!(a, b);
    }

    #[test]
    fn test_reply_carries_response() {
        let msg = Message {
            version: CURRENT_VERSION,
            payload: MessagePayload::Reply {
                id: CallId(3),
                response: MethodResponse::Success(Value::Bool(true)),
            },
        };

        match msg.payload {
            MessagePayload::Reply { id, response } => {
                assert_eq!(id, CallId(3));
                assert!(response.is_success());
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
