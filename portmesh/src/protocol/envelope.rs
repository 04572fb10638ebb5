//! Control frames and endpoint envelopes.
//!
//! Two vocabularies cross process boundaries:
//!
//! - [`ControlFrame`]: the coordinator-link channel set: registration,
//!   directory pushes, and endpoint brokering. A transferred endpoint rides
//!   alongside a `PortMessage` in the transport packet, never inside the
//!   serialized frame.
//! - [`Envelope`]: endpoint-level traffic, plain named messages and the
//!   two halves of a call. Inbound envelopes are validated into these closed
//!   variants once, at the receive boundary, then dispatched through the
//!   client's name-keyed tables.

use crate::error::MeshError;
use crate::protocol::{PeerIdentity, PeerKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coordinator-link control vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlFrame {
    /// Peer → coordinator: announce this peer and request directory
    /// membership.
    Register {
        /// The stable identifier the peer wants to be known by.
        identifier: Option<String>,
    },

    /// Coordinator → peer: full directory replacement.
    ///
    /// Always the complete snapshot; peers never receive partial diffs.
    MapUpdate {
        /// The authoritative ordered directory.
        map: Vec<PeerIdentity>,
    },

    /// Coordinator → peer: a freshly brokered endpoint, attributed to the
    /// peer on its far side. The endpoint itself travels in the packet.
    PortMessage {
        /// The peer reachable through the transferred endpoint.
        sender: PeerIdentity,
    },

    /// Peer → coordinator: request an endpoint to the named peer.
    PortRequest {
        /// The peer to broker towards.
        target: PeerKey,
    },

    /// Coordinator → peer: a previous `PortRequest` could not be serviced.
    ///
    /// Lets a send suspended on brokering reject instead of hanging.
    PortFailure {
        /// The target of the failed request.
        target: PeerKey,
        /// Human-readable failure reason.
        error: String,
    },
}

/// Endpoint-level traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// Fire-and-forget named message.
    Message {
        /// The message name listeners are keyed by.
        message: String,
        /// Positional payload arguments.
        args: Vec<Value>,
    },

    /// Request half of a call.
    #[serde(rename_all = "camelCase")]
    Invoke {
        /// The handler channel name.
        channel: String,
        /// Correlation id, unique per calling client.
        request_id: u64,
        /// Positional payload arguments.
        args: Vec<Value>,
    },

    /// Response half of a call, correlated by `request_id`.
    #[serde(rename_all = "camelCase")]
    InvokeResponse {
        /// The request this responds to.
        request_id: u64,
        /// Whether the handler succeeded.
        success: bool,
        /// Handler result when `success` is true.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        /// Failure detail when `success` is false.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<InvokeFault>,
    },
}

impl Envelope {
    /// Build a plain message envelope.
    pub fn message(message: impl Into<String>, args: Vec<Value>) -> Self {
        Envelope::Message {
            message: message.into(),
            args,
        }
    }

    /// Build an invoke request envelope.
    pub fn invoke(channel: impl Into<String>, request_id: u64, args: Vec<Value>) -> Self {
        Envelope::Invoke {
            channel: channel.into(),
            request_id,
            args,
        }
    }

    /// Build a successful invoke response.
    pub fn invoke_ok(request_id: u64, data: Value) -> Self {
        Envelope::InvokeResponse {
            request_id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Build a failed invoke response.
    pub fn invoke_err(request_id: u64, fault: InvokeFault) -> Self {
        Envelope::InvokeResponse {
            request_id,
            success: false,
            data: None,
            error: Some(fault),
        }
    }
}

/// The closed set of invoke failure kinds a responder can report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "code", content = "message")]
pub enum InvokeFault {
    /// No handler is registered for the requested channel.
    NoHandler(String),
    /// The handler ran and failed.
    Handler(String),
}

impl InvokeFault {
    /// Convert into the caller-facing error.
    pub fn into_error(self) -> MeshError {
        match self {
            InvokeFault::NoHandler(channel) => MeshError::NoHandler(channel),
            InvokeFault::Handler(detail) => MeshError::Handler(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invoke_wire_shape() {
        let envelope = Envelope::invoke("resize", 42, vec![json!(800), json!(600)]);
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["type"], "invoke");
        assert_eq!(wire["channel"], "resize");
        assert_eq!(wire["requestId"], 42);
        assert_eq!(wire["args"], json!([800, 600]));
    }

    #[test]
    fn test_failed_response_omits_data() {
        let envelope = Envelope::invoke_err(7, InvokeFault::NoHandler("resize".into()));
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["type"], "invoke-response");
        assert_eq!(wire["success"], false);
        assert!(wire.get("data").is_none());
        assert_eq!(wire["error"]["code"], "NoHandler");
    }

    #[test]
    fn test_control_channel_names() {
        let frame = ControlFrame::Register {
            identifier: Some("compute-worker".into()),
        };
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["channel"], "REGISTER");

        let frame = ControlFrame::MapUpdate { map: vec![] };
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["channel"], "MAP_UPDATE");
    }

    #[test]
    fn test_fault_maps_to_typed_error() {
        let err = InvokeFault::NoHandler("resize".into()).into_error();
        assert!(matches!(err, MeshError::NoHandler(channel) if channel == "resize"));
    }
}
