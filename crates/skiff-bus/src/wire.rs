//! Frame format for the guest-facing TCP frontend.
//!
//! One JSON object per line. Payload bytes travel base64-encoded so the
//! framing stays line-safe.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use skiff_common::VmId;
use std::collections::HashMap;

/// One frame on a guest connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum Frame {
    /// Client → server: authenticate with the minted seed.
    Connect { vm_id: VmId, seed: String },
    /// Server → client: authentication accepted.
    Info {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Client → server: register a subscription.
    Sub { sid: u64, subject: String },
    /// Client → server: remove a subscription.
    Unsub { sid: u64 },
    /// Client → server: publish (with optional reply inbox for requests).
    Pub {
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        payload: String,
    },
    /// Server → client: message delivery for subscription `sid`.
    Msg {
        sid: u64,
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        payload: String,
    },
    /// Client → server: fetch an object from the store.
    Get { bucket: String, key: String },
    /// Server → client: object fetch result.
    Obj { found: bool, payload: String },
    /// Server → client: generic acknowledgement.
    Ok,
    /// Server → client: protocol or permission error.
    Err { message: String },
}

pub(crate) fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub(crate) fn decode_payload(encoded: &str) -> Option<Vec<u8>> {
    STANDARD.decode(encoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::Pub {
            subject: "agentint.abc.logs".to_string(),
            reply: None,
            headers: HashMap::new(),
            payload: encode_payload(b"hello"),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"op\":\"pub\""));
        assert!(!json.contains("\"reply\""));

        let back: Frame = serde_json::from_str(&json).unwrap();
        match back {
            Frame::Pub {
                subject, payload, ..
            } => {
                assert_eq!(subject, "agentint.abc.logs");
                assert_eq!(decode_payload(&payload).unwrap(), b"hello");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_connect_frame() {
        let vm_id = VmId::new();
        let json = format!(r#"{{"op":"connect","vm_id":"{vm_id}","seed":"SUAS1"}}"#);
        let frame: Frame = serde_json::from_str(&json).unwrap();
        match frame {
            Frame::Connect { vm_id: id, seed } => {
                assert_eq!(id, vm_id);
                assert_eq!(seed, "SUAS1");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_unit_frames() {
        let json = serde_json::to_string(&Frame::Ok).unwrap();
        assert_eq!(json, r#"{"op":"ok"}"#);
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Frame::Ok));
    }
}
