//! OCPP-J message framing
//!
//! Every WebSocket text frame carries one JSON array:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Payloads and error details are opaque JSON values here; interpreting them
//! is left to action handlers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::FrameError;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    /// Number of array elements a frame of this type carries
    pub fn arity(self) -> usize {
        match self {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        }
    }
}

/// OCPP error codes (1.6 and 2.0.1 spellings)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormationViolation,
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded OCPP-J frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call {
        message_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        message_id: String,
        payload: Value,
    },
    CallError {
        message_id: String,
        code: String,
        description: String,
        details: Value,
    },
}

impl Frame {
    pub fn message_id(&self) -> &str {
        match self {
            Frame::Call { message_id, .. }
            | Frame::CallResult { message_id, .. }
            | Frame::CallError { message_id, .. } => message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Call { .. } => MessageType::Call,
            Frame::CallResult { .. } => MessageType::CallResult,
            Frame::CallError { .. } => MessageType::CallError,
        }
    }

    /// Serialize to OCPP wire format
    pub fn encode(&self) -> String {
        match self {
            Frame::Call {
                message_id,
                action,
                payload,
            } => encode_call(message_id, action, payload),
            Frame::CallResult {
                message_id,
                payload,
            } => encode_result(message_id, payload),
            Frame::CallError {
                message_id,
                code,
                description,
                details,
            } => encode_error(message_id, code, description, details),
        }
    }
}

/// Serialize a CALL: [2, messageId, action, payload]
pub fn encode_call(message_id: &str, action: &str, payload: &Value) -> String {
    json!([MessageType::Call as i32, message_id, action, payload]).to_string()
}

/// Serialize a CALLRESULT: [3, messageId, payload]
pub fn encode_result(message_id: &str, payload: &Value) -> String {
    json!([MessageType::CallResult as i32, message_id, payload]).to_string()
}

/// Serialize a CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
pub fn encode_error(message_id: &str, code: &str, description: &str, details: &Value) -> String {
    json!([
        MessageType::CallError as i32,
        message_id,
        code,
        description,
        details
    ])
    .to_string()
}

/// Parse one OCPP-J frame
pub fn decode(text: &str) -> Result<Frame, FrameError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| FrameError::MalformedFrame(format!("invalid JSON: {}", e)))?;

    let Value::Array(mut array) = value else {
        return Err(FrameError::MalformedFrame("not a JSON array".into()));
    };

    let type_id = array
        .first()
        .ok_or_else(|| FrameError::MalformedFrame("empty array".into()))?
        .as_i64()
        .ok_or_else(|| FrameError::MalformedFrame("message type id is not an integer".into()))?;

    let msg_type =
        MessageType::from_id(type_id).ok_or(FrameError::UnknownMessageTypeId(type_id))?;

    if array.len() != msg_type.arity() {
        return Err(FrameError::MalformedFrame(format!(
            "{:?} expects {} elements, got {}",
            msg_type,
            msg_type.arity(),
            array.len()
        )));
    }

    let message_id = match &array[1] {
        Value::String(id) if !id.is_empty() => id.clone(),
        _ => {
            return Err(FrameError::MalformedFrame(
                "message id must be a non-empty string".into(),
            ))
        }
    };

    match msg_type {
        MessageType::Call => {
            let action = string_at(&array, 2, "action")?;
            let payload = array.swap_remove(3);
            Ok(Frame::Call {
                message_id,
                action,
                payload,
            })
        }
        MessageType::CallResult => {
            let payload = array.swap_remove(2);
            Ok(Frame::CallResult {
                message_id,
                payload,
            })
        }
        MessageType::CallError => {
            let code = string_at(&array, 2, "error code")?;
            let description = string_at(&array, 3, "error description")?;
            let details = array.swap_remove(4);
            Ok(Frame::CallError {
                message_id,
                code,
                description,
                details,
            })
        }
    }
}

fn string_at(array: &[Value], index: usize, what: &str) -> Result<String, FrameError> {
    array[index]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| FrameError::MalformedFrame(format!("{} must be a string", what)))
}

/// Build a CALLERROR for a frame that failed to decode, when it still names
/// a message id the peer will be waiting on.
///
/// Only frames that look like a CALL (or carry an unknown type id) get a
/// reply; a broken CALLRESULT or CALLERROR is never answered.
pub fn rejection_for(text: &str, err: &FrameError) -> Option<String> {
    let array: Vec<Value> = serde_json::from_str(text).ok()?;
    let type_id = array.first()?.as_i64()?;
    let message_id = array.get(1)?.as_str().filter(|id| !id.is_empty())?;

    match err {
        FrameError::MalformedFrame(reason) if type_id == MessageType::Call as i64 => {
            Some(encode_error(
                message_id,
                ErrorCode::FormationViolation.as_str(),
                reason,
                &json!({}),
            ))
        }
        FrameError::UnknownMessageTypeId(type_id) => Some(encode_error(
            message_id,
            ErrorCode::MessageTypeNotSupported.as_str(),
            &format!("message type id {} is not supported", type_id),
            &json!({}),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_serialization() {
        let text = encode_call("19223201", "Heartbeat", &json!({}));
        assert_eq!(text, r#"[2,"19223201","Heartbeat",{}]"#);
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "boot-001", "BootNotification", {"chargePointVendor": "TestVendor"}]"#;
        let frame = decode(json).unwrap();

        match frame {
            Frame::Call {
                message_id,
                action,
                payload,
            } => {
                assert_eq!(message_id, "boot-001");
                assert_eq!(action, "BootNotification");
                assert_eq!(payload["chargePointVendor"], "TestVendor");
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "hb-001", {"currentTime": "2024-01-01T00:00:00Z"}]"#;
        let frame = decode(json).unwrap();

        assert_eq!(frame.message_type(), MessageType::CallResult);
        assert_eq!(frame.message_id(), "hb-001");
    }

    #[test]
    fn test_call_error_keeps_unknown_code() {
        let json = r#"[4, "msg-123", "VendorSpecificFailure", "boom", {"hint": 1}]"#;
        let frame = decode(json).unwrap();

        match frame {
            Frame::CallError {
                code,
                description,
                details,
                ..
            } => {
                assert_eq!(code, "VendorSpecificFailure");
                assert_eq!(description, "boom");
                assert_eq!(details["hint"], 1);
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_error_serialization() {
        let frame = Frame::CallError {
            message_id: "x".into(),
            code: ErrorCode::NotImplemented.to_string(),
            description: "Unknown action: Foo".into(),
            details: json!({}),
        };
        assert_eq!(
            frame.encode(),
            r#"[4,"x","NotImplemented","Unknown action: Foo",{}]"#
        );
    }

    #[test]
    fn test_malformed_frames() {
        let cases = [
            "not json",
            r#"{"type": 2}"#,
            "[]",
            r#"["2", "id", "Heartbeat", {}]"#,
            r#"[2, "id", "Heartbeat"]"#,
            r#"[3, "id", {}, {}]"#,
            r#"[4, "id", "GenericError", "boom"]"#,
            r#"[2, "", "Heartbeat", {}]"#,
            r#"[2, 17, "Heartbeat", {}]"#,
            r#"[2, "id", 5, {}]"#,
            r#"[4, "id", "GenericError", null, {}]"#,
        ];

        for case in cases {
            assert!(
                matches!(decode(case), Err(FrameError::MalformedFrame(_))),
                "expected MalformedFrame for {}",
                case
            );
        }
    }

    #[test]
    fn test_unknown_message_type() {
        assert_eq!(
            decode(r#"[5, "id", {}]"#),
            Err(FrameError::UnknownMessageTypeId(5))
        );
        assert_eq!(
            decode(r#"[-1]"#),
            Err(FrameError::UnknownMessageTypeId(-1))
        );
    }

    #[test]
    fn test_rejection_for_broken_call() {
        let text = r#"[2, "abc", "Heartbeat"]"#;
        let err = decode(text).unwrap_err();
        let reply = rejection_for(text, &err).unwrap();

        match decode(&reply).unwrap() {
            Frame::CallError {
                message_id, code, ..
            } => {
                assert_eq!(message_id, "abc");
                assert_eq!(code, "FormationViolation");
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_rejection_for_unknown_type() {
        let text = r#"[7, "abc", {}]"#;
        let err = decode(text).unwrap_err();
        let reply = rejection_for(text, &err).unwrap();
        assert!(reply.contains("MessageTypeNotSupported"));
    }

    #[test]
    fn test_no_rejection_for_broken_reply_or_missing_id() {
        let text = r#"[3, "abc"]"#;
        let err = decode(text).unwrap_err();
        assert!(rejection_for(text, &err).is_none());

        let text = "garbage";
        let err = decode(text).unwrap_err();
        assert!(rejection_for(text, &err).is_none());
    }
}
