// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Result envelopes.
//!
//! The remote side posts one envelope per invocation onto the result queue:
//!
//! ```json
//! {"id": "6f1c...", "status": "success", "payload": 3}
//! {"id": "6f1c...", "status": "error", "payload": {"message": "boom"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::execution_store::Outcome;

/// Envelope status flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    /// The remote computation returned a value.
    Success,
    /// The remote computation failed.
    Error,
}

/// Result message correlated to a pending invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Correlation id of the invocation.
    pub id: String,
    /// Success or error.
    pub status: EnvelopeStatus,
    /// Result value or error description.
    #[serde(default)]
    pub payload: Value,
}

impl ResultEnvelope {
    /// Create a success envelope.
    pub fn success(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            status: EnvelopeStatus::Success,
            payload,
        }
    }

    /// Create an error envelope.
    pub fn error(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            status: EnvelopeStatus::Error,
            payload,
        }
    }

    /// Parse a raw queue message body.
    ///
    /// Returns a human-readable reason when the body is not a valid envelope.
    pub fn parse(body: &str) -> Result<Self, String> {
        let envelope: Self = serde_json::from_str(body).map_err(|e| e.to_string())?;
        if envelope.id.trim().is_empty() {
            return Err("envelope id is empty".to_string());
        }
        Ok(envelope)
    }

    /// Serialize for posting onto the queue.
    pub fn to_json(&self) -> String {
        // Value/String fields only; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Turn the envelope into the outcome delivered to the caller.
    pub fn into_outcome(self) -> Outcome {
        match self.status {
            EnvelopeStatus::Success => Ok(self.payload),
            EnvelopeStatus::Error => Err(Error::RemoteExecution {
                message: remote_message(&self.payload),
                payload: self.payload,
            }),
        }
    }
}

fn remote_message(payload: &Value) -> String {
    match payload {
        Value::String(message) => message.clone(),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => payload.to_string(),
        },
        Value::Null => "remote execution failed".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_success() {
        let envelope = ResultEnvelope::parse(r#"{"id":"abc","status":"success","payload":3}"#).unwrap();
        assert_eq!(envelope.id, "abc");
        assert_eq!(envelope.status, EnvelopeStatus::Success);
        assert_eq!(envelope.into_outcome().unwrap(), json!(3));
    }

    #[test]
    fn test_parse_error_with_message() {
        let envelope =
            ResultEnvelope::parse(r#"{"id":"abc","status":"error","payload":{"message":"boom"}}"#)
                .unwrap();
        match envelope.into_outcome() {
            Err(Error::RemoteExecution { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let envelope = ResultEnvelope::parse(r#"{"id":"abc","status":"success"}"#).unwrap();
        assert_eq!(envelope.payload, Value::Null);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ResultEnvelope::parse("not json").is_err());
        assert!(ResultEnvelope::parse(r#"{"id":"abc","status":"maybe"}"#).is_err());
        assert!(ResultEnvelope::parse(r#"{"id":"","status":"success"}"#).is_err());
        assert!(ResultEnvelope::parse(r#"{"status":"success","payload":1}"#).is_err());
    }
}
