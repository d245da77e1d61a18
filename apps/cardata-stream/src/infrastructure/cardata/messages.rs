//! Stream Message Types
//!
//! Every MQTT publish on `{gcid}/{vin}/...` carries one UTF-8 JSON object:
//!
//! ```json
//! {
//!   "vin": "WBA...",
//!   "timestamp": "2025-09-29T16:48:19.019Z",
//!   "data": {
//!     "vehicle.drivetrain.batteryManagement.header": {
//!       "value": 74, "unit": "%", "timestamp": "2025-09-29T16:48:18Z"
//!     }
//!   }
//! }
//! ```

use serde::Deserialize;
use serde_json::Value;

/// A decoded telemetry message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamMessage {
    /// Vehicle identification number.
    #[serde(default)]
    pub vin: String,
    /// Descriptor name to `{value, unit, timestamp}`.
    #[serde(default)]
    pub data: Value,
    /// Message-level timestamp, when present.
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Why a payload could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Payload is not valid JSON for the expected shape.
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload is JSON but not an object.
    #[error("payload is not a JSON object")]
    NotObject,
}

impl StreamMessage {
    /// Decode a raw publish payload. Invalid UTF-8 is replaced, not rejected.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the payload is not a JSON object with a
    /// string `vin`.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let text = String::from_utf8_lossy(payload);
        let value: Value = serde_json::from_str(&text)?;
        if !value.is_object() {
            return Err(DecodeError::NotObject);
        }
        Ok(serde_json::from_value(value)?)
    }
}
