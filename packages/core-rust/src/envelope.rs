//! Request and response envelopes carried in message bodies.
//!
//! Bodies are UTF-8 JSON. A request is `{"action": <name>, "data": <payload>}`;
//! a response is `{"ok": <bool>, "data"?: <payload>, "error"?: <message>}`.
//!
//! One-way event producers historically sent a flat object discriminated by
//! `type` (`{"type": "send_otp", "email": ...}`). [`RequestEnvelope::decode`]
//! accepts that form too, lifting `type` into `action` and the remaining fields
//! into `data`. Encoding always produces the `{action, data}` form.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors from decoding a message body into an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope must be a JSON object")]
    NotAnObject,
    #[error("envelope has neither an `action` nor a `type` field")]
    MissingDiscriminator,
    #[error("envelope field `{field}` must be a string")]
    InvalidDiscriminator { field: &'static str },
}

impl EnvelopeError {
    /// `true` when the body was not JSON at all, as opposed to JSON of the
    /// wrong shape.
    #[must_use]
    pub fn is_invalid_json(&self) -> bool {
        matches!(self, Self::Json(_))
    }
}

// ---------------------------------------------------------------------------
// RequestEnvelope
// ---------------------------------------------------------------------------

/// Body of a request message: which action to run and with what payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

impl RequestEnvelope {
    /// Creates an envelope for `action` carrying `data`.
    #[must_use]
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self {
            action: action.into(),
            data,
        }
    }

    /// Decodes a request body, accepting both the `action` and the legacy
    /// flat `type` form.
    ///
    /// A missing `data` field decodes as `null`. When both discriminators are
    /// present, `action` wins and `type` is left inside `data` untouched.
    ///
    /// # Errors
    ///
    /// Returns an [`EnvelopeError`] if the body is not JSON, not an object, or
    /// carries no string discriminator.
    pub fn decode(body: &[u8]) -> Result<Self, EnvelopeError> {
        let Value::Object(mut fields) = serde_json::from_slice::<Value>(body)? else {
            return Err(EnvelopeError::NotAnObject);
        };

        match fields.remove("action") {
            Some(Value::String(action)) => {
                let data = fields.remove("data").unwrap_or(Value::Null);
                Ok(Self { action, data })
            }
            Some(_) => Err(EnvelopeError::InvalidDiscriminator { field: "action" }),
            None => Self::decode_flat(fields),
        }
    }

    fn decode_flat(mut fields: Map<String, Value>) -> Result<Self, EnvelopeError> {
        match fields.remove("type") {
            Some(Value::String(action)) => {
                tracing::trace!(action = %action, "decoded flat `type` envelope");
                Ok(Self {
                    action,
                    data: Value::Object(fields),
                })
            }
            Some(_) => Err(EnvelopeError::InvalidDiscriminator { field: "type" }),
            None => Err(EnvelopeError::MissingDiscriminator),
        }
    }

    /// Encodes the envelope as a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` contains a value JSON cannot represent.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

// ---------------------------------------------------------------------------
// ResponseEnvelope
// ---------------------------------------------------------------------------

/// Body of a reply message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// A successful reply carrying the handler's result.
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// A failed reply carrying an error message.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Decodes a reply body.
    ///
    /// # Errors
    ///
    /// Returns an [`EnvelopeError`] if the body is not valid JSON or lacks the
    /// `ok` flag.
    pub fn decode(body: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Encodes the envelope as a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` contains a value JSON cannot represent.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Converts the reply into the handler's result or its error message.
    ///
    /// # Errors
    ///
    /// Returns the remote error message when `ok` is false.
    pub fn into_result(self) -> Result<Value, String> {
        if self.ok {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| "RPC returned error".to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
