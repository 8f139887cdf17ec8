//! Conversion between broker message bodies and [`Payload`]s.
//!
//! Decoding is pure: the same [`RawMessage`] always yields the same result.
//! Bodies without a content type are treated as JSON. `text/plain` bodies are
//! exposed as `{"payload": <text>}` so text publishers and JSON publishers
//! produce the same variable shape downstream.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::types::json_type_name;
use crate::{ContentType, MalformedPayloadError, MessageBody, Payload, PublishError, RawMessage};

/// Key under which a `text/plain` body is exposed.
pub const TEXT_PAYLOAD_KEY: &str = "payload";

/// Stateless codec between broker bodies and payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }

    /// Decodes a received message into a payload.
    pub fn decode(&self, message: &RawMessage) -> Result<Payload, MalformedPayloadError> {
        let content_type = match message.content_type.as_deref() {
            None => ContentType::Json,
            Some(mime) => ContentType::from_mime(mime).ok_or_else(|| {
                MalformedPayloadError::UnsupportedContentType {
                    content_type: mime.to_string(),
                }
            })?,
        };
        self.decode_body(&message.body, content_type)
    }

    /// Decodes raw bytes of a known content type.
    pub fn decode_body(
        &self,
        body: &[u8],
        content_type: ContentType,
    ) -> Result<Payload, MalformedPayloadError> {
        if body.is_empty() {
            return Err(MalformedPayloadError::EmptyBody);
        }
        let text = std::str::from_utf8(body).map_err(|_| MalformedPayloadError::InvalidUtf8)?;

        match content_type {
            ContentType::Text => Ok(Payload::new().with(TEXT_PAYLOAD_KEY, text)),
            ContentType::Json => {
                let value: JsonValue = serde_json::from_str(text).map_err(|err| {
                    MalformedPayloadError::InvalidJson {
                        reason: err.to_string(),
                    }
                })?;
                match value {
                    JsonValue::Object(map) => Ok(Payload::from(map)),
                    other => Err(MalformedPayloadError::NotAnObject {
                        found: json_type_name(&other),
                    }),
                }
            }
        }
    }

    /// Encodes a payload as a JSON message body.
    pub fn encode(&self, payload: &Payload) -> Result<MessageBody, PublishError> {
        self.encode_with_properties(payload, BTreeMap::new())
    }

    /// Encodes a payload and attaches user properties to the body.
    pub fn encode_with_properties(
        &self,
        payload: &Payload,
        properties: BTreeMap<String, String>,
    ) -> Result<MessageBody, PublishError> {
        let bytes = serde_json::to_vec(payload).map_err(|err| PublishError::Encode {
            reason: err.to_string(),
        })?;
        Ok(MessageBody {
            bytes,
            content_type: ContentType::Json.mime().to_string(),
            properties,
        })
    }
}
