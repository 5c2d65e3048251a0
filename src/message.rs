use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};
use lapin::types::ShortString;
use lapin::{BasicProperties, Channel};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::FacadeError;

/// Content as supplied by the caller, normalized the way spec.md §6 demands:
/// string payloads are UTF-8 encoded as-is, byte payloads pass through
/// verbatim, anything else is JSON-encoded and defaults `content_type` to
/// `application/json`. Modeled as a sum type per spec.md §9's design note,
/// rather than runtime type sniffing.
#[derive(Clone, Debug)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Payload {
    /// JSON-encode an arbitrary serializable value.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, FacadeError> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    pub(crate) fn encode(self, properties: BasicProperties) -> (Vec<u8>, BasicProperties) {
        match self {
            Payload::Text(s) => (s.into_bytes(), properties),
            Payload::Bytes(b) => (b, properties),
            Payload::Json(v) => {
                let body = serde_json::to_vec(&v).unwrap_or_default();
                let properties = if properties.content_type().is_none() {
                    properties.with_content_type("application/json".into())
                } else {
                    properties
                };
                (body, properties)
            }
        }
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// Delivery-side metadata, kept separate from `BasicProperties` the way
/// spec.md's `fields` are distinguished from `properties`.
#[derive(Clone, Debug, Default)]
pub struct DeliveryFields {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

/// A handle bound to the channel that delivered a message, used to
/// ack/nack/reject it. `lapin::Channel` is itself a cheap, clonable, internally
/// reference-counted handle, so holding one here plays the role spec.md's
/// "weak reference to the delivering channel" describes without needing a
/// second indirection.
#[derive(Clone)]
pub struct AckHandle {
    channel: Channel,
    delivery_tag: u64,
}

impl AckHandle {
    pub(crate) fn new(channel: Channel, delivery_tag: u64) -> Self {
        Self {
            channel,
            delivery_tag,
        }
    }

    pub async fn ack(&self) -> Result<(), FacadeError> {
        self.channel
            .basic_ack(self.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(FacadeError::from)
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), FacadeError> {
        self.channel
            .basic_nack(
                self.delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(FacadeError::from)
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), FacadeError> {
        self.channel
            .basic_reject(self.delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(FacadeError::from)
    }
}

/// Value object carrying payload bytes, transport properties, and (for
/// received messages) an ack/nack handle bound to the receiving channel.
#[derive(Clone)]
pub struct Message {
    content: Vec<u8>,
    properties: BasicProperties,
    fields: Option<DeliveryFields>,
    ack_handle: Option<AckHandle>,
}

impl Message {
    pub fn new(payload: impl Into<Payload>, properties: BasicProperties) -> Self {
        let (content, properties) = payload.into().encode(properties);
        Self {
            content,
            properties,
            fields: None,
            ack_handle: None,
        }
    }

    pub(crate) fn from_delivery(delivery: &Delivery, channel: Channel) -> Self {
        Self {
            content: delivery.data.clone(),
            properties: delivery.properties.clone(),
            fields: Some(DeliveryFields {
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                redelivered: delivery.redelivered,
            }),
            ack_handle: Some(AckHandle::new(channel, delivery.delivery_tag)),
        }
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    pub fn fields(&self) -> Option<&DeliveryFields> {
        self.fields.as_ref()
    }

    pub fn ack_handle(&self) -> Option<&AckHandle> {
        self.ack_handle.as_ref()
    }

    pub async fn ack(&self) -> Result<(), FacadeError> {
        match &self.ack_handle {
            Some(handle) => handle.ack().await,
            None => Err(FacadeError::InvalidPayload(
                "message has no ack handle (it was not received from a broker delivery)".into(),
            )),
        }
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), FacadeError> {
        match &self.ack_handle {
            Some(handle) => handle.nack(requeue).await,
            None => Err(FacadeError::InvalidPayload(
                "message has no ack handle (it was not received from a broker delivery)".into(),
            )),
        }
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), FacadeError> {
        match &self.ack_handle {
            Some(handle) => handle.reject(requeue).await,
            None => Err(FacadeError::InvalidPayload(
                "message has no ack handle (it was not received from a broker delivery)".into(),
            )),
        }
    }

    /// Decodes the payload per spec.md §6: when `content_type` is
    /// `application/json`, the bytes are parsed as JSON into `T`; otherwise
    /// the bytes are treated as a UTF-8 string wrapped into `T` (this is how
    /// `get_content::<String>()` on a plain-text message returns the text
    /// itself).
    pub fn get_content<T: DeserializeOwned>(&self) -> Result<T, FacadeError> {
        let is_json = self
            .properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str() == "application/json")
            .unwrap_or(false);

        if is_json {
            serde_json::from_slice(&self.content).map_err(FacadeError::from)
        } else {
            let text = std::str::from_utf8(&self.content)?;
            serde_json::from_value(serde_json::Value::String(text.to_string()))
                .map_err(FacadeError::from)
        }
    }

    pub(crate) fn reply_to(&self) -> Option<ShortString> {
        self.properties.reply_to().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_encodes_to_utf8_bytes_without_forcing_content_type() {
        let msg = Message::new(Payload::from("hello"), BasicProperties::default());
        assert_eq!(msg.content(), b"hello");
        assert!(msg.properties().content_type().is_none());
    }

    #[test]
    fn bytes_payload_passes_through_verbatim() {
        let raw = vec![0u8, 1, 2, 255];
        let msg = Message::new(Payload::from(raw.clone()), BasicProperties::default());
        assert_eq!(msg.content(), raw.as_slice());
    }

    #[test]
    fn json_payload_defaults_content_type() {
        let value = serde_json::json!({"a": 1, "b": [2, 3]});
        let msg = Message::new(Payload::from(value.clone()), BasicProperties::default());
        assert_eq!(
            msg.properties().content_type().as_ref().map(|s| s.as_str()),
            Some("application/json")
        );
        let decoded: serde_json::Value = msg.get_content().unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn json_payload_does_not_override_explicit_content_type() {
        let properties =
            BasicProperties::default().with_content_type("application/custom+json".into());
        let msg = Message::new(Payload::Json(serde_json::json!({"x": 1})), properties);
        assert_eq!(
            msg.properties().content_type().as_ref().map(|s| s.as_str()),
            Some("application/custom+json")
        );
    }

    #[test]
    fn plain_text_get_content_roundtrips_as_string() {
        let msg = Message::new(Payload::from("hello"), BasicProperties::default());
        let decoded: String = msg.get_content().unwrap();
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn message_without_ack_handle_rejects_ack_calls() {
        let msg = Message::new(Payload::from("hi"), BasicProperties::default());
        assert!(msg.ack_handle().is_none());
    }
}
