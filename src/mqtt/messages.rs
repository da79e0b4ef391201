//! Outbound publish model and MQTT v5 property mapping.
//!
//! A [`QueuedPublish`] is what flows through the bounded outbound queue and
//! the on-disk spool, so it is plain serde data; the conversion to rumqttc
//! v5 `PublishProperties` happens only at the moment of publishing.

use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::PublishProperties;
use serde::{Deserialize, Serialize};

/// One outbound MQTT publish, queued or spooled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedPublish {
    pub topic: String,
    #[serde(with = "serde_bytes_vec")]
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_properties: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl QueuedPublish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: 0,
            retain: false,
            user_properties: Vec::new(),
            response_topic: None,
            correlation_data: None,
            content_type: None,
        }
    }

    pub fn qos(mut self, qos: u8) -> Self {
        self.qos = qos.min(2);
        self
    }

    pub fn retain(mut self) -> Self {
        self.retain = true;
        self
    }

    pub fn user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    /// Echo a request/response round-trip: the inbound ResponseTopic and
    /// CorrelationData come back on the reply.
    pub fn reply_to(mut self, response_topic: Option<String>, correlation: Option<Vec<u8>>) -> Self {
        self.response_topic = response_topic;
        self.correlation_data = correlation;
        self
    }

    /// Tag the publish with a `bridge-error=<kind>` user property.
    pub fn bridge_error(self, kind: &str) -> Self {
        self.user_property("bridge-error", kind)
    }

    pub fn mqtt_qos(&self) -> QoS {
        match self.qos {
            2 => QoS::ExactlyOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        }
    }

    /// v5 PUBLISH properties, or `None` when the message carries none.
    pub fn publish_properties(&self) -> Option<PublishProperties> {
        if self.user_properties.is_empty()
            && self.response_topic.is_none()
            && self.correlation_data.is_none()
            && self.content_type.is_none()
        {
            return None;
        }

        let mut props = PublishProperties::default();
        props.user_properties = self.user_properties.clone();
        props.response_topic = self.response_topic.clone();
        props.correlation_data = self
            .correlation_data
            .clone()
            .map(bytes::Bytes::from);
        props.content_type = self.content_type.clone();
        Some(props)
    }
}

/// Compact payload representation for spool rows (base64 would be opaque in
/// logs; a plain byte array keeps rows greppable).
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_seq(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(de)
    }
}

// ── Tests ────────────────────────────────────────────────────
