use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inbound message as received from a session, kept for logging
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MQTTMessage {
    pub topic: String,
    pub content: String,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(48).collect();
        let ellipsis = if self.content.chars().count() > 48 { "..." } else { "" };
        write!(f, "{} {} - {}{}", self.timestamp, self.topic, preview, ellipsis)
    }
}

impl MQTTMessage {
    pub fn from_publish(topic: &str, payload: &[u8]) -> Self {
        MQTTMessage {
            topic: topic.to_string(),
            content: String::from_utf8_lossy(payload).into_owned(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }
}

/// Request produced by a protocol handler, executed by the owning session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Publish { topic: String, payload: String },
    Subscribe(String),
}

impl Outbound {
    pub fn publish(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Outbound::Publish {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn subscribe(topic: impl Into<String>) -> Self {
        Outbound::Subscribe(topic.into())
    }
}

pub const DISCOVER_ACTION: &str = "discover_client";
pub const CLIENT_INFO_ACTION: &str = "client_info";

/// `{action: "discover_client", device_id}` on the discovery topic
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRequest {
    pub action: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Local bus coordinates sent back to a discovering device
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub action: String,
    pub device_id: String,
    pub ip: String,
    pub port: u16,
    pub client_id: String,
}

impl ClientInfo {
    pub fn new(device_id: String, ip: String, port: u16, client_id: String) -> Self {
        Self {
            action: CLIENT_INFO_ACTION.to_string(),
            device_id,
            ip,
            port,
            client_id,
        }
    }
}
