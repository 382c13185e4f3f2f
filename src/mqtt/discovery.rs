//! Central bus handshake
//!
//! A device publishes `discover_client` on the central bus. We make sure the
//! local broker is up (starting it if needed, bounded by a timeout) and answer
//! with the coordinates of the local bus. No answer is sent when the broker
//! cannot be brought up; the device retries on its own.

use crate::mqtt::broker::{local_ip, BrokerLifecycle};
use crate::mqtt::error::ProtocolError;
use crate::mqtt::message_manager::{ClientInfo, DiscoveryRequest, Outbound, DISCOVER_ACTION};
use crate::mqtt::topics::{DISCOVERY_TOPIC, RESPONSE_TOPIC};
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

/// What the discovery handler advertises and how it starts the local broker
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub local_port: u16,
    /// Overrides IP detection when set
    pub advertise_ip: Option<String>,
    pub client_id: String,
    pub broker_config: PathBuf,
    pub start_timeout: Duration,
}

pub struct DiscoveryProtocol {
    settings: DiscoverySettings,
    broker: Arc<dyn BrokerLifecycle>,
    // device id -> time the request arrived
    pending: Mutex<HashMap<String, DateTime<Local>>>,
    local_ready: Arc<Notify>,
}

impl DiscoveryProtocol {
    pub fn new(
        settings: DiscoverySettings,
        broker: Arc<dyn BrokerLifecycle>,
        local_ready: Arc<Notify>,
    ) -> Self {
        Self {
            settings,
            broker,
            pending: Mutex::new(HashMap::new()),
            local_ready,
        }
    }

    /// Subscriptions to issue whenever the central session (re)connects
    pub fn subscriptions(&self) -> Vec<Outbound> {
        vec![Outbound::subscribe(DISCOVERY_TOPIC)]
    }

    pub async fn on_message(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<Vec<Outbound>, ProtocolError> {
        if topic != DISCOVERY_TOPIC {
            return Err(ProtocolError::UnknownTopic(topic.to_string()));
        }

        let request: DiscoveryRequest =
            serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        if request.action != DISCOVER_ACTION {
            debug!("Ignoring discovery action '{}'", request.action);
            return Ok(Vec::new());
        }

        let device_id = request.device_id.unwrap_or_else(|| "unknown".to_string());
        Ok(self.on_discovery_request(device_id).await)
    }

    async fn on_discovery_request(&self, device_id: String) -> Vec<Outbound> {
        {
            let mut pending = self.pending.lock().await;
            if let Some(since) = pending.get(&device_id) {
                debug!(
                    "Discovery for {} already in progress since {}",
                    device_id, since
                );
                return Vec::new();
            }
            pending.insert(device_id.clone(), Local::now());
        }
        info!("Discovery request from device {}", device_id);

        let response = self.respond(&device_id).await;

        self.pending.lock().await.remove(&device_id);
        response.into_iter().collect()
    }

    async fn respond(&self, device_id: &str) -> Option<Outbound> {
        if !self.ensure_local_broker().await {
            error!(
                "No local broker available, not answering device {}",
                device_id
            );
            return None;
        }

        let ip = self
            .settings
            .advertise_ip
            .clone()
            .unwrap_or_else(|| local_ip().to_string());
        let info = ClientInfo::new(
            device_id.to_string(),
            ip,
            self.settings.local_port,
            self.settings.client_id.clone(),
        );

        match serde_json::to_string(&info) {
            Ok(payload) => {
                info!(
                    "Sending local bus {}:{} to device {}",
                    info.ip, info.port, device_id
                );
                Some(Outbound::publish(RESPONSE_TOPIC, payload))
            }
            Err(e) => {
                error!("Failed to serialize discovery response: {}", e);
                None
            }
        }
    }

    /// Probes the local broker and starts it when needed, within the start timeout.
    async fn ensure_local_broker(&self) -> bool {
        let broker = self.broker.clone();
        let port = self.settings.local_port;
        let config = self.settings.broker_config.clone();

        let task = tokio::task::spawn_blocking(move || {
            if broker.is_running(port) {
                return (true, false);
            }
            (broker.start(&config), true)
        });

        match tokio::time::timeout(self.settings.start_timeout, task).await {
            Ok(Ok((true, started))) => {
                if started {
                    info!("Local broker started, waking local session");
                    self.local_ready.notify_one();
                }
                true
            }
            Ok(Ok((false, _))) => false,
            Ok(Err(e)) => {
                error!("Broker start task failed: {}", e);
                false
            }
            Err(_) => {
                warn!(
                    "Local broker did not come up within {:?}",
                    self.settings.start_timeout
                );
                false
            }
        }
    }
}
