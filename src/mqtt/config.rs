use rumqttc::MqttOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where and how a session connects
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub client_id: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_keep_alive() -> u64 {
    60
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            client_id: client_id.into(),
            keep_alive_secs: default_keep_alive(),
        }
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)))
            .set_clean_session(true);

        if let Some(user) = &self.username {
            options.set_credentials(user.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay_secs: 1,
            max_delay_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

/// Exponential backoff between reconnect attempts, doubling up to the maximum
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        let min = Duration::from_secs(policy.min_delay_secs.max(1));
        let max = Duration::from_secs(policy.max_delay_secs).max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Delay to wait now; the following call returns twice as much.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
