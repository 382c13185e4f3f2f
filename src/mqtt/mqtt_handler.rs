//! Bus session: one connection to one broker, driven by a statum typestate machine
//!
//! ```text
//!                 connect()              establish()
//! Disconnected ─────────────► Connecting ───────────► Connected
//!      ▲                          │                      │
//!      └──────────────────────────┴──────────────────────┘
//!              (connect failure, lost connection, disconnect)
//! ```
//!
//! [`SessionHandle::spawn`] runs the machine in its own task and reconnects with
//! exponential backoff until [`SessionHandle::disconnect`] is called. Inbound
//! publishes are handed to the session's [`SessionRole`]; the resulting
//! [`Outbound`] requests are issued with the non-blocking `try_*` client calls.

use crate::mqtt::broker::BrokerLifecycle;
use crate::mqtt::config::{Backoff, BrokerEndpoint, ReconnectPolicy};
use crate::mqtt::discovery::DiscoveryProtocol;
use crate::mqtt::error::{ConnectError, SessionError};
use crate::mqtt::message_manager::{MQTTMessage, Outbound};
use crate::mqtt::registration::RegistrationProtocol;
use chrono::{DateTime, Local};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet, QoS, SubscribeFilter,
};
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 64;
const MAX_ERROR_HISTORY: usize = 16;
/// Topic filters carried by one SUBSCRIBE packet
const SUBSCRIBE_BATCH: usize = 64;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

/// Observable state of one session
#[derive(Clone, Debug, Default)]
pub struct BusStatus {
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

impl BusStatus {
    fn record_error(&mut self, message: String) {
        if self.error_messages.len() >= MAX_ERROR_HISTORY {
            self.error_messages.remove(0);
        }
        self.error_messages.push(message.clone());
        self.last_error = Some(message);
    }
}

/// Which handshake a session serves
#[derive(Clone)]
pub enum SessionRole {
    Central(Arc<DiscoveryProtocol>),
    Local(Arc<RegistrationProtocol>),
}

impl SessionRole {
    async fn subscriptions(&self) -> Vec<Outbound> {
        match self {
            SessionRole::Central(discovery) => discovery.subscriptions(),
            SessionRole::Local(registration) => registration.subscriptions().await,
        }
    }

    async fn on_message(&self, topic: &str, payload: &[u8]) -> Result<Vec<Outbound>, SessionError> {
        match self {
            SessionRole::Central(discovery) => Ok(discovery.on_message(topic, payload).await?),
            SessionRole::Local(registration) => registration.on_message(topic, payload).await,
        }
    }
}

/// Why a connected session stopped running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Cancelled,
    Lost(ConnectError),
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

#[machine]
pub struct BusSession<S: SessionState> {
    name: String,
    endpoint: BrokerEndpoint,
    role: SessionRole,
    status: watch::Sender<BusStatus>,
    client: Option<AsyncClient>,
    eventloop: Option<EventLoop>,
}

impl<S: SessionState> BusSession<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|s| s.connection_state = state);
    }

    fn fail(&self, state: ConnectionState, error: &ConnectError) {
        self.status.send_modify(|s| {
            s.connection_state = state;
            s.record_error(error.to_string());
        });
    }
}

impl BusSession<Disconnected> {
    pub fn create(
        name: String,
        endpoint: BrokerEndpoint,
        role: SessionRole,
        status: watch::Sender<BusStatus>,
    ) -> Self {
        debug!("Creating bus session {} for {}", name, endpoint);
        Self::new(name, endpoint, role, status, None, None)
    }

    /// Builds a fresh client for the endpoint. Nothing is sent until `establish`.
    pub fn connect(mut self) -> BusSession<Connecting> {
        info!("[{}] Connecting to {}", self.name, self.endpoint);
        let (client, eventloop) = AsyncClient::new(self.endpoint.mqtt_options(), REQUEST_CAPACITY);
        self.client = Some(client);
        self.eventloop = Some(eventloop);
        self.set_state(ConnectionState::Connecting);
        self.transition()
    }
}

impl BusSession<Connecting> {
    /// Waits for the CONNACK, then issues the role's subscriptions.
    pub async fn establish(
        mut self,
        limit: Duration,
    ) -> Result<BusSession<Connected>, (BusSession<Disconnected>, ConnectError)> {
        let result = match self.eventloop.as_mut() {
            Some(eventloop) => wait_for_connack(eventloop, limit).await,
            None => Err(ConnectError::Unreachable("no event loop".to_string())),
        };

        match result {
            Ok(()) => {
                info!("[{}] Connected to {}", self.name, self.endpoint);
                self.set_state(ConnectionState::Connected);
                let subscriptions = self.role.subscriptions().await;
                self.execute(subscriptions);
                Ok(self.transition())
            }
            Err(e) => {
                warn!("[{}] Connection to {} failed: {}", self.name, self.endpoint, e);
                self.client = None;
                self.eventloop = None;
                self.fail(ConnectionState::Failed, &e);
                Err((self.transition(), e))
            }
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop, limit: Duration) -> Result<(), ConnectError> {
    let handshake = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return match ack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(ConnectError::Rejected(format!("{:?}", code))),
                    };
                }
                Ok(_) => continue,
                Err(e) => return Err(ConnectError::from(e)),
            }
        }
    };

    tokio::time::timeout(limit, handshake)
        .await
        .map_err(|_| ConnectError::Timeout(limit.as_secs()))?
}

/// One call on the client. Consecutive subscriptions share a SUBSCRIBE packet
/// so a resubscribe takes a single slot in the request channel.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientRequest {
    Publish { topic: String, payload: String },
    Subscribe(Vec<String>),
}

fn batch_requests(requests: Vec<Outbound>) -> Vec<ClientRequest> {
    let mut batched: Vec<ClientRequest> = Vec::new();
    for request in requests {
        match request {
            Outbound::Publish { topic, payload } => {
                batched.push(ClientRequest::Publish { topic, payload })
            }
            Outbound::Subscribe(topic) => match batched.last_mut() {
                Some(ClientRequest::Subscribe(topics)) if topics.len() < SUBSCRIBE_BATCH => {
                    topics.push(topic)
                }
                _ => batched.push(ClientRequest::Subscribe(vec![topic])),
            },
        }
    }
    batched
}

impl<S: SessionState> BusSession<S> {
    fn execute(&self, requests: Vec<Outbound>) {
        let Some(client) = &self.client else {
            warn!("[{}] Dropping {} request(s), no client", self.name, requests.len());
            return;
        };

        for request in batch_requests(requests) {
            let result = match &request {
                ClientRequest::Publish { topic, payload } => client.try_publish(
                    topic.clone(),
                    QoS::AtMostOnce,
                    false,
                    payload.clone().into_bytes(),
                ),
                ClientRequest::Subscribe(topics) => client.try_subscribe_many(
                    topics
                        .iter()
                        .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce)),
                ),
            };

            match (result, &request) {
                (Ok(()), ClientRequest::Publish { topic, .. }) => {
                    debug!("[{}] Published on {}", self.name, topic);
                    self.status.send_modify(|s| {
                        s.messages_sent += 1;
                        s.last_activity = Some(Local::now());
                    });
                }
                (Ok(()), ClientRequest::Subscribe(topics)) => {
                    debug!("[{}] Subscribing to {} topic(s)", self.name, topics.len());
                }
                (Err(e), request) => warn!("[{}] Failed to issue {:?}: {}", self.name, request, e),
            }
        }
    }
}

impl BusSession<Connected> {
    /// Dispatches inbound messages until cancelled or the connection drops.
    ///
    /// Per-message errors are logged and dropped. Only a fatal error ends the
    /// session with `Err`.
    pub async fn run(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<(BusSession<Disconnected>, SessionEnd), SessionError> {
        let Some(mut eventloop) = self.eventloop.take() else {
            let e = ConnectError::Unreachable("no event loop".to_string());
            return Ok((self.transition(), SessionEnd::Lost(e)));
        };

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.disconnect_gracefully(&mut eventloop).await;
                    break SessionEnd::Cancelled;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = MQTTMessage::from_publish(&publish.topic, &publish.payload);
                        debug!("[{}] {}", self.name, message);
                        self.status.send_modify(|s| {
                            s.messages_received += 1;
                            s.last_activity = Some(Local::now());
                        });

                        match self.role.on_message(&publish.topic, &publish.payload).await {
                            Ok(requests) => self.execute(requests),
                            Err(e) if e.is_fatal() => {
                                error!("[{}] Fatal: {}", self.name, e);
                                self.status.send_modify(|s| {
                                    s.connection_state = ConnectionState::Failed;
                                    s.record_error(e.to_string());
                                });
                                self.disconnect_gracefully(&mut eventloop).await;
                                return Err(e);
                            }
                            Err(e) => {
                                warn!(
                                    "[{}] Dropped message on {}: {}",
                                    self.name, publish.topic, e
                                );
                                self.status.send_modify(|s| s.record_error(e.to_string()));
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        break SessionEnd::Lost(ConnectError::Unreachable(
                            "broker closed the session".to_string(),
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let e = ConnectError::from(e);
                        warn!("[{}] Connection lost: {}", self.name, e);
                        break SessionEnd::Lost(e);
                    }
                }
            }
        };

        self.client = None;
        match &end {
            SessionEnd::Cancelled => self.set_state(ConnectionState::Disconnected),
            SessionEnd::Lost(e) => self.fail(ConnectionState::Failed, e),
        }
        Ok((self.transition(), end))
    }

    async fn disconnect_gracefully(&mut self, eventloop: &mut EventLoop) {
        let Some(client) = &self.client else {
            return;
        };
        if client.try_disconnect().is_err() {
            return;
        }

        let flush = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(1), flush).await.is_err() {
            debug!("[{}] Disconnect not flushed in time", self.name);
        }
        info!("[{}] Disconnected from {}", self.name, self.endpoint);
    }
}

/// Everything a session task needs
pub struct SessionOptions {
    pub name: String,
    pub endpoint: BrokerEndpoint,
    pub role: SessionRole,
    pub policy: ReconnectPolicy,
    /// Liveness probe checked before every connect attempt
    pub probe: Option<Arc<dyn BrokerLifecycle>>,
    /// Cuts the current backoff short when notified
    pub wake: Option<Arc<Notify>>,
}

async fn probe_broker(probe: &Arc<dyn BrokerLifecycle>, port: u16) -> bool {
    let probe = probe.clone();
    match tokio::task::spawn_blocking(move || probe.is_running(port)).await {
        Ok(running) => running,
        Err(e) => {
            error!("Broker probe task failed: {}", e);
            false
        }
    }
}

async fn wait_for_wake(wake: &Option<Arc<Notify>>) {
    match wake {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

async fn run_session(
    options: SessionOptions,
    status: watch::Sender<BusStatus>,
    cancel: CancellationToken,
) {
    let SessionOptions {
        name,
        endpoint,
        role,
        policy,
        probe,
        wake,
    } = options;
    let port = endpoint.port;
    let mut backoff = Backoff::new(&policy);
    let mut session = BusSession::create(name.clone(), endpoint, role, status.clone());

    while !cancel.is_cancelled() {
        let broker_up = match &probe {
            Some(probe) => probe_broker(probe, port).await,
            None => true,
        };

        if broker_up {
            match session.connect().establish(policy.connect_timeout()).await {
                Ok(connected) => {
                    backoff.reset();
                    match connected.run(&cancel).await {
                        Ok((disconnected, SessionEnd::Cancelled)) => {
                            session = disconnected;
                            break;
                        }
                        Ok((disconnected, SessionEnd::Lost(_))) => session = disconnected,
                        Err(e) => {
                            error!("[{}] Session stopped permanently: {}", name, e);
                            return;
                        }
                    }
                }
                Err((disconnected, _)) => session = disconnected,
            }
        } else {
            let e = ConnectError::BrokerNotRunning(port);
            warn!("[{}] {}, not connecting", name, e);
            session.fail(ConnectionState::Failed, &e);
        }

        let delay = backoff.next_delay();
        session.set_state(ConnectionState::Reconnecting);
        info!("[{}] Reconnecting in {}s", name, delay.as_secs());

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_wake(&wake) => debug!("[{}] Woken up early", name),
        }
    }

    session.set_state(ConnectionState::Disconnected);
    info!("[{}] Session task finished", session.name());
}

/// Handle to a session running in its own task
pub struct SessionHandle {
    name: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    status: watch::Receiver<BusStatus>,
}

impl SessionHandle {
    pub fn spawn(options: SessionOptions) -> Self {
        let name = options.name.clone();
        let (status_tx, status_rx) = watch::channel(BusStatus::default());
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            run_session(options, status_tx, task_cancel).await;
        });
        info!("Spawned bus session {}", name);

        Self {
            name,
            cancel,
            task: Some(task),
            status: status_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> watch::Receiver<BusStatus> {
        self.status.clone()
    }

    /// True once the session task has returned, e.g. after a fatal error.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// User-initiated stop: no further reconnects. Waits for the task to end.
    pub async fn disconnect(&mut self) {
        debug!("Stopping bus session {}", self.name);
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Bus session {} panicked: {}", self.name, e);
            }
        }
    }
}
