//! Local bus handshake and telemetry intake
//!
//! Every literal `"new"` on `{base}/register` creates a controller with a fresh
//! id, announces the id on `{base}/getid` and subscribes to the controller's
//! telemetry topics. Repeated registrations by the same device are not merged.

use crate::controller::event_processor::{ButtonSample, JoystickSample};
use crate::controller::registry::ControllerRegistry;
use crate::mqtt::error::{ProtocolError, SessionError};
use crate::mqtt::message_manager::Outbound;
use crate::mqtt::topics::{LocalTopic, Topics};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info};

const REGISTER_PAYLOAD: &str = "new";

pub struct RegistrationProtocol {
    topics: Topics,
    registry: Arc<ControllerRegistry>,
}

impl RegistrationProtocol {
    pub fn new(topics: Topics, registry: Arc<ControllerRegistry>) -> Self {
        Self { topics, registry }
    }

    /// Register topic plus the telemetry topics of every known controller.
    ///
    /// Issued on every (re)connect of the local session.
    pub async fn subscriptions(&self) -> Vec<Outbound> {
        let mut out = vec![Outbound::subscribe(self.topics.register())];
        for id in self.registry.ids().await {
            out.extend(self.telemetry_subscriptions(&id));
        }
        out
    }

    fn telemetry_subscriptions(&self, id: &str) -> [Outbound; 2] {
        [
            Outbound::subscribe(self.topics.button(id)),
            Outbound::subscribe(self.topics.joystick(id)),
        ]
    }

    pub async fn on_message(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<Vec<Outbound>, SessionError> {
        match self.topics.classify(topic) {
            LocalTopic::Register => {
                let text = String::from_utf8_lossy(payload);
                if text.trim() != REGISTER_PAYLOAD {
                    return Err(ProtocolError::UnexpectedPayload {
                        topic: topic.to_string(),
                        payload: text.into_owned(),
                    }
                    .into());
                }
                self.assign_identity().await
            }
            LocalTopic::Button(id) => {
                let sample: ButtonSample = parse(topic, payload)?;
                self.registry.apply_button(id, &sample).await?;
                Ok(Vec::new())
            }
            LocalTopic::Joystick(id) => {
                let sample: JoystickSample = parse(topic, payload)?;
                self.registry.apply_joystick(id, &sample).await?;
                Ok(Vec::new())
            }
            LocalTopic::Unknown => Err(ProtocolError::UnknownTopic(topic.to_string()).into()),
        }
    }

    async fn assign_identity(&self) -> Result<Vec<Outbound>, SessionError> {
        let id = self.registry.register_new().await?;
        info!("Assigned id {} to a new device", id);

        let mut out = vec![Outbound::publish(self.topics.getid(), id.clone())];
        out.extend(self.telemetry_subscriptions(&id));
        debug!("Subscribing to telemetry of controller {}", id);
        Ok(out)
    }
}

fn parse<T: DeserializeOwned>(topic: &str, payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed {
        topic: topic.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::event_processor::{InputStateMachine, ZoneThresholds};
    use crate::mapping::engine::KeyDispatcher;
    use crate::mapping::mock::RecordingActuator;
    use crate::persistence::mapping_store::MemoryMappingStore;

    fn setup() -> (RegistrationProtocol, Arc<RecordingActuator>) {
        let actuator = Arc::new(RecordingActuator::new());
        let registry = Arc::new(ControllerRegistry::new(
            Arc::new(MemoryMappingStore::default()),
            InputStateMachine::new(ZoneThresholds::default()),
            KeyDispatcher::new(actuator.clone()),
        ));
        (
            RegistrationProtocol::new(Topics::new("gamecontroller"), registry),
            actuator,
        )
    }

    #[tokio::test]
    async fn test_new_publishes_id_then_subscribes_telemetry() {
        let (protocol, _) = setup();

        let out = protocol
            .on_message("gamecontroller/register", b"new")
            .await
            .unwrap();

        assert_eq!(
            out,
            vec![
                Outbound::publish("gamecontroller/getid", "1"),
                Outbound::subscribe("gamecontroller/1/button"),
                Outbound::subscribe("gamecontroller/1/joystick"),
            ]
        );
    }

    #[tokio::test]
    async fn test_second_registration_gets_next_id() {
        let (protocol, _) = setup();

        protocol.on_message("gamecontroller/register", b"new").await.unwrap();
        let out = protocol
            .on_message("gamecontroller/register", b"new\n")
            .await
            .unwrap();

        assert_eq!(out[0], Outbound::publish("gamecontroller/getid", "2"));
    }

    #[tokio::test]
    async fn test_resubscribe_covers_known_controllers() {
        let (protocol, _) = setup();
        protocol.on_message("gamecontroller/register", b"new").await.unwrap();

        let subs = protocol.subscriptions().await;

        assert_eq!(
            subs,
            vec![
                Outbound::subscribe("gamecontroller/register"),
                Outbound::subscribe("gamecontroller/1/button"),
                Outbound::subscribe("gamecontroller/1/joystick"),
            ]
        );
    }

    #[tokio::test]
    async fn test_telemetry_reaches_actuator() {
        // Arrange
        let (protocol, actuator) = setup();
        protocol.on_message("gamecontroller/register", b"new").await.unwrap();

        // Act
        protocol
            .on_message("gamecontroller/1/button", br#"{"button":1,"pressed":true}"#)
            .await
            .unwrap();
        protocol
            .on_message("gamecontroller/1/joystick", br#"{"joystick":1,"x":900,"y":512}"#)
            .await
            .unwrap();

        // Assert
        assert_eq!(actuator.presses(), vec!["space".to_string(), "d".to_string()]);
    }

    #[tokio::test]
    async fn test_bad_messages_are_protocol_errors() {
        let (protocol, actuator) = setup();
        protocol.on_message("gamecontroller/register", b"new").await.unwrap();

        let results = vec![
            protocol.on_message("gamecontroller/register", b"hello").await,
            protocol.on_message("gamecontroller/1/button", b"not json").await,
            protocol
                .on_message("gamecontroller/7/button", br#"{"button":1,"pressed":true}"#)
                .await,
            protocol
                .on_message("gamecontroller/1/button", br#"{"button":9,"pressed":true}"#)
                .await,
            protocol.on_message("gamecontroller/1/unknown", b"{}").await,
        ];

        for result in results {
            let err = result.unwrap_err();
            assert!(matches!(err, SessionError::Protocol(_)), "{:?}", err);
            assert!(!err.is_fatal());
        }
        assert!(actuator.presses().is_empty());
    }
}
