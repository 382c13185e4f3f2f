pub mod config;
pub mod controller;
pub mod mapping;
pub mod mqtt;
pub mod persistence;

use crate::config::AppConfig;
use crate::controller::controller::ControllerSnapshot;
use crate::controller::event_processor::InputStateMachine;
use crate::controller::registry::ControllerRegistry;
use crate::mapping::{KeyActuator, KeyDispatcher, LoggingActuator, RdevActuator};
use crate::mqtt::broker::{BrokerLifecycle, MosquittoBroker};
use crate::mqtt::discovery::{DiscoveryProtocol, DiscoverySettings};
use crate::mqtt::mqtt_handler::{BusStatus, SessionHandle, SessionOptions, SessionRole};
use crate::mqtt::registration::RegistrationProtocol;
use crate::mqtt::topics::Topics;
use crate::persistence::mapping_store::JsonMappingStore;
use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let config = setup()?;

    let store = JsonMappingStore::new(config.mappings_dir.clone());
    if let Err(e) = store.ensure_defaults() {
        warn!("Default mappings unavailable: {}", e);
    }

    let actuator: Arc<dyn KeyActuator> = if config.input.dry_run {
        info!("Dry run: key events are logged, not injected");
        Arc::new(LoggingActuator)
    } else {
        Arc::new(RdevActuator::new())
    };

    let registry = Arc::new(ControllerRegistry::new(
        Arc::new(store),
        InputStateMachine::new(config.input.thresholds()),
        KeyDispatcher::new(actuator),
    ));

    let broker: Arc<dyn BrokerLifecycle> = Arc::new(MosquittoBroker::new(
        config.broker.executable.clone(),
        config.local.host.clone(),
        config.local.port,
        config.broker.probe_timeout(),
        config.broker.startup_grace(),
    ));
    let local_ready = Arc::new(Notify::new());

    let discovery = Arc::new(DiscoveryProtocol::new(
        DiscoverySettings {
            local_port: config.local.port,
            advertise_ip: config.local.advertise_ip.clone(),
            client_id: config.local.announced_client_id.clone(),
            broker_config: config.broker.config_path.clone(),
            start_timeout: config.broker.start_timeout(),
        },
        broker.clone(),
        local_ready.clone(),
    ));
    let registration = Arc::new(RegistrationProtocol::new(
        Topics::new(config.local.base_topic.clone()),
        registry.clone(),
    ));

    let mut central = SessionHandle::spawn(SessionOptions {
        name: "central".to_string(),
        endpoint: config.central.clone(),
        role: SessionRole::Central(discovery),
        policy: config.reconnect,
        probe: None,
        wake: None,
    });
    let mut local = SessionHandle::spawn(SessionOptions {
        name: "local".to_string(),
        endpoint: config.local.endpoint(),
        role: SessionRole::Local(registration),
        policy: config.reconnect,
        probe: Some(broker.clone()),
        wake: Some(local_ready),
    });

    let observer_cancel = CancellationToken::new();
    let observer = tokio::spawn(observe(
        central.status(),
        local.status(),
        registry.subscribe(),
        observer_cancel.clone(),
    ));

    info!("padbridge running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown(&registry, &mut central, &mut local, &broker).await;
    observer_cancel.cancel();
    let _ = observer.await;
    info!("Shutdown complete");
    Ok(())
}

/// Held keys first, then the buses, then the broker we started.
///
/// Returns how many keys were released.
async fn shutdown(
    registry: &ControllerRegistry,
    central: &mut SessionHandle,
    local: &mut SessionHandle,
    broker: &Arc<dyn BrokerLifecycle>,
) -> usize {
    let released = registry.release_all_keys().await;
    info!("Released {} held key(s)", released);

    central.disconnect().await;
    local.disconnect().await;
    // Telemetry handled between the first release and the disconnect
    let late = registry.release_all_keys().await;
    if late > 0 {
        info!("Released {} key(s) pressed during shutdown", late);
    }

    let broker = broker.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || broker.stop()).await {
        error!("Broker stop task failed: {}", e);
    }
    released + late
}

fn setup() -> Result<AppConfig> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    let path = AppConfig::path();
    AppConfig::ensure_default_config(&path)?;
    let config = AppConfig::load_from(&path)?;

    setup_logging_env(config.log_level()?);
    info!("Using configuration {}", path.display());
    Ok(config)
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Logs connection state changes and registry updates until cancelled
async fn observe(
    mut central: watch::Receiver<BusStatus>,
    mut local: watch::Receiver<BusStatus>,
    mut controllers: watch::Receiver<Vec<ControllerSnapshot>>,
    cancel: CancellationToken,
) {
    let mut known = 0;
    let mut central_state = central.borrow().connection_state.clone();
    let mut local_state = local.borrow().connection_state.clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Ok(()) = central.changed() => {
                let status = central.borrow_and_update().clone();
                if status.connection_state != central_state {
                    info!("Central bus: {:?}", status.connection_state);
                    central_state = status.connection_state;
                }
            }
            Ok(()) = local.changed() => {
                let status = local.borrow_and_update().clone();
                if status.connection_state != local_state {
                    info!(
                        "Local bus: {:?} ({} received, {} sent)",
                        status.connection_state, status.messages_received, status.messages_sent
                    );
                    local_state = status.connection_state;
                }
            }
            Ok(()) = controllers.changed() => {
                let count = controllers.borrow_and_update().len();
                if count != known {
                    info!("{} controller(s) registered", count);
                    known = count;
                }
            }
            else => break,
        }
    }
}
