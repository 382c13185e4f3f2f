//! Controller registry
//!
//! Owns every known [`Controller`] behind one async mutex. All mutation goes
//! through that lock: identity allocation and insertion form a single critical
//! section, and telemetry actuation happens while the lock is held so that the
//! bookkeeping in `active_keys` can never interleave with another dispatch.
//!
//! Every change publishes a fresh snapshot list on a `watch` channel.

use crate::controller::controller::{default_key_mappings, Controller, ControllerSnapshot};
use crate::controller::event_processor::{
    ButtonSample, InputStateMachine, InvalidSample, JoystickSample,
};
use crate::mapping::engine::KeyDispatcher;
use crate::mapping::error::ActuationError;
use crate::persistence::mapping_store::MappingStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// An allocated id was already taken. Unreachable unless the counter is broken.
    #[error("Identity conflict: controller {0} already exists")]
    IdentityConflict(String),

    #[error("Unknown controller: {0}")]
    UnknownController(String),

    #[error("Invalid sample: {0}")]
    InvalidSample(#[from] InvalidSample),
}

struct RegistryInner {
    next_id: u64,
    controllers: BTreeMap<u64, Controller>,
}

pub struct ControllerRegistry {
    inner: Mutex<RegistryInner>,
    store: Arc<dyn MappingStore>,
    machine: InputStateMachine,
    dispatcher: KeyDispatcher,
    snapshots: watch::Sender<Vec<ControllerSnapshot>>,
}

fn parse_id(id: &str) -> Result<u64, RegistryError> {
    id.parse::<u64>()
        .map_err(|_| RegistryError::UnknownController(id.to_string()))
}

impl ControllerRegistry {
    pub fn new(
        store: Arc<dyn MappingStore>,
        machine: InputStateMachine,
        dispatcher: KeyDispatcher,
    ) -> Self {
        let (snapshots, _) = watch::channel(Vec::new());
        Self {
            inner: Mutex::new(RegistryInner {
                next_id: 1,
                controllers: BTreeMap::new(),
            }),
            store,
            machine,
            dispatcher,
            snapshots,
        }
    }

    /// Observer channel carrying the full controller list after every change
    pub fn subscribe(&self) -> watch::Receiver<Vec<ControllerSnapshot>> {
        self.snapshots.subscribe()
    }

    fn publish(&self, inner: &RegistryInner) {
        let list = inner
            .controllers
            .values()
            .map(Controller::snapshot)
            .collect();
        self.snapshots.send_replace(list);
    }

    /// Allocates the next id and inserts a fresh controller under one lock.
    ///
    /// Ids start at 1 and are never reused, even if the caller fails to hand
    /// the id to the device. Stored mappings are read before the lock is taken;
    /// if another registration claimed the id meanwhile, the read is repeated.
    pub async fn register_new(&self) -> Result<String, RegistryError> {
        loop {
            let candidate = self.inner.lock().await.next_id;
            let mappings = self.load_mappings(candidate.to_string()).await;

            let mut inner = self.inner.lock().await;
            if inner.next_id != candidate {
                debug!("Id {} taken while loading mappings, retrying", candidate);
                continue;
            }
            inner.next_id += 1;
            let id = candidate.to_string();

            if inner.controllers.contains_key(&candidate) {
                error!("Identity conflict while registering controller {}", id);
                return Err(RegistryError::IdentityConflict(id));
            }

            inner
                .controllers
                .insert(candidate, Controller::new(id.clone(), mappings));
            info!("Registered controller {}", id);

            self.publish(&inner);
            return Ok(id);
        }
    }

    async fn load_mappings(&self, id: String) -> HashMap<String, String> {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.load(&id)).await {
            Ok(mappings) => mappings,
            Err(e) => {
                warn!("Mapping load task failed: {}", e);
                default_key_mappings()
            }
        }
    }

    /// Rewinds the id counter to simulate a broken allocator
    #[cfg(test)]
    pub(crate) async fn rewind_next_id(&self, next_id: u64) {
        self.inner.lock().await.next_id = next_id;
    }

    /// Applies a button report: edges, actuation, state update.
    pub async fn apply_button(
        &self,
        id: &str,
        sample: &ButtonSample,
    ) -> Result<Vec<ActuationError>, RegistryError> {
        sample.validate()?;
        let key = parse_id(id)?;

        let mut inner = self.inner.lock().await;
        let controller = inner
            .controllers
            .get_mut(&key)
            .ok_or_else(|| RegistryError::UnknownController(id.to_string()))?;

        let edges = self.machine.apply_button(controller, sample);
        let failures = self.dispatcher.dispatch(controller, &edges);
        debug!(
            "Controller {} button {} pressed={} -> {} edge(s)",
            id,
            sample.button,
            sample.pressed,
            edges.len()
        );

        self.publish(&inner);
        Ok(failures)
    }

    /// Applies a joystick report: edges, actuation, state update.
    pub async fn apply_joystick(
        &self,
        id: &str,
        sample: &JoystickSample,
    ) -> Result<Vec<ActuationError>, RegistryError> {
        sample.validate()?;
        let key = parse_id(id)?;

        let mut inner = self.inner.lock().await;
        let controller = inner
            .controllers
            .get_mut(&key)
            .ok_or_else(|| RegistryError::UnknownController(id.to_string()))?;

        let edges = self.machine.apply_joystick(controller, sample);
        let failures = self.dispatcher.dispatch(controller, &edges);
        if !edges.is_empty() {
            debug!(
                "Controller {} joystick {} at ({}, {}) -> {} edge(s)",
                id,
                sample.joystick,
                sample.x,
                sample.y,
                edges.len()
            );
        }

        self.publish(&inner);
        Ok(failures)
    }

    async fn with_controller<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Controller) -> T,
    ) -> Result<T, RegistryError> {
        let key = parse_id(id)?;
        let mut inner = self.inner.lock().await;
        let controller = inner
            .controllers
            .get_mut(&key)
            .ok_or_else(|| RegistryError::UnknownController(id.to_string()))?;
        let result = f(controller);
        self.publish(&inner);
        Ok(result)
    }

    pub async fn update_key_mapping(
        &self,
        id: &str,
        control: &str,
        key: &str,
    ) -> Result<(), RegistryError> {
        self.with_controller(id, |c| c.update_key_mapping(control, key))
            .await?;
        info!("Controller {}: {} mapped to '{}'", id, control, key);
        Ok(())
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<(), RegistryError> {
        self.with_controller(id, |c| c.name = name.to_string())
            .await
    }

    /// Replaces the mapping table with the store's defaults
    pub async fn reset_to_defaults(&self, id: &str) -> Result<(), RegistryError> {
        let defaults = self.store.load_defaults();
        self.with_controller(id, |c| c.key_mappings = defaults)
            .await?;
        info!("Controller {} reset to default mappings", id);
        Ok(())
    }

    /// Writes the controller's current mapping table to the store
    pub async fn save_mappings(&self, id: &str) -> color_eyre::Result<()> {
        let (name, mappings) = self
            .with_controller(id, |c| (c.name.clone(), c.key_mappings.clone()))
            .await?;

        let store = self.store.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || store.save(&id, &name, &mappings)).await?
    }

    /// Removes a controller after releasing every key it still holds.
    ///
    /// Returns the number of keys released.
    pub async fn remove_controller(&self, id: &str) -> Result<usize, RegistryError> {
        let key = parse_id(id)?;
        let mut inner = self.inner.lock().await;
        let mut controller = inner
            .controllers
            .remove(&key)
            .ok_or_else(|| RegistryError::UnknownController(id.to_string()))?;

        let released = self.dispatcher.release_all(&mut controller);
        info!("Removed controller {} ({} key(s) released)", id, released);

        self.publish(&inner);
        Ok(released)
    }

    /// Releases every held key of every controller exactly once.
    pub async fn release_all_keys(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let released = inner
            .controllers
            .values_mut()
            .map(|c| self.dispatcher.release_all(c))
            .sum();

        if released > 0 {
            warn!("Released {} key(s) still held at cleanup", released);
        }
        self.publish(&inner);
        released
    }

    pub async fn snapshot(&self, id: &str) -> Option<ControllerSnapshot> {
        let key = parse_id(id).ok()?;
        self.inner
            .lock()
            .await
            .controllers
            .get(&key)
            .map(Controller::snapshot)
    }

    /// Ids of all known controllers in registration order
    pub async fn ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .controllers
            .values()
            .map(|c| c.id().to_string())
            .collect()
    }
}
