//! [`AdapterRegistry`] – adapter factories and live robot instances.
//!
//! The registry holds two independent maps:
//!
//! * **Factories**, keyed by adapter-type name (`"simulated"`, ...).  New
//!   robot families register a factory at startup.
//! * **Instances**, keyed by robot ID.  Exactly one live adapter per robot.
//!
//! Callers never see the internal maps.  [`AdapterRegistry::get_all_active`]
//! returns a snapshot so iteration (e.g. an all-robot emergency stop) happens
//! outside the registry's lock, and adapter methods are never invoked while a
//! registry lock is held.

use std::collections::HashMap;
use std::sync::Arc;

use robogate_types::GateError;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::adapter::{AdapterConfig, RobotAdapter};

/// Builds an adapter instance from its [`AdapterConfig`].
pub type AdapterFactory =
    Arc<dyn Fn(&AdapterConfig) -> Result<Arc<dyn RobotAdapter>, GateError> + Send + Sync>;

/// Adapter factory map plus one live instance per robot ID.
///
/// Construct with [`AdapterRegistry::new`], add factories with
/// [`with_factory`][Self::with_factory], then share it behind an `Arc`.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: RwLock<HashMap<String, AdapterFactory>>,
    instances: RwLock<HashMap<String, Arc<dyn RobotAdapter>>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `adapter_type` (builder-style).  Any factory
    /// previously registered under the same name is replaced.
    pub fn with_factory<F>(mut self, adapter_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&AdapterConfig) -> Result<Arc<dyn RobotAdapter>, GateError> + Send + Sync + 'static,
    {
        self.factories
            .get_mut()
            .insert(adapter_type.into(), Arc::new(factory));
        self
    }

    /// Register a factory on a shared registry.
    pub async fn register_factory<F>(&self, adapter_type: impl Into<String>, factory: F)
    where
        F: Fn(&AdapterConfig) -> Result<Arc<dyn RobotAdapter>, GateError> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .await
            .insert(adapter_type.into(), Arc::new(factory));
    }

    /// Names of every registered adapter type, sorted.
    pub async fn adapter_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build an adapter for `config.robot_id` with the factory named by
    /// `config.adapter_type` and start tracking it.
    ///
    /// The adapter is created but not connected.
    ///
    /// # Errors
    ///
    /// - [`GateError::UnknownAdapterType`] – no such factory.
    /// - [`GateError::RobotAlreadyRegistered`] – the robot ID is taken.
    /// - Whatever the factory itself returns.
    pub async fn create(&self, config: &AdapterConfig) -> Result<Arc<dyn RobotAdapter>, GateError> {
        if config.robot_id.is_empty() {
            return Err(GateError::MissingRobotId);
        }
        let factory = self
            .factories
            .read()
            .await
            .get(&config.adapter_type)
            .cloned()
            .ok_or_else(|| GateError::UnknownAdapterType(config.adapter_type.clone()))?;

        if self.instances.read().await.contains_key(&config.robot_id) {
            return Err(GateError::RobotAlreadyRegistered(config.robot_id.clone()));
        }

        let adapter = factory(config)?;
        self.register_instance(&config.robot_id, Arc::clone(&adapter))
            .await?;
        info!(robot_id = %config.robot_id, adapter_type = %config.adapter_type, "adapter created");
        Ok(adapter)
    }

    /// Track an already-built adapter under `robot_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::RobotAlreadyRegistered`] when the ID is taken.
    pub async fn register_instance(
        &self,
        robot_id: &str,
        adapter: Arc<dyn RobotAdapter>,
    ) -> Result<(), GateError> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(robot_id) {
            return Err(GateError::RobotAlreadyRegistered(robot_id.to_string()));
        }
        instances.insert(robot_id.to_string(), adapter);
        Ok(())
    }

    /// Look up the adapter for `robot_id`.
    pub async fn get(&self, robot_id: &str) -> Option<Arc<dyn RobotAdapter>> {
        self.instances.read().await.get(robot_id).cloned()
    }

    /// Stop tracking `robot_id` and disconnect its adapter.
    ///
    /// Returns the removed adapter, or `None` if the robot was unknown.
    pub async fn remove(&self, robot_id: &str) -> Option<Arc<dyn RobotAdapter>> {
        let adapter = self.instances.write().await.remove(robot_id)?;
        if let Err(e) = adapter.disconnect().await {
            warn!(robot_id, error = %e, "adapter disconnect failed");
        }
        Some(adapter)
    }

    /// Snapshot of every tracked adapter, sorted by robot ID.
    ///
    /// The returned vector is a copy; the registry lock is released before
    /// this method returns.
    pub async fn get_all_active(&self) -> Vec<(String, Arc<dyn RobotAdapter>)> {
        let mut all: Vec<(String, Arc<dyn RobotAdapter>)> = self
            .instances
            .read()
            .await
            .iter()
            .map(|(id, adapter)| (id.clone(), Arc::clone(adapter)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// IDs of every tracked robot, sorted.
    pub async fn robot_ids(&self) -> Vec<String> {
        self.get_all_active()
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Disconnect every tracked adapter.  Instances stay registered.
    pub async fn disconnect_all(&self) {
        for (robot_id, adapter) in self.get_all_active().await {
            if let Err(e) = adapter.disconnect().await {
                warn!(robot_id = %robot_id, error = %e, "adapter disconnect failed");
            }
        }
    }
}
