//! Registries mapping service names to servants.

use crate::servant::Servant;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

/// Maps service names to servants for incoming quests.
pub trait Adapter: Send + Sync + 'static {
    /// The servant registered for `service`.
    fn find_servant(&self, service: &str) -> Option<Arc<Servant>>;

    /// The servant used when no servant is registered for a service.
    fn default_servant(&self) -> Option<Arc<Servant>>;
}

/// A simple in-process [`Adapter`].
///
/// Servants can be added and removed while connections are dispatching.
#[derive(Debug, Default)]
pub struct ServiceMap {
    servants: RwLock<HashMap<String, Arc<Servant>>>,
    default: RwLock<Option<Arc<Servant>>>,
}

impl ServiceMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a servant under its own name, replacing any previous one.
    pub fn add(&self, servant: Servant) -> Option<Arc<Servant>> {
        let servant = Arc::new(servant);
        self.servants.write().insert(servant.name().to_string(), servant)
    }

    /// Builder-style [`Self::add`].
    pub fn with(self, servant: Servant) -> Self {
        self.add(servant);
        self
    }

    /// Remove the servant registered for `service`.
    pub fn remove(&self, service: &str) -> Option<Arc<Servant>> {
        self.servants.write().remove(service)
    }

    /// Set the default servant.
    pub fn set_default(&self, servant: Option<Servant>) {
        *self.default.write() = servant.map(Arc::new);
    }
}

impl Adapter for ServiceMap {
    fn find_servant(&self, service: &str) -> Option<Arc<Servant>> {
        self.servants.read().get(service).cloned()
    }

    fn default_servant(&self) -> Option<Arc<Servant>> {
        self.default.read().clone()
    }
}
