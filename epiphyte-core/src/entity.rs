use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::controller::{DurableRecord, SerializationController};
use crate::registry::{TypeError, TypeRegistry};
use crate::store::{PropertyStore, StoreError};
use crate::value::Value;

/// Opaque handle for an addressable object in the host's scene graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    pub fn new(raw: u64) -> Self {
        EntityId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity:{}", self.0)
    }
}

/// A scene-graph entity with its attached property store.
///
/// Each entity owns exactly one store/controller pair for its lifetime;
/// both are dropped with the entity. The store is shared as an `Arc` so
/// background producers can keep annotating while the host holds the
/// entity, but there is no cross-entity sharing.
#[derive(Debug)]
pub struct Entity {
    id: EntityId,
    store: Arc<PropertyStore>,
    controller: SerializationController,
}

impl Entity {
    /// Creates an entity with an empty property store.
    ///
    /// The declared type starts as the registry root, and the first
    /// `before_serialize` always encodes (a fresh store is dirty).
    pub fn new(id: EntityId, registry: &TypeRegistry) -> Self {
        let store = Arc::new(PropertyStore::new());
        let controller = SerializationController::new(Arc::clone(&store), registry);
        Entity {
            id,
            store,
            controller,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The attached store. Clone the `Arc` to hand it to producer threads.
    pub fn store(&self) -> &Arc<PropertyStore> {
        &self.store
    }

    pub fn controller(&self) -> &SerializationController {
        &self.controller
    }

    // Consumer-facing pass-throughs.

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(key)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), StoreError> {
        self.store.set(key, value)
    }

    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.store.remove(key)
    }

    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.store.snapshot()
    }

    pub fn is_dirty(&self) -> bool {
        self.controller.is_dirty()
    }

    pub fn declared_type(&self) -> String {
        self.controller.declared_type()
    }

    pub fn validate_and_set_type(
        &self,
        name: &str,
        registry: &TypeRegistry,
    ) -> Result<(), TypeError> {
        self.controller.validate_and_set_type(name, registry)
    }

    // Host lifecycle hooks.

    pub fn before_serialize(&self, registry: &TypeRegistry) -> bool {
        self.controller.before_serialize(registry)
    }

    pub fn after_deserialize(&self, record: DurableRecord, registry: &TypeRegistry) {
        self.controller.after_deserialize(record, registry)
    }

    pub fn durable_record(&self) -> DurableRecord {
        self.controller.durable_record()
    }
}
