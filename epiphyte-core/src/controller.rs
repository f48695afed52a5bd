use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::registry::{TypeError, TypeRegistry};
use crate::store::PropertyStore;
use crate::value::Value;

/// The durable surface persisted alongside an entity.
///
/// `payload` is the codec's encoding of the property map; an empty payload
/// is a valid state meaning "no properties". `declared_type_name` is the
/// declared schema type at the last successful serialization; an empty or
/// unresolvable name degrades to the registry root on load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub payload: String,
    pub declared_type_name: String,
}

/// Drives the store's codec round trip at host checkpoints, encoding only
/// when something actually changed.
///
/// Dirty state is derived rather than stored: the controller remembers the
/// store generation it last serialized, and is dirty whenever the store has
/// moved past it. A mutation that lands between snapshot capture and the
/// clean-generation update therefore leaves the controller dirty for the
/// next checkpoint: it is never silently lost and never half-included in
/// the current payload.
///
/// The host guarantees `before_serialize` and `after_deserialize` never run
/// concurrently with each other for the same entity; concurrent `set`/
/// `remove` calls from other threads are tolerated during both.
pub struct SerializationController {
    store: Arc<PropertyStore>,
    durable: RwLock<DurableRecord>,
    declared_type: RwLock<String>,
    clean_generation: AtomicU64,
}

impl SerializationController {
    /// Creates a controller for a store whose declared type starts as the
    /// registry root.
    ///
    /// A fresh controller is dirty, forcing a first serialization even for
    /// an empty store.
    pub fn new(store: Arc<PropertyStore>, registry: &TypeRegistry) -> Self {
        let clean_generation = store.generation().wrapping_sub(1);
        SerializationController {
            store,
            durable: RwLock::new(DurableRecord::default()),
            declared_type: RwLock::new(registry.root().name.clone()),
            clean_generation: AtomicU64::new(clean_generation),
        }
    }

    /// The store this controller serializes.
    pub fn store(&self) -> &Arc<PropertyStore> {
        &self.store
    }

    /// Whether the durable record is stale relative to the store.
    pub fn is_dirty(&self) -> bool {
        self.store.generation() != self.clean_generation.load(Ordering::Acquire)
    }

    /// The current declared schema type name.
    pub fn declared_type(&self) -> String {
        self.declared_type.read().unwrap().clone()
    }

    /// Validates a candidate declared type and adopts it.
    ///
    /// Rejection leaves the previous declared type untouched. Adoption
    /// dirties the controller so the next checkpoint re-encodes.
    pub fn validate_and_set_type(
        &self,
        name: &str,
        registry: &TypeRegistry,
    ) -> Result<(), TypeError> {
        let def = registry.validate(name)?;
        *self.declared_type.write().unwrap() = def.name.clone();
        self.store.touch();
        Ok(())
    }

    /// Host "before save" checkpoint.
    ///
    /// If clean, this is a no-op (the encode cost is skipped entirely).
    /// If dirty, captures a consistent snapshot, encodes it together with
    /// the declared type, refreshes the durable record, and records the
    /// snapshot's generation as clean. Returns whether a re-encode happened.
    pub fn before_serialize(&self, registry: &TypeRegistry) -> bool {
        let generation = self.store.generation();
        if generation == self.clean_generation.load(Ordering::Acquire) {
            return false;
        }

        let entries: IndexMap<String, Value> = self.store.snapshot().into_iter().collect();
        let declared = self.declared_type();
        // The declared type was validated when set, but the registry may
        // have changed since; resolve() degrades to the root instead of
        // persisting a name that no longer exists.
        let def = registry.resolve(&declared);
        let payload = codec::encode(&entries, &def.name);

        {
            let mut record = self.durable.write().unwrap();
            record.payload = payload;
            record.declared_type_name = def.name.clone();
        }
        // Mutations past `generation` stay dirty for the next checkpoint.
        self.clean_generation.store(generation, Ordering::Release);
        true
    }

    /// Host "after load" checkpoint.
    ///
    /// Never fails: a malformed payload degrades to an empty map with a
    /// diagnostic, an unresolvable declared type degrades to the registry
    /// root, and an absent/empty payload is simply an empty store. The
    /// controller ends clean unconditionally.
    pub fn after_deserialize(&self, mut record: DurableRecord, registry: &TypeRegistry) {
        let (entries, payload_type) = if record.payload.is_empty() {
            (IndexMap::new(), String::new())
        } else {
            match codec::decode(&record.payload) {
                Ok(doc) => (doc.entries, doc.type_name),
                Err(err) => {
                    log::warn!("discarding malformed property payload: {err}");
                    // Adopting the broken payload while clean would break
                    // the rest-state invariant (clean means the payload
                    // decodes to the live map), so degrade it to the
                    // empty-payload form.
                    record.payload.clear();
                    (IndexMap::new(), String::new())
                }
            }
        };

        let loaded_generation = self.store.replace_all(entries);

        // The record's field is authoritative; the payload's embedded type
        // name covers records written before the field was populated.
        let declared_name = if record.declared_type_name.is_empty() {
            payload_type
        } else {
            record.declared_type_name.clone()
        };
        let def = registry.resolve(&declared_name);
        *self.declared_type.write().unwrap() = def.name.clone();

        *self.durable.write().unwrap() = record;
        // Clean exactly at the generation the swap produced; a concurrent
        // mutation bumping past it re-dirties as usual.
        self.clean_generation.store(loaded_generation, Ordering::Release);
    }

    /// Returns a copy of the durable record as of the last checkpoint.
    pub fn durable_record(&self) -> DurableRecord {
        self.durable.read().unwrap().clone()
    }
}

impl std::fmt::Debug for SerializationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializationController")
            .field("dirty", &self.is_dirty())
            .field("declared_type", &self.declared_type())
            .finish()
    }
}
