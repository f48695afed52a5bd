//! Epiphyte attaches durable, schema-flexible metadata to scene-graph
//! entities.
//!
//! Core concepts:
//! - **Value**: A node in the property graph (primitive, record, or list)
//! - **PropertyStore**: Concurrent key/value store attached to one entity
//! - **TypeRegistry**: Explicit registry validating declared schema types
//!   against a single base root type
//! - **SerializationController**: Drives the codec at host save/load
//!   checkpoints, encoding only when the store actually changed
//! - **DurableRecord**: The payload/type-name pair that survives
//!   save/reload and instancing cycles
//!
//! # Example
//!
//! ```
//! use epiphyte_core::{Entity, EntityId, TypeRegistry};
//!
//! let registry = TypeRegistry::new("Annotation");
//! let entity = Entity::new(EntityId::new(7), &registry);
//!
//! // Any producer holding the entity can annotate it
//! entity.set("length", 4.2).unwrap();
//! entity.set("material", "steel").unwrap();
//!
//! // Host "before save" checkpoint: encodes because the store is dirty
//! assert!(entity.before_serialize(&registry));
//! let record = entity.durable_record();
//!
//! // A brand-new entity restored from the record sees the same values
//! let restored = Entity::new(EntityId::new(8), &registry);
//! restored.after_deserialize(record, &registry);
//! assert_eq!(restored.get("material").unwrap().as_str(), Some("steel"));
//! ```
//!
//! # Recovery guarantees
//!
//! Load never aborts the host's broader load sequence: a malformed payload
//! degrades to an empty store, and a declared type name that no longer
//! resolves (renamed or foreign type) falls back to the registry root with
//! a `log` warning. Single-process round-trip fidelity is guaranteed;
//! cross-process synchronization is out of scope.

mod codec;
mod controller;
mod entity;
mod registry;
mod store;
mod value;

pub use codec::{decode, encode, CodecError, Document};
pub use controller::{DurableRecord, SerializationController};
pub use entity::{Entity, EntityId};
pub use registry::{TypeDef, TypeError, TypeRegistry};
pub use store::{ChangeEvent, PropertyStore, StoreError};
pub use value::Value;
