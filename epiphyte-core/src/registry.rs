use std::collections::HashMap;

/// Error from type registration or validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    #[error("type already registered: {0}")]
    Duplicate(String),
    #[error("unknown parent type: {0}")]
    UnknownParent(String),
    #[error("invalid declared type: {0}")]
    InvalidType(String),
}

/// Description of a schema type: a qualified name, its parent in the
/// hierarchy, and whether it can be instantiated.
///
/// Only the registry root has no parent; `TypeRegistry::register` rejects
/// any other parentless definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    pub name: String,
    pub parent: Option<String>,
    pub is_abstract: bool,
}

impl TypeDef {
    /// Creates a concrete (instantiable) type definition.
    pub fn concrete(name: impl Into<String>, parent: impl Into<String>) -> Self {
        TypeDef {
            name: name.into(),
            parent: Some(parent.into()),
            is_abstract: false,
        }
    }

    /// Creates an abstract type definition. Abstract types organize the
    /// hierarchy but are never a valid declared type themselves.
    pub fn abstract_type(name: impl Into<String>, parent: impl Into<String>) -> Self {
        TypeDef {
            name: name.into(),
            parent: Some(parent.into()),
            is_abstract: true,
        }
    }
}

/// Registry mapping qualified type names to their definitions.
///
/// Built explicitly at startup and passed by reference into consumers;
/// there is no process-wide registry. Registration is leaf-after-parent:
/// a definition is only accepted once its parent is present, so every
/// registered type derives from the root by construction.
///
/// Resolution of persisted names is deliberately infallible: a name that no
/// longer resolves (renamed or removed type) falls back to the root type
/// with a warning, so a load path can never be aborted by stale type
/// information.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    root: TypeDef,
    defs: HashMap<String, TypeDef>,
}

impl TypeRegistry {
    /// Creates a registry with the given base root type.
    ///
    /// The root is concrete and always resolvable.
    pub fn new(root_name: impl Into<String>) -> Self {
        let root = TypeDef {
            name: root_name.into(),
            parent: None,
            is_abstract: false,
        };
        let mut defs = HashMap::new();
        defs.insert(root.name.clone(), root.clone());
        TypeRegistry { root, defs }
    }

    /// Returns the base root type definition.
    pub fn root(&self) -> &TypeDef {
        &self.root
    }

    /// Registers a type definition.
    ///
    /// Fails if the name is already taken or the parent is not yet
    /// registered. Population must therefore proceed parent-first, which
    /// keeps the hierarchy rooted and acyclic.
    pub fn register(&mut self, def: TypeDef) -> Result<(), TypeError> {
        if self.defs.contains_key(&def.name) {
            return Err(TypeError::Duplicate(def.name));
        }
        match &def.parent {
            Some(parent) if self.defs.contains_key(parent) => {}
            Some(parent) => return Err(TypeError::UnknownParent(parent.clone())),
            // Only the root may omit a parent, and it is created in new().
            None => return Err(TypeError::UnknownParent(def.name.clone())),
        }
        self.defs.insert(def.name.clone(), def);
        Ok(())
    }

    /// Validates a candidate declared type name.
    ///
    /// Returns the definition if the name is registered and concrete.
    /// Every registered type derives from the root (register() enforces
    /// parent-first population), so no chain walk is needed here.
    pub fn validate(&self, name: &str) -> Result<&TypeDef, TypeError> {
        let def = self
            .defs
            .get(name)
            .ok_or_else(|| TypeError::InvalidType(name.to_string()))?;
        if def.is_abstract {
            return Err(TypeError::InvalidType(name.to_string()));
        }
        Ok(def)
    }

    /// Resolves a persisted type name into a live definition.
    ///
    /// Never fails: an empty name means "no declared type" and yields the
    /// root silently; an unknown or abstract name yields the root with a
    /// diagnostic. Load paths rely on this to survive renamed or foreign
    /// type information.
    pub fn resolve(&self, name: &str) -> &TypeDef {
        if name.is_empty() {
            return &self.root;
        }
        match self.validate(name) {
            Ok(def) => def,
            Err(_) => {
                log::warn!(
                    "declared type {name:?} did not resolve; falling back to {:?}",
                    self.root.name
                );
                &self.root
            }
        }
    }

    /// Returns whether a name is registered (abstract or not).
    pub fn contains(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }
}
