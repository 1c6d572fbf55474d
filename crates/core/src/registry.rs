//! Typed component kinds and the registry of names known to the sync layer.
//!
//! Every component that crosses the wire has a name. Names registered here map
//! to a validator derived from a [`NetComponent`] implementation (or accept any
//! value for opaque kinds); payloads with unknown names are rejected on receipt.

use crate::components::ComponentValue;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors produced when converting dynamic payloads into typed components.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComponentError {
    /// The component name is not registered.
    #[error("unknown component '{0}'")]
    Unknown(String),
    /// A required field is missing.
    #[error("component '{component}' is missing field '{field}'")]
    MissingField {
        /// Component name.
        component: &'static str,
        /// Field name.
        field: &'static str,
    },
    /// A field holds the wrong variant or an out-of-range value.
    #[error("component '{component}' has invalid field '{field}'")]
    InvalidField {
        /// Component name.
        component: &'static str,
        /// Field name.
        field: &'static str,
    },
    /// The top-level value has the wrong shape.
    #[error("component '{0}' has an unexpected shape")]
    Shape(&'static str),
}

/// A statically typed component with a dynamic wire representation.
pub trait NetComponent: Sized {
    /// Component-type name used as the key in payloads.
    const NAME: &'static str;

    /// Convert to the dynamic representation.
    fn to_value(&self) -> ComponentValue;

    /// Parse from the dynamic representation.
    fn from_value(value: &ComponentValue) -> Result<Self, ComponentError>;
}

type Validator = fn(&ComponentValue) -> Result<(), ComponentError>;

fn validate_as<T: NetComponent>(value: &ComponentValue) -> Result<(), ComponentError> {
    T::from_value(value).map(|_| ())
}

fn accept_any(_: &ComponentValue) -> Result<(), ComponentError> {
    Ok(())
}

/// Name to validator mapping for every component the sync layer knows.
#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    kinds: BTreeMap<String, Validator>,
}

impl ComponentRegistry {
    /// Empty registry; every name is unknown.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in kinds (`NetworkIdentity`, `Transform`,
    /// `Velocity`, `PlayerInput`).
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register::<crate::identity::NetworkIdentity>();
        registry.register::<crate::builtin::Transform>();
        registry.register::<crate::builtin::Velocity>();
        registry.register::<crate::builtin::PlayerInput>();
        registry
    }

    /// Register a typed component.
    pub fn register<T: NetComponent>(&mut self) -> &mut Self {
        self.kinds.insert(T::NAME.to_string(), validate_as::<T>);
        self
    }

    /// Register a name whose payload is carried without validation.
    pub fn register_opaque(&mut self, name: impl Into<String>) -> &mut Self {
        self.kinds.insert(name.into(), accept_any);
        self
    }

    /// Returns true if the name is registered.
    pub fn is_known(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }

    /// Validate a payload against its registered kind.
    pub fn validate(&self, name: &str, value: &ComponentValue) -> Result<(), ComponentError> {
        match self.kinds.get(name) {
            Some(validator) => validator(value),
            None => Err(ComponentError::Unknown(name.to_string())),
        }
    }

    /// Registered names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}
