// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Name-addressed ring registry.
//!
//! Components never hold pointers to each other's rings; they create a ring
//! under a [`crate::names`] template once and look it up on first use. The
//! registry is part of the switch's root context, not a global.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::Ring;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("ring {0:?} already exists")]
    Exists(String),
    #[error("ring {0:?} not found")]
    NotFound(String),
    #[error("ring {0:?} holds a different element type")]
    TypeMismatch(String),
}

/// Process-wide table of named rings.
#[derive(Default)]
pub struct RingRegistry {
    rings: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl RingRegistry {
    #[must_use]
    pub fn new() -> RingRegistry {
        RingRegistry::default()
    }

    /// Create a ring of `capacity` elements under `name`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Exists`] when the name is taken.
    pub fn create<T: Send + 'static>(
        &self,
        name: &str,
        capacity: usize,
    ) -> Result<Arc<Ring<T>>, RegistryError> {
        let mut rings = self.rings.lock();
        if rings.contains_key(name) {
            return Err(RegistryError::Exists(name.to_string()));
        }
        let ring = Arc::new(Ring::<T>::new(capacity));
        rings.insert(name.to_string(), Arc::clone(&ring) as Arc<dyn Any + Send + Sync>);
        debug!(name, capacity, "created ring");
        Ok(ring)
    }

    /// Look up the ring registered under `name`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] for unknown names,
    /// [`RegistryError::TypeMismatch`] when the element type differs from the
    /// one the ring was created with.
    pub fn lookup<T: Send + 'static>(&self, name: &str) -> Result<Arc<Ring<T>>, RegistryError> {
        let rings = self.rings.lock();
        let entry = rings
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        Arc::clone(entry)
            .downcast::<Ring<T>>()
            .map_err(|_| RegistryError::TypeMismatch(name.to_string()))
    }

    /// Number of registered rings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rings.lock().len()
    }

    /// True when no ring is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rings.lock().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::names;

    #[test]
    fn create_then_lookup() {
        let reg = RingRegistry::new();
        let created = reg
            .create::<u32>(&names::request_ring(0), names::CONTROL_RING_SIZE)
            .unwrap();
        let found = reg.lookup::<u32>(&names::request_ring(0)).unwrap();
        created.enqueue(5).unwrap();
        assert_eq!(found.dequeue(), Some(5));
    }

    #[test]
    fn duplicate_create_rejected() {
        let reg = RingRegistry::new();
        reg.create::<u32>("r", 8).unwrap();
        assert_eq!(
            reg.create::<u32>("r", 8).unwrap_err(),
            RegistryError::Exists("r".into())
        );
    }

    #[test]
    fn unknown_name_and_wrong_type() {
        let reg = RingRegistry::new();
        assert_eq!(
            reg.lookup::<u32>("nope").unwrap_err(),
            RegistryError::NotFound("nope".into())
        );
        reg.create::<u32>("r", 8).unwrap();
        assert_eq!(
            reg.lookup::<String>("r").unwrap_err(),
            RegistryError::TypeMismatch("r".into())
        );
    }
}
