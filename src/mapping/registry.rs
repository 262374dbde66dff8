use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::error::StorageError;
use crate::record::Record;

use super::TableMapping;

/// Process-wide cache of [`TableMapping`]s, keyed by record type.
///
/// Entries are built lazily on first use; when two threads race to build
/// the same entry the first writer wins and the loser's work is dropped.
/// Connections hold a shared handle to a registry (the global one by
/// default), so tests can substitute a fresh instance.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    map: RwLock<HashMap<TypeId, Arc<TableMapping>>>,
}

impl MappingRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default registry.
    #[must_use]
    pub fn global() -> &'static MappingRegistry {
        static GLOBAL: OnceLock<MappingRegistry> = OnceLock::new();
        GLOBAL.get_or_init(MappingRegistry::new)
    }

    /// The mapping for `T`, building and caching it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidArgument`] when the descriptor
    /// violates a mapping invariant (duplicate names, conflicting index
    /// flags, missing WITHOUT ROWID key, ...).
    pub fn get<T: Record>(&self) -> Result<Arc<TableMapping>, StorageError> {
        let key = TypeId::of::<T>();
        {
            let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(mapping) = map.get(&key) {
                return Ok(Arc::clone(mapping));
            }
        }

        let built = Arc::new(TableMapping::from_descriptor(
            std::any::type_name::<T>(),
            T::table(),
        )?);
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(map.entry(key).or_insert(built)))
    }

    /// Drop every cached mapping. Intended for tests that rebuild
    /// descriptors.
    pub fn clear(&self) {
        self.map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
