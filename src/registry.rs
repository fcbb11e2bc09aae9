/// Session-wide map of discovered peripherals
use log::warn;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::models::Peripheral;

#[derive(Debug, Default)]
struct RegistryInner {
    order: Vec<String>,
    entries: HashMap<String, Peripheral>,
}

/// Peripheral registry shared by the dispatcher, state machine and display
///
/// Cloning yields another handle onto the same registry. Every mutation goes
/// through `upsert`, which replaces the whole entry under one lock so readers
/// only ever see complete values. Entries are never removed.
#[derive(Debug, Clone, Default)]
pub struct PeripheralRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl PeripheralRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `patch` to the current value for `id` and store the result
    ///
    /// A default `Peripheral` is patched when `id` has not been seen yet.
    /// The stored value never has `connecting` and `connected` both set.
    ///
    /// # Arguments
    /// * `id` - Peripheral identifier, the registry key
    /// * `patch` - Produces the new value from the current one
    ///
    /// # Returns
    /// The value now stored for `id`
    pub fn upsert<F>(&self, id: &str, patch: F) -> Peripheral
    where
        F: FnOnce(Peripheral) -> Peripheral,
    {
        let mut inner = self.lock();
        let current = inner
            .entries
            .get(id)
            .cloned()
            .unwrap_or_else(|| Peripheral::new(id));

        let mut next = patch(current);
        next.id = id.to_string();
        if next.connecting && next.connected {
            warn!("{} patched as both connecting and connected, keeping connected", id);
            next.connecting = false;
        }

        if !inner.entries.contains_key(id) {
            inner.order.push(id.to_string());
        }
        inner.entries.insert(id.to_string(), next.clone());
        next
    }

    pub fn get(&self, id: &str) -> Option<Peripheral> {
        self.lock().entries.get(id).cloned()
    }

    /// Point-in-time copy in first-discovery order
    pub fn snapshot(&self) -> Vec<Peripheral> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
