//! In-process store
//!
//! Used by tests and single-instance development setups. Atomicity comes from
//! DashMap's per-shard entry locking.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::{CasOutcome, KvStore, StoreError};

#[derive(Clone, Default)]
pub struct MemoryStore {
    values: Arc<DashMap<String, String>>,
    sets: Arc<DashMap<String, HashSet<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of plain keys currently held
    pub fn key_count(&self) -> usize {
        self.values.len()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        match self.values.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(value.to_string());
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<CasOutcome, StoreError> {
        match self.values.get_mut(key) {
            None => Ok(CasOutcome::Missing),
            Some(mut current) if current.value() == expected => {
                *current = value.to_string();
                Ok(CasOutcome::Swapped)
            }
            Some(_) => Ok(CasOutcome::Mismatch),
        }
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<CasOutcome, StoreError> {
        match self.values.entry(key.to_string()) {
            Entry::Vacant(_) => Ok(CasOutcome::Missing),
            Entry::Occupied(current) if current.get() == expected => {
                current.remove();
                Ok(CasOutcome::Swapped)
            }
            Entry::Occupied(_) => Ok(CasOutcome::Mismatch),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.values.remove(key).is_some())
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .sets
            .get_mut(set)
            .map(|mut members| members.remove(member))
            .unwrap_or(false))
    }

    async fn set_is_member(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .sets
            .get(set)
            .map(|members| members.contains(member))
            .unwrap_or(false))
    }

    async fn set_len(&self, set: &str) -> Result<usize, StoreError> {
        Ok(self.sets.get(set).map(|members| members.len()).unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
