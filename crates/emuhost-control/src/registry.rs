//! Device records in the shared store
//!
//! Registration is a single conditional set. Status changes are
//! read → validate → compare-and-swap against the exact bytes read, so two
//! writers can never interleave a transition the state machine forbids.

use emuhost_proto::{DeviceId, DeviceRecord, DeviceStatus, InvalidTransition};
use emuhost_store::{CasOutcome, KvStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::keys::Keyspace;
use crate::retry::RetryPolicy;

/// Compare-and-swap attempts before giving up under contention
const MAX_CAS_ATTEMPTS: usize = 16;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device {0} already exists")]
    AlreadyExists(DeviceId),

    #[error("device {0} not found")]
    NotFound(DeviceId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("device {0} is being modified concurrently")]
    Contention(DeviceId),

    #[error("stored record is unreadable: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct DeviceRegistry {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    retry: RetryPolicy,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn KvStore>, keys: Keyspace) -> Self {
        Self {
            store,
            keys,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn register(&self, record: &DeviceRecord) -> Result<(), RegistryError> {
        let key = self.keys.device(&record.device_id);
        let value = encode(record)?;

        if !self.store.set_if_absent(&key, &value).await? {
            return Err(RegistryError::AlreadyExists(record.device_id.clone()));
        }

        info!(device_id = %record.device_id, port = record.port, "Device registered");
        Ok(())
    }

    pub async fn get(&self, id: &DeviceId) -> Result<DeviceRecord, RegistryError> {
        self.find(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    pub async fn find(&self, id: &DeviceId) -> Result<Option<DeviceRecord>, RegistryError> {
        match self.read_raw(id).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Idempotent
    pub async fn delete(&self, id: &DeviceId) -> Result<(), RegistryError> {
        let key = self.keys.device(id);
        let existed = self
            .retry
            .run("delete_device", || self.store.delete(&key))
            .await?;

        if existed {
            info!(device_id = %id, "Device record removed");
        }
        Ok(())
    }

    /// Delete the record only if it still equals `expected`. Returns `true` if removed.
    pub async fn delete_if_unchanged(&self, expected: &DeviceRecord) -> Result<bool, RegistryError> {
        let key = self.keys.device(&expected.device_id);
        let raw = encode(expected)?;

        Ok(matches!(
            self.store.compare_and_delete(&key, &raw).await?,
            CasOutcome::Swapped
        ))
    }

    pub async fn update_status(
        &self,
        id: &DeviceId,
        status: DeviceStatus,
    ) -> Result<DeviceRecord, RegistryError> {
        let record = self
            .modify(id, |record| {
                record.status = record.status.transition_to(status)?;
                Ok(())
            })
            .await?;

        debug!(device_id = %id, status = %status, "Device status updated");
        Ok(record)
    }

    /// Move the device to `Error` and record why. A device already in `Error`
    /// only has its reason replaced.
    pub async fn mark_error(
        &self,
        id: &DeviceId,
        reason: &str,
    ) -> Result<DeviceRecord, RegistryError> {
        let record = self
            .modify(id, |record| {
                if record.status != DeviceStatus::Error {
                    record.status = record.status.transition_to(DeviceStatus::Error)?;
                }
                record.error = Some(reason.to_string());
                Ok(())
            })
            .await?;

        warn!(device_id = %id, reason, "Device marked as error");
        Ok(record)
    }

    async fn modify<F>(&self, id: &DeviceId, mut change: F) -> Result<DeviceRecord, RegistryError>
    where
        F: FnMut(&mut DeviceRecord) -> Result<(), RegistryError>,
    {
        let key = self.keys.device(id);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self
                .read_raw(id)
                .await?
                .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

            let mut record = decode(&raw)?;
            change(&mut record)?;
            let updated = encode(&record)?;

            match self.store.compare_and_swap(&key, &raw, &updated).await? {
                CasOutcome::Swapped => return Ok(record),
                CasOutcome::Missing => return Err(RegistryError::NotFound(id.clone())),
                CasOutcome::Mismatch => {
                    debug!(device_id = %id, "Concurrent modification, re-reading record");
                }
            }
        }

        Err(RegistryError::Contention(id.clone()))
    }

    async fn read_raw(&self, id: &DeviceId) -> Result<Option<String>, RegistryError> {
        let key = self.keys.device(id);
        Ok(self
            .retry
            .run("get_device", || self.store.get(&key))
            .await?)
    }
}

fn encode(record: &DeviceRecord) -> Result<String, RegistryError> {
    serde_json::to_string(record).map_err(|e| RegistryError::Corrupt(e.to_string()))
}

fn decode(raw: &str) -> Result<DeviceRecord, RegistryError> {
    serde_json::from_str(raw).map_err(|e| RegistryError::Corrupt(e.to_string()))
}
