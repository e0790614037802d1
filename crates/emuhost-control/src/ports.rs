//! Host port reservations
//!
//! Reserved ports live in a single shared set in the store. Membership means
//! "in use"; a successful `SADD` is the only proof of ownership.

use emuhost_proto::MIN_DEVICE_PORT;
use emuhost_store::{KvStore, StoreError};
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::keys::Keyspace;
use crate::retry::RetryPolicy;

const MIN_ATTEMPTS: u64 = 8;
const MAX_ATTEMPTS: u64 = 512;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port in {start}..{end}")]
    Exhausted { start: u16, end: u16 },

    #[error("invalid port range {start}..{end}")]
    InvalidRange { start: u16, end: u16 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Claims and releases unique host ports from `[start, end)`
#[derive(Clone)]
pub struct PortAllocator {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    start: u16,
    end: u16,
    verify_bindable: bool,
    retry: RetryPolicy,
}

impl PortAllocator {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: Keyspace,
        start: u16,
        end: u16,
    ) -> Result<Self, PortError> {
        if start < MIN_DEVICE_PORT || start >= end {
            return Err(PortError::InvalidRange { start, end });
        }

        Ok(Self {
            store,
            keys,
            start,
            end,
            verify_bindable: false,
            retry: RetryPolicy::default(),
        })
    }

    /// Skip candidates that cannot be bound on this host
    pub fn with_bind_check(mut self, enabled: bool) -> Self {
        self.verify_bindable = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    fn range_len(&self) -> u64 {
        u64::from(self.end - self.start)
    }

    /// How many random draws to make when `free` ports remain
    pub fn attempt_budget(range: u64, free: u64) -> u64 {
        if free == 0 {
            return 0;
        }
        (4 * range).div_ceil(free).clamp(MIN_ATTEMPTS, MAX_ATTEMPTS)
    }

    pub async fn reserve(&self) -> Result<u16, PortError> {
        let set = self.keys.reserved_ports();
        let used = self
            .retry
            .run("reserved_count", || self.store.set_len(&set))
            .await? as u64;

        let range = self.range_len();
        let free = range.saturating_sub(used);
        let budget = Self::attempt_budget(range, free);
        if budget == 0 {
            warn!(start = self.start, end = self.end, "Port range exhausted");
            return Err(self.exhausted());
        }

        for attempt in 0..budget {
            let candidate: u16 = rand::thread_rng().gen_range(self.start..self.end);

            if self.verify_bindable && !is_bindable(candidate) {
                debug!(port = candidate, attempt, "Candidate port busy on host, skipping");
                continue;
            }

            let member = candidate.to_string();
            match self.store.set_add(&set, &member).await {
                Ok(true) => {
                    debug!(port = candidate, attempt, "Reserved port");
                    return Ok(candidate);
                }
                Ok(false) => continue,
                Err(e) => {
                    // Whether the add landed is unknown. Removing the member could
                    // free another holder's port, so an applied add stays leaked.
                    warn!(
                        port = candidate,
                        "Reservation outcome unknown, port may stay reserved: {}", e
                    );
                    return Err(e.into());
                }
            }
        }

        warn!(
            start = self.start,
            end = self.end,
            attempts = budget,
            "No free port found within attempt budget"
        );
        Err(self.exhausted())
    }

    /// Releasing a port that is not reserved is a no-op
    pub async fn release(&self, port: u16) -> Result<(), PortError> {
        let set = self.keys.reserved_ports();
        let member = port.to_string();
        let removed = self
            .retry
            .run("release_port", || self.store.set_remove(&set, &member))
            .await?;

        if removed {
            info!(port, "Released port");
        }
        Ok(())
    }

    pub async fn is_reserved(&self, port: u16) -> Result<bool, PortError> {
        let set = self.keys.reserved_ports();
        let member = port.to_string();
        Ok(self
            .retry
            .run("is_reserved", || self.store.set_is_member(&set, &member))
            .await?)
    }

    pub async fn reserved_count(&self) -> Result<usize, PortError> {
        let set = self.keys.reserved_ports();
        Ok(self
            .retry
            .run("reserved_count", || self.store.set_len(&set))
            .await?)
    }

    fn exhausted(&self) -> PortError {
        PortError::Exhausted {
            start: self.start,
            end: self.end,
        }
    }
}

fn is_bindable(port: u16) -> bool {
    use std::net::{Ipv4Addr, SocketAddr, TcpListener};

    TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).is_ok()
}
