//! Live pool registry.
//!
//! Completion paths carry nothing but a [`DescId`]; the table maps its pool
//! id back to the owning pool, with the validate-before-dereference order
//! the id module documents. Pools come and go at runtime (reset, teardown),
//! so the table is the one place that must never hand out a half-destroyed
//! pool: entries are `Arc`s behind an `RwLock`, lookups clone the `Arc`
//! before touching the pool, and a detached pool only leaves the table once
//! it is quiescent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::errors::Error;
use crate::flow::{FlowControlPool, FreeOutcome};
use crate::id::{DescId, MAX_POOLS};
use crate::pool::TxDesc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The pool was quiescent and has been released.
    Released,
    /// Descriptors are still in flight; the pool is `Invalid` and will be
    /// released by the free that returns the last one.
    Deferred,
}

pub struct PoolTable<T: Default = TxDesc> {
    pools: RwLock<Vec<Option<Arc<FlowControlPool<T>>>>>,
    no_pool_drops: AtomicU64,
}

impl<T: Default> PoolTable<T> {
    pub fn new(max_pools: usize) -> Result<Self, Error> {
        if max_pools == 0 || max_pools > MAX_POOLS {
            return Err(Error::BadConfig("pool count exceeds id space"));
        }
        Ok(Self {
            pools: RwLock::new(vec![None; max_pools]),
            no_pool_drops: AtomicU64::new(0),
        })
    }

    /// Publishes a pool under its own pool id.
    pub fn attach(&self, pool: FlowControlPool<T>) -> Result<Arc<FlowControlPool<T>>, Error> {
        let idx = pool.pool_id() as usize;
        let mut pools = self.pools.write().unwrap();
        let slot = pools
            .get_mut(idx)
            .ok_or(Error::BadConfig("pool id beyond table size"))?;
        if slot.is_some() {
            return Err(Error::PoolExists(pool.pool_id()));
        }
        debug!(pool = pool.pool_id(), capacity = pool.capacity(), "pool attached");
        let pool = Arc::new(pool);
        *slot = Some(pool.clone());
        Ok(pool)
    }

    pub fn get(&self, pool_id: u8) -> Option<Arc<FlowControlPool<T>>> {
        self.pools
            .read()
            .unwrap()
            .get(pool_id as usize)
            .and_then(|slot| slot.clone())
    }

    /// Allocation keyed by pool id. An unknown id is counted separately from
    /// pool exhaustion.
    pub fn allocate(&self, pool_id: u8) -> Option<DescId> {
        match self.get(pool_id) {
            Some(pool) => pool.allocate_one(),
            None => {
                self.no_pool_drops.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Re-derives the owning pool from an id, validating every coordinate
    /// against the pool's *current* configuration before anything is
    /// dereferenced: pool id bounds, pool liveness, page id, offset id.
    /// A desynchronized completion path fails soft here.
    pub fn validate(&self, id: DescId) -> Result<Arc<FlowControlPool<T>>, Error> {
        let pool = {
            let pools = self.pools.read().unwrap();
            pools.get(id.pool_id() as usize).and_then(|slot| slot.clone())
        };
        let Some(pool) = pool else {
            warn!(id = id.raw(), pool = id.pool_id(), "lookup against missing pool");
            return Err(Error::NoPool(id.pool_id()));
        };
        if let Err(e) = pool.validate_id(id) {
            warn!(id = id.raw(), pool = id.pool_id(), "id rejected by live pool");
            return Err(e);
        }
        Ok(pool)
    }

    /// Completion-side free by id. Completes a deferred teardown if this was
    /// the last outstanding descriptor of an `Invalid` pool.
    pub fn free(&self, id: DescId) -> Result<(), Error> {
        let pool = self.validate(id)?;
        if pool.free_one(id)? == FreeOutcome::Quiesced {
            self.remove(id.pool_id());
        }
        Ok(())
    }

    /// Tears a pool down, deferring while descriptors are outstanding.
    pub fn detach(&self, pool_id: u8) -> Result<DetachOutcome, Error> {
        let pool = self.get(pool_id).ok_or(Error::NoPool(pool_id))?;
        if pool.mark_invalid() {
            self.remove(pool_id);
            Ok(DetachOutcome::Released)
        } else {
            Ok(DetachOutcome::Deferred)
        }
    }

    fn remove(&self, pool_id: u8) {
        debug!(pool = pool_id, "pool released");
        self.pools.write().unwrap()[pool_id as usize] = None;
    }

    /// Count of allocation attempts against unknown pool ids.
    pub fn no_pool_drops(&self) -> u64 {
        self.no_pool_drops.load(Ordering::Relaxed)
    }
}
