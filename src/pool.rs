//! Fixed-size descriptor pools.
//!
//! A [`DescriptorPool`] hands out fixed-size descriptors from page-backed
//! storage in O(1), under a single per-pool lock. The free list is index
//! based: each free element stores the flat index of the next free element,
//! so no raw pointers survive outside the arena and a stale id can never be
//! dereferenced without first passing bounds validation.
//!
//! Exhaustion is an expected outcome ([`allocate_one`] returns `None` and
//! bumps the drop counter), never a panic.
//!
//! [`allocate_one`]: DescriptorPool::allocate_one

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::arena::PageArena;
use crate::errors::Error;
use crate::hint::unlikely;
use crate::id::{DescId, MAX_ELEMS_PER_PAGE, MAX_PAGES, MAX_POOLS};
use crate::slot::{SlotCell, SlotRefMut};

bitflags! {
    /// Ownership flags carried by every descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u8 {
        const ALLOCATED = 1 << 0;
        const SPECIAL   = 1 << 1;
        const FAST_PATH = 1 << 2;
    }
}

/// Payload of the primary transmit descriptor pools: the frame buffer
/// reference and the flow bookkeeping the completion path needs. Zeroed
/// whenever the descriptor sits on a free list.
#[derive(Debug, Default, Clone)]
pub struct TxDesc {
    pub buf_addr: u64,
    pub buf_len: u32,
    pub flow_id: u16,
    pub vdev_id: u8,
}

pub(crate) struct Desc<T> {
    pub(crate) flags: DescFlags,
    #[allow(dead_code)]
    pub(crate) owner: u8,
    pub(crate) payload: T,
}

pub(crate) const NIL: u32 = u32::MAX;

/// Index-based free list over one arena. Only ever touched under the owning
/// pool's lock.
pub(crate) struct FreeList {
    head: u32,
    links: Box<[u32]>,
    free: usize,
    allocated: usize,
}

impl FreeList {
    /// Links every element in address order: within a page consecutively,
    /// and the last element of page N to the first element of page N+1.
    pub(crate) fn new(capacity: usize, elems_per_page: usize) -> Self {
        let mut links = vec![NIL; capacity].into_boxed_slice();
        let mut prev: Option<usize> = None;
        let pages = capacity.div_ceil(elems_per_page);
        for page in 0..pages {
            let start = page * elems_per_page;
            let end = capacity.min(start + elems_per_page);
            for i in start..end {
                if let Some(p) = prev {
                    links[p] = i as u32;
                }
                prev = Some(i);
            }
        }
        Self {
            head: if capacity > 0 { 0 } else { NIL },
            links,
            free: capacity,
            allocated: 0,
        }
    }

    pub(crate) fn pop(&mut self) -> Option<u32> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        self.head = self.links[idx as usize];
        self.links[idx as usize] = NIL;
        self.free -= 1;
        self.allocated += 1;
        Some(idx)
    }

    pub(crate) fn push(&mut self, idx: u32) {
        // LIFO: the most recently freed descriptor is cache-hot.
        self.links[idx as usize] = self.head;
        self.head = idx;
        self.free += 1;
        self.allocated -= 1;
    }

    /// Detaches exactly `n` nodes from the head, or none at all.
    pub(crate) fn pop_many(&mut self, n: usize, out: &mut Vec<u32>) -> bool {
        if self.free < n {
            return false;
        }
        for _ in 0..n {
            // Cannot fail: free >= n was just checked.
            let idx = self.pop().expect("free list shorter than its count");
            out.push(idx);
        }
        true
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free
    }

    pub(crate) fn allocated_count(&self) -> usize {
        self.allocated
    }

    pub(crate) fn relink(&mut self, elems_per_page: usize) {
        *self = Self::new(self.links.len(), elems_per_page);
    }
}

/// Arena plus identity: everything a pool variant needs besides its lock.
pub(crate) struct PoolCore<T> {
    pool_id: u8,
    special: bool,
    arena: PageArena<SlotCell<Desc<T>>>,
}

impl<T: Default> PoolCore<T> {
    pub(crate) fn build(
        pool_id: u8,
        capacity: usize,
        page_size: usize,
        special: bool,
    ) -> Result<Self, Error> {
        if pool_id as usize >= MAX_POOLS {
            return Err(Error::BadConfig("pool id exceeds id space"));
        }
        let mut arena = PageArena::new(capacity, page_size)?;
        if arena.page_count() > MAX_PAGES {
            return Err(Error::BadConfig("page count exceeds id space"));
        }
        if arena.elems_per_page() > MAX_ELEMS_PER_PAGE {
            return Err(Error::BadConfig("page density exceeds id space"));
        }
        let flags = if special {
            DescFlags::SPECIAL
        } else {
            DescFlags::empty()
        };
        arena.init_with(|_| {
            SlotCell::new(Desc {
                flags,
                owner: pool_id,
                payload: T::default(),
            })
        });
        Ok(Self {
            pool_id,
            special,
            arena,
        })
    }

    pub(crate) fn id_of(&self, flat: u32) -> DescId {
        let page = flat as usize / self.arena.elems_per_page();
        let off = flat as usize % self.arena.elems_per_page();
        DescId::encode(self.special, self.pool_id, page as u8, off as u8)
    }

    /// Bounds validation against the *current* geometry: page id, then
    /// offset id, then the flat index (the last page may be partial).
    pub(crate) fn flat_of(&self, id: DescId) -> Option<u32> {
        if id.pool_id() != self.pool_id || id.special() != self.special {
            return None;
        }
        self.arena
            .index_of(id.page_id() as usize, id.offset_id() as usize)
            .map(|f| f as u32)
    }

    pub(crate) fn validate_id(&self, id: DescId) -> Result<u32, Error> {
        self.flat_of(id).ok_or(Error::IdOutOfRange { id: id.raw() })
    }

    /// Lock must be held: the slot is leaving the free list.
    pub(crate) fn mark_allocated(&self, flat: u32) {
        let mut d = unsafe { self.arena.get(flat as usize).borrow_mut() };
        debug_assert!(
            !d.flags.contains(DescFlags::ALLOCATED),
            "descriptor issued twice"
        );
        d.flags.insert(DescFlags::ALLOCATED);
    }

    /// Lock must be held. Returns false if the descriptor was not allocated
    /// (double free); the caller must not push it in that case.
    pub(crate) fn clear(&self, flat: u32) -> bool {
        let mut d = unsafe { self.arena.get(flat as usize).borrow_mut() };
        if !d.flags.contains(DescFlags::ALLOCATED) {
            return false;
        }
        d.flags.remove(DescFlags::ALLOCATED | DescFlags::FAST_PATH);
        // Stale buffer references must not leak to the next owner.
        d.payload = T::default();
        true
    }

    pub(crate) fn slot(&self, flat: u32) -> &SlotCell<Desc<T>> {
        self.arena.get(flat as usize)
    }

    pub(crate) fn pool_id(&self) -> u8 {
        self.pool_id
    }

    pub(crate) fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub(crate) fn elems_per_page(&self) -> usize {
        self.arena.elems_per_page()
    }

    pub(crate) fn page_count(&self) -> usize {
        self.arena.page_count()
    }
}

/// Occupancy snapshot, observed under the pool lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub allocated: usize,
}

/// A batch of descriptors detached from the free list in one lock
/// acquisition.
#[derive(Debug)]
pub struct DescChain {
    ids: Vec<DescId>,
}

impl DescChain {
    pub(crate) fn from_ids(ids: Vec<DescId>) -> Self {
        Self { ids }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = DescId> + '_ {
        self.ids.iter().copied()
    }

    pub fn as_slice(&self) -> &[DescId] {
        &self.ids
    }
}

impl IntoIterator for DescChain {
    type Item = DescId;
    type IntoIter = std::vec::IntoIter<DescId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.into_iter()
    }
}

/// Exclusive view of an allocated descriptor's payload.
///
/// Obtaining a guard is keyed by ownership of the allocated [`DescId`]; two
/// simultaneous guards for the same descriptor are a caller bug and panic in
/// debug builds.
pub struct DescGuard<'pool, T> {
    inner: SlotRefMut<'pool, Desc<T>>,
}

impl<'pool, T> DescGuard<'pool, T> {
    pub(crate) fn from_slot(inner: SlotRefMut<'pool, Desc<T>>) -> Self {
        Self { inner }
    }

    pub fn flags(&self) -> DescFlags {
        self.inner.flags
    }

    /// Marks the descriptor for the fast completion path.
    pub fn set_fast_path(&mut self, on: bool) {
        self.inner.flags.set(DescFlags::FAST_PATH, on);
    }
}

impl<'pool, T> Deref for DescGuard<'pool, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner.payload
    }
}

impl<'pool, T> DerefMut for DescGuard<'pool, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner.payload
    }
}

pub struct DescriptorPool<T: Default = TxDesc> {
    core: PoolCore<T>,
    list: Mutex<FreeList>,
    no_desc_drops: AtomicU64,
}

impl<T: Default> DescriptorPool<T> {
    /// Allocates the backing pages and links the free list.
    pub fn new(pool_id: u8, capacity: usize, page_size: usize) -> Result<Self, Error> {
        Self::with_options(pool_id, capacity, page_size, false)
    }

    /// As [`new`](DescriptorPool::new), optionally marking the pool special
    /// (ids carry the special-pool flag).
    pub fn with_options(
        pool_id: u8,
        capacity: usize,
        page_size: usize,
        special: bool,
    ) -> Result<Self, Error> {
        let core = PoolCore::build(pool_id, capacity, page_size, special)?;
        let list = FreeList::new(core.capacity(), core.elems_per_page());
        debug!(
            pool = pool_id,
            capacity,
            pages = core.page_count(),
            "descriptor pool ready"
        );
        Ok(Self {
            core,
            list: Mutex::new(list),
            no_desc_drops: AtomicU64::new(0),
        })
    }

    /// Pops one descriptor. `None` means the pool is exhausted, which is a
    /// normal outcome under load; the drop counter records it.
    pub fn allocate_one(&self) -> Option<DescId> {
        let mut list = self.list.lock().unwrap();
        match list.pop() {
            Some(flat) => {
                self.core.mark_allocated(flat);
                Some(self.core.id_of(flat))
            }
            None => {
                self.no_desc_drops.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Detaches exactly `n` descriptors in one lock acquisition, or fails
    /// without allocating any.
    pub fn allocate_many(&self, n: usize) -> Result<DescChain, Error> {
        debug_assert!(n <= self.core.capacity(), "batch larger than pool");
        let mut out = Vec::with_capacity(n);
        let mut list = self.list.lock().unwrap();
        if unlikely(!list.pop_many(n, &mut out)) {
            return Err(Error::Insufficient {
                requested: n,
                available: list.free_count(),
            });
        }
        let ids = out
            .into_iter()
            .map(|flat| {
                self.core.mark_allocated(flat);
                self.core.id_of(flat)
            })
            .collect();
        Ok(DescChain { ids })
    }

    /// Returns a descriptor to the free list, clearing its payload first.
    ///
    /// Freeing an id that is not currently allocated is a contract violation:
    /// debug builds assert, release builds log and leave the free list
    /// untouched.
    pub fn free_one(&self, id: DescId) -> Result<(), Error> {
        let flat = self.core.validate_id(id)?;
        let mut list = self.list.lock().unwrap();
        if unlikely(!self.core.clear(flat)) {
            debug_assert!(false, "free of unallocated descriptor {:#x}", id.raw());
            warn!(pool = self.core.pool_id(), id = id.raw(), "double free ignored");
            return Ok(());
        }
        list.push(flat);
        Ok(())
    }

    /// Bulk return under one lock acquisition.
    pub fn free_many(&self, ids: &[DescId]) -> Result<(), Error> {
        // Validate before taking the lock; a single bad id fails the batch.
        let mut flats = Vec::with_capacity(ids.len());
        for id in ids {
            flats.push(self.core.validate_id(*id)?);
        }
        let mut list = self.list.lock().unwrap();
        for (flat, id) in flats.into_iter().zip(ids) {
            if unlikely(!self.core.clear(flat)) {
                debug_assert!(false, "free of unallocated descriptor {:#x}", id.raw());
                warn!(pool = self.core.pool_id(), id = id.raw(), "double free ignored");
                continue;
            }
            list.push(flat);
        }
        Ok(())
    }

    /// Exclusive access to an allocated descriptor's payload.
    pub fn descriptor(&self, id: DescId) -> Result<DescGuard<'_, T>, Error> {
        let flat = self.core.validate_id(id)?;
        let inner = unsafe { self.core.slot(flat).borrow_mut() };
        if unlikely(!inner.flags.contains(DescFlags::ALLOCATED)) {
            debug_assert!(false, "access to unallocated descriptor {:#x}", id.raw());
            return Err(Error::IdOutOfRange { id: id.raw() });
        }
        Ok(DescGuard { inner })
    }

    pub fn stats(&self) -> PoolStats {
        let list = self.list.lock().unwrap();
        PoolStats {
            capacity: self.core.capacity(),
            free: list.free_count(),
            allocated: list.allocated_count(),
        }
    }

    /// Count of allocation attempts that found the pool exhausted.
    pub fn no_desc_drops(&self) -> u64 {
        self.no_desc_drops.load(Ordering::Relaxed)
    }

    /// True when every descriptor is back on the free list; teardown is only
    /// legal in this state.
    pub fn is_quiescent(&self) -> bool {
        self.list.lock().unwrap().free_count() == self.core.capacity()
    }

    /// Relinks the free list from scratch, e.g. after a hardware reset.
    /// Refuses while descriptors are outstanding.
    pub fn reset(&self) -> Result<(), Error> {
        let mut list = self.list.lock().unwrap();
        if list.allocated_count() != 0 {
            return Err(Error::Busy(self.core.pool_id()));
        }
        list.relink(self.core.elems_per_page());
        Ok(())
    }

    pub fn pool_id(&self) -> u8 {
        self.core.pool_id()
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    pub(crate) fn core(&self) -> &PoolCore<T> {
        &self.core
    }
}
