//! Auxiliary descriptor pools.
//!
//! The transmit path owns several secondary fixed-size entity types beyond
//! the primary descriptor: scatter-gather extensions, TSO segment
//! descriptors, TSO segment-count trackers and multicast-enhancement buffer
//! blocks. They all reuse the [`DescriptorPool`] discipline, each in its own
//! pool-id namespace, with no flow-control coupling.
//!
//! A [`PoolGroup`] adds the pool-id override indirection: several logical
//! producers (typically one per hardware ring) can share one physical pool
//! when N small pools would be wasteful. The override is resolved once per
//! call and is identical for allocate and free of the same logical object.

use crate::errors::Error;
use crate::id::DescId;
use crate::pool::{DescChain, DescGuard, DescriptorPool, PoolStats};

pub const MAX_SG_FRAGS: usize = 6;

/// One fragment of a scattered frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct SgFrag {
    pub addr: u64,
    pub len: u32,
}

/// Scatter-gather extension descriptor.
#[derive(Debug, Default, Clone)]
pub struct SgExt {
    pub frag_cnt: u8,
    pub frags: [SgFrag; MAX_SG_FRAGS],
}

/// One TSO segment: the slice of the original frame a single MSS-sized
/// transmission covers.
#[derive(Debug, Default, Clone)]
pub struct TsoSeg {
    pub mss: u16,
    pub seg_len: u32,
    pub tcp_seq: u32,
    pub frag_cnt: u8,
    pub frags: [SgFrag; MAX_SG_FRAGS],
}

/// Tracks how many segments of one TSO send are still in flight.
#[derive(Debug, Default, Clone, Copy)]
pub struct TsoNumSeg {
    pub num_segs: u16,
}

pub const ME_BUF_LEN: usize = 64;

/// Multicast-enhancement buffer block; holds a rewritten frame header.
#[derive(Debug, Clone)]
pub struct MeBuf {
    pub data: [u8; ME_BUF_LEN],
}

impl Default for MeBuf {
    fn default() -> Self {
        Self {
            data: [0; ME_BUF_LEN],
        }
    }
}

/// A family of physical pools plus the logical-to-physical override map.
pub struct PoolGroup<T: Default> {
    pools: Vec<DescriptorPool<T>>,
    overrides: Box<[u8]>,
}

impl<T: Default> PoolGroup<T> {
    /// `overrides[logical]` names the physical pool serving that logical
    /// producer. Every entry must reference an existing pool.
    pub fn new(pools: Vec<DescriptorPool<T>>, overrides: Vec<u8>) -> Result<Self, Error> {
        if pools.is_empty() {
            return Err(Error::BadConfig("pool group needs at least one pool"));
        }
        for &phys in &overrides {
            if phys as usize >= pools.len() {
                return Err(Error::BadConfig("override names a missing pool"));
            }
        }
        Ok(Self {
            pools,
            overrides: overrides.into_boxed_slice(),
        })
    }

    /// One physical pool shared by `logical_count` producers.
    pub fn shared(pool: DescriptorPool<T>, logical_count: usize) -> Result<Self, Error> {
        Self::new(vec![pool], vec![0; logical_count])
    }

    /// One physical pool per producer, no sharing.
    pub fn dedicated(pools: Vec<DescriptorPool<T>>) -> Result<Self, Error> {
        let overrides = (0..pools.len() as u8).collect();
        Self::new(pools, overrides)
    }

    fn resolve(&self, logical: u8) -> Result<&DescriptorPool<T>, Error> {
        let phys = *self
            .overrides
            .get(logical as usize)
            .ok_or(Error::NoPool(logical))?;
        Ok(&self.pools[phys as usize])
    }

    pub fn allocate(&self, logical: u8) -> Result<Option<DescId>, Error> {
        Ok(self.resolve(logical)?.allocate_one())
    }

    pub fn allocate_many(&self, logical: u8, n: usize) -> Result<DescChain, Error> {
        self.resolve(logical)?.allocate_many(n)
    }

    pub fn free(&self, logical: u8, id: DescId) -> Result<(), Error> {
        self.resolve(logical)?.free_one(id)
    }

    pub fn free_many(&self, logical: u8, ids: &[DescId]) -> Result<(), Error> {
        self.resolve(logical)?.free_many(ids)
    }

    pub fn descriptor(&self, logical: u8, id: DescId) -> Result<DescGuard<'_, T>, Error> {
        self.resolve(logical)?.descriptor(id)
    }

    pub fn stats(&self, logical: u8) -> Result<PoolStats, Error> {
        Ok(self.resolve(logical)?.stats())
    }
}

/// The full auxiliary family, one group per entity type.
pub struct AuxPools {
    pub sg_ext: PoolGroup<SgExt>,
    pub tso_seg: PoolGroup<TsoSeg>,
    pub tso_num_seg: PoolGroup<TsoNumSeg>,
    pub me_buf: PoolGroup<MeBuf>,
}

/// Sizing for the auxiliary family. `rings` is the number of logical
/// producers; with `share_pools` they all resolve to one physical pool per
/// entity type.
#[derive(Debug, Clone)]
pub struct AuxConfig {
    pub rings: usize,
    pub share_pools: bool,
    pub sg_ext_count: usize,
    pub tso_seg_count: usize,
    pub tso_num_seg_count: usize,
    pub me_buf_count: usize,
    pub page_size: usize,
}

impl AuxPools {
    pub fn with_config(cfg: &AuxConfig) -> Result<Self, Error> {
        if cfg.rings == 0 {
            return Err(Error::BadConfig("ring count must be non-zero"));
        }
        Ok(Self {
            sg_ext: build_group(cfg, cfg.sg_ext_count)?,
            tso_seg: build_group(cfg, cfg.tso_seg_count)?,
            tso_num_seg: build_group(cfg, cfg.tso_num_seg_count)?,
            me_buf: build_group(cfg, cfg.me_buf_count)?,
        })
    }
}

fn build_group<T: Default>(cfg: &AuxConfig, count: usize) -> Result<PoolGroup<T>, Error> {
    if cfg.share_pools {
        let pool = DescriptorPool::new(0, count, cfg.page_size)?;
        PoolGroup::shared(pool, cfg.rings)
    } else {
        let pools = (0..cfg.rings)
            .map(|i| DescriptorPool::new(i as u8, count, cfg.page_size))
            .collect::<Result<Vec<_>, _>>()?;
        PoolGroup::dedicated(pools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(share: bool) -> AuxConfig {
        AuxConfig {
            rings: 3,
            share_pools: share,
            sg_ext_count: 16,
            tso_seg_count: 16,
            tso_num_seg_count: 16,
            me_buf_count: 16,
            page_size: 4096,
        }
    }

    #[test]
    fn shared_group_serves_every_logical_producer() {
        let aux = AuxPools::with_config(&cfg(true)).unwrap();

        // All three producers draw from the same 16 elements.
        let a = aux.sg_ext.allocate(0).unwrap().unwrap();
        let b = aux.sg_ext.allocate(1).unwrap().unwrap();
        let c = aux.sg_ext.allocate(2).unwrap().unwrap();
        assert_eq!(aux.sg_ext.stats(0).unwrap().allocated, 3);
        assert_eq!(aux.sg_ext.stats(2).unwrap().allocated, 3);

        // Free through a different logical id than allocate: the override
        // resolves to the same physical pool either way.
        aux.sg_ext.free(2, a).unwrap();
        aux.sg_ext.free(0, b).unwrap();
        aux.sg_ext.free(1, c).unwrap();
        assert_eq!(aux.sg_ext.stats(1).unwrap().free, 16);
    }

    #[test]
    fn dedicated_groups_are_independent() {
        let aux = AuxPools::with_config(&cfg(false)).unwrap();

        let chain = aux.tso_seg.allocate_many(1, 16).unwrap();
        assert_eq!(aux.tso_seg.stats(1).unwrap().free, 0);
        // Ring 0 is untouched by ring 1's exhaustion.
        assert_eq!(aux.tso_seg.stats(0).unwrap().free, 16);
        assert!(aux.tso_seg.allocate(1).unwrap().is_none());
        assert!(aux.tso_seg.allocate(0).unwrap().is_some());

        let ids: Vec<_> = chain.into_iter().collect();
        aux.tso_seg.free_many(1, &ids).unwrap();
        assert_eq!(aux.tso_seg.stats(1).unwrap().free, 16);
    }

    #[test]
    fn payloads_are_typed_per_entity() {
        let aux = AuxPools::with_config(&cfg(true)).unwrap();

        let seg = aux.tso_seg.allocate(0).unwrap().unwrap();
        {
            let mut d = aux.tso_seg.descriptor(0, seg).unwrap();
            d.mss = 1460;
            d.frag_cnt = 2;
            d.frags[0] = SgFrag { addr: 0x1000, len: 512 };
        }
        let tracker = aux.tso_num_seg.allocate(0).unwrap().unwrap();
        aux.tso_num_seg.descriptor(0, tracker).unwrap().num_segs = 11;

        aux.tso_seg.free(0, seg).unwrap();
        aux.tso_num_seg.free(0, tracker).unwrap();

        // Cleared on free.
        let seg2 = aux.tso_seg.allocate(0).unwrap().unwrap();
        assert_eq!(aux.tso_seg.descriptor(0, seg2).unwrap().mss, 0);
        aux.tso_seg.free(0, seg2).unwrap();
    }

    #[test]
    fn unknown_logical_id_is_rejected() {
        let aux = AuxPools::with_config(&cfg(true)).unwrap();
        assert!(matches!(aux.me_buf.allocate(7), Err(Error::NoPool(7))));
        assert!(matches!(
            aux.me_buf.free(9, DescId::encode(false, 0, 0, 0)),
            Err(Error::NoPool(9))
        ));
    }

    #[test]
    fn override_map_must_name_existing_pools() {
        let pool: DescriptorPool<MeBuf> = DescriptorPool::new(0, 8, 4096).unwrap();
        assert!(matches!(
            PoolGroup::new(vec![pool], vec![0, 1]),
            Err(Error::BadConfig(_))
        ));
    }
}
