//! Compact descriptor identity.
//!
//! Hardware completion events carry nothing but a small integer; [`DescId`]
//! packs enough coordinates into 21 bits to relocate the descriptor without a
//! hash table: a special-pool flag, a pool id, a page id, and an offset
//! within the page. Encoding is pure bit-packing; bounds validation against
//! the live pool configuration happens in
//! [`PoolTable::validate`](crate::table::PoolTable::validate), never here.

const OFFSET_BITS: u32 = 8;
const PAGE_BITS: u32 = 7;
const POOL_BITS: u32 = 5;

const PAGE_SHIFT: u32 = OFFSET_BITS;
const POOL_SHIFT: u32 = OFFSET_BITS + PAGE_BITS;
const SPECIAL_SHIFT: u32 = OFFSET_BITS + PAGE_BITS + POOL_BITS;

/// Upper bounds implied by the id layout. Pool construction refuses
/// configurations that cannot be encoded.
pub const MAX_POOLS: usize = 1 << POOL_BITS;
pub const MAX_PAGES: usize = 1 << PAGE_BITS;
pub const MAX_ELEMS_PER_PAGE: usize = 1 << OFFSET_BITS;

/// Opaque descriptor id crossing the boundary toward completion paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescId(u32);

impl DescId {
    pub fn encode(special: bool, pool_id: u8, page_id: u8, offset_id: u8) -> Self {
        debug_assert!((pool_id as usize) < MAX_POOLS);
        debug_assert!((page_id as usize) < MAX_PAGES);
        Self(
            (special as u32) << SPECIAL_SHIFT
                | (pool_id as u32) << POOL_SHIFT
                | (page_id as u32) << PAGE_SHIFT
                | offset_id as u32,
        )
    }

    pub fn special(self) -> bool {
        self.0 >> SPECIAL_SHIFT & 1 != 0
    }

    pub fn pool_id(self) -> u8 {
        (self.0 >> POOL_SHIFT & (MAX_POOLS as u32 - 1)) as u8
    }

    pub fn page_id(self) -> u8 {
        (self.0 >> PAGE_SHIFT & (MAX_PAGES as u32 - 1)) as u8
    }

    pub fn offset_id(self) -> u8 {
        (self.0 & (MAX_ELEMS_PER_PAGE as u32 - 1)) as u8
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for DescId {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

impl From<DescId> for u32 {
    fn from(val: DescId) -> u32 {
        val.0
    }
}
