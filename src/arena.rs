//! Page-backed element storage.
//!
//! A [`PageArena`] owns a set of fixed-size, page-aligned memory blocks and
//! carves each into elements of type `E`. Spanning several small pages avoids
//! asking the OS for one large contiguous region, which is the same trick the
//! hardware-facing descriptor rings play. Every element is addressable as
//! `(page_id, offset_id)` and the per-page base addresses stay stable for the
//! lifetime of the arena.

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use libc::{_SC_PAGESIZE, sysconf};
use tracing::debug;

use crate::errors::Error;

/// OS page size, used for page alignment of the backing blocks.
pub fn os_page_size() -> usize {
    let sz = unsafe { sysconf(_SC_PAGESIZE) };
    if sz <= 0 { 4096 } else { sz as usize }
}

pub struct PageArena<E> {
    pages: Vec<NonNull<u8>>,
    layout: Layout,
    page_size: usize,
    elems_per_page: usize,
    capacity: usize,
    initialized: bool,
    _marker: PhantomData<E>,
}

impl<E> PageArena<E> {
    /// Allocates enough pages of `page_size` bytes to hold `capacity`
    /// elements. The memory is uninitialized until [`init_with`] runs.
    ///
    /// [`init_with`]: PageArena::init_with
    pub fn new(capacity: usize, page_size: usize) -> Result<Self, Error> {
        let elem_size = mem::size_of::<E>();
        if capacity == 0 {
            return Err(Error::BadConfig("element count must be non-zero"));
        }
        if elem_size == 0 || elem_size > page_size {
            return Err(Error::BadConfig("element size exceeds page size"));
        }
        let elems_per_page = page_size / elem_size;
        let page_count = capacity.div_ceil(elems_per_page);

        let align = os_page_size().max(mem::align_of::<E>());
        let layout = Layout::from_size_align(page_size, align)
            .map_err(|_| Error::BadConfig("bad page layout"))?;

        let mut pages = Vec::with_capacity(page_count);
        for _ in 0..page_count {
            let ptr = unsafe { alloc::alloc(layout) };
            match NonNull::new(ptr) {
                Some(p) => pages.push(p),
                None => {
                    for p in &pages {
                        unsafe { alloc::dealloc(p.as_ptr(), layout) };
                    }
                    return Err(Error::NoMemoryPages {
                        requested: page_count,
                    });
                }
            }
        }

        debug!(
            pages = page_count,
            page_size, elems_per_page, capacity, "arena allocated"
        );

        Ok(Self {
            pages,
            layout,
            page_size,
            elems_per_page,
            capacity,
            initialized: false,
            _marker: PhantomData,
        })
    }

    /// Writes every element in address order. Must run exactly once before
    /// any lookup.
    pub fn init_with(&mut self, mut f: impl FnMut(usize) -> E) {
        assert!(!self.initialized, "arena initialized twice");
        for flat in 0..self.capacity {
            unsafe { self.slot_ptr(flat).write(f(flat)) };
        }
        self.initialized = true;
    }

    fn slot_ptr(&self, flat: usize) -> *mut E {
        let page = flat / self.elems_per_page;
        let off = flat % self.elems_per_page;
        unsafe { self.pages[page].as_ptr().cast::<E>().add(off) }
    }

    /// Element lookup by flat index. Callers validate the index against
    /// [`capacity`](PageArena::capacity) beforehand (decode does this).
    pub fn get(&self, flat: usize) -> &E {
        debug_assert!(self.initialized);
        assert!(flat < self.capacity, "arena index out of range");
        unsafe { &*self.slot_ptr(flat) }
    }

    /// Maps `(page_id, offset_id)` to a flat index, rejecting coordinates
    /// outside the arena. The last page may be partially populated, which is
    /// why the flat bound is checked as well.
    pub fn index_of(&self, page_id: usize, offset_id: usize) -> Option<usize> {
        if page_id >= self.pages.len() || offset_id >= self.elems_per_page {
            return None;
        }
        let flat = page_id * self.elems_per_page + offset_id;
        (flat < self.capacity).then_some(flat)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn elems_per_page(&self) -> usize {
        self.elems_per_page
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Base address of every page, in page order. Stable for the arena's
    /// lifetime; the DMA mapping layer keys off these.
    pub fn base_addrs(&self) -> Vec<usize> {
        self.pages.iter().map(|p| p.as_ptr() as usize).collect()
    }
}

impl<E> Drop for PageArena<E> {
    fn drop(&mut self) {
        if self.initialized {
            for flat in 0..self.capacity {
                unsafe { ptr::drop_in_place(self.slot_ptr(flat)) };
            }
        }
        for p in &self.pages {
            unsafe { alloc::dealloc(p.as_ptr(), self.layout) };
        }
    }
}

unsafe impl<E: Send> Send for PageArena<E> {}
unsafe impl<E: Sync> Sync for PageArena<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_multiple_pages() {
        let mut arena: PageArena<u64> = PageArena::new(1000, 4096).unwrap();
        // 4096 / 8 = 512 elements per page -> two pages.
        assert_eq!(arena.elems_per_page(), 512);
        assert_eq!(arena.page_count(), 2);
        assert_eq!(arena.capacity(), 1000);

        arena.init_with(|i| i as u64);
        assert_eq!(*arena.get(0), 0);
        assert_eq!(*arena.get(511), 511);
        assert_eq!(*arena.get(512), 512); // first element of page 1
        assert_eq!(*arena.get(999), 999);
    }

    #[test]
    fn element_addresses_follow_page_bases() {
        let mut arena: PageArena<u64> = PageArena::new(1024, 4096).unwrap();
        arena.init_with(|_| 0);
        let bases = arena.base_addrs();
        assert_eq!(bases.len(), 2);
        let second = arena.get(512) as *const u64 as usize;
        assert_eq!(second, bases[1]);
        let third = arena.get(514) as *const u64 as usize;
        assert_eq!(third, bases[1] + 2 * mem::size_of::<u64>());
    }

    #[test]
    fn partial_last_page_bounds() {
        let mut arena: PageArena<u64> = PageArena::new(520, 4096).unwrap();
        arena.init_with(|_| 0);
        assert_eq!(arena.page_count(), 2);
        assert_eq!(arena.index_of(1, 7), Some(519));
        // page 1 offset 8 would be flat index 520: past capacity
        assert_eq!(arena.index_of(1, 8), None);
        assert_eq!(arena.index_of(2, 0), None);
        assert_eq!(arena.index_of(0, 512), None);
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(
            PageArena::<u64>::new(0, 4096),
            Err(Error::BadConfig(_))
        ));
    }

    #[test]
    fn rejects_oversized_element() {
        assert!(matches!(
            PageArena::<[u8; 8192]>::new(4, 4096),
            Err(Error::BadConfig(_))
        ));
    }
}
