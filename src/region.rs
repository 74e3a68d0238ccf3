//! Region (span) bookkeeping: the process-wide list of OS mappings backing
//! the heap, each carved on creation into one large free block.
//!
//! A region is the unit of `mmap`/`VirtualAlloc`; a block (see
//! [`crate::block`]) is the unit the allocator actually hands out. Regions
//! are chained into a doubly-linked list so the engine can walk every live
//! mapping when searching for free space and so an emptied region can be
//! unlinked in O(1).

use std::mem;
use std::ptr::NonNull;

use crate::block::{self, BlockPtr};
use crate::config::AllocConfig;
use crate::error::AllocError;
use crate::platform;

pub(crate) type RegionPtr = NonNull<RegionHeader>;

/// Header stamped at the base of every region, ahead of its first block.
///
/// `size` is the region's total mapped length, header included, so that
/// [`crate::block::next_adjacent`] can find the region's end without a
/// separate length field. `block_count` is the number of blocks currently
/// in use; it is what the empty-region cache policy inspects to decide
/// whether a region can be handed back to the OS.
#[repr(C)]
pub(crate) struct RegionHeader {
    size: usize,
    block_count: usize,
    free_list_head: Option<BlockPtr>,
    prev: Option<RegionPtr>,
    next: Option<RegionPtr>,
}

/// The padded size of a region header: every region's first block starts
/// this many bytes after the region's base address.
pub(crate) fn header_pad(cfg: &AllocConfig) -> usize {
    block::round_up(mem::size_of::<RegionHeader>(), cfg.alignment)
}

impl RegionHeader {
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn block_count(&self) -> usize {
        self.block_count
    }

    pub(crate) fn increment_block_count(&mut self) {
        self.block_count += 1;
    }

    pub(crate) fn decrement_block_count(&mut self) {
        debug_assert!(self.block_count > 0);
        self.block_count -= 1;
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.block_count == 0
    }

    #[inline]
    pub(crate) fn free_list_head(&self) -> Option<BlockPtr> {
        self.free_list_head
    }

    pub(crate) fn set_free_list_head(&mut self, head: Option<BlockPtr>) {
        self.free_list_head = head;
    }
}

/// Maps a fresh region sized to hold at least `gross` bytes of usable block
/// space, rounds that up to a multiple of the OS page size (floored at
/// `cfg.min_region`), and carves the whole thing into a single free block.
///
/// Returns the region's own pointer; its one free block is reachable via
/// [`RegionHeader::free_list_head`].
pub(crate) fn alloc_region(gross: usize, cfg: &AllocConfig) -> Result<RegionPtr, AllocError> {
    cfg.validate();

    let wanted = header_pad(cfg) + gross;
    let page = platform::page_size();
    let mapped_len = block::round_up(wanted.max(cfg.min_region), page);

    let base = platform::map(mapped_len).ok_or(AllocError::OsMapFailed { requested: mapped_len })?;

    unsafe {
        let mut region: RegionPtr = base.cast();
        region.as_ptr().write(RegionHeader {
            size: mapped_len,
            block_count: 0,
            free_list_head: None,
            prev: None,
            next: None,
        });

        let block_base = NonNull::new_unchecked((base.as_ptr()).add(header_pad(cfg)));
        let block_size = mapped_len - header_pad(cfg);
        let first = block::init_free(block_base, region, block_size, cfg);
        block::prepend_free(first);

        log::trace!(
            "mapped region of {mapped_len} bytes ({block_size} bytes usable) to satisfy a {gross}-byte request"
        );

        Ok(region)
    }
}

/// Unmaps `region` without touching any list it may still be linked into.
/// Used only by tests that build a region in isolation, outside the
/// engine's region list.
#[cfg(test)]
pub(crate) fn free_region_unconditionally(region: RegionPtr) {
    unsafe {
        let len = region.as_ref().size();
        platform::unmap(region.cast(), len);
    }
}

/// Links `region` at the head of the list rooted at `head`, returning the
/// new head.
pub(crate) unsafe fn push_front(head: Option<RegionPtr>, mut region: RegionPtr) -> RegionPtr {
    unsafe {
        region.as_mut().prev = None;
        region.as_mut().next = head;
        if let Some(mut old_head) = head {
            old_head.as_mut().prev = Some(region);
        }
        region
    }
}

/// Unlinks `region` from whatever list it sits in, returning the list's
/// possibly-new head.
pub(crate) unsafe fn unlink(head: Option<RegionPtr>, mut region: RegionPtr) -> Option<RegionPtr> {
    unsafe {
        let (prev, next) = (region.as_ref().prev, region.as_ref().next);
        match prev {
            Some(mut p) => p.as_mut().next = next,
            None => {
                debug_assert!(head == Some(region));
            }
        }
        if let Some(mut n) = next {
            n.as_mut().prev = prev;
        }
        region.as_mut().prev = None;
        region.as_mut().next = None;

        if head == Some(region) { next } else { head }
    }
}

/// Returns `region`'s iterator successor, for list traversal by the engine.
pub(crate) fn next(region: RegionPtr) -> Option<RegionPtr> {
    unsafe { region.as_ref().next }
}

/// The region's first block, found positionally rather than through the free
/// list (which only reaches free blocks). Used to walk every block in a
/// region, free or in use.
pub(crate) fn first_block(region: RegionPtr, cfg: &AllocConfig) -> BlockPtr {
    unsafe { NonNull::new_unchecked((region.as_ptr() as *mut u8).add(header_pad(cfg)) as *mut _) }
}

/// Unmaps `region`. Caller must have already unlinked it from the engine's
/// region list.
pub(crate) unsafe fn release(region: RegionPtr) {
    unsafe {
        let len = region.as_ref().size();
        log::trace!("unmapping empty region of {len} bytes");
        platform::unmap(region.cast(), len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> AllocConfig {
        AllocConfig { min_region: 4096, ..AllocConfig::default() }
    }

    #[test]
    fn fresh_region_has_one_empty_free_block() {
        let cfg = small_cfg();
        let region = alloc_region(64, &cfg).unwrap();
        unsafe {
            assert_eq!(region.as_ref().block_count(), 0);
            assert!(region.as_ref().is_empty());
            let bp = region.as_ref().free_list_head().unwrap();
            assert!(bp.as_ref().is_free());
            assert_eq!(bp.as_ref().size(), region.as_ref().size() - header_pad(&cfg));
            free_region_unconditionally(region);
        }
    }

    #[test]
    fn region_size_is_page_aligned_and_covers_min_region() {
        let cfg = small_cfg();
        let region = alloc_region(64, &cfg).unwrap();
        unsafe {
            let page = platform::page_size();
            assert_eq!(region.as_ref().size() % page, 0);
            assert!(region.as_ref().size() >= cfg.min_region);
            free_region_unconditionally(region);
        }
    }

    #[test]
    fn push_front_and_unlink_maintain_list_links() {
        let cfg = small_cfg();
        let a = alloc_region(64, &cfg).unwrap();
        let b = alloc_region(64, &cfg).unwrap();
        unsafe {
            let mut head = push_front(None, a);
            head = push_front(Some(head), b);
            assert_eq!(head, b);
            assert_eq!(next(b), Some(a));

            let head = unlink(Some(head), b);
            assert_eq!(head, Some(a));
            assert_eq!(next(a), None);

            free_region_unconditionally(a);
            free_region_unconditionally(b);
        }
    }
}
