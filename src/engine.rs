//! The allocator proper: first-fit search across the region list, the
//! four public heap operations, and the empty-region cache policy.
//!
//! `Engine` itself holds no lock; it assumes exclusive access for the
//! duration of every call. [`crate::Heap`] is what actually makes it safe
//! to share across threads, by wrapping one `Engine` in a `Mutex`.

use std::ptr::NonNull;

use crate::block::{self, BlockPtr};
use crate::config::AllocConfig;
use crate::error::AllocError;
use crate::region::{self, RegionPtr};

pub(crate) struct Engine {
    cfg: AllocConfig,
    regions: Option<RegionPtr>,
}

// Safety: every access to an `Engine` is serialised by the `Mutex` in
// `crate::Heap`; nothing here is ever touched from two threads at once.
unsafe impl Send for Engine {}

impl Engine {
    pub(crate) const fn new(cfg: AllocConfig) -> Self {
        Self { cfg, regions: None }
    }

    /// Serves a request for `n` usable bytes, mapping a fresh region if no
    /// free block is large enough.
    pub(crate) fn allocate(&mut self, n: usize) -> Option<NonNull<u8>> {
        let gross = block::gross_size(n, &self.cfg);
        let free = self.find_free(gross).or_else(|| self.grow(gross))?;
        let used = unsafe { block::alloc_from(free, gross, &self.cfg) };
        log::trace!("allocate({n}) -> gross {gross}");
        Some(block::payload_of(used, &self.cfg))
    }

    /// Releases a payload pointer previously returned by [`Self::allocate`]
    /// (or [`Self::resize`]). `p = None` is a no-op, mirroring `free(NULL)`.
    pub(crate) fn release(&mut self, p: Option<NonNull<u8>>) {
        let Some(p) = p else { return };
        let bp = block::block_of(p, &self.cfg);
        unsafe {
            self.poison(bp);
            block::free_block(bp, &self.cfg);
            let merged = block::coalesce(bp, &self.cfg);
            self.retire_if_empty(merged);
        }
        log::trace!("release");
    }

    /// Allocates space for `count` elements of `elem_size` bytes each,
    /// zeroed, checking for multiplication overflow first.
    pub(crate) fn zero_allocate(&mut self, count: usize, elem_size: usize) -> Option<NonNull<u8>> {
        let total = count
            .checked_mul(elem_size)
            .ok_or(AllocError::SizeOverflow)
            .inspect_err(|e| log::warn!("zero_allocate({count}, {elem_size}) failed: {e}"))
            .ok()?;
        let p = self.allocate(total)?;
        let served = block::payload_size(block::block_of(p, &self.cfg), &self.cfg);
        unsafe { p.as_ptr().write_bytes(0, served) };
        Some(p)
    }

    /// Resizes the allocation at `p` to `n` bytes, per the five-case
    /// dispatch: no pointer yet, truncate in place, no-op, extend in place,
    /// or allocate-copy-release.
    pub(crate) fn resize(&mut self, p: Option<NonNull<u8>>, n: usize) -> Option<NonNull<u8>> {
        let Some(p) = p else { return self.allocate(n) };

        let bp = block::block_of(p, &self.cfg);
        let gross = block::gross_size(n, &self.cfg);
        let current = unsafe { bp.as_ref().size() };

        if gross == current {
            return Some(p);
        }
        if gross < current {
            return Some(self.truncate_in_place(bp, gross));
        }
        if let Some(grown) = self.try_extend_in_place(bp, gross) {
            return Some(grown);
        }

        let old_payload_size = block::payload_size(bp, &self.cfg);
        let new_p = self.allocate(n)?;
        unsafe {
            let copy_len = old_payload_size.min(n);
            new_p.as_ptr().copy_from_nonoverlapping(p.as_ptr(), copy_len);
        }
        self.release(Some(p));
        Some(new_p)
    }

    /// True if `p` was not handed out by this engine. The adapter uses this
    /// to decide whether a `realloc`/`dealloc` call should be rejected
    /// rather than corrupt foreign memory.
    pub(crate) fn is_foreign(&self, p: NonNull<u8>) -> bool {
        let addr = p.as_ptr() as usize;
        let mut cur = self.regions;
        while let Some(region) = cur {
            unsafe {
                let base = region.as_ptr() as usize;
                let end = base + region.as_ref().size();
                if addr >= base && addr < end {
                    return false;
                }
            }
            cur = region::next(region);
        }
        true
    }

    fn find_free(&self, gross: usize) -> Option<BlockPtr> {
        let mut cur = self.regions;
        while let Some(region) = cur {
            let mut candidate = unsafe { region.as_ref().free_list_head() };
            while let Some(bp) = candidate {
                unsafe {
                    if bp.as_ref().size() >= gross {
                        return Some(bp);
                    }
                    candidate = bp.as_ref().next_free();
                }
            }
            cur = region::next(region);
        }
        None
    }

    fn grow(&mut self, gross: usize) -> Option<BlockPtr> {
        let region = region::alloc_region(gross, &self.cfg)
            .inspect_err(|e| log::warn!("region growth failed: {e}"))
            .ok()?;
        unsafe {
            self.regions = Some(region::push_front(self.regions, region));
            Some(region.as_ref().free_list_head().unwrap())
        }
    }

    fn truncate_in_place(&mut self, bp: BlockPtr, gross: usize) -> NonNull<u8> {
        unsafe {
            let current = bp.as_ref().size();
            let residual = current - gross;
            if residual < self.cfg.min_block {
                return block::payload_of(bp, &self.cfg);
            }

            let owner = bp.as_ref().owner();
            let split_addr = (bp.as_ptr() as *mut u8).add(gross);
            let mut shrunk = bp;
            shrunk.as_mut().set_size_for_resize(gross);

            let mut residual_block =
                block::init_free(NonNull::new_unchecked(split_addr), owner, residual, &self.cfg);
            residual_block.as_mut().set_prev_used();
            block::prepend_free(residual_block);
            if let Some(mut next) = block::next_adjacent(residual_block, &self.cfg) {
                next.as_mut().set_prev_free();
            }
            let merged = block::coalesce(residual_block, &self.cfg);
            self.retire_if_empty(merged);

            block::payload_of(shrunk, &self.cfg)
        }
    }

    fn try_extend_in_place(&mut self, bp: BlockPtr, gross: usize) -> Option<NonNull<u8>> {
        unsafe {
            let next = block::next_adjacent(bp, &self.cfg)?;
            if !next.as_ref().is_free() {
                return None;
            }
            let combined = bp.as_ref().size() + next.as_ref().size();
            if combined < gross {
                return None;
            }

            block::sever_free(next);
            let owner = bp.as_ref().owner();
            let mut grown = bp;

            if combined - gross >= self.cfg.min_block {
                grown.as_mut().set_size_for_resize(gross);
                let residual_size = combined - gross;
                let residual_addr = (grown.as_ptr() as *mut u8).add(gross);
                let mut residual =
                    block::init_free(NonNull::new_unchecked(residual_addr), owner, residual_size, &self.cfg);
                residual.as_mut().set_prev_used();
                block::prepend_free(residual);
            } else {
                grown.as_mut().set_size_for_resize(combined);
                if let Some(mut after) = block::next_adjacent(grown, &self.cfg) {
                    after.as_mut().set_prev_used();
                }
            }

            Some(block::payload_of(grown, &self.cfg))
        }
    }

    unsafe fn poison(&self, bp: BlockPtr) {
        unsafe {
            let payload = block::payload_of(bp, &self.cfg);
            let size = block::payload_size(bp, &self.cfg);
            payload.as_ptr().write_bytes(self.cfg.poison_byte, size);
        }
    }

    /// If coalescing left `bp`'s region with no in-use blocks, either keeps
    /// it as one of the cached empty regions or unmaps it, per
    /// [`AllocConfig::span_cache`].
    fn retire_if_empty(&mut self, bp: BlockPtr) {
        let region = unsafe { bp.as_ref().owner() };
        if !unsafe { region.as_ref().is_empty() } {
            return;
        }
        if self.region_count() <= self.cfg.span_cache {
            return;
        }
        self.regions = unsafe { region::unlink(self.regions, region) };
        unsafe { region::release(region) };
    }

    fn region_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.regions;
        while let Some(region) = cur {
            count += 1;
            cur = region::next(region);
        }
        count
    }

    #[cfg(test)]
    fn head_region_block_count(&self) -> usize {
        unsafe { self.regions.unwrap().as_ref().block_count() }
    }

    /// Walks every block of every live region and checks the heap's
    /// invariants hold: header alignment, size alignment and floor, the
    /// `PREV_IN_USE` flag against the predecessor's actual state, footer
    /// agreement on free blocks, free-list membership against the `is_free`
    /// flag, `block_count` against an actual walked count, and no two
    /// physically adjacent free blocks.
    #[cfg(test)]
    fn assert_invariants(&self) {
        use std::collections::HashSet;

        let mut cur_region = self.regions;
        while let Some(region) = cur_region {
            let mut free_addrs = HashSet::new();
            let mut head = unsafe { region.as_ref().free_list_head() };
            while let Some(bp) = head {
                free_addrs.insert(bp.as_ptr() as usize);
                head = unsafe { bp.as_ref().next_free() };
            }

            let mut walked_in_use = 0usize;
            let mut prev_was_free = false;
            let mut first = true;
            let mut cur = Some(region::first_block(region, &self.cfg));
            while let Some(bp) = cur {
                let addr = bp.as_ptr() as usize;
                assert_eq!(addr % self.cfg.alignment, 0, "block header is misaligned");

                let size = unsafe { bp.as_ref().size() };
                assert_eq!(size % self.cfg.alignment, 0, "block size is misaligned");
                assert!(size >= self.cfg.min_block, "block size below the configured floor");

                let is_free = unsafe { bp.as_ref().is_free() };
                if !first {
                    assert_eq!(
                        unsafe { bp.as_ref().is_prev_free() },
                        prev_was_free,
                        "PREV_IN_USE disagrees with the predecessor's actual state"
                    );
                }

                if is_free {
                    assert_eq!(block::footer(bp, &self.cfg), size, "free block's footer disagrees with its size");
                    assert!(free_addrs.contains(&addr), "free block is not reachable from the free list");
                    assert!(!prev_was_free, "two physically adjacent free blocks were not coalesced");
                } else {
                    assert!(!free_addrs.contains(&addr), "in-use block is still linked into the free list");
                    walked_in_use += 1;
                }

                prev_was_free = is_free;
                first = false;
                cur = block::next_adjacent(bp, &self.cfg);
            }

            assert_eq!(
                unsafe { region.as_ref().block_count() },
                walked_in_use,
                "block_count disagrees with an actual walk of in-use blocks"
            );

            cur_region = region::next(region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> AllocConfig {
        AllocConfig { min_region: 4096, span_cache: 1, ..AllocConfig::default() }
    }

    #[test]
    fn empty_region_caching_keeps_one_span_cached() {
        let mut e = Engine::new(small_cfg());
        let p = e.allocate(64).unwrap();
        e.release(Some(p));
        assert_eq!(e.region_count(), 1);
        assert_eq!(e.head_region_block_count(), 0);

        let q = e.allocate(64).unwrap();
        let r = e.allocate(64).unwrap();
        e.release(Some(q));
        assert_eq!(e.region_count(), 1, "reuses the cached region rather than mapping a new one");
        e.release(Some(r));
        assert_eq!(e.region_count(), 1);
        e.assert_invariants();
    }

    #[test]
    fn bidirectional_coalesce_collapses_back_to_one_free_block() {
        let mut e = Engine::new(small_cfg());
        let b1 = e.allocate(128).unwrap();
        let b2 = e.allocate(128).unwrap();
        let b3 = e.allocate(128).unwrap();
        let b4 = e.allocate(128).unwrap();

        e.release(Some(b2));
        e.release(Some(b4));
        e.release(Some(b1));
        e.release(Some(b3));

        assert_eq!(e.head_region_block_count(), 0);
        assert_eq!(e.region_count(), 1);
        e.assert_invariants();
    }

    #[test]
    fn resize_truncate_keeps_pointer_and_frees_tail() {
        let mut e = Engine::new(small_cfg());
        let p = e.allocate(1234).unwrap();
        unsafe { p.as_ptr().write_bytes(0x5, 1234) };
        let q = e.resize(Some(p), 500).unwrap();
        assert_eq!(p, q);
        e.assert_invariants();
        e.release(Some(q));
        e.assert_invariants();
    }

    #[test]
    fn resize_extend_in_place_when_neighbour_is_free() {
        // `first` is carved last out of the region's tail, so it sits at the
        // higher address; `second` is the remaining, physically earlier block
        // whose successor becomes `first` once `first` is freed.
        let mut e = Engine::new(small_cfg());
        let first = e.allocate(1024).unwrap();
        let second = e.allocate(1024).unwrap();
        e.release(Some(first));

        let grown = e.resize(Some(second), 1500).unwrap();
        assert_eq!(second, grown);
        e.assert_invariants();
        e.release(Some(grown));
        e.assert_invariants();
    }

    #[test]
    fn resize_moves_when_no_room_to_extend() {
        let mut e = Engine::new(AllocConfig::default());
        let first = e.allocate(1024).unwrap();
        let second = e.allocate(1024).unwrap();
        e.release(Some(first));

        let before_regions = e.region_count();
        let moved = e.resize(Some(second), 4096).unwrap();
        assert_ne!(second, moved);
        assert_eq!(e.region_count(), before_regions, "grows within the existing region");
        assert_eq!(e.head_region_block_count(), 1);
        e.assert_invariants();
        e.release(Some(moved));
        e.assert_invariants();
    }

    #[test]
    fn release_none_is_a_no_op() {
        let mut e = Engine::new(small_cfg());
        e.release(None);
        assert_eq!(e.region_count(), 0);
        e.assert_invariants();
    }
}
