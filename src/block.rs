//! Block headers and the primitive operations that preserve the heap's
//! per-block invariants: alignment, the in-use/prev-in-use flag pair, the
//! free-block footer, and free-list membership.
//!
//! A block's header is never addressed through a safe reference for long:
//! callers hold a [`BlockPtr`] and reach into the header only for the
//! duration of one primitive. This mirrors how the region list is walked in
//! [`crate::region`] and keeps the `unsafe` surface to these few functions.

use std::mem;
use std::ptr::NonNull;

use crate::config::AllocConfig;
use crate::region::RegionPtr;

const IN_USE: usize = 1;
const PREV_IN_USE: usize = 2;
const FLAG_MASK: usize = IN_USE | PREV_IN_USE;

const MAGIC_FREE: u32 = 0xBEBE_BEBE;
const MAGIC_USED: u32 = 0xDEDE_DEDE;

pub(crate) type BlockPtr = NonNull<BlockHeader>;

/// The header stamped at the front of every block, free or in use.
///
/// `size_and_flags` packs the block's gross size (always a multiple of the
/// configured alignment) together with the two low bits: whether the block
/// itself is in use, and whether its physical predecessor is. `prev`/`next`
/// only have meaning while the block is free, where they chain it into its
/// owning region's free list.
#[repr(C)]
pub(crate) struct BlockHeader {
    size_and_flags: usize,
    owner: RegionPtr,
    prev: Option<BlockPtr>,
    next: Option<BlockPtr>,
    magic: u32,
}

pub(crate) fn round_up(n: usize, alignment: usize) -> usize {
    (n + alignment - 1) & !(alignment - 1)
}

/// The padded size of a block header: every payload starts this many bytes
/// after its block's address.
pub(crate) fn header_pad(cfg: &AllocConfig) -> usize {
    round_up(mem::size_of::<BlockHeader>(), cfg.alignment)
}

/// Gross block size needed to serve a user request of `n` bytes: header
/// padding plus the request rounded up to the alignment, floored at the
/// configured minimum block size.
pub(crate) fn gross_size(n: usize, cfg: &AllocConfig) -> usize {
    let g = header_pad(cfg) + round_up(n, cfg.alignment);
    g.max(cfg.min_block)
}

impl BlockHeader {
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size_and_flags & !FLAG_MASK
    }

    fn set_size(&mut self, size: usize) {
        self.size_and_flags = size | (self.size_and_flags & FLAG_MASK);
    }

    /// Changes an in-use block's recorded size without touching its flags.
    /// Used by [`crate::engine`] when growing or shrinking a live block in
    /// place; callers must keep the block's footer (if any) consistent.
    #[inline]
    pub(crate) fn set_size_for_resize(&mut self, size: usize) {
        self.set_size(size);
    }

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        self.size_and_flags & IN_USE == 0
    }

    fn set_used(&mut self) {
        self.size_and_flags |= IN_USE;
    }

    fn set_free(&mut self) {
        self.size_and_flags &= !IN_USE;
    }

    #[inline]
    pub(crate) fn is_prev_free(&self) -> bool {
        self.size_and_flags & PREV_IN_USE == 0
    }

    pub(crate) fn set_prev_used(&mut self) {
        self.size_and_flags |= PREV_IN_USE;
    }

    pub(crate) fn set_prev_free(&mut self) {
        self.size_and_flags &= !PREV_IN_USE;
    }

    #[inline]
    pub(crate) fn owner(&self) -> RegionPtr {
        self.owner
    }

    #[inline]
    pub(crate) fn magic(&self) -> u32 {
        self.magic
    }

    /// This block's successor in its owner region's free list. Meaningless
    /// on an in-use block.
    #[inline]
    pub(crate) fn next_free(&self) -> Option<BlockPtr> {
        self.next
    }
}

/// Pointer arithmetic helpers. These never touch `self`; they compute
/// addresses relative to a `NonNull<BlockHeader>` so they can be called
/// before a header has been fully stamped.
fn footer_slot(bp: BlockPtr, _cfg: &AllocConfig) -> *mut usize {
    unsafe {
        let size = bp.as_ref().size();
        (bp.as_ptr() as *mut u8).add(size - mem::size_of::<usize>()) as *mut usize
    }
}

fn prev_footer_slot(bp: BlockPtr) -> *mut usize {
    unsafe { (bp.as_ptr() as *mut u8).sub(mem::size_of::<usize>()) as *mut usize }
}

/// Reads a free block's footer word. Only meaningful while `bp` is free.
pub(crate) fn footer(bp: BlockPtr, cfg: &AllocConfig) -> usize {
    unsafe { *footer_slot(bp, cfg) }
}

/// Address of the payload a caller would receive for this block.
pub(crate) fn payload_of(bp: BlockPtr, cfg: &AllocConfig) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked((bp.as_ptr() as *mut u8).add(header_pad(cfg))) }
}

/// Recovers the block header from a payload pointer previously returned by
/// [`payload_of`].
pub(crate) fn block_of(p: NonNull<u8>, cfg: &AllocConfig) -> BlockPtr {
    unsafe { NonNull::new_unchecked((p.as_ptr()).sub(header_pad(cfg)) as *mut BlockHeader) }
}

/// Usable payload size of a block: its gross size minus the header padding.
pub(crate) fn payload_size(bp: BlockPtr, cfg: &AllocConfig) -> usize {
    unsafe { bp.as_ref().size() - header_pad(cfg) }
}

/// Stamps a free-block header at `p` and writes its footer. `p` must be
/// aligned and lie within `owner`'s byte range.
pub(crate) unsafe fn init_free(p: NonNull<u8>, owner: RegionPtr, size: usize, cfg: &AllocConfig) -> BlockPtr {
    unsafe {
        let mut bp: BlockPtr = p.cast();
        bp.as_ptr().write(BlockHeader {
            size_and_flags: size,
            owner,
            prev: None,
            next: None,
            magic: MAGIC_FREE,
        });
        bp.as_mut().set_free();
        *footer_slot(bp, cfg) = size;
        bp
    }
}

/// Stamps an in-use block header at `p`. No footer is written; in-use
/// blocks are recovered solely through their successor's `PREV_IN_USE` bit.
pub(crate) unsafe fn init_used(p: NonNull<u8>, owner: RegionPtr, size: usize) -> BlockPtr {
    unsafe {
        let mut bp: BlockPtr = p.cast();
        bp.as_ptr().write(BlockHeader {
            size_and_flags: size,
            owner,
            prev: None,
            next: None,
            magic: MAGIC_USED,
        });
        bp.as_mut().set_used();
        bp
    }
}

/// The block physically following `bp`, or `None` if `bp` is the last block
/// in its region.
pub(crate) fn next_adjacent(bp: BlockPtr, _cfg: &AllocConfig) -> Option<BlockPtr> {
    unsafe {
        let region = bp.as_ref().owner();
        let next_addr = (bp.as_ptr() as *mut u8).add(bp.as_ref().size());
        let region_end = (region.as_ptr() as *mut u8).add(region.as_ref().size());
        if next_addr >= region_end {
            None
        } else {
            Some(NonNull::new_unchecked(next_addr as *mut BlockHeader))
        }
    }
}

/// The block physically preceding `bp`, found via its footer. Only valid
/// when `bp`'s `PREV_IN_USE` bit says the predecessor is free. Returns
/// `None` if `bp` is the first block in its region.
pub(crate) fn prev_adjacent(bp: BlockPtr, cfg: &AllocConfig) -> Option<BlockPtr> {
    debug_assert!(unsafe { bp.as_ref().is_prev_free() });
    unsafe {
        let region = bp.as_ref().owner();
        let footer = prev_footer_slot(bp);
        let region_start = (region.as_ptr() as *mut u8).add(crate::region::header_pad(cfg));
        if (footer as *mut u8) < region_start {
            return None;
        }
        let prev_size = *footer;
        let prev_addr = (bp.as_ptr() as *mut u8).sub(prev_size);
        Some(NonNull::new_unchecked(prev_addr as *mut BlockHeader))
    }
}

/// Inserts a free block at the head of its owner region's free list.
pub(crate) unsafe fn prepend_free(mut bp: BlockPtr) {
    unsafe {
        debug_assert!(bp.as_ref().is_free());
        let mut region = bp.as_ref().owner();
        let head = region.as_ref().free_list_head();
        bp.as_mut().next = head;
        bp.as_mut().prev = None;
        if let Some(mut old_head) = head {
            old_head.as_mut().prev = Some(bp);
        }
        region.as_mut().set_free_list_head(Some(bp));
    }
}

/// Unlinks a free block from its owner region's free list.
pub(crate) unsafe fn sever_free(mut bp: BlockPtr) {
    unsafe {
        let mut region = bp.as_ref().owner();
        let (prev, next) = (bp.as_ref().prev, bp.as_ref().next);
        match prev {
            Some(mut p) => p.as_mut().next = next,
            None => region.as_mut().set_free_list_head(next),
        }
        if let Some(mut n) = next {
            n.as_mut().prev = prev;
        }
        bp.as_mut().prev = None;
        bp.as_mut().next = None;
    }
}

/// Takes the last `gross` bytes of free block `bp` to form a new, in-use
/// block. `bp` shrinks in place and keeps its free-list membership.
/// Precondition: `bp` is free and `size(bp) > gross`.
pub(crate) unsafe fn split(mut bp: BlockPtr, gross: usize, cfg: &AllocConfig) -> BlockPtr {
    unsafe {
        debug_assert!(bp.as_ref().is_free());
        debug_assert!(bp.as_ref().size() > gross);

        let owner = bp.as_ref().owner();
        let remaining = bp.as_ref().size() - gross;
        bp.as_mut().set_size(remaining);
        *footer_slot(bp, cfg) = remaining;

        let new_addr = (bp.as_ptr() as *mut u8).add(remaining);
        let mut new_block = init_used(NonNull::new_unchecked(new_addr), owner, gross);
        new_block.as_mut().set_prev_free();
        new_block
    }
}

/// Consumes the entirety of free block `bp` as a single in-use block,
/// without splitting. Used when the split residual would fall below the
/// configured minimum block size.
pub(crate) unsafe fn take_whole(bp: BlockPtr) -> BlockPtr {
    unsafe {
        sever_free(bp);
        let mut bp = bp;
        bp.as_mut().set_used();
        bp.as_mut().magic = MAGIC_USED;
        bp
    }
}

/// Serves an allocation request from free block `bp`: splits off `gross`
/// bytes (or takes the whole block if the residual would be too small),
/// tells the physically next block its predecessor is now in use, and bumps
/// the owner region's in-use block count.
pub(crate) unsafe fn alloc_from(bp: BlockPtr, gross: usize, cfg: &AllocConfig) -> BlockPtr {
    unsafe {
        debug_assert!(bp.as_ref().is_free());

        let allocated = if bp.as_ref().size() - gross < cfg.min_block {
            take_whole(bp)
        } else {
            split(bp, gross, cfg)
        };

        if let Some(mut next) = next_adjacent(allocated, cfg) {
            next.as_mut().set_prev_used();
        }

        let mut owner = allocated.as_ref().owner();
        owner.as_mut().increment_block_count();
        allocated
    }
}

/// Returns an in-use block to its owner's free list, telling its physical
/// successor that its predecessor is now free. Does not coalesce; that is
/// [`coalesce`]'s job.
pub(crate) unsafe fn free_block(mut bp: BlockPtr, cfg: &AllocConfig) {
    unsafe {
        debug_assert!(!bp.as_ref().is_free());
        debug_assert_eq!(bp.as_ref().magic(), MAGIC_USED, "double free or heap corruption");

        let mut owner = bp.as_ref().owner();
        owner.as_mut().decrement_block_count();

        let size = bp.as_ref().size();
        bp.as_mut().set_free();
        bp.as_mut().magic = MAGIC_FREE;
        *footer_slot(bp, cfg) = size;
        prepend_free(bp);

        if let Some(mut next) = next_adjacent(bp, cfg) {
            next.as_mut().set_prev_free();
        }
    }
}

/// Merges free block `next` into free block `bp`, which must be its
/// immediate physical predecessor. After this call `next` is no longer a
/// valid block pointer; it has been absorbed.
pub(crate) unsafe fn coalesce_pair(mut bp: BlockPtr, next: BlockPtr, cfg: &AllocConfig) -> BlockPtr {
    unsafe {
        debug_assert!(bp.as_ref().is_free() && next.as_ref().is_free());
        sever_free(next);
        let merged = bp.as_ref().size() + next.as_ref().size();
        bp.as_mut().set_size(merged);
        *footer_slot(bp, cfg) = merged;
        bp
    }
}

/// Tries to merge a just-freed block with both physical neighbours. Returns
/// the block pointer that now represents the (possibly larger) free region,
/// which may be `bp` itself or its former predecessor.
pub(crate) unsafe fn coalesce(mut bp: BlockPtr, cfg: &AllocConfig) -> BlockPtr {
    unsafe {
        debug_assert!(bp.as_ref().is_free());

        if let Some(next) = next_adjacent(bp, cfg) {
            if next.as_ref().is_free() {
                bp = coalesce_pair(bp, next, cfg);
            }
        }

        if bp.as_ref().is_prev_free() {
            if let Some(prev) = prev_adjacent(bp, cfg) {
                bp = coalesce_pair(prev, bp, cfg);
            }
        }

        bp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::alloc_region;

    fn small_cfg() -> AllocConfig {
        AllocConfig {
            min_region: 4096,
            ..AllocConfig::default()
        }
    }

    #[test]
    fn gross_size_is_aligned_and_floored() {
        let cfg = AllocConfig::default();
        assert!(gross_size(1, &cfg) >= cfg.min_block);
        assert_eq!(gross_size(1, &cfg) % cfg.alignment, 0);
        assert_eq!(gross_size(200, &cfg), header_pad(&cfg) + round_up(200, cfg.alignment));
    }

    #[test]
    fn init_free_writes_matching_footer() {
        let cfg = small_cfg();
        let region = alloc_region(gross_size(64, &cfg), &cfg).unwrap();
        unsafe {
            let bp = region.as_ref().free_list_head().unwrap();
            assert!(bp.as_ref().is_free());
            assert_eq!(*footer_slot(bp, &cfg), bp.as_ref().size());
            crate::region::free_region_unconditionally(region);
        }
    }

    #[test]
    fn split_leaves_predecessor_free_and_successor_used() {
        let cfg = small_cfg();
        let region = alloc_region(gross_size(64, &cfg), &cfg).unwrap();
        unsafe {
            let free_block = region.as_ref().free_list_head().unwrap();
            let gross = gross_size(64, &cfg);
            let used = alloc_from(free_block, gross, &cfg);
            assert!(!used.as_ref().is_free());
            assert_eq!(used.as_ref().size(), gross);
            assert_eq!(region.as_ref().block_count(), 1);
            crate::region::free_region_unconditionally(region);
        }
    }
}
