//! Tunable constants for the heap engine.
//!
//! The values here reproduce the fixed layout constants of a conventional
//! mmap-backed allocator (16-byte alignment, 64 KiB minimum region, a single
//! cached empty region). They are collected into one value so tests can
//! shrink [`AllocConfig::min_region`] and [`AllocConfig::span_cache`] to
//! force region churn without allocating real 64 KiB spans for every case.

/// Runtime configuration for an [`Engine`](crate::engine::Engine).
///
/// The public, process-wide [`Heap`](crate::Heap) always uses
/// [`AllocConfig::default`]; a non-default config exists purely for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocConfig {
    /// Byte alignment of every block header and payload. Must be a power of
    /// two no smaller than the pointer size.
    pub alignment: usize,
    /// Minimum number of bytes requested from the OS per region, before
    /// rounding up to a multiple of the page size.
    pub min_region: usize,
    /// Minimum gross size of any block, free or in use.
    pub min_block: usize,
    /// Number of empty regions retained rather than unmapped immediately.
    pub span_cache: usize,
    /// Byte written over a freed payload for debugger visibility.
    pub poison_byte: u8,
}

impl AllocConfig {
    /// The constants specified for this allocator: 16-byte alignment, a
    /// 64 KiB minimum region, a 64-byte minimum block, and a one-region
    /// empty cache.
    pub const fn new() -> Self {
        Self {
            alignment: 16,
            min_region: 64 * 1024,
            min_block: 64,
            span_cache: 1,
            poison_byte: 0xAE,
        }
    }

    pub(crate) fn validate(&self) {
        debug_assert!(self.alignment.is_power_of_two());
        debug_assert!(self.alignment >= core::mem::size_of::<usize>());
        debug_assert!(self.min_block % self.alignment == 0);
        debug_assert!(self.min_region % self.alignment == 0);
    }
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_constants() {
        let cfg = AllocConfig::default();
        assert_eq!(cfg.alignment, 16);
        assert_eq!(cfg.min_region, 65536);
        assert_eq!(cfg.min_block, 64);
        assert_eq!(cfg.span_cache, 1);
        assert_eq!(cfg.poison_byte, 0xAE);
    }
}
