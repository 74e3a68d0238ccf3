//! Internal failure taxonomy.
//!
//! Every public operation in [`crate::engine`] reports failure by returning
//! `None`, matching a `malloc`-family contract that must never unwind or
//! abort the caller's process. [`AllocError`] exists one layer below that:
//! it lets the engine log *why* an operation failed before the cause is
//! collapsed into the public `None`.

use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum AllocError {
    #[error("OS failed to map {requested} bytes for a new region")]
    OsMapFailed { requested: usize },

    #[error("element count * element size overflowed computing a zeroed allocation")]
    SizeOverflow,
}
