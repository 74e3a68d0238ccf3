//! OS-level memory mapping, isolated behind a tiny trait so the engine never
//! has to know whether it is running on an ELF or Mach-O/PE system.
//!
//! On Unix this is [`libc::mmap`]/[`libc::munmap`]/`sysconf(_SC_PAGESIZE)`.
//! On Windows it is `VirtualAlloc`/`VirtualFree`/`GetSystemInfo`. Both sides
//! return anonymous, zero-initialised, page-aligned read/write memory.

use std::ptr::NonNull;
use std::sync::OnceLock;

/// Lazily queries and caches the platform page size.
///
/// A `OnceLock` rather than the teacher's `static mut` cache, since the
/// engine is wrapped in a mutex and shared across threads; a bare mutable
/// static would be a data race waiting to happen the moment two threads
/// race the first allocation.
pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(Platform::query_page_size)
}

/// Requests `len` bytes of fresh, anonymous, read-write memory from the OS.
/// `len` should already be a multiple of [`page_size`].
pub(crate) fn map(len: usize) -> Option<NonNull<u8>> {
    unsafe { Platform::map(len) }
}

/// Returns `len` bytes previously obtained from [`map`] to the OS.
pub(crate) unsafe fn unmap(addr: NonNull<u8>, len: usize) {
    unsafe { Platform::unmap(addr, len) }
}

trait PlatformMemory {
    unsafe fn map(len: usize) -> Option<NonNull<u8>>;
    unsafe fn unmap(addr: NonNull<u8>, len: usize);
    fn query_page_size() -> usize;
}

struct Platform;

#[cfg(unix)]
impl PlatformMemory for Platform {
    unsafe fn map(len: usize) -> Option<NonNull<u8>> {
        use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, mmap, off_t};
        use std::os::raw::{c_int, c_void};

        const ADDR: *mut c_void = std::ptr::null_mut();
        const PROT: c_int = PROT_READ | PROT_WRITE;
        const FLAGS: c_int = MAP_PRIVATE | MAP_ANONYMOUS;
        const FD: c_int = -1;
        const OFFSET: off_t = 0;

        unsafe {
            let addr = mmap(ADDR, len, PROT, FLAGS, FD, OFFSET);
            if addr == MAP_FAILED {
                None
            } else {
                Some(NonNull::new_unchecked(addr.cast::<u8>()))
            }
        }
    }

    unsafe fn unmap(addr: NonNull<u8>, len: usize) {
        unsafe {
            libc::munmap(addr.as_ptr().cast(), len);
        }
    }

    fn query_page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }
}

#[cfg(windows)]
impl PlatformMemory for Platform {
    unsafe fn map(len: usize) -> Option<NonNull<u8>> {
        use windows::Win32::System::Memory::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc};

        unsafe {
            let addr = VirtualAlloc(None, len, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
            NonNull::new(addr.cast())
        }
    }

    unsafe fn unmap(addr: NonNull<u8>, _len: usize) {
        use std::os::raw::c_void;
        use windows::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

        unsafe {
            let _ = VirtualFree(addr.as_ptr() as *mut c_void, 0, MEM_RELEASE);
        }
    }

    fn query_page_size() -> usize {
        use std::mem::MaybeUninit;
        use windows::Win32::System::SystemInformation::GetSystemInfo;

        unsafe {
            let mut info = MaybeUninit::uninit();
            GetSystemInfo(info.as_mut_ptr());
            info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        let sz = page_size();
        assert!(sz > 0);
        assert_eq!(sz & (sz - 1), 0);
    }

    #[test]
    fn map_then_unmap_round_trips() {
        let sz = page_size();
        let addr = map(sz).expect("mmap should succeed for one page");
        unsafe {
            // The OS guarantees freshly mapped pages are zeroed.
            assert_eq!(*addr.as_ptr(), 0);
            unmap(addr, sz);
        }
    }
}
