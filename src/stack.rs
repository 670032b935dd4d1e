//! Fiber stack allocation.
//!
//! Every fiber stack is an anonymous private mapping with one protected
//! guard page on each side of the usable area, so an overflow faults
//! synchronously instead of silently corrupting a neighbor. Released stacks
//! keep their mapping and guards and go onto a free list for reuse; the
//! allocator trades memory for reuse latency and satisfies requests
//! first-fit in insertion order.

use core::ffi::c_void;
use core::num::NonZeroUsize;
use core::ptr::NonNull;

use nix::libc;
use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};

use crate::error::{Error, Result};
use crate::sched::with_vp;

/// One guard page on each side of the usable area.
const REDZONE_PAGES: usize = 1;

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Owned anonymous mapping. Unmapped on drop; the pool holds segments for
/// the lifetime of the runtime, so in practice this fires only at thread
/// teardown.
struct Segment {
    base: NonNull<c_void>,
    len: usize,
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.base, self.len) } {
            log::warn!("munmap of a {} byte stack segment failed: {}", self.len, err);
        }
    }
}

pub(crate) struct Stack {
    seg: Segment,
    /// Usable capacity in bytes.
    stk_size: usize,
    /// Address of the lowest usable byte.
    bottom: usize,
    /// Address one past the highest usable byte.
    top: usize,
}

impl Stack {
    /// Maps a fresh guarded stack. `stack_size` must already be a multiple
    /// of the page size.
    fn map(stack_size: usize, page: usize, randomize: bool) -> Result<Stack> {
        let extra = if randomize { page } else { 0 };
        let len = stack_size + 2 * REDZONE_PAGES * page + extra;

        let base = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(len).ok_or(Error::InvalidArg)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(|_| Error::NoMemory)?;

        let seg = Segment { base, len };

        let guard = REDZONE_PAGES * page;
        let tail = unsafe {
            NonNull::new_unchecked(base.as_ptr().cast::<u8>().add(len - guard).cast::<c_void>())
        };
        unsafe {
            mprotect(base, guard, ProtFlags::PROT_NONE).map_err(|_| Error::NoMemory)?;
            mprotect(tail, guard, ProtFlags::PROT_NONE).map_err(|_| Error::NoMemory)?;
        }

        let mut bottom = base.as_ptr() as usize + guard;
        // A random 16-byte-aligned shift into the extra page frustrates
        // exploits that rely on deterministic stack layout.
        if extra != 0 {
            let offset = (rand::random::<usize>() % extra) & !0xf;
            bottom += offset;
        }

        Ok(Stack {
            seg,
            stk_size: stack_size,
            bottom,
            top: bottom + stack_size,
        })
    }

    pub fn top(&self) -> *mut u8 {
        self.top as *mut u8
    }

    #[cfg(test)]
    fn range(&self) -> (usize, usize) {
        let base = self.seg.base.as_ptr() as usize;
        (base, base + self.seg.len)
    }
}

/// Free list of released stacks, scanned first-fit in insertion order.
pub(crate) struct StackPool {
    free: Vec<Stack>,
}

impl StackPool {
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    pub fn acquire(&mut self, stack_size: usize, page: usize, randomize: bool) -> Result<Stack> {
        if let Some(pos) = self.free.iter().position(|s| s.stk_size >= stack_size) {
            return Ok(self.free.remove(pos));
        }
        Stack::map(stack_size, page, randomize)
    }

    pub fn release(&mut self, stack: Stack) {
        self.free.push(stack);
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }
}

/// Enables or disables the randomized stack offset for stacks mapped from
/// now on. Returns the previous setting.
pub fn randomize_stacks(on: bool) -> bool {
    with_vp(|vp| {
        let was = vp.core.randomize;
        vp.core.randomize = on;
        was
    })
}

/// Number of stacks currently sitting on the free list.
pub fn free_stack_count() -> usize {
    with_vp(|vp| vp.core.stacks.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_area_is_inside_the_guards() {
        let page = page_size();
        let stack = Stack::map(4 * page, page, false).unwrap();
        let (base, end) = stack.range();
        assert_eq!(stack.top as usize - stack.bottom, 4 * page);
        assert!(stack.bottom >= base + page);
        assert!(stack.top as usize <= end - page);
        assert_eq!(stack.bottom % 16, 0);
    }

    #[test]
    fn randomized_offset_stays_inside_the_extra_page() {
        let page = page_size();
        for _ in 0..32 {
            let stack = Stack::map(2 * page, page, true).unwrap();
            let (base, end) = stack.range();
            assert!(stack.bottom >= base + page);
            assert!(stack.bottom < base + 2 * page);
            assert!(stack.top as usize <= end - page);
            assert_eq!(stack.bottom % 16, 0);
        }
    }

    #[test]
    fn pool_reuses_first_fit_in_insertion_order() {
        let page = page_size();
        let mut pool = StackPool::new();

        let small = pool.acquire(2 * page, page, false).unwrap();
        let big = pool.acquire(8 * page, page, false).unwrap();
        let small_bottom = small.bottom;
        let big_bottom = big.bottom;
        pool.release(small);
        pool.release(big);
        assert_eq!(pool.len(), 2);

        // First fit: a request the small stack satisfies takes it, even
        // though the big one would fit too.
        let got = pool.acquire(page, page, false).unwrap();
        assert_eq!(got.bottom, small_bottom);

        // The small stack is gone, so the next small request takes big.
        let got2 = pool.acquire(page, page, false).unwrap();
        assert_eq!(got2.bottom, big_bottom);
        assert_eq!(pool.len(), 0);

        // A miss maps a new segment with at least the requested capacity.
        let fresh = pool.acquire(16 * page, page, false).unwrap();
        assert!(fresh.stk_size >= 16 * page);
    }
}
