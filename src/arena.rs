//! Arena allocates memory for protobuf objects, freed all at once.
//!
//! Every object reachable from a decoded message is owned by exactly one
//! arena; there is no per-allocation free. The arena is a non-generic type so
//! codec code stays monomorphization-free, while the caller keeps full control
//! over the underlying allocator: small allocations are batched into sporadic
//! large block allocations, so going through a `dyn Allocator` costs little.

use core::alloc::Layout;
use core::ptr;
use core::ptr::NonNull;

use allocator_api2::alloc::Allocator;

use crate::status::{Error, ErrorKind};

/// Largest alignment the arena serves.
pub const MAX_ALIGN: usize = 16;

const DEFAULT_BLOCK_SIZE: usize = 1024;
const MAX_BLOCK_SIZE: usize = 16 * 1024;

pub struct Arena<'a> {
    current: *mut MemBlock,
    cursor: *mut u8,
    end: *mut u8,
    cleanup: *mut CleanupNode,
    bytes_served: usize,
    allocator: &'a dyn Allocator,
}

// A block of contiguous memory obtained from the allocator.
struct MemBlock {
    prev: *mut MemBlock,
    layout: Layout, // layout of the entire block including this header
}

struct CleanupNode {
    next: *mut CleanupNode,
    run: unsafe fn(*mut u8),
    ud: *mut u8,
}

impl<'a> Arena<'a> {
    pub fn new(allocator: &'a dyn Allocator) -> Self {
        Self {
            current: ptr::null_mut(),
            cursor: ptr::null_mut(),
            end: ptr::null_mut(),
            cleanup: ptr::null_mut(),
            bytes_served: 0,
            allocator,
        }
    }

    /// Seed the arena with caller-provided scratch memory. The buffer is used
    /// for the first allocations and is never freed by the arena; when it runs
    /// out, blocks come from `allocator` as usual.
    pub fn with_initial(buf: &'a mut [u8], allocator: &'a dyn Allocator) -> Self {
        let range = buf.as_mut_ptr_range();
        Self {
            current: ptr::null_mut(),
            cursor: range.start,
            end: range.end,
            cleanup: ptr::null_mut(),
            bytes_served: 0,
            allocator,
        }
    }

    /// Allocate raw memory. All failures surface as `OutOfMemory`.
    #[inline]
    pub fn alloc_raw(&mut self, layout: Layout) -> Result<NonNull<u8>, Error> {
        debug_assert!(layout.align() <= MAX_ALIGN);
        let size = layout.size();
        let align = layout.align();

        let cursor_addr = self.cursor as usize;
        let aligned_addr = (cursor_addr.wrapping_add(align - 1)) & !(align - 1);

        let available = (self.end as usize).saturating_sub(aligned_addr);
        if !self.cursor.is_null() && available >= size {
            let aligned_cursor = aligned_addr as *mut u8;
            self.cursor = unsafe { aligned_cursor.add(size) };
            self.bytes_served += size;
            return Ok(unsafe { NonNull::new_unchecked(aligned_cursor) });
        }

        self.alloc_outlined(layout)
    }

    /// Allocate zeroed memory.
    pub fn alloc_zeroed(&mut self, layout: Layout) -> Result<NonNull<u8>, Error> {
        let p = self.alloc_raw(layout)?;
        unsafe { ptr::write_bytes(p.as_ptr(), 0, layout.size()) };
        Ok(p)
    }

    /// Reallocate: always allocates fresh storage and copies the first
    /// `min(old, new)` bytes. There is no in-place shrink or grow.
    pub fn realloc(
        &mut self,
        p: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<u8>, Error> {
        let new_ptr = self.alloc_raw(new_layout)?;
        let n = old_layout.size().min(new_layout.size());
        unsafe { ptr::copy_nonoverlapping(p.as_ptr(), new_ptr.as_ptr(), n) };
        Ok(new_ptr)
    }

    /// Copy a byte slice into the arena.
    pub fn copy_bytes(&mut self, bytes: &[u8]) -> Result<NonNull<u8>, Error> {
        if bytes.is_empty() {
            return Ok(NonNull::dangling());
        }
        let p = self.alloc_raw(Layout::from_size_align(bytes.len(), 1).unwrap())?;
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), p.as_ptr(), bytes.len()) };
        Ok(p)
    }

    /// Register `run(ud)` to execute at arena teardown. Cleanups run in
    /// reverse registration order, before any block is released.
    pub fn add_cleanup(&mut self, ud: *mut u8, run: unsafe fn(*mut u8)) -> Result<(), Error> {
        let node = self.alloc_raw(Layout::new::<CleanupNode>())?.as_ptr() as *mut CleanupNode;
        unsafe {
            (*node).next = self.cleanup;
            (*node).run = run;
            (*node).ud = ud;
        }
        self.cleanup = node;
        Ok(())
    }

    /// Total bytes ever served by this arena (not the live set).
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_served
    }

    // New-block path, kept out of line so the bump fast path stays small.
    #[inline(never)]
    fn alloc_outlined(&mut self, layout: Layout) -> Result<NonNull<u8>, Error> {
        let next_size = if self.current.is_null() {
            DEFAULT_BLOCK_SIZE
        } else {
            let current_size = unsafe { (*self.current).layout.size() };
            (current_size * 2).min(MAX_BLOCK_SIZE)
        };

        let (layout_with_header, offset) = Layout::new::<MemBlock>()
            .extend(layout)
            .map_err(|_| Error::new(ErrorKind::OutOfMemory, "allocation layout overflow"))?;
        // Room for this allocation plus the usual bump space.
        let (block_layout, _) = layout_with_header
            .extend(Layout::array::<u8>(next_size.saturating_sub(layout.size())).unwrap())
            .map_err(|_| Error::new(ErrorKind::OutOfMemory, "allocation layout overflow"))?;
        let block_layout = block_layout.pad_to_align();

        let block = self
            .allocator
            .allocate(block_layout)
            .map_err(|_| Error::new(ErrorKind::OutOfMemory, "block allocation failed"))?
            .as_ptr() as *mut MemBlock;

        unsafe {
            (*block).prev = self.current;
            (*block).layout = block_layout;
            self.current = block;
            self.cursor = (block as *mut u8).add(offset + layout.size());
            self.end = (block as *mut u8).add(block_layout.size());
            self.bytes_served += layout.size();
            Ok(NonNull::new_unchecked((block as *mut u8).add(offset)))
        }
    }
}

impl Drop for Arena<'_> {
    fn drop(&mut self) {
        unsafe {
            // Cleanup list is LIFO by construction (head = most recent).
            let mut node = self.cleanup;
            while !node.is_null() {
                ((*node).run)((*node).ud);
                node = (*node).next;
            }

            let mut current = self.current;
            while !current.is_null() {
                let prev = (*current).prev;
                let layout = (*current).layout;
                self.allocator
                    .deallocate(NonNull::new_unchecked(current as *mut u8), layout);
                current = prev;
            }
        }
    }
}

// Safety: the arena hands out raw memory only; sending it requires the
// allocator reference to be sendable.
unsafe impl Send for Arena<'_> where for<'x> &'x dyn Allocator: Send {}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::Global;

    #[test]
    fn pointers_disjoint_and_aligned() {
        let mut arena = Arena::new(&Global);
        let mut ptrs = Vec::new();
        for i in 1..100usize {
            let l = Layout::from_size_align(i, 16).unwrap();
            let p = arena.alloc_raw(l).unwrap();
            assert_eq!(p.as_ptr() as usize % 16, 0);
            ptrs.push((p.as_ptr() as usize, i));
        }
        ptrs.sort();
        for w in ptrs.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0, "allocations overlap");
        }
    }

    #[test]
    fn realloc_preserves_prefix() {
        let mut arena = Arena::new(&Global);
        let old = Layout::from_size_align(16, 8).unwrap();
        let p = arena.alloc_raw(old).unwrap();
        unsafe {
            for i in 0..16 {
                *p.as_ptr().add(i) = i as u8;
            }
        }
        let new = Layout::from_size_align(64, 8).unwrap();
        let q = arena.realloc(p, old, new).unwrap();
        unsafe {
            for i in 0..16 {
                assert_eq!(*q.as_ptr().add(i), i as u8);
            }
        }
    }

    #[test]
    fn bytes_allocated_monotonic() {
        let mut arena = Arena::new(&Global);
        let mut last = 0;
        for _ in 0..50 {
            arena.alloc_raw(Layout::new::<u64>()).unwrap();
            let now = arena.bytes_allocated();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 50 * 8);
    }

    #[test]
    fn large_allocation_gets_own_block() {
        let mut arena = Arena::new(&Global);
        let l = Layout::from_size_align(MAX_BLOCK_SIZE * 2, 8).unwrap();
        let p = arena.alloc_raw(l).unwrap();
        unsafe {
            *p.as_ptr() = 1;
            *p.as_ptr().add(MAX_BLOCK_SIZE * 2 - 1) = 2;
        }
    }

    use std::sync::atomic::{AtomicU64, Ordering};

    // Each cleanup shifts its id into the trace; LIFO order is observable in
    // the final value.
    static CLEANUP_TRACE: AtomicU64 = AtomicU64::new(0);

    unsafe fn record(ud: *mut u8) {
        let id = ud as usize as u64;
        let old = CLEANUP_TRACE.load(Ordering::SeqCst);
        CLEANUP_TRACE.store(old * 10 + id, Ordering::SeqCst);
    }

    #[test]
    fn cleanups_run_lifo() {
        {
            let mut arena = Arena::new(&Global);
            for i in 1..=3u8 {
                arena.add_cleanup(i as usize as *mut u8, record).unwrap();
            }
        }
        assert_eq!(CLEANUP_TRACE.load(Ordering::SeqCst), 321);
    }

    #[test]
    fn initial_buffer_used_first() {
        let mut buf = [0u8; 256];
        let range = buf.as_mut_ptr_range();
        let (lo, hi) = (range.start as usize, range.end as usize);
        let mut arena = Arena::with_initial(&mut buf, &Global);
        let p = arena.alloc_raw(Layout::new::<u64>()).unwrap().as_ptr() as usize;
        assert!(p >= lo && p < hi);
    }
}
