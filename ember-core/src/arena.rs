//! Linear arena allocator.
//!
//! A bump allocator over a large reserved virtual-address region with a
//! committed prefix that grows by doubling and shrinks when usage drops.
//! Allocations are LIFO: `pop` only accepts the most recent allocation,
//! and markers restore the arena to an earlier watermark.
//!
//! Layout of a single allocation inside the region:
//!
//! ```text
//! | header: prev_alloc_size (u64) | pad 1..=256 | shift byte | user data |
//! ```
//!
//! The byte immediately before the user pointer stores the pad length
//! (256 is encoded as 0), so the raw slot start can be reconstructed from
//! the aligned pointer alone.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;

pub const ARENA_MIN_CAPACITY: u64 = crate::SIZE_MB;

const HEADER_SIZE: u64 = size_of::<u64>() as u64;

static NEXT_ARENA_ID: AtomicU32 = AtomicU32::new(0);

/// A watermark captured from an [`Arena`], restored with
/// [`Arena::pop_to_marker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaMarker {
    value: u64,
}

impl ArenaMarker {
    #[inline]
    pub fn value(&self) -> u64 {
        self.value
    }
}

pub struct Arena {
    map: MmapMut,
    id: u32,
    last_alloc_size: u64,
    size: u64,
    capacity: u64,
    reserved_capacity: u64,
}

// The backing mapping is owned and only reachable through &mut self.
unsafe impl Send for Arena {}

impl Arena {
    /// Reserve `reserved` bytes of address space with `committed` bytes
    /// initially resident. Both should be page multiples;
    /// `committed` must be at least [`ARENA_MIN_CAPACITY`].
    pub fn new(reserved: u64, committed: u64) -> io::Result<Self> {
        assert!(committed >= ARENA_MIN_CAPACITY);
        assert!(committed <= reserved);

        let map = MmapMut::map_anon(reserved as usize)?;

        Ok(Self {
            map,
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            last_alloc_size: 0,
            size: 0,
            capacity: committed,
            reserved_capacity: reserved,
        })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[inline]
    pub fn reserved_capacity(&self) -> u64 {
        self.reserved_capacity
    }

    /// Bump-allocate `size` bytes aligned to `align`.
    ///
    /// `align` must be a power of two, at most 256. Running out of the
    /// reserved region is a fatal error.
    pub fn push_aligned(&mut self, size: u64, align: u32) -> NonNull<u8> {
        assert!(size > 0);
        assert!(align.is_power_of_two() && align <= 256);

        let alloc_size = size + align as u64 + HEADER_SIZE;
        let mut total = self.size + alloc_size;
        while total > self.capacity {
            let new_capacity = 2 * self.capacity;
            assert!(
                new_capacity <= self.reserved_capacity,
                "arena exhausted its reserved address space"
            );
            self.capacity = new_capacity;
            total = self.size + alloc_size;
        }

        // SAFETY: the whole range [0, capacity) lies inside the mapping and
        // is only reachable through &mut self.
        unsafe {
            let unaligned = self.map.as_mut_ptr().add(self.size as usize);
            (unaligned as *mut u64).write_unaligned(self.last_alloc_size);

            let mask = align as usize - 1;
            let after_header = unaligned.add(HEADER_SIZE as usize);
            let mut aligned =
                ((after_header as usize + mask) & !mask) as *mut u8;
            if aligned == after_header {
                aligned = aligned.add(align as usize);
            }

            let shift = aligned.offset_from(after_header) as u64;
            debug_assert!(shift >= 1 && shift <= 256);
            *aligned.sub(1) = (shift & 0xFF) as u8;

            self.last_alloc_size = size + shift + HEADER_SIZE;
            self.size += self.last_alloc_size;
            NonNull::new_unchecked(aligned)
        }
    }

    /// Typed allocation of `count` values of `T`. The memory is
    /// uninitialized.
    pub fn push<T>(&mut self, count: usize) -> NonNull<T> {
        assert!(count > 0);
        self.push_aligned((size_of::<T>() * count) as u64, align_of::<T>() as u32)
            .cast()
    }

    /// Pop the most recent allocation. `ptr` must be the pointer returned
    /// by the latest `push_aligned` that has not already been popped.
    pub fn pop(&mut self, ptr: NonNull<u8>) {
        // SAFETY: the shift byte and header were written by push_aligned
        // directly before `ptr`.
        unsafe {
            let aligned = ptr.as_ptr();
            let mut shift = *aligned.sub(1) as u64;
            if shift == 0 {
                shift = 256;
            }
            let raw = aligned.sub(shift as usize + HEADER_SIZE as usize);

            let expected = self
                .map
                .as_mut_ptr()
                .add((self.size - self.last_alloc_size) as usize);
            assert!(
                raw == expected,
                "arena pop does not match the most recent allocation"
            );

            self.size -= self.last_alloc_size;
            self.last_alloc_size = (raw as *const u64).read_unaligned();
        }
    }

    #[inline]
    pub fn marker(&self) -> ArenaMarker {
        ArenaMarker { value: self.size }
    }

    /// Restore the arena to a previously captured watermark.
    ///
    /// Only `size` is restored; calling `pop` after this without a new
    /// `push_aligned` in between is unsupported. Shrinks the committed
    /// prefix when usage falls below a quarter of capacity.
    pub fn pop_to_marker(&mut self, marker: ArenaMarker) {
        debug_assert!(marker.value <= self.size);
        self.size = marker.value;

        if self.capacity > ARENA_MIN_CAPACITY && self.size < self.capacity / 4 {
            let new_capacity = self.capacity / 2;
            self.decommit(new_capacity, self.capacity - new_capacity);
            self.capacity = new_capacity;
        }
    }

    /// Drop every allocation and decommit down to the minimum capacity.
    pub fn reset(&mut self) {
        self.size = 0;
        if self.capacity > ARENA_MIN_CAPACITY {
            self.decommit(ARENA_MIN_CAPACITY, self.capacity - ARENA_MIN_CAPACITY);
        }
        self.capacity = ARENA_MIN_CAPACITY;
    }

    #[cfg(unix)]
    fn decommit(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        // Releases the physical pages; the address range stays reserved.
        // SAFETY: the range starts at the new capacity, above every live
        // allocation, and reads as zero pages when committed again.
        let _ = unsafe {
            self.map.unchecked_advise_range(
                memmap2::UncheckedAdvice::DontNeed,
                offset as usize,
                len as usize,
            )
        };
    }

    #[cfg(not(unix))]
    fn decommit(&mut self, _offset: u64, _len: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SIZE_KB, SIZE_MB};

    fn test_arena() -> Arena {
        Arena::new(64 * SIZE_MB, SIZE_MB).unwrap()
    }

    #[test]
    fn push_pop_returns_to_empty() {
        let mut arena = test_arena();

        let a = arena.push_aligned(7, 64);
        assert_eq!(a.as_ptr() as usize % 64, 0);
        assert!(arena.last_alloc_size >= 7 + 1 + HEADER_SIZE);
        assert!(arena.last_alloc_size <= 7 + 64 + HEADER_SIZE);
        assert!(arena.size > 0);

        arena.pop(a);
        assert_eq!(arena.size(), 0);
    }

    #[test]
    fn lifo_sequence_restores_empty_and_alignment_holds() {
        let mut arena = test_arena();
        let aligns = [1u32, 2, 4, 8, 16, 32, 64, 128, 256];

        let mut ptrs = Vec::new();
        for (i, &align) in aligns.iter().enumerate() {
            let p = arena.push_aligned((i as u64 + 1) * 13, align);
            assert_eq!(p.as_ptr() as usize % align as usize, 0);
            ptrs.push(p);
        }

        for p in ptrs.into_iter().rev() {
            arena.pop(p);
        }
        assert_eq!(arena.size(), 0);
        assert_eq!(arena.last_alloc_size, 0);
    }

    #[test]
    fn shift_byte_encodes_256_as_zero() {
        let mut arena = test_arena();

        // Arrange the watermark so the next slot's header ends exactly on
        // a 256 boundary: mmap bases are page aligned, and 239 + shift(1)
        // + header(8) leaves size = 248, so 248 + 8 = 256.
        let first = arena.push_aligned(239, 1);
        assert_eq!(arena.size(), 248);

        let p = arena.push_aligned(10, 256);
        let stored = unsafe { *p.as_ptr().sub(1) };
        assert_eq!(stored, 0, "a full 256 byte shift is stored as 0");

        arena.pop(p);
        arena.pop(first);
        assert_eq!(arena.size(), 0);
    }

    #[test]
    fn marker_roundtrip() {
        let mut arena = test_arena();

        let _keep = arena.push_aligned(100, 8);
        let marker = arena.marker();

        arena.push_aligned(1000, 16);
        arena.push_aligned(50, 32);
        assert!(arena.size() > marker.value());

        arena.pop_to_marker(marker);
        assert_eq!(arena.marker().value(), marker.value());
    }

    #[test]
    fn capacity_doubles_under_pressure_and_shrinks_back() {
        let mut arena = test_arena();
        assert_eq!(arena.capacity(), SIZE_MB);

        let marker = arena.marker();
        arena.push_aligned(3 * SIZE_MB, 8);
        assert!(arena.capacity() >= 4 * SIZE_MB);
        assert!(arena.capacity() <= arena.reserved_capacity());

        arena.pop_to_marker(marker);
        assert!(arena.capacity() < 4 * SIZE_MB);

        arena.reset();
        assert_eq!(arena.capacity(), ARENA_MIN_CAPACITY);
        assert_eq!(arena.size(), 0);
    }

    #[test]
    fn shrink_only_drops_pages_above_the_watermark() {
        let mut arena = test_arena();

        let kept = arena.push::<u64>(8);
        unsafe {
            for i in 0..8 {
                kept.as_ptr().add(i).write(0xABCD_0000 + i as u64);
            }
        }

        let marker = arena.marker();
        arena.push_aligned(3 * SIZE_MB, 8);
        assert!(arena.capacity() >= 4 * SIZE_MB);
        arena.pop_to_marker(marker);
        assert!(arena.capacity() < 4 * SIZE_MB);

        unsafe {
            for i in 0..8 {
                assert_eq!(*kept.as_ptr().add(i), 0xABCD_0000 + i as u64);
            }
        }
    }

    #[test]
    fn typed_push_respects_type_alignment() {
        #[repr(align(64))]
        struct Wide([u8; 64]);

        let mut arena = test_arena();
        let p = arena.push::<Wide>(3);
        assert_eq!(p.as_ptr() as usize % 64, 0);
    }

    #[test]
    fn data_survives_until_pop() {
        let mut arena = test_arena();
        let p = arena.push::<u32>(4);
        unsafe {
            for i in 0..4 {
                p.as_ptr().add(i).write(i as u32 * 11);
            }
            for i in 0..4 {
                assert_eq!(*p.as_ptr().add(i), i as u32 * 11);
            }
        }
        arena.pop(p.cast());
        assert_eq!(arena.size(), 0);
    }

    #[test]
    #[should_panic]
    fn pop_of_stale_pointer_panics() {
        let mut arena = test_arena();
        let a = arena.push_aligned(SIZE_KB, 8);
        let _b = arena.push_aligned(SIZE_KB, 8);
        arena.pop(a);
    }
}
