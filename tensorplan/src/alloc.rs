//! Planning-time memory allocator
//!
//! The [`Allocator`] hands out byte offsets within an arena that does not yet
//! exist.  Once every offset has been planned, [`Allocator::get_ptr`]
//! requests a single region of `peak` bytes from the [`Runtime`], after which
//! the plan is frozen.
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::{
    Error,
    runtime::{Arena, Runtime},
};

/// Default alignment, matching the widest supported scalar type
pub const DEFAULT_ALIGNMENT: usize = std::mem::size_of::<u64>();

/// Snapshot of allocator counters
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AllocInfo {
    /// Bytes currently handed out
    pub used: usize,
    /// Size of the arena required to hold every allocation so far
    pub peak: usize,
}

/// First-fit free-list allocator over a not-yet-materialized arena
///
/// ```text
///   0                                                         peak
///   |--- used ---|... free ...|------ used ------|.. free ..|
///                ^                               ^
///                free_blocks[start] = len        free_blocks[start] = len
/// ```
///
/// Free blocks are kept in address order and are always fully coalesced: no
/// two free blocks are adjacent.
#[derive(Debug)]
pub struct Allocator {
    /// Memory provider, used exactly once when the arena is materialized
    runtime: Arc<dyn Runtime>,

    /// Bytes currently allocated
    used: usize,

    /// High-water mark; the arena will be exactly this large
    peak: usize,

    /// Every offset and size is a multiple of this value
    alignment: usize,

    /// Map from the start of a free block to its length
    free_blocks: BTreeMap<usize, usize>,

    /// Backing storage, populated on the first call to `get_ptr`
    arena: Option<Arena>,
}

impl Allocator {
    /// Builds a new allocator with the default alignment
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self {
            runtime,
            used: 0,
            peak: 0,
            alignment: DEFAULT_ALIGNMENT,
            free_blocks: BTreeMap::new(),
            arena: None,
        }
    }

    /// Builds a new allocator with a custom alignment
    ///
    /// Returns an error if `alignment` is not a nonzero power of two.
    pub fn with_alignment(
        runtime: Arc<dyn Runtime>,
        alignment: usize,
    ) -> Result<Self, Error> {
        if !alignment.is_power_of_two() {
            return Err(Error::BadAlignment(alignment));
        }
        let mut out = Self::new(runtime);
        out.alignment = alignment;
        Ok(out)
    }

    /// Returns the alignment of every offset and size
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Rounds `size` up to the allocator's alignment
    ///
    /// Zero-sized requests occupy one alignment unit, so that every live
    /// allocation has a distinct offset.
    pub fn aligned_size(&self, size: usize) -> usize {
        size.max(1).next_multiple_of(self.alignment)
    }

    /// Reserves `size` bytes, returning their offset from the arena base
    ///
    /// # Panics
    /// If the arena has already been materialized by [`get_ptr`](Self::get_ptr)
    pub fn alloc(&mut self, size: usize) -> usize {
        assert!(
            self.arena.is_none(),
            "cannot allocate after the arena has been materialized"
        );
        let size = self.aligned_size(size);

        let found = self
            .free_blocks
            .iter()
            .find(|(_, len)| **len >= size)
            .map(|(start, len)| (*start, *len));

        let offset = match found {
            Some((start, len)) => {
                self.free_blocks.remove(&start);
                if len > size {
                    self.free_blocks.insert(start + size, len - size);
                }
                start
            }
            None => {
                let out = self.peak;
                self.peak += size;
                out
            }
        };
        self.used += size;
        log::debug!("alloc {size} bytes at offset {offset}");
        offset
    }

    /// Returns a range to the free list, merging it with its neighbors
    ///
    /// # Panics
    /// If the arena has already been materialized, or if the range was never
    /// allocated (lies beyond `peak` or overlaps a free block).
    pub fn free(&mut self, offset: usize, size: usize) {
        assert!(
            self.arena.is_none(),
            "cannot free after the arena has been materialized"
        );
        let size = self.aligned_size(size);
        let end = offset + size;
        assert!(
            offset % self.alignment == 0,
            "offset {offset} is not aligned to {}",
            self.alignment
        );
        assert!(end <= self.peak, "range {offset}..{end} exceeds peak");
        if let Some((start, len)) = self.free_blocks.range(..end).next_back() {
            assert!(
                start + len <= offset,
                "range {offset}..{end} overlaps free block at {start}"
            );
        }
        assert!(self.used >= size, "freed more memory than was allocated");
        self.used -= size;

        let mut start = offset;
        let mut len = size;

        // Merge with the block immediately below us
        let below = self
            .free_blocks
            .range(..offset)
            .next_back()
            .map(|(s, l)| (*s, *l));
        if let Some((s, l)) = below {
            if s + l == offset {
                self.free_blocks.remove(&s);
                start = s;
                len += l;
            }
        }

        // Merge with the block immediately above us
        if let Some(l) = self.free_blocks.remove(&end) {
            len += l;
        }

        self.free_blocks.insert(start, len);
        log::debug!("free {size} bytes at offset {offset}");
    }

    /// Returns the base pointer of the arena, materializing it if needed
    ///
    /// The first call requests `peak` bytes from the runtime; subsequent calls
    /// return the same pointer.  After this, [`alloc`](Self::alloc) and
    /// [`free`](Self::free) will panic.
    pub fn get_ptr(&mut self) -> Result<NonNull<u8>, Error> {
        if let Some(arena) = &self.arena {
            return Ok(arena.as_ptr());
        }
        let arena = Arena::new(self.runtime.clone(), self.peak)?;
        log::info!(
            "allocator materialized {} bytes from `{}` at {:p}",
            arena.len(),
            self.runtime.name(),
            arena.as_ptr()
        );
        let ptr = arena.as_ptr();
        self.arena = Some(arena);
        Ok(ptr)
    }

    /// Checks whether the arena has been materialized
    pub fn is_materialized(&self) -> bool {
        self.arena.is_some()
    }

    /// Reports the current counters
    pub fn info(&self) -> AllocInfo {
        log::info!("used memory: {}, peak memory: {}", self.used, self.peak);
        AllocInfo {
            used: self.used,
            peak: self.peak,
        }
    }

    /// Bytes currently allocated
    pub fn used(&self) -> usize {
        self.used
    }

    /// Size of the arena required so far
    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Iterates over `(start, len)` free blocks in address order
    pub fn free_blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free_blocks.iter().map(|(s, l)| (*s, *l))
    }

    /// Returns the runtime which backs this allocator
    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }
}
