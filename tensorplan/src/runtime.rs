//! Interface to the memory provider which backs a graph's tensor arena
//!
//! The planner never touches real memory until
//! [`Allocator::get_ptr`](crate::alloc::Allocator::get_ptr) is called; at that
//! point, it asks a [`Runtime`] for a single region and carves it up by offset.
use std::ptr::NonNull;
use std::sync::Arc;

use crate::Error;

/// A source of raw memory regions
///
/// Implementations must be shareable between threads, because a single runtime
/// may back many graphs which are planned independently.
pub trait Runtime: Send + Sync + std::fmt::Debug {
    /// Human-readable name, used in logging and graph dumps
    fn name(&self) -> &str;

    /// Requests a region of at least `size` bytes
    fn alloc(&self, size: usize) -> Result<NonNull<u8>, Error>;

    /// Releases a region returned by [`alloc`](Runtime::alloc)
    ///
    /// # Safety
    /// `ptr` must have been returned by `alloc` on this runtime with the same
    /// `size`, and must not be used after this call.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize);
}

////////////////////////////////////////////////////////////////////////////////

/// A bound region of memory inside a graph's arena
///
/// The region is owned by the graph's allocator, so a `Blob` is only valid
/// while its graph is alive.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Blob {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: a `Blob` is an address and a length; the memory behind it is owned
// by the arena, which moves along with its graph.
unsafe impl Send for Blob {}

impl Blob {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Returns the start of the region
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the length of the region in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Checks whether the region is zero-sized
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the region as a range of addresses
    pub fn addr_range(&self) -> std::ops::Range<usize> {
        let start = self.ptr.as_ptr() as usize;
        start..start + self.len
    }
}

////////////////////////////////////////////////////////////////////////////////

/// A single region obtained from a [`Runtime`], released on drop
#[derive(Debug)]
pub(crate) struct Arena {
    ptr: NonNull<u8>,
    len: usize,
    runtime: Arc<dyn Runtime>,
}

// SAFETY: this is philosophically a `Vec<u8>`, so can be sent to other threads
unsafe impl Send for Arena {}

impl Arena {
    pub fn new(runtime: Arc<dyn Runtime>, len: usize) -> Result<Self, Error> {
        let ptr = runtime.alloc(len)?;
        Ok(Self { ptr, len, runtime })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        log::debug!(
            "releasing {} byte arena from {}",
            self.len,
            self.runtime.name()
        );
        // SAFETY: `ptr` and `len` came from `runtime.alloc` in `Arena::new`
        unsafe { self.runtime.dealloc(self.ptr, self.len) }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Host-memory runtime backed by anonymous memory maps
#[cfg(feature = "cpu")]
#[derive(Copy, Clone, Debug, Default)]
pub struct CpuRuntime;

#[cfg(feature = "cpu")]
impl CpuRuntime {
    /// Granularity of mapped regions
    pub const PAGE_SIZE: usize = 4096;

    /// Builds a new CPU runtime, wrapped for sharing with allocators
    pub fn shared() -> Arc<dyn Runtime> {
        Arc::new(Self)
    }

    /// Returns the number of bytes actually mapped for a request of `size`
    ///
    /// Zero-sized requests still map a single page, so that the arena always
    /// has a valid base address.
    fn mapped_len(size: usize) -> usize {
        size.max(1).next_multiple_of(Self::PAGE_SIZE)
    }
}

#[cfg(all(feature = "cpu", not(target_os = "windows")))]
impl Runtime for CpuRuntime {
    fn name(&self) -> &str {
        "cpu"
    }

    fn alloc(&self, size: usize) -> Result<NonNull<u8>, Error> {
        let len = Self::mapped_len(size);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            Err(std::io::Error::last_os_error().into())
        } else {
            NonNull::new(ptr as *mut u8).ok_or_else(|| {
                std::io::Error::other("mmap returned a null pointer").into()
            })
        }
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize) {
        let len = Self::mapped_len(size);
        unsafe {
            libc::munmap(ptr.as_ptr() as *mut libc::c_void, len);
        }
    }
}

#[cfg(all(feature = "cpu", target_os = "windows"))]
impl Runtime for CpuRuntime {
    fn name(&self) -> &str {
        "cpu"
    }

    fn alloc(&self, size: usize) -> Result<NonNull<u8>, Error> {
        use windows::Win32::System::Memory::{
            MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc,
        };
        let len = Self::mapped_len(size);
        let ptr = unsafe {
            VirtualAlloc(None, len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        NonNull::new(ptr as *mut u8)
            .ok_or_else(|| std::io::Error::last_os_error().into())
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, _size: usize) {
        use windows::Win32::System::Memory::{MEM_RELEASE, VirtualFree};
        unsafe {
            let _ = VirtualFree(ptr.as_ptr() as *mut _, 0, MEM_RELEASE);
        }
    }
}

/// Heap-backed runtime which counts its calls, for unit tests
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct CountingRuntime {
    pub allocs: std::sync::atomic::AtomicUsize,
    pub deallocs: std::sync::atomic::AtomicUsize,

    /// When set, the next `alloc` call fails (and clears the flag)
    pub fail_next: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl CountingRuntime {
    fn words(size: usize) -> usize {
        size.div_ceil(8).max(1)
    }
}

#[cfg(test)]
impl Runtime for CountingRuntime {
    fn name(&self) -> &str {
        "counting"
    }

    fn alloc(&self, size: usize) -> Result<NonNull<u8>, Error> {
        use std::sync::atomic::Ordering;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(std::io::Error::other("out of memory").into());
        }
        self.allocs.fetch_add(1, Ordering::SeqCst);
        let buf = vec![0u64; Self::words(size)].into_boxed_slice();
        Ok(NonNull::new(Box::into_raw(buf) as *mut u8).unwrap())
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize) {
        use std::sync::atomic::Ordering;
        self.deallocs.fetch_add(1, Ordering::SeqCst);
        let slice = std::ptr::slice_from_raw_parts_mut(
            ptr.as_ptr() as *mut u64,
            Self::words(size),
        );
        drop(unsafe { Box::from_raw(slice) });
    }
}
