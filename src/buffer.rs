//! Aligned scratch storage for backend-layout buffers.
//!
//! Every [`LayoutDescriptor`](crate::LayoutDescriptor) that needs conversions
//! owns one [`AlignedBuffer`] sized for its backend layout. The buffer is
//! allocated once when the descriptor is finalized and reused by every
//! forward/backward call for the lifetime of the plan.
//!
//! # Memory Alignment
//!
//! Allocations use 64-byte alignment ([`CACHE_LINE`]) so blocked layouts whose
//! inner block is 8 or 16 lanes start on a cache line.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Cache line size for memory alignment (64 bytes).
pub const CACHE_LINE: usize = 64;

/// 64-byte aligned, zero-initialised, fixed-length `f32` buffer.
///
/// # Example
///
/// ```rust
/// use dnnconv::AlignedBuffer;
///
/// let mut buf = AlignedBuffer::zeroed(1024);
/// buf[0] = 1.0;
/// assert_eq!(buf.len(), 1024);
/// assert_eq!(buf.as_ptr() as usize % dnnconv::CACHE_LINE, 0);
/// ```
pub struct AlignedBuffer {
    ptr: NonNull<f32>,
    len: usize,
}

// Safety: AlignedBuffer owns its data and doesn't share it
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Creates an empty buffer without allocating.
    pub fn new() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
        }
    }

    /// Allocates `len` zeroed elements.
    pub fn zeroed(len: usize) -> Self {
        if len == 0 {
            return Self::new();
        }

        let layout = Self::layout(len);
        // SAFETY: layout has non-zero size, allocation failure handled via handle_alloc_error
        let ptr = unsafe {
            let raw = alloc_zeroed(layout);
            if raw.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            NonNull::new_unchecked(raw as *mut f32)
        };

        Self { ptr, len }
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Is empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets every element to zero.
    #[inline]
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0.0);
    }

    /// Returns a slice of the buffer.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        if self.len == 0 {
            &[]
        } else {
            // SAFETY: ptr is valid for `len` contiguous initialised elements
            unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
        }
    }

    /// Returns a mutable slice of the buffer.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        if self.len == 0 {
            &mut []
        } else {
            // SAFETY: ptr uniquely owned, valid for `len` contiguous elements
            unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
        }
    }

    /// Raw pointer, stable for the buffer's lifetime.
    #[inline]
    pub fn as_ptr(&self) -> *const f32 {
        self.ptr.as_ptr()
    }

    fn layout(len: usize) -> Layout {
        let bytes = len
            .checked_mul(std::mem::size_of::<f32>())
            .unwrap_or_else(|| panic!("scratch buffer of {len} elements overflows usize"));
        match Layout::from_size_align(bytes, CACHE_LINE) {
            Ok(layout) => layout,
            Err(err) => panic!("invalid scratch layout for {len} elements: {err}"),
        }
    }
}

impl Default for AlignedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        if self.len > 0 {
            // SAFETY: layout matches the allocation made in `zeroed`
            unsafe {
                dealloc(self.ptr.as_ptr() as *mut u8, Self::layout(self.len));
            }
        }
    }
}

impl Deref for AlignedBuffer {
    type Target = [f32];

    #[inline]
    fn deref(&self) -> &[f32] {
        self.as_slice()
    }
}

impl DerefMut for AlignedBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [f32] {
        self.as_mut_slice()
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_is_aligned_and_zero() {
        let buf = AlignedBuffer::zeroed(100);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.as_ptr() as usize % CACHE_LINE, 0);
        assert!(buf.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_empty() {
        let buf = AlignedBuffer::zeroed(0);
        assert!(buf.is_empty());
        assert!(buf.as_slice().is_empty());
    }

    #[test]
    fn test_write_and_zero() {
        let mut buf = AlignedBuffer::zeroed(16);
        for (i, v) in buf.iter_mut().enumerate() {
            *v = i as f32;
        }
        assert_eq!(buf[15], 15.0);
        buf.zero();
        assert!(buf.iter().all(|&v| v == 0.0));
    }
}
