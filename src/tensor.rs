//! Tensor with canonical buffers and single-slot backend-layout caches.
//!
//! A [`Tensor`] holds two [`TensorMemory`] values, one for the data and one
//! for the gradient. Each memory owns the canonical (dense, framework-order)
//! buffer and at most one cached backend-layout copy, identified by the
//! [`LayoutDescriptor`] that produced it. The cached buffer itself is that
//! descriptor's scratch buffer.
//!
//! # Cache states
//!
//! | State | Canonical buffer | Backend copy |
//! |-------|------------------|--------------|
//! | no slot | valid | none |
//! | [`CacheState::Synced`] | valid | valid, same values |
//! | [`CacheState::BackendOnly`] | stale | valid |
//!
//! Reading the canonical buffer of a `BackendOnly` memory converts the backend
//! copy back first. Mutating the canonical buffer drops the slot.
//!
//! The [`Data`] and [`Diff`] tags pick which memory a descriptor works on; the
//! choice is part of the descriptor's type.

use std::fmt;
use std::rc::Rc;

use crate::backend::Backend;
use crate::descriptor::LayoutDescriptor;
use crate::error::{ConvError, ConvResult};

mod sealed {
    pub trait Sealed {}
}

/// Selects the data or gradient memory of a [`Tensor`].
pub trait Side: sealed::Sealed + Sized + 'static {
    /// `"data"` or `"diff"`.
    const NAME: &'static str;

    /// Shared access to this side's memory.
    fn memory<B: Backend>(tensor: &Tensor<B>) -> &TensorMemory<B, Self>;

    /// Exclusive access to this side's memory.
    fn memory_mut<B: Backend>(tensor: &mut Tensor<B>) -> &mut TensorMemory<B, Self>;
}

/// Tensor values.
#[derive(Debug)]
pub enum Data {}

/// Tensor gradients.
#[derive(Debug)]
pub enum Diff {}

impl sealed::Sealed for Data {}
impl sealed::Sealed for Diff {}

impl Side for Data {
    const NAME: &'static str = "data";

    #[inline]
    fn memory<B: Backend>(tensor: &Tensor<B>) -> &TensorMemory<B, Self> {
        &tensor.data
    }

    #[inline]
    fn memory_mut<B: Backend>(tensor: &mut Tensor<B>) -> &mut TensorMemory<B, Self> {
        &mut tensor.data
    }
}

impl Side for Diff {
    const NAME: &'static str = "diff";

    #[inline]
    fn memory<B: Backend>(tensor: &Tensor<B>) -> &TensorMemory<B, Self> {
        &tensor.diff
    }

    #[inline]
    fn memory_mut<B: Backend>(tensor: &mut Tensor<B>) -> &mut TensorMemory<B, Self> {
        &mut tensor.diff
    }
}

/// Freshness of a cached backend-layout copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Canonical and backend copies hold the same values.
    Synced,
    /// Only the backend copy is current.
    BackendOnly,
}

struct CacheSlot<B: Backend, S: Side> {
    descriptor: Rc<LayoutDescriptor<B, S>>,
    state: CacheState,
}

/// Canonical buffer plus its single-slot backend-layout cache.
pub struct TensorMemory<B: Backend, S: Side> {
    canonical: Vec<f32>,
    slot: Option<CacheSlot<B, S>>,
}

impl<B: Backend, S: Side> TensorMemory<B, S> {
    fn zeroed(len: usize) -> Self {
        Self {
            canonical: vec![0.0; len],
            slot: None,
        }
    }

    /// Number of canonical elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    /// Is empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }

    /// Brings the canonical buffer up to date with a `BackendOnly` cache.
    pub fn sync(&mut self) -> ConvResult<()> {
        if let Some(slot) = &mut self.slot {
            if slot.state == CacheState::BackendOnly {
                slot.descriptor.materialize_into(&mut self.canonical)?;
                slot.state = CacheState::Synced;
            }
        }
        Ok(())
    }

    /// Canonical buffer, materialized from the backend copy if stale.
    pub fn canonical(&mut self) -> ConvResult<&[f32]> {
        self.sync()?;
        Ok(&self.canonical)
    }

    /// Mutable canonical buffer. Drops the cache slot after syncing.
    pub fn canonical_mut(&mut self) -> ConvResult<&mut [f32]> {
        self.sync()?;
        self.slot = None;
        Ok(&mut self.canonical)
    }

    /// Mutable canonical buffer for a writer that overwrites every element.
    ///
    /// Drops the cache slot without syncing.
    pub(crate) fn canonical_for_overwrite(&mut self) -> &mut [f32] {
        self.slot = None;
        &mut self.canonical
    }

    /// Canonical buffer as currently stored, without syncing.
    ///
    /// Stale when [`cache_state`](Self::cache_state) is `BackendOnly`.
    pub fn canonical_unsynced(&self) -> &[f32] {
        &self.canonical
    }

    /// Descriptor whose scratch buffer holds the cached copy.
    pub fn cached_descriptor(&self) -> Option<&Rc<LayoutDescriptor<B, S>>> {
        self.slot.as_ref().map(|slot| &slot.descriptor)
    }

    /// State of the cache slot, `None` if empty.
    pub fn cache_state(&self) -> Option<CacheState> {
        self.slot.as_ref().map(|slot| slot.state)
    }

    /// Syncs and empties the cache slot.
    pub fn release_cache(&mut self) -> ConvResult<()> {
        self.sync()?;
        self.slot = None;
        Ok(())
    }

    pub(crate) fn set_cached(&mut self, descriptor: Rc<LayoutDescriptor<B, S>>, state: CacheState) {
        self.slot = Some(CacheSlot { descriptor, state });
    }
}

impl<B: Backend, S: Side> fmt::Debug for TensorMemory<B, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorMemory")
            .field("side", &S::NAME)
            .field("len", &self.canonical.len())
            .field("cached", &self.slot.as_ref().map(|s| (s.descriptor.label(), s.state)))
            .finish()
    }
}

/// N-dimensional `f32` tensor with data and gradient memories.
///
/// Convolution tensors are `[num, channels, height, width]`; the bias is
/// `[channels]`. The legacy accessors treat missing trailing axes as 1.
pub struct Tensor<B: Backend> {
    shape: Vec<usize>,
    data: TensorMemory<B, Data>,
    diff: TensorMemory<B, Diff>,
}

impl<B: Backend> Tensor<B> {
    /// Zero-filled tensor.
    pub fn new(shape: &[usize]) -> Self {
        let count = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: TensorMemory::zeroed(count),
            diff: TensorMemory::zeroed(count),
        }
    }

    /// Tensor initialised from canonical data. Gradient is zero.
    pub fn from_data(shape: &[usize], data: Vec<f32>) -> ConvResult<Self> {
        let mut tensor = Self::new(shape);
        if data.len() != tensor.count() {
            return Err(ConvError::shape_mismatch("tensor data", &[tensor.count()], &[data.len()]));
        }
        tensor.data.canonical = data;
        Ok(tensor)
    }

    /// Full shape.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    #[inline]
    pub fn count(&self) -> usize {
        self.data.len()
    }

    /// Extent of `axis`, 1 past the last axis.
    #[inline]
    pub fn legacy_dim(&self, axis: usize) -> usize {
        self.shape.get(axis).copied().unwrap_or(1)
    }

    /// Batch extent.
    #[inline]
    pub fn num(&self) -> usize {
        self.legacy_dim(0)
    }

    /// Channel extent.
    #[inline]
    pub fn channels(&self) -> usize {
        self.legacy_dim(1)
    }

    /// Height extent.
    #[inline]
    pub fn height(&self) -> usize {
        self.legacy_dim(2)
    }

    /// Width extent.
    #[inline]
    pub fn width(&self) -> usize {
        self.legacy_dim(3)
    }

    /// `[num, channels, height, width]`.
    pub fn shape4(&self) -> [usize; 4] {
        [self.num(), self.channels(), self.height(), self.width()]
    }

    /// Canonical values, synced from any lazily-written backend copy.
    pub fn data(&mut self) -> ConvResult<&[f32]> {
        self.data.canonical()
    }

    /// Mutable canonical values. Invalidates the cached copy.
    pub fn data_mut(&mut self) -> ConvResult<&mut [f32]> {
        self.data.canonical_mut()
    }

    /// Canonical gradient, synced from any lazily-written backend copy.
    pub fn diff(&mut self) -> ConvResult<&[f32]> {
        self.diff.canonical()
    }

    /// Mutable canonical gradient. Invalidates the cached copy.
    pub fn diff_mut(&mut self) -> ConvResult<&mut [f32]> {
        self.diff.canonical_mut()
    }

    /// Overwrites the canonical values.
    pub fn set_data(&mut self, values: &[f32]) -> ConvResult<()> {
        Self::copy_into("data", self.data.canonical_for_overwrite(), values)
    }

    /// Overwrites the canonical gradient.
    pub fn set_diff(&mut self, values: &[f32]) -> ConvResult<()> {
        Self::copy_into("diff", self.diff.canonical_for_overwrite(), values)
    }

    /// Memory for side `S`.
    #[inline]
    pub fn memory<S: Side>(&self) -> &TensorMemory<B, S> {
        S::memory(self)
    }

    /// Mutable memory for side `S`.
    #[inline]
    pub fn memory_mut<S: Side>(&mut self) -> &mut TensorMemory<B, S> {
        S::memory_mut(self)
    }

    fn copy_into(what: &str, dst: &mut [f32], values: &[f32]) -> ConvResult<()> {
        if dst.len() != values.len() {
            return Err(ConvError::shape_mismatch(
                format!("tensor {what}"),
                &[dst.len()],
                &[values.len()],
            ));
        }
        dst.copy_from_slice(values);
        Ok(())
    }
}

impl<B: Backend> fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data", &self.data)
            .field("diff", &self.diff)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuBackend;

    type CpuTensor = Tensor<CpuBackend>;

    #[test]
    fn test_legacy_accessors() {
        let t = CpuTensor::new(&[2, 3, 4, 5]);
        assert_eq!(t.shape4(), [2, 3, 4, 5]);
        assert_eq!(t.count(), 120);

        let bias = CpuTensor::new(&[7]);
        assert_eq!(bias.shape4(), [7, 1, 1, 1]);
    }

    #[test]
    fn test_from_data_checks_length() {
        assert!(CpuTensor::from_data(&[2, 2], vec![1.0; 4]).is_ok());
        assert!(CpuTensor::from_data(&[2, 2], vec![1.0; 3]).is_err());
    }

    #[test]
    fn test_data_and_diff_are_independent() {
        let mut t = CpuTensor::from_data(&[3], vec![1.0, 2.0, 3.0]).unwrap();
        t.set_diff(&[4.0, 5.0, 6.0]).unwrap();
        assert_eq!(t.data().unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(t.diff().unwrap(), &[4.0, 5.0, 6.0]);
        assert!(t.set_data(&[1.0]).is_err());
    }

    #[test]
    fn test_fresh_memory_has_no_cache() {
        let t = CpuTensor::new(&[4]);
        assert!(t.memory::<Data>().cached_descriptor().is_none());
        assert_eq!(t.memory::<Diff>().cache_state(), None);
    }
}
