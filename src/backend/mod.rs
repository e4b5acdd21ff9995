//! Compute backend interface.
//!
//! The convolution math and the backend-preferred memory layouts live behind
//! the [`Backend`] trait. The rest of the crate only ever:
//!
//! - creates convolution primitives from a [`ConvDescriptor`],
//! - asks a primitive which layout it wants for a [`Resource`],
//! - builds explicit strided layouts for canonical tensors,
//! - compares layouts and creates conversions between them,
//! - executes a primitive against a [`ResourceTable`].
//!
//! Every fallible call returns a non-zero [`Status`] on failure.
//!
//! [`CpuBackend`](cpu::CpuBackend) is the reference implementation.

pub mod cpu;

use std::fmt;

/// Backend status code. Zero means success and is never stored here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    /// A parameter combination the backend rejects.
    pub const INCORRECT_INPUT: Status = Status(-1);
    /// A resource the primitive needs is missing from the table.
    pub const MISSING_RESOURCE: Status = Status(-3);
    /// The operation exists but is not implemented for these layouts.
    pub const UNIMPLEMENTED: Status = Status(-127);
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a backend call.
pub type BackendResult<T> = Result<T, Status>;

/// Computation performed by a convolution primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvKind {
    /// `{src, filter, bias} -> dst`
    Forward,
    /// `{diff_dst, filter} -> diff_src`
    BackwardData,
    /// `{src, diff_dst} -> diff_filter`
    BackwardFilter,
    /// `{diff_dst} -> diff_bias`
    BackwardBias,
}

impl ConvKind {
    /// Short name used in error contexts and log lines.
    pub fn name(self) -> &'static str {
        match self {
            ConvKind::Forward => "forward",
            ConvKind::BackwardData => "backward-data",
            ConvKind::BackwardFilter => "backward-filter",
            ConvKind::BackwardBias => "backward-bias",
        }
    }

    /// Resources read by this computation.
    pub fn inputs(self) -> &'static [Resource] {
        match self {
            ConvKind::Forward => &[Resource::Src, Resource::Filter, Resource::Bias],
            ConvKind::BackwardData => &[Resource::DiffDst, Resource::Filter],
            ConvKind::BackwardFilter => &[Resource::Src, Resource::DiffDst],
            ConvKind::BackwardBias => &[Resource::DiffDst],
        }
    }

    /// Resource written by this computation.
    pub fn output(self) -> Resource {
        match self {
            ConvKind::Forward => Resource::Dst,
            ConvKind::BackwardData => Resource::DiffSrc,
            ConvKind::BackwardFilter => Resource::DiffFilter,
            ConvKind::BackwardBias => Resource::DiffBias,
        }
    }

    /// Whether the primitive touches `resource`.
    pub fn uses(self, resource: Resource) -> bool {
        self.output() == resource || self.inputs().contains(&resource)
    }
}

/// Named slot in a primitive's contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Input activations.
    Src,
    /// Convolution filter.
    Filter,
    /// Per-output-channel bias.
    Bias,
    /// Output activations.
    Dst,
    /// Gradient w.r.t. the input.
    DiffSrc,
    /// Gradient w.r.t. the filter.
    DiffFilter,
    /// Gradient w.r.t. the bias.
    DiffBias,
    /// Gradient w.r.t. the output.
    DiffDst,
    /// Conversion source.
    From,
    /// Conversion destination.
    To,
}

impl Resource {
    /// Number of resource slots.
    pub const COUNT: usize = 10;

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Src => "src",
            Resource::Filter => "filter",
            Resource::Bias => "bias",
            Resource::Dst => "dst",
            Resource::DiffSrc => "diff_src",
            Resource::DiffFilter => "diff_filter",
            Resource::DiffBias => "diff_bias",
            Resource::DiffDst => "diff_dst",
            Resource::From => "from",
            Resource::To => "to",
        };
        f.write_str(name)
    }
}

/// Static description of a (possibly grouped) 2-D convolution.
///
/// Extents are fastest-varying first, as in
/// [`CanonicalLayout`](crate::CanonicalLayout). `group == 1` is the ordinary
/// convolution; there is no separate non-grouped entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvDescriptor {
    /// Channel group count.
    pub groups: usize,
    /// `[iw, ih, ic, n]`
    pub src_sizes: [usize; 4],
    /// `[ow, oh, oc, n]`
    pub dst_sizes: [usize; 4],
    /// `[kw, kh, ic/g, oc]`
    pub filter_sizes: [usize; 4],
    /// `[stride_w, stride_h]`
    pub strides: [usize; 2],
    /// `[-pad_w, -pad_h]`; out-of-range taps read zero.
    pub input_offset: [isize; 2],
}

/// A buffer bound to one resource slot.
#[derive(Debug)]
pub enum Binding<'a> {
    /// Read-only input.
    Read(&'a [f32]),
    /// Output written by the primitive.
    Write(&'a mut [f32]),
}

/// Table of resource → buffer handed to [`Backend::execute`].
#[derive(Debug, Default)]
pub struct ResourceTable<'a> {
    slots: [Option<Binding<'a>>; Resource::COUNT],
}

impl<'a> ResourceTable<'a> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a read-only buffer.
    pub fn bind_read(&mut self, resource: Resource, buffer: &'a [f32]) -> &mut Self {
        self.slots[resource.index()] = Some(Binding::Read(buffer));
        self
    }

    /// Binds an output buffer.
    pub fn bind_write(&mut self, resource: Resource, buffer: &'a mut [f32]) -> &mut Self {
        self.slots[resource.index()] = Some(Binding::Write(buffer));
        self
    }

    /// Returns a read-only view of `resource`, if bound for reading.
    pub fn read(&self, resource: Resource) -> BackendResult<&'a [f32]> {
        match &self.slots[resource.index()] {
            Some(Binding::Read(buffer)) => Ok(*buffer),
            _ => Err(Status::MISSING_RESOURCE),
        }
    }

    /// Moves the output buffer for `resource` out of the table.
    pub fn take_write(&mut self, resource: Resource) -> BackendResult<&'a mut [f32]> {
        match self.slots[resource.index()].take() {
            Some(Binding::Write(buffer)) => Ok(buffer),
            other => {
                self.slots[resource.index()] = other;
                Err(Status::MISSING_RESOURCE)
            }
        }
    }
}

/// Optimized compute backend.
///
/// Layouts and primitives are opaque to the caller. Primitives are released by
/// dropping them.
pub trait Backend {
    /// Opaque memory layout handle.
    type Layout: Clone + fmt::Debug;

    /// Opaque pre-planned computation (convolution or conversion).
    type Primitive;

    /// Creates a convolution primitive of the given kind.
    fn create_convolution(
        &self,
        kind: ConvKind,
        desc: &ConvDescriptor,
    ) -> BackendResult<Self::Primitive>;

    /// Layout the primitive prefers for `resource`.
    fn layout_from_primitive(
        &self,
        primitive: &Self::Primitive,
        resource: Resource,
    ) -> BackendResult<Self::Layout>;

    /// Explicit strided layout. Sizes and strides are fastest-varying first.
    fn layout_from_strides(&self, sizes: &[usize], strides: &[usize]) -> BackendResult<Self::Layout>;

    /// Whether two layouts describe the same memory arrangement.
    fn layouts_equal(&self, a: &Self::Layout, b: &Self::Layout) -> bool;

    /// Elements a buffer in `layout` must hold, padding included.
    fn layout_memory_size(&self, layout: &Self::Layout) -> usize;

    /// Conversion primitive from `from` to `to`.
    ///
    /// May fail when the backend cannot bridge the two layouts directly.
    fn create_conversion(&self, from: &Self::Layout, to: &Self::Layout) -> BackendResult<Self::Primitive>;

    /// Runs a primitive to completion.
    fn execute(&self, primitive: &Self::Primitive, resources: &mut ResourceTable<'_>) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_table_read_write() {
        let src = [1.0f32, 2.0];
        let mut dst = [0.0f32; 2];
        let mut table = ResourceTable::new();
        table
            .bind_read(Resource::From, &src)
            .bind_write(Resource::To, &mut dst);

        let from = table.read(Resource::From).unwrap();
        let to = table.take_write(Resource::To).unwrap();
        to.copy_from_slice(from);
        assert_eq!(dst, [1.0, 2.0]);
    }

    #[test]
    fn test_resource_table_missing() {
        let src = [1.0f32];
        let mut table = ResourceTable::new();
        table.bind_read(Resource::Src, &src);

        assert_eq!(table.read(Resource::Dst), Err(Status::MISSING_RESOURCE));
        // Read bindings cannot be taken for writing, and stay bound
        assert!(table.take_write(Resource::Src).is_err());
        assert!(table.read(Resource::Src).is_ok());
    }

    #[test]
    fn test_kind_resources() {
        assert!(ConvKind::Forward.uses(Resource::Bias));
        assert!(!ConvKind::BackwardData.uses(Resource::Src));
        assert_eq!(ConvKind::BackwardBias.output(), Resource::DiffBias);
        assert_eq!(ConvKind::BackwardFilter.inputs(), &[Resource::Src, Resource::DiffDst]);
    }
}
