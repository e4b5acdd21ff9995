//! Reference CPU backend.
//!
//! [`CpuBackend`] implements [`Backend`] with direct convolution kernels and a
//! configurable preferred layout:
//!
//! | Resource | Preferred layout |
//! |----------|------------------|
//! | src, dst, diff_src, diff_dst | channel dimension blocked by `activation_block` |
//! | filter, diff_filter | output-channel dimension blocked by `filter_block` |
//! | bias, diff_bias | dense |
//!
//! A block of 1 makes the preferred layout equal to the canonical one, so
//! every descriptor becomes pass-through.
//!
//! # Example
//!
//! ```rust
//! use dnnconv::backend::cpu::{CpuBackend, CpuBackendOptions};
//!
//! let blocked = CpuBackend::new();
//! let plain = CpuBackend::with_options(CpuBackendOptions::plain());
//! assert_eq!(blocked.options().activation_block, 8);
//! assert_eq!(plain.options().activation_block, 1);
//! ```

mod kernels;
pub mod layout;

pub use layout::CpuLayout;

use crate::backend::{Backend, BackendResult, ConvDescriptor, ConvKind, Resource, ResourceTable, Status};
use crate::shape::output_dim;
use kernels::{ConvShape, View};
use layout::for_each_index;

/// Preferred-layout options for [`CpuBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuBackendOptions {
    /// Channel block for activations and their gradients.
    pub activation_block: usize,
    /// Output-channel block for filters and their gradients.
    pub filter_block: usize,
}

impl Default for CpuBackendOptions {
    fn default() -> Self {
        Self {
            activation_block: 8,
            filter_block: 8,
        }
    }
}

impl CpuBackendOptions {
    /// Canonical layouts everywhere (no blocking).
    pub fn plain() -> Self {
        Self {
            activation_block: 1,
            filter_block: 1,
        }
    }
}

/// Convolution primitive state.
#[derive(Debug)]
pub struct ConvPrimitive {
    kind: ConvKind,
    shape: ConvShape,
    src: CpuLayout,
    dst: CpuLayout,
    filter: CpuLayout,
    bias: CpuLayout,
}

impl ConvPrimitive {
    fn layout(&self, resource: Resource) -> Option<&CpuLayout> {
        if !self.kind.uses(resource) {
            return None;
        }
        match resource {
            Resource::Src | Resource::DiffSrc => Some(&self.src),
            Resource::Dst | Resource::DiffDst => Some(&self.dst),
            Resource::Filter | Resource::DiffFilter => Some(&self.filter),
            Resource::Bias | Resource::DiffBias => Some(&self.bias),
            Resource::From | Resource::To => None,
        }
    }

    fn view<'a>(&self, table: &ResourceTable<'a>, resource: Resource) -> BackendResult<View<'a>> {
        let layout = self.layout(resource).ok_or(Status::MISSING_RESOURCE)?;
        let data = table.read(resource)?;
        check_len(data.len(), layout)?;
        Ok(View {
            data,
            index: layout.indexer(),
        })
    }

    fn output<'a>(
        &self,
        table: &mut ResourceTable<'a>,
    ) -> BackendResult<(&'a mut [f32], layout::Indexer)> {
        let resource = self.kind.output();
        let layout = self.layout(resource).ok_or(Status::MISSING_RESOURCE)?;
        let data = table.take_write(resource)?;
        check_len(data.len(), layout)?;
        Ok((data, layout.indexer()))
    }

    fn execute(&self, table: &mut ResourceTable<'_>) -> BackendResult<()> {
        let s = &self.shape;
        match self.kind {
            ConvKind::Forward => {
                let src = self.view(table, Resource::Src)?;
                let filter = self.view(table, Resource::Filter)?;
                let bias = self.view(table, Resource::Bias)?;
                let (dst, index) = self.output(table)?;
                kernels::forward(s, src, filter, bias, dst, index);
            }
            ConvKind::BackwardData => {
                let diff_dst = self.view(table, Resource::DiffDst)?;
                let filter = self.view(table, Resource::Filter)?;
                let (diff_src, index) = self.output(table)?;
                kernels::backward_data(s, diff_dst, filter, diff_src, index);
            }
            ConvKind::BackwardFilter => {
                let src = self.view(table, Resource::Src)?;
                let diff_dst = self.view(table, Resource::DiffDst)?;
                let (diff_filter, index) = self.output(table)?;
                kernels::backward_filter(s, src, diff_dst, diff_filter, index);
            }
            ConvKind::BackwardBias => {
                let diff_dst = self.view(table, Resource::DiffDst)?;
                let (diff_bias, index) = self.output(table)?;
                kernels::backward_bias(s, diff_dst, diff_bias, index);
            }
        }
        Ok(())
    }
}

/// Layout-to-layout copy.
#[derive(Debug)]
pub struct ConversionPrimitive {
    from: CpuLayout,
    to: CpuLayout,
}

impl ConversionPrimitive {
    fn execute(&self, table: &mut ResourceTable<'_>) -> BackendResult<()> {
        let src = table.read(Resource::From)?;
        let dst = table.take_write(Resource::To)?;
        check_len(src.len(), &self.from)?;
        check_len(dst.len(), &self.to)?;

        let from = self.from.indexer();
        let to = self.to.indexer();
        for_each_index(self.from.extents(), |i| {
            dst[to.offset(i)] = src[from.offset(i)];
        });
        Ok(())
    }
}

/// Primitive handle returned by [`CpuBackend`].
#[derive(Debug)]
pub enum CpuPrimitive {
    /// One of the four convolution computations.
    Convolution(ConvPrimitive),
    /// Layout conversion.
    Conversion(ConversionPrimitive),
}

/// Reference CPU implementation of [`Backend`].
#[derive(Debug, Clone, Default)]
pub struct CpuBackend {
    options: CpuBackendOptions,
}

impl CpuBackend {
    /// Backend with the default 8-lane blocking.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with explicit layout options.
    pub fn with_options(options: CpuBackendOptions) -> Self {
        Self { options }
    }

    /// Layout options in effect.
    pub fn options(&self) -> CpuBackendOptions {
        self.options
    }

    fn validate(desc: &ConvDescriptor) -> Result<(), &'static str> {
        let [iw, ih, ic, n] = desc.src_sizes;
        let [ow, oh, oc, dn] = desc.dst_sizes;
        let [kw, kh, icg, foc] = desc.filter_sizes;
        let [sw, sh] = desc.strides;

        if desc.groups == 0 {
            return Err("group count is zero");
        }
        if desc
            .src_sizes
            .iter()
            .chain(&desc.dst_sizes)
            .chain(&desc.filter_sizes)
            .any(|&d| d == 0)
        {
            return Err("zero extent");
        }
        if sw == 0 || sh == 0 {
            return Err("zero stride");
        }
        if desc.input_offset.iter().any(|&o| o > 0) {
            return Err("positive input offset");
        }
        if n != dn {
            return Err("batch of src and dst differ");
        }
        if icg * desc.groups != ic {
            return Err("filter input channels do not match src channels per group");
        }
        if foc != oc || oc % desc.groups != 0 {
            return Err("filter output channels do not match dst channels");
        }

        let pw = desc.input_offset[0].unsigned_abs();
        let ph = desc.input_offset[1].unsigned_abs();
        if iw + 2 * pw < kw || ih + 2 * ph < kh {
            return Err("kernel exceeds padded input");
        }
        if output_dim(iw, pw, kw, sw) != ow || output_dim(ih, ph, kh, sh) != oh {
            return Err("dst extents disagree with kernel, stride and padding");
        }
        Ok(())
    }
}

fn check_len(len: usize, layout: &CpuLayout) -> BackendResult<()> {
    if len < layout.memory_size() {
        return Err(Status::INCORRECT_INPUT);
    }
    Ok(())
}

impl Backend for CpuBackend {
    type Layout = CpuLayout;
    type Primitive = CpuPrimitive;

    fn create_convolution(&self, kind: ConvKind, desc: &ConvDescriptor) -> BackendResult<CpuPrimitive> {
        if let Err(reason) = Self::validate(desc) {
            log::debug!("rejecting {} convolution: {}", kind.name(), reason);
            return Err(Status::INCORRECT_INPUT);
        }

        Ok(CpuPrimitive::Convolution(ConvPrimitive {
            kind,
            shape: ConvShape::new(desc),
            src: CpuLayout::blocked(&desc.src_sizes, 2, self.options.activation_block),
            dst: CpuLayout::blocked(&desc.dst_sizes, 2, self.options.activation_block),
            filter: CpuLayout::blocked(&desc.filter_sizes, 3, self.options.filter_block),
            bias: CpuLayout::dense(&[desc.dst_sizes[2]]),
        }))
    }

    fn layout_from_primitive(&self, primitive: &CpuPrimitive, resource: Resource) -> BackendResult<CpuLayout> {
        match primitive {
            CpuPrimitive::Convolution(conv) => {
                conv.layout(resource).cloned().ok_or(Status::INCORRECT_INPUT)
            }
            CpuPrimitive::Conversion(_) => Err(Status::INCORRECT_INPUT),
        }
    }

    fn layout_from_strides(&self, sizes: &[usize], strides: &[usize]) -> BackendResult<CpuLayout> {
        let layout = CpuLayout::strided(sizes, strides);
        if !layout.is_valid() {
            return Err(Status::INCORRECT_INPUT);
        }
        Ok(layout)
    }

    fn layouts_equal(&self, a: &CpuLayout, b: &CpuLayout) -> bool {
        a == b
    }

    fn layout_memory_size(&self, layout: &CpuLayout) -> usize {
        layout.memory_size()
    }

    fn create_conversion(&self, from: &CpuLayout, to: &CpuLayout) -> BackendResult<CpuPrimitive> {
        if from.sizes() != to.sizes() || !from.is_valid() || !to.is_valid() {
            return Err(Status::INCORRECT_INPUT);
        }
        Ok(CpuPrimitive::Conversion(ConversionPrimitive {
            from: from.clone(),
            to: to.clone(),
        }))
    }

    fn execute(&self, primitive: &CpuPrimitive, resources: &mut ResourceTable<'_>) -> BackendResult<()> {
        match primitive {
            CpuPrimitive::Convolution(conv) => conv.execute(resources),
            CpuPrimitive::Conversion(conversion) => conversion.execute(resources),
        }
    }
}
