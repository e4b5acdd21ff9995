//! Convolution plan: four backend primitives and their layout descriptors.
//!
//! One construction routine covers every group count; `group == 1` is just the
//! degenerate case. Each primitive gets one descriptor per resource role it
//! touches, bound to the primitive's preferred layout and to the matching
//! canonical layout from [`ConvGeometry`].

use std::fmt;
use std::rc::Rc;

use crate::backend::{Backend, ConvDescriptor, ConvKind, Resource, ResourceTable};
use crate::descriptor::LayoutDescriptor;
use crate::error::{ConvError, ConvResult};
use crate::shape::{CanonicalLayout, ConvGeometry};
use crate::tensor::{Data, Diff, Side};

impl ConvGeometry {
    /// Backend descriptor of this convolution.
    pub fn descriptor(&self) -> ConvDescriptor {
        ConvDescriptor {
            groups: self.group,
            src_sizes: [self.input_width, self.input_height, self.input_channels, self.num],
            dst_sizes: [self.output_width, self.output_height, self.output_channels, self.num],
            filter_sizes: [
                self.kernel_w,
                self.kernel_h,
                self.input_channels_per_group(),
                self.output_channels,
            ],
            strides: [self.stride_w, self.stride_h],
            input_offset: [-(self.pad_w as isize), -(self.pad_h as isize)],
        }
    }
}

/// Descriptor shared between a stage and the tensor caches it populates.
pub type SharedDescriptor<B, S> = Rc<LayoutDescriptor<B, S>>;

/// `{src, filter, bias} -> dst`
pub struct ForwardStage<B: Backend> {
    primitive: B::Primitive,
    /// Input activations.
    pub src: SharedDescriptor<B, Data>,
    /// Filter.
    pub filter: SharedDescriptor<B, Data>,
    /// Bias.
    pub bias: SharedDescriptor<B, Data>,
    /// Output activations.
    pub dst: SharedDescriptor<B, Data>,
}

/// `{diff_dst, filter} -> diff_src`
pub struct BackwardDataStage<B: Backend> {
    primitive: B::Primitive,
    /// Output gradient.
    pub diff_dst: SharedDescriptor<B, Diff>,
    /// Filter.
    pub filter: SharedDescriptor<B, Data>,
    /// Input gradient.
    pub diff_src: SharedDescriptor<B, Diff>,
}

/// `{src, diff_dst} -> diff_filter`
pub struct BackwardFilterStage<B: Backend> {
    primitive: B::Primitive,
    /// Input activations.
    pub src: SharedDescriptor<B, Data>,
    /// Output gradient.
    pub diff_dst: SharedDescriptor<B, Diff>,
    /// Filter gradient.
    pub diff_filter: SharedDescriptor<B, Diff>,
}

/// `{diff_dst} -> diff_bias`
pub struct BackwardBiasStage<B: Backend> {
    primitive: B::Primitive,
    /// Output gradient.
    pub diff_dst: SharedDescriptor<B, Diff>,
    /// Bias gradient.
    pub diff_bias: SharedDescriptor<B, Diff>,
}

macro_rules! impl_stage {
    ($($stage:ident => $kind:expr),* $(,)?) => {
        $(
            impl<B: Backend> $stage<B> {
                /// Computation performed by this stage.
                pub const KIND: ConvKind = $kind;

                /// Backend primitive.
                #[inline]
                pub fn primitive(&self) -> &B::Primitive {
                    &self.primitive
                }
            }
        )*
    };
}

impl_stage! {
    ForwardStage => ConvKind::Forward,
    BackwardDataStage => ConvKind::BackwardData,
    BackwardFilterStage => ConvKind::BackwardFilter,
    BackwardBiasStage => ConvKind::BackwardBias,
}

/// Per-layer plan holding the four convolution primitives.
pub struct ConvolutionPlan<B: Backend> {
    backend: Rc<B>,
    name: String,
    geometry: ConvGeometry,
    forward: ForwardStage<B>,
    backward_data: BackwardDataStage<B>,
    backward_filter: BackwardFilterStage<B>,
    backward_bias: BackwardBiasStage<B>,
}

/// Builds primitives and descriptors for one plan.
struct Builder<'a, B: Backend> {
    backend: &'a Rc<B>,
    name: &'a str,
    desc: ConvDescriptor,
}

impl<B: Backend> Builder<'_, B> {
    fn primitive(&self, kind: ConvKind) -> ConvResult<B::Primitive> {
        self.backend.create_convolution(kind, &self.desc).map_err(|status| {
            ConvError::backend(
                format!("{} convolution primitive for {} (group {})", kind.name(), self.name, self.desc.groups),
                status,
            )
        })
    }

    fn descriptor<S: Side>(
        &self,
        kind: ConvKind,
        primitive: &B::Primitive,
        resource: Resource,
        canonical: &CanonicalLayout,
    ) -> ConvResult<SharedDescriptor<B, S>> {
        let mut desc = LayoutDescriptor::new(
            Rc::clone(self.backend),
            format!("{}.{} @ {}", kind.name(), resource, self.name),
        );
        desc.bind_to_primitive(primitive, resource)?;
        desc.bind_canonical(&canonical.sizes, &canonical.strides)?;
        desc.finalize()?;
        Ok(Rc::new(desc))
    }
}

impl<B: Backend> ConvolutionPlan<B> {
    /// Creates all four primitives for `geometry`.
    ///
    /// Any backend failure aborts construction: it means the backend does not
    /// support this parameter combination.
    pub fn new(backend: Rc<B>, geometry: ConvGeometry, name: &str) -> ConvResult<Self> {
        let builder = Builder {
            backend: &backend,
            name,
            desc: geometry.descriptor(),
        };
        let src = geometry.src_layout();
        let dst = geometry.dst_layout();
        let filter = geometry.filter_layout();
        let bias = geometry.bias_layout();

        let kind = ConvKind::Forward;
        let primitive = builder.primitive(kind)?;
        let forward = ForwardStage {
            src: builder.descriptor(kind, &primitive, Resource::Src, &src)?,
            filter: builder.descriptor(kind, &primitive, Resource::Filter, &filter)?,
            bias: builder.descriptor(kind, &primitive, Resource::Bias, &bias)?,
            dst: builder.descriptor(kind, &primitive, Resource::Dst, &dst)?,
            primitive,
        };

        let kind = ConvKind::BackwardData;
        let primitive = builder.primitive(kind)?;
        let backward_data = BackwardDataStage {
            diff_dst: builder.descriptor(kind, &primitive, Resource::DiffDst, &dst)?,
            filter: builder.descriptor(kind, &primitive, Resource::Filter, &filter)?,
            diff_src: builder.descriptor(kind, &primitive, Resource::DiffSrc, &src)?,
            primitive,
        };

        let kind = ConvKind::BackwardFilter;
        let primitive = builder.primitive(kind)?;
        let backward_filter = BackwardFilterStage {
            src: builder.descriptor(kind, &primitive, Resource::Src, &src)?,
            diff_dst: builder.descriptor(kind, &primitive, Resource::DiffDst, &dst)?,
            diff_filter: builder.descriptor(kind, &primitive, Resource::DiffFilter, &filter)?,
            primitive,
        };

        let kind = ConvKind::BackwardBias;
        let primitive = builder.primitive(kind)?;
        let backward_bias = BackwardBiasStage {
            diff_dst: builder.descriptor(kind, &primitive, Resource::DiffDst, &dst)?,
            diff_bias: builder.descriptor(kind, &primitive, Resource::DiffBias, &bias)?,
            primitive,
        };

        log::debug!(
            "planned convolution {}: {:?} -> {:?}, group {}",
            name,
            geometry.input_shape(),
            geometry.output_shape(),
            geometry.group
        );

        Ok(Self {
            backend,
            name: name.to_string(),
            geometry,
            forward,
            backward_data,
            backward_filter,
            backward_bias,
        })
    }

    /// Layer name used in descriptor labels.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed geometry.
    #[inline]
    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }

    /// Backend the primitives belong to.
    #[inline]
    pub fn backend(&self) -> &Rc<B> {
        &self.backend
    }

    /// Forward stage.
    pub fn forward(&self) -> &ForwardStage<B> {
        &self.forward
    }

    /// Backward-data stage.
    pub fn backward_data(&self) -> &BackwardDataStage<B> {
        &self.backward_data
    }

    /// Backward-filter stage.
    pub fn backward_filter(&self) -> &BackwardFilterStage<B> {
        &self.backward_filter
    }

    /// Backward-bias stage.
    pub fn backward_bias(&self) -> &BackwardBiasStage<B> {
        &self.backward_bias
    }

    /// Runs one of the plan's primitives.
    pub fn execute(
        &self,
        kind: ConvKind,
        primitive: &B::Primitive,
        resources: &mut ResourceTable<'_>,
    ) -> ConvResult<()> {
        self.backend.execute(primitive, resources).map_err(|status| {
            ConvError::backend(format!("{} convolution of {}", kind.name(), self.name), status)
        })
    }
}

impl<B: Backend> Drop for ConvolutionPlan<B> {
    fn drop(&mut self) {
        log::debug!("releasing convolution primitives of {}", self.name);
    }
}

impl<B: Backend> fmt::Debug for ConvolutionPlan<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvolutionPlan")
            .field("name", &self.name)
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}
