//! Convolution layer: forward and backward execution over a plan.
//!
//! # Data flow
//!
//! Every primitive input goes through
//! [`LayoutDescriptor::get_converted`](crate::LayoutDescriptor::get_converted)
//! (or its `_disjoint` variant when the input may be cached in the output's
//! buffer); every primitive output goes through
//! [`LayoutDescriptor::prepare_output`](crate::LayoutDescriptor::prepare_output)
//! and is committed after the primitive succeeds, so outputs stay in the
//! backend layout until somebody reads their canonical form.
//!
//! | Computation | Inputs | Output |
//! |-------------|--------|--------|
//! | forward | `input.data`, `weights.data`, `bias.data` (unverified) | `output.data` |
//! | backward-data | `output.diff`, `weights.data` | `input.diff` |
//! | backward-filter | `output.diff`, `input.data` | `weights.diff` |
//! | backward-bias | `output.diff` | `bias.diff` |
//!
//! # Gradients
//!
//! Filter and bias gradients are overwritten by each backward call, not
//! accumulated.
//!
//! # Shape checks
//!
//! Input and output tensors must match the geometry the plan was built for.
//! Mismatches are reported before any primitive runs.

use std::rc::Rc;

use crate::backend::{Backend, Resource, ResourceTable};
use crate::config::ConvConfig;
use crate::error::{ConvError, ConvResult};
use crate::plan::{BackwardBiasStage, BackwardDataStage, BackwardFilterStage, ConvolutionPlan, ForwardStage};
use crate::shape::ConvGeometry;
use crate::tensor::Tensor;

/// Which backward computations to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackwardFlags {
    /// Propagate the gradient to the input.
    pub data: bool,
    /// Compute the filter gradient.
    pub filter: bool,
    /// Compute the bias gradient.
    pub bias: bool,
}

impl BackwardFlags {
    /// All three computations.
    pub const ALL: BackwardFlags = BackwardFlags {
        data: true,
        filter: true,
        bias: true,
    };

    /// Parameter gradients only (first layer of a network).
    pub const PARAMS_ONLY: BackwardFlags = BackwardFlags {
        data: false,
        filter: true,
        bias: true,
    };
}

impl Default for BackwardFlags {
    fn default() -> Self {
        Self::ALL
    }
}

/// A convolution operator instance: plan plus learnable parameters.
pub struct ConvolutionLayer<B: Backend> {
    config: ConvConfig,
    plan: ConvolutionPlan<B>,
    /// Filter `[oc, ic/g, kh, kw]`.
    pub weights: Tensor<B>,
    /// Bias `[oc]`.
    pub bias: Tensor<B>,
}

impl<B: Backend> ConvolutionLayer<B> {
    /// Builds the plan for `input_shape` (`[n, c, h, w]`) and fills the
    /// parameters.
    pub fn new(backend: Rc<B>, config: ConvConfig, input_shape: [usize; 4]) -> ConvResult<Self> {
        let geometry = ConvGeometry::new(&config, input_shape)?;
        let plan = ConvolutionPlan::new(backend, geometry, &config.name)?;

        let mut rng = config.rng();
        let fan_in = geometry.input_channels_per_group() * geometry.kernel_h * geometry.kernel_w;

        let mut weights = Tensor::new(&geometry.filter_shape());
        config.weight_filler.fill(weights.data_mut()?, fan_in, &mut rng)?;
        let mut bias = Tensor::new(&[geometry.output_channels]);
        config.bias_filler.fill(bias.data_mut()?, fan_in, &mut rng)?;

        Ok(Self {
            config,
            plan,
            weights,
            bias,
        })
    }

    /// Static parameters.
    #[inline]
    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    /// Plan with the four primitives.
    #[inline]
    pub fn plan(&self) -> &ConvolutionPlan<B> {
        &self.plan
    }

    /// Fixed geometry.
    #[inline]
    pub fn geometry(&self) -> &ConvGeometry {
        self.plan.geometry()
    }

    /// Expected input shape `[n, c, h, w]`.
    pub fn input_shape(&self) -> [usize; 4] {
        self.geometry().input_shape()
    }

    /// Output shape `[n, c, h, w]`.
    pub fn output_shape(&self) -> [usize; 4] {
        self.geometry().output_shape()
    }

    /// Zero tensor with the output shape.
    pub fn new_output(&self) -> Tensor<B> {
        Tensor::new(&self.output_shape())
    }

    /// Learnable parameter count.
    pub fn num_parameters(&self) -> usize {
        self.weights.count() + self.bias.count()
    }

    /// Checks `input` and `output` against the plan's geometry.
    pub fn check_shapes(&self, input: &Tensor<B>, output: &Tensor<B>) -> ConvResult<()> {
        let geometry = self.geometry();
        let expected_input = [
            geometry.num,
            geometry.input_channels_per_group() * geometry.group,
            geometry.input_height,
            geometry.input_width,
        ];
        if input.shape() != &expected_input[..] {
            return Err(ConvError::shape_mismatch("input", &expected_input, input.shape()));
        }
        let expected_output = [
            geometry.num,
            geometry.output_channels_per_group() * geometry.group,
            geometry.output_height,
            geometry.output_width,
        ];
        if output.shape() != &expected_output[..] {
            return Err(ConvError::shape_mismatch("output", &expected_output, output.shape()));
        }
        Ok(())
    }

    /// `output.data = conv(input.data, weights) + bias`
    ///
    /// The result stays in the forward stage's scratch buffer until
    /// `output.data()` is read. That buffer is shared by every output of this
    /// layer: a later `forward` into another tensor overwrites it, so read or
    /// [`release_cache`](crate::TensorMemory::release_cache) an earlier output
    /// first if it is still needed. Passing an earlier output back in as
    /// `input` is handled.
    pub fn forward(&mut self, input: &mut Tensor<B>, output: &mut Tensor<B>) -> ConvResult<()> {
        self.check_shapes(input, output)?;
        let stage: &ForwardStage<B> = self.plan.forward();
        {
            let src = stage.src.get_converted_disjoint(input, true, &stage.dst)?;
            let filter = stage.filter.get_converted(&mut self.weights, true)?;
            let bias = stage.bias.get_converted(&mut self.bias, false)?;
            let mut dst = stage.dst.prepare_output(output)?;

            let src = src.buffer()?;
            let filter = filter.buffer()?;
            let bias = bias.buffer()?;
            let mut dst = dst.buffer_mut()?;

            let mut resources = ResourceTable::new();
            resources
                .bind_read(Resource::Src, &src)
                .bind_read(Resource::Filter, &filter)
                .bind_read(Resource::Bias, &bias)
                .bind_write(Resource::Dst, &mut dst);
            self.plan.execute(ForwardStage::<B>::KIND, stage.primitive(), &mut resources)?;
        }
        stage.dst.commit_output(output);
        Ok(())
    }

    /// Runs the backward computations selected by `flags`.
    ///
    /// Reads `output.diff`; writes `input.diff`, `weights.diff` and `bias.diff`.
    pub fn backward(&mut self, output: &mut Tensor<B>, flags: BackwardFlags, input: &mut Tensor<B>) -> ConvResult<()> {
        self.check_shapes(input, output)?;
        if flags.data {
            self.backward_data(output, input)?;
        }
        if flags.filter {
            self.backward_filter(output, input)?;
        }
        if flags.bias {
            self.backward_bias(output)?;
        }
        Ok(())
    }

    fn backward_data(&mut self, output: &mut Tensor<B>, input: &mut Tensor<B>) -> ConvResult<()> {
        let stage: &BackwardDataStage<B> = self.plan.backward_data();
        {
            let diff_dst = stage.diff_dst.get_converted_disjoint(output, true, &stage.diff_src)?;
            let filter = stage.filter.get_converted(&mut self.weights, true)?;
            let mut diff_src = stage.diff_src.prepare_output(input)?;

            let diff_dst = diff_dst.buffer()?;
            let filter = filter.buffer()?;
            let mut diff_src = diff_src.buffer_mut()?;

            let mut resources = ResourceTable::new();
            resources
                .bind_read(Resource::DiffDst, &diff_dst)
                .bind_read(Resource::Filter, &filter)
                .bind_write(Resource::DiffSrc, &mut diff_src);
            self.plan.execute(BackwardDataStage::<B>::KIND, stage.primitive(), &mut resources)?;
        }
        stage.diff_src.commit_output(input);
        Ok(())
    }

    fn backward_filter(&mut self, output: &mut Tensor<B>, input: &mut Tensor<B>) -> ConvResult<()> {
        let stage: &BackwardFilterStage<B> = self.plan.backward_filter();
        {
            let diff_dst = stage.diff_dst.get_converted_disjoint(output, true, &stage.diff_filter)?;
            let src = stage.src.get_converted(input, true)?;
            let mut diff_filter = stage.diff_filter.prepare_output(&mut self.weights)?;

            let diff_dst = diff_dst.buffer()?;
            let src = src.buffer()?;
            let mut diff_filter = diff_filter.buffer_mut()?;

            let mut resources = ResourceTable::new();
            resources
                .bind_read(Resource::Src, &src)
                .bind_read(Resource::DiffDst, &diff_dst)
                .bind_write(Resource::DiffFilter, &mut diff_filter);
            self.plan.execute(BackwardFilterStage::<B>::KIND, stage.primitive(), &mut resources)?;
        }
        stage.diff_filter.commit_output(&mut self.weights);
        Ok(())
    }

    fn backward_bias(&mut self, output: &mut Tensor<B>) -> ConvResult<()> {
        let stage: &BackwardBiasStage<B> = self.plan.backward_bias();
        {
            let diff_dst = stage.diff_dst.get_converted_disjoint(output, true, &stage.diff_bias)?;
            let mut diff_bias = stage.diff_bias.prepare_output(&mut self.bias)?;

            let diff_dst = diff_dst.buffer()?;
            let mut diff_bias = diff_bias.buffer_mut()?;

            let mut resources = ResourceTable::new();
            resources
                .bind_read(Resource::DiffDst, &diff_dst)
                .bind_write(Resource::DiffBias, &mut diff_bias);
            self.plan.execute(BackwardBiasStage::<B>::KIND, stage.primitive(), &mut resources)?;
        }
        stage.diff_bias.commit_output(&mut self.bias);
        Ok(())
    }
}

impl<B: Backend> std::fmt::Debug for ConvolutionLayer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvolutionLayer")
            .field("name", &self.config.name)
            .field("input_shape", &self.input_shape())
            .field("output_shape", &self.output_shape())
            .field("group", &self.config.group)
            .finish()
    }
}
