//! Convolution operator configuration.
//!
//! This module provides [`ConvConfig`], the static parameters a
//! [`ConvolutionLayer`](crate::ConvolutionLayer) is built from, and the
//! [`Filler`] initializers for its filter and bias.
//!
//! # Example
//!
//! ```rust
//! use dnnconv::ConvConfig;
//!
//! // 7x7, stride 2, pad 3: the classic stem convolution
//! let config = ConvConfig::square(64, 7, 2, 3);
//! assert!(config.validate().is_ok());
//!
//! // Or customize
//! let config = ConvConfig {
//!     num_output: 32,
//!     kernel_h: 3,
//!     kernel_w: 5,
//!     group: 2,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! All parameters are fixed once the plan is built. Changing them requires
//! building a new layer.

use std::borrow::Cow;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default layer name used in descriptor debug labels.
pub const DEFAULT_LAYER_NAME: &str = "conv";

/// Parameter initializer for the filter and bias tensors.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Filler {
    /// Every element set to the value.
    Constant(f32),
    /// Uniform in `[min, max)`.
    Uniform {
        /// Lower bound.
        min: f32,
        /// Upper bound (exclusive).
        max: f32,
    },
    /// Zero-mean normal with the given standard deviation.
    Gaussian {
        /// Standard deviation.
        std: f32,
    },
    /// Uniform in `[-s, s)` with `s = sqrt(3 / fan_in)`.
    Xavier,
}

impl Filler {
    /// Fills `values` in place. `fan_in` is only used by [`Filler::Xavier`].
    pub fn fill(&self, values: &mut [f32], fan_in: usize, rng: &mut StdRng) -> Result<(), ConfigError> {
        match *self {
            Filler::Constant(v) => values.fill(v),
            Filler::Uniform { min, max } => {
                for v in values.iter_mut() {
                    *v = rng.gen_range(min..max);
                }
            }
            Filler::Gaussian { std } => {
                let normal = Normal::new(0.0f32, std).map_err(|err| {
                    ConfigError::InvalidFiller(Cow::Owned(format!("gaussian std {std}: {err}")))
                })?;
                for v in values.iter_mut() {
                    *v = normal.sample(rng);
                }
            }
            Filler::Xavier => {
                let scale = (3.0 / fan_in.max(1) as f32).sqrt();
                for v in values.iter_mut() {
                    *v = rng.gen_range(-scale..scale);
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Filler::Uniform { min, max } if !(min < max) => Err(ConfigError::InvalidFiller(
                Cow::Owned(format!("uniform range [{min}, {max}) is empty")),
            )),
            Filler::Gaussian { std } if !(std >= 0.0) => Err(ConfigError::InvalidFiller(
                Cow::Owned(format!("gaussian std must be >= 0, got {std}")),
            )),
            _ => Ok(()),
        }
    }
}

/// Convolution operator configuration.
///
/// Kernel, stride and padding are given per spatial axis. `num_output` is the
/// total output channel count across all groups.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConvConfig {
    /// Layer name, used in descriptor debug labels and log lines.
    pub name: String,

    /// Output channels (all groups).
    pub num_output: usize,

    /// Kernel height.
    pub kernel_h: usize,

    /// Kernel width.
    pub kernel_w: usize,

    /// Vertical stride.
    pub stride_h: usize,

    /// Horizontal stride.
    pub stride_w: usize,

    /// Zero padding added above and below.
    pub pad_h: usize,

    /// Zero padding added left and right.
    pub pad_w: usize,

    /// Number of channel groups (1 = ordinary convolution).
    pub group: usize,

    /// Filter initializer.
    pub weight_filler: Filler,

    /// Bias initializer.
    pub bias_filler: Filler,

    /// Optional seed for deterministic initialization (None => random).
    pub seed: Option<u64>,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_LAYER_NAME.to_string(),
            num_output: 16,
            kernel_h: 3,
            kernel_w: 3,
            stride_h: 1,
            stride_w: 1,
            pad_h: 0,
            pad_w: 0,
            group: 1,
            weight_filler: Filler::Xavier,
            bias_filler: Filler::Constant(0.0),
            seed: None,
        }
    }
}

impl ConvConfig {
    /// Square kernel with equal stride and padding on both axes.
    pub fn square(num_output: usize, kernel: usize, stride: usize, pad: usize) -> Self {
        Self {
            num_output,
            kernel_h: kernel,
            kernel_w: kernel,
            stride_h: stride,
            stride_w: stride,
            pad_h: pad,
            pad_w: pad,
            ..Default::default()
        }
    }

    /// Sets the group count.
    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    /// Sets the layer name.
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the initialization seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Output channels per group.
    #[inline]
    pub fn output_channels_per_group(&self) -> usize {
        self.num_output / self.group
    }

    /// Validates the input-independent parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - a kernel extent or stride is zero
    /// - `group` or `num_output` is zero
    /// - `num_output` is not divisible by `group`
    /// - a filler has an empty range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kernel_h == 0 || self.kernel_w == 0 {
            return Err(ConfigError::InvalidKernel(self.kernel_h, self.kernel_w));
        }
        if self.stride_h == 0 || self.stride_w == 0 {
            return Err(ConfigError::InvalidStride(self.stride_h, self.stride_w));
        }
        if self.group == 0 {
            return Err(ConfigError::InvalidGroup(self.group));
        }
        if self.num_output == 0 {
            return Err(ConfigError::InvalidDimension(Cow::Borrowed(
                "num_output must be > 0",
            )));
        }
        if self.num_output % self.group != 0 {
            return Err(ConfigError::IndivisibleByGroup {
                what: "num_output",
                count: self.num_output,
                group: self.group,
            });
        }
        self.weight_filler.validate()?;
        self.bias_filler.validate()?;
        Ok(())
    }

    /// Validates the parameters against a concrete input `(channels, height, width)`.
    pub fn validate_input(&self, channels: usize, height: usize, width: usize) -> Result<(), ConfigError> {
        self.validate()?;
        if channels == 0 || height == 0 || width == 0 {
            return Err(ConfigError::InvalidDimension(Cow::Borrowed(
                "input extents must be > 0",
            )));
        }
        if channels % self.group != 0 {
            return Err(ConfigError::IndivisibleByGroup {
                what: "input channels",
                count: channels,
                group: self.group,
            });
        }
        if height + 2 * self.pad_h < self.kernel_h || width + 2 * self.pad_w < self.kernel_w {
            return Err(ConfigError::KernelExceedsInput {
                kernel: (self.kernel_h, self.kernel_w),
                padded: (height + 2 * self.pad_h, width + 2 * self.pad_w),
            });
        }
        Ok(())
    }

    /// Creates the RNG used by the fillers.
    pub(crate) fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

/// Errors returned by [`ConvConfig::validate`] and [`ConvConfig::validate_input`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A dimension parameter is invalid.
    #[error("Invalid dimension: {0}")]
    InvalidDimension(Cow<'static, str>),

    /// Kernel extents must be positive.
    #[error("Kernel must be > 0, got {0}x{1}")]
    InvalidKernel(usize, usize),

    /// Strides must be positive.
    #[error("Stride must be > 0, got {0}x{1}")]
    InvalidStride(usize, usize),

    /// Group count must be positive.
    #[error("Group must be > 0, got {0}")]
    InvalidGroup(usize),

    /// A channel count is not divisible by the group count.
    #[error("{what} ({count}) must be divisible by group ({group})")]
    IndivisibleByGroup {
        /// Which channel count.
        what: &'static str,
        /// The channel count.
        count: usize,
        /// The group count.
        group: usize,
    },

    /// The kernel does not fit inside the padded input.
    #[error("Kernel {kernel:?} exceeds padded input {padded:?}")]
    KernelExceedsInput {
        /// `(kernel_h, kernel_w)`.
        kernel: (usize, usize),
        /// `(height + 2*pad_h, width + 2*pad_w)`.
        padded: (usize, usize),
    },

    /// Filler parameters are unusable.
    #[error("Invalid filler: {0}")]
    InvalidFiller(Cow<'static, str>),
}
