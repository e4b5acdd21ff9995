//! Output extent calculation and per-role canonical layouts.
//!
//! # Canonical convention
//!
//! Sizes and strides are listed fastest-varying first, matching the order the
//! backend's explicit-layout constructor expects:
//!
//! | Role | Sizes | Strides |
//! |------|-------|---------|
//! | src / diff-src | `[iw, ih, ic, n]` | `[1, iw, iw*ih, iw*ih*ic]` |
//! | dst / diff-dst | `[ow, oh, oc, n]` | `[1, ow, ow*oh, ow*oh*oc]` |
//! | filter / diff-filter | `[kw, kh, ic/g, oc]` | `[1, kw, kw*kh, kw*kh*ic/g]` |
//! | bias / diff-bias | `[oc]` | `[1]` |

use crate::config::ConvConfig;
use crate::error::{ConvError, ConvResult};

/// Output extent along one spatial axis.
///
/// `floor((input + 2*pad - kernel) / stride) + 1`. The caller guarantees
/// `stride > 0` and `input + 2*pad >= kernel`.
///
/// # Example
///
/// ```rust
/// use dnnconv::output_dim;
///
/// assert_eq!(output_dim(224, 3, 7, 2), 112);
/// ```
#[inline]
pub const fn output_dim(input: usize, pad: usize, kernel: usize, stride: usize) -> usize {
    (input + 2 * pad - kernel) / stride + 1
}

/// Explicit sizes and strides of one canonical layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalLayout {
    /// Extents, fastest-varying first.
    pub sizes: Vec<usize>,
    /// Element strides, same order as `sizes`.
    pub strides: Vec<usize>,
}

impl CanonicalLayout {
    /// Dense layout where each dimension's stride is the product of the
    /// faster dimensions' sizes.
    pub fn dense(sizes: &[usize]) -> Self {
        let mut strides = Vec::with_capacity(sizes.len());
        let mut running = 1;
        for &size in sizes {
            strides.push(running);
            running *= size;
        }
        Self {
            sizes: sizes.to_vec(),
            strides,
        }
    }
}

/// Fixed geometry of one convolution: batch, input and output extents,
/// kernel, stride, padding and group count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    /// Batch size.
    pub num: usize,
    /// Group count.
    pub group: usize,
    /// Input channels (all groups).
    pub input_channels: usize,
    /// Input height.
    pub input_height: usize,
    /// Input width.
    pub input_width: usize,
    /// Output channels (all groups).
    pub output_channels: usize,
    /// Output height.
    pub output_height: usize,
    /// Output width.
    pub output_width: usize,
    /// Kernel height.
    pub kernel_h: usize,
    /// Kernel width.
    pub kernel_w: usize,
    /// Vertical stride.
    pub stride_h: usize,
    /// Horizontal stride.
    pub stride_w: usize,
    /// Vertical padding.
    pub pad_h: usize,
    /// Horizontal padding.
    pub pad_w: usize,
}

impl ConvGeometry {
    /// Derives the geometry from a config and an input shape `[n, c, h, w]`.
    pub fn new(config: &ConvConfig, input_shape: [usize; 4]) -> ConvResult<Self> {
        let [num, channels, height, width] = input_shape;
        config.validate_input(channels, height, width)?;
        if num == 0 {
            return Err(ConvError::shape_mismatch("batch", &[1], &[0]));
        }

        Ok(Self {
            num,
            group: config.group,
            input_channels: channels,
            input_height: height,
            input_width: width,
            output_channels: config.num_output,
            output_height: output_dim(height, config.pad_h, config.kernel_h, config.stride_h),
            output_width: output_dim(width, config.pad_w, config.kernel_w, config.stride_w),
            kernel_h: config.kernel_h,
            kernel_w: config.kernel_w,
            stride_h: config.stride_h,
            stride_w: config.stride_w,
            pad_h: config.pad_h,
            pad_w: config.pad_w,
        })
    }

    /// Input channels seen by one group.
    #[inline]
    pub fn input_channels_per_group(&self) -> usize {
        self.input_channels / self.group
    }

    /// Output channels produced by one group.
    #[inline]
    pub fn output_channels_per_group(&self) -> usize {
        self.output_channels / self.group
    }

    /// Expected input tensor shape `[n, c, h, w]`.
    pub fn input_shape(&self) -> [usize; 4] {
        [self.num, self.input_channels, self.input_height, self.input_width]
    }

    /// Expected output tensor shape `[n, c, h, w]`.
    pub fn output_shape(&self) -> [usize; 4] {
        [self.num, self.output_channels, self.output_height, self.output_width]
    }

    /// Filter tensor shape `[oc, ic/g, kh, kw]`.
    pub fn filter_shape(&self) -> [usize; 4] {
        [
            self.output_channels,
            self.input_channels_per_group(),
            self.kernel_h,
            self.kernel_w,
        ]
    }

    /// Canonical layout of the source and its gradient.
    pub fn src_layout(&self) -> CanonicalLayout {
        CanonicalLayout::dense(&[self.input_width, self.input_height, self.input_channels, self.num])
    }

    /// Canonical layout of the destination and its gradient.
    pub fn dst_layout(&self) -> CanonicalLayout {
        CanonicalLayout::dense(&[
            self.output_width,
            self.output_height,
            self.output_channels,
            self.num,
        ])
    }

    /// Canonical layout of the filter and its gradient.
    pub fn filter_layout(&self) -> CanonicalLayout {
        CanonicalLayout::dense(&[
            self.kernel_w,
            self.kernel_h,
            self.input_channels_per_group(),
            self.output_channels,
        ])
    }

    /// Canonical layout of the bias and its gradient.
    pub fn bias_layout(&self) -> CanonicalLayout {
        CanonicalLayout::dense(&[self.output_channels])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_dim_examples() {
        assert_eq!(output_dim(224, 3, 7, 2), 112);
        assert_eq!(output_dim(5, 0, 3, 1), 3);
        assert_eq!(output_dim(5, 1, 3, 1), 5);
        // Remainder is floored
        assert_eq!(output_dim(6, 0, 3, 2), 2);
        assert_eq!(output_dim(3, 0, 3, 5), 1);
    }

    #[test]
    fn test_output_dim_matches_formula() {
        for input in 1..20 {
            for pad in 0..3 {
                for kernel in 1..=(input + 2 * pad).min(7) {
                    for stride in 1..4 {
                        let expected =
                            ((input + 2 * pad - kernel) as f64 / stride as f64).floor() as usize + 1;
                        assert_eq!(
                            output_dim(input, pad, kernel, stride),
                            expected,
                            "input={input} pad={pad} kernel={kernel} stride={stride}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_canonical_strides() {
        let config = ConvConfig::square(6, 3, 1, 1).with_group(2);
        let geom = ConvGeometry::new(&config, [2, 4, 5, 7]).unwrap();

        let src = geom.src_layout();
        assert_eq!(src.sizes, vec![7, 5, 4, 2]);
        assert_eq!(src.strides, vec![1, 7, 35, 140]);

        let filter = geom.filter_layout();
        assert_eq!(filter.sizes, vec![3, 3, 2, 6]);
        assert_eq!(filter.strides, vec![1, 3, 9, 18]);

        let bias = geom.bias_layout();
        assert_eq!(bias.sizes, vec![6]);
        assert_eq!(bias.strides, vec![1]);

        assert_eq!(geom.output_shape(), [2, 6, 5, 7]);
        assert_eq!(geom.filter_shape(), [6, 2, 3, 3]);
    }

    #[test]
    fn test_geometry_rejects_bad_input() {
        let config = ConvConfig::square(4, 3, 1, 0).with_group(2);
        assert!(ConvGeometry::new(&config, [1, 3, 8, 8]).is_err());
        assert!(ConvGeometry::new(&config, [0, 2, 8, 8]).is_err());
        assert!(ConvGeometry::new(&config, [1, 2, 2, 8]).is_err());
    }
}
