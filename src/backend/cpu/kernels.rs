//! Direct convolution kernels.
//!
//! Every kernel addresses its buffers through an [`Indexer`], so the same code
//! runs on dense and blocked layouts. Forward and backward-data split the batch
//! across rayon workers; the batch is the slowest dimension of every
//! activation layout, so each image is one contiguous chunk.
//!
//! Backward-filter and backward-bias overwrite their outputs.

use rayon::prelude::*;

use super::layout::{for_each_index, Indexer, MAX_DIMS};
use crate::backend::ConvDescriptor;

/// Convolution extents unpacked from a [`ConvDescriptor`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConvShape {
    pub num: usize,
    pub ic_per_group: usize,
    pub ih: usize,
    pub iw: usize,
    pub oc: usize,
    pub oc_per_group: usize,
    pub oh: usize,
    pub ow: usize,
    pub kh: usize,
    pub kw: usize,
    pub sh: usize,
    pub sw: usize,
    pub ph: isize,
    pub pw: isize,
}

impl ConvShape {
    pub(crate) fn new(desc: &ConvDescriptor) -> Self {
        let [iw, ih, _, num] = desc.src_sizes;
        let [ow, oh, oc, _] = desc.dst_sizes;
        let [kw, kh, ic_per_group, _] = desc.filter_sizes;
        Self {
            num,
            ic_per_group,
            ih,
            iw,
            oc,
            oc_per_group: oc / desc.groups,
            oh,
            ow,
            kh,
            kw,
            sh: desc.strides[1],
            sw: desc.strides[0],
            ph: -desc.input_offset[1],
            pw: -desc.input_offset[0],
        }
    }

    /// Input row/column hit by output `o` and kernel tap `k`, if inside the image.
    #[inline]
    fn tap(o: usize, k: usize, stride: usize, pad: isize, extent: usize) -> Option<usize> {
        let i = (o * stride + k) as isize - pad;
        (i >= 0 && (i as usize) < extent).then_some(i as usize)
    }

    #[inline]
    fn input_y(&self, oy: usize, ky: usize) -> Option<usize> {
        Self::tap(oy, ky, self.sh, self.ph, self.ih)
    }

    #[inline]
    fn input_x(&self, ox: usize, kx: usize) -> Option<usize> {
        Self::tap(ox, kx, self.sw, self.pw, self.iw)
    }
}

/// A read-only buffer paired with its offset calculator.
#[derive(Clone, Copy)]
pub(crate) struct View<'a> {
    pub data: &'a [f32],
    pub index: Indexer,
}

impl View<'_> {
    #[inline]
    fn at(&self, i: [usize; MAX_DIMS]) -> f32 {
        self.data[self.index.offset(i)]
    }
}

/// `dst = conv(src, filter) + bias`
pub(crate) fn forward(
    s: &ConvShape,
    src: View<'_>,
    filter: View<'_>,
    bias: View<'_>,
    dst: &mut [f32],
    dst_index: Indexer,
) {
    let image = dst_index.outer_stride();
    dst[..s.num * image]
        .par_chunks_mut(image)
        .enumerate()
        .for_each(|(n, out)| {
            for oc in 0..s.oc {
                let g = oc / s.oc_per_group;
                let b = bias.at([oc, 0, 0, 0]);
                for oy in 0..s.oh {
                    for ox in 0..s.ow {
                        let mut sum = b;
                        for icl in 0..s.ic_per_group {
                            let c = g * s.ic_per_group + icl;
                            for ky in 0..s.kh {
                                let Some(iy) = s.input_y(oy, ky) else { continue };
                                for kx in 0..s.kw {
                                    let Some(ix) = s.input_x(ox, kx) else { continue };
                                    sum += src.at([ix, iy, c, n]) * filter.at([kx, ky, icl, oc]);
                                }
                            }
                        }
                        out[dst_index.offset([ox, oy, oc, 0])] = sum;
                    }
                }
            }
        });
}

/// `diff_src = conv_transpose(diff_dst, filter)`
pub(crate) fn backward_data(
    s: &ConvShape,
    diff_dst: View<'_>,
    filter: View<'_>,
    diff_src: &mut [f32],
    diff_src_index: Indexer,
) {
    let image = diff_src_index.outer_stride();
    diff_src[..s.num * image]
        .par_chunks_mut(image)
        .enumerate()
        .for_each(|(n, grad)| {
            grad.fill(0.0);
            for oc in 0..s.oc {
                let g = oc / s.oc_per_group;
                for oy in 0..s.oh {
                    for ox in 0..s.ow {
                        let d = diff_dst.at([ox, oy, oc, n]);
                        if d == 0.0 {
                            continue;
                        }
                        for icl in 0..s.ic_per_group {
                            let c = g * s.ic_per_group + icl;
                            for ky in 0..s.kh {
                                let Some(iy) = s.input_y(oy, ky) else { continue };
                                for kx in 0..s.kw {
                                    let Some(ix) = s.input_x(ox, kx) else { continue };
                                    grad[diff_src_index.offset([ix, iy, c, 0])] +=
                                        d * filter.at([kx, ky, icl, oc]);
                                }
                            }
                        }
                    }
                }
            }
        });
}

/// `diff_filter = correlate(src, diff_dst)` summed over the batch.
pub(crate) fn backward_filter(
    s: &ConvShape,
    src: View<'_>,
    diff_dst: View<'_>,
    diff_filter: &mut [f32],
    diff_filter_index: Indexer,
) {
    diff_filter.fill(0.0);
    for_each_index([s.kw, s.kh, s.ic_per_group, s.oc], |[kx, ky, icl, oc]| {
        let c = (oc / s.oc_per_group) * s.ic_per_group + icl;
        let mut sum = 0.0f32;
        for n in 0..s.num {
            for oy in 0..s.oh {
                let Some(iy) = s.input_y(oy, ky) else { continue };
                for ox in 0..s.ow {
                    let Some(ix) = s.input_x(ox, kx) else { continue };
                    sum += diff_dst.at([ox, oy, oc, n]) * src.at([ix, iy, c, n]);
                }
            }
        }
        diff_filter[diff_filter_index.offset([kx, ky, icl, oc])] = sum;
    });
}

/// `diff_bias[oc] = sum(diff_dst[.., oc, ..])`
pub(crate) fn backward_bias(
    s: &ConvShape,
    diff_dst: View<'_>,
    diff_bias: &mut [f32],
    diff_bias_index: Indexer,
) {
    diff_bias.fill(0.0);
    for oc in 0..s.oc {
        let mut sum = 0.0f32;
        for n in 0..s.num {
            for oy in 0..s.oh {
                for ox in 0..s.ow {
                    sum += diff_dst.at([ox, oy, oc, n]);
                }
            }
        }
        diff_bias[diff_bias_index.offset([oc, 0, 0, 0])] = sum;
    }
}
