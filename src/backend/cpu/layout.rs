//! Memory layouts understood by [`CpuBackend`](super::CpuBackend).
//!
//! Two arrangements exist:
//!
//! - **Strided**: explicit per-dimension strides (the canonical framework layout
//!   is the dense special case).
//! - **Blocked**: one dimension is split into `ceil(size / block)` outer blocks
//!   and `block` inner lanes; the inner lanes are innermost in memory and the
//!   last block is zero-padded. Activations block the channel dimension
//!   (`nChw8c`-style), filters block the output-channel dimension.
//!
//! A blocked layout with `block == 1` is identical to the dense layout and is
//! normalized to it on construction, so equality is structural.

/// Highest dimensionality the CPU backend handles.
pub const MAX_DIMS: usize = 4;

/// CPU backend layout handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CpuLayout {
    /// Explicit strides, fastest-varying first.
    Strided {
        /// Extents.
        sizes: Vec<usize>,
        /// Element strides.
        strides: Vec<usize>,
    },
    /// Dense layout with dimension `dim` blocked by `block` lanes.
    Blocked {
        /// Logical extents (unpadded).
        sizes: Vec<usize>,
        /// Blocked dimension.
        dim: usize,
        /// Lanes per block.
        block: usize,
    },
}

impl CpuLayout {
    /// Strided layout with explicit strides.
    pub fn strided(sizes: &[usize], strides: &[usize]) -> Self {
        CpuLayout::Strided {
            sizes: sizes.to_vec(),
            strides: strides.to_vec(),
        }
    }

    /// Dense strided layout, first dimension fastest.
    pub fn dense(sizes: &[usize]) -> Self {
        let mut strides = Vec::with_capacity(sizes.len());
        let mut running = 1;
        for &size in sizes {
            strides.push(running);
            running *= size;
        }
        CpuLayout::Strided {
            sizes: sizes.to_vec(),
            strides,
        }
    }

    /// Blocked layout. `block <= 1` yields the dense layout.
    pub fn blocked(sizes: &[usize], dim: usize, block: usize) -> Self {
        if block <= 1 || dim >= sizes.len() {
            return Self::dense(sizes);
        }
        CpuLayout::Blocked {
            sizes: sizes.to_vec(),
            dim,
            block,
        }
    }

    /// Logical extents.
    pub fn sizes(&self) -> &[usize] {
        match self {
            CpuLayout::Strided { sizes, .. } | CpuLayout::Blocked { sizes, .. } => sizes,
        }
    }

    /// Elements a buffer in this layout must hold, padding included.
    pub fn memory_size(&self) -> usize {
        match self {
            CpuLayout::Strided { sizes, strides } => {
                if sizes.iter().any(|&s| s == 0) {
                    return 0;
                }
                sizes
                    .iter()
                    .zip(strides)
                    .map(|(&size, &stride)| (size - 1) * stride)
                    .sum::<usize>()
                    + 1
            }
            CpuLayout::Blocked { sizes, dim, block } => {
                sizes
                    .iter()
                    .enumerate()
                    .map(|(d, &size)| if d == *dim { size.div_ceil(*block) } else { size })
                    .product::<usize>()
                    * block
            }
        }
    }

    /// Offset calculator for this layout.
    pub(crate) fn indexer(&self) -> Indexer {
        let mut strides = [0usize; MAX_DIMS];
        match self {
            CpuLayout::Strided {
                strides: layout_strides,
                ..
            } => {
                strides[..layout_strides.len()].copy_from_slice(layout_strides);
                Indexer {
                    strides,
                    blocked: None,
                }
            }
            CpuLayout::Blocked { sizes, dim, block } => {
                let mut running = *block;
                for (d, &size) in sizes.iter().enumerate() {
                    strides[d] = running;
                    running *= if d == *dim { size.div_ceil(*block) } else { size };
                }
                Indexer {
                    strides,
                    blocked: Some((*dim, *block)),
                }
            }
        }
    }

    /// Logical extents padded to [`MAX_DIMS`] with ones.
    pub(crate) fn extents(&self) -> [usize; MAX_DIMS] {
        let mut extents = [1usize; MAX_DIMS];
        let sizes = self.sizes();
        extents[..sizes.len()].copy_from_slice(sizes);
        extents
    }

    pub(crate) fn is_valid(&self) -> bool {
        match self {
            CpuLayout::Strided { sizes, strides } => {
                !sizes.is_empty() && sizes.len() <= MAX_DIMS && sizes.len() == strides.len()
            }
            CpuLayout::Blocked { sizes, dim, block } => {
                !sizes.is_empty() && sizes.len() <= MAX_DIMS && *dim < sizes.len() && *block > 1
            }
        }
    }
}

/// Maps a logical index (fastest dimension first) to a buffer offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Indexer {
    strides: [usize; MAX_DIMS],
    blocked: Option<(usize, usize)>,
}

impl Indexer {
    #[inline]
    pub(crate) fn offset(&self, index: [usize; MAX_DIMS]) -> usize {
        match self.blocked {
            None => index
                .iter()
                .zip(&self.strides)
                .map(|(&i, &stride)| i * stride)
                .sum(),
            Some((dim, block)) => {
                let mut offset = index[dim] % block;
                for (d, (&i, &stride)) in index.iter().zip(&self.strides).enumerate() {
                    let outer = if d == dim { i / block } else { i };
                    offset += outer * stride;
                }
                offset
            }
        }
    }

    /// Stride of the slowest dimension (the batch, for activations).
    #[inline]
    pub(crate) fn outer_stride(&self) -> usize {
        self.strides[MAX_DIMS - 1]
    }
}

/// Calls `f` for every logical index within `extents`, fastest dimension first.
pub(crate) fn for_each_index(extents: [usize; MAX_DIMS], mut f: impl FnMut([usize; MAX_DIMS])) {
    for i3 in 0..extents[3] {
        for i2 in 0..extents[2] {
            for i1 in 0..extents[1] {
                for i0 in 0..extents[0] {
                    f([i0, i1, i2, i3]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_offsets() {
        let layout = CpuLayout::dense(&[4, 3, 2, 2]);
        assert_eq!(layout.memory_size(), 48);
        let idx = layout.indexer();
        assert_eq!(idx.offset([0, 0, 0, 0]), 0);
        assert_eq!(idx.offset([1, 0, 0, 0]), 1);
        assert_eq!(idx.offset([0, 1, 0, 0]), 4);
        assert_eq!(idx.offset([0, 0, 1, 0]), 12);
        assert_eq!(idx.offset([3, 2, 1, 1]), 47);
    }

    #[test]
    fn test_blocked_pads_channels() {
        // 3 channels blocked by 8: one padded block per image
        let layout = CpuLayout::blocked(&[2, 2, 3, 2], 2, 8);
        assert_eq!(layout.memory_size(), 2 * 2 * 8 * 2);

        let idx = layout.indexer();
        // Channel lanes are innermost
        assert_eq!(idx.offset([0, 0, 1, 0]), 1);
        assert_eq!(idx.offset([1, 0, 0, 0]), 8);
        assert_eq!(idx.offset([0, 1, 0, 0]), 16);
        assert_eq!(idx.offset([0, 0, 0, 1]), 32);
        assert_eq!(idx.outer_stride(), 32);
    }

    #[test]
    fn test_blocked_offsets_are_unique() {
        let layout = CpuLayout::blocked(&[3, 2, 11, 2], 2, 4);
        let idx = layout.indexer();
        let mut seen = vec![false; layout.memory_size()];
        for_each_index(layout.extents(), |i| {
            let off = idx.offset(i);
            assert!(!seen[off], "offset {off} hit twice");
            seen[off] = true;
        });
        // 11 channels in 3 blocks of 4: one padded lane per pixel
        assert_eq!(seen.iter().filter(|&&s| !s).count(), 3 * 2 * 2);
    }

    #[test]
    fn test_block_of_one_is_dense() {
        let sizes = [5, 5, 3, 1];
        assert_eq!(CpuLayout::blocked(&sizes, 2, 1), CpuLayout::dense(&sizes));
        assert_ne!(CpuLayout::blocked(&sizes, 2, 8), CpuLayout::dense(&sizes));
    }

    #[test]
    fn test_strided_memory_size() {
        // Row padding: width 3 with row stride 4
        let layout = CpuLayout::strided(&[3, 2], &[1, 4]);
        assert_eq!(layout.memory_size(), 7);
        assert_eq!(CpuLayout::strided(&[0, 2], &[1, 4]).memory_size(), 0);
    }
}
