//! Shared helpers for the integration suites.
//!
//! - naive NCHW reference convolution (forward and the three backward passes)
//! - seeded random buffers
//! - [`TestBackend`]: a `CpuBackend` wrapper that counts executions and can
//!   refuse direct conversions between two blocked layouts

#![allow(dead_code)]

use std::cell::Cell;

use dnnconv::backend::cpu::{CpuBackend, CpuBackendOptions, CpuLayout, CpuPrimitive};
use dnnconv::{output_dim, Backend, BackendResult, ConvConfig, ConvDescriptor, ConvKind, Resource, ResourceTable, Status};
use rand::{rngs::StdRng, Rng, SeedableRng};

// =============================================================================
// Reference convolution
// =============================================================================

/// Geometry of a reference convolution, NCHW.
#[derive(Debug, Clone, Copy)]
pub struct RefConv {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
    pub oc: usize,
    pub kh: usize,
    pub kw: usize,
    pub sh: usize,
    pub sw: usize,
    pub ph: usize,
    pub pw: usize,
    pub g: usize,
}

impl RefConv {
    pub fn new(config: &ConvConfig, input_shape: [usize; 4]) -> Self {
        let [n, c, h, w] = input_shape;
        Self {
            n,
            c,
            h,
            w,
            oc: config.num_output,
            kh: config.kernel_h,
            kw: config.kernel_w,
            sh: config.stride_h,
            sw: config.stride_w,
            ph: config.pad_h,
            pw: config.pad_w,
            g: config.group,
        }
    }

    pub fn oh(&self) -> usize {
        output_dim(self.h, self.ph, self.kh, self.sh)
    }

    pub fn ow(&self) -> usize {
        output_dim(self.w, self.pw, self.kw, self.sw)
    }

    fn icg(&self) -> usize {
        self.c / self.g
    }

    fn ocg(&self) -> usize {
        self.oc / self.g
    }

    fn x(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        ((n * self.c + c) * self.h + y) * self.w + x
    }

    fn y(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        ((n * self.oc + c) * self.oh() + y) * self.ow() + x
    }

    fn k(&self, oc: usize, ic: usize, y: usize, x: usize) -> usize {
        ((oc * self.icg() + ic) * self.kh + y) * self.kw + x
    }

    /// Calls `f(n, oc, oy, ox, ic_global, icl, ky, kx, iy, ix)` for every
    /// in-bounds tap.
    fn for_each_tap(&self, mut f: impl FnMut([usize; 10])) {
        for n in 0..self.n {
            for oc in 0..self.oc {
                let g = oc / self.ocg();
                for oy in 0..self.oh() {
                    for ox in 0..self.ow() {
                        for icl in 0..self.icg() {
                            let ic = g * self.icg() + icl;
                            for ky in 0..self.kh {
                                let iy = (oy * self.sh + ky) as isize - self.ph as isize;
                                if iy < 0 || iy as usize >= self.h {
                                    continue;
                                }
                                for kx in 0..self.kw {
                                    let ix = (ox * self.sw + kx) as isize - self.pw as isize;
                                    if ix < 0 || ix as usize >= self.w {
                                        continue;
                                    }
                                    f([n, oc, oy, ox, ic, icl, ky, kx, iy as usize, ix as usize]);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn forward(&self, input: &[f32], weights: &[f32], bias: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0f32; self.n * self.oc * self.oh() * self.ow()];
        for n in 0..self.n {
            for oc in 0..self.oc {
                for oy in 0..self.oh() {
                    for ox in 0..self.ow() {
                        out[self.y(n, oc, oy, ox)] = bias[oc];
                    }
                }
            }
        }
        self.for_each_tap(|[n, oc, oy, ox, ic, icl, ky, kx, iy, ix]| {
            out[self.y(n, oc, oy, ox)] += input[self.x(n, ic, iy, ix)] * weights[self.k(oc, icl, ky, kx)];
        });
        out
    }

    pub fn backward_data(&self, diff_out: &[f32], weights: &[f32]) -> Vec<f32> {
        let mut diff_in = vec![0.0f32; self.n * self.c * self.h * self.w];
        self.for_each_tap(|[n, oc, oy, ox, ic, icl, ky, kx, iy, ix]| {
            diff_in[self.x(n, ic, iy, ix)] += diff_out[self.y(n, oc, oy, ox)] * weights[self.k(oc, icl, ky, kx)];
        });
        diff_in
    }

    pub fn backward_filter(&self, diff_out: &[f32], input: &[f32]) -> Vec<f32> {
        let mut diff_w = vec![0.0f32; self.oc * self.icg() * self.kh * self.kw];
        self.for_each_tap(|[n, oc, oy, ox, ic, icl, ky, kx, iy, ix]| {
            diff_w[self.k(oc, icl, ky, kx)] += diff_out[self.y(n, oc, oy, ox)] * input[self.x(n, ic, iy, ix)];
        });
        diff_w
    }

    pub fn backward_bias(&self, diff_out: &[f32]) -> Vec<f32> {
        let plane = self.oh() * self.ow();
        let mut diff_b = vec![0.0f32; self.oc];
        for n in 0..self.n {
            for oc in 0..self.oc {
                let start = (n * self.oc + oc) * plane;
                diff_b[oc] += diff_out[start..start + plane].iter().sum::<f32>();
            }
        }
        diff_b
    }
}

// =============================================================================
// Data helpers
// =============================================================================

pub fn random_vec(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32, what: &str) {
    assert_eq!(actual.len(), expected.len(), "{what}: length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let diff = (a - e).abs();
        assert!(
            diff <= tol * (1.0 + e.abs()),
            "{what}[{i}]: {a} vs {e}, diff={diff}"
        );
    }
}

// =============================================================================
// Instrumented backend
// =============================================================================

/// Primitive handle of [`TestBackend`].
#[derive(Debug)]
pub enum TestPrimitive {
    Convolution(CpuPrimitive),
    Conversion(CpuPrimitive),
}

/// `CpuBackend` wrapper with execution counters.
#[derive(Debug, Default)]
pub struct TestBackend {
    inner: CpuBackend,
    refuse_bridges: bool,
    pub convolutions_executed: Cell<usize>,
    pub conversions_executed: Cell<usize>,
    pub bridges_created: Cell<usize>,
}

impl TestBackend {
    pub fn new(options: CpuBackendOptions) -> Self {
        Self {
            inner: CpuBackend::with_options(options),
            ..Default::default()
        }
    }

    /// Backend that cannot convert between two blocked layouts directly.
    pub fn refusing(options: CpuBackendOptions) -> Self {
        Self {
            refuse_bridges: true,
            ..Self::new(options)
        }
    }

    pub fn blocked(block: usize) -> Self {
        Self::new(CpuBackendOptions {
            activation_block: block,
            filter_block: block,
        })
    }

    pub fn executions(&self) -> usize {
        self.convolutions_executed.get() + self.conversions_executed.get()
    }
}

fn is_blocked(layout: &CpuLayout) -> bool {
    matches!(layout, CpuLayout::Blocked { .. })
}

impl Backend for TestBackend {
    type Layout = CpuLayout;
    type Primitive = TestPrimitive;

    fn create_convolution(&self, kind: ConvKind, desc: &ConvDescriptor) -> BackendResult<TestPrimitive> {
        self.inner.create_convolution(kind, desc).map(TestPrimitive::Convolution)
    }

    fn layout_from_primitive(&self, primitive: &TestPrimitive, resource: Resource) -> BackendResult<CpuLayout> {
        match primitive {
            TestPrimitive::Convolution(p) => self.inner.layout_from_primitive(p, resource),
            TestPrimitive::Conversion(_) => Err(Status::INCORRECT_INPUT),
        }
    }

    fn layout_from_strides(&self, sizes: &[usize], strides: &[usize]) -> BackendResult<CpuLayout> {
        self.inner.layout_from_strides(sizes, strides)
    }

    fn layouts_equal(&self, a: &CpuLayout, b: &CpuLayout) -> bool {
        self.inner.layouts_equal(a, b)
    }

    fn layout_memory_size(&self, layout: &CpuLayout) -> usize {
        self.inner.layout_memory_size(layout)
    }

    fn create_conversion(&self, from: &CpuLayout, to: &CpuLayout) -> BackendResult<TestPrimitive> {
        if is_blocked(from) && is_blocked(to) {
            if self.refuse_bridges {
                return Err(Status::UNIMPLEMENTED);
            }
            self.bridges_created.set(self.bridges_created.get() + 1);
        }
        self.inner.create_conversion(from, to).map(TestPrimitive::Conversion)
    }

    fn execute(&self, primitive: &TestPrimitive, resources: &mut ResourceTable<'_>) -> BackendResult<()> {
        match primitive {
            TestPrimitive::Convolution(p) => {
                self.convolutions_executed.set(self.convolutions_executed.get() + 1);
                self.inner.execute(p, resources)
            }
            TestPrimitive::Conversion(p) => {
                self.conversions_executed.set(self.conversions_executed.get() + 1);
                self.inner.execute(p, resources)
            }
        }
    }
}
