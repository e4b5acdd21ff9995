//! # dnnconv - Convolution with backend layout negotiation
//!
//! A 2-D (optionally grouped) convolution operator that runs on an optimized
//! compute backend whose preferred memory layouts differ from the dense
//! framework layout, converting between the two only when needed.
//!
//! ## Architecture
//! - [`Backend`]: the compute seam (primitives, layouts, conversions)
//! - [`LayoutDescriptor`]: canonical/backend layout pair per resource role,
//!   with a conversion pair and a 64-byte aligned scratch buffer
//! - [`Tensor`]: canonical data/gradient buffers, each with a single-slot
//!   cache of its last backend-layout copy
//! - [`ConvolutionPlan`]: forward, backward-data, backward-filter and
//!   backward-bias primitives built once per layer
//! - [`ConvolutionLayer`]: forward/backward execution with lazy outputs
//!
//! ## Usage
//! ```rust
//! use std::rc::Rc;
//! use dnnconv::{BackwardFlags, ConvConfig, ConvolutionLayer, CpuBackend, Tensor};
//!
//! let backend = Rc::new(CpuBackend::new());
//! let config = ConvConfig::square(8, 3, 1, 1).with_seed(42);
//! let mut layer = ConvolutionLayer::new(backend, config, [2, 3, 16, 16]).unwrap();
//!
//! let mut input = Tensor::new(&[2, 3, 16, 16]);
//! let mut output = layer.new_output();
//! layer.forward(&mut input, &mut output).unwrap();
//!
//! // Output stays in the backend layout until read
//! assert_eq!(output.data().unwrap().len(), 2 * 8 * 16 * 16);
//!
//! output.diff_mut().unwrap().fill(1.0);
//! layer.backward(&mut output, BackwardFlags::ALL, &mut input).unwrap();
//! assert!(layer.bias.diff().unwrap().iter().all(|&g| g == 512.0));
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod layer;
pub mod plan;
pub mod registry;
pub mod shape;
pub mod tensor;

// Re-exports
pub use backend::cpu::{CpuBackend, CpuBackendOptions, CpuLayout};
pub use backend::{Backend, BackendResult, ConvDescriptor, ConvKind, Resource, ResourceTable, Status};
pub use buffer::{AlignedBuffer, CACHE_LINE};
pub use config::{ConfigError, ConvConfig, Filler, DEFAULT_LAYER_NAME};
pub use descriptor::{Converted, LayoutDescriptor, Output};
pub use error::{ConvError, ConvResult};
pub use layer::{BackwardFlags, ConvolutionLayer};
pub use plan::ConvolutionPlan;
pub use registry::{LayerConstructor, LayerRegistry, CONVOLUTION_LAYER};
pub use shape::{output_dim, CanonicalLayout, ConvGeometry};
pub use tensor::{CacheState, Data, Diff, Side, Tensor, TensorMemory};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
