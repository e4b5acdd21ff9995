//! Explicit layer registry.
//!
//! Maps a layer type name to a constructor. Nothing registers itself; callers
//! build a registry at startup and look layers up by name.
//!
//! # Example
//!
//! ```rust
//! use std::rc::Rc;
//! use dnnconv::{ConvConfig, CpuBackend, LayerRegistry};
//!
//! let registry = LayerRegistry::<CpuBackend>::with_defaults();
//! let layer = registry
//!     .create("DnnConvolution", Rc::new(CpuBackend::new()), ConvConfig::square(8, 3, 1, 1), [1, 3, 16, 16])
//!     .unwrap();
//! assert_eq!(layer.output_shape(), [1, 8, 16, 16]);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::backend::Backend;
use crate::config::ConvConfig;
use crate::error::{ConvError, ConvResult};
use crate::layer::ConvolutionLayer;

/// Name the default convolution constructor is registered under.
pub const CONVOLUTION_LAYER: &str = "DnnConvolution";

/// Builds a layer for an input shape `[n, c, h, w]`.
pub type LayerConstructor<B> = fn(Rc<B>, ConvConfig, [usize; 4]) -> ConvResult<ConvolutionLayer<B>>;

/// Name → constructor table.
pub struct LayerRegistry<B: Backend> {
    constructors: BTreeMap<String, LayerConstructor<B>>,
}

impl<B: Backend> LayerRegistry<B> {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the built-in convolution layer.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(CONVOLUTION_LAYER, ConvolutionLayer::new);
        registry
    }

    /// Registers `constructor` under `name`, returning the one it replaces.
    pub fn register<S: Into<String>>(
        &mut self,
        name: S,
        constructor: LayerConstructor<B>,
    ) -> Option<LayerConstructor<B>> {
        let name = name.into();
        log::debug!("registering layer type {name}");
        self.constructors.insert(name, constructor)
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Builds a layer of type `name`.
    pub fn create(
        &self,
        name: &str,
        backend: Rc<B>,
        config: ConvConfig,
        input_shape: [usize; 4],
    ) -> ConvResult<ConvolutionLayer<B>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| ConvError::UnknownLayer(name.to_string()))?;
        constructor(backend, config, input_shape)
    }
}

impl<B: Backend> Default for LayerRegistry<B> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<B: Backend> fmt::Debug for LayerRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::{CpuBackend, CpuBackendOptions};

    fn plain_convolution(
        _backend: Rc<CpuBackend>,
        config: ConvConfig,
        input_shape: [usize; 4],
    ) -> ConvResult<ConvolutionLayer<CpuBackend>> {
        let backend = Rc::new(CpuBackend::with_options(CpuBackendOptions::plain()));
        ConvolutionLayer::new(backend, config, input_shape)
    }

    #[test]
    fn test_defaults() {
        let registry = LayerRegistry::<CpuBackend>::with_defaults();
        assert!(registry.contains(CONVOLUTION_LAYER));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["DnnConvolution"]);
    }

    #[test]
    fn test_unknown_layer() {
        let registry = LayerRegistry::<CpuBackend>::new();
        let err = registry
            .create("Pooling", Rc::new(CpuBackend::new()), ConvConfig::default(), [1, 1, 8, 8])
            .unwrap_err();
        assert!(matches!(err, ConvError::UnknownLayer(ref name) if name == "Pooling"));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = LayerRegistry::<CpuBackend>::with_defaults();
        assert!(registry.register("PlainConvolution", plain_convolution).is_none());
        assert!(registry.register("PlainConvolution", plain_convolution).is_some());
        assert_eq!(registry.names().count(), 2);

        let layer = registry
            .create("PlainConvolution", Rc::new(CpuBackend::new()), ConvConfig::square(2, 3, 1, 1), [1, 2, 6, 6])
            .unwrap();
        assert!(layer.plan().forward().src.is_pass_through());
    }

    #[test]
    fn test_create_propagates_config_errors() {
        let registry = LayerRegistry::<CpuBackend>::with_defaults();
        let err = registry
            .create(CONVOLUTION_LAYER, Rc::new(CpuBackend::new()), ConvConfig::square(3, 3, 1, 1).with_group(2), [1, 4, 8, 8])
            .unwrap_err();
        assert!(matches!(err, ConvError::Config(_)));
    }
}
