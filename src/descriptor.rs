//! Layout descriptors: one per (primitive, resource role).
//!
//! A [`LayoutDescriptor`] pairs the canonical layout of a role with the layout
//! the backend prefers for it. If the two differ it owns a conversion pair and a
//! scratch buffer sized for the backend layout; otherwise it is pass-through
//! and never touches memory.
//!
//! # Conversion on read
//!
//! [`LayoutDescriptor::get_converted`] hands a primitive its input buffer:
//!
//! 1. pass-through: the tensor's canonical buffer, no work;
//! 2. empty cache slot: canonical → scratch, slot := this descriptor;
//! 3. slot held by `prev`:
//!    - unverified: reuse `prev`'s buffer;
//!    - same backend layout: reuse `prev`'s buffer;
//!    - otherwise bridge `prev` → scratch directly, or re-derive from the
//!      canonical buffer if the backend cannot bridge the two layouts.
//!
//! # Lazy output
//!
//! [`LayoutDescriptor::prepare_output`] points a primitive at the scratch
//! buffer. After the primitive succeeds, [`LayoutDescriptor::commit_output`]
//! marks the tensor's slot [`CacheState::BackendOnly`]; the canonical buffer
//! is only refreshed when somebody reads it.
//!
//! A primitive whose input tensor is cached in the buffer it writes gets its
//! input through [`LayoutDescriptor::get_converted_disjoint`] instead.
//!
//! Descriptors are shared through `Rc` because tensor cache slots keep the
//! descriptor that produced their backend copy alive.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use crate::backend::{Backend, Resource, ResourceTable};
use crate::buffer::AlignedBuffer;
use crate::error::{ConvError, ConvResult};
use crate::tensor::{CacheState, Side, Tensor, TensorMemory};

struct Conversions<P> {
    to_backend: P,
    from_backend: P,
}

/// Canonical/backend layout pair for one resource role.
pub struct LayoutDescriptor<B: Backend, S: Side> {
    backend: Rc<B>,
    label: String,
    canonical: Option<B::Layout>,
    layout: Option<B::Layout>,
    conversions: Option<Conversions<B::Primitive>>,
    scratch: RefCell<AlignedBuffer>,
    finalized: bool,
    _side: PhantomData<S>,
}

impl<B: Backend, S: Side> LayoutDescriptor<B, S> {
    /// Unbound descriptor.
    pub fn new<L: Into<String>>(backend: Rc<B>, label: L) -> Self {
        Self {
            backend,
            label: label.into(),
            canonical: None,
            layout: None,
            conversions: None,
            scratch: RefCell::new(AlignedBuffer::new()),
            finalized: false,
            _side: PhantomData,
        }
    }

    /// Debug label, e.g. `forward.src @ conv1`.
    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Binds the layout `primitive` prefers for `resource`.
    pub fn bind_to_primitive(&mut self, primitive: &B::Primitive, resource: Resource) -> ConvResult<()> {
        let layout = self
            .backend
            .layout_from_primitive(primitive, resource)
            .map_err(|status| {
                ConvError::backend(format!("layout of {resource} for {}", self.label), status)
            })?;
        self.bind_layout(layout);
        Ok(())
    }

    /// Binds an explicit backend layout.
    pub fn bind_layout(&mut self, layout: B::Layout) {
        self.layout = Some(layout);
        self.finalized = false;
    }

    /// Binds the canonical layout from explicit sizes and strides.
    pub fn bind_canonical(&mut self, sizes: &[usize], strides: &[usize]) -> ConvResult<()> {
        let layout = self
            .backend
            .layout_from_strides(sizes, strides)
            .map_err(|status| {
                ConvError::backend(format!("canonical layout for {}", self.label), status)
            })?;
        self.canonical = Some(layout);
        self.finalized = false;
        Ok(())
    }

    /// Builds the conversion pair and scratch buffer, or marks the descriptor
    /// pass-through when both layouts are equal.
    pub fn finalize(&mut self) -> ConvResult<()> {
        let (Some(canonical), Some(layout)) = (&self.canonical, &self.layout) else {
            return Err(ConvError::unbound(&self.label));
        };

        if self.backend.layouts_equal(canonical, layout) {
            self.conversions = None;
            *self.scratch.get_mut() = AlignedBuffer::new();
        } else {
            let to_backend = self.backend.create_conversion(canonical, layout).map_err(|status| {
                ConvError::backend(format!("conversion to backend layout for {}", self.label), status)
            })?;
            let from_backend = self.backend.create_conversion(layout, canonical).map_err(|status| {
                ConvError::backend(format!("conversion to canonical layout for {}", self.label), status)
            })?;
            self.conversions = Some(Conversions {
                to_backend,
                from_backend,
            });
            *self.scratch.get_mut() = AlignedBuffer::zeroed(self.backend.layout_memory_size(layout));
        }

        self.finalized = true;
        log::debug!(
            "finalized {} ({})",
            self.label,
            if self.conversions.is_some() { "converting" } else { "pass-through" }
        );
        Ok(())
    }

    /// Whether backend and canonical layouts are identical.
    #[inline]
    pub fn is_pass_through(&self) -> bool {
        self.conversions.is_none()
    }

    /// Backend layout.
    pub fn backend_layout(&self) -> ConvResult<&B::Layout> {
        self.layout.as_ref().ok_or_else(|| ConvError::unbound(&self.label))
    }

    /// Canonical layout.
    pub fn canonical_layout(&self) -> ConvResult<&B::Layout> {
        self.canonical.as_ref().ok_or_else(|| ConvError::unbound(&self.label))
    }

    /// Shared borrow of the scratch buffer.
    pub fn scratch(&self) -> ConvResult<Ref<'_, AlignedBuffer>> {
        self.scratch
            .try_borrow()
            .map_err(|_| ConvError::BufferInUse(self.label.clone()))
    }

    /// Exclusive borrow of the scratch buffer.
    pub fn scratch_mut(&self) -> ConvResult<RefMut<'_, AlignedBuffer>> {
        self.scratch
            .try_borrow_mut()
            .map_err(|_| ConvError::BufferInUse(self.label.clone()))
    }

    /// Converts canonical values into the scratch buffer.
    pub fn convert_to_backend(&self, canonical: &[f32]) -> ConvResult<()> {
        let conversions = self.conversions()?;
        log::debug!("convert canonical => backend for {}", self.label);
        let mut scratch = self.scratch_mut()?;
        self.run(&conversions.to_backend, canonical, &mut scratch, "conversion to backend layout")
    }

    /// Converts a buffer in this descriptor's backend layout to canonical form.
    pub fn materialize_from_backend(&self, backend: &[f32], canonical: &mut [f32]) -> ConvResult<()> {
        let conversions = self.conversions()?;
        log::debug!("convert backend => canonical for {}", self.label);
        self.run(&conversions.from_backend, backend, canonical, "conversion to canonical layout")
    }

    /// Converts the scratch buffer to canonical form.
    pub(crate) fn materialize_into(&self, canonical: &mut [f32]) -> ConvResult<()> {
        let scratch = self.scratch()?;
        self.materialize_from_backend(&scratch, canonical)
    }

    /// Input buffer for `tensor` in this descriptor's backend layout.
    ///
    /// `verify_layout == false` trusts whatever backend copy the tensor already
    /// caches.
    pub fn get_converted<'t>(
        self: &Rc<Self>,
        tensor: &'t mut Tensor<B>,
        verify_layout: bool,
    ) -> ConvResult<Converted<'t, B, S>> {
        self.ensure_finalized()?;
        let memory: &'t mut TensorMemory<B, S> = tensor.memory_mut::<S>();

        if self.is_pass_through() {
            return Ok(Converted::Canonical(memory.canonical()?));
        }

        let Some(previous) = memory.cached_descriptor().cloned() else {
            self.convert_to_backend(memory.canonical()?)?;
            memory.set_cached(Rc::clone(self), CacheState::Synced);
            return Ok(Converted::Backend(Rc::clone(self)));
        };

        if !verify_layout {
            #[cfg(debug_assertions)]
            self.check_unverified_reuse(&previous);
            return Ok(Converted::Backend(previous));
        }

        let previous_layout = previous.backend_layout()?;
        if self.backend.layouts_equal(previous_layout, self.backend_layout()?) {
            if !Rc::ptr_eq(&previous, self) {
                log::debug!("layout of {} matches {}, reusing", previous.label, self.label);
            }
            return Ok(Converted::Backend(previous));
        }

        match self.backend.create_conversion(previous_layout, self.backend_layout()?) {
            Ok(bridge) => {
                log::debug!("convert backend => backend {} => {}", previous.label, self.label);
                let state = memory.cache_state().unwrap_or(CacheState::Synced);
                {
                    let from = previous.scratch()?;
                    let mut to = self.scratch_mut()?;
                    self.run(&bridge, &from, &mut to, "backend-to-backend conversion")?;
                }
                memory.set_cached(Rc::clone(self), state);
            }
            Err(status) => {
                log::debug!(
                    "no direct conversion {} => {} (status {}), re-deriving from canonical",
                    previous.label,
                    self.label,
                    status
                );
                self.convert_to_backend(memory.canonical()?)?;
                memory.set_cached(Rc::clone(self), CacheState::Synced);
            }
        }
        Ok(Converted::Backend(Rc::clone(self)))
    }

    /// Input buffer for a primitive that writes through `output`.
    ///
    /// Same as [`get_converted`](Self::get_converted), except that a cached copy
    /// held in `output`'s scratch buffer is synced to canonical form and
    /// released first. The primitive never reads the buffer it writes.
    pub fn get_converted_disjoint<'t>(
        self: &Rc<Self>,
        tensor: &'t mut Tensor<B>,
        verify_layout: bool,
        output: &Rc<Self>,
    ) -> ConvResult<Converted<'t, B, S>> {
        let memory = tensor.memory_mut::<S>();
        if memory.cached_descriptor().is_some_and(|cached| Rc::ptr_eq(cached, output)) {
            log::debug!(
                "{} input is cached in the output buffer of {}, releasing",
                self.label,
                output.label
            );
            memory.release_cache()?;
        }
        self.get_converted(tensor, verify_layout)
    }

    /// Output buffer for `tensor`.
    ///
    /// A pass-through descriptor hands out the canonical buffer. Otherwise the
    /// primitive writes the scratch buffer. Either way the tensor's cache slot
    /// is emptied; [`commit_output`](Self::commit_output) records the write
    /// once the primitive has succeeded. The primitive must overwrite every
    /// element.
    pub fn prepare_output<'t>(self: &Rc<Self>, tensor: &'t mut Tensor<B>) -> ConvResult<Output<'t, B, S>> {
        self.ensure_finalized()?;
        let canonical = tensor.memory_mut::<S>().canonical_for_overwrite();
        if self.is_pass_through() {
            return Ok(Output::Canonical(canonical));
        }
        Ok(Output::Backend(Rc::clone(self)))
    }

    /// Marks `tensor` as holding this descriptor's scratch buffer
    /// ([`CacheState::BackendOnly`]). No-op for pass-through descriptors.
    pub fn commit_output(self: &Rc<Self>, tensor: &mut Tensor<B>) {
        if !self.is_pass_through() {
            tensor
                .memory_mut::<S>()
                .set_cached(Rc::clone(self), CacheState::BackendOnly);
        }
    }

    fn ensure_finalized(&self) -> ConvResult<()> {
        if self.finalized {
            Ok(())
        } else {
            Err(ConvError::unbound(&self.label))
        }
    }

    fn conversions(&self) -> ConvResult<&Conversions<B::Primitive>> {
        self.conversions
            .as_ref()
            .ok_or_else(|| ConvError::missing_conversion(&self.label))
    }

    fn run(&self, primitive: &B::Primitive, from: &[f32], to: &mut [f32], what: &str) -> ConvResult<()> {
        let mut table = ResourceTable::new();
        table.bind_read(Resource::From, from).bind_write(Resource::To, to);
        self.backend
            .execute(primitive, &mut table)
            .map_err(|status| ConvError::backend(format!("{what} for {}", self.label), status))
    }

    #[cfg(debug_assertions)]
    fn check_unverified_reuse(&self, previous: &Self) {
        let (Ok(cached), Ok(wanted)) = (previous.backend_layout(), self.backend_layout()) else {
            return;
        };
        if !self.backend.layouts_equal(cached, wanted) {
            log::warn!(
                "{} reuses the cached buffer of {} without verification, but their layouts differ",
                self.label,
                previous.label
            );
        }
    }
}

impl<B: Backend, S: Side> fmt::Debug for LayoutDescriptor<B, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutDescriptor")
            .field("label", &self.label)
            .field("side", &S::NAME)
            .field("canonical", &self.canonical)
            .field("layout", &self.layout)
            .field("pass_through", &self.is_pass_through())
            .finish()
    }
}

/// Input buffer returned by [`LayoutDescriptor::get_converted`].
pub enum Converted<'t, B: Backend, S: Side> {
    /// The tensor's canonical buffer (pass-through).
    Canonical(&'t [f32]),
    /// The scratch buffer of the given descriptor.
    Backend(Rc<LayoutDescriptor<B, S>>),
}

impl<B: Backend, S: Side> Converted<'_, B, S> {
    /// Borrows the underlying buffer.
    pub fn buffer(&self) -> ConvResult<BufferRef<'_>> {
        match self {
            Converted::Canonical(values) => Ok(BufferRef::Slice(values)),
            Converted::Backend(descriptor) => Ok(BufferRef::Scratch(descriptor.scratch()?)),
        }
    }

    /// Descriptor owning the buffer, `None` for canonical buffers.
    pub fn descriptor(&self) -> Option<&Rc<LayoutDescriptor<B, S>>> {
        match self {
            Converted::Canonical(_) => None,
            Converted::Backend(descriptor) => Some(descriptor),
        }
    }
}

/// Output buffer returned by [`LayoutDescriptor::prepare_output`].
pub enum Output<'t, B: Backend, S: Side> {
    /// The tensor's canonical buffer (pass-through).
    Canonical(&'t mut [f32]),
    /// The scratch buffer of the given descriptor.
    Backend(Rc<LayoutDescriptor<B, S>>),
}

impl<B: Backend, S: Side> Output<'_, B, S> {
    /// Mutably borrows the underlying buffer.
    pub fn buffer_mut(&mut self) -> ConvResult<BufferMut<'_>> {
        match self {
            Output::Canonical(values) => Ok(BufferMut::Slice(values)),
            Output::Backend(descriptor) => Ok(BufferMut::Scratch(descriptor.scratch_mut()?)),
        }
    }
}

/// Borrowed input buffer.
pub enum BufferRef<'a> {
    /// Canonical tensor memory.
    Slice(&'a [f32]),
    /// Descriptor scratch buffer.
    Scratch(Ref<'a, AlignedBuffer>),
}

impl Deref for BufferRef<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        match self {
            BufferRef::Slice(values) => values,
            BufferRef::Scratch(buffer) => buffer.as_slice(),
        }
    }
}

/// Borrowed output buffer.
pub enum BufferMut<'a> {
    /// Canonical tensor memory.
    Slice(&'a mut [f32]),
    /// Descriptor scratch buffer.
    Scratch(RefMut<'a, AlignedBuffer>),
}

impl Deref for BufferMut<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        match self {
            BufferMut::Slice(values) => values,
            BufferMut::Scratch(buffer) => buffer.as_slice(),
        }
    }
}

impl DerefMut for BufferMut<'_> {
    fn deref_mut(&mut self) -> &mut [f32] {
        match self {
            BufferMut::Slice(values) => values,
            BufferMut::Scratch(buffer) => buffer.as_mut_slice(),
        }
    }
}
