//! # Compute Shaders
//!
//! A [`ComputeShader`] holds WGSL source, a table of buffer bindings keyed by
//! slot number, and the device objects compiled from them.
//!
//! ## State machine
//!
//! ```text
//! Empty ──load_source──▶ SourceLoaded ──set_binding──▶ Dirty
//!                                                        │ dispatch (rebuild)
//!                                                        ▼
//!                    Clean ◀──────────── dispatch (reuse) ┘
//! ```
//!
//! Two dirty flags decide how much is rebuilt before the next dispatch:
//!
//! * `pipeline_dirty` (new source, new entry point, a slot populated for the
//!   first time): shader module, bind group layout, pipeline layout, pipeline
//!   and bind group are rebuilt in that order.
//! * `bindings_dirty` (a slot rebound to a different buffer, or a bound
//!   buffer reallocated): only the bind group is rebuilt.
//!
//! Change detection is structural: source text is compared byte for byte
//! and bindings by buffer identity plus [`AllocationId`]. A dispatch with
//! unchanged source, bindings and allocations creates no device objects.
//! Group counts are recorded but no cached object depends on them.
//!
//! ## Locking
//!
//! The shader's state is guarded by its own mutex. Binding changes from
//! caller threads and dispatches on the device thread both take it; a
//! dispatch then locks each bound buffer. The order is always shader first,
//! then buffers.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::engine::error::{DispatchError, ExecutorError, GpuError, GpuResult};
use crate::engine::types::AllocationId;
use crate::gpu::buffer::{Buffer, BufferShared};
use crate::gpu::context::Context;
use crate::gpu::dispatch;
use crate::gpu::executor::Completion;
use crate::gpu::pipeline::ENTRY_POINT;


/// Highest slot accepted when the device has not reported its own limit.
const FALLBACK_MAX_BINDINGS: u32 = 1000;

/// View of one bound buffer. Never owns the buffer.
#[derive(Debug)]
pub(crate) struct BufferBinding {
    pub source: Weak<BufferShared>,
    pub allocation: Option<AllocationId>,
    pub size: u64,
}

/// Compiled objects reused across dispatches.
#[derive(Debug)]
pub(crate) struct CachedPipeline {
    pub pipeline: wgpu::ComputePipeline,
    pub bind_group_layout: wgpu::BindGroupLayout,
}

#[derive(Debug)]
pub(crate) struct ShaderState {
    pub source: Option<String>,
    pub entry_point: String,
    pub bindings: Vec<Option<BufferBinding>>,
    pub pipeline_dirty: bool,
    pub bindings_dirty: bool,
    pub cached: Option<CachedPipeline>,
    pub bind_group: Option<wgpu::BindGroup>,
    pub last_groups: Option<[u32; 3]>,
}

/// Running totals of device objects a shader has created.
#[derive(Debug, Default)]
pub(crate) struct BuildCounters {
    pub shader_modules: AtomicU64,
    pub bind_group_layouts: AtomicU64,
    pub pipeline_layouts: AtomicU64,
    pub pipelines: AtomicU64,
    pub bind_groups: AtomicU64,
}

impl BuildCounters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BuildStats {
        BuildStats {
            shader_modules: self.shader_modules.load(Ordering::Relaxed),
            bind_group_layouts: self.bind_group_layouts.load(Ordering::Relaxed),
            pipeline_layouts: self.pipeline_layouts.load(Ordering::Relaxed),
            pipelines: self.pipelines.load(Ordering::Relaxed),
            bind_groups: self.bind_groups.load(Ordering::Relaxed),
        }
    }
}

/// Device objects a shader has created over its lifetime.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildStats {
    /// Shader modules compiled.
    pub shader_modules: u64,
    /// Bind group layouts created.
    pub bind_group_layouts: u64,
    /// Pipeline layouts created.
    pub pipeline_layouts: u64,
    /// Compute pipelines created.
    pub pipelines: u64,
    /// Bind groups created.
    pub bind_groups: u64,
}

pub(crate) struct ShaderInner {
    state: Mutex<ShaderState>,
    pub stats: BuildCounters,
}

impl ShaderInner {
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, ShaderState>, ExecutorError> {
        self.state
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned { what: "shader state" })
    }
}

/// WGSL compute shader with cached pipeline state.
///
/// ## Role
/// Owns shader source and a slot→buffer binding table, and turns them into a
/// pipeline and bind group on demand. Every populated slot `n` is bound as a
/// `read_write` storage buffer at `@group(0) @binding(n)`.
///
/// ## Lifetime
/// Dropping the shader queues release of its device objects on the device
/// thread. Bound buffers are not owned and may be dropped first; a dispatch
/// against a dropped buffer is rejected.

pub struct ComputeShader {
    context: Context,
    inner: Arc<ShaderInner>,
}

impl std::fmt::Debug for ComputeShader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeShader")
            .field("has_source", &self.has_source())
            .field("bindings", &self.binding_count())
            .field("stats", &self.stats())
            .finish()
    }
}

impl ComputeShader {

    /// Creates a shader with no source and no bindings.
    pub fn new(context: &Context) -> Self {
        Self {
            context: context.clone(),
            inner: Arc::new(ShaderInner {
                state: Mutex::new(ShaderState {
                    source: None,
                    entry_point: ENTRY_POINT.to_owned(),
                    bindings: Vec::new(),
                    pipeline_dirty: true,
                    bindings_dirty: true,
                    cached: None,
                    bind_group: None,
                    last_groups: None,
                }),
                stats: BuildCounters::default(),
            }),
        }
    }

    /// Replaces the shader source.
    ///
    /// Identical source is a no-op and keeps all cached state.
    ///
    /// ## Errors
    /// [`DispatchError::EmptySource`] for an empty string.

    pub fn load_source(&self, source: &str) -> GpuResult<()> {
        if source.is_empty() {
            return Err(DispatchError::EmptySource.into());
        }
        let mut state = self.inner.lock()?;
        if state.source.as_deref() == Some(source) {
            log::trace!("shader source unchanged");
            return Ok(());
        }
        state.source = Some(source.to_owned());
        state.pipeline_dirty = true;
        log::debug!("shader source loaded ({} bytes)", source.len());
        Ok(())
    }

    /// Loads shader source from a file.
    ///
    /// ## Errors
    /// [`GpuError::Io`] if the file cannot be read, otherwise as
    /// [`load_source`](ComputeShader::load_source).

    pub fn load_source_file(&self, path: impl AsRef<Path>) -> GpuResult<()> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| GpuError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        self.load_source(&source)
    }

    /// `true` once source has been loaded.
    pub fn has_source(&self) -> bool {
        self.inner.lock().is_ok_and(|s| s.source.is_some())
    }

    /// Sets the entry point function name (default `main`).
    pub fn set_entry_point(&self, name: &str) -> GpuResult<()> {
        let mut state = self.inner.lock()?;
        if state.entry_point != name {
            state.entry_point = name.to_owned();
            state.pipeline_dirty = true;
        }
        Ok(())
    }

    /// Binds `buffer` at `slot`.
    ///
    /// Binding the buffer already bound at `slot` (same allocation) is a
    /// no-op. Rebinding a populated slot only invalidates the bind group; a
    /// slot populated for the first time changes the layout and invalidates
    /// the pipeline.
    ///
    /// ## Errors
    /// * [`DispatchError::InvalidSlot`] if `slot` exceeds the device's binding
    ///   limit.
    /// * [`DispatchError::ForeignBuffer`] if `buffer` belongs to another
    ///   context.
    /// * [`DispatchError::UnallocatedBinding`] if `buffer` holds no device
    ///   allocation, either never allocated or already released. The binding
    ///   table is left unchanged.

    pub fn set_binding(&self, slot: u32, buffer: &Buffer) -> GpuResult<()> {
        let max_bindings = self
            .context
            .capabilities()
            .map_or(FALLBACK_MAX_BINDINGS, |caps| caps.limits.max_bindings_per_bind_group);
        if slot >= max_bindings {
            return Err(DispatchError::InvalidSlot { slot: slot as i64 }.into());
        }
        if !buffer.context().same_device(&self.context) {
            return Err(DispatchError::ForeignBuffer { slot }.into());
        }

        let Some(allocation) = buffer.allocation_id() else {
            log::error!("slot {slot}: buffer has no device allocation");
            return Err(DispatchError::UnallocatedBinding { slot }.into());
        };
        let allocation = Some(allocation);
        let size = buffer.physical_bytes();
        let source = buffer.downgrade();

        let mut state = self.inner.lock()?;
        let index = slot as usize;
        if state.bindings.len() <= index {
            state.bindings.resize_with(index + 1, || None);
        }

        let new_slot = match &state.bindings[index] {
            Some(existing) if existing.source.ptr_eq(&source) && existing.allocation == allocation => {
                log::trace!("slot {slot} already bound to this buffer");
                return Ok(());
            }
            Some(_) => false,
            None => true,
        };
        if new_slot {
            state.pipeline_dirty = true;
        } else {
            state.bindings_dirty = true;
        }

        state.bindings[index] = Some(BufferBinding { source, allocation, size });
        Ok(())
    }

    /// Number of populated slots.
    pub fn binding_count(&self) -> usize {
        self.inner
            .lock()
            .map_or(0, |s| s.bindings.iter().filter(|b| b.is_some()).count())
    }

    /// Group counts of the last successful dispatch.
    pub fn last_dispatch(&self) -> Option<[u32; 3]> {
        self.inner.lock().ok().and_then(|s| s.last_groups)
    }

    /// Device objects created so far.
    pub fn stats(&self) -> BuildStats {
        self.inner.stats.snapshot()
    }

    fn precheck(&self, x: u32, y: u32, z: u32) -> GpuResult<()> {
        self.context.dispatch_limits().check(x, y, z)?;
        if !self.has_source() {
            return Err(DispatchError::MissingSource.into());
        }
        Ok(())
    }

    /// Runs the shader over `x * y * z` workgroups.
    ///
    /// Blocks until the device thread has submitted the work, not until the
    /// device has finished it. Reads issued afterwards observe the results.
    ///
    /// ## Errors
    /// * [`DispatchError`] if a group count is zero, exceeds the ceiling, no
    ///   source is loaded, or a bound buffer is gone or unallocated. Nothing
    ///   is submitted in these cases.
    /// * [`DeviceError`](crate::engine::error::DeviceError) if a build stage
    ///   or the submission fails.

    pub fn dispatch(&self, x: u32, y: u32, z: u32) -> GpuResult<()> {
        let result = self.precheck(x, y, z).and_then(|()| {
            let inner = Arc::clone(&self.inner);
            self.context
                .run_blocking(move |runtime| dispatch::submit(runtime, &inner, [x, y, z]).map(|_| ()))
        });
        result.inspect_err(|e| log::error!("dispatch {x}x{y}x{z} rejected: {e}"))
    }

    /// Like [`dispatch`](ComputeShader::dispatch) without blocking.
    ///
    /// `callback` runs exactly once: on the calling thread if the dispatch is
    /// rejected before queuing, otherwise on the device thread after
    /// submission.

    pub fn dispatch_async(
        &self,
        x: u32,
        y: u32,
        z: u32,
        callback: impl FnOnce(GpuResult<()>) + Send + 'static,
    ) {
        if let Err(e) = self.precheck(x, y, z) {
            log::error!("dispatch {x}x{y}x{z} rejected: {e}");
            callback(Err(e));
            return;
        }

        let completion = Completion::new(callback);
        let inner = Arc::clone(&self.inner);
        let queued = self.context.submit(move |runtime| {
            let result = dispatch::submit(runtime, &inner, [x, y, z]).map(|_| ());
            if let Err(e) = &result {
                log::error!("async dispatch {x}x{y}x{z} failed: {e}");
            }
            completion.complete(result);
        });
        if let Err(e) = queued {
            log::error!("async dispatch not queued: {e}");
        }
    }
}

impl Drop for ComputeShader {
    fn drop(&mut self) {
        let released = match self.inner.lock() {
            Ok(mut state) => (state.cached.take(), state.bind_group.take()),
            Err(_) => return,
        };
        if released.0.is_some() || released.1.is_some() {
            let queued = self.context.submit(move |_| drop(released));
            if queued.is_err() {
                log::debug!("device thread gone; shader objects dropped in place");
            }
        }
    }
}
