//! # GPU Context
//!
//! This module owns device initialization and the caller-facing context
//! handle.
//!
//! ## Two halves
//!
//! * [`GPUContext`] holds the `wgpu` instance, adapter, device and queue. It is
//!   created **on the device thread** and never leaves it; every device call in
//!   the crate goes through it.
//! * [`Context`] is the cheap, cloneable handle callers hold. It owns the
//!   executor that runs the device thread and forwards work to it as
//!   closures.
//!
//! ## Lifetime
//!
//! A context is created explicitly and torn down explicitly with
//! [`Context::destroy`], or implicitly when the last handle (including those
//! held by buffers and shaders) is dropped. Teardown stops accepting work,
//! lets queued tasks finish and releases the device on its own thread.
//!
//! ## Failure modes
//!
//! Initialization may fail for lack of a compatible adapter, driver errors or
//! platform limits. All such failures surface as
//! [`DeviceError::InitFailed`]. Device-side validation errors raised after
//! initialization are captured with error scopes (see [`GPUContext::capture`])
//! and never reach `wgpu`'s default uncaptured-error handler.

use std::sync::{mpsc, Arc, OnceLock};

use wgpu::Instance;

use crate::engine::error::{DeviceError, ExecutorError, GpuError, GpuResult};
use crate::gpu::config::{ContextConfig, DispatchLimits};
use crate::gpu::executor::{DeviceExecutor, Runtime};


/// Adapter and device properties captured at initialization.

#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    /// Adapter name, vendor, backend and driver.
    pub adapter: wgpu::AdapterInfo,

    /// Limits the device was created with.
    pub limits: wgpu::Limits,

    /// Features the adapter supports.
    pub features: wgpu::Features,
}

/// Owned GPU execution state.
///
/// ## Role
/// `GPUContext` owns the low-level objects required to run compute work:
/// * the [`wgpu::Instance`] and selected [`wgpu::Adapter`],
/// * a logical [`wgpu::Device`], and
/// * its submission [`wgpu::Queue`].
///
/// ## Thread affinity
/// Created by, owned by and only touched from the device thread.

#[derive(Debug)]
pub struct GPUContext {
    /// Backend instance.
    pub instance: wgpu::Instance,
    /// Selected adapter.
    pub adapter: wgpu::Adapter,
    /// Logical device.
    pub device: wgpu::Device,
    /// Submission queue.
    pub queue: wgpu::Queue,
    /// Prefix for object labels.
    pub label: String,
}

impl GPUContext {

    /// Initializes adapter, device and queue.
    ///
    /// ## Behavior
    /// 1. Creates a default `wgpu::Instance`.
    /// 2. Requests an adapter with the configured power preference.
    /// 3. Creates a device with default limits, raised to the adapter's
    ///    buffer-size and storage-binding limits so large arrays and shaders
    ///    with many bindings are accepted.
    ///
    /// ## Blocking behavior
    /// Runs synchronously with `pollster::block_on`. Called once, at the start
    /// of the device thread.
    ///
    /// ## Errors
    /// Returns [`DeviceError::InitFailed`] if no adapter is found or the device
    /// cannot be created.

    pub fn new(config: &ContextConfig) -> GpuResult<Self> {
        let instance = Instance::default();

        let adapter = pollster::block_on(
            instance.request_adapter(
                &wgpu::RequestAdapterOptions {
                    power_preference: config.power_preference,
                    compatible_surface: None,
                    force_fallback_adapter: config.force_fallback_adapter,
                }
            )
        )
        .map_err(|e| DeviceError::InitFailed { message: format!("{e:?}").into() })?;

        let supported = adapter.limits();
        let required_limits = wgpu::Limits {
            max_buffer_size: supported.max_buffer_size,
            max_storage_buffer_binding_size: supported.max_storage_buffer_binding_size,
            max_storage_buffers_per_shader_stage: supported.max_storage_buffers_per_shader_stage,
            max_bindings_per_bind_group: supported.max_bindings_per_bind_group,
            ..wgpu::Limits::default()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some(config.label.as_str()),
                required_features: wgpu::Features::empty(),
                required_limits,
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::default(),
                trace: wgpu::Trace::Off
            },
        ))
        .map_err(|e| DeviceError::InitFailed { message: format!("{e:?}").into() })?;

        device.set_device_lost_callback(|reason, message| {
            log::error!("device lost: reason={reason:?}, message={message}");
        });

        let info = adapter.get_info();
        log::info!(
            "device ready: {} ({:?}, {:?})",
            info.name, info.backend, info.device_type
        );

        Ok(Self { instance, adapter, device, queue, label: config.label.clone() })
    }

    /// Snapshot of adapter and device properties.
    pub fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            adapter: self.adapter.get_info(),
            limits: self.device.limits(),
            features: self.adapter.features(),
        }
    }

    /// Runs `f` inside validation and out-of-memory error scopes.
    ///
    /// Returns the scoped error's description if the device reported one.
    /// Callers map the message into the [`DeviceError`] variant for their
    /// stage.

    pub fn capture<T>(&self, f: impl FnOnce() -> T) -> Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let value = f();

        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());

        match validation.or(out_of_memory) {
            None => Ok(value),
            Some(error) => Err(error.to_string()),
        }
    }

    /// Object label `"{device label}_{suffix}"`.
    #[inline]
    pub fn label(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.label)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Caller-facing handle
// ─────────────────────────────────────────────────────────────────────────────

struct ContextInner {
    config: ContextConfig,
    executor: DeviceExecutor,
    capabilities: Arc<OnceLock<DeviceCapabilities>>,
}

/// Handle to a device and the thread that owns it.
///
/// Cloning is cheap and every clone refers to the same device. Buffers and
/// shaders keep a clone, so the device outlives them unless
/// [`destroy`](Context::destroy) is called explicitly.

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("label", &self.inner.config.label)
            .field("shut_down", &self.inner.executor.is_shut_down())
            .finish()
    }
}

impl Context {

    /// Creates a context and blocks until the device is ready.
    ///
    /// ## Errors
    /// * [`DeviceError::InitFailed`] if no device could be created.
    /// * [`ExecutorError::SpawnFailed`] if the device thread could not start.

    pub fn new(config: ContextConfig) -> GpuResult<Self> {
        let (tx, rx) = mpsc::sync_channel(1);
        let context = Self::spawn(config, move |result| {
            let _ = tx.send(result);
        })?;

        match rx.recv() {
            Ok(Ok(())) => Ok(context),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ExecutorError::TaskDropped.into()),
        }
    }

    /// Creates a context without waiting for the device.
    ///
    /// `on_ready` runs on the device thread once initialization finishes.
    /// Work submitted before then queues behind initialization; if
    /// initialization fails, that work completes with
    /// [`ExecutorError::TaskDropped`].

    pub fn new_async(
        config: ContextConfig,
        on_ready: impl FnOnce(GpuResult<()>) + Send + 'static,
    ) -> GpuResult<Self> {
        Self::spawn(config, on_ready)
    }

    fn spawn(
        config: ContextConfig,
        on_ready: impl FnOnce(GpuResult<()>) + Send + 'static,
    ) -> GpuResult<Self> {
        let capabilities = Arc::new(OnceLock::new());
        let slot = Arc::clone(&capabilities);

        let executor = DeviceExecutor::spawn(config.clone(), move |result| {
            on_ready(result.map(|caps| {
                let _ = slot.set(caps);
            }));
        })?;

        Ok(Self {
            inner: Arc::new(ContextInner { config, executor, capabilities }),
        })
    }

    /// Stops the device thread after the already-queued work has run.
    ///
    /// Idempotent. Later operations on this context or its buffers and
    /// shaders fail with [`ExecutorError::ShutDown`].
    pub fn destroy(&self) {
        self.inner.executor.shutdown();
    }

    /// `true` once [`destroy`](Context::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.inner.executor.is_shut_down()
    }

    /// Adapter and device properties, once initialization has finished.
    pub fn capabilities(&self) -> Option<&DeviceCapabilities> {
        self.inner.capabilities.get()
    }

    /// Configuration this context was created with.
    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    /// Effective dispatch ceiling: the configured limits tightened to the
    /// device's per-dimension workgroup limit.
    pub fn dispatch_limits(&self) -> DispatchLimits {
        let configured = self.inner.config.dispatch_limits;
        match self.capabilities() {
            Some(caps) => configured.clamped_to(caps.limits.max_compute_workgroups_per_dimension),
            None => configured,
        }
    }

    /// `true` when both handles refer to the same device.
    pub fn same_device(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queues `task` on the device thread without waiting.
    pub(crate) fn submit(
        &self,
        task: impl FnOnce(&mut Runtime) + Send + 'static,
    ) -> Result<(), ExecutorError> {
        self.inner.executor.submit(task)
    }

    /// Runs `task` on the device thread and waits for its result.
    pub(crate) fn run_blocking<R: Send + 'static>(
        &self,
        task: impl FnOnce(&mut Runtime) -> GpuResult<R> + Send + 'static,
    ) -> GpuResult<R> {
        self.inner.executor.run_blocking(task)
    }
}

impl From<mpsc::RecvError> for GpuError {
    fn from(_: mpsc::RecvError) -> Self {
        ExecutorError::TaskDropped.into()
    }
}
