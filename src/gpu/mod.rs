//! # GPU Execution Layer
//!
//! Device access for `minigpu`: a context bound to one device thread, typed
//! buffers that pack narrow and wide integers into 32-bit words, and compute
//! shaders that cache their pipelines across dispatches.
//!
//! ## Execution model
//!
//! Every `wgpu` call runs on a single thread owned by the [`Context`]. Caller
//! threads never touch the device directly; they hand closures to the device
//! thread and either wait for the result (`write`, `read`, `dispatch`) or get
//! a callback (`read_async`, `dispatch_async`). Work runs in the order it was
//! queued, so a read queued after a dispatch observes the dispatch's output.
//!
//! ---
//!
//! ## Module structure
//!
//! * [`config`] - context configuration and dispatch limits
//! * [`context`] - device initialization and the caller-facing handle
//! * [`kernels`] - WGSL conversion kernels for packed element types
//! * [`pipeline`] - staged pipeline construction and the conversion cache
//! * [`buffer`] - typed device buffers
//! * [`shader`] - compute shaders and change detection
//!
//! The device thread's executor and the dispatch path are internal.
//!
//! ---
//!
//! ## Error handling
//!
//! Device-side failures are captured with error scopes and returned as
//! [`DeviceError`](crate::engine::error::DeviceError). Misuse (bad ranges,
//! type mismatches, unsafe dispatch sizes) is rejected before any device work
//! is queued.

pub mod config;
pub mod context;
pub(crate) mod executor;
pub mod kernels;
pub mod pipeline;
pub mod buffer;
pub mod shader;
pub(crate) mod dispatch;

pub use buffer::Buffer;
pub use config::{ContextConfig, DispatchLimits, PackingStrategy};
pub use context::{Context, DeviceCapabilities};
pub use shader::{BuildStats, ComputeShader};
