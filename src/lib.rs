//! # minigpu
//!
//! Native compute layer for driving a GPU from a managed-language host:
//! typed device buffers, WGSL compute shaders with cached pipelines, and a
//! single device thread that serializes every graphics API call.
//!
//! ## Design Goals
//! - One thread owns the device; callers only queue work
//! - Narrow (8/16-bit) and wide (64-bit) scalars stored losslessly in
//!   32-bit words
//! - Bounds and dispatch-size checks before any device call
//! - No device object rebuilt unless its inputs changed
//!
//! This crate builds as both:
//! - `rlib` (for Rust usage & integration tests)
//! - `cdylib` (for FFI / DLL usage, see [`ffi`])
//!
//! ## Example
//!
//! ```no_run
//! use minigpu::prelude::*;
//!
//! # fn main() -> minigpu::GpuResult<()> {
//! let context = Context::new(ContextConfig::default())?;
//! let input = Buffer::create(&context, 4, LogicalType::Int8)?;
//! let output = Buffer::create(&context, 4, LogicalType::Int8)?;
//! input.write(&[1i8, -2, 3, -4])?;
//!
//! let shader = ComputeShader::new(&context);
//! shader.load_source(
//!     "@group(0) @binding(0) var<storage, read_write> a: array<u32>;
//!      @group(0) @binding(1) var<storage, read_write> b: array<u32>;
//!      @compute @workgroup_size(1)
//!      fn main(@builtin(global_invocation_id) id: vec3<u32>) { b[id.x] = a[id.x]; }",
//! )?;
//! shader.set_binding(0, &input)?;
//! shader.set_binding(1, &output)?;
//! shader.dispatch(1, 1, 1)?;
//!
//! assert_eq!(output.read::<i8>(4, 0)?, vec![1, -2, 3, -4]);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod engine;
pub mod gpu;

#[cfg(feature = "ffi")]
pub mod ffi;

// ─────────────────────────────────────────────────────────────────────────────
// Re-exports (Public API)
// ─────────────────────────────────────────────────────────────────────────────

pub use engine::types::{
    AllocationId,
    Element,
    LogicalType,
    PackKind,
    WordLayout,
};

pub use engine::error::{
    GpuResult,
    GpuError,
    BoundsError,
    PhysicalRangeError,
    TypeMismatchError,
    CapacityError,
    DispatchError,
    KernelError,
    DeviceError,
    ExecutorError,
};

pub use gpu::{
    Buffer,
    BuildStats,
    ComputeShader,
    Context,
    ContextConfig,
    DeviceCapabilities,
    DispatchLimits,
    PackingStrategy,
};

// ─────────────────────────────────────────────────────────────────────────────
// Prelude
// ─────────────────────────────────────────────────────────────────────────────

/// Commonly used types.
///
/// Import with:
/// ```rust
/// use minigpu::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Buffer,
        ComputeShader,
        Context,
        ContextConfig,
        GpuResult,
        LogicalType,
        PackingStrategy,
    };
}
