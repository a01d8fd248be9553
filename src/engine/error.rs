//! Error types for buffers, conversion kernels, shaders and the device thread.
//!
//! This module declares focused, composable error types used across the
//! buffer, codec, shader and executor layers. Each error carries enough
//! context to make a failure actionable from a log line alone, while staying
//! small and cheap to pass around or convert into the aggregate [`GpuError`].
//!
//! ## Goals
//! * **Specificity:** each type models one failure family (bounds violations,
//!   undersized allocations, tag mismatches, unsafe dispatch sizes, device
//!   refusals, a closed device thread).
//! * **Ergonomics:** every type implements [`std::error::Error`] and
//!   `Display`, and converts into [`GpuError`] via `From`, so `?` composes.
//! * **Actionability:** structured fields (requested vs. available sizes,
//!   offending slot, expected vs. actual layouts) make logs useful without
//!   reproducing the issue.
//!
//! ## Typical flow
//! Validation runs before any device call and returns one of the small error
//! types. Orchestration code bubbles it into [`GpuError`]. At the C boundary
//! every `Err` is logged and the call degrades to a no-op or a null handle.
//!
//! ```ignore
//! match buffer.read::<i8>(1000, 900) {
//!     Ok(values) => { /* at most `length - 900` values */ }
//!     Err(GpuError::Bounds(e)) => log::error!("{e}"),
//!     Err(other) => log::error!("read failed: {other}"),
//! }
//! ```
//!
//! ## Display vs. Debug
//! * `Display` is tuned for operator logs (short, lower-case phrasing).
//! * `Debug` (derived) keeps the full structure for diagnostics.

use std::borrow::Cow;

use thiserror::Error;

use crate::engine::types::{LogicalType, WordLayout};


/// Returned when a read offset lies at or beyond the logical length of a
/// buffer.
///
/// Over-long counts are clamped rather than rejected; only an offset that
/// leaves nothing to read is an error.
///
/// ### Fields
/// * `offset` - requested starting element.
/// * `length` - logical element count of the buffer.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("offset {offset} out of bounds for buffer of length {length}")]
pub struct BoundsError {

    /// Requested starting element.
    pub offset: usize,

    /// Logical element count of the buffer.
    pub length: usize,
}

/// Returned when a clamped logical range still maps outside the physical
/// allocation.
///
/// This is the second half of the read/write bounds contract: the logical
/// range is clamped first, then the byte span it touches is re-checked against
/// the real allocation size before any copy is encoded.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("byte range {start}..{end} exceeds physical size {physical_bytes}")]
pub struct PhysicalRangeError {

    /// First byte the operation would touch.
    pub start: u64,

    /// One past the last byte the operation would touch.
    pub end: u64,

    /// Size of the device allocation in bytes.
    pub physical_bytes: u64,
}

/// Returned when a typed read or write targets a buffer holding a different
/// logical type.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("type mismatch (expected {expected}, found {actual})")]
pub struct TypeMismatchError {

    /// Logical type the operation was compiled for.
    pub expected: LogicalType,

    /// Logical type the buffer currently holds.
    pub actual: LogicalType,
}

/// Returned when an allocation is smaller than an operation requires.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{what} needs {required} bytes; allocation holds {available}")]
pub struct CapacityError {

    /// Operand that was too small.
    pub what: &'static str,

    /// Bytes the operation needs.
    pub required: u64,

    /// Bytes actually allocated.
    pub available: u64,
}

/// Pre-submission rejections of a compute dispatch.
///
/// Every variant is produced before the device is touched; a rejected
/// dispatch never reaches the queue.

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {

    /// One of the group counts was zero.
    #[error("group counts must be non-zero (got {x}x{y}x{z})")]
    ZeroGroups {
        /// Groups along x.
        x: u32,
        /// Groups along y.
        y: u32,
        /// Groups along z.
        z: u32,
    },

    /// A single dimension exceeded the per-dimension ceiling.
    #[error("{groups} groups along {axis} exceeds per-dimension limit {limit}")]
    DimensionLimit {
        /// Axis name (`x`, `y` or `z`).
        axis: char,
        /// Requested groups along the axis.
        groups: u32,
        /// Configured ceiling.
        limit: u32,
    },

    /// The product of the group counts exceeded the total ceiling.
    #[error("{total} total groups exceeds limit {limit}")]
    TotalLimit {
        /// Product of the three group counts.
        total: u64,
        /// Configured ceiling.
        limit: u64,
    },

    /// No shader source has been loaded.
    #[error("no shader source loaded")]
    MissingSource,

    /// The buffer bound at `slot` has been dropped.
    #[error("buffer bound at slot {slot} has been released")]
    StaleBinding {
        /// Binding slot.
        slot: u32,
    },

    /// The buffer bound at `slot` holds no device allocation.
    #[error("buffer bound at slot {slot} has no device allocation")]
    UnallocatedBinding {
        /// Binding slot.
        slot: u32,
    },

    /// A binding request named a slot that cannot exist.
    #[error("invalid binding slot {slot}")]
    InvalidSlot {
        /// Requested slot.
        slot: i64,
    },

    /// The buffer belongs to a different context than the shader.
    #[error("buffer for slot {slot} belongs to another context")]
    ForeignBuffer {
        /// Binding slot.
        slot: u32,
    },

    /// The shader source was empty.
    #[error("shader source is empty")]
    EmptySource,
}

/// Returned when a conversion kernel's operands do not match what the kernel
/// expects.
///
/// Raised before the kernel is dispatched; undersized or mislabelled operands
/// are never bound.

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {

    /// An operand carries the wrong word layout tag.
    #[error("{kernel}: {operand} is {actual:?}, expected {expected:?}")]
    LayoutMismatch {
        /// Kernel name.
        kernel: &'static str,
        /// `source` or `destination`.
        operand: &'static str,
        /// Layout the kernel requires.
        expected: WordLayout,
        /// Layout the operand carries.
        actual: WordLayout,
    },

    /// Source and destination logical lengths differ.
    #[error("{kernel}: source holds {source_len} elements, destination {destination_len}")]
    LengthMismatch {
        /// Kernel name.
        kernel: &'static str,
        /// Logical length of the source.
        source_len: usize,
        /// Logical length of the destination.
        destination_len: usize,
    },

    /// An operand's allocation is smaller than its computed word count.
    #[error("{kernel}: {capacity}")]
    Undersized {
        /// Kernel name.
        kernel: &'static str,
        /// Size details.
        #[source]
        capacity: CapacityError,
    },

    /// An operand's bound range exceeds the device's storage binding limit.
    #[error("{kernel}: {operand} binding of {bytes} bytes exceeds limit {limit}")]
    BindingTooLarge {
        /// Kernel name.
        kernel: &'static str,
        /// `source` or `destination`.
        operand: &'static str,
        /// Size of the bound range.
        bytes: u64,
        /// Largest storage binding the device accepts.
        limit: u64,
    },
}

/// Failures reported by the device or the graphics backend.

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {

    /// No adapter or device could be created.
    #[error("device initialization failed: {message}")]
    InitFailed {
        /// Backend description of the failure.
        message: Cow<'static, str>,
    },

    /// The device refused an allocation.
    #[error("allocation of {bytes} bytes failed: {message}")]
    AllocationFailed {
        /// Requested size.
        bytes: u64,
        /// Backend description of the failure.
        message: Cow<'static, str>,
    },

    /// Module, layout or pipeline creation failed.
    #[error("{stage} creation failed: {message}")]
    ShaderCompilation {
        /// Build stage that failed.
        stage: &'static str,
        /// Backend description of the failure.
        message: Cow<'static, str>,
    },

    /// Command submission was rejected by validation.
    #[error("submission rejected: {message}")]
    SubmissionFailed {
        /// Backend description of the failure.
        message: Cow<'static, str>,
    },

    /// Mapping a readback buffer failed.
    #[error("buffer map failed: {message}")]
    MapFailed {
        /// Backend description of the failure.
        message: Cow<'static, str>,
    },

    /// Waiting on the device failed or timed out.
    #[error("device poll failed: {message}")]
    PollFailed {
        /// Backend description of the failure.
        message: Cow<'static, str>,
    },
}

/// Failures of the device thread itself.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecutorError {

    /// The context has been destroyed; no further work is accepted.
    #[error("device thread has shut down")]
    ShutDown,

    /// A queued task was dropped before producing a result.
    #[error("queued task was dropped before completion")]
    TaskDropped,

    /// A blocking call was made from the device thread itself.
    #[error("blocking call issued from the device thread")]
    Reentrant,

    /// The operating system refused to start the device thread.
    #[error("failed to spawn device thread")]
    SpawnFailed,

    /// A bookkeeping lock was poisoned by a panic.
    #[error("lock poisoned: {what}")]
    LockPoisoned {
        /// Name of the guarded state.
        what: &'static str,
    },
}

/// Aggregate error returned by every fallible operation in the crate.

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuError {

    /// See [`BoundsError`].
    #[error(transparent)]
    Bounds(#[from] BoundsError),

    /// See [`PhysicalRangeError`].
    #[error(transparent)]
    PhysicalRange(#[from] PhysicalRangeError),

    /// See [`TypeMismatchError`].
    #[error(transparent)]
    TypeMismatch(#[from] TypeMismatchError),

    /// See [`CapacityError`]. Raised when a buffer would outgrow the
    /// device's largest allocation.
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    /// A transfer reached a buffer that holds no device allocation.
    #[error("buffer has no device allocation")]
    Unallocated,

    /// See [`DispatchError`].
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// See [`KernelError`].
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// See [`DeviceError`].
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// See [`ExecutorError`].
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// A raw pointer or handle argument was null.
    #[error("null {what} handle")]
    NullHandle {
        /// Kind of handle.
        what: &'static str,
    },

    /// Reading a shader file failed.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that was read.
        path: String,
        /// OS error description.
        message: String,
    },
}

/// Convenience alias for results produced by this crate.
pub type GpuResult<T> = Result<T, GpuError>;
