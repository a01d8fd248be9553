//! # C Boundary
//!
//! `extern "C"` entry points for hosts that drive `minigpu` through a
//! foreign-function interface.
//!
//! ## Handles
//!
//! Contexts, buffers and shaders cross the boundary as opaque pointers to
//! boxed Rust values ([`MgpuContext`], [`MgpuBuffer`], [`MgpuComputeShader`]).
//! Each `mgpu_create_*` / `mgpu_initialize_*` call hands ownership to the
//! caller, and the matching `mgpu_destroy_*` call takes it back. Buffers and
//! shaders keep their context alive internally, so destruction order between
//! handle kinds does not matter.
//!
//! ## Failure behavior
//!
//! No error value crosses the boundary. Every failure is logged through the
//! `log` facade and the call degrades to a no-op, a null handle, or `0`.
//! Panics are caught at each entry point. Completion callbacks take no
//! arguments, so a failed asynchronous operation is visible only in the log.
//!
//! ## Typed transfers
//!
//! Each scalar type gets its own `mgpu_write_*`, `mgpu_read_sync_*` and
//! `mgpu_read_async_*` function; counts and offsets are in elements.

use std::ffi::{c_char, c_int, CStr};
use std::panic::{self, AssertUnwindSafe};

use crate::engine::error::{DispatchError, GpuError};
use crate::engine::types::{Element, LogicalType};
use crate::gpu::{Buffer, ComputeShader, Context, ContextConfig};


/// Zero-argument completion notification.
pub type MgpuCallback = Option<unsafe extern "C" fn()>;

/// Opaque context handle.
pub struct MgpuContext(Context);

/// Opaque buffer handle.
pub struct MgpuBuffer(Buffer);

/// Opaque compute shader handle.
pub struct MgpuComputeShader(ComputeShader);

/// Caller-owned output memory written from the device thread.
struct OutPtr<T>(*mut T);

// SAFETY: the caller keeps the memory valid and untouched until the
// completion callback fires.
unsafe impl<T: Send> Send for OutPtr<T> {}

impl<T> OutPtr<T> {
    fn get(&self) -> *mut T {
        self.0
    }
}

fn guard<R>(operation: &str, fallback: R, f: impl FnOnce() -> R) -> R {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            log::error!("{operation}: panic caught at the C boundary");
            fallback
        }
    }
}

fn report(operation: &str, error: impl Into<GpuError>) {
    log::error!("{operation}: {}", error.into());
}

fn notify(callback: MgpuCallback) {
    if let Some(callback) = callback {
        // SAFETY: the host supplied a valid function pointer.
        unsafe { callback() }
    }
}

fn group_count(value: c_int) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn into_handle<T>(value: T) -> *mut T {
    Box::into_raw(Box::new(value))
}

/// Drops a handle previously returned by this module.
///
/// # Safety
/// `handle` must be null or a live pointer from `into_handle`.
unsafe fn destroy_handle<T>(handle: *mut T) {
    if !handle.is_null() {
        // SAFETY: forwarded caller contract.
        drop(unsafe { Box::from_raw(handle) });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────────────────────────

/// Creates a context with default configuration and waits for the device.
///
/// Returns null if no device could be initialized.
#[no_mangle]
pub extern "C" fn mgpu_initialize_context() -> *mut MgpuContext {
    guard("initialize context", std::ptr::null_mut(), || {
        match Context::new(ContextConfig::default()) {
            Ok(context) => into_handle(MgpuContext(context)),
            Err(e) => {
                report("initialize context", e);
                std::ptr::null_mut()
            }
        }
    })
}

/// Creates a context without waiting; `callback` fires on the device thread
/// once initialization has finished, successfully or not.
#[no_mangle]
pub extern "C" fn mgpu_initialize_context_async(callback: MgpuCallback) -> *mut MgpuContext {
    guard("initialize context", std::ptr::null_mut(), || {
        let created = Context::new_async(ContextConfig::default(), move |result| {
            if let Err(e) = result {
                report("initialize context", e);
            }
            notify(callback);
        });
        match created {
            Ok(context) => into_handle(MgpuContext(context)),
            Err(e) => {
                report("initialize context", e);
                notify(callback);
                std::ptr::null_mut()
            }
        }
    })
}

/// Stops the device thread and frees the handle.
///
/// # Safety
/// `context` must be null or a handle from `mgpu_initialize_context*` that
/// has not been destroyed.
#[no_mangle]
pub unsafe extern "C" fn mgpu_destroy_context(context: *mut MgpuContext) {
    guard("destroy context", (), || {
        // SAFETY: forwarded caller contract.
        if let Some(handle) = unsafe { context.as_ref() } {
            handle.0.destroy();
        }
        // SAFETY: forwarded caller contract.
        unsafe { destroy_handle(context) }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Buffers
// ─────────────────────────────────────────────────────────────────────────────

/// Creates a buffer of `length` elements of the type named by `data_type`.
///
/// Unknown type codes fall back to float32. Returns null on a null context,
/// a negative length, or allocation failure.
///
/// # Safety
/// `context` must be null or a live context handle.
#[no_mangle]
pub unsafe extern "C" fn mgpu_create_buffer(
    context: *mut MgpuContext,
    length: c_int,
    data_type: c_int,
) -> *mut MgpuBuffer {
    guard("create buffer", std::ptr::null_mut(), || {
        // SAFETY: forwarded caller contract.
        let Some(context) = (unsafe { context.as_ref() }) else {
            report("create buffer", GpuError::NullHandle { what: "context" });
            return std::ptr::null_mut();
        };
        let Ok(length) = usize::try_from(length) else {
            log::error!("create buffer: negative length {length}");
            return std::ptr::null_mut();
        };
        match Buffer::create(&context.0, length, LogicalType::from_code(data_type)) {
            Ok(buffer) => into_handle(MgpuBuffer(buffer)),
            Err(e) => {
                report("create buffer", e);
                std::ptr::null_mut()
            }
        }
    })
}

/// Releases the buffer's device memory and frees the handle.
///
/// # Safety
/// `buffer` must be null or a live buffer handle.
#[no_mangle]
pub unsafe extern "C" fn mgpu_destroy_buffer(buffer: *mut MgpuBuffer) {
    // SAFETY: forwarded caller contract.
    guard("destroy buffer", (), || unsafe { destroy_handle(buffer) })
}

/// # Safety
/// `buffer` must be null or live; `data` must be null or point to `count`
/// readable elements.
unsafe fn write_elements<T: Element>(buffer: *mut MgpuBuffer, data: *const T, count: usize) {
    guard("write", (), || {
        // SAFETY: forwarded caller contract.
        let Some(buffer) = (unsafe { buffer.as_ref() }) else {
            return report("write", GpuError::NullHandle { what: "buffer" });
        };
        let values: &[T] = if count == 0 {
            &[]
        } else if data.is_null() {
            return report("write", GpuError::NullHandle { what: "input data" });
        } else {
            // SAFETY: forwarded caller contract.
            unsafe { std::slice::from_raw_parts(data, count) }
        };
        // Failures are logged by the buffer.
        let _ = buffer.0.write(values);
    })
}

/// # Safety
/// `buffer` must be null or live; `out` must be null or point to `count`
/// writable elements.
unsafe fn read_sync_elements<T: Element>(buffer: *mut MgpuBuffer, out: *mut T, count: usize, offset: usize) {
    guard("read", (), || {
        // SAFETY: forwarded caller contract.
        let Some(buffer) = (unsafe { buffer.as_ref() }) else {
            return report("read", GpuError::NullHandle { what: "buffer" });
        };
        if out.is_null() {
            return report("read", GpuError::NullHandle { what: "output data" });
        }
        if let Ok(values) = buffer.0.read::<T>(count, offset) {
            // SAFETY: `values.len() <= count` and `out` holds `count` elements.
            unsafe { std::ptr::copy_nonoverlapping(values.as_ptr(), out, values.len()) }
        }
    })
}

/// # Safety
/// As [`read_sync_elements`]; additionally `out` must stay valid until
/// `callback` fires.
unsafe fn read_async_elements<T: Element>(
    buffer: *mut MgpuBuffer,
    out: *mut T,
    count: usize,
    offset: usize,
    callback: MgpuCallback,
) {
    guard("read", (), || {
        // SAFETY: forwarded caller contract.
        let Some(buffer) = (unsafe { buffer.as_ref() }) else {
            report("read", GpuError::NullHandle { what: "buffer" });
            return notify(callback);
        };
        if out.is_null() {
            report("read", GpuError::NullHandle { what: "output data" });
            return notify(callback);
        }
        let out = OutPtr(out);
        buffer.0.read_async::<T>(count, offset, move |result| {
            if let Ok(values) = result {
                // SAFETY: `values.len() <= count`; the caller keeps `out`
                // valid until the callback below.
                unsafe { std::ptr::copy_nonoverlapping(values.as_ptr(), out.get(), values.len()) }
            }
            notify(callback);
        });
    })
}

macro_rules! typed_transfers {
    ($t:ty, $name:literal, $write:ident, $read_sync:ident, $read_async:ident) => {
        #[doc = concat!("Writes `count` ", $name, " values as the buffer's contents.")]
        ///
        /// # Safety
        /// `buffer` must be null or live; `data` must point to `count` elements.
        #[no_mangle]
        pub unsafe extern "C" fn $write(buffer: *mut MgpuBuffer, data: *const $t, count: usize) {
            // SAFETY: forwarded caller contract.
            unsafe { write_elements(buffer, data, count) }
        }

        #[doc = concat!("Reads up to `count` ", $name, " values from `offset` into `out`.")]
        ///
        /// # Safety
        /// `buffer` must be null or live; `out` must hold `count` elements.
        #[no_mangle]
        pub unsafe extern "C" fn $read_sync(
            buffer: *mut MgpuBuffer,
            out: *mut $t,
            count: usize,
            offset: usize,
        ) {
            // SAFETY: forwarded caller contract.
            unsafe { read_sync_elements(buffer, out, count, offset) }
        }

        #[doc = concat!("Reads up to `count` ", $name, " values without blocking.")]
        ///
        /// `callback` fires once `out` has been filled, or once the read has
        /// failed.
        ///
        /// # Safety
        /// As the blocking read; `out` must stay valid until `callback` fires.
        #[no_mangle]
        pub unsafe extern "C" fn $read_async(
            buffer: *mut MgpuBuffer,
            out: *mut $t,
            count: usize,
            offset: usize,
            callback: MgpuCallback,
        ) {
            // SAFETY: forwarded caller contract.
            unsafe { read_async_elements(buffer, out, count, offset, callback) }
        }
    };
}

typed_transfers!(i8, "int8", mgpu_write_int8, mgpu_read_sync_int8, mgpu_read_async_int8);
typed_transfers!(u8, "uint8", mgpu_write_uint8, mgpu_read_sync_uint8, mgpu_read_async_uint8);
typed_transfers!(i16, "int16", mgpu_write_int16, mgpu_read_sync_int16, mgpu_read_async_int16);
typed_transfers!(u16, "uint16", mgpu_write_uint16, mgpu_read_sync_uint16, mgpu_read_async_uint16);
typed_transfers!(i32, "int32", mgpu_write_int32, mgpu_read_sync_int32, mgpu_read_async_int32);
typed_transfers!(u32, "uint32", mgpu_write_uint32, mgpu_read_sync_uint32, mgpu_read_async_uint32);
typed_transfers!(i64, "int64", mgpu_write_int64, mgpu_read_sync_int64, mgpu_read_async_int64);
typed_transfers!(u64, "uint64", mgpu_write_uint64, mgpu_read_sync_uint64, mgpu_read_async_uint64);
typed_transfers!(f32, "float32", mgpu_write_float32, mgpu_read_sync_float32, mgpu_read_async_float32);
typed_transfers!(f64, "float64", mgpu_write_float64, mgpu_read_sync_float64, mgpu_read_async_float64);

// ─────────────────────────────────────────────────────────────────────────────
// Compute shaders
// ─────────────────────────────────────────────────────────────────────────────

/// Creates an empty compute shader.
///
/// # Safety
/// `context` must be null or a live context handle.
#[no_mangle]
pub unsafe extern "C" fn mgpu_create_compute_shader(context: *mut MgpuContext) -> *mut MgpuComputeShader {
    guard("create shader", std::ptr::null_mut(), || {
        // SAFETY: forwarded caller contract.
        match unsafe { context.as_ref() } {
            Some(context) => into_handle(MgpuComputeShader(ComputeShader::new(&context.0))),
            None => {
                report("create shader", GpuError::NullHandle { what: "context" });
                std::ptr::null_mut()
            }
        }
    })
}

/// Frees the shader; its device objects are released on the device thread.
///
/// # Safety
/// `shader` must be null or a live shader handle.
#[no_mangle]
pub unsafe extern "C" fn mgpu_destroy_compute_shader(shader: *mut MgpuComputeShader) {
    // SAFETY: forwarded caller contract.
    guard("destroy shader", (), || unsafe { destroy_handle(shader) })
}

/// Loads WGSL source from a NUL-terminated UTF-8 string.
///
/// # Safety
/// `shader` must be null or live; `source` must be null or a valid C string.
#[no_mangle]
pub unsafe extern "C" fn mgpu_load_kernel(shader: *mut MgpuComputeShader, source: *const c_char) {
    guard("load kernel", (), || {
        // SAFETY: forwarded caller contract.
        let Some(shader) = (unsafe { shader.as_ref() }) else {
            return report("load kernel", GpuError::NullHandle { what: "shader" });
        };
        if source.is_null() {
            return report("load kernel", DispatchError::EmptySource);
        }
        // SAFETY: forwarded caller contract.
        let text = unsafe { CStr::from_ptr(source) };
        match text.to_str() {
            Ok(text) => {
                if let Err(e) = shader.0.load_source(text) {
                    report("load kernel", e);
                }
            }
            Err(e) => log::error!("load kernel: source is not UTF-8 ({e})"),
        }
    })
}

/// Returns `1` if the shader has source loaded, `0` otherwise.
///
/// # Safety
/// `shader` must be null or a live shader handle.
#[no_mangle]
pub unsafe extern "C" fn mgpu_has_kernel(shader: *mut MgpuComputeShader) -> c_int {
    guard("has kernel", 0, || {
        // SAFETY: forwarded caller contract.
        unsafe { shader.as_ref() }.map_or(0, |shader| c_int::from(shader.0.has_source()))
    })
}

/// Binds `buffer` at slot `tag`.
///
/// # Safety
/// `shader` and `buffer` must each be null or live.
#[no_mangle]
pub unsafe extern "C" fn mgpu_set_buffer(shader: *mut MgpuComputeShader, tag: c_int, buffer: *mut MgpuBuffer) {
    guard("set buffer", (), || {
        // SAFETY: forwarded caller contract.
        let Some(shader) = (unsafe { shader.as_ref() }) else {
            return report("set buffer", GpuError::NullHandle { what: "shader" });
        };
        // SAFETY: forwarded caller contract.
        let Some(buffer) = (unsafe { buffer.as_ref() }) else {
            return report("set buffer", GpuError::NullHandle { what: "buffer" });
        };
        let Ok(slot) = u32::try_from(tag) else {
            return report("set buffer", DispatchError::InvalidSlot { slot: i64::from(tag) });
        };
        if let Err(e) = shader.0.set_binding(slot, &buffer.0) {
            report("set buffer", e);
        }
    })
}

/// Runs the shader and returns once the work has been submitted.
///
/// Negative group counts are treated as zero and rejected.
///
/// # Safety
/// `shader` must be null or a live shader handle.
#[no_mangle]
pub unsafe extern "C" fn mgpu_dispatch(shader: *mut MgpuComputeShader, groups_x: c_int, groups_y: c_int, groups_z: c_int) {
    guard("dispatch", (), || {
        // SAFETY: forwarded caller contract.
        let Some(shader) = (unsafe { shader.as_ref() }) else {
            return report("dispatch", GpuError::NullHandle { what: "shader" });
        };
        // Failures are logged by the shader.
        let _ = shader.0.dispatch(group_count(groups_x), group_count(groups_y), group_count(groups_z));
    })
}

/// Queues a dispatch; `callback` fires once it has been submitted or
/// rejected.
///
/// # Safety
/// `shader` must be null or a live shader handle.
#[no_mangle]
pub unsafe extern "C" fn mgpu_dispatch_async(
    shader: *mut MgpuComputeShader,
    groups_x: c_int,
    groups_y: c_int,
    groups_z: c_int,
    callback: MgpuCallback,
) {
    guard("dispatch", (), || {
        // SAFETY: forwarded caller contract.
        let Some(shader) = (unsafe { shader.as_ref() }) else {
            report("dispatch", GpuError::NullHandle { what: "shader" });
            return notify(callback);
        };
        shader.0.dispatch_async(
            group_count(groups_x),
            group_count(groups_y),
            group_count(groups_z),
            move |_| notify(callback),
        );
    })
}
