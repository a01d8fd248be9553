//! # Device Buffers
//!
//! A [`Buffer`] is a typed, logically-sized array backed by one device
//! allocation. Its storage is always in the packed layout of its
//! [`LogicalType`]; host data is converted on the way in and out.
//!
//! ## Transfers
//!
//! | type kind      | [`PackingStrategy::Device`]           | [`PackingStrategy::Host`]        |
//! |----------------|---------------------------------------|----------------------------------|
//! | native (32-bit)| direct copy                           | direct copy                      |
//! | narrow, wide   | stage lanes, convert with a kernel    | pack on the CPU, copy words      |
//!
//! ## Bounds contract
//!
//! Every read clamps `(offset, count)` against the logical length first
//! (offset past the end is rejected, an over-long count shortened), then
//! re-checks the word span the range maps to against the allocation size
//! before any copy is recorded. Writes check the packed size of the data
//! against the allocation the same way.
//!
//! Device-side conversions touch only the words a transfer needs. Reads
//! unpack the requested span (widened to the nearest aligned run), and both
//! directions are split into runs that fit the device's storage binding
//! limit.
//!
//! ## Concurrency
//!
//! Device work for a buffer runs on the context's device thread. The small
//! bookkeeping state (allocation, length, type) sits behind a mutex that
//! callers lock only briefly and never across a blocking device call.
//! Shaders hold weak references for their bindings and lock a buffer only
//! after their own state, never the other way round.

use std::sync::{mpsc, Arc, Mutex, MutexGuard, Weak};

use wgpu::util::DeviceExt;

use crate::engine::codec::{self, ReadRange};
use crate::engine::error::{
    CapacityError, DeviceError, ExecutorError, GpuError, GpuResult, TypeMismatchError,
};
use crate::engine::types::{
    AllocationId, Element, LogicalType, PackKind, WordLayout, MIN_BUFFER_BYTES, WORD_BYTES,
};
use crate::gpu::config::PackingStrategy;
use crate::gpu::context::{Context, GPUContext};
use crate::gpu::executor::{Completion, Runtime, TransferLimits};
use crate::gpu::kernels::{self, ConversionKernel, Operand, OperandTag};


/// One device allocation and its identity.
#[derive(Debug)]
pub(crate) struct Allocation {
    pub id: AllocationId,
    pub buffer: wgpu::Buffer,
    pub size: u64,
}

/// Bookkeeping shared between a buffer, its queued tasks and the shaders it
/// is bound to.
#[derive(Debug)]
pub(crate) struct BufferState {
    pub allocation: Option<Allocation>,
    pub length: usize,
    pub logical: LogicalType,
    pub packed: bool,
}

impl BufferState {
    fn empty() -> Self {
        Self { allocation: None, length: 0, logical: LogicalType::Float32, packed: false }
    }

    fn physical_bytes(&self) -> u64 {
        self.allocation.as_ref().map_or(0, |a| a.size)
    }

    fn take_allocation(&mut self) -> Option<Allocation> {
        self.length = 0;
        self.allocation.take()
    }
}

#[derive(Debug)]
pub(crate) struct BufferShared {
    state: Mutex<BufferState>,
}

impl BufferShared {
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, BufferState>, ExecutorError> {
        self.state
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned { what: "buffer state" })
    }
}

/// A typed array in device memory.
///
/// ## Ownership
/// A `Buffer` uniquely owns its device allocation. Dropping it (or calling
/// [`release`](Buffer::release)) queues the allocation's destruction on the
/// device thread. Moving a `Buffer` moves ownership; there is no shared
/// aliasing of the allocation between buffers.

pub struct Buffer {
    context: Context,
    shared: Arc<BufferShared>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = f.debug_struct("Buffer");
        match self.shared.lock() {
            Ok(state) => out
                .field("logical", &state.logical)
                .field("length", &state.length)
                .field("physical_bytes", &state.physical_bytes())
                .finish(),
            Err(_) => out.finish_non_exhaustive(),
        }
    }
}

impl Buffer {

    /// Creates an empty buffer with no allocation.
    pub fn new(context: &Context) -> Self {
        Self {
            context: context.clone(),
            shared: Arc::new(BufferShared { state: Mutex::new(BufferState::empty()) }),
        }
    }

    /// Creates a buffer holding `length` elements of `ty`.
    ///
    /// ## Errors
    /// See [`allocate`](Buffer::allocate).
    pub fn create(context: &Context, length: usize, ty: LogicalType) -> GpuResult<Self> {
        let buffer = Self::new(context);
        buffer.allocate(length, ty)?;
        Ok(buffer)
    }

    /// Replaces the allocation with a fresh one sized for `length` elements
    /// of `ty`.
    ///
    /// The old allocation is released first. Sizes are rounded up to whole
    /// words, with a minimum of one word.
    ///
    /// ## Errors
    /// [`CapacityError`] if the size exceeds the device's largest buffer, or
    /// [`DeviceError::AllocationFailed`] if the device refuses. Either way the
    /// buffer is left empty.

    pub fn allocate(&self, length: usize, ty: LogicalType) -> GpuResult<()> {
        let shared = Arc::clone(&self.shared);
        self.context.run_blocking(move |runtime| {
            let mut state = shared.lock()?;
            if let Some(old) = state.take_allocation() {
                old.buffer.destroy();
            }
            ensure_capacity_on(runtime, &mut state, ty.physical_bytes(length), ty, length, ty.is_packed())
                .map(|_| ())
        })
    }

    /// Makes sure the allocation holds at least `required_bytes` for
    /// `length` elements of `ty`, reusing the current one when it is large
    /// enough and has the same type and pack state.
    ///
    /// Returns `true` if a new allocation was made.
    ///
    /// ## Errors
    /// * [`CapacityError`] if `required_bytes` exceeds the device's largest
    ///   buffer; the current allocation is kept.
    /// * [`DeviceError::AllocationFailed`] if the device refuses.

    pub fn ensure_capacity(
        &self,
        required_bytes: u64,
        ty: LogicalType,
        length: usize,
        packed: bool,
    ) -> GpuResult<bool> {
        let shared = Arc::clone(&self.shared);
        self.context.run_blocking(move |runtime| {
            let mut state = shared.lock()?;
            ensure_capacity_on(runtime, &mut state, required_bytes, ty, length, packed)
        })
    }

    /// Writes `data` as the buffer's full contents.
    ///
    /// The buffer takes `T`'s logical type and `data.len()` as its length,
    /// growing its allocation if needed. Blocks until the upload has been
    /// submitted to the device.

    pub fn write<T: Element>(&self, data: &[T]) -> GpuResult<()> {
        let ty = T::LOGICAL;
        let bytes: Vec<u8> = bytemuck::cast_slice(data).to_vec();
        let length = data.len();
        let shared = Arc::clone(&self.shared);

        self.context
            .run_blocking(move |runtime| {
                let mut state = shared.lock()?;
                write_on(runtime, &mut state, ty, &bytes, length)
            })
            .inspect_err(|e| log::error!("write of {length} {ty} elements failed: {e}"))
    }

    /// Reads up to `count` elements starting at `offset`.
    ///
    /// `count` is clamped to what remains after `offset`.
    ///
    /// ## Errors
    /// * [`TypeMismatchError`] if the buffer does not hold `T`.
    /// * [`BoundsError`](crate::engine::error::BoundsError) if `offset` is at or past the end.
    /// * [`PhysicalRangeError`](crate::engine::error::PhysicalRangeError) if the
    ///   range does not fit the allocation.

    pub fn read<T: Element>(&self, count: usize, offset: usize) -> GpuResult<Vec<T>> {
        let shared = Arc::clone(&self.shared);
        self.context
            .run_blocking(move |runtime| {
                let state = shared.lock()?;
                read_on(runtime, &state, T::LOGICAL, offset, count)
            })
            .map(|readback| readback.decode::<T>())
            .inspect_err(|e| log::error!("read of {count} {} elements at {offset} failed: {e}", T::LOGICAL))
    }

    /// Reads into `out` starting at `offset`; returns the number of elements
    /// written, which is less than `out.len()` when the buffer ends first.
    pub fn read_into<T: Element>(&self, out: &mut [T], offset: usize) -> GpuResult<usize> {
        let values = self.read::<T>(out.len(), offset)?;
        out[..values.len()].copy_from_slice(&values);
        Ok(values.len())
    }

    /// Reads without blocking; `callback` receives the elements on the device
    /// thread.
    ///
    /// The callback always runs exactly once, with an error if the read was
    /// rejected or the context was destroyed before it ran.

    pub fn read_async<T: Element>(
        &self,
        count: usize,
        offset: usize,
        callback: impl FnOnce(GpuResult<Vec<T>>) + Send + 'static,
    ) {
        let completion = Completion::new(callback);
        let shared = Arc::clone(&self.shared);
        let submitted = self.context.submit(move |runtime| {
            let result = shared
                .lock()
                .map_err(GpuError::from)
                .and_then(|state| read_on(runtime, &state, T::LOGICAL, offset, count))
                .map(|readback| readback.decode::<T>());
            if let Err(e) = &result {
                log::error!("async read at {offset} failed: {e}");
            }
            completion.complete(result);
        });
        if let Err(e) = submitted {
            log::error!("async read not queued: {e}");
        }
    }

    /// Queues destruction of the allocation and empties the buffer.
    ///
    /// Idempotent. The buffer can be written again afterwards.
    pub fn release(&self) {
        let allocation = match self.shared.state.lock() {
            Ok(mut state) => state.take_allocation(),
            Err(poisoned) => {
                log::warn!("releasing a buffer whose state was poisoned");
                poisoned.into_inner().take_allocation()
            }
        };
        if let Some(allocation) = allocation {
            log::debug!("releasing {} ({} bytes)", allocation.id, allocation.size);
            let queued = self.context.submit(move |_| allocation.buffer.destroy());
            if queued.is_err() {
                log::debug!("device thread gone; allocation dropped in place");
            }
        }
    }

    /// Logical element count.
    pub fn len(&self) -> usize {
        self.shared.lock().map_or(0, |s| s.length)
    }

    /// `true` when the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current logical type.
    pub fn logical_type(&self) -> LogicalType {
        self.shared.lock().map_or(LogicalType::Float32, |s| s.logical)
    }

    /// `true` when storage is in a packed layout.
    pub fn is_packed(&self) -> bool {
        self.shared.lock().is_ok_and(|s| s.packed)
    }

    /// Allocation size in bytes, `0` when unallocated.
    pub fn physical_bytes(&self) -> u64 {
        self.shared.lock().map_or(0, |s| s.physical_bytes())
    }

    /// Identity of the current allocation.
    pub fn allocation_id(&self) -> Option<AllocationId> {
        self.shared.lock().ok().and_then(|s| s.allocation.as_ref().map(|a| a.id))
    }

    /// Context this buffer belongs to.
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub(crate) fn downgrade(&self) -> Weak<BufferShared> {
        Arc::downgrade(&self.shared)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.release();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device-thread operations
// ─────────────────────────────────────────────────────────────────────────────

fn allocate_on(context: &GPUContext, bytes: u64, usage: wgpu::BufferUsages, label: &str) -> GpuResult<wgpu::Buffer> {
    let size = bytes.div_ceil(WORD_BYTES).max(1) * WORD_BYTES;
    let buffer = context
        .capture(|| {
            context.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        })
        .map_err(|message| DeviceError::AllocationFailed { bytes: size, message: message.into() })?;
    Ok(buffer)
}

fn ensure_capacity_on(
    runtime: &Runtime,
    state: &mut BufferState,
    required_bytes: u64,
    ty: LogicalType,
    length: usize,
    packed: bool,
) -> GpuResult<bool> {
    let required = required_bytes.max(MIN_BUFFER_BYTES);
    let max_buffer_bytes = runtime.transfer.max_buffer_bytes;
    if required > max_buffer_bytes {
        let error = CapacityError { what: "device buffer", required, available: max_buffer_bytes };
        log::error!("{error}");
        return Err(error.into());
    }

    let reusable = state.logical == ty
        && state.packed == packed
        && state.allocation.as_ref().is_some_and(|a| a.size >= required);
    if reusable {
        state.length = length;
        return Ok(false);
    }

    if let Some(old) = state.take_allocation() {
        log::debug!("replacing {} ({} bytes, {})", old.id, old.size, state.logical);
        old.buffer.destroy();
    }

    let label = runtime.context.label("buffer");
    let buffer = allocate_on(
        &runtime.context,
        required,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        &label,
    )
    .inspect_err(|e| log::error!("{e}"))?;

    let allocation = Allocation { id: AllocationId::next(), size: buffer.size(), buffer };
    log::debug!("allocated {} ({} bytes) for {length} {ty}", allocation.id, allocation.size);

    state.allocation = Some(allocation);
    state.length = length;
    state.logical = ty;
    state.packed = packed;
    Ok(true)
}

fn write_on(
    runtime: &mut Runtime,
    state: &mut BufferState,
    ty: LogicalType,
    bytes: &[u8],
    length: usize,
) -> GpuResult<()> {
    ensure_capacity_on(runtime, state, ty.physical_bytes(length), ty, length, ty.is_packed())?;
    if length == 0 {
        log::warn!("write of zero {ty} elements; nothing uploaded");
        return Ok(());
    }

    let allocation = state.allocation.as_ref().ok_or(GpuError::Unallocated)?;
    codec::physical_span(WordLayout::Packed(ty), ReadRange { offset: 0, count: length }, allocation.size)?;

    let kernel = match runtime.packing {
        PackingStrategy::Device => ConversionKernel::pack(ty),
        PackingStrategy::Host => None,
    };

    let Some(kernel) = kernel else {
        let context = &runtime.context;
        let words = codec::pack_words(ty, bytes);
        return context
            .capture(|| context.queue.write_buffer(&allocation.buffer, 0, bytemuck::cast_slice(&words)))
            .map_err(|message| DeviceError::SubmissionFailed { message: message.into() }.into());
    };

    let TransferLimits { max_binding_bytes, offset_alignment, .. } = runtime.transfer;
    let element_bytes = ty.size_bytes();
    let mut encoder = runtime.context.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("minigpu_upload_encoder"),
    });

    for chunk in kernels::split_conversion(ty, 0, length, max_binding_bytes, offset_alignment) {
        let host = &bytes[chunk.first * element_bytes..(chunk.first + chunk.count) * element_bytes];
        let lanes = codec::widen_lanes(ty, host);
        let context = &runtime.context;
        let staging = context
            .capture(|| {
                context.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("minigpu_upload_lanes"),
                    contents: bytemuck::cast_slice(&lanes),
                    usage: wgpu::BufferUsages::STORAGE,
                })
            })
            .map_err(|message| DeviceError::AllocationFailed {
                bytes: ty.lane_bytes(chunk.count),
                message: message.into(),
            })?;

        let packed_offset = ty.packed_words(chunk.first) as u64 * WORD_BYTES;
        let source = Operand {
            buffer: &staging,
            offset: 0,
            tag: OperandTag { layout: WordLayout::Lanes(ty), length: chunk.count, physical_bytes: staging.size() },
        };
        let destination = Operand {
            buffer: &allocation.buffer,
            offset: packed_offset,
            tag: OperandTag {
                layout: WordLayout::Packed(ty),
                length: chunk.count,
                physical_bytes: allocation.size.saturating_sub(packed_offset),
            },
        };
        kernels::encode_conversion(runtime, &mut encoder, kernel, source, destination)?;
    }

    let context = &runtime.context;
    context
        .capture(|| context.queue.submit(Some(encoder.finish())))
        .map_err(|message| DeviceError::SubmissionFailed { message: message.into() })?;
    Ok(())
}

/// Words copied back from the device, not yet decoded into host elements.
pub(crate) struct Readback {
    words: Vec<u32>,
    layout: WordLayout,
    first_lane: usize,
    count: usize,
}

impl Readback {
    fn empty(ty: LogicalType) -> Self {
        Self { words: Vec::new(), layout: WordLayout::Packed(ty), first_lane: 0, count: 0 }
    }

    fn decode<T: Element>(&self) -> Vec<T> {
        let mut out = vec![<T as bytemuck::Zeroable>::zeroed(); self.count];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut out);
        let written = match self.layout {
            WordLayout::Packed(ty) => codec::unpack_words(ty, &self.words, self.first_lane, bytes),
            WordLayout::Lanes(ty) => codec::narrow_lanes(ty, &self.words, bytes),
        };
        out.truncate(written);
        out
    }
}

fn read_on(
    runtime: &mut Runtime,
    state: &BufferState,
    expected: LogicalType,
    offset: usize,
    count: usize,
) -> GpuResult<Readback> {
    if state.logical != expected {
        return Err(TypeMismatchError { expected, actual: state.logical }.into());
    }
    let ty = state.logical;
    let range = codec::clamp_read_range(state.length, offset, count)?;
    if range.count == 0 {
        return Ok(Readback::empty(ty));
    }

    let allocation = state.allocation.as_ref().ok_or(GpuError::Unallocated)?;
    let packed_span = codec::physical_span(WordLayout::Packed(ty), range, allocation.size)?;

    let kernel = match (runtime.packing, ty.pack_kind()) {
        (PackingStrategy::Host, _) | (_, PackKind::Native) => None,
        (PackingStrategy::Device, _) => ConversionKernel::unpack(ty),
    };

    let label = runtime.context.label("readback");
    let mut encoder = runtime.context.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("minigpu_readback_encoder"),
    });

    let (staging, layout, first_lane) = match kernel {
        None => {
            let staging = allocate_on(
                &runtime.context,
                packed_span.len(),
                wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                &label,
            )?;
            encoder.copy_buffer_to_buffer(&allocation.buffer, packed_span.start, &staging, 0, packed_span.len());
            (staging, WordLayout::Packed(ty), packed_span.first_lane)
        }
        Some(kernel) => {
            let TransferLimits { max_binding_bytes, offset_alignment, .. } = runtime.transfer;
            let step = kernels::alignment_elements(ty, offset_alignment);
            let first = range.offset / step * step;
            let words_per_element = ty.pack_kind().words_per_element();

            let lanes = allocate_on(
                &runtime.context,
                ty.lane_bytes(range.end() - first),
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                &label,
            )?;
            for chunk in kernels::split_conversion(ty, first, range.end(), max_binding_bytes, offset_alignment) {
                let packed_offset = ty.packed_words(chunk.first) as u64 * WORD_BYTES;
                let lane_offset = ((chunk.first - first) * words_per_element) as u64 * WORD_BYTES;
                let source = Operand {
                    buffer: &allocation.buffer,
                    offset: packed_offset,
                    tag: OperandTag {
                        layout: WordLayout::Packed(ty),
                        length: chunk.count,
                        physical_bytes: allocation.size.saturating_sub(packed_offset),
                    },
                };
                let destination = Operand {
                    buffer: &lanes,
                    offset: lane_offset,
                    tag: OperandTag {
                        layout: WordLayout::Lanes(ty),
                        length: chunk.count,
                        physical_bytes: lanes.size().saturating_sub(lane_offset),
                    },
                };
                kernels::encode_conversion(runtime, &mut encoder, kernel, source, destination)?;
            }

            let within = ReadRange { offset: range.offset - first, count: range.count };
            let lane_span = codec::physical_span(WordLayout::Lanes(ty), within, lanes.size())?;
            let staging = allocate_on(
                &runtime.context,
                lane_span.len(),
                wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                &label,
            )?;
            encoder.copy_buffer_to_buffer(&lanes, lane_span.start, &staging, 0, lane_span.len());
            (staging, WordLayout::Lanes(ty), 0)
        }
    };

    let context = &runtime.context;
    let submission = context
        .capture(|| context.queue.submit(Some(encoder.finish())))
        .map_err(|message| DeviceError::SubmissionFailed { message: message.into() })?;
    let words = map_words(context, &staging, submission, runtime.readback_timeout)?;

    Ok(Readback { words, layout, first_lane, count: range.count })
}

fn map_words(
    context: &GPUContext,
    staging: &wgpu::Buffer,
    submission: wgpu::SubmissionIndex,
    timeout: std::time::Duration,
) -> GpuResult<Vec<u32>> {
    let slice = staging.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });

    context
        .device
        .poll(wgpu::PollType::Wait {
            submission_index: Some(submission),
            timeout: Some(timeout),
        })
        .map_err(|e| DeviceError::PollFailed { message: format!("{e:?}").into() })?;

    rx.recv()
        .map_err(|_| DeviceError::MapFailed { message: "map callback dropped".into() })?
        .map_err(|e| DeviceError::MapFailed { message: format!("{e:?}").into() })?;

    let words = {
        let view = slice.get_mapped_range();
        view.chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    };
    staging.unmap();
    Ok(words)
}
