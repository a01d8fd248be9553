//! # Conversion Kernels
//!
//! Device-side half of the packing codec. Each kernel converts between the
//! persistent packed layout of a buffer and the one-word-per-lane staging
//! layout that host data is uploaded in and read back from.
//!
//! | kernel            | source            | destination       |
//! |-------------------|-------------------|-------------------|
//! | `PackNarrow8`     | `Lanes(int8/u8)`  | `Packed(..)`      |
//! | `UnpackNarrow8`   | `Packed(..)`      | `Lanes(..)`       |
//! | `PackNarrow16`    | `Lanes(i16/u16)`  | `Packed(..)`      |
//! | `UnpackNarrow16`  | `Packed(..)`      | `Lanes(..)`       |
//! | `ExpandWide64`    | `Lanes(64-bit)`   | `Packed(..)`      |
//! | `CombineWide64`   | `Packed(64-bit)`  | `Lanes(..)`       |
//!
//! Narrow kernels run one invocation per packed word, handling all lanes of
//! the word; lanes past the logical count are written as zero on pack and
//! skipped on unpack. Wide kernels move one `(low, high)` word pair per
//! invocation without numeric conversion.
//!
//! ## Safety checks
//!
//! Before anything is bound, [`validate_operands`] checks layout tags,
//! logical lengths and allocation sizes, and [`plan_workgroups`] checks the
//! dispatch against the ceiling. A kernel that fails either check is never
//! dispatched.
//!
//! ## Large buffers
//!
//! Workgroups beyond the per-dimension limit spill into the `y` dimension;
//! kernels flatten `(x, y)` back into a linear index with `num_workgroups`.
//!
//! Operands are bound as sub-ranges. A transfer whose lanes would exceed the
//! device's storage binding limit is cut by [`split_conversion`] into runs
//! that each fit, and every run starts at an offset the device accepts. The
//! kernels index from the start of their bound range, so one source serves
//! any run.

use wgpu::util::DeviceExt;

use crate::engine::error::{CapacityError, DeviceError, DispatchError, GpuResult, KernelError};
use crate::engine::types::{LogicalType, PackKind, WordLayout, WORD_BYTES};
use crate::gpu::config::DispatchLimits;
use crate::gpu::executor::Runtime;
use crate::gpu::pipeline::ConversionParams;


/// Invocations per workgroup for every conversion kernel.
pub const WORKGROUP_SIZE: u32 = 256;

/// A built-in layout conversion.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionKernel {
    /// Four widened 8-bit lanes into one word.
    PackNarrow8,
    /// One word into four 8-bit lanes.
    UnpackNarrow8 {
        /// Sign-extend each lane.
        signed: bool,
    },
    /// Two widened 16-bit lanes into one word.
    PackNarrow16,
    /// One word into two 16-bit lanes.
    UnpackNarrow16 {
        /// Sign-extend each lane.
        signed: bool,
    },
    /// Staged 64-bit word pairs into the packed buffer.
    ExpandWide64,
    /// Packed 64-bit word pairs into staging.
    CombineWide64,
}

impl ConversionKernel {
    /// Kernel that writes host data of type `ty` into packed storage.
    /// `None` for native types, which need no conversion.
    pub const fn pack(ty: LogicalType) -> Option<Self> {
        match ty.pack_kind() {
            PackKind::Narrow8 => Some(ConversionKernel::PackNarrow8),
            PackKind::Narrow16 => Some(ConversionKernel::PackNarrow16),
            PackKind::Wide64 => Some(ConversionKernel::ExpandWide64),
            PackKind::Native => None,
        }
    }

    /// Kernel that reads packed storage of type `ty` back into lanes.
    /// `None` for native types.
    pub const fn unpack(ty: LogicalType) -> Option<Self> {
        let signed = ty.is_signed();
        match ty.pack_kind() {
            PackKind::Narrow8 => Some(ConversionKernel::UnpackNarrow8 { signed }),
            PackKind::Narrow16 => Some(ConversionKernel::UnpackNarrow16 { signed }),
            PackKind::Wide64 => Some(ConversionKernel::CombineWide64),
            PackKind::Native => None,
        }
    }

    /// Stable name, used for labels and logs.
    pub const fn name(self) -> &'static str {
        match self {
            ConversionKernel::PackNarrow8 => "pack_narrow8",
            ConversionKernel::UnpackNarrow8 { signed: true } => "unpack_narrow8_signed",
            ConversionKernel::UnpackNarrow8 { signed: false } => "unpack_narrow8_unsigned",
            ConversionKernel::PackNarrow16 => "pack_narrow16",
            ConversionKernel::UnpackNarrow16 { signed: true } => "unpack_narrow16_signed",
            ConversionKernel::UnpackNarrow16 { signed: false } => "unpack_narrow16_unsigned",
            ConversionKernel::ExpandWide64 => "expand_wide64",
            ConversionKernel::CombineWide64 => "combine_wide64",
        }
    }

    /// `true` for kernels writing the packed layout.
    #[inline]
    pub const fn is_pack(self) -> bool {
        matches!(
            self,
            ConversionKernel::PackNarrow8 | ConversionKernel::PackNarrow16 | ConversionKernel::ExpandWide64
        )
    }

    /// Source and destination layouts for elements of type `ty`.
    #[inline]
    pub const fn layouts(self, ty: LogicalType) -> (WordLayout, WordLayout) {
        if self.is_pack() {
            (WordLayout::Lanes(ty), WordLayout::Packed(ty))
        } else {
            (WordLayout::Packed(ty), WordLayout::Lanes(ty))
        }
    }

    /// `true` when this kernel is the one `ty` converts with.
    pub fn accepts(self, ty: LogicalType) -> bool {
        if self.is_pack() {
            Self::pack(ty) == Some(self)
        } else {
            Self::unpack(ty) == Some(self)
        }
    }

    /// Invocations needed for `count` logical elements.
    #[inline]
    pub const fn invocations(self, count: usize) -> usize {
        match self {
            ConversionKernel::PackNarrow8 | ConversionKernel::UnpackNarrow8 { .. } => count.div_ceil(4),
            ConversionKernel::PackNarrow16 | ConversionKernel::UnpackNarrow16 { .. } => count.div_ceil(2),
            ConversionKernel::ExpandWide64 | ConversionKernel::CombineWide64 => count,
        }
    }

    /// WGSL source of the kernel.
    pub fn wgsl(self) -> String {
        let body = match self {
            ConversionKernel::PackNarrow8 => narrow_pack_body(4, 8),
            ConversionKernel::PackNarrow16 => narrow_pack_body(2, 16),
            ConversionKernel::UnpackNarrow8 { signed } => narrow_unpack_body(4, 8, signed),
            ConversionKernel::UnpackNarrow16 { signed } => narrow_unpack_body(2, 16, signed),
            ConversionKernel::ExpandWide64 | ConversionKernel::CombineWide64 => WIDE_BODY.to_owned(),
        };
        format!("{HEADER}{body}")
    }
}

const HEADER: &str = r#"struct Params {
    count: u32,
    words: u32,
    _p0: u32,
    _p1: u32,
}

@group(0) @binding(0) var<storage, read> src: array<u32>;
@group(0) @binding(1) var<storage, read_write> dst: array<u32>;
@group(0) @binding(2) var<uniform> params: Params;

"#;

const NARROW_PACK_BODY: &str = r#"@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let word = gid.x + gid.y * groups.x * 256u;
    if (word >= params.words) {
        return;
    }
    var packed = 0u;
    for (var lane = 0u; lane < $LANESu; lane = lane + 1u) {
        let index = word * $LANESu + lane;
        if (index < params.count) {
            packed = packed | ((src[index] & $MASKu) << (lane * $BITSu));
        }
    }
    dst[word] = packed;
}
"#;

const NARROW_UNPACK_BODY: &str = r#"@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let word = gid.x + gid.y * groups.x * 256u;
    if (word >= params.words) {
        return;
    }
    let packed = src[word];
    for (var lane = 0u; lane < $LANESu; lane = lane + 1u) {
        let index = word * $LANESu + lane;
        if (index < params.count) {
            dst[index] = $EXTRACT;
        }
    }
}
"#;

const SIGNED_EXTRACT: &str = "bitcast<u32>(bitcast<i32>(packed << ($SHIFTu - lane * $BITSu)) >> $SHIFTu)";

const UNSIGNED_EXTRACT: &str = "(packed >> (lane * $BITSu)) & $MASKu";

const WIDE_BODY: &str = r#"@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let index = gid.x + gid.y * groups.x * 256u;
    if (index >= params.count) {
        return;
    }
    dst[index * 2u] = src[index * 2u];
    dst[index * 2u + 1u] = src[index * 2u + 1u];
}
"#;

fn substitute(template: &str, lanes: u32, bits: u32) -> String {
    let mask = u32::MAX >> (32 - bits);
    template
        .replace("$LANES", &lanes.to_string())
        .replace("$SHIFT", &(32 - bits).to_string())
        .replace("$BITS", &bits.to_string())
        .replace("$MASK", &format!("0x{mask:X}"))
}

fn narrow_pack_body(lanes: u32, bits: u32) -> String {
    substitute(NARROW_PACK_BODY, lanes, bits)
}

fn narrow_unpack_body(lanes: u32, bits: u32, signed: bool) -> String {
    let extract = if signed { SIGNED_EXTRACT } else { UNSIGNED_EXTRACT };
    substitute(&NARROW_UNPACK_BODY.replace("$EXTRACT", extract), lanes, bits)
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Tag and size of one conversion operand.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandTag {
    /// Layout the buffer's words are in.
    pub layout: WordLayout,
    /// Logical element count the buffer holds.
    pub length: usize,
    /// Allocation size in bytes.
    pub physical_bytes: u64,
}

/// Checks both operands of `kernel` before it is dispatched.
///
/// ## Errors
/// * [`KernelError::LayoutMismatch`] if either layout tag is not what the
///   kernel converts between, or the kernel does not handle the source's
///   logical type.
/// * [`KernelError::LengthMismatch`] if logical lengths differ.
/// * [`KernelError::Undersized`] if either allocation is smaller than its
///   layout needs for that length.
/// * [`KernelError::BindingTooLarge`] if either bound range exceeds
///   `max_binding_bytes`.

pub fn validate_operands(
    kernel: ConversionKernel,
    source: &OperandTag,
    destination: &OperandTag,
    max_binding_bytes: u64,
) -> Result<(), KernelError> {
    let name = kernel.name();
    let ty = source.layout.logical();
    let (expected_source, expected_destination) = kernel.layouts(ty);

    if source.layout != expected_source || !kernel.accepts(ty) {
        return Err(KernelError::LayoutMismatch {
            kernel: name,
            operand: "source",
            expected: expected_source,
            actual: source.layout,
        });
    }
    if destination.layout != expected_destination {
        return Err(KernelError::LayoutMismatch {
            kernel: name,
            operand: "destination",
            expected: expected_destination,
            actual: destination.layout,
        });
    }
    if source.length != destination.length {
        return Err(KernelError::LengthMismatch {
            kernel: name,
            source_len: source.length,
            destination_len: destination.length,
        });
    }

    for (what, operand) in [("source", source), ("destination", destination)] {
        let required = operand.layout.required_bytes(operand.length);
        if operand.physical_bytes < required {
            return Err(KernelError::Undersized {
                kernel: name,
                capacity: CapacityError { what, required, available: operand.physical_bytes },
            });
        }
        if required > max_binding_bytes {
            return Err(KernelError::BindingTooLarge {
                kernel: name,
                operand: what,
                bytes: required,
                limit: max_binding_bytes,
            });
        }
    }
    Ok(())
}

/// Workgroup grid for one conversion.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupPlan {
    /// Groups along x.
    pub x: u32,
    /// Groups along y.
    pub y: u32,
}

/// Sizes the workgroup grid for `count` elements and checks it against
/// `limits`.
///
/// Groups fill `x` up to the per-dimension limit and spill into `y`.
///
/// ## Errors
/// * [`DispatchError::ZeroGroups`] for an empty conversion.
/// * [`DispatchError::DimensionLimit`] / [`DispatchError::TotalLimit`] if the
///   grid exceeds the ceiling.

pub fn plan_workgroups(
    kernel: ConversionKernel,
    count: usize,
    limits: &DispatchLimits,
) -> Result<WorkgroupPlan, DispatchError> {
    let groups = kernel.invocations(count).div_ceil(WORKGROUP_SIZE as usize) as u64;
    let total_limit = DispatchError::TotalLimit { total: groups, limit: limits.max_total_groups };
    if groups == 0 {
        return Err(DispatchError::ZeroGroups { x: 0, y: 1, z: 1 });
    }

    let per_dimension = limits.max_groups_per_dimension.max(1) as u64;
    let x = groups.min(per_dimension);
    let y = groups.div_ceil(x);
    let (x, y) = match (u32::try_from(x), u32::try_from(y)) {
        (Ok(x), Ok(y)) => (x, y),
        _ => return Err(total_limit),
    };
    limits.check(x, y, 1)?;
    Ok(WorkgroupPlan { x, y })
}

/// A run of elements converted by one dispatch.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionChunk {
    /// First element of the run.
    pub first: usize,
    /// Elements in the run.
    pub count: usize,
}

/// Smallest run of `ty` elements whose packed and lane byte sizes are both
/// multiples of `offset_alignment`.
pub fn alignment_elements(ty: LogicalType, offset_alignment: u64) -> usize {
    let words = (offset_alignment / WORD_BYTES).max(1) as usize;
    let kind = ty.pack_kind();
    (words * kind.lanes_per_word() / kind.words_per_element()).max(1)
}

/// Splits elements `first..end` into runs whose lane ranges fit in
/// `max_binding_bytes`.
///
/// `first` must be a multiple of [`alignment_elements`]. Every run except the
/// last holds a whole number of alignment steps, so each run starts at an
/// aligned offset in both layouts. A run never holds less than one step; if
/// one step alone is over the limit, [`validate_operands`] rejects it.

pub fn split_conversion(
    ty: LogicalType,
    first: usize,
    end: usize,
    max_binding_bytes: u64,
    offset_alignment: u64,
) -> Vec<ConversionChunk> {
    let step = alignment_elements(ty, offset_alignment);
    let element_lane_bytes = ty.pack_kind().words_per_element() as u64 * WORD_BYTES;
    let fitting = usize::try_from(max_binding_bytes / element_lane_bytes).unwrap_or(usize::MAX);
    let per_run = (fitting / step).max(1) * step;

    (first..end)
        .step_by(per_run)
        .map(|start| ConversionChunk { first: start, count: per_run.min(end - start) })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

/// One bound conversion operand: `tag.length` elements starting `offset`
/// bytes into `buffer`.
pub(crate) struct Operand<'a> {
    pub buffer: &'a wgpu::Buffer,
    pub offset: u64,
    pub tag: OperandTag,
}

impl Operand<'_> {
    fn binding(&self) -> wgpu::BindingResource<'_> {
        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer: self.buffer,
            offset: self.offset,
            size: wgpu::BufferSize::new(self.tag.layout.required_bytes(self.tag.length)),
        })
    }
}

/// Validates and records one conversion into `encoder`.
///
/// Nothing is recorded if validation fails. The caller submits the encoder.
///
/// ## Errors
/// Validation errors from [`validate_operands`] and [`plan_workgroups`], or
/// [`DeviceError`] if the kernel fails to compile or the device rejects its
/// bind group.

pub(crate) fn encode_conversion(
    runtime: &mut Runtime,
    encoder: &mut wgpu::CommandEncoder,
    kernel: ConversionKernel,
    source: Operand<'_>,
    destination: Operand<'_>,
) -> GpuResult<()> {
    let max_binding_bytes = runtime.transfer.max_binding_bytes;
    let checked: GpuResult<WorkgroupPlan> = validate_operands(kernel, &source.tag, &destination.tag, max_binding_bytes)
        .map_err(Into::into)
        .and_then(|()| plan_workgroups(kernel, source.tag.length, &runtime.limits).map_err(Into::into));
    let plan = match checked {
        Ok(plan) => plan,
        Err(e) => {
            log::error!("{}: refusing to dispatch: {e}", kernel.name());
            return Err(e);
        }
    };

    let count = source.tag.length;
    let (count_u32, words_u32) = match (
        u32::try_from(count),
        u32::try_from(source.tag.layout.logical().packed_words(count)),
    ) {
        (Ok(count), Ok(words)) => (count, words),
        _ => {
            return Err(DispatchError::TotalLimit {
                total: count as u64,
                limit: u32::MAX as u64,
            }
            .into())
        }
    };

    let Runtime { context, conversions, .. } = runtime;
    let compiled = conversions.get_or_create(context, kernel)?;

    let params = ConversionParams { count: count_u32, words: words_u32, _p0: 0, _p1: 0 };
    let bind_group = context
        .capture(|| {
            let parameter_buffer = context.device.create_buffer_init(
                &wgpu::util::BufferInitDescriptor {
                    label: Some("minigpu_conversion_params"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                },
            );

            context.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(kernel.name()),
                layout: &compiled.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: source.binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: destination.binding() },
                    wgpu::BindGroupEntry { binding: 2, resource: parameter_buffer.as_entire_binding() },
                ],
            })
        })
        .map_err(|message| {
            log::error!("{}: bind group rejected: {message}", kernel.name());
            DeviceError::ShaderCompilation { stage: "conversion bind group", message: message.into() }
        })?;

    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(kernel.name()),
            timestamp_writes: None,
        });
        pass.set_pipeline(&compiled.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(plan.x, plan.y, 1);
    }

    log::trace!(
        "{}: {count} elements in {}x{} groups",
        kernel.name(),
        plan.x,
        plan.y
    );
    Ok(())
}
