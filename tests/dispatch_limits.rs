use std::time::Duration;

use minigpu::gpu::config::{DEFAULT_MAX_GROUPS_PER_DIMENSION, DEFAULT_MAX_TOTAL_GROUPS};
use minigpu::gpu::kernels::{
    alignment_elements, plan_workgroups, split_conversion, validate_operands, ConversionChunk,
    ConversionKernel, OperandTag, WorkgroupPlan, WORKGROUP_SIZE,
};
use minigpu::{
    ContextConfig, DispatchError, DispatchLimits, KernelError, LogicalType, PackingStrategy, WordLayout,
};

#[test]
fn default_ceiling_rejects_oversized_dispatch() {
    let limits = DispatchLimits::default();
    assert_eq!(limits.max_groups_per_dimension, DEFAULT_MAX_GROUPS_PER_DIMENSION);
    assert_eq!(limits.max_total_groups, DEFAULT_MAX_TOTAL_GROUPS);

    assert_eq!(
        limits.check(100_000, 1, 1),
        Err(DispatchError::DimensionLimit { axis: 'x', groups: 100_000, limit: 65_535 })
    );
    assert!(matches!(
        limits.check(1, 1, 70_000),
        Err(DispatchError::DimensionLimit { axis: 'z', .. })
    ));
    assert!(limits.check(65_535, 1, 1).is_ok());
    assert!(limits.check(1024, 64, 1).is_ok());
}

#[test]
fn zero_groups_are_rejected() {
    let limits = DispatchLimits::default();
    assert_eq!(limits.check(0, 1, 1), Err(DispatchError::ZeroGroups { x: 0, y: 1, z: 1 }));
    assert!(limits.check(1, 0, 1).is_err());
    assert!(limits.check(1, 1, 0).is_err());
}

#[test]
fn total_ceiling_is_checked_on_the_product() {
    let limits = DispatchLimits { max_groups_per_dimension: 1000, max_total_groups: 100 };
    assert_eq!(
        limits.check(20, 6, 1),
        Err(DispatchError::TotalLimit { total: 120, limit: 100 })
    );
    assert!(limits.check(10, 10, 1).is_ok());
}

#[test]
fn device_limit_only_tightens() {
    let limits = DispatchLimits::default();
    assert_eq!(limits.clamped_to(1024).max_groups_per_dimension, 1024);
    assert_eq!(limits.clamped_to(u32::MAX).max_groups_per_dimension, 65_535);
    assert_eq!(limits.clamped_to(1024).max_total_groups, DEFAULT_MAX_TOTAL_GROUPS);
}

#[test]
fn conversion_grid_spills_into_y() {
    let limits = DispatchLimits { max_groups_per_dimension: 10, max_total_groups: 1000 };

    // 25_600 int8 values -> 6_400 words -> 25 groups of 256
    let plan = plan_workgroups(ConversionKernel::PackNarrow8, 25_600, &limits).unwrap();
    assert_eq!(plan, WorkgroupPlan { x: 10, y: 3 });

    let plan = plan_workgroups(ConversionKernel::ExpandWide64, 100, &limits).unwrap();
    assert_eq!(plan, WorkgroupPlan { x: 1, y: 1 });

    let small = DispatchLimits { max_groups_per_dimension: 10, max_total_groups: 20 };
    assert!(matches!(
        plan_workgroups(ConversionKernel::PackNarrow8, 25_600, &small),
        Err(DispatchError::TotalLimit { .. })
    ));

    assert!(matches!(
        plan_workgroups(ConversionKernel::CombineWide64, 0, &limits),
        Err(DispatchError::ZeroGroups { .. })
    ));
}

#[test]
fn invocations_follow_pack_factor() {
    assert_eq!(ConversionKernel::PackNarrow8.invocations(9), 3);
    assert_eq!(ConversionKernel::UnpackNarrow16 { signed: true }.invocations(5), 3);
    assert_eq!(ConversionKernel::CombineWide64.invocations(7), 7);
    assert_eq!(WORKGROUP_SIZE, 256);
}

#[test]
fn kernel_selection_per_type() {
    assert_eq!(ConversionKernel::pack(LogicalType::Uint8), Some(ConversionKernel::PackNarrow8));
    assert_eq!(
        ConversionKernel::unpack(LogicalType::Int8),
        Some(ConversionKernel::UnpackNarrow8 { signed: true })
    );
    assert_eq!(
        ConversionKernel::unpack(LogicalType::Uint16),
        Some(ConversionKernel::UnpackNarrow16 { signed: false })
    );
    assert_eq!(ConversionKernel::pack(LogicalType::Int64), Some(ConversionKernel::ExpandWide64));
    assert_eq!(ConversionKernel::unpack(LogicalType::Float64), Some(ConversionKernel::CombineWide64));
    assert_eq!(ConversionKernel::pack(LogicalType::Float32), None);
    assert_eq!(ConversionKernel::unpack(LogicalType::Int32), None);
}

const UNLIMITED: u64 = u64::MAX;

fn tag(layout: WordLayout, length: usize, physical_bytes: u64) -> OperandTag {
    OperandTag { layout, length, physical_bytes }
}

#[test]
fn operand_validation_accepts_matching_tags() {
    let ty = LogicalType::Int8;
    let source = tag(WordLayout::Lanes(ty), 16, ty.lane_bytes(16));
    let destination = tag(WordLayout::Packed(ty), 16, ty.physical_bytes(16));
    assert!(validate_operands(ConversionKernel::PackNarrow8, &source, &destination, UNLIMITED).is_ok());

    let unpack = ConversionKernel::UnpackNarrow8 { signed: true };
    assert!(validate_operands(unpack, &destination, &source, UNLIMITED).is_ok());
}

#[test]
fn operand_validation_rejects_wrong_layouts() {
    let ty = LogicalType::Int8;
    let packed = tag(WordLayout::Packed(ty), 16, 16);

    // pack kernel fed a packed source
    assert!(matches!(
        validate_operands(ConversionKernel::PackNarrow8, &packed, &packed, UNLIMITED),
        Err(KernelError::LayoutMismatch { operand: "source", .. })
    ));

    // unsigned unpack kernel used for a signed type
    let lanes = tag(WordLayout::Lanes(ty), 16, 64);
    assert!(matches!(
        validate_operands(ConversionKernel::UnpackNarrow8 { signed: false }, &packed, &lanes, UNLIMITED),
        Err(KernelError::LayoutMismatch { .. })
    ));

    // narrow kernel used for a 16-bit type
    let source = tag(WordLayout::Lanes(LogicalType::Int16), 4, 16);
    let destination = tag(WordLayout::Packed(LogicalType::Int16), 4, 8);
    assert!(validate_operands(ConversionKernel::PackNarrow8, &source, &destination, UNLIMITED).is_err());
}

#[test]
fn operand_validation_rejects_length_and_size_problems() {
    let ty = LogicalType::Float64;
    let source = tag(WordLayout::Lanes(ty), 4, 32);

    let shorter = tag(WordLayout::Packed(ty), 3, 32);
    assert_eq!(
        validate_operands(ConversionKernel::ExpandWide64, &source, &shorter, UNLIMITED),
        Err(KernelError::LengthMismatch {
            kernel: "expand_wide64",
            source_len: 4,
            destination_len: 3,
        })
    );

    let undersized = tag(WordLayout::Packed(ty), 4, 16);
    match validate_operands(ConversionKernel::ExpandWide64, &source, &undersized, UNLIMITED) {
        Err(KernelError::Undersized { capacity, .. }) => {
            assert_eq!(capacity.what, "destination");
            assert_eq!(capacity.required, 32);
            assert_eq!(capacity.available, 16);
        }
        other => panic!("expected undersized destination, got {other:?}"),
    }
}

#[test]
fn operand_validation_rejects_oversized_bindings() {
    let ty = LogicalType::Int8;
    let count = 1 << 20;
    let source = tag(WordLayout::Lanes(ty), count, ty.lane_bytes(count));
    let destination = tag(WordLayout::Packed(ty), count, ty.physical_bytes(count));
    let limit = ty.physical_bytes(count);

    // the packed side fits, the widened lanes are four times larger
    assert_eq!(
        validate_operands(ConversionKernel::PackNarrow8, &source, &destination, limit),
        Err(KernelError::BindingTooLarge {
            kernel: "pack_narrow8",
            operand: "source",
            bytes: ty.lane_bytes(count),
            limit,
        })
    );
    assert!(validate_operands(ConversionKernel::PackNarrow8, &source, &destination, 4 * limit).is_ok());
}

#[test]
fn alignment_steps_cover_whole_words_in_both_layouts() {
    assert_eq!(alignment_elements(LogicalType::Int8, 256), 256);
    assert_eq!(alignment_elements(LogicalType::Uint16, 256), 128);
    assert_eq!(alignment_elements(LogicalType::Float64, 256), 32);
    assert_eq!(alignment_elements(LogicalType::Int64, 4), 1);
    assert_eq!(alignment_elements(LogicalType::Uint8, 4), 4);
}

#[test]
fn conversions_split_into_runs_that_fit_a_binding() {
    let ty = LogicalType::Int8;

    // 4 KiB of lanes holds 1024 int8 elements
    let runs = split_conversion(ty, 0, 2_500, 4096, 256);
    assert_eq!(
        runs,
        vec![
            ConversionChunk { first: 0, count: 1024 },
            ConversionChunk { first: 1024, count: 1024 },
            ConversionChunk { first: 2048, count: 452 },
        ]
    );
    for run in &runs {
        assert!(ty.lane_bytes(run.count) <= 4096);
        assert_eq!(ty.packed_words(run.first) as u64 * 4 % 256, 0);
    }

    // limits round down to whole alignment steps
    let wide = split_conversion(LogicalType::Float64, 64, 200, 300, 256);
    assert_eq!(
        wide,
        vec![
            ConversionChunk { first: 64, count: 32 },
            ConversionChunk { first: 96, count: 32 },
            ConversionChunk { first: 128, count: 32 },
            ConversionChunk { first: 160, count: 32 },
            ConversionChunk { first: 192, count: 8 },
        ]
    );

    // an unbounded limit is a single run
    assert_eq!(
        split_conversion(ty, 256, 300, u64::MAX, 256),
        vec![ConversionChunk { first: 256, count: 44 }]
    );
    assert!(split_conversion(ty, 0, 0, 4096, 256).is_empty());
}

#[test]
fn context_config_builders() {
    let limits = DispatchLimits { max_groups_per_dimension: 128, max_total_groups: 1024 };
    let config = ContextConfig::default()
        .with_label("bench")
        .with_packing(PackingStrategy::Host)
        .with_dispatch_limits(limits)
        .with_fallback_adapter(true)
        .with_readback_timeout(Duration::from_secs(5))
        .with_max_conversion_binding(1 << 16);

    assert_eq!(config.label, "bench");
    assert_eq!(config.packing, PackingStrategy::Host);
    assert_eq!(config.dispatch_limits, limits);
    assert!(config.force_fallback_adapter);
    assert_eq!(config.readback_timeout, Duration::from_secs(5));
    assert_eq!(config.max_conversion_binding, 1 << 16);

    let defaults = ContextConfig::default();
    assert_eq!(defaults.packing, PackingStrategy::Device);
    assert_eq!(defaults.label, "minigpu_device");
    assert_eq!(defaults.readback_timeout, Duration::from_secs(60));
    assert_eq!(defaults.max_conversion_binding, u64::MAX);
}
