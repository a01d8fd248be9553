use minigpu::gpu::kernels::ConversionKernel;
use minigpu::gpu::pipeline::{ConversionParams, ENTRY_POINT};
use minigpu::LogicalType;
use wgpu::naga;

const ALL_KERNELS: [ConversionKernel; 8] = [
    ConversionKernel::PackNarrow8,
    ConversionKernel::UnpackNarrow8 { signed: true },
    ConversionKernel::UnpackNarrow8 { signed: false },
    ConversionKernel::PackNarrow16,
    ConversionKernel::UnpackNarrow16 { signed: true },
    ConversionKernel::UnpackNarrow16 { signed: false },
    ConversionKernel::ExpandWide64,
    ConversionKernel::CombineWide64,
];

fn validate(kernel: ConversionKernel) -> naga::Module {
    let source = kernel.wgsl();
    assert!(!source.contains('$'), "{}: unsubstituted placeholder", kernel.name());

    let module = naga::front::wgsl::parse_str(&source)
        .unwrap_or_else(|e| panic!("{} failed to parse: {}", kernel.name(), e.emit_to_string(&source)));
    naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::empty())
        .validate(&module)
        .unwrap_or_else(|e| panic!("{} failed validation: {e:?}", kernel.name()));
    module
}

#[test]
fn every_conversion_kernel_is_valid_wgsl() {
    for kernel in ALL_KERNELS {
        let module = validate(kernel);
        let entry = module
            .entry_points
            .iter()
            .find(|ep| ep.name == ENTRY_POINT)
            .unwrap_or_else(|| panic!("{} has no `{ENTRY_POINT}` entry point", kernel.name()));
        assert_eq!(entry.stage, naga::ShaderStage::Compute);
        assert_eq!(entry.workgroup_size, [256, 1, 1]);
    }
}

#[test]
fn kernels_declare_the_fixed_binding_layout() {
    for kernel in ALL_KERNELS {
        let module = validate(kernel);
        let mut bindings: Vec<u32> = module
            .global_variables
            .iter()
            .filter_map(|(_, var)| var.binding.as_ref().map(|b| b.binding))
            .collect();
        bindings.sort_unstable();
        assert_eq!(bindings, vec![0, 1, 2], "{}", kernel.name());
    }
}

#[test]
fn signed_and_unsigned_unpack_differ_only_in_extraction() {
    let signed = ConversionKernel::UnpackNarrow8 { signed: true }.wgsl();
    let unsigned = ConversionKernel::UnpackNarrow8 { signed: false }.wgsl();
    assert!(signed.contains("bitcast<i32>"));
    assert!(!unsigned.contains("bitcast<i32>"));
    assert!(unsigned.contains("0xFFu"));
}

#[test]
fn kernel_names_are_unique() {
    let mut names: Vec<&str> = ALL_KERNELS.iter().map(|k| k.name()).collect();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), ALL_KERNELS.len());
}

#[test]
fn every_packed_type_has_a_kernel_pair() {
    for ty in LogicalType::ALL {
        let pack = ConversionKernel::pack(ty);
        let unpack = ConversionKernel::unpack(ty);
        assert_eq!(pack.is_some(), ty.is_packed(), "{ty}");
        assert_eq!(unpack.is_some(), ty.is_packed(), "{ty}");
        if let (Some(pack), Some(unpack)) = (pack, unpack) {
            assert!(pack.accepts(ty) && unpack.accepts(ty));
            assert!(pack.is_pack() && !unpack.is_pack());
        }
    }
}

#[test]
fn params_block_matches_uniform_layout() {
    assert_eq!(std::mem::size_of::<ConversionParams>(), 16);
    let params = ConversionParams { count: 5, words: 2, _p0: 0, _p1: 0 };
    assert_eq!(bytemuck::bytes_of(&params).len(), 16);
}
