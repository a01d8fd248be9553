#![allow(dead_code)]

use std::sync::Once;

use minigpu::{Context, ContextConfig};

static LOGGER: Once = Once::new();

pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Device context for tests that need a GPU, or `None` when the machine has
/// no usable adapter.
pub fn context_with(config: ContextConfig) -> Option<Context> {
    init_logging();
    match Context::new(config) {
        Ok(context) => Some(context),
        Err(e) => {
            eprintln!("skipping: no GPU adapter available ({e})");
            None
        }
    }
}

pub fn context() -> Option<Context> {
    context_with(ContextConfig::default())
}

/// Copies `a` into `b` one 32-bit word per invocation.
pub const COPY_WORDS: &str = r#"
@group(0) @binding(0) var<storage, read_write> a: array<u32>;
@group(0) @binding(1) var<storage, read_write> b: array<u32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&a) && id.x < arrayLength(&b)) {
        b[id.x] = a[id.x];
    }
}
"#;

/// Writes `a + 1.0` into `b`.
pub const ADD_ONE: &str = r#"
@group(0) @binding(0) var<storage, read_write> a: array<f32>;
@group(0) @binding(1) var<storage, read_write> b: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&a) && id.x < arrayLength(&b)) {
        b[id.x] = a[id.x] + 1.0;
    }
}
"#;

/// Writes `a * 2.0` into `b`.
pub const DOUBLE: &str = r#"
@group(0) @binding(0) var<storage, read_write> a: array<f32>;
@group(0) @binding(1) var<storage, read_write> b: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&a) && id.x < arrayLength(&b)) {
        b[id.x] = a[id.x] * 2.0;
    }
}
"#;

/// Workgroups of 64 needed to cover `n` words.
pub fn groups_for(n: usize) -> u32 {
    n.div_ceil(64).max(1) as u32
}
