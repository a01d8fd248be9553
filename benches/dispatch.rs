use criterion::*;
use std::hint::black_box;

use minigpu::prelude::*;

const ELEMENTS: usize = 1 << 20;

const SCALE: &str = r#"
@group(0) @binding(0) var<storage, read_write> a: array<f32>;
@group(0) @binding(1) var<storage, read_write> b: array<f32>;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&a)) {
        b[id.x] = a[id.x] * 1.0001;
    }
}
"#;

fn dispatch_benchmark(c: &mut Criterion) {
    let ctx = match Context::new(ContextConfig::default().with_label("bench")) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("skipping dispatch benchmarks: {e}");
            return;
        }
    };

    let input = Buffer::new(&ctx);
    let output = Buffer::create(&ctx, ELEMENTS, LogicalType::Float32).unwrap();
    input.write(&vec![1.0f32; ELEMENTS]).unwrap();

    let shader = ComputeShader::new(&ctx);
    shader.load_source(SCALE).unwrap();
    shader.set_binding(0, &input).unwrap();
    shader.set_binding(1, &output).unwrap();
    let groups = ELEMENTS.div_ceil(256) as u32;

    // first dispatch builds and caches the pipeline
    shader.dispatch(groups, 1, 1).unwrap();

    c.bench_function("dispatch_hot_1M", |b| {
        b.iter(|| {
            shader.dispatch(black_box(groups), 1, 1).unwrap();
        });
    });

    c.bench_function("dispatch_and_read_1M", |b| {
        b.iter(|| {
            shader.dispatch(groups, 1, 1).unwrap();
            black_box(output.read::<f32>(ELEMENTS, 0).unwrap());
        });
    });

    let packed = Buffer::new(&ctx);
    let values: Vec<i8> = (0..ELEMENTS).map(|i| (i % 127) as i8).collect();
    c.bench_function("write_read_int8_1M", |b| {
        b.iter(|| {
            packed.write(black_box(&values)).unwrap();
            black_box(packed.read::<i8>(ELEMENTS, 0).unwrap());
        });
    });

    ctx.destroy();
}

criterion_group!(benches, dispatch_benchmark);
criterion_main!(benches);
