use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use minigpu::prelude::*;
use minigpu::gpu::kernels::{plan_workgroups, ConversionKernel, WorkgroupPlan};
use minigpu::{DispatchLimits, ExecutorError, GpuError};

mod common;
use common::{context, context_with, groups_for, ADD_ONE, COPY_WORDS};

fn signed_ramp() -> Vec<i8> {
    vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, -1, -2, -3, -4, -5, -6]
}

#[test]
fn int8_identity_copy_is_bit_exact() {
    for packing in [PackingStrategy::Device, PackingStrategy::Host] {
        let Some(ctx) = context_with(ContextConfig::default().with_packing(packing)) else { return };

        let input = signed_ramp();
        let source = Buffer::create(&ctx, 16, LogicalType::Int8).unwrap();
        let destination = Buffer::create(&ctx, 16, LogicalType::Int8).unwrap();
        source.write(&input).unwrap();

        let shader = ComputeShader::new(&ctx);
        shader.load_source(COPY_WORDS).unwrap();
        shader.set_binding(0, &source).unwrap();
        shader.set_binding(1, &destination).unwrap();
        shader.dispatch(1, 1, 1).unwrap();

        assert_eq!(destination.read::<i8>(16, 0).unwrap(), input, "{packing:?}");
    }
}

#[test]
fn rebinding_to_a_same_shaped_buffer() {
    let Some(ctx) = context() else { return };

    let input = Buffer::new(&ctx);
    let first = Buffer::create(&ctx, 100, LogicalType::Float32).unwrap();
    let second = Buffer::create(&ctx, 100, LogicalType::Float32).unwrap();
    let values: Vec<f32> = (0..100).map(|i| i as f32).collect();
    input.write(&values).unwrap();

    let shader = ComputeShader::new(&ctx);
    shader.load_source(ADD_ONE).unwrap();
    shader.set_binding(0, &input).unwrap();
    shader.set_binding(1, &first).unwrap();
    shader.dispatch(groups_for(100), 1, 1).unwrap();

    shader.set_binding(1, &second).unwrap();
    input.write(&values.iter().map(|v| v * 10.0).collect::<Vec<_>>()).unwrap();
    shader.dispatch(groups_for(100), 1, 1).unwrap();

    let expected_first: Vec<f32> = values.iter().map(|v| v + 1.0).collect();
    let expected_second: Vec<f32> = values.iter().map(|v| v * 10.0 + 1.0).collect();
    assert_eq!(first.read::<f32>(100, 0).unwrap(), expected_first);
    assert_eq!(second.read::<f32>(100, 0).unwrap(), expected_second);

    let stats = shader.stats();
    assert_eq!(stats.pipelines, 1);
    assert_eq!(stats.bind_groups, 2);
}

#[test]
fn packed_words_are_visible_to_user_shaders() {
    let Some(ctx) = context() else { return };

    // a shader sees int16 storage as packed u32 words
    let source = Buffer::new(&ctx);
    let words = Buffer::create(&ctx, 2, LogicalType::Uint32).unwrap();
    source.write(&[1i16, -1, 0x1234, 0]).unwrap();

    let shader = ComputeShader::new(&ctx);
    shader.load_source(COPY_WORDS).unwrap();
    shader.set_binding(0, &source).unwrap();
    shader.set_binding(1, &words).unwrap();
    shader.dispatch(1, 1, 1).unwrap();

    assert_eq!(words.read::<u32>(2, 0).unwrap(), vec![0xFFFF_0001, 0x0000_1234]);
}

#[test]
fn large_conversions_spill_into_a_second_dimension() {
    let limits = DispatchLimits { max_groups_per_dimension: 8, max_total_groups: 1000 };
    let Some(ctx) = context_with(ContextConfig::default().with_dispatch_limits(limits)) else { return };

    // 20_000 int8 values -> 5_000 words -> 20 groups -> 8 x 3 grid
    assert_eq!(
        plan_workgroups(ConversionKernel::PackNarrow8, 20_000, &limits),
        Ok(WorkgroupPlan { x: 8, y: 3 })
    );
    let values: Vec<i8> = (0..20_000).map(|i| (i % 251) as i8).collect();
    let buffer = Buffer::new(&ctx);
    buffer.write(&values).unwrap();
    assert_eq!(buffer.read::<i8>(values.len(), 0).unwrap(), values);
    assert_eq!(buffer.read::<i8>(10, 19_995).unwrap(), &values[19_995..]);
}

#[test]
fn capabilities_are_reported() {
    let Some(ctx) = context() else { return };

    let caps = ctx.capabilities().expect("initialized context reports capabilities");
    assert!(caps.limits.max_compute_workgroups_per_dimension > 0);
    assert!(caps.limits.max_bindings_per_bind_group > 0);
    assert!(ctx.dispatch_limits().max_groups_per_dimension <= caps.limits.max_compute_workgroups_per_dimension);
}

#[test]
fn async_context_initialization() {
    common::init_logging();

    let (tx, rx) = mpsc::channel();
    let ctx = Context::new_async(ContextConfig::default(), move |result| {
        tx.send(result.is_ok()).unwrap();
    })
    .unwrap();

    // work queued before the device is ready runs after initialization
    let buffer = Buffer::new(&ctx);
    let written = buffer.write(&[9u32, 8, 7]);

    let ready = rx.recv_timeout(Duration::from_secs(60)).unwrap();
    if ready {
        written.unwrap();
        assert!(ctx.capabilities().is_some());
        assert_eq!(buffer.read::<u32>(3, 0).unwrap(), vec![9, 8, 7]);
    } else {
        eprintln!("skipping: no GPU adapter available");
        assert!(matches!(
            written,
            Err(GpuError::Executor(ExecutorError::TaskDropped | ExecutorError::ShutDown))
        ));
    }
}

#[test]
fn buffers_are_usable_from_many_threads() {
    let Some(ctx) = context() else { return };

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let ctx = ctx.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let buffer = Buffer::new(&ctx);
                let values: Vec<i16> = (0..500).map(|i| (i * (t as i16 + 1)) - 700).collect();
                barrier.wait();
                for _ in 0..5 {
                    buffer.write(&values).unwrap();
                    assert_eq!(buffer.read::<i16>(500, 0).unwrap(), values);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn destroy_stops_accepting_work() {
    let Some(ctx) = context() else { return };

    let shader = ComputeShader::new(&ctx);
    shader.load_source(COPY_WORDS).unwrap();
    let a = Buffer::create(&ctx, 4, LogicalType::Uint32).unwrap();
    let b = Buffer::create(&ctx, 4, LogicalType::Uint32).unwrap();
    shader.set_binding(0, &a).unwrap();
    shader.set_binding(1, &b).unwrap();

    ctx.destroy();
    ctx.destroy();

    assert_eq!(shader.dispatch(1, 1, 1), Err(GpuError::Executor(ExecutorError::ShutDown)));
    assert!(Buffer::create(&ctx, 4, LogicalType::Int8).is_err());
}
