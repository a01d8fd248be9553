#![cfg(feature = "ffi")]

use std::ffi::CString;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use minigpu::engine::types::type_code;
use minigpu::ffi::*;

mod common;
use common::{init_logging, COPY_WORDS};

static NULL_CALLBACKS: AtomicUsize = AtomicUsize::new(0);
static READS_DONE: AtomicUsize = AtomicUsize::new(0);
static DISPATCHES_DONE: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_null_operation() {
    NULL_CALLBACKS.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn on_read() {
    READS_DONE.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn on_dispatch() {
    DISPATCHES_DONE.fetch_add(1, Ordering::SeqCst);
}

fn wait_for(counter: &AtomicUsize, target: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(30);
    while counter.load(Ordering::SeqCst) < target {
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

#[test]
fn null_handles_are_no_ops() {
    init_logging();

    unsafe {
        assert!(mgpu_create_buffer(ptr::null_mut(), 16, type_code::INT8).is_null());
        assert!(mgpu_create_compute_shader(ptr::null_mut()).is_null());
        assert_eq!(mgpu_has_kernel(ptr::null_mut()), 0);

        let values = [1i8, 2, 3];
        mgpu_write_int8(ptr::null_mut(), values.as_ptr(), values.len());
        let mut out = [0f32; 4];
        mgpu_read_sync_float32(ptr::null_mut(), out.as_mut_ptr(), 4, 0);
        assert_eq!(out, [0.0; 4]);

        let source = CString::new(COPY_WORDS).unwrap();
        mgpu_load_kernel(ptr::null_mut(), source.as_ptr());
        mgpu_set_buffer(ptr::null_mut(), 0, ptr::null_mut());
        mgpu_dispatch(ptr::null_mut(), 1, 1, 1);

        mgpu_destroy_buffer(ptr::null_mut());
        mgpu_destroy_compute_shader(ptr::null_mut());
        mgpu_destroy_context(ptr::null_mut());

        // callbacks still fire so hosts waiting on them are released
        let before = NULL_CALLBACKS.load(Ordering::SeqCst);
        mgpu_read_async_int32(ptr::null_mut(), ptr::null_mut(), 4, 0, Some(on_null_operation));
        mgpu_dispatch_async(ptr::null_mut(), 1, 1, 1, Some(on_null_operation));
        mgpu_read_async_int32(ptr::null_mut(), ptr::null_mut(), 4, 0, None);
        assert_eq!(NULL_CALLBACKS.load(Ordering::SeqCst), before + 2);
    }
}

#[test]
fn full_flow_through_the_c_boundary() {
    init_logging();

    let context = mgpu_initialize_context();
    if context.is_null() {
        eprintln!("skipping: no GPU adapter available");
        return;
    }

    unsafe {
        // negative lengths are rejected
        assert!(mgpu_create_buffer(context, -1, type_code::INT8).is_null());

        let input = mgpu_create_buffer(context, 16, type_code::INT8);
        let output = mgpu_create_buffer(context, 16, type_code::INT8);
        assert!(!input.is_null() && !output.is_null());

        let values: [i8; 16] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, -1, -2, -3, -4, -5, -6];
        mgpu_write_int8(input, values.as_ptr(), values.len());

        let shader = mgpu_create_compute_shader(context);
        assert_eq!(mgpu_has_kernel(shader), 0);
        let source = CString::new(COPY_WORDS).unwrap();
        mgpu_load_kernel(shader, source.as_ptr());
        assert_eq!(mgpu_has_kernel(shader), 1);

        mgpu_set_buffer(shader, 0, input);
        mgpu_set_buffer(shader, 1, output);
        mgpu_set_buffer(shader, -3, output);
        mgpu_dispatch(shader, 1, 1, 1);

        let mut out = [0i8; 16];
        mgpu_read_sync_int8(output, out.as_mut_ptr(), 16, 0);
        assert_eq!(out, values);

        // partial read past the end is clamped
        let mut tail = [0i8; 8];
        mgpu_read_sync_int8(output, tail.as_mut_ptr(), 8, 12);
        assert_eq!(tail[..4], values[12..]);
        assert_eq!(tail[4..], [0; 4]);

        let dispatched = DISPATCHES_DONE.load(Ordering::SeqCst);
        mgpu_dispatch_async(shader, 1, 1, 1, Some(on_dispatch));
        // rejected dispatches still complete
        mgpu_dispatch_async(shader, -1, 1, 1, Some(on_dispatch));
        assert!(wait_for(&DISPATCHES_DONE, dispatched + 2));

        let mut async_out = [0i8; 16];
        let reads = READS_DONE.load(Ordering::SeqCst);
        mgpu_read_async_int8(output, async_out.as_mut_ptr(), 16, 0, Some(on_read));
        assert!(wait_for(&READS_DONE, reads + 1));
        assert_eq!(async_out, values);

        mgpu_destroy_compute_shader(shader);
        mgpu_destroy_buffer(input);
        mgpu_destroy_buffer(output);
        mgpu_destroy_context(context);
    }
}

#[test]
fn typed_transfers_cover_every_scalar() {
    init_logging();

    let context = mgpu_initialize_context();
    if context.is_null() {
        eprintln!("skipping: no GPU adapter available");
        return;
    }

    unsafe {
        let buffer = mgpu_create_buffer(context, 0, type_code::INT16);

        let shorts = [-300i16, 300, i16::MIN];
        mgpu_write_int16(buffer, shorts.as_ptr(), shorts.len());
        let mut shorts_out = [0i16; 3];
        mgpu_read_sync_int16(buffer, shorts_out.as_mut_ptr(), 3, 0);
        assert_eq!(shorts_out, shorts);

        let bytes = [0u8, 200, 255];
        mgpu_write_uint8(buffer, bytes.as_ptr(), bytes.len());
        let mut bytes_out = [0u8; 3];
        mgpu_read_sync_uint8(buffer, bytes_out.as_mut_ptr(), 3, 0);
        assert_eq!(bytes_out, bytes);

        let longs = [i64::MIN, 42, -42];
        mgpu_write_int64(buffer, longs.as_ptr(), longs.len());
        let mut longs_out = [0i64; 3];
        mgpu_read_sync_int64(buffer, longs_out.as_mut_ptr(), 3, 0);
        assert_eq!(longs_out, longs);

        let doubles = [0.25f64, -1.5e300, 3.0];
        mgpu_write_float64(buffer, doubles.as_ptr(), doubles.len());
        let mut doubles_out = [0f64; 3];
        mgpu_read_sync_float64(buffer, doubles_out.as_mut_ptr(), 3, 0);
        assert_eq!(doubles_out, doubles);

        // wrong-type reads leave the output untouched
        let mut wrong = [7u32; 3];
        mgpu_read_sync_uint32(buffer, wrong.as_mut_ptr(), 3, 0);
        assert_eq!(wrong, [7; 3]);

        mgpu_destroy_buffer(buffer);
        mgpu_destroy_context(context);
    }
}
