//! End-to-end kernel launch scenarios against the null backend.

mod common;

use common::*;

use rocl::{ArgValue, Kernel, MemFlags, Program, QueueProperties, Resource};
use rocl_backend_null::AdapterOptions;
use rocl_hal::Limits;

const ADD_SRC: &str = r#"
kernel void add(global int* a, global int* b, global int* c) {
    int i = get_global_id(0);
    c[i] = a[i] + b[i];
}
"#;

const IOTA_SRC: &str = r#"
kernel void iota(global int* out) {
    out[get_global_id(0)] = get_global_id(0);
}
"#;

const SCALE_SRC: &str = r#"
kernel void scale(global int* src, global int* dst, int factor) {
    int i = get_global_id(0);
    dst[i] = src[i] * factor;
}
"#;

#[test]
fn simple_vector_add() {
    let h = harness();
    let program = build_program(&h, ADD_SRC);
    let kernel = Kernel::create(&program, "add").unwrap();

    let a = Resource::create_buffer(
        &h.context,
        MemFlags::READ_ONLY | MemFlags::COPY_HOST_PTR,
        16,
        Some(&u32s_to_bytes(&[1, 2, 3, 4])),
    )
    .unwrap();
    let b = Resource::create_buffer(
        &h.context,
        MemFlags::READ_ONLY | MemFlags::COPY_HOST_PTR,
        16,
        Some(&u32s_to_bytes(&[10, 20, 30, 40])),
    )
    .unwrap();
    let c = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 16, None).unwrap();

    kernel.set_arg(0, ArgValue::Buffer(Some(a))).unwrap();
    kernel.set_arg(1, ArgValue::Buffer(Some(b))).unwrap();
    kernel.set_arg(2, ArgValue::Buffer(Some(c.clone()))).unwrap();

    rocl::enqueue_nd_range_kernel(&h.queue, &kernel, 1, None, &[4], None, &[]).unwrap();
    rocl::CommandQueue::finish(&h.queue).unwrap();

    assert_eq!(read_u32s(&h, &c, 4), vec![11, 22, 33, 44]);
}

#[test]
fn scalar_arguments_reach_the_kernel() {
    let h = harness();
    let program = build_program(&h, SCALE_SRC);
    let kernel = Kernel::create(&program, "scale").unwrap();

    let src = Resource::create_buffer(
        &h.context,
        MemFlags::READ_ONLY | MemFlags::COPY_HOST_PTR,
        16,
        Some(&u32s_to_bytes(&[1, 2, 3, 4])),
    )
    .unwrap();
    let dst = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 16, None).unwrap();

    kernel.set_arg(0, ArgValue::Buffer(Some(src))).unwrap();
    kernel.set_arg(1, ArgValue::Buffer(Some(dst.clone()))).unwrap();
    kernel
        .set_arg(2, ArgValue::Bytes(3u32.to_le_bytes().to_vec()))
        .unwrap();

    rocl::enqueue_nd_range_kernel(&h.queue, &kernel, 1, None, &[4], None, &[]).unwrap();
    rocl::CommandQueue::finish(&h.queue).unwrap();

    assert_eq!(read_u32s(&h, &dst, 4), vec![3, 6, 9, 12]);
}

#[test]
fn oversized_launch_is_tiled_with_group_offsets() {
    // A small per-dimension dispatch cap forces the tiling path.
    let adapter = AdapterOptions {
        limits: Limits {
            max_dispatch_groups_per_dim: 64,
            ..Limits::default()
        },
        ..AdapterOptions::default()
    };
    let h = harness_with(vec![adapter], None, QueueProperties::empty());

    let global = 64 * 2;
    let program = build_program(&h, IOTA_SRC);
    let kernel = Kernel::create(&program, "iota").unwrap();
    let out =
        Resource::create_buffer(&h.context, MemFlags::READ_WRITE, global * 4, None).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(Some(out.clone()))).unwrap();

    // local = 1 so the dispatch count equals the global size, exceeding
    // the 64-group cap and splitting into two sub-dispatches.
    rocl::enqueue_nd_range_kernel(&h.queue, &kernel, 1, None, &[global], Some(&[1]), &[])
        .unwrap();
    rocl::CommandQueue::finish(&h.queue).unwrap();

    let values = read_u32s(&h, &out, global as usize);
    let expected: Vec<u32> = (0..global as u32).collect();
    assert_eq!(values, expected);
}

#[test]
fn zero_global_size_completes_without_dispatch() {
    let h = harness();
    let program = build_program(&h, IOTA_SRC);
    let kernel = Kernel::create(&program, "iota").unwrap();
    let out = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 16, None).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(Some(out.clone()))).unwrap();

    let event =
        rocl::enqueue_nd_range_kernel(&h.queue, &kernel, 1, None, &[0], None, &[]).unwrap();
    rocl::CommandQueue::finish(&h.queue).unwrap();
    assert_eq!(event.status_code(), 0);

    // Untouched: no dispatch ran.
    assert_eq!(read_u32s(&h, &out, 4), vec![0, 0, 0, 0]);
}

#[test]
fn oversized_local_size_is_rejected() {
    let h = harness();
    let program = build_program(&h, IOTA_SRC);
    let kernel = Kernel::create(&program, "iota").unwrap();
    let out = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 16, None).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(Some(out))).unwrap();

    // 2048 > the 1024 threads-per-group cap.
    let err = rocl::enqueue_nd_range_kernel(
        &h.queue,
        &kernel,
        1,
        None,
        &[4096],
        Some(&[2048]),
        &[],
    )
    .unwrap_err();
    assert_eq!(err.code, rocl::error::INVALID_WORK_ITEM_SIZE);

    // A 2D local size whose product exceeds the cap but whose dimensions
    // fit individually trips the group-size check instead.
    let err = rocl::enqueue_nd_range_kernel(
        &h.queue,
        &kernel,
        2,
        None,
        &[1024, 1024],
        Some(&[1024, 2]),
        &[],
    )
    .unwrap_err();
    assert_eq!(err.code, rocl::error::INVALID_WORK_GROUP_SIZE);
}

#[test]
fn required_size_mismatch_is_rejected() {
    let h = harness();
    let source = r#"
kernel __attribute__((reqd_work_group_size(8, 1, 1))) void iota(global int* out) {
    out[get_global_id(0)] = get_global_id(0);
}
"#;
    let program = build_program(&h, source);
    let kernel = Kernel::create(&program, "iota").unwrap();
    assert_eq!(kernel.required_work_group_size(), Some([8, 1, 1]));
    let out = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 256, None).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(Some(out.clone()))).unwrap();

    let err = rocl::enqueue_nd_range_kernel(&h.queue, &kernel, 1, None, &[64], Some(&[4]), &[])
        .unwrap_err();
    assert_eq!(err.code, rocl::error::INVALID_WORK_GROUP_SIZE);

    // The declared size is used when the caller leaves it unspecified.
    rocl::enqueue_nd_range_kernel(&h.queue, &kernel, 1, None, &[64], None, &[]).unwrap();
    rocl::CommandQueue::finish(&h.queue).unwrap();
    let values = read_u32s(&h, &out, 64);
    assert_eq!(values, (0..64).collect::<Vec<u32>>());
}

#[test]
fn unset_arguments_fail_the_enqueue() {
    let h = harness();
    let program = build_program(&h, ADD_SRC);
    let kernel = Kernel::create(&program, "add").unwrap();
    let err =
        rocl::enqueue_nd_range_kernel(&h.queue, &kernel, 1, None, &[4], None, &[]).unwrap_err();
    assert_eq!(err.code, rocl::error::INVALID_KERNEL_ARGS);
}

#[test]
fn specializations_are_cached_per_launch_shape() {
    let h = harness();
    let program = build_program(&h, IOTA_SRC);
    let kernel = Kernel::create(&program, "iota").unwrap();
    let out = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 1024, None).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(Some(out))).unwrap();

    // Build compiled one generic variant per kernel.
    let generic = h.compiler.kernel_compile_count();

    rocl::enqueue_nd_range_kernel(&h.queue, &kernel, 1, None, &[64], Some(&[8]), &[]).unwrap();
    rocl::CommandQueue::finish(&h.queue).unwrap();
    let after_first = h.compiler.kernel_compile_count();
    assert_eq!(after_first, generic + 1);

    // Same shape again: served from the specialization cache.
    rocl::enqueue_nd_range_kernel(&h.queue, &kernel, 1, None, &[64], Some(&[8]), &[]).unwrap();
    rocl::CommandQueue::finish(&h.queue).unwrap();
    assert_eq!(h.compiler.kernel_compile_count(), after_first);

    // A different local size is a different specialization.
    rocl::enqueue_nd_range_kernel(&h.queue, &kernel, 1, None, &[64], Some(&[16]), &[]).unwrap();
    rocl::CommandQueue::finish(&h.queue).unwrap();
    assert_eq!(h.compiler.kernel_compile_count(), after_first + 1);
}

#[test]
fn rebuild_blocked_while_kernels_live() {
    let h = harness();
    let program = build_program(&h, IOTA_SRC);
    let kernel = Kernel::create(&program, "iota").unwrap();

    let err = Program::build(&program, None, "", None).unwrap_err();
    assert_eq!(err.code, rocl::error::INVALID_OPERATION);

    drop(kernel);
    Program::build(&program, None, "", None).unwrap();
}

#[test]
fn printf_kernel_completes_and_replays_records() {
    let h = harness();
    let source = r#"
kernel void say(global int* data) {
    printf("gid=%d\n", get_global_id(0));
}
"#;
    let program = build_program(&h, source);
    let kernel = Kernel::create(&program, "say").unwrap();
    let data = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 16, None).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(Some(data))).unwrap();

    let event =
        rocl::enqueue_nd_range_kernel(&h.queue, &kernel, 1, None, &[4], Some(&[4]), &[]).unwrap();
    rocl::CommandQueue::finish(&h.queue).unwrap();
    assert_eq!(event.status_code(), 0);
}
