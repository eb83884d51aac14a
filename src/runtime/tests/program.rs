//! Program build pipeline: cache, binaries, compile/link, build info.

mod common;

use common::*;

use rocl::{
    ArgValue, BinaryType, BuildStatus, CommandQueue, Context, Kernel, MemFlags, Program,
    QueueProperties, Resource,
};
use rocl_backend_null::AdapterOptions;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const IOTA_SRC: &str = r#"
kernel void iota(global int* out) {
    out[get_global_id(0)] = get_global_id(0);
}
"#;

#[test]
fn shader_cache_serves_the_second_build() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_with(
        vec![AdapterOptions::default()],
        Some(dir.path().to_path_buf()),
        QueueProperties::empty(),
    );

    // Cold build: one compile, stored in the cache.
    let first = Program::create_with_source(&h.context, IOTA_SRC);
    Program::build(&first, None, "-DX=1", None).unwrap();
    assert_eq!(h.compiler.compile_count(), 1);
    drop(first);

    // A fresh context on the same device and cache directory.
    let context = Context::create(&h.platform, &[h.device.clone()], Vec::new(), None).unwrap();
    let second = Program::create_with_source(&context, IOTA_SRC);
    Program::build(&second, None, "-DX=1", None).unwrap();
    assert_eq!(
        h.compiler.compile_count(),
        1,
        "second build must be a cache hit"
    );

    // Different defines are a different cache key.
    let third = Program::create_with_source(&context, IOTA_SRC);
    Program::build(&third, None, "-DX=2", None).unwrap();
    assert_eq!(h.compiler.compile_count(), 2);
}

#[test]
fn binaries_round_trip_through_export_and_import() {
    let h = harness();
    let program = build_program(&h, IOTA_SRC);
    let exported = program.binaries();
    assert_eq!(exported.len(), 1);
    assert_eq!(program.binary_type(&h.device), BinaryType::Executable);

    let (device, blob) = &exported[0];
    let imported =
        Program::create_with_binary(&h.context, &[device.clone()], &[blob.as_slice()]).unwrap();
    Program::build(&imported, None, "", None).unwrap();

    // Same kernels, same argument shapes.
    assert_eq!(imported.kernel_names(), program.kernel_names());
    let kernel = Kernel::create(&imported, "iota").unwrap();
    assert_eq!(kernel.arg_count(), 1);

    // Imported programs execute.
    let out = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 64, None).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(Some(out.clone()))).unwrap();
    rocl::enqueue_nd_range_kernel(&h.queue, &kernel, 1, None, &[16], None, &[]).unwrap();
    CommandQueue::finish(&h.queue).unwrap();
    assert_eq!(read_u32s(&h, &out, 16), (0..16).collect::<Vec<u32>>());
}

#[test]
fn corrupt_binary_is_rejected() {
    let h = harness();
    let program = build_program(&h, IOTA_SRC);
    let (device, mut blob) = program.binaries().remove(0);
    blob[0] ^= 0xff;
    let err = Program::create_with_binary(&h.context, &[device], &[blob.as_slice()])
        .unwrap_err();
    assert_eq!(err.code, rocl::error::INVALID_BINARY);
}

#[test]
fn compile_then_link_produces_an_executable() {
    let h = harness();
    let program = Program::create_with_source(&h.context, IOTA_SRC);
    Program::compile(&program, None, "", &[], None).unwrap();
    assert_eq!(program.binary_type(&h.device), BinaryType::CompiledObject);
    assert!(program.kernel_names().is_empty());

    let linked = Program::link(&h.context, "", std::slice::from_ref(&program), None).unwrap();
    assert_eq!(linked.binary_type(&h.device), BinaryType::Executable);
    assert_eq!(linked.kernel_names(), vec!["iota".to_string()]);
    assert!(h.compiler.link_count() >= 1);

    // Libraries skip kernel creation.
    let library = Program::link(
        &h.context,
        "-create-library",
        std::slice::from_ref(&program),
        None,
    )
    .unwrap();
    assert_eq!(library.binary_type(&h.device), BinaryType::Library);
    assert!(library.kernel_names().is_empty());
}

#[test]
fn failed_build_reports_status_and_log() {
    let h = harness();
    let program = Program::create_with_source(&h.context, "kernel void broken() {\n#error nope\n}");
    let err = Program::build(&program, None, "", None).unwrap_err();
    assert_eq!(err.code, rocl::error::BUILD_PROGRAM_FAILURE);
    assert_eq!(program.build_status(&h.device), BuildStatus::Error);
    assert!(program.build_log(&h.device).contains("#error"));

    let kernel_err = Kernel::create(&program, "broken").unwrap_err();
    assert_eq!(kernel_err.code, rocl::error::INVALID_PROGRAM_EXECUTABLE);
}

#[test]
fn async_build_fires_the_notify_callback() {
    let h = harness();
    let program = Program::create_with_source(&h.context, IOTA_SRC);
    let fired = Arc::new(AtomicBool::new(false));
    let observer = Arc::clone(&fired);
    Program::build(
        &program,
        None,
        "",
        Some(Box::new(move |program| {
            observer.store(true, Ordering::SeqCst);
            assert!(program.has_successful_build());
        })),
    )
    .unwrap();

    // The callback runs on the compile pool.
    for _ in 0..200 {
        if fired.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(program.build_status(&h.device), BuildStatus::Success);
}

#[test]
fn build_options_are_recorded() {
    let h = harness();
    let program = Program::create_with_source(&h.context, IOTA_SRC);
    Program::build(&program, None, "-DX=1 -cl-mad-enable", None).unwrap();
    assert_eq!(program.build_options(&h.device), "-DX=1 -cl-mad-enable");

    let err = Program::build(&program, None, "-definitely-not-an-option", None).unwrap_err();
    assert_eq!(err.code, rocl::error::INVALID_BUILD_OPTIONS);
}

#[test]
fn kernel_metadata_is_queryable() {
    let h = harness();
    let program = build_program(&h, IOTA_SRC);
    let kernel = Kernel::create(&program, "iota").unwrap();
    let info = kernel.arg_info(0).unwrap();
    assert_eq!(info.name, "out");
    assert_eq!(info.address_space, rocl::compiler::AddressSpace::Global);
    assert!(kernel.arg_info(1).is_err());

    let unknown = Kernel::create(&program, "no_such_kernel").unwrap_err();
    assert_eq!(unknown.code, rocl::error::INVALID_KERNEL_NAME);

    let all = Kernel::create_all(&program).unwrap();
    assert_eq!(all.len(), 1);

    let copy = Kernel::clone_kernel(&all[0]);
    assert_eq!(copy.name(), "iota");
    assert_eq!(program.live_kernel_count(), 3);
}
