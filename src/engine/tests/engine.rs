//! Engine integration against the null backend.

use rocl_backend_null::{AdapterOptions, Backend as Null, Instance};
use rocl_engine::{DeviceResources, DeviceShared, EngineOptions, ImmediateContext};
use rocl_hal::{Adapter as _, HeapKind, Instance as _};

use std::sync::Arc;

fn open(options: AdapterOptions) -> (Arc<DeviceShared<Null>>, Arc<rocl_backend_null::Adapter>) {
    let instance = Instance::new(vec![options]);
    let adapter = Arc::new(instance.enumerate_adapters().remove(0));
    let gpu = adapter.open().unwrap();
    let shared = Arc::new(DeviceShared {
        device: gpu.device,
        queue: gpu.queue,
        adapter: Arc::clone(&adapter),
        limits: adapter.limits(),
    });
    (shared, adapter)
}

fn context(options: AdapterOptions) -> ImmediateContext<Null> {
    let (shared, _) = open(options);
    let resources = Arc::new(DeviceResources::new(shared, EngineOptions::default()));
    ImmediateContext::new(resources).unwrap()
}

#[test]
fn upload_copy_readback_round_trip() {
    let mut ctx = context(AdapterOptions::default());
    let buffer = ctx.resources.create_buffer(64, false).unwrap();

    let data: Vec<u8> = (0..64).collect();
    ctx.upload_to_buffer(&buffer, 0, &data).unwrap();
    let staging = ctx.copy_to_readback(&buffer, 0, 64).unwrap();
    ctx.wait_for_completion().unwrap();

    assert_eq!(ctx.read_staging(&staging).unwrap(), data);
    ctx.resources.destroy_buffer(staging);
    ctx.resources.destroy_buffer(buffer);
}

#[test]
fn fill_writes_the_pattern() {
    let mut ctx = context(AdapterOptions::default());
    let buffer = ctx.resources.create_buffer(16, false).unwrap();
    ctx.fill_buffer(&buffer, 0, 16, &[0xab, 0xcd]).unwrap();
    let staging = ctx.copy_to_readback(&buffer, 0, 16).unwrap();
    ctx.wait_for_completion().unwrap();
    let bytes = ctx.read_staging(&staging).unwrap();
    assert!(bytes.chunks_exact(2).all(|c| c == [0xab, 0xcd]));
    ctx.resources.destroy_buffer(staging);
    ctx.resources.destroy_buffer(buffer);
}

#[test]
fn deferred_deletion_waits_for_the_fence() {
    let mut ctx = context(AdapterOptions::default());
    let buffer = ctx.resources.create_buffer(64, false).unwrap();
    ctx.upload_to_buffer(&buffer, 0, &[1u8; 64]).unwrap();
    ctx.resources.destroy_buffer(buffer);

    // The copy is still in the open command list; nothing can be freed
    // yet. After the flush and wait, the trim pass drains it.
    ctx.wait_for_completion().unwrap();
    ctx.resources.drain_deferred();
}

#[test]
fn staging_blocks_come_from_the_pool() {
    let mut ctx = context(AdapterOptions::default());
    let a = ctx
        .resources
        .allocate_staging(HeapKind::Upload, 4096, false)
        .unwrap();
    let b = ctx
        .resources
        .allocate_staging(HeapKind::Upload, 4096, false)
        .unwrap();
    // Pooled blocks share one heap allocation at different offsets.
    assert!(std::ptr::eq(a.memory() as *const _, b.memory() as *const _));
    assert_ne!(a.offset(), b.offset());

    // Over-threshold requests get dedicated memory.
    let big = ctx
        .resources
        .allocate_staging(HeapKind::Upload, 64 * 1024 * 1024, false)
        .unwrap();
    assert!(!std::ptr::eq(a.memory() as *const _, big.memory() as *const _));

    ctx.resources.destroy_buffer(a);
    ctx.resources.destroy_buffer(b);
    ctx.resources.destroy_buffer(big);
    ctx.wait_for_completion().unwrap();
    ctx.resources.drain_deferred();
}

#[test]
fn residency_tracks_and_survives_submissions() {
    // A tight budget with everything still fitting.
    let mut options = AdapterOptions::default();
    options.budget = 1 << 20;
    let mut ctx = context(options);

    let buffer = ctx.resources.create_buffer(1024, false).unwrap();
    ctx.upload_to_buffer(&buffer, 0, &[7u8; 1024]).unwrap();
    ctx.wait_for_completion().unwrap();

    let staging = ctx.copy_to_readback(&buffer, 0, 1024).unwrap();
    ctx.wait_for_completion().unwrap();
    assert_eq!(ctx.read_staging(&staging).unwrap(), vec![7u8; 1024]);

    ctx.resources.destroy_buffer(staging);
    ctx.resources.destroy_buffer(buffer);
}
