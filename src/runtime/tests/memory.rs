//! Buffer, image, and map/unmap transfers.

mod common;

use common::*;

use rocl::{
    enqueue_copy_buffer, enqueue_fill_buffer, enqueue_map_buffer, enqueue_read_buffer_rect,
    enqueue_unmap, enqueue_write_buffer, enqueue_write_buffer_rect, read_buffer_blocking,
    BufferRect, ChannelOrder, ChannelType, CommandQueue, ImageFormat, MapFlags, MemFlags,
    Resource, ResourceKind,
};

#[test]
fn write_then_read_round_trips() {
    let h = harness();
    let buffer = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 64, None).unwrap();
    let data: Vec<u8> = (0..64).collect();

    enqueue_write_buffer(&h.queue, &buffer, false, 0, &data, &[]).unwrap();
    let mut out = vec![0u8; 64];
    read_buffer_blocking(&h.queue, &buffer, 0, &mut out, &[]).unwrap();
    assert_eq!(out, data);
}

#[test]
fn copy_between_buffers() {
    let h = harness();
    let data = u32s_to_bytes(&[5, 6, 7, 8]);
    let src = Resource::create_buffer(
        &h.context,
        MemFlags::READ_ONLY | MemFlags::COPY_HOST_PTR,
        16,
        Some(&data),
    )
    .unwrap();
    let dst = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 16, None).unwrap();

    enqueue_copy_buffer(&h.queue, &src, &dst, 0, 0, 16, &[]).unwrap();
    CommandQueue::finish(&h.queue).unwrap();
    assert_eq!(read_u32s(&h, &dst, 4), vec![5, 6, 7, 8]);
}

#[test]
fn overlapping_self_copy_is_rejected() {
    let h = harness();
    let buffer = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 64, None).unwrap();
    let err = enqueue_copy_buffer(&h.queue, &buffer, &buffer, 0, 8, 16, &[]).unwrap_err();
    assert_eq!(err.code, rocl::error::MEM_COPY_OVERLAP);
    // Disjoint ranges of the same buffer are fine.
    enqueue_copy_buffer(&h.queue, &buffer, &buffer, 0, 32, 16, &[]).unwrap();
    CommandQueue::finish(&h.queue).unwrap();
}

#[test]
fn fill_repeats_the_pattern() {
    let h = harness();
    let buffer = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 32, None).unwrap();
    enqueue_fill_buffer(&h.queue, &buffer, &0xdeadbeefu32.to_le_bytes(), 0, 32, &[]).unwrap();
    CommandQueue::finish(&h.queue).unwrap();
    assert_eq!(read_u32s(&h, &buffer, 8), vec![0xdeadbeef; 8]);

    let err =
        enqueue_fill_buffer(&h.queue, &buffer, &[1, 2, 3], 0, 32, &[]).unwrap_err();
    assert_eq!(err.code, rocl::error::INVALID_VALUE);
}

#[test]
fn rect_write_and_read_address_rows() {
    let h = harness();
    // A 4x4 byte "surface" with a 4-byte row pitch.
    let buffer = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 16, None).unwrap();
    enqueue_fill_buffer(&h.queue, &buffer, &[0u8], 0, 16, &[]).unwrap();

    // Write a 2x2 block into the middle.
    let rect = BufferRect {
        buffer_origin: [1, 1, 0],
        host_origin: [0, 0, 0],
        region: [2, 2, 1],
        buffer_row_pitch: 4,
        buffer_slice_pitch: 0,
        host_row_pitch: 2,
        host_slice_pitch: 0,
    };
    enqueue_write_buffer_rect(&h.queue, &buffer, false, rect, &[9, 8, 7, 6], &[]).unwrap();
    CommandQueue::finish(&h.queue).unwrap();

    let mut all = vec![0u8; 16];
    read_buffer_blocking(&h.queue, &buffer, 0, &mut all, &[]).unwrap();
    assert_eq!(
        all,
        vec![
            0, 0, 0, 0, //
            0, 9, 8, 0, //
            0, 7, 6, 0, //
            0, 0, 0, 0,
        ]
    );

    // Read the same block back out.
    let mut block = [0u8; 4];
    unsafe {
        enqueue_read_buffer_rect(&h.queue, &buffer, true, rect, block.as_mut_ptr(), &[])
            .unwrap();
    }
    assert_eq!(block, [9, 8, 7, 6]);
}

#[test]
fn map_for_reading_sees_buffer_contents() {
    let h = harness();
    let data = u32s_to_bytes(&[1, 2, 3, 4]);
    let buffer = Resource::create_buffer(
        &h.context,
        MemFlags::READ_WRITE | MemFlags::COPY_HOST_PTR,
        16,
        Some(&data),
    )
    .unwrap();

    let (_event, ptr) =
        enqueue_map_buffer(&h.queue, &buffer, true, MapFlags::READ, 0, 16, &[]).unwrap();
    let mapped = unsafe { std::slice::from_raw_parts(ptr, 16) };
    assert_eq!(mapped, &data[..]);
    assert_eq!(buffer.map_count(), 1);

    enqueue_unmap(&h.queue, &buffer, ptr, &[]).unwrap();
    CommandQueue::finish(&h.queue).unwrap();
    assert_eq!(buffer.map_count(), 0);
}

#[test]
fn map_write_unmap_updates_the_buffer() {
    let h = harness();
    let buffer = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 16, None).unwrap();

    let (_event, ptr) = enqueue_map_buffer(
        &h.queue,
        &buffer,
        true,
        MapFlags::WRITE_INVALIDATE_REGION,
        0,
        16,
        &[],
    )
    .unwrap();
    unsafe {
        std::slice::from_raw_parts_mut(ptr, 16).copy_from_slice(&u32s_to_bytes(&[7, 7, 7, 7]));
    }
    enqueue_unmap(&h.queue, &buffer, ptr, &[]).unwrap();
    CommandQueue::finish(&h.queue).unwrap();

    assert_eq!(read_u32s(&h, &buffer, 4), vec![7, 7, 7, 7]);
}

#[test]
fn unmap_of_unknown_pointer_is_rejected() {
    let h = harness();
    let buffer = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 16, None).unwrap();
    let mut bogus = 0u8;
    let err = enqueue_unmap(&h.queue, &buffer, &mut bogus, &[]).unwrap_err();
    assert_eq!(err.code, rocl::error::INVALID_VALUE);
}

#[test]
fn sub_buffer_aliases_its_parent_region() {
    let h = harness();
    let parent = Resource::create_buffer(
        &h.context,
        MemFlags::READ_WRITE | MemFlags::COPY_HOST_PTR,
        32,
        Some(&u32s_to_bytes(&[0, 1, 2, 3, 4, 5, 6, 7])),
    )
    .unwrap();
    let sub = Resource::create_sub_buffer(&parent, MemFlags::READ_WRITE, 8, 16).unwrap();

    // Writes through the sub-buffer land in the parent.
    enqueue_write_buffer(&h.queue, &sub, false, 0, &u32s_to_bytes(&[90, 91]), &[]).unwrap();
    CommandQueue::finish(&h.queue).unwrap();
    assert_eq!(
        read_u32s(&h, &parent, 8),
        vec![0, 1, 90, 91, 4, 5, 6, 7]
    );

    // Reads through the sub-buffer window the parent.
    let mut out = vec![0u8; 16];
    read_buffer_blocking(&h.queue, &sub, 0, &mut out, &[]).unwrap();
    assert_eq!(out, u32s_to_bytes(&[90, 91, 4, 5]));

    // Nested sub-buffers are invalid.
    let err = Resource::create_sub_buffer(&sub, MemFlags::READ_WRITE, 0, 8).unwrap_err();
    assert_eq!(err.code, rocl::error::INVALID_MEM_OBJECT);
}

#[test]
fn buffer_validation_errors() {
    let h = harness();
    assert_eq!(
        Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 0, None)
            .unwrap_err()
            .code,
        rocl::error::INVALID_BUFFER_SIZE
    );
    assert_eq!(
        Resource::create_buffer(
            &h.context,
            MemFlags::READ_ONLY | MemFlags::WRITE_ONLY,
            16,
            None
        )
        .unwrap_err()
        .code,
        rocl::error::INVALID_VALUE
    );
    assert_eq!(
        Resource::create_buffer(&h.context, MemFlags::COPY_HOST_PTR, 16, None)
            .unwrap_err()
            .code,
        rocl::error::INVALID_HOST_PTR
    );
    let buffer = Resource::create_buffer(&h.context, MemFlags::READ_WRITE, 16, None).unwrap();
    assert_eq!(
        enqueue_write_buffer(&h.queue, &buffer, false, 8, &[0u8; 16], &[])
            .unwrap_err()
            .code,
        rocl::error::INVALID_VALUE
    );
}

#[test]
fn image_write_read_round_trip() {
    let h = harness();
    let format = ImageFormat {
        order: ChannelOrder::Rgba,
        channel_type: ChannelType::Unorm8,
    };
    let image = Resource::create_image(
        &h.context,
        MemFlags::READ_WRITE,
        format,
        ResourceKind::Image2D,
        4,
        4,
        1,
        None,
    )
    .unwrap();

    // Write a 2x2 texel block at (1, 1).
    let texels: Vec<u8> = (0..16).collect();
    rocl::enqueue_write_image(
        &h.queue,
        &image,
        false,
        [1, 1, 0],
        [2, 2, 1],
        0,
        0,
        &texels,
        &[],
    )
    .unwrap();
    CommandQueue::finish(&h.queue).unwrap();

    let mut out = vec![0u8; 16];
    unsafe {
        rocl::enqueue_read_image(
            &h.queue,
            &image,
            true,
            [1, 1, 0],
            [2, 2, 1],
            0,
            0,
            out.as_mut_ptr(),
            &[],
        )
        .unwrap();
    }
    assert_eq!(out, texels);

    // Out-of-bounds regions are rejected.
    let err = rocl::enqueue_write_image(
        &h.queue,
        &image,
        false,
        [3, 3, 0],
        [2, 2, 1],
        0,
        0,
        &texels,
        &[],
    )
    .unwrap_err();
    assert_eq!(err.code, rocl::error::INVALID_VALUE);
}

#[test]
fn image_fill_covers_the_region() {
    let h = harness();
    let format = ImageFormat {
        order: ChannelOrder::R,
        channel_type: ChannelType::Uint32,
    };
    let image = Resource::create_image(
        &h.context,
        MemFlags::READ_WRITE,
        format,
        ResourceKind::Image1D,
        8,
        1,
        1,
        None,
    )
    .unwrap();
    rocl::enqueue_fill_image(
        &h.queue,
        &image,
        &42u32.to_le_bytes(),
        [0, 0, 0],
        [8, 1, 1],
        &[],
    )
    .unwrap();
    CommandQueue::finish(&h.queue).unwrap();

    let mut out = vec![0u8; 32];
    unsafe {
        rocl::enqueue_read_image(
            &h.queue,
            &image,
            true,
            [0, 0, 0],
            [8, 1, 1],
            0,
            0,
            out.as_mut_ptr(),
            &[],
        )
        .unwrap();
    }
    let values: Vec<u32> = out
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(values, vec![42; 8]);
}
