//! Integration tests for structure copies and portable (de)serialization.

mod common;

use common::*;
use rtaccel::bvh::format::{SerializationHeader, SERIALIZATION_HEADER_SIZE};
use rtaccel::bvh::geometry::GEOMETRY_OPAQUE;
use rtaccel::prelude::*;

/// Two-level scene: a box list instanced twice, plus a plain triangle
/// structure. Returns the top level and the triangle structure.
fn scene(heap: &mut Heap) -> (AccelerationStructure, AccelerationStructure) {
    let tri_bytes: Vec<u8> = bytemuck::cast_slice(&UNIT_TRIANGLE).to_vec();
    let (tri, _) = build_host(heap, &[host_triangles(&tri_bytes, GEOMETRY_OPAQUE)], &[1]);

    let boxes: [f32; 6] = [-0.5, -0.5, -0.5, 0.5, 0.5, 0.5];
    let box_bytes = bytemuck::cast_slice(&boxes).to_vec();
    let (blas, _) = build_host(heap, &[host_aabbs(&box_bytes, GEOMETRY_OPAQUE)], &[1]);

    let records = [
        InstanceRecord::new(translation(-2.0, 0.0, 0.0), blas.address()),
        InstanceRecord::new(translation(2.0, 0.0, 0.0), blas.address()).with_custom_index(7),
        InstanceRecord::new(translation(0.0, 2.0, 0.0), tri.address()),
    ];
    let bytes = bytemuck::cast_slice(&records).to_vec();
    let (top, _) = build_host(heap, &[host_instances(&bytes)], &[3]);
    (top, tri)
}

fn probe_rays() -> Vec<(Vec3, Vec3)> {
    let mut rays = ray_grid(8, 3.0, -5.0);
    rays.push((Vec3::new(0.25, 2.25, -1.0), Vec3::Z));
    rays
}

fn serialize(heap: &Heap, accel: &AccelerationStructure) -> Vec<u8> {
    let device = Device::new(heap, Settings::default());
    let header = device.header(accel).unwrap();
    let mut blob = vec![0u8; header.serialization_size as usize];
    let written = device.copy_to_portable(accel, &mut blob).unwrap();
    assert!(written as u64 <= header.serialization_size);
    blob
}

#[test]
fn test_portable_roundtrip() {
    let mut heap = Heap::new(1 << 22);
    let (top, _) = scene(&mut heap);
    let blob = serialize(&heap, &top);

    let blob_header: SerializationHeader = bytemuck::pod_read_unaligned(&blob[..SERIALIZATION_HEADER_SIZE as usize]);
    assert_eq!(blob_header.instance_count, 3);
    assert_eq!(blob_header.compat, [0; 16]);

    let restored_region = heap.allocate(blob_header.compacted_size, MemoryKind::HostVisible).unwrap();
    let restored = {
        let device = Device::new(&heap, Settings::default());
        assert_eq!(device.check_compatibility(&blob), Compatibility::Compatible);
        let restored = device.create_structure(restored_region).unwrap();
        device.copy_from_portable(&blob, &restored).unwrap();

        let original = device.header(&top).unwrap();
        let header = device.header(&restored).unwrap();
        assert_eq!(header.compacted_size, original.compacted_size);
        assert_eq!(header.instance_count, original.instance_count);
        assert_eq!(header.aabb, original.aabb);
        restored
    };

    let rays = probe_rays();
    let before = trace(&mut heap, top.address(), &rays);
    let after = trace(&mut heap, restored.address(), &rays);
    assert_eq!(before, after);
    assert!(before.iter().filter(|h| h.is_some()).count() >= 3);
    assert!(before.iter().any(|h| h.is_none()));
}

#[test]
fn test_copy_is_byte_identical() {
    let mut heap = Heap::new(1 << 22);
    let (top, _) = scene(&mut heap);
    let size = {
        let device = Device::new(&heap, Settings::default());
        device.header(&top).unwrap().compacted_size
    };
    let dst_region = heap.allocate(size, MemoryKind::HostVisible).unwrap();

    let device = Device::new(&heap, Settings::default());
    let dst = device.create_structure(dst_region).unwrap();
    device.copy(&top, &dst).unwrap();
    assert_eq!(
        heap.read_bytes(top.address(), size as usize).unwrap(),
        heap.read_bytes(dst.address(), size as usize).unwrap()
    );
}

#[test]
fn test_zero_primitive_roundtrip() {
    let mut heap = Heap::new(1 << 20);
    let (empty, header) = build_host(&mut heap, &[host_aabbs(&[], 0)], &[0]);
    let blob = serialize(&heap, &empty);

    let copy_region = heap.allocate(header.compacted_size, MemoryKind::HostVisible).unwrap();
    let restored_region = heap.allocate(header.compacted_size, MemoryKind::HostVisible).unwrap();
    let device = Device::new(&heap, Settings::default());
    let copy = device.create_structure(copy_region).unwrap();
    let restored = device.create_structure(restored_region).unwrap();

    device.copy(&empty, &copy).unwrap();
    device.copy_from_portable(&blob, &restored).unwrap();
    for accel in [&copy, &restored] {
        let h = device.header(accel).unwrap();
        assert_eq!(h.compacted_size, header.compacted_size);
        assert_eq!(h.instance_count, 0);
    }
}

#[test]
fn test_foreign_blob_rejected() {
    let mut heap = Heap::new(1 << 20);
    let tri_bytes: Vec<u8> = bytemuck::cast_slice(&UNIT_TRIANGLE).to_vec();
    let (tri, header) = build_host(&mut heap, &[host_triangles(&tri_bytes, 0)], &[1]);
    let blob = serialize(&heap, &tri);
    let dst_region = heap.allocate(header.compacted_size, MemoryKind::HostVisible).unwrap();

    let other = Device::with_uuid(&heap, Settings::default(), [0x5A; 16]);
    assert_eq!(other.check_compatibility(&blob), Compatibility::Incompatible);
    let dst = other.create_structure(dst_region).unwrap();
    assert!(matches!(other.copy_from_portable(&blob, &dst), Err(Error::Incompatible)));

    // a non-zero second half is never compatible
    let mut tampered = blob.clone();
    tampered[20] = 1;
    let device = Device::new(&heap, Settings::default());
    assert_eq!(device.check_compatibility(&tampered), Compatibility::Incompatible);
    assert_eq!(device.check_compatibility(&blob[..16]), Compatibility::Incompatible);
}

#[test]
fn test_recorded_copies_match_host() {
    let mut heap = Heap::new(1 << 22);
    let (top, _) = scene(&mut heap);
    let host_blob = serialize(&heap, &top);
    let header = Device::new(&heap, Settings::default()).header(&top).unwrap();

    let blob_region = heap.allocate(header.serialization_size, MemoryKind::DeviceLocal).unwrap();
    let copy_region = heap.allocate(header.compacted_size, MemoryKind::DeviceLocal).unwrap();
    let restored_region = heap.allocate(header.compacted_size, MemoryKind::DeviceLocal).unwrap();

    let device = Device::new(&heap, Settings::default());
    let copy = device.create_structure(copy_region).unwrap();
    let restored = device.create_structure(restored_region).unwrap();

    let mut cmd = CommandBuffer::new();
    device.cmd_copy(&mut cmd, &top, &copy);
    device.cmd_copy_to_portable(&mut cmd, &top, blob_region.address);
    device.cmd_copy_from_portable(&mut cmd, blob_region.address, &restored);
    Queue::new(&heap, true).submit(&cmd).unwrap();

    let n = header.compacted_size as usize;
    let original = heap.read_bytes(top.address(), n).unwrap();
    assert_eq!(heap.read_bytes(copy.address(), n).unwrap(), original);
    assert_eq!(heap.read_bytes(restored.address(), n).unwrap(), original);

    let device_blob = heap.read_bytes(blob_region.address, host_blob.len()).unwrap();
    let table = SERIALIZATION_HEADER_SIZE as usize + 8 * header.instance_count as usize;
    assert_eq!(device_blob[..16], host_blob[..16]);
    assert_eq!(device_blob[table..table + n], host_blob[table..table + n]);
}

#[test]
fn test_corrupt_instance_count_rejected() {
    let mut heap = Heap::new(1 << 20);
    let tri_bytes: Vec<u8> = bytemuck::cast_slice(&UNIT_TRIANGLE).to_vec();
    let (tri, header) = build_host(&mut heap, &[host_triangles(&tri_bytes, 0)], &[1]);
    let mut blob = serialize(&heap, &tri);
    let dst_region = heap.allocate(header.compacted_size, MemoryKind::HostVisible).unwrap();

    let device = Device::new(&heap, Settings::default());
    let dst = device.create_structure(dst_region).unwrap();
    for count in [1u64 << 61, u64::MAX, 1000] {
        blob[48..56].copy_from_slice(&count.to_le_bytes());
        assert_eq!(device.check_compatibility(&blob), Compatibility::Compatible);
        let err = device.copy_from_portable(&blob, &dst).unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)), "count {count}: {err:?}");
    }
}
