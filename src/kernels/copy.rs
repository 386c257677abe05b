//! Copy / serialize / deserialize kernel.
//!
//! Invocations stride over the structure in 16-byte chunks. When a chunk
//! starts an instance node, its child pointer is split into (or rebuilt
//! from) the portable blob's pointer table.

use super::Invocation;
use crate::bvh::format::{
    AccelHeader, SerializationHeader, COPY_CHUNK_SIZE, INSTANCE_NODE_SIZE, INSTANCE_PTR_LOW_MASK,
    SERIALIZATION_HEADER_SIZE, WORKGROUP_SIZE,
};
use crate::memory::{DeviceAddress, DeviceMemory, MemoryExt};
use crate::util::{read_u64, write_u64, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Structure to structure.
    Copy,
    /// Structure to portable blob.
    Serialize,
    /// Portable blob to structure.
    Deserialize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyArgs {
    pub src_addr: DeviceAddress,
    pub dst_addr: DeviceAddress,
    pub mode: CopyMode,
}

/// Where the structure bytes sit on each side.
struct CopyLayout {
    compacted_size: u64,
    src_offset: u64,
    dst_offset: u64,
    instance_offset: u64,
    instance_count: u64,
}

fn table_size(instance_count: u64) -> Result<u64> {
    instance_count
        .checked_mul(8)
        .and_then(|n| n.checked_add(SERIALIZATION_HEADER_SIZE))
        .ok_or_else(|| Error::invalid(format!("instance count {instance_count} overflows the pointer table")))
}

fn offset_addr(base: DeviceAddress, offset: u64) -> Result<DeviceAddress> {
    base.checked_add(offset)
        .ok_or_else(|| Error::invalid(format!("offset {offset:#x} overflows address {base:#x}")))
}

fn layout(args: &CopyArgs, memory: &dyn DeviceMemory, inv: Invocation) -> Result<CopyLayout> {
    Ok(match args.mode {
        CopyMode::Copy => {
            let header: AccelHeader = memory.read_pod(args.src_addr)?;
            CopyLayout {
                compacted_size: header.compacted_size,
                src_offset: 0,
                dst_offset: 0,
                instance_offset: 0,
                instance_count: 0,
            }
        }
        CopyMode::Serialize => {
            let header: AccelHeader = memory.read_pod(args.src_addr)?;
            let count = header.instance_count as u64;
            if inv.global_id == 0 {
                // driver UUID and compat fields are filled in by the caller
                let blob = SerializationHeader {
                    serialization_size: header.serialization_size,
                    compacted_size: header.compacted_size,
                    instance_count: count,
                    ..Default::default()
                };
                memory.write(args.dst_addr + 32, &bytemuck::bytes_of(&blob)[32..])?;
            }
            CopyLayout {
                compacted_size: header.compacted_size,
                src_offset: 0,
                dst_offset: table_size(count)?,
                instance_offset: header.instance_offset,
                instance_count: count,
            }
        }
        CopyMode::Deserialize => {
            let blob: SerializationHeader = memory.read_pod(args.src_addr)?;
            let src_offset = table_size(blob.instance_count)?;
            let header: AccelHeader = memory.read_pod(offset_addr(args.src_addr, src_offset)?)?;
            CopyLayout {
                compacted_size: header.compacted_size,
                src_offset,
                dst_offset: 0,
                instance_offset: header.instance_offset,
                instance_count: blob.instance_count,
            }
        }
    })
}

pub(super) fn run(args: &CopyArgs, memory: &dyn DeviceMemory, inv: Invocation) -> Result<()> {
    let l = layout(args, memory, inv)?;
    let instance_bound = l
        .instance_count
        .checked_mul(INSTANCE_NODE_SIZE)
        .ok_or_else(|| Error::invalid("instance region overflows"))?;
    let src_base = offset_addr(args.src_addr, l.src_offset)?;
    let dst_base = offset_addr(args.dst_addr, l.dst_offset)?;
    let step = inv.workgroups as u64 * WORKGROUP_SIZE as u64 * COPY_CHUNK_SIZE;
    let mut offset = inv.global_id as u64 * COPY_CHUNK_SIZE;

    while offset < l.compacted_size {
        let mut chunk = [0u8; COPY_CHUNK_SIZE as usize];
        memory.read(offset_addr(src_base, offset)?, &mut chunk)?;

        let rel = offset.wrapping_sub(l.instance_offset);
        if offset >= l.instance_offset && rel < instance_bound && rel % INSTANCE_NODE_SIZE == 0 {
            let table_entry = SERIALIZATION_HEADER_SIZE + (rel / INSTANCE_NODE_SIZE) * 8;
            let ptr = read_u64(&chunk, 0);
            let relocated = match args.mode {
                CopyMode::Serialize => {
                    memory.write_u64(args.dst_addr + table_entry, ptr & !INSTANCE_PTR_LOW_MASK)?;
                    ptr & INSTANCE_PTR_LOW_MASK
                }
                CopyMode::Deserialize => {
                    let base = memory.read_u64(args.src_addr + table_entry)?;
                    (ptr & INSTANCE_PTR_LOW_MASK) | base
                }
                CopyMode::Copy => ptr,
            };
            write_u64(&mut chunk, 0, relocated);
        }

        memory.write(offset_addr(dst_base, offset)?, &chunk)?;
        offset += step;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::format::{InstanceNode, HEADER_PAD, ROOT_NODE_ID};
    use crate::memory::{Heap, MemoryKind};

    fn structure_with_instance(heap: &mut Heap) -> (u64, u64) {
        let src = heap.allocate(512, MemoryKind::DeviceLocal).unwrap();
        let mut header = AccelHeader {
            root_node_id: ROOT_NODE_ID,
            instance_offset: HEADER_PAD,
            ..Default::default()
        };
        header.set_sizes(HEADER_PAD + INSTANCE_NODE_SIZE, 1);
        heap.write_pod(src.address, &header).unwrap();
        let node = InstanceNode {
            base_ptr: 0xABCD_0000 | ROOT_NODE_ID as u64,
            instance_id: 0,
            ..bytemuck::Zeroable::zeroed()
        };
        heap.write_pod(src.address + HEADER_PAD, &node).unwrap();
        (src.address, header.serialization_size)
    }

    fn run_all(args: &CopyArgs, heap: &Heap, workgroups: u32) {
        for gid in 0..workgroups * WORKGROUP_SIZE {
            run(args, heap, Invocation { global_id: gid, workgroups }).unwrap();
        }
    }

    #[test]
    fn test_serialize_splits_pointer() {
        let mut heap = Heap::new(1 << 20);
        let (src, ser_size) = structure_with_instance(&mut heap);
        let blob = heap.allocate(ser_size, MemoryKind::DeviceLocal).unwrap();

        run_all(&CopyArgs { src_addr: src, dst_addr: blob.address, mode: CopyMode::Serialize }, &heap, 1);

        let h: SerializationHeader = heap.read_pod(blob.address).unwrap();
        assert_eq!(h.instance_count, 1);
        assert_eq!(h.compacted_size, HEADER_PAD + INSTANCE_NODE_SIZE);
        assert_eq!(heap.read_u64(blob.address + 56).unwrap(), 0xABCD_0000);
        let data = blob.address + 64;
        assert_eq!(heap.read_u64(data + HEADER_PAD).unwrap(), ROOT_NODE_ID as u64);
    }

    #[test]
    fn test_deserialize_relocates() {
        let mut heap = Heap::new(1 << 20);
        let (src, ser_size) = structure_with_instance(&mut heap);
        let blob = heap.allocate(ser_size, MemoryKind::DeviceLocal).unwrap();
        let dst = heap.allocate(512, MemoryKind::DeviceLocal).unwrap();

        run_all(&CopyArgs { src_addr: src, dst_addr: blob.address, mode: CopyMode::Serialize }, &heap, 1);
        heap.write_u64(blob.address + 56, 0x5555_0000).unwrap();
        run_all(&CopyArgs { src_addr: blob.address, dst_addr: dst.address, mode: CopyMode::Deserialize }, &heap, 2);

        let node: InstanceNode = heap.read_pod(dst.address + HEADER_PAD).unwrap();
        assert_eq!(node.base_ptr, 0x5555_0000 | ROOT_NODE_ID as u64);
        let header: AccelHeader = heap.read_pod(dst.address).unwrap();
        assert_eq!(header.instance_count, 1);
    }

    #[test]
    fn test_deserialize_rejects_overflowing_instance_count() {
        let mut heap = Heap::new(1 << 20);
        let (src, ser_size) = structure_with_instance(&mut heap);
        let blob = heap.allocate(ser_size, MemoryKind::DeviceLocal).unwrap();
        let dst = heap.allocate(512, MemoryKind::DeviceLocal).unwrap();

        run_all(&CopyArgs { src_addr: src, dst_addr: blob.address, mode: CopyMode::Serialize }, &heap, 1);
        heap.write_u64(blob.address + 48, 1u64 << 61).unwrap();
        let args = CopyArgs { src_addr: blob.address, dst_addr: dst.address, mode: CopyMode::Deserialize };
        let err = run(&args, &heap, Invocation { global_id: 0, workgroups: 1 }).unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
    }
}
