//! Leaf kernel: one invocation per primitive of one geometry.

use bytemuck::Zeroable;
use tracing::trace;

use super::Invocation;
use crate::bvh::format::{
    make_node_id, AabbNode, AccelHeader, InstanceNode, NodeType, TriangleNode, AABB_NODE_SIZE,
    INSTANCE_NODE_SIZE, TRIANGLE_NODE_MARKER, TRIANGLE_NODE_SIZE,
};
use crate::bvh::geometry::{
    read_aabb, read_instance, read_transform, BuildRange, ByteSource, DeviceSource, IndexType,
    InstanceRecord, TriangleSource, VertexFormat,
};
use crate::memory::{DeviceAddress, DeviceMemory, MemoryExt};
use crate::util::{invert_3x3, Aabb, Result, Rows3x4};

/// Primitive-specific leaf inputs. Addresses already include the build
/// range's primitive offset, first vertex and transform offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LeafPrimitive {
    Triangles {
        vertex_addr: DeviceAddress,
        vertex_stride: u64,
        vertex_format: VertexFormat,
        index_addr: DeviceAddress,
        index_type: IndexType,
        /// Zero when the geometry has no transform.
        transform_addr: DeviceAddress,
    },
    Aabbs {
        aabb_addr: DeviceAddress,
        stride: u64,
    },
    Instances {
        instance_addr: DeviceAddress,
        array_of_pointers: bool,
    },
}

impl LeafPrimitive {
    pub fn node_size(&self) -> u64 {
        match self {
            Self::Triangles { .. } => TRIANGLE_NODE_SIZE,
            Self::Aabbs { .. } => AABB_NODE_SIZE,
            Self::Instances { .. } => INSTANCE_NODE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeafArgs {
    /// Base of the structure being built.
    pub node_dst_addr: DeviceAddress,
    pub scratch_addr: DeviceAddress,
    /// Offset of this geometry's first leaf in the structure.
    pub dst_offset: u32,
    /// Offset of this geometry's first node id in scratch.
    pub dst_scratch_offset: u32,
    /// Geometry index with the flags in the top bits.
    pub geometry_id: u32,
    pub primitive: LeafPrimitive,
}

pub(super) fn run(args: &LeafArgs, memory: &dyn DeviceMemory, inv: Invocation) -> Result<()> {
    let p = inv.global_id;
    let offset = args.dst_offset as u64 + p as u64 * args.primitive.node_size();
    let node_addr = args.node_dst_addr + offset;
    // the range is folded into the addresses
    let range = BuildRange::default();

    let ty = match args.primitive {
        LeafPrimitive::Triangles {
            vertex_addr,
            vertex_stride,
            vertex_format,
            index_addr,
            index_type,
            transform_addr,
        } => {
            let vertices = DeviceSource { memory, base: vertex_addr };
            let indices = DeviceSource { memory, base: index_addr };
            let transform = if transform_addr != 0 {
                Some(read_transform(&DeviceSource { memory, base: transform_addr }, 0)?)
            } else {
                None
            };
            let source = TriangleSource {
                vertex_format,
                vertex_stride,
                index_type,
                vertices: &vertices,
                indices: (index_type != IndexType::None).then_some(&indices as &dyn ByteSource),
                transform,
            };
            let verts = source.triangle(&range, p)?;
            memory.write_pod(
                node_addr,
                &TriangleNode {
                    coords: verts.map(|v| v.to_array()),
                    reserved: [0; 3],
                    triangle_id: p,
                    geometry_id_and_flags: args.geometry_id,
                    reserved2: 0,
                    id: TRIANGLE_NODE_MARKER,
                },
            )?;
            NodeType::Triangle
        }
        LeafPrimitive::Aabbs { aabb_addr, stride } => {
            let aabb = read_aabb(&DeviceSource { memory, base: aabb_addr }, &range, stride, p)?;
            memory.write_pod(
                node_addr,
                &AabbNode {
                    aabb: aabb.to_array(),
                    primitive_id: p,
                    geometry_id_and_flags: args.geometry_id,
                    reserved: [0; 8],
                },
            )?;
            NodeType::Aabb
        }
        LeafPrimitive::Instances { instance_addr, array_of_pointers } => {
            let src = DeviceSource { memory, base: instance_addr };
            let record = read_instance(&src, Some(memory), &range, array_of_pointers, p)?;
            let node = if record.accel_reference != 0 {
                let child: AccelHeader = memory.read_pod(record.accel_reference)?;
                device_instance_node(&record, &child, p)
            } else {
                null_instance_node()
            };
            memory.write_pod(node_addr, &node)?;
            NodeType::Instance
        }
    };

    let id = make_node_id(offset, ty);
    memory.write_u32(args.scratch_addr + args.dst_scratch_offset as u64 + p as u64 * 4, id)?;
    trace!(p, id, "leaf");
    Ok(())
}

/// Instance leaf with a cofactor inverse.
fn device_instance_node(record: &InstanceRecord, child: &AccelHeader, p: u32) -> InstanceNode {
    let m = &record.transform;
    let inv = invert_3x3([
        [m[0][0], m[0][1], m[0][2]],
        [m[1][0], m[1][1], m[1][2]],
        [m[2][0], m[2][1], m[2][2]],
    ]);

    let mut wto: Rows3x4 = [[0.0; 4]; 3];
    let mut otw = [0.0f32; 9];
    for i in 0..3 {
        wto[i] = [inv[i][0], inv[i][1], inv[i][2], m[i][3]];
        for j in 0..3 {
            otw[i * 3 + j] = m[j][i];
        }
    }

    InstanceNode {
        base_ptr: record.accel_reference | child.root_node_id as u64,
        custom_instance_and_mask: record.custom_index_and_mask,
        sbt_offset_and_flags: record.sbt_offset_and_flags,
        wto_matrix: wto,
        aabb: child.bounds().transformed(m).to_array(),
        instance_id: p,
        otw_matrix: otw,
    }
}

/// Placeholder leaf for a null reference: NaN bounds, never entered.
fn null_instance_node() -> InstanceNode {
    InstanceNode {
        aabb: Aabb::NAN.to_array(),
        ..InstanceNode::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::format::{read_node, ROOT_NODE_ID};
    use crate::bvh::geometry::IDENTITY_TRANSFORM;
    use crate::memory::{Heap, MemoryKind};
    use crate::util::Vec3;

    fn args(base: u64, scratch: u64, primitive: LeafPrimitive) -> LeafArgs {
        LeafArgs {
            node_dst_addr: base,
            scratch_addr: scratch,
            dst_offset: 192,
            dst_scratch_offset: 8,
            geometry_id: 3 | (1 << 28),
            primitive,
        }
    }

    #[test]
    fn test_indexed_triangle_leaf() {
        let mut heap = Heap::new(1 << 20);
        let verts: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let vb = heap.upload(bytemuck::cast_slice(&verts)).unwrap();
        let ib = heap.upload(&[2u8, 1, 0]).unwrap();
        let dst = heap.allocate(512, MemoryKind::DeviceLocal).unwrap();
        let scratch = heap.allocate(64, MemoryKind::DeviceLocal).unwrap();

        let a = args(
            dst.address,
            scratch.address,
            LeafPrimitive::Triangles {
                vertex_addr: vb.address,
                vertex_stride: 12,
                vertex_format: VertexFormat::R32G32B32Sfloat,
                index_addr: ib.address,
                index_type: IndexType::U8,
                transform_addr: 0,
            },
        );
        run(&a, &heap, Invocation { global_id: 0, workgroups: 1 }).unwrap();

        let node: TriangleNode = heap.read_pod(dst.address + 192).unwrap();
        assert_eq!(node.vertices(), [Vec3::Y, Vec3::X, Vec3::ZERO]);
        assert_eq!(node.geometry_id_and_flags, 3 | (1 << 28));
        assert_eq!(node.id, TRIANGLE_NODE_MARKER);
        assert_eq!(heap.read_u32(scratch.address + 8).unwrap(), make_node_id(192, NodeType::Triangle));
    }

    #[test]
    fn test_instance_leaf_and_null() {
        let mut heap = Heap::new(1 << 20);
        let child = heap.allocate(256, MemoryKind::HostVisible).unwrap();
        let child_header = AccelHeader {
            root_node_id: ROOT_NODE_ID,
            aabb: [-1.0, -1.0, -1.0, 1.0, 1.0, 1.0],
            ..Default::default()
        };
        heap.write_pod(child.address, &child_header).unwrap();

        let mut t = IDENTITY_TRANSFORM;
        t[0][3] = 5.0;
        let records = [InstanceRecord::new(t, child.address), InstanceRecord::new(t, 0)];
        let rb = heap.upload(bytemuck::cast_slice(&records)).unwrap();
        let dst = heap.allocate(1024, MemoryKind::DeviceLocal).unwrap();
        let scratch = heap.allocate(64, MemoryKind::DeviceLocal).unwrap();

        let a = args(
            dst.address,
            scratch.address,
            LeafPrimitive::Instances { instance_addr: rb.address, array_of_pointers: false },
        );
        for gid in 0..2 {
            run(&a, &heap, Invocation { global_id: gid, workgroups: 1 }).unwrap();
        }

        let bytes = heap.read_bytes(dst.address + 192, 256).unwrap();
        let node: InstanceNode = read_node(&bytes);
        assert_eq!(node.base_ptr, child.address | ROOT_NODE_ID as u64);
        assert_eq!(node.aabb, [4.0, -1.0, -1.0, 6.0, 1.0, 1.0]);
        assert_eq!(node.wto_matrix[0], [1.0, 0.0, 0.0, 5.0]);

        let null: InstanceNode = read_node(&bytes[128..]);
        assert!(null.aabb[0].is_nan());
        assert_eq!(heap.read_u32(scratch.address + 12).unwrap(), make_node_id(320, NodeType::Instance));
    }
}
