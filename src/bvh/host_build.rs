//! Host-synchronous BVH construction.
//!
//! Leaves are written in two passes (triangles and AABBs in declaration
//! order, then instances), sorted along a Morton curve, then reduced
//! bottom-up in groups of four until a single root remains. The root always
//! lands in the fixed slot after the header.

use glam::Mat3;
use tracing::{debug, trace};

use super::format::{
    make_node_id, node_bounds, node_offset, write_node, AabbNode, AccelHeader, BoxNode,
    InstanceNode, NodeType, TriangleNode, AABB_NODE_SIZE, BOX_NODE_SIZE, HEADER_PAD,
    INSTANCE_NODE_SIZE, ROOT_NODE_ID, ROOT_NODE_OFFSET, TRIANGLE_NODE_MARKER, TRIANGLE_NODE_SIZE,
};
use super::geometry::{
    read_aabb, read_instance, read_transform, BuildRange, ByteSource, Geometry, GeometryData,
    HostSource, IndexType, InstanceRecord, TriangleSource,
};
use crate::memory::{BufferRegion, DeviceMemory, MemoryExt};
use crate::util::{morton_key, Aabb, Error, Result, Rows3x4};

/// A non-null instance with the header of the structure it references.
#[derive(Clone, Copy)]
struct ResolvedInstance {
    record: InstanceRecord,
    child: AccelHeader,
}

/// Build a complete structure into `target`, which must be host visible.
///
/// Geometry data must be host resident. Instance references are device
/// addresses of finished structures; null references leave a hole in the
/// instance region but no leaf.
#[tracing::instrument(skip_all, fields(address = target.address, geometries = geometries.len()))]
pub fn build(
    memory: &dyn DeviceMemory,
    target: BufferRegion,
    geometries: &[Geometry<'_>],
    ranges: &[BuildRange],
) -> Result<AccelHeader> {
    if geometries.len() != ranges.len() {
        return Err(Error::invalid(format!(
            "{} geometries but {} build ranges",
            geometries.len(),
            ranges.len()
        )));
    }

    // Child headers are read before the target is mapped: a child may share
    // the target's allocation.
    let instances = resolve_instances(memory, geometries, ranges)?;

    let mut mapped = memory.map(target)?;
    if (mapped.len() as u64) < HEADER_PAD {
        return Err(Error::oom(format!(
            "structure buffer of {} bytes cannot hold the {HEADER_PAD} byte header and root",
            mapped.len()
        )));
    }
    let mut builder = HostBuilder::new(&mut mapped);

    for (i, (geometry, range)) in geometries.iter().zip(ranges).enumerate() {
        match &geometry.data {
            GeometryData::Triangles(_) => builder.emit_triangles(geometry, range, i as u32)?,
            GeometryData::Aabbs(_) => builder.emit_aabbs(geometry, range, i as u32)?,
            GeometryData::Instances(_) => {}
        }
    }

    let instance_offset = builder.curr;
    let mut instance_count = 0u32;
    for (range, resolved) in ranges.iter().zip(&instances) {
        if let Some(list) = resolved {
            builder.emit_instances(list)?;
            instance_count += range.primitive_count;
        }
    }
    debug!(leaves = builder.ids.len(), instance_count, "emitted leaves");

    builder.optimize();
    builder.reduce()?;

    let mut header = AccelHeader {
        root_node_id: ROOT_NODE_ID,
        instance_offset,
        ..Default::default()
    };
    header.aabb = node_bounds(NodeType::Box32, &builder.bytes[ROOT_NODE_OFFSET as usize..]).to_array();
    header.set_sizes(builder.curr, instance_count);
    write_node(builder.bytes, &header);

    debug!(compacted_size = header.compacted_size, "host build finished");
    Ok(header)
}

/// Per instance geometry: one entry per primitive, `None` for null references.
fn resolve_instances(
    memory: &dyn DeviceMemory,
    geometries: &[Geometry<'_>],
    ranges: &[BuildRange],
) -> Result<Vec<Option<Vec<Option<ResolvedInstance>>>>> {
    geometries
        .iter()
        .zip(ranges)
        .map(|(geometry, range)| {
            let GeometryData::Instances(data) = &geometry.data else {
                return Ok(None);
            };
            let src = HostSource(data.data.host()?);
            let list = (0..range.primitive_count)
                .map(|p| {
                    let record = read_instance(&src, Some(memory), range, data.array_of_pointers, p)?;
                    if record.accel_reference == 0 {
                        return Ok(None);
                    }
                    let child = memory.read_pod::<AccelHeader>(record.accel_reference)?;
                    Ok(Some(ResolvedInstance { record, child }))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(list))
        })
        .collect()
}

struct HostBuilder<'b> {
    bytes: &'b mut [u8],
    /// Next free byte.
    curr: u64,
    /// Current level of node ids.
    ids: Vec<u32>,
}

impl<'b> HostBuilder<'b> {
    fn new(bytes: &'b mut [u8]) -> Self {
        Self { bytes, curr: HEADER_PAD, ids: Vec::new() }
    }

    /// Reserve `size` bytes at the end of the node region.
    fn alloc(&mut self, size: u64) -> Result<usize> {
        let offset = self.curr;
        if offset + size > self.bytes.len() as u64 {
            return Err(Error::oom(format!(
                "structure buffer of {} bytes too small",
                self.bytes.len()
            )));
        }
        self.curr += size;
        Ok(offset as usize)
    }

    fn emit_triangles(&mut self, geometry: &Geometry<'_>, range: &BuildRange, index: u32) -> Result<()> {
        let GeometryData::Triangles(data) = &geometry.data else {
            return Ok(());
        };
        let vertices = HostSource(data.vertex_data.host()?);
        let indices = match data.index_type {
            IndexType::None => None,
            _ => Some(HostSource(data.index_data.host()?)),
        };
        let transform = if data.transform_data.is_null() {
            None
        } else {
            let src = HostSource(data.transform_data.host()?);
            Some(read_transform(&src, range.transform_offset as u64)?)
        };
        let source = TriangleSource {
            vertex_format: data.vertex_format,
            vertex_stride: data.vertex_stride,
            index_type: data.index_type,
            vertices: &vertices,
            indices: indices.as_ref().map(|s| s as &dyn ByteSource),
            transform,
        };

        for p in 0..range.primitive_count {
            let verts = source.triangle(range, p)?;
            let offset = self.alloc(TRIANGLE_NODE_SIZE)?;
            let node = TriangleNode {
                coords: verts.map(|v| v.to_array()),
                reserved: [0; 3],
                triangle_id: p,
                geometry_id_and_flags: geometry.id_and_flags(index),
                reserved2: 0,
                id: TRIANGLE_NODE_MARKER,
            };
            write_node(&mut self.bytes[offset..], &node);
            self.ids.push(make_node_id(offset as u64, NodeType::Triangle));
        }
        trace!(geometry = index, count = range.primitive_count, "triangle leaves");
        Ok(())
    }

    fn emit_aabbs(&mut self, geometry: &Geometry<'_>, range: &BuildRange, index: u32) -> Result<()> {
        let GeometryData::Aabbs(data) = &geometry.data else {
            return Ok(());
        };
        let src = HostSource(data.data.host()?);
        for p in 0..range.primitive_count {
            let aabb = read_aabb(&src, range, data.stride, p)?;
            let offset = self.alloc(AABB_NODE_SIZE)?;
            let node = AabbNode {
                aabb: aabb.to_array(),
                primitive_id: p,
                geometry_id_and_flags: geometry.id_and_flags(index),
                reserved: [0; 8],
            };
            write_node(&mut self.bytes[offset..], &node);
            self.ids.push(make_node_id(offset as u64, NodeType::Aabb));
        }
        trace!(geometry = index, count = range.primitive_count, "aabb leaves");
        Ok(())
    }

    fn emit_instances(&mut self, list: &[Option<ResolvedInstance>]) -> Result<()> {
        for (p, resolved) in list.iter().enumerate() {
            let offset = self.alloc(INSTANCE_NODE_SIZE)?;
            let Some(inst) = resolved else {
                continue;
            };
            let node = instance_node(&inst.record, &inst.child, p as u32);
            write_node(&mut self.bytes[offset..], &node);
            self.ids.push(make_node_id(offset as u64, NodeType::Instance));
        }
        Ok(())
    }

    fn bounds(&self, id: u32) -> Aabb {
        match NodeType::of(id) {
            Some(ty) => node_bounds(ty, &self.bytes[node_offset(id) as usize..]),
            None => Aabb::EMPTY,
        }
    }

    /// Sort the leaf level along a Morton curve over the leaves' union box.
    fn optimize(&mut self) {
        let boxes: Vec<Aabb> = self.ids.iter().map(|&id| self.bounds(id)).collect();
        let mut union = Aabb::EMPTY;
        for b in &boxes {
            union.expand_by_box(b);
        }
        let mut keyed: Vec<(u64, u32)> = boxes
            .iter()
            .zip(&self.ids)
            .map(|(b, &id)| (morton_key(b.center(), &union), id))
            .collect();
        keyed.sort_unstable();
        self.ids = keyed.into_iter().map(|(_, id)| id).collect();
    }

    /// Group the current level into box nodes until one root remains.
    fn reduce(&mut self) -> Result<()> {
        let mut pass = 0;
        while self.ids.len() > 1 || pass == 0 {
            let children = std::mem::take(&mut self.ids);
            let mut next = Vec::with_capacity(children.len().div_ceil(4));

            // an empty level still yields the (childless) root
            for g in 0..children.len().div_ceil(4).max(1) {
                let group = &children[g * 4..children.len().min(g * 4 + 4)];
                let mut node = BoxNode::empty();
                for (c, &id) in group.iter().enumerate() {
                    node.children[c] = id;
                    node.coords[c] = self.bounds(id).to_array();
                }

                let offset = if group.len() == children.len() {
                    ROOT_NODE_OFFSET as usize
                } else {
                    let offset = self.alloc(BOX_NODE_SIZE)?;
                    next.push(make_node_id(offset as u64, NodeType::Box32));
                    offset
                };
                write_node(&mut self.bytes[offset..], &node);
            }

            trace!(pass, children = children.len(), nodes = next.len(), "reduced level");
            self.ids = next;
            pass += 1;
        }
        Ok(())
    }
}

/// Instance leaf for `record` referencing a structure with header `child`.
pub(crate) fn instance_node(record: &InstanceRecord, child: &AccelHeader, instance_id: u32) -> InstanceNode {
    let m = &record.transform;
    let forward = Mat3::from_cols_array_2d(&[
        [m[0][0], m[1][0], m[2][0]],
        [m[0][1], m[1][1], m[2][1]],
        [m[0][2], m[1][2], m[2][2]],
    ]);
    let inv = forward.inverse().to_cols_array_2d();

    let mut wto: Rows3x4 = [[0.0; 4]; 3];
    let mut otw = [0.0f32; 9];
    for i in 0..3 {
        for j in 0..3 {
            wto[i][j] = inv[j][i];
            otw[i * 3 + j] = m[j][i];
        }
        wto[i][3] = m[i][3];
    }

    InstanceNode {
        base_ptr: record.accel_reference | child.root_node_id as u64,
        custom_instance_and_mask: record.custom_index_and_mask,
        sbt_offset_and_flags: record.sbt_offset_and_flags,
        wto_matrix: wto,
        aabb: child.bounds().transformed(m).to_array(),
        instance_id,
        otw_matrix: otw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::geometry::{
        AabbsData, IndexType, InstancesData, TrianglesData, VertexFormat, IDENTITY_TRANSFORM,
    };
    use crate::memory::{DeviceOrHostAddress, Heap, MemoryKind};
    use crate::util::{Vec3, INVALID_CHILD};

    fn tri_bytes(tris: &[[f32; 9]]) -> Vec<u8> {
        bytemuck::cast_slice(tris).to_vec()
    }

    fn mesh(data: &[u8]) -> Geometry<'_> {
        Geometry::triangles(
            TrianglesData {
                vertex_format: VertexFormat::R32G32B32Sfloat,
                vertex_data: DeviceOrHostAddress::Host(data),
                vertex_stride: 12,
                max_vertex: 0,
                index_type: IndexType::None,
                index_data: DeviceOrHostAddress::NULL,
                transform_data: DeviceOrHostAddress::NULL,
            },
            0,
        )
    }

    fn target(heap: &mut Heap, size: u64) -> BufferRegion {
        heap.allocate(size, MemoryKind::HostVisible).unwrap()
    }

    #[test]
    fn test_single_triangle() {
        let mut heap = Heap::new(1 << 20);
        let region = target(&mut heap, 256);
        let data = tri_bytes(&[[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]]);

        let header = build(&heap, region, &[mesh(&data)], &[BuildRange::new(1)]).unwrap();
        assert_eq!(header.root_node_id, ROOT_NODE_ID);
        assert_eq!(header.compacted_size, HEADER_PAD + TRIANGLE_NODE_SIZE);
        assert_eq!(header.bounds().max, Vec3::new(1.0, 1.0, 0.0));

        let root: BoxNode = heap.read_pod(region.address + ROOT_NODE_OFFSET).unwrap();
        assert_eq!(root.live_children(), 1);
        assert_eq!(root.children[0], make_node_id(HEADER_PAD, NodeType::Triangle));
        assert!(root.coords[1][0].is_nan());
        assert_eq!(root.children[1], INVALID_CHILD);
    }

    #[test]
    fn test_empty_build() {
        let mut heap = Heap::new(1 << 20);
        let region = target(&mut heap, 192);
        let header = build(&heap, region, &[], &[]).unwrap();
        assert_eq!(header.compacted_size, 192);
        assert_eq!(header.instance_count, 0);
        let root: BoxNode = heap.read_pod(region.address + ROOT_NODE_OFFSET).unwrap();
        assert_eq!(root.live_children(), 0);
    }

    #[test]
    fn test_many_triangles_fit_estimate() {
        let mut heap = Heap::new(1 << 22);
        let tris: Vec<[f32; 9]> = (0..37)
            .map(|i| {
                let x = i as f32;
                [x, 0.0, 0.0, x + 1.0, 0.0, 0.0, x, 1.0, 0.0]
            })
            .collect();
        let data = tri_bytes(&tris);
        let geometries = [mesh(&data)];
        let sizes = crate::bvh::get_build_sizes(&geometries, &[37]);
        let region = target(&mut heap, sizes.structure_size);

        let header = build(&heap, region, &geometries, &[BuildRange::new(37)]).unwrap();
        // the estimate counts the root twice: once in the header pad, once as an internal node
        assert_eq!(header.compacted_size + BOX_NODE_SIZE, sizes.structure_size);
        assert_eq!(header.bounds().min, Vec3::ZERO);
        assert_eq!(header.bounds().max, Vec3::new(37.0, 1.0, 0.0));
    }

    #[test]
    fn test_buffer_too_small() {
        let mut heap = Heap::new(1 << 20);
        let region = target(&mut heap, 200);
        let data = tri_bytes(&[[0.0; 9]]);
        let err = build(&heap, region, &[mesh(&data)], &[BuildRange::new(1)]).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
    }

    #[test]
    fn test_device_local_target_fails() {
        let mut heap = Heap::new(1 << 20);
        let region = heap.allocate(256, MemoryKind::DeviceLocal).unwrap();
        let err = build(&heap, region, &[], &[]).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
    }

    #[test]
    fn test_instances_after_leaves() {
        let mut heap = Heap::new(1 << 20);
        let aabb = [-1.0f32, -1.0, -1.0, 1.0, 1.0, 1.0];
        let aabb_bytes = bytemuck::cast_slice(&aabb).to_vec();
        let blas_geom = [Geometry::aabbs(
            AabbsData { data: DeviceOrHostAddress::Host(&aabb_bytes), stride: 24 },
            0,
        )];
        let blas = target(&mut heap, 512);
        build(&heap, blas, &blas_geom, &[BuildRange::new(1)]).unwrap();

        let mut t = IDENTITY_TRANSFORM;
        t[0][3] = 5.0;
        let records = [
            InstanceRecord::new(t, blas.address),
            InstanceRecord::new(IDENTITY_TRANSFORM, 0),
        ];
        let rec_bytes = bytemuck::cast_slice(&records).to_vec();
        let tri = tri_bytes(&[[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]]);
        let geometries = [
            Geometry::instances(
                InstancesData { data: DeviceOrHostAddress::Host(&rec_bytes), array_of_pointers: false },
                0,
            ),
            mesh(&tri),
        ];
        let tlas = target(&mut heap, 1024);
        let header = build(&heap, tlas, &geometries, &[BuildRange::new(2), BuildRange::new(1)]).unwrap();

        assert_eq!(header.instance_offset, HEADER_PAD + TRIANGLE_NODE_SIZE);
        assert_eq!(header.instance_count, 2);

        let node: InstanceNode = heap.read_pod(tlas.address + header.instance_offset).unwrap();
        assert_eq!(node.child_base(), blas.address);
        assert_eq!(node.child_root(), ROOT_NODE_ID);
        assert_eq!(Aabb::from_array(node.aabb), Aabb::new(Vec3::new(4.0, -1.0, -1.0), Vec3::new(6.0, 1.0, 1.0)));
        assert_eq!(node.wto_matrix[0][3], 5.0);
        assert_eq!(node.instance_id, 0);

        let root: BoxNode = heap.read_pod(tlas.address + ROOT_NODE_OFFSET).unwrap();
        assert_eq!(root.live_children(), 2);
    }

    #[test]
    fn test_instance_inverse() {
        let mut t = IDENTITY_TRANSFORM;
        t[0][0] = 2.0;
        t[1][1] = 4.0;
        t[2][3] = -3.0;
        let record = InstanceRecord::new(t, 0x1_0000);
        let child = AccelHeader { root_node_id: ROOT_NODE_ID, aabb: [0.0, 0.0, 0.0, 1.0, 1.0, 1.0], ..Default::default() };
        let node = instance_node(&record, &child, 7);
        assert_eq!(node.wto_matrix[0][0], 0.5);
        assert_eq!(node.wto_matrix[1][1], 0.25);
        assert_eq!(node.wto_matrix[2][3], -3.0);
        assert_eq!(node.otw_matrix[0], 2.0);
        assert_eq!(node.aabb, [0.0, 0.0, -3.0, 2.0, 4.0, -2.0]);
    }
}
