//! Recording of device-side builds.

use tracing::debug;

use super::{AccelerationStructure, Device};
use crate::bvh::format::{AccelHeader, HEADER_PAD, HEADER_TAIL_OFFSET, ROOT_NODE_OFFSET, BOX_NODE_SIZE};
use crate::bvh::geometry::{BuildRange, Geometry, GeometryData, IndexType};
use crate::command::{CommandSink, DispatchSize};
use crate::kernels::internal::FILL_HEADER_BIT;
use crate::kernels::{InternalArgs, Kernel, LeafArgs, LeafPrimitive};
use crate::memory::DeviceAddress;
use crate::util::{Error, Result};

/// One structure of a batched build.
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo<'a> {
    pub dst: &'a AccelerationStructure,
    /// Scratch of at least `build_scratch_size` bytes; unused by host builds.
    pub scratch: DeviceAddress,
    pub geometries: &'a [Geometry<'a>],
    pub ranges: &'a [BuildRange],
}

/// Progress of one structure through the internal-node passes.
#[derive(Debug, Clone, Copy)]
struct BvhState {
    node_offset: u64,
    node_count: u32,
    scratch_offset: u32,
    instance_offset: u64,
    instance_count: u32,
}

/// Leaf dispatches of one structure, in emission order.
fn leaf_dispatches(info: &BuildInfo<'_>) -> Result<(Vec<(LeafArgs, u32)>, BvhState)> {
    if info.geometries.len() != info.ranges.len() {
        return Err(Error::invalid(format!(
            "{} geometries but {} build ranges",
            info.geometries.len(),
            info.ranges.len()
        )));
    }

    let mut dispatches = Vec::with_capacity(info.geometries.len());
    let mut dst_offset = HEADER_PAD;
    let mut dst_scratch_offset = 0u32;
    let mut instance_offset = HEADER_PAD;
    let mut instance_count = 0;

    for instances in [false, true] {
        if instances {
            instance_offset = dst_offset;
        }
        for (j, (geometry, range)) in info.geometries.iter().zip(info.ranges).enumerate() {
            let is_instance = matches!(geometry.data, GeometryData::Instances(_));
            if is_instance != instances {
                continue;
            }
            let primitive = leaf_primitive(geometry, range)?;
            if is_instance {
                instance_count += range.primitive_count;
            }
            let args = LeafArgs {
                node_dst_addr: info.dst.address(),
                scratch_addr: info.scratch,
                dst_offset: dst_offset as u32,
                dst_scratch_offset,
                geometry_id: geometry.id_and_flags(j as u32),
                primitive,
            };
            dst_offset += primitive.node_size() * range.primitive_count as u64;
            dst_scratch_offset += 4 * range.primitive_count;
            dispatches.push((args, range.primitive_count));
        }
    }

    let state = BvhState {
        node_offset: dst_offset,
        node_count: dst_scratch_offset / 4,
        scratch_offset: 0,
        instance_offset,
        instance_count,
    };
    Ok((dispatches, state))
}

/// Kernel inputs for one geometry, with the build range folded into the addresses.
fn leaf_primitive(geometry: &Geometry<'_>, range: &BuildRange) -> Result<LeafPrimitive> {
    Ok(match &geometry.data {
        GeometryData::Triangles(t) => {
            let vertex_data = t.vertex_data.device()?;
            let first_vertex = range.first_vertex as u64 * t.vertex_stride;
            let (vertex_addr, index_addr) = match t.index_type {
                IndexType::None => (vertex_data + range.primitive_offset as u64 + first_vertex, 0),
                _ => (
                    vertex_data + first_vertex,
                    t.index_data.device()? + range.primitive_offset as u64,
                ),
            };
            let transform_addr = match t.transform_data.device()? {
                0 => 0,
                addr => addr + range.transform_offset as u64,
            };
            LeafPrimitive::Triangles {
                vertex_addr,
                vertex_stride: t.vertex_stride,
                vertex_format: t.vertex_format,
                index_addr,
                index_type: t.index_type,
                transform_addr,
            }
        }
        GeometryData::Aabbs(a) => LeafPrimitive::Aabbs {
            aabb_addr: a.data.device()? + range.primitive_offset as u64,
            stride: a.stride,
        },
        GeometryData::Instances(i) => LeafPrimitive::Instances {
            instance_addr: i.data.device()? + range.primitive_offset as u64,
            array_of_pointers: i.array_of_pointers,
        },
    })
}

impl Device<'_> {
    /// Record device builds of `infos` into `sink`.
    ///
    /// Geometry data must be given as device addresses. Structures referenced
    /// by instances must be finished before the recorded commands execute.
    /// Nothing is recorded when a descriptor is rejected.
    #[tracing::instrument(skip_all, fields(structures = infos.len()))]
    pub fn cmd_build(&self, sink: &mut dyn CommandSink, infos: &[BuildInfo<'_>]) -> Result<()> {
        let mut states = Vec::with_capacity(infos.len());
        let mut leaves = Vec::with_capacity(infos.len());
        for info in infos {
            let (dispatches, state) = leaf_dispatches(info)?;
            leaves.push(dispatches);
            states.push(state);
        }

        for dispatches in leaves {
            for (args, count) in dispatches {
                sink.dispatch(Kernel::Leaf(args), DispatchSize::Unaligned(count));
            }
        }

        let mut progress = true;
        let mut iter = 0;
        while progress {
            progress = false;
            for (info, state) in infos.iter().zip(states.iter_mut()) {
                if iter > 0 && state.node_count == 1 {
                    continue;
                }
                if !progress {
                    sink.barrier();
                }
                progress = true;

                let dst_count = state.node_count.div_ceil(4).max(1);
                let final_pass = dst_count == 1;
                let src_scratch_offset = state.scratch_offset;
                let dst_scratch_offset = if src_scratch_offset != 0 { 0 } else { state.node_count * 4 };
                let dst_offset = if final_pass { ROOT_NODE_OFFSET } else { state.node_offset };

                let args = InternalArgs {
                    node_dst_addr: info.dst.address(),
                    scratch_addr: info.scratch,
                    dst_offset: dst_offset as u32,
                    dst_scratch_offset,
                    src_scratch_offset,
                    fill_header: state.node_count | if final_pass { FILL_HEADER_BIT } else { 0 },
                };
                sink.dispatch(Kernel::Internal(args), DispatchSize::Unaligned(dst_count));
                debug!(address = info.dst.address(), iter, src = state.node_count, dst = dst_count, "internal pass");

                if !final_pass {
                    state.node_offset += dst_count as u64 * BOX_NODE_SIZE;
                }
                state.node_count = dst_count;
                state.scratch_offset = dst_scratch_offset;
            }
            iter += 1;
        }

        for (info, state) in infos.iter().zip(&states) {
            let mut header = AccelHeader {
                instance_offset: state.instance_offset,
                ..Default::default()
            };
            header.set_sizes(state.node_offset, state.instance_count);
            sink.update_buffer(info.dst.address() + HEADER_TAIL_OFFSET, header.tail_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::geometry::{AabbsData, InstancesData};
    use crate::command::{Command, CommandBuffer};
    use crate::config::Settings;
    use crate::memory::{DeviceOrHostAddress, Heap};

    #[test]
    fn test_leaf_order_and_passes() {
        let heap = Heap::new(1 << 20);
        let device = Device::new(&heap, Settings::default());
        let accel = AccelerationStructure { region: crate::memory::BufferRegion::new(0x1_0000, 4096) };
        let geometries = [
            Geometry::instances(
                InstancesData { data: DeviceOrHostAddress::Device(0x2_0000), array_of_pointers: false },
                0,
            ),
            Geometry::aabbs(AabbsData { data: DeviceOrHostAddress::Device(0x3_0000), stride: 24 }, 1),
        ];
        let ranges = [BuildRange::new(2), BuildRange::new(5)];
        let info = BuildInfo { dst: &accel, scratch: 0x4_0000, geometries: &geometries, ranges: &ranges };

        let mut cmd = CommandBuffer::new();
        device.cmd_build(&mut cmd, &[info]).unwrap();

        let leaf_offsets: Vec<u32> = cmd
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::Dispatch { kernel: Kernel::Leaf(a), .. } => Some(a.dst_offset),
                _ => None,
            })
            .collect();
        // AABBs first, instances after them
        assert_eq!(leaf_offsets, vec![192, 192 + 5 * 64]);

        // 7 leaves -> 2 nodes -> root
        let internal: Vec<InternalArgs> = cmd
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::Dispatch { kernel: Kernel::Internal(a), .. } => Some(*a),
                _ => None,
            })
            .collect();
        assert_eq!(internal.len(), 2);
        assert_eq!(internal[0].fill_header, 7);
        assert_eq!(internal[0].dst_scratch_offset, 28);
        assert_eq!(internal[1].fill_header, 2 | FILL_HEADER_BIT);
        assert_eq!(internal[1].dst_offset as u64, ROOT_NODE_OFFSET);
        assert_eq!(internal[1].src_scratch_offset, 28);
        assert_eq!(internal[1].dst_scratch_offset, 0);

        let Some(Command::UpdateBuffer { address, data }) = cmd.commands().last() else {
            panic!("header tail not written");
        };
        assert_eq!(*address, accel.address() + HEADER_TAIL_OFFSET);
        assert_eq!(data.len(), 32);
    }

    #[test]
    fn test_host_data_rejected() {
        let heap = Heap::new(1 << 20);
        let device = Device::new(&heap, Settings::default());
        let accel = AccelerationStructure { region: crate::memory::BufferRegion::new(0x1_0000, 4096) };
        let boxes = [0u8; 24];
        let geometries = [Geometry::aabbs(AabbsData { data: DeviceOrHostAddress::Host(&boxes), stride: 24 }, 0)];
        let ranges = [BuildRange::new(1)];
        let info = BuildInfo { dst: &accel, scratch: 0x4_0000, geometries: &geometries, ranges: &ranges };

        let mut cmd = CommandBuffer::new();
        assert!(matches!(device.cmd_build(&mut cmd, &[info]), Err(Error::InvalidDescriptor(_))));
        assert!(cmd.is_empty());
    }
}
