//! Internal-node kernel: one invocation per group of up to four children.

use super::Invocation;
use crate::bvh::format::{
    make_node_id, node_bounds, node_offset, BoxNode, NodeType, BOX_NODE_SIZE,
};
use crate::memory::{DeviceAddress, DeviceMemory, MemoryExt};
use crate::util::{Aabb, Result};

/// Set in [`InternalArgs::fill_header`] on the pass that writes the root.
pub const FILL_HEADER_BIT: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalArgs {
    pub node_dst_addr: DeviceAddress,
    pub scratch_addr: DeviceAddress,
    /// Offset of this pass's first box node in the structure.
    pub dst_offset: u32,
    pub dst_scratch_offset: u32,
    pub src_scratch_offset: u32,
    /// Child count of the level, with [`FILL_HEADER_BIT`] on the final pass.
    pub fill_header: u32,
}

impl InternalArgs {
    #[inline]
    pub fn src_count(&self) -> u32 {
        self.fill_header & !FILL_HEADER_BIT
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        self.fill_header & FILL_HEADER_BIT != 0
    }
}

pub(super) fn run(args: &InternalArgs, memory: &dyn DeviceMemory, inv: Invocation) -> Result<()> {
    let gid = inv.global_id;
    let first = gid * 4;
    let count = args.src_count().saturating_sub(first).min(4) as usize;

    let mut node = BoxNode::empty();
    let mut total = Aabb::EMPTY;
    let src = args.scratch_addr + args.src_scratch_offset as u64;
    for c in 0..count {
        let id = memory.read_u32(src + (first as u64 + c as u64) * 4)?;
        let bounds = child_bounds(memory, args.node_dst_addr, id)?;
        node.children[c] = id;
        node.coords[c] = bounds.to_array();
        total.expand_by_box(&bounds);
    }

    let offset = args.dst_offset as u64 + gid as u64 * BOX_NODE_SIZE;
    memory.write_pod(args.node_dst_addr + offset, &node)?;

    let id = make_node_id(offset, NodeType::Box32);
    memory.write_u32(
        args.scratch_addr + args.dst_scratch_offset as u64 + gid as u64 * 4,
        id,
    )?;

    if args.is_final() {
        memory.write_u32(args.node_dst_addr, id)?;
        memory.write_pod(args.node_dst_addr + 8, &total.to_array())?;
    }
    Ok(())
}

fn child_bounds(memory: &dyn DeviceMemory, base: DeviceAddress, id: u32) -> Result<Aabb> {
    let Some(ty) = NodeType::of(id) else {
        return Ok(Aabb::NAN);
    };
    let bytes = memory.read_bytes(base + node_offset(id), ty.size() as usize)?;
    Ok(node_bounds(ty, &bytes))
}
