//! Structure walking for diagnostics.

use std::fmt;

use super::format::{node_offset, read_node, AccelHeader, BoxNode, NodeType, HEADER_SIZE};
use crate::util::{Error, Result, INVALID_CHILD};

/// Node census of one structure (instances are not followed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub triangles: usize,
    pub aabbs: usize,
    pub instances: usize,
    pub boxes: usize,
    /// Box levels on the longest root-to-leaf path.
    pub depth: usize,
    /// Largest number of live children in any box node.
    pub max_children: usize,
}

impl TreeStats {
    pub fn leaves(&self) -> usize {
        self.triangles + self.aabbs + self.instances
    }
}

impl fmt::Display for TreeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} boxes, {} triangles, {} aabbs, {} instances, depth {}, max {} children",
            self.boxes, self.triangles, self.aabbs, self.instances, self.depth, self.max_children
        )
    }
}

/// Walk the structure whose bytes start at `bytes[0]`.
pub fn inspect(bytes: &[u8]) -> Result<TreeStats> {
    if (bytes.len() as u64) < HEADER_SIZE {
        return Err(Error::invalid("structure shorter than its header"));
    }
    let header: AccelHeader = read_node(bytes);
    let mut stats = TreeStats::default();
    let mut stack = vec![(header.root_node_id, 1usize)];

    while let Some((id, depth)) = stack.pop() {
        let ty = NodeType::of(id).ok_or_else(|| Error::invalid(format!("bad node id {id:#x}")))?;
        let offset = node_offset(id);
        if offset + ty.size() > bytes.len() as u64 {
            return Err(Error::invalid(format!("node {id:#x} outside structure")));
        }
        match ty {
            NodeType::Triangle => stats.triangles += 1,
            NodeType::Aabb => stats.aabbs += 1,
            NodeType::Instance => stats.instances += 1,
            NodeType::Box32 => {
                let node: BoxNode = read_node(&bytes[offset as usize..]);
                stats.boxes += 1;
                stats.depth = stats.depth.max(depth);
                stats.max_children = stats.max_children.max(node.live_children());
                for (child, bounds) in node.children.iter().zip(node.coords) {
                    if *child != INVALID_CHILD && !bounds[0].is_nan() {
                        stack.push((*child, depth + 1));
                    }
                }
            }
        }
    }
    Ok(stats)
}
