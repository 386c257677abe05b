//! Buffer and scratch sizing for a build.

use super::format::{
    AABB_NODE_SIZE, BOX_NODE_SIZE, HEADER_PAD, INSTANCE_NODE_SIZE, TRIANGLE_NODE_SIZE,
};
use super::geometry::{Geometry, GeometryKind};

/// Smallest scratch buffer handed out.
pub const MIN_SCRATCH_SIZE: u64 = 4096;

/// Sizes a caller must allocate before building.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub structure_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

/// Per-kind primitive totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrimitiveCounts {
    pub triangles: u64,
    pub aabbs: u64,
    pub instances: u64,
}

impl PrimitiveCounts {
    pub fn add(&mut self, kind: GeometryKind, count: u64) {
        match kind {
            GeometryKind::Triangles => self.triangles += count,
            GeometryKind::Aabbs => self.aabbs += count,
            GeometryKind::Instances => self.instances += count,
        }
    }

    pub fn leaves(&self) -> u64 {
        self.triangles + self.aabbs + self.instances
    }

    /// Worst-case sizes for these counts.
    pub fn sizes(&self) -> BuildSizes {
        let leaves = self.leaves();
        let internal = internal_node_count(leaves);

        let structure_size = self.triangles * TRIANGLE_NODE_SIZE
            + self.aabbs * AABB_NODE_SIZE
            + self.instances * INSTANCE_NODE_SIZE
            + internal * BOX_NODE_SIZE
            + HEADER_PAD;
        // two ping-pong node id arrays
        let scratch = MIN_SCRATCH_SIZE.max(2 * leaves * 4);

        BuildSizes {
            structure_size,
            build_scratch_size: scratch,
            update_scratch_size: scratch,
        }
    }
}

/// Box nodes the bottom-up reduction allocates for `leaves` leaves.
pub fn internal_node_count(leaves: u64) -> u64 {
    let mut n = leaves;
    let mut total = 0;
    while n > 1 {
        n = n.div_ceil(4);
        total += n;
    }
    total
}

/// Sizes for building `geometries` with up to `max_primitive_counts[i]` primitives each.
///
/// Pure: no geometry data is read.
pub fn get_build_sizes(geometries: &[Geometry<'_>], max_primitive_counts: &[u32]) -> BuildSizes {
    let mut counts = PrimitiveCounts::default();
    for (geometry, &count) in geometries.iter().zip(max_primitive_counts) {
        counts.add(geometry.kind(), count as u64);
    }
    counts.sizes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(t: u64, a: u64, i: u64) -> BuildSizes {
        PrimitiveCounts { triangles: t, aabbs: a, instances: i }.sizes()
    }

    #[test]
    fn test_internal_node_count() {
        assert_eq!(internal_node_count(0), 0);
        assert_eq!(internal_node_count(1), 0);
        assert_eq!(internal_node_count(4), 1);
        assert_eq!(internal_node_count(5), 3);
        assert_eq!(internal_node_count(17), 5 + 2 + 1);
    }

    #[test]
    fn test_sizes_formula() {
        assert_eq!(sizes(0, 0, 0).structure_size, 192);
        assert_eq!(sizes(1, 0, 0).structure_size, 192 + 64);
        assert_eq!(sizes(5, 0, 0).structure_size, 192 + 5 * 64 + 3 * 128);
        assert_eq!(sizes(0, 0, 2).structure_size, 192 + 2 * 128 + 128);

        assert_eq!(sizes(10, 0, 0).build_scratch_size, MIN_SCRATCH_SIZE);
        let big = sizes(1000, 0, 0);
        assert_eq!(big.build_scratch_size, 8000);
        assert_eq!(big.update_scratch_size, big.build_scratch_size);
    }

    #[test]
    fn test_sizes_monotonic() {
        for base in [0u64, 1, 3, 4, 15, 64, 1023] {
            let s = sizes(base, base / 2, base / 3);
            for (dt, da, di) in [(1, 0, 0), (0, 1, 0), (0, 0, 1)] {
                let n = sizes(base + dt, base / 2 + da, base / 3 + di);
                assert!(n.structure_size >= s.structure_size);
                assert!(n.build_scratch_size >= s.build_scratch_size);
            }
        }
    }
}
