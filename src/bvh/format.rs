//! Binary layouts of acceleration-structure nodes and headers.
//!
//! A structure is one contiguous buffer:
//!
//! ```text
//! 0     AccelHeader (64 B)
//! 64    root box node (128 B, fixed slot)
//! 192   leaves: triangles / AABBs, then instances
//! ...   remaining box nodes, bottom level first
//! ```
//!
//! Nodes reference each other through 32-bit node ids:
//! `(byte_offset >> 3) | tag`, resolved against the current BVH base address.
//! Every node is 64-byte aligned, so the low three bits are free for the tag.

use bytemuck::{Pod, Zeroable};

use crate::util::{Aabb, Vec3, INVALID_CHILD};

/// Size of [`AccelHeader`].
pub const HEADER_SIZE: u64 = 64;
/// Offset of the root box node.
pub const ROOT_NODE_OFFSET: u64 = HEADER_SIZE;
/// Offset of the first leaf: header plus the root placeholder.
pub const HEADER_PAD: u64 = ROOT_NODE_OFFSET + BOX_NODE_SIZE;
/// Offset of the part of the header rewritten after a device build.
pub const HEADER_TAIL_OFFSET: u64 = 32;

pub const TRIANGLE_NODE_SIZE: u64 = 64;
pub const AABB_NODE_SIZE: u64 = 64;
pub const INSTANCE_NODE_SIZE: u64 = 128;
pub const BOX_NODE_SIZE: u64 = 128;

/// Node id of the root slot.
pub const ROOT_NODE_ID: u32 = make_node_id(ROOT_NODE_OFFSET, NodeType::Box32);

/// Value of [`TriangleNode::id`]; marks the node as a single-triangle leaf.
pub const TRIANGLE_NODE_MARKER: u32 = 9;

/// Bytes the copy kernel moves per step.
pub const COPY_CHUNK_SIZE: u64 = 16;
/// Invocations per kernel workgroup.
pub const WORKGROUP_SIZE: u32 = 64;
/// Bytes covered by one copy workgroup in one step; sizes the indirect copy dispatch.
pub const COPY_BYTES_PER_GROUP: u64 = COPY_CHUNK_SIZE * WORKGROUP_SIZE as u64;

/// Mask of the root offset embedded in instance base pointers.
pub const INSTANCE_PTR_LOW_MASK: u64 = 63;

/// Node type tag carried in the low three bits of a node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NodeType {
    Triangle = 0,
    Box32 = 5,
    Instance = 6,
    Aabb = 7,
}

impl NodeType {
    /// Decode the tag of `id`. Unused tags yield `None`.
    #[inline]
    pub const fn of(id: u32) -> Option<Self> {
        match id & 7 {
            0 => Some(Self::Triangle),
            5 => Some(Self::Box32),
            6 => Some(Self::Instance),
            7 => Some(Self::Aabb),
            _ => None,
        }
    }

    /// Node size in bytes.
    #[inline]
    pub const fn size(self) -> u64 {
        match self {
            Self::Triangle => TRIANGLE_NODE_SIZE,
            Self::Aabb => AABB_NODE_SIZE,
            Self::Instance => INSTANCE_NODE_SIZE,
            Self::Box32 => BOX_NODE_SIZE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Triangle => "triangle",
            Self::Box32 => "box",
            Self::Instance => "instance",
            Self::Aabb => "aabb",
        }
    }
}

/// Pack a node offset (relative to the BVH base) and its tag.
#[inline]
pub const fn make_node_id(offset: u64, ty: NodeType) -> u32 {
    ((offset >> 3) as u32) | ty as u32
}

/// Byte offset of a node relative to the BVH base.
#[inline]
pub const fn node_offset(id: u32) -> u64 {
    ((id & !7) as u64) << 3
}

/// Acceleration-structure header at offset 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct AccelHeader {
    /// Node id of the root.
    pub root_node_id: u32,
    pub reserved: u32,
    /// Union of everything in the structure, `[min.xyz, max.xyz]`.
    pub aabb: [f32; 6],
    pub compacted_size: u64,
    pub serialization_size: u64,
    /// Workgroup count (x) for an indirect copy dispatch.
    pub copy_dispatch_size: u32,
    pub instance_count: u32,
    /// Offset of the first instance node.
    pub instance_offset: u64,
}

impl AccelHeader {
    pub fn bounds(&self) -> Aabb {
        Aabb::from_array(self.aabb)
    }

    /// Fill the size fields that derive from the compacted size and instance count.
    pub fn set_sizes(&mut self, compacted_size: u64, instance_count: u32) {
        self.compacted_size = compacted_size;
        self.instance_count = instance_count;
        self.serialization_size = serialization_size(compacted_size, instance_count as u64);
        self.copy_dispatch_size = compacted_size.div_ceil(COPY_BYTES_PER_GROUP) as u32;
    }

    /// Bytes from [`HEADER_TAIL_OFFSET`] to the end of the header.
    pub fn tail_bytes(&self) -> &[u8] {
        &bytemuck::bytes_of(self)[HEADER_TAIL_OFFSET as usize..]
    }
}

/// Single-triangle leaf.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TriangleNode {
    /// Transformed vertex positions.
    pub coords: [[f32; 3]; 3],
    pub reserved: [u32; 3],
    pub triangle_id: u32,
    /// Geometry index in bits 0..28, geometry flags above.
    pub geometry_id_and_flags: u32,
    pub reserved2: u32,
    pub id: u32,
}

impl TriangleNode {
    pub fn vertices(&self) -> [Vec3; 3] {
        self.coords.map(Vec3::from_array)
    }
}

/// Procedural-primitive leaf.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AabbNode {
    pub aabb: [f32; 6],
    pub primitive_id: u32,
    pub geometry_id_and_flags: u32,
    pub reserved: [u32; 8],
}

/// Instance leaf: a transformed reference to another structure.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceNode {
    /// Child structure address with its root node id in the low 6 bits.
    pub base_ptr: u64,
    /// Custom index in bits 0..24, visibility mask above.
    pub custom_instance_and_mask: u32,
    /// Hit-group offset in bits 0..24, instance flags above.
    pub sbt_offset_and_flags: u32,
    /// Inverse of the instance 3x3 in columns 0..3, forward translation in column 3.
    pub wto_matrix: [[f32; 4]; 3],
    /// World-space bounds.
    pub aabb: [f32; 6],
    pub instance_id: u32,
    /// Transposed object-to-world 3x3.
    pub otw_matrix: [f32; 9],
}

impl InstanceNode {
    #[inline]
    pub fn child_base(&self) -> u64 {
        self.base_ptr & !INSTANCE_PTR_LOW_MASK
    }

    #[inline]
    pub fn child_root(&self) -> u32 {
        (self.base_ptr & INSTANCE_PTR_LOW_MASK) as u32
    }

    #[inline]
    pub fn mask(&self) -> u32 {
        self.custom_instance_and_mask >> 24
    }

    #[inline]
    pub fn custom_index(&self) -> u32 {
        self.custom_instance_and_mask & 0x00FF_FFFF
    }

    #[inline]
    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & 0x00FF_FFFF
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.sbt_offset_and_flags >> 24
    }
}

/// Internal node with up to four children.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BoxNode {
    pub children: [u32; 4],
    pub coords: [[f32; 6]; 4],
    pub reserved: [u32; 4],
}

impl BoxNode {
    /// Node with every slot unused: NaN bounds and an invalid child id.
    pub fn empty() -> Self {
        Self {
            children: [INVALID_CHILD; 4],
            coords: [Aabb::NAN.to_array(); 4],
            reserved: [0; 4],
        }
    }

    pub fn child_bounds(&self) -> [Aabb; 4] {
        self.coords.map(Aabb::from_array)
    }

    /// Number of slots holding a child.
    pub fn live_children(&self) -> usize {
        self.children.iter().filter(|&&c| c != INVALID_CHILD).count()
    }

    /// Union of the live child bounds.
    pub fn bounds(&self) -> Aabb {
        let mut out = Aabb::EMPTY;
        for b in self.child_bounds() {
            out.expand_by_box(&b);
        }
        out
    }
}

/// Header of a portable (serialized) structure.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SerializationHeader {
    pub driver_uuid: [u8; 16],
    /// All zero for blobs this crate writes.
    pub compat: [u8; 16],
    pub serialization_size: u64,
    pub compacted_size: u64,
    pub instance_count: u64,
}

/// Size of [`SerializationHeader`].
pub const SERIALIZATION_HEADER_SIZE: u64 = std::mem::size_of::<SerializationHeader>() as u64;

/// Bytes of a portable blob for a structure of `compacted_size` with `instance_count` instances.
///
/// The header and pointer table are padded to 128 bytes.
pub fn serialization_size(compacted_size: u64, instance_count: u64) -> u64 {
    let table = SERIALIZATION_HEADER_SIZE + 8 * instance_count;
    compacted_size + table.div_ceil(128) * 128
}

/// Bounds of the node of type `ty` stored at the start of `bytes`.
///
/// Box nodes report the union of their live children; an instance reports
/// its world-space box.
pub fn node_bounds(ty: NodeType, bytes: &[u8]) -> Aabb {
    match ty {
        NodeType::Triangle => {
            let node: TriangleNode = read_node(bytes);
            Aabb::from_points(&node.vertices())
        }
        NodeType::Aabb => {
            let node: AabbNode = read_node(bytes);
            Aabb::from_array(node.aabb)
        }
        NodeType::Instance => {
            let node: InstanceNode = read_node(bytes);
            Aabb::from_array(node.aabb)
        }
        NodeType::Box32 => {
            let node: BoxNode = read_node(bytes);
            node.bounds()
        }
    }
}

/// Read a node from the start of `bytes`, which may be unaligned.
#[inline]
pub fn read_node<T: Pod>(bytes: &[u8]) -> T {
    bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<T>()])
}

/// Store a node at the start of `bytes`.
#[inline]
pub fn write_node<T: Pod>(bytes: &mut [u8], node: &T) {
    let src = bytemuck::bytes_of(node);
    bytes[..src.len()].copy_from_slice(src);
}
