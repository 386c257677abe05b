//! Geometry descriptors and primitive decoding shared by both builders.

use bytemuck::{Pod, Zeroable};
use half::f16;
use serde::{Deserialize, Serialize};

use crate::memory::{DeviceAddress, DeviceMemory, DeviceOrHostAddress};
use crate::util::{transform_point, Aabb, Error, Result, Rows3x4, Vec3};

/// Geometry is opaque: any-hit stages are skipped for it.
pub const GEOMETRY_OPAQUE: u32 = 1;
/// Any-hit runs at most once per primitive.
pub const GEOMETRY_NO_DUPLICATE_ANY_HIT: u32 = 2;

/// Bit position of the geometry flags in a leaf's geometry id field.
pub const GEOMETRY_FLAGS_SHIFT: u32 = 28;

/// Disable facing culling for this instance.
pub const INSTANCE_TRIANGLE_FACING_CULL_DISABLE: u32 = 1;
/// Swap front and back faces.
pub const INSTANCE_TRIANGLE_FLIP_FACING: u32 = 2;
pub const INSTANCE_FORCE_OPAQUE: u32 = 4;
pub const INSTANCE_FORCE_NO_OPAQUE: u32 = 8;

/// Identity 3x4 transform.
pub const IDENTITY_TRANSFORM: Rows3x4 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

/// Vertex position formats a triangle geometry may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VertexFormat {
    R32G32B32Sfloat,
    R32G32B32A32Sfloat,
    R16G16B16Sfloat,
    R16G16B16A16Sfloat,
    R16G16Sfloat,
    R32G32Sfloat,
    R16G16Snorm,
    R16G16B16A16Snorm,
    R16G16B16A16Unorm,
}

impl VertexFormat {
    /// Bytes one vertex occupies.
    pub const fn size(self) -> usize {
        match self {
            Self::R32G32B32Sfloat => 12,
            Self::R32G32B32A32Sfloat => 16,
            Self::R16G16B16Sfloat => 6,
            Self::R16G16B16A16Sfloat | Self::R16G16B16A16Snorm | Self::R16G16B16A16Unorm => 8,
            Self::R16G16Sfloat | Self::R16G16Snorm => 4,
            Self::R32G32Sfloat => 8,
        }
    }

    /// Position components stored; missing ones read as zero.
    pub const fn components(self) -> usize {
        match self {
            Self::R16G16Sfloat | Self::R32G32Sfloat | Self::R16G16Snorm => 2,
            _ => 3,
        }
    }

    /// Decode the position at the start of `bytes`.
    pub fn decode(self, bytes: &[u8]) -> Vec3 {
        let mut v = [0.0f32; 3];
        let n = self.components();
        for (i, c) in v.iter_mut().enumerate().take(n) {
            *c = match self {
                Self::R32G32B32Sfloat | Self::R32G32B32A32Sfloat | Self::R32G32Sfloat => {
                    f32::from_le_bytes(lane(bytes, i * 4))
                }
                Self::R16G16B16Sfloat | Self::R16G16B16A16Sfloat | Self::R16G16Sfloat => {
                    f16::from_bits(u16::from_le_bytes(lane(bytes, i * 2))).to_f32()
                }
                Self::R16G16Snorm | Self::R16G16B16A16Snorm => {
                    let x = i16::from_le_bytes(lane(bytes, i * 2));
                    (x as f32 / 32767.0).max(-1.0)
                }
                Self::R16G16B16A16Unorm => {
                    let x = u16::from_le_bytes(lane(bytes, i * 2));
                    (x as f32 / 65535.0).min(1.0)
                }
            };
        }
        Vec3::from_array(v)
    }
}

#[inline]
fn lane<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

/// Index buffer element type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    /// Vertices are consumed three at a time.
    #[default]
    None,
    U8,
    U16,
    U32,
}

impl IndexType {
    pub const fn size(self) -> usize {
        match self {
            Self::None => 0,
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Decode the index at the start of `bytes`.
    pub fn decode(self, bytes: &[u8]) -> u32 {
        match self {
            Self::None => 0,
            Self::U8 => bytes[0] as u32,
            Self::U16 => u16::from_le_bytes(lane(bytes, 0)) as u32,
            Self::U32 => u32::from_le_bytes(lane(bytes, 0)),
        }
    }
}

/// Triangle mesh input.
#[derive(Debug, Clone, Copy)]
pub struct TrianglesData<'a> {
    pub vertex_format: VertexFormat,
    pub vertex_data: DeviceOrHostAddress<'a>,
    pub vertex_stride: u64,
    pub max_vertex: u32,
    pub index_type: IndexType,
    pub index_data: DeviceOrHostAddress<'a>,
    /// Optional 3x4 row-major transform; null means identity.
    pub transform_data: DeviceOrHostAddress<'a>,
}

/// Procedural primitives, one `[min.xyz, max.xyz]` box each.
#[derive(Debug, Clone, Copy)]
pub struct AabbsData<'a> {
    pub data: DeviceOrHostAddress<'a>,
    pub stride: u64,
}

/// Instances of other structures.
#[derive(Debug, Clone, Copy)]
pub struct InstancesData<'a> {
    /// Packed [`InstanceRecord`]s, or device addresses of them.
    pub data: DeviceOrHostAddress<'a>,
    pub array_of_pointers: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum GeometryData<'a> {
    Triangles(TrianglesData<'a>),
    Aabbs(AabbsData<'a>),
    Instances(InstancesData<'a>),
}

/// One geometry of a build.
#[derive(Debug, Clone, Copy)]
pub struct Geometry<'a> {
    pub data: GeometryData<'a>,
    pub flags: u32,
}

impl<'a> Geometry<'a> {
    pub fn triangles(data: TrianglesData<'a>, flags: u32) -> Self {
        Self { data: GeometryData::Triangles(data), flags }
    }

    pub fn aabbs(data: AabbsData<'a>, flags: u32) -> Self {
        Self { data: GeometryData::Aabbs(data), flags }
    }

    pub fn instances(data: InstancesData<'a>, flags: u32) -> Self {
        Self { data: GeometryData::Instances(data), flags }
    }

    pub fn kind(&self) -> GeometryKind {
        match self.data {
            GeometryData::Triangles(_) => GeometryKind::Triangles,
            GeometryData::Aabbs(_) => GeometryKind::Aabbs,
            GeometryData::Instances(_) => GeometryKind::Instances,
        }
    }

    /// Leaf id field: geometry index with the flags in the top bits.
    #[inline]
    pub fn id_and_flags(&self, index: u32) -> u32 {
        index | (self.flags << GEOMETRY_FLAGS_SHIFT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeometryKind {
    Triangles,
    Aabbs,
    Instances,
}

/// Slice of a geometry consumed by a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildRange {
    pub primitive_count: u32,
    /// Bytes into the index data (indexed meshes), vertex data (non-indexed),
    /// box array or instance array.
    pub primitive_offset: u32,
    pub first_vertex: u32,
    /// Bytes into the transform data.
    pub transform_offset: u32,
}

impl BuildRange {
    pub fn new(primitive_count: u32) -> Self {
        Self { primitive_count, ..Default::default() }
    }
}

/// Caller-side instance description, 64 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    pub transform: Rows3x4,
    /// Custom index in bits 0..24, mask above.
    pub custom_index_and_mask: u32,
    /// Hit-group offset in bits 0..24, instance flags above.
    pub sbt_offset_and_flags: u32,
    /// Device address of the referenced structure; 0 is null.
    pub accel_reference: u64,
}

impl InstanceRecord {
    pub fn new(transform: Rows3x4, accel_reference: u64) -> Self {
        Self {
            transform,
            custom_index_and_mask: 0xFF << 24,
            sbt_offset_and_flags: 0,
            accel_reference,
        }
    }

    pub fn with_custom_index(mut self, index: u32) -> Self {
        self.custom_index_and_mask = (self.custom_index_and_mask & 0xFF00_0000) | (index & 0x00FF_FFFF);
        self
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.custom_index_and_mask = (self.custom_index_and_mask & 0x00FF_FFFF) | ((mask as u32) << 24);
        self
    }

    pub fn with_sbt_offset(mut self, offset: u32) -> Self {
        self.sbt_offset_and_flags = (self.sbt_offset_and_flags & 0xFF00_0000) | (offset & 0x00FF_FFFF);
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.sbt_offset_and_flags = (self.sbt_offset_and_flags & 0x00FF_FFFF) | ((flags as u32) << 24);
        self
    }
}

/// Size of [`InstanceRecord`].
pub const INSTANCE_RECORD_SIZE: u64 = std::mem::size_of::<InstanceRecord>() as u64;

/// Random-access byte input a primitive is decoded from.
pub trait ByteSource {
    fn fetch(&self, offset: u64, out: &mut [u8]) -> Result<()>;
}

/// Host-resident input bytes.
pub struct HostSource<'a>(pub &'a [u8]);

impl ByteSource for HostSource<'_> {
    fn fetch(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset).map_err(|_| Error::invalid("offset overflow"))?;
        let src = start
            .checked_add(out.len())
            .and_then(|end| self.0.get(start..end))
            .ok_or_else(|| Error::invalid(format!("host data too short: {} bytes at {}", out.len(), offset)))?;
        out.copy_from_slice(src);
        Ok(())
    }
}

/// Device memory seen from a base address.
pub struct DeviceSource<'m> {
    pub memory: &'m dyn DeviceMemory,
    pub base: DeviceAddress,
}

impl ByteSource for DeviceSource<'_> {
    fn fetch(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.memory.read(self.base + offset, out)
    }
}

/// Resolved inputs of one triangle geometry.
pub struct TriangleSource<'s> {
    pub vertex_format: VertexFormat,
    pub vertex_stride: u64,
    pub index_type: IndexType,
    pub vertices: &'s dyn ByteSource,
    pub indices: Option<&'s dyn ByteSource>,
    pub transform: Option<Rows3x4>,
}

impl TriangleSource<'_> {
    /// World positions of triangle `p` of `range`.
    pub fn triangle(&self, range: &BuildRange, p: u32) -> Result<[Vec3; 3]> {
        let mut out = [Vec3::ZERO; 3];
        let mut buf = [0u8; 16];
        for (v, pos) in out.iter_mut().enumerate() {
            let corner = p as u64 * 3 + v as u64;
            let vertex_offset = match self.indices {
                Some(indices) => {
                    let size = self.index_type.size();
                    let ib = &mut buf[..size];
                    indices.fetch(range.primitive_offset as u64 + corner * size as u64, ib)?;
                    let index = self.index_type.decode(ib) as u64 + range.first_vertex as u64;
                    index * self.vertex_stride
                }
                None => {
                    range.primitive_offset as u64
                        + (range.first_vertex as u64 + corner) * self.vertex_stride
                }
            };

            let vb = &mut buf[..self.vertex_format.size()];
            self.vertices.fetch(vertex_offset, vb)?;
            let local = self.vertex_format.decode(vb);
            *pos = match &self.transform {
                Some(m) => transform_point(m, local),
                None => local,
            };
        }
        Ok(out)
    }
}

/// Read a 3x4 transform.
pub fn read_transform(src: &dyn ByteSource, offset: u64) -> Result<Rows3x4> {
    let mut b = [0u8; 48];
    src.fetch(offset, &mut b)?;
    Ok(bytemuck::pod_read_unaligned(&b))
}

/// Read box `p` of an AABB geometry.
pub fn read_aabb(src: &dyn ByteSource, range: &BuildRange, stride: u64, p: u32) -> Result<Aabb> {
    let mut b = [0u8; 24];
    src.fetch(range.primitive_offset as u64 + p as u64 * stride, &mut b)?;
    Ok(Aabb::from_array(bytemuck::pod_read_unaligned(&b)))
}

/// Read instance record `p`, following the pointer array when present.
pub fn read_instance(
    src: &dyn ByteSource,
    memory: Option<&dyn DeviceMemory>,
    range: &BuildRange,
    array_of_pointers: bool,
    p: u32,
) -> Result<InstanceRecord> {
    let mut b = [0u8; INSTANCE_RECORD_SIZE as usize];
    if array_of_pointers {
        let mut ptr = [0u8; 8];
        src.fetch(range.primitive_offset as u64 + p as u64 * 8, &mut ptr)?;
        let memory = memory.ok_or_else(|| Error::invalid("instance pointers need device memory"))?;
        memory.read(u64::from_le_bytes(ptr), &mut b)?;
    } else {
        src.fetch(range.primitive_offset as u64 + p as u64 * INSTANCE_RECORD_SIZE, &mut b)?;
    }
    Ok(bytemuck::pod_read_unaligned(&b))
}
