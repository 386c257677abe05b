//! JSON scene files.
//!
//! ```json
//! {
//!   "meshes": [{ "name": "tri", "positions": [[0,0,0],[1,0,0],[0,1,0]] }],
//!   "aabbs": [{ "name": "box", "boxes": [[-1,-1,-1,1,1,1]] }],
//!   "instances": [{ "source": "tri", "transform": [[1,0,0,5],[0,1,0,0],[0,0,1,0]] }]
//! }
//! ```
//!
//! Without instances every mesh and box list goes into one structure.
//! With instances, each mesh and box list becomes its own structure and
//! the instances form the top level.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use rtaccel::bvh::geometry::{GEOMETRY_OPAQUE, IDENTITY_TRANSFORM};
use rtaccel::bvh::{
    get_build_sizes, AabbsData, AccelHeader, BuildRange, BuildSizes, Geometry, IndexType,
    InstanceRecord, InstancesData, TrianglesData, VertexFormat,
};
use rtaccel::memory::{DeviceOrHostAddress, Heap, MemoryKind};
use rtaccel::util::Rows3x4;
use rtaccel::{AccelerationStructure, Device, Error, Result, Settings};

fn default_true() -> bool {
    true
}

fn default_mask() -> u8 {
    0xFF
}

fn identity() -> Rows3x4 {
    IDENTITY_TRANSFORM
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mesh {
    #[serde(default)]
    pub name: Option<String>,
    pub positions: Vec<[f32; 3]>,
    #[serde(default)]
    pub indices: Option<Vec<u32>>,
    #[serde(default)]
    pub transform: Option<Rows3x4>,
    #[serde(default = "default_true")]
    pub opaque: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AabbList {
    #[serde(default)]
    pub name: Option<String>,
    /// `[min.xyz, max.xyz]` per primitive.
    pub boxes: Vec<[f32; 6]>,
    #[serde(default = "default_true")]
    pub opaque: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    /// Name of a mesh or box list.
    pub source: String,
    #[serde(default = "identity")]
    pub transform: Rows3x4,
    #[serde(default = "default_mask")]
    pub mask: u8,
    #[serde(default)]
    pub custom_index: u32,
    #[serde(default)]
    pub sbt_offset: u32,
    #[serde(default)]
    pub flags: u8,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Scene {
    pub meshes: Vec<Mesh>,
    pub aabbs: Vec<AabbList>,
    pub instances: Vec<Instance>,
}

/// Host bytes of one geometry, kept alive while builds borrow them.
enum Encoded {
    Triangles {
        vertices: Vec<u8>,
        indices: Option<Vec<u8>>,
        transform: Option<Vec<u8>>,
        max_vertex: u32,
        count: u32,
        flags: u32,
    },
    Aabbs {
        data: Vec<u8>,
        count: u32,
        flags: u32,
    },
    Instances {
        records: Vec<u8>,
        count: u32,
    },
}

impl Encoded {
    fn geometry(&self) -> Geometry<'_> {
        match self {
            Self::Triangles { vertices, indices, transform, max_vertex, flags, .. } => Geometry::triangles(
                TrianglesData {
                    vertex_format: VertexFormat::R32G32B32Sfloat,
                    vertex_data: DeviceOrHostAddress::Host(vertices),
                    vertex_stride: 12,
                    max_vertex: *max_vertex,
                    index_type: if indices.is_some() { IndexType::U32 } else { IndexType::None },
                    index_data: indices.as_deref().map_or(DeviceOrHostAddress::NULL, DeviceOrHostAddress::Host),
                    transform_data: transform.as_deref().map_or(DeviceOrHostAddress::NULL, DeviceOrHostAddress::Host),
                },
                *flags,
            ),
            Self::Aabbs { data, flags, .. } => {
                Geometry::aabbs(AabbsData { data: DeviceOrHostAddress::Host(data), stride: 24 }, *flags)
            }
            Self::Instances { records, .. } => Geometry::instances(
                InstancesData { data: DeviceOrHostAddress::Host(records), array_of_pointers: false },
                0,
            ),
        }
    }

    fn count(&self) -> u32 {
        match self {
            Self::Triangles { count, .. } | Self::Aabbs { count, .. } | Self::Instances { count, .. } => *count,
        }
    }
}

fn opaque_flags(opaque: bool) -> u32 {
    if opaque {
        GEOMETRY_OPAQUE
    } else {
        0
    }
}

fn encode_mesh(mesh: &Mesh) -> Result<Encoded> {
    let vertex_count = mesh.positions.len() as u32;
    let count = match &mesh.indices {
        Some(indices) => {
            if indices.len() % 3 != 0 {
                return Err(Error::invalid("mesh index count is not a multiple of 3"));
            }
            if let Some(bad) = indices.iter().find(|&&i| i >= vertex_count) {
                return Err(Error::invalid(format!("mesh index {bad} out of range ({vertex_count} vertices)")));
            }
            indices.len() / 3
        }
        None => mesh.positions.len() / 3,
    };
    Ok(Encoded::Triangles {
        vertices: bytemuck::cast_slice(&mesh.positions).to_vec(),
        indices: mesh.indices.as_ref().map(|i| bytemuck::cast_slice(i).to_vec()),
        transform: mesh.transform.as_ref().map(|t| bytemuck::bytes_of(t).to_vec()),
        max_vertex: vertex_count.saturating_sub(1),
        count: count as u32,
        flags: opaque_flags(mesh.opaque),
    })
}

fn encode_aabbs(list: &AabbList) -> Encoded {
    Encoded::Aabbs {
        data: bytemuck::cast_slice(&list.boxes).to_vec(),
        count: list.boxes.len() as u32,
        flags: opaque_flags(list.opaque),
    }
}

fn sizes_of(encoded: &[Encoded]) -> BuildSizes {
    let geometries: Vec<_> = encoded.iter().map(Encoded::geometry).collect();
    let counts: Vec<_> = encoded.iter().map(Encoded::count).collect();
    get_build_sizes(&geometries, &counts)
}

fn build_one(
    device: &Device<'_>,
    accel: &AccelerationStructure,
    encoded: &[Encoded],
) -> Result<AccelHeader> {
    let geometries: Vec<_> = encoded.iter().map(Encoded::geometry).collect();
    let ranges: Vec<_> = encoded.iter().map(|e| BuildRange::new(e.count())).collect();
    device.build(accel, &geometries, &ranges)
}

/// Result of building a scene into a heap.
pub struct BuiltScene {
    pub root: AccelerationStructure,
    pub header: AccelHeader,
    /// Structures built, top level included.
    pub structures: usize,
}

impl Scene {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Named bottom-level sources: meshes first, then box lists.
    fn sources(&self) -> Result<Vec<(String, Encoded)>> {
        let mut out = Vec::with_capacity(self.meshes.len() + self.aabbs.len());
        for (i, mesh) in self.meshes.iter().enumerate() {
            let name = mesh.name.clone().unwrap_or_else(|| format!("mesh{i}"));
            out.push((name, encode_mesh(mesh)?));
        }
        for (i, list) in self.aabbs.iter().enumerate() {
            let name = list.name.clone().unwrap_or_else(|| format!("aabbs{i}"));
            out.push((name, encode_aabbs(list)));
        }
        Ok(out)
    }

    fn instance_records(&self, addresses: &HashMap<&str, u64>) -> Result<Encoded> {
        let mut records = Vec::with_capacity(self.instances.len());
        for inst in &self.instances {
            let address = *addresses
                .get(inst.source.as_str())
                .ok_or_else(|| Error::invalid(format!("instance source '{}' not found", inst.source)))?;
            records.push(
                InstanceRecord::new(inst.transform, address)
                    .with_mask(inst.mask)
                    .with_custom_index(inst.custom_index)
                    .with_sbt_offset(inst.sbt_offset)
                    .with_flags(inst.flags),
            );
        }
        Ok(Encoded::Instances {
            records: bytemuck::cast_slice(&records).to_vec(),
            count: records.len() as u32,
        })
    }

    /// Size estimates per structure, bottom level first.
    pub fn sizes(&self) -> Result<Vec<(String, BuildSizes)>> {
        let sources = self.sources()?;
        if self.instances.is_empty() {
            let encoded: Vec<_> = sources.into_iter().map(|(_, e)| e).collect();
            return Ok(vec![("scene".to_string(), sizes_of(&encoded))]);
        }
        let mut out: Vec<_> = sources
            .iter()
            .map(|(name, e)| (name.clone(), sizes_of(std::slice::from_ref(e))))
            .collect();
        let fake: HashMap<&str, u64> = sources.iter().map(|(n, _)| (n.as_str(), 0)).collect();
        let top = self.instance_records(&fake)?;
        out.push(("top".to_string(), sizes_of(std::slice::from_ref(&top))));
        Ok(out)
    }

    /// Allocate and host-build every structure of the scene in `heap`.
    pub fn build(&self, heap: &mut Heap, settings: &Settings) -> Result<BuiltScene> {
        let sources = self.sources()?;

        if self.instances.is_empty() {
            let encoded: Vec<_> = sources.into_iter().map(|(_, e)| e).collect();
            let sizes = sizes_of(&encoded);
            let region = heap.allocate(sizes.structure_size, MemoryKind::HostVisible)?;
            let device = Device::new(&*heap, settings.clone());
            let root = device.create_structure(region)?;
            let header = build_one(&device, &root, &encoded)?;
            info!(size = header.compacted_size, "built single-level scene");
            return Ok(BuiltScene { root, header, structures: 1 });
        }

        let mut regions = Vec::with_capacity(sources.len());
        for (name, encoded) in &sources {
            let sizes = sizes_of(std::slice::from_ref(encoded));
            let region = heap.allocate(sizes.structure_size, MemoryKind::HostVisible)?;
            debug!(name = %name, address = region.address, "allocated bottom level");
            regions.push(region);
        }
        let addresses: HashMap<&str, u64> =
            sources.iter().zip(&regions).map(|((n, _), r)| (n.as_str(), r.address)).collect();
        let top = self.instance_records(&addresses)?;
        let top_sizes = sizes_of(std::slice::from_ref(&top));
        let top_region = heap.allocate(top_sizes.structure_size, MemoryKind::HostVisible)?;

        // children are complete before the top level reads their headers
        let device = Device::new(&*heap, settings.clone());
        for ((_, encoded), region) in sources.iter().zip(&regions) {
            let blas = device.create_structure(*region)?;
            build_one(&device, &blas, std::slice::from_ref(encoded))?;
        }
        let root = device.create_structure(top_region)?;
        let header = build_one(&device, &root, std::slice::from_ref(&top))?;
        info!(instances = header.instance_count, size = header.compacted_size, "built two-level scene");
        Ok(BuiltScene { root, header, structures: sources.len() + 1 })
    }
}
