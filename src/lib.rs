//! # rtaccel
//!
//! Bounding-volume hierarchies for ray queries, and a software dispatcher
//! that runs a graph of ray-tracing shader stages as one flat parallel
//! launch.
//!
//! Device memory is modelled by the [`memory::DeviceMemory`] trait: every
//! structure, scratch buffer and shader binding table lives at a 64-bit
//! device address inside caller-owned regions. [`memory::Heap`] is the
//! in-process implementation used by the CLI and the tests.
//!
//! ## Modules
//!
//! - [`util`] - Errors, math re-exports, little-endian field access
//! - [`memory`] - Device address space and buffer mapping
//! - [`bvh`] - Node formats, size estimation, host builder, inspection
//! - [`kernels`] - Leaf, internal-node and copy kernels
//! - [`command`] - Recorded dispatches/barriers and their queue
//! - [`accel`] - Structure handles, device builds, copy and serialization
//! - [`pipeline`] - Shader groups, binding tables, dispatcher, traversal
//! - [`config`] - JSON settings
//!
//! ## Example
//!
//! ```ignore
//! use rtaccel::prelude::*;
//!
//! let mut heap = Heap::new(1 << 20);
//! let sizes = get_build_sizes(&geometries, &[1]);
//! let region = heap.allocate(sizes.structure_size, MemoryKind::HostVisible)?;
//! let device = Device::new(&heap, Settings::default());
//! let accel = device.create_structure(region)?;
//! device.build(&accel, &geometries, &[BuildRange::new(1)])?;
//! ```

pub mod accel;
pub mod bvh;
pub mod command;
pub mod config;
pub mod kernels;
pub mod memory;
pub mod pipeline;
pub mod util;

// Re-export commonly used types
pub use accel::{AccelerationStructure, Compatibility, Device, PropertyKind};
pub use config::Settings;
pub use util::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::accel::{AccelerationStructure, BuildInfo, Compatibility, Device, PropertyKind};
    pub use crate::bvh::{
        get_build_sizes, AabbsData, AccelHeader, BuildRange, BuildSizes, Geometry, IndexType,
        InstanceRecord, InstancesData, TrianglesData, VertexFormat,
    };
    pub use crate::command::{CommandBuffer, Queue};
    pub use crate::config::Settings;
    pub use crate::memory::{BufferRegion, DeviceAddress, DeviceMemory, DeviceOrHostAddress, Heap, MemoryExt, MemoryKind};
    pub use crate::pipeline::{
        AnyHitStatus, Exit, Pipeline, PipelineCreateInfo, SbtLayout, Shader, ShaderBindingTable,
        ShaderContext, ShaderGroup, TraceArgs,
    };
    pub use crate::util::{Error, Result, Vec3};
}
