//! BVH data model and the host-side builder.
//!
//! - [`format`] - node and header layouts
//! - [`geometry`] - geometry descriptors and primitive decoding
//! - [`sizes`] - buffer/scratch size estimation
//! - [`host_build`] - synchronous construction into a mapped buffer
//! - [`inspect`] - node census of a finished structure

pub mod format;
pub mod geometry;
pub mod host_build;
pub mod inspect;
pub mod sizes;

pub use format::{
    AabbNode, AccelHeader, BoxNode, InstanceNode, NodeType, SerializationHeader, TriangleNode,
    ROOT_NODE_ID,
};
pub use geometry::{
    AabbsData, BuildRange, Geometry, GeometryData, GeometryKind, IndexType, InstanceRecord,
    InstancesData, TrianglesData, VertexFormat,
};
pub use inspect::{inspect, TreeStats};
pub use sizes::{get_build_sizes, BuildSizes, PrimitiveCounts};
