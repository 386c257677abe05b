//! Ray-tracing pipelines and the shader-call dispatcher.
//!
//! A pipeline flattens every shader group into one state machine driven by
//! a single "current index":
//!
//! | index | state |
//! |-------|-------|
//! | 0 | return to the launcher, ends the invocation |
//! | 1 | BVH traversal |
//! | `2 + i` | entry of group `i` (general or closest-hit shader) |
//! | `> group_count + 1` | resume points after trace/callable calls |
//!
//! Calls keep their frames on a software stack in per-invocation scratch
//! memory. Any-hit and intersection shaders run inline during traversal
//! and never touch the call stack.
//!
//! - [`shader`] - stages, continuation segments, shader context
//! - [`group`] - shader groups, state table, handles, stack sizes
//! - [`sbt`] - shader binding table regions
//! - [`dispatch`] - the dispatcher loop and `trace_rays`
//! - [`traversal`] - the BVH walk run at index 1

pub mod dispatch;
pub mod group;
pub mod sbt;
pub mod shader;
pub mod traversal;

use std::sync::Arc;

use crate::util::Result;

pub use group::{GroupShader, GroupStackSize, Pipeline, PipelineCreateInfo, ShaderGroup};
pub use sbt::{SbtLayout, SbtRegion, ShaderBindingTable};
pub use shader::{
    AnyHitStatus, Exit, RayState, Shader, ShaderCode, ShaderContext, ShaderStage, TraceArgs,
};
pub use traversal::{Intersector, SoftwareIntersector};

/// Continuation segment of a suspendable shader.
pub type SegmentFn = Arc<dyn Fn(&mut ShaderContext<'_>) -> Result<Exit> + Send + Sync>;
/// Any-hit body.
pub type AnyHitFn = Arc<dyn Fn(&mut ShaderContext<'_>) -> Result<AnyHitStatus> + Send + Sync>;
/// Intersection body; reports hits through [`ShaderContext::report_intersection`].
pub type IntersectionFn = Arc<dyn Fn(&mut ShaderContext<'_>) -> Result<()> + Send + Sync>;

/// Bytes per shader group handle.
pub const HANDLE_SIZE: u32 = 32;
/// Largest hit attribute block a shader may report.
pub const MAX_HIT_ATTRIB_SIZE: u32 = 32;
/// Hit attributes sit just below the callee's stack pointer.
pub const HIT_ATTRIB_OFFSET: i64 = -(16 + MAX_HIT_ATTRIB_SIZE as i64);
/// Bytes a call pushes on top of the caller's aligned frame: the hit
/// attribute block plus the 16-byte resume slot.
pub const CALL_OVERHEAD: u32 = MAX_HIT_ATTRIB_SIZE + 16;

/// State index that ends the invocation.
pub const STATE_EXIT: u32 = 0;
/// State index of the traversal loop.
pub const STATE_TRAVERSAL: u32 = 1;
/// State index of the first group entry.
pub const FIRST_GROUP_STATE: u32 = 2;

/// Ray flags.
pub mod ray_flags {
    pub const OPAQUE: u32 = 1;
    pub const NO_OPAQUE: u32 = 2;
    pub const TERMINATE_ON_FIRST_HIT: u32 = 4;
    pub const SKIP_CLOSEST_HIT_SHADER: u32 = 8;
    pub const CULL_BACK_FACING_TRIANGLES: u32 = 16;
    pub const CULL_FRONT_FACING_TRIANGLES: u32 = 32;
    pub const CULL_OPAQUE: u32 = 0x40;
    pub const CULL_NO_OPAQUE: u32 = 0x80;
    pub const SKIP_TRIANGLES: u32 = 0x100;
    pub const SKIP_AABBS: u32 = 0x200;
}

/// Hit kind of a front-facing triangle hit.
pub const HIT_KIND_FRONT_FACING: u32 = 0xFE;
/// Hit kind of a back-facing triangle hit.
pub const HIT_KIND_BACK_FACING: u32 = 0xFF;
