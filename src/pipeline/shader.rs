//! Shader stages, continuation segments and the per-call shader context.
//!
//! A shader that can trace rays or execute callables is a list of
//! segments. Each segment runs to completion and ends with an [`Exit`];
//! when it asks for a call, the dispatcher saves a resume index pointing
//! at the next segment, runs the callee, and later continues there. The
//! segment after the last one is an implicit return.
//!
//! Any-hit and intersection shaders never suspend: they run inline inside
//! traversal and answer with an [`AnyHitStatus`] or with
//! [`ShaderContext::report_intersection`].

use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;

use super::{AnyHitFn, IntersectionFn, SegmentFn, HIT_ATTRIB_OFFSET, MAX_HIT_ATTRIB_SIZE};
use crate::memory::{DeviceAddress, DeviceMemory};
use crate::util::{Error, Result, Vec3};

/// Ray-tracing pipeline stage of a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Raygen,
    AnyHit,
    ClosestHit,
    Miss,
    Intersection,
    Callable,
}

impl ShaderStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Raygen => "raygen",
            Self::AnyHit => "any-hit",
            Self::ClosestHit => "closest-hit",
            Self::Miss => "miss",
            Self::Intersection => "intersection",
            Self::Callable => "callable",
        }
    }
}

/// Executable body of a shader.
#[derive(Clone)]
pub enum ShaderCode {
    /// Continuation segments of a raygen, closest-hit, miss or callable shader.
    Segments(Vec<SegmentFn>),
    AnyHit(AnyHitFn),
    Intersection(IntersectionFn),
}

/// One shader stage of a pipeline.
#[derive(Clone)]
pub struct Shader {
    stage: ShaderStage,
    /// Bytes of scratch the shader uses above its stack pointer.
    stack_size: u32,
    code: ShaderCode,
}

impl fmt::Debug for Shader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shader")
            .field("stage", &self.stage)
            .field("stack_size", &self.stack_size)
            .field("segments", &self.segment_count())
            .finish()
    }
}

impl Shader {
    fn cps(stage: ShaderStage, stack_size: u32) -> Self {
        Self { stage, stack_size, code: ShaderCode::Segments(Vec::new()) }
    }

    pub fn raygen(stack_size: u32) -> Self {
        Self::cps(ShaderStage::Raygen, stack_size)
    }

    pub fn closest_hit(stack_size: u32) -> Self {
        Self::cps(ShaderStage::ClosestHit, stack_size)
    }

    pub fn miss(stack_size: u32) -> Self {
        Self::cps(ShaderStage::Miss, stack_size)
    }

    pub fn callable(stack_size: u32) -> Self {
        Self::cps(ShaderStage::Callable, stack_size)
    }

    pub fn any_hit<F>(stack_size: u32, f: F) -> Self
    where
        F: Fn(&mut ShaderContext<'_>) -> Result<AnyHitStatus> + Send + Sync + 'static,
    {
        Self { stage: ShaderStage::AnyHit, stack_size, code: ShaderCode::AnyHit(Arc::new(f)) }
    }

    pub fn intersection<F>(stack_size: u32, f: F) -> Self
    where
        F: Fn(&mut ShaderContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            stage: ShaderStage::Intersection,
            stack_size,
            code: ShaderCode::Intersection(Arc::new(f)),
        }
    }

    /// Append a continuation segment.
    ///
    /// Ignored for any-hit and intersection shaders, which have a single body.
    pub fn then<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ShaderContext<'_>) -> Result<Exit> + Send + Sync + 'static,
    {
        if let ShaderCode::Segments(segments) = &mut self.code {
            segments.push(Arc::new(f));
        }
        self
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    #[inline]
    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    #[inline]
    pub fn code(&self) -> &ShaderCode {
        &self.code
    }

    /// Number of continuation segments (0 for inline stages).
    pub fn segment_count(&self) -> usize {
        match &self.code {
            ShaderCode::Segments(s) => s.len(),
            _ => 0,
        }
    }
}

/// Arguments of a trace-ray call, masked to their architectural widths
/// when the call is issued.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceArgs {
    /// Top-level structure address; 0 always misses.
    pub accel: DeviceAddress,
    pub flags: u32,
    pub cull_mask: u32,
    pub sbt_offset: u32,
    pub sbt_stride: u32,
    pub miss_index: u32,
    pub origin: Vec3,
    pub tmin: f32,
    pub direction: Vec3,
    pub tmax: f32,
    /// Payload offset relative to the caller's stack pointer.
    pub payload: u32,
}

impl TraceArgs {
    /// Ray against `accel` with a full cull mask and the first hit/miss records.
    pub fn new(accel: DeviceAddress, origin: Vec3, direction: Vec3, tmax: f32) -> Self {
        Self {
            accel,
            flags: 0,
            cull_mask: 0xFF,
            sbt_offset: 0,
            sbt_stride: 0,
            miss_index: 0,
            origin,
            tmin: 0.0,
            direction,
            tmax,
            payload: 0,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_cull_mask(mut self, mask: u32) -> Self {
        self.cull_mask = mask;
        self
    }

    pub fn with_payload(mut self, payload: u32) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_miss_index(mut self, index: u32) -> Self {
        self.miss_index = index;
        self
    }

    pub fn with_sbt(mut self, offset: u32, stride: u32) -> Self {
        self.sbt_offset = offset;
        self.sbt_stride = stride;
        self
    }

    pub fn with_tmin(mut self, tmin: f32) -> Self {
        self.tmin = tmin;
        self
    }
}

/// How a continuation segment ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Exit {
    /// Return to the caller (or finish the launch from raygen).
    Return,
    /// Trace a ray and resume at the next segment.
    TraceRay(TraceArgs),
    /// Run callable record `sbt_index` and resume at the next segment.
    ExecuteCallable { sbt_index: u32, payload: u32 },
}

/// Verdict of an any-hit shader on a candidate hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnyHitStatus {
    Accept,
    Ignore,
    AcceptAndTerminate,
}

/// Ray and hit variables visible to shaders.
///
/// Reflects the most recent trace of the invocation; a shader that traces
/// again must keep what it needs in its own frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayState {
    pub accel: DeviceAddress,
    pub flags: u32,
    pub cull_mask: u32,
    pub sbt_offset: u32,
    pub sbt_stride: u32,
    pub miss_index: u32,
    pub origin: Vec3,
    pub tmin: f32,
    pub direction: Vec3,
    pub tmax: f32,
    pub primitive_id: u32,
    pub geometry_id_and_flags: u32,
    pub instance_id: u32,
    /// Address of the hit instance node, 0 outside instances.
    pub instance_addr: DeviceAddress,
    pub custom_instance_and_mask: u32,
    pub hit_kind: u32,
}

impl Default for RayState {
    fn default() -> Self {
        Self {
            accel: 0,
            flags: 0,
            cull_mask: 0,
            sbt_offset: 0,
            sbt_stride: 0,
            miss_index: 0,
            origin: Vec3::ZERO,
            tmin: 0.0,
            direction: Vec3::ZERO,
            tmax: 0.0,
            primitive_id: 0,
            geometry_id_and_flags: 0,
            instance_id: 0,
            instance_addr: 0,
            custom_instance_and_mask: 0,
            hit_kind: 0,
        }
    }
}

impl RayState {
    #[inline]
    pub fn geometry_index(&self) -> u32 {
        self.geometry_id_and_flags & 0x0FFF_FFFF
    }

    #[inline]
    pub fn custom_index(&self) -> u32 {
        self.custom_instance_and_mask & 0x00FF_FFFF
    }
}

/// Intersection reports of one procedural candidate.
pub(crate) struct IntersectionReport {
    pub any_hit: Option<AnyHitFn>,
    pub opaque: bool,
    pub committed: bool,
    pub terminated: bool,
    pub attributes: [u8; MAX_HIT_ATTRIB_SIZE as usize],
}

impl IntersectionReport {
    pub fn new(any_hit: Option<AnyHitFn>, opaque: bool) -> Self {
        Self {
            any_hit,
            opaque,
            committed: false,
            terminated: false,
            attributes: [0; MAX_HIT_ATTRIB_SIZE as usize],
        }
    }
}

/// What a shader sees while it runs: its scratch frame, its payload, the
/// ray variables and device memory.
pub struct ShaderContext<'a> {
    pub(crate) memory: &'a dyn DeviceMemory,
    pub(crate) scratch: &'a mut [u8],
    pub(crate) stack_ptr: u32,
    pub(crate) arg: i64,
    pub(crate) shader_record: DeviceAddress,
    pub(crate) launch_id: [u32; 3],
    pub(crate) launch_size: [u32; 3],
    pub(crate) ray: RayState,
    pub(crate) report: Option<&'a mut IntersectionReport>,
}

impl<'a> ShaderContext<'a> {
    #[inline]
    pub fn memory(&self) -> &'a dyn DeviceMemory {
        self.memory
    }

    #[inline]
    pub fn launch_id(&self) -> [u32; 3] {
        self.launch_id
    }

    #[inline]
    pub fn launch_size(&self) -> [u32; 3] {
        self.launch_size
    }

    /// Address of the inline data following this shader's handle in the SBT.
    #[inline]
    pub fn shader_record(&self) -> DeviceAddress {
        self.shader_record
    }

    #[inline]
    pub fn ray(&self) -> &RayState {
        &self.ray
    }

    #[inline]
    pub fn stack_ptr(&self) -> u32 {
        self.stack_ptr
    }

    fn range(&self, rel: i64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = self.stack_ptr as i64 + rel;
        let end = start + len as i64;
        if start < 0 || end > self.scratch.len() as i64 {
            return Err(Error::StackOverflow {
                required: end.max(0) as usize,
                available: self.scratch.len(),
            });
        }
        Ok(start as usize..end as usize)
    }

    fn load<T: Pod>(&self, rel: i64) -> Result<T> {
        let r = self.range(rel, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(&self.scratch[r]))
    }

    fn store<T: Pod>(&mut self, rel: i64, value: &T) -> Result<()> {
        let r = self.range(rel, std::mem::size_of::<T>())?;
        self.scratch[r].copy_from_slice(bytemuck::bytes_of(value));
        Ok(())
    }

    /// Load from the shader's own frame.
    pub fn read_local<T: Pod>(&self, offset: u32) -> Result<T> {
        self.load(offset as i64)
    }

    pub fn write_local<T: Pod>(&mut self, offset: u32, value: &T) -> Result<()> {
        self.store(offset as i64, value)
    }

    /// Load the payload (or callable data) this shader was invoked with.
    pub fn read_payload<T: Pod>(&self) -> Result<T> {
        self.load(self.arg)
    }

    pub fn write_payload<T: Pod>(&mut self, value: &T) -> Result<()> {
        self.store(self.arg, value)
    }

    /// Hit attributes of the current hit; triangles store their two
    /// barycentric weights here.
    pub fn hit_attributes<T: Pod>(&self) -> Result<T> {
        self.load(HIT_ATTRIB_OFFSET)
    }

    /// Barycentric weights of the second and third vertex.
    pub fn barycentrics(&self) -> Result<[f32; 2]> {
        self.hit_attributes()
    }

    /// Report a procedural hit from an intersection shader.
    ///
    /// The hit is considered when `tmin <= t <= tmax`; a non-opaque hit
    /// runs the paired any-hit shader first. Returns whether the hit was
    /// committed. After an accept-and-terminate verdict later reports are
    /// ignored.
    pub fn report_intersection(&mut self, t: f32, hit_kind: u32, attributes: &[u8]) -> Result<bool> {
        if attributes.len() > MAX_HIT_ATTRIB_SIZE as usize {
            return Err(Error::InvalidPipeline(format!(
                "{} bytes of hit attributes, at most {} allowed",
                attributes.len(),
                MAX_HIT_ATTRIB_SIZE
            )));
        }
        let Some(report) = self.report.as_deref() else {
            return Err(Error::InvalidPipeline(
                "report_intersection outside an intersection shader".into(),
            ));
        };
        if report.terminated || !(t >= self.ray.tmin && t <= self.ray.tmax) {
            return Ok(false);
        }
        let any_hit = report.any_hit.clone();
        let opaque = report.opaque;

        let mut status = AnyHitStatus::Accept;
        if let (Some(any_hit), false) = (any_hit, opaque) {
            let mut candidate = [0u8; MAX_HIT_ATTRIB_SIZE as usize];
            candidate[..attributes.len()].copy_from_slice(attributes);
            let saved: [u8; MAX_HIT_ATTRIB_SIZE as usize] = self.load(HIT_ATTRIB_OFFSET)?;
            self.store(HIT_ATTRIB_OFFSET, &candidate)?;

            let mut ray = self.ray;
            ray.tmax = t;
            ray.hit_kind = hit_kind;
            let mut inner = ShaderContext {
                memory: self.memory,
                scratch: &mut *self.scratch,
                stack_ptr: self.stack_ptr,
                arg: self.arg,
                shader_record: self.shader_record,
                launch_id: self.launch_id,
                launch_size: self.launch_size,
                ray,
                report: None,
            };
            status = any_hit(&mut inner)?;
            self.store(HIT_ATTRIB_OFFSET, &saved)?;
        }

        if status == AnyHitStatus::Ignore {
            return Ok(false);
        }

        self.ray.tmax = t;
        self.ray.hit_kind = hit_kind;
        if let Some(report) = self.report.as_deref_mut() {
            report.committed = true;
            report.terminated = status == AnyHitStatus::AcceptAndTerminate;
            report.attributes = [0; MAX_HIT_ATTRIB_SIZE as usize];
            report.attributes[..attributes.len()].copy_from_slice(attributes);
        }
        Ok(true)
    }
}
