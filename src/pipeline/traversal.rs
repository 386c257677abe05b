//! BVH traversal, the dispatcher's state 1.
//!
//! A depth-first walk over node ids with an explicit stack. Descending
//! into an instance switches the BVH base and transforms the ray into the
//! instance's object space; the world-space ray is restored once the stack
//! unwinds below the depth the instance's root was pushed at.
//!
//! When the stack empties the dispatcher continues at the committed hit's
//! closest-hit shader, at the miss shader, or returns straight to the
//! caller (hit without closest-hit, or closest-hit skipped by flag).

use smallvec::SmallVec;
use tracing::trace;

use super::dispatch::RayInvocation;
use super::ray_flags::*;
use super::sbt::ShaderBindingTable;
use super::shader::{AnyHitStatus, IntersectionReport, RayState, ShaderContext};
use super::{AnyHitFn, HIT_KIND_BACK_FACING, HIT_KIND_FRONT_FACING, MAX_HIT_ATTRIB_SIZE, STATE_EXIT};
use crate::bvh::format::{node_offset, AabbNode, BoxNode, InstanceNode, NodeType, TriangleNode};
use crate::bvh::geometry::{
    GEOMETRY_FLAGS_SHIFT, GEOMETRY_OPAQUE, INSTANCE_FORCE_NO_OPAQUE, INSTANCE_FORCE_OPAQUE,
    INSTANCE_TRIANGLE_FACING_CULL_DISABLE, INSTANCE_TRIANGLE_FLIP_FACING,
};
use crate::config::DEFAULT_TRAVERSAL_STACK_ENTRIES;
use crate::memory::{DeviceAddress, MemoryExt};
use crate::util::{
    intersect_aabb, intersect_box4, intersect_triangle, safe_inv_dir, transform_vector,
    world_to_object_point, Aabb, Error, Result, TriangleHit, Vec3, INVALID_CHILD,
};

type Attributes = [u8; MAX_HIT_ATTRIB_SIZE as usize];

/// Box and triangle tests used by traversal. Implement it to plug in an
/// accelerated intersection routine.
pub trait Intersector: Send + Sync {
    /// Child ids of `node` hit by the ray, nearest first, culled slots
    /// holding [`INVALID_CHILD`].
    fn intersect_box(&self, node: &BoxNode, origin: Vec3, inv_dir: Vec3, tmax: f32) -> [u32; 4];

    fn intersect_triangle(&self, node: &TriangleNode, origin: Vec3, dir: Vec3) -> Option<TriangleHit>;
}

/// Portable slab and watertight tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareIntersector;

impl Intersector for SoftwareIntersector {
    fn intersect_box(&self, node: &BoxNode, origin: Vec3, inv_dir: Vec3, tmax: f32) -> [u32; 4] {
        intersect_box4(&node.children, &node.child_bounds(), origin, inv_dir, tmax)
    }

    fn intersect_triangle(&self, node: &TriangleNode, origin: Vec3, dir: Vec3) -> Option<TriangleHit> {
        intersect_triangle(&node.vertices(), origin, dir)
    }
}

/// Ray and instance variables of the structure currently walked.
#[derive(Debug, Clone, Copy)]
struct Walk {
    bvh_base: DeviceAddress,
    origin: Vec3,
    dir: Vec3,
    inv_dir: Vec3,
    sbt_offset_and_flags: u32,
    instance_id: u32,
    custom_instance_and_mask: u32,
    instance_addr: DeviceAddress,
}

impl Walk {
    fn world(ray: &RayState) -> Self {
        Self {
            bvh_base: ray.accel,
            origin: ray.origin,
            dir: ray.direction,
            inv_dir: safe_inv_dir(ray.direction),
            sbt_offset_and_flags: 0,
            instance_id: 0,
            custom_instance_and_mask: 0,
            instance_addr: 0,
        }
    }

    #[inline]
    fn instance_flags(&self) -> u32 {
        self.sbt_offset_and_flags >> 24
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Committed-hit bookkeeping of one traversal.
#[derive(Default)]
struct Outcome {
    attributes: Option<Attributes>,
    should_return: bool,
}

/// Whether a candidate skips any-hit shaders. Instance flags override the
/// geometry flag; ray flags override both.
pub(crate) fn is_opaque(geometry_id_and_flags: u32, sbt_offset_and_flags: u32, ray_flags: u32) -> bool {
    let mut opaque = geometry_id_and_flags & (GEOMETRY_OPAQUE << GEOMETRY_FLAGS_SHIFT) != 0;
    let instance = sbt_offset_and_flags >> 24;
    if instance & INSTANCE_FORCE_OPAQUE != 0 {
        opaque = true;
    }
    if instance & INSTANCE_FORCE_NO_OPAQUE != 0 {
        opaque = false;
    }
    if ray_flags & OPAQUE != 0 {
        opaque = true;
    }
    if ray_flags & NO_OPAQUE != 0 {
        opaque = false;
    }
    opaque
}

fn push(stack: &mut SmallVec<[u32; DEFAULT_TRAVERSAL_STACK_ENTRIES]>, id: u32, limit: usize) -> Result<()> {
    if stack.len() >= limit {
        return Err(Error::StackOverflow { required: (stack.len() + 1) * 4, available: limit * 4 });
    }
    stack.push(id);
    Ok(())
}

fn pack_attributes(bytes: &[u8]) -> Attributes {
    let mut out = [0u8; MAX_HIT_ATTRIB_SIZE as usize];
    let n = bytes.len().min(out.len());
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

impl RayInvocation<'_> {
    /// Walk the structure in `self.ray.accel` and select the next state.
    pub(crate) fn traverse(&mut self) -> Result<()> {
        self.idx = STATE_EXIT;
        let mut outcome = Outcome::default();

        if self.ray.accel != 0 {
            let root = self.memory.read_u32(self.ray.accel)?;
            let mut walk = Walk::world(&self.ray);
            let mut stack: SmallVec<[u32; DEFAULT_TRAVERSAL_STACK_ENTRIES]> = SmallVec::new();
            push(&mut stack, root, self.stack_entries)?;
            let mut top_stack = 0usize;

            while !stack.is_empty() {
                if top_stack >= stack.len() {
                    top_stack = 0;
                    walk = Walk::world(&self.ray);
                }
                let Some(id) = stack.pop() else { break };
                let addr = walk.bvh_base + node_offset(id);

                let flow = match NodeType::of(id) {
                    Some(NodeType::Box32) => {
                        let node: BoxNode = self.memory.read_pod(addr)?;
                        let hits = self.intersector.intersect_box(&node, walk.origin, walk.inv_dir, self.ray.tmax);
                        // nearest child ends up on top
                        for &child in hits.iter().rev() {
                            if child != INVALID_CHILD {
                                push(&mut stack, child, self.stack_entries)?;
                            }
                        }
                        Flow::Continue
                    }
                    Some(NodeType::Instance) => {
                        let node: InstanceNode = self.memory.read_pod(addr)?;
                        if node.mask() & self.ray.cull_mask != 0 {
                            top_stack = stack.len();
                            push(&mut stack, node.child_root(), self.stack_entries)?;
                            let dir = transform_vector(&node.wto_matrix, self.ray.direction);
                            walk = Walk {
                                bvh_base: node.child_base(),
                                origin: world_to_object_point(&node.wto_matrix, self.ray.origin),
                                dir,
                                inv_dir: safe_inv_dir(dir),
                                sbt_offset_and_flags: node.sbt_offset_and_flags,
                                instance_id: node.instance_id,
                                custom_instance_and_mask: node.custom_instance_and_mask,
                                instance_addr: addr,
                            };
                        }
                        Flow::Continue
                    }
                    Some(NodeType::Triangle) => self.triangle_case(&walk, addr, &mut outcome)?,
                    Some(NodeType::Aabb) => self.aabb_case(&walk, addr, &mut outcome)?,
                    None => return Err(Error::invalid(format!("node id {id:#x} has no valid tag"))),
                };
                if let Flow::Stop = flow {
                    break;
                }
            }
        }

        if let Some(attributes) = outcome.attributes {
            self.write_attributes(&attributes)?;
        }

        if outcome.should_return {
            trace!("hit without closest-hit, returning");
            return self.ret();
        }
        if self.idx == STATE_EXIT {
            let (handle, record) = self.sbt.miss.load(self.memory, self.ray.miss_index, 0)?;
            if handle == STATE_EXIT {
                return self.ret();
            }
            self.idx = handle;
            self.shader_record = record;
        }
        Ok(())
    }

    fn candidate(&self, walk: &Walk, primitive_id: u32, geometry_id_and_flags: u32) -> RayState {
        RayState {
            primitive_id,
            geometry_id_and_flags,
            instance_id: walk.instance_id,
            instance_addr: walk.instance_addr,
            custom_instance_and_mask: walk.custom_instance_and_mask,
            ..self.ray
        }
    }

    fn hit_index(&self, walk: &Walk, geometry_id_and_flags: u32) -> u32 {
        ShaderBindingTable::hit_index(
            self.ray.sbt_offset,
            walk.sbt_offset_and_flags,
            self.ray.sbt_stride,
            geometry_id_and_flags & 0x0FFF_FFFF,
        )
    }

    fn run_any_hit(&mut self, any_hit: &AnyHitFn, ray: RayState, record: DeviceAddress, attributes: &Attributes) -> Result<AnyHitStatus> {
        self.write_attributes(attributes)?;
        let mut ctx = ShaderContext {
            memory: self.memory,
            scratch: &mut self.scratch,
            stack_ptr: self.stack_ptr,
            arg: self.arg,
            shader_record: record,
            launch_id: self.launch_id,
            launch_size: self.launch_size,
            ray,
            report: None,
        };
        any_hit(&mut ctx)
    }

    /// Commit a candidate as the closest hit so far.
    fn commit(&mut self, ray: RayState, sbt_index: u32, attributes: Attributes, outcome: &mut Outcome) -> Result<()> {
        self.ray = ray;
        let (handle, record) = self.sbt.hit.load(self.memory, sbt_index, 0)?;
        self.idx = handle;
        self.shader_record = record;
        outcome.attributes = Some(attributes);
        outcome.should_return = self.ray.flags & SKIP_CLOSEST_HIT_SHADER != 0 || handle == STATE_EXIT;
        Ok(())
    }

    fn triangle_case(&mut self, walk: &Walk, addr: DeviceAddress, outcome: &mut Outcome) -> Result<Flow> {
        let node: TriangleNode = self.memory.read_pod(addr)?;
        let Some(hit) = self.intersector.intersect_triangle(&node, walk.origin, walk.dir) else {
            return Ok(Flow::Continue);
        };

        let flags = self.ray.flags;
        let instance_flags = walk.instance_flags();
        let front = hit.is_front_facing() ^ (instance_flags & INSTANCE_TRIANGLE_FLIP_FACING != 0);
        let facing_cull = if front { CULL_FRONT_FACING_TRIANGLES } else { CULL_BACK_FACING_TRIANGLES };
        let culled = flags & SKIP_TRIANGLES != 0
            || (flags & facing_cull != 0 && instance_flags & INSTANCE_TRIANGLE_FACING_CULL_DISABLE == 0);

        let t = hit.distance();
        if culled || !(t < self.ray.tmax && t >= self.ray.tmin) {
            return Ok(Flow::Continue);
        }

        let opaque = is_opaque(node.geometry_id_and_flags, walk.sbt_offset_and_flags, flags);
        let opacity_cull = if opaque { CULL_OPAQUE } else { CULL_NO_OPAQUE };
        if flags & opacity_cull != 0 {
            return Ok(Flow::Continue);
        }

        let sbt_index = self.hit_index(walk, node.geometry_id_and_flags);
        let mut ray = self.candidate(walk, node.triangle_id, node.geometry_id_and_flags);
        ray.tmax = t;
        ray.hit_kind = if front { HIT_KIND_FRONT_FACING } else { HIT_KIND_BACK_FACING };
        let attributes = pack_attributes(bytemuck::bytes_of(&hit.barycentrics()));

        let mut status = AnyHitStatus::Accept;
        if !opaque {
            let (handle, record) = self.sbt.hit.load(self.memory, sbt_index, 1)?;
            let pipeline = self.pipeline;
            if let Some(any_hit) = pipeline.triangle_any_hit(handle) {
                status = self.run_any_hit(any_hit, ray, record, &attributes)?;
                if status == AnyHitStatus::Ignore {
                    return Ok(Flow::Continue);
                }
            }
        }

        self.commit(ray, sbt_index, attributes, outcome)?;
        if flags & TERMINATE_ON_FIRST_HIT != 0 || status == AnyHitStatus::AcceptAndTerminate {
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }

    fn aabb_case(&mut self, walk: &Walk, addr: DeviceAddress, outcome: &mut Outcome) -> Result<Flow> {
        let flags = self.ray.flags;
        if flags & SKIP_AABBS != 0 {
            return Ok(Flow::Continue);
        }
        let node: AabbNode = self.memory.read_pod(addr)?;
        let opaque = is_opaque(node.geometry_id_and_flags, walk.sbt_offset_and_flags, flags);
        let opacity_cull = if opaque { CULL_OPAQUE } else { CULL_NO_OPAQUE };
        if flags & opacity_cull != 0 {
            return Ok(Flow::Continue);
        }

        let sbt_index = self.hit_index(walk, node.geometry_id_and_flags);
        let candidate = self.candidate(walk, node.primitive_id, node.geometry_id_and_flags);
        let (handle, record) = self.sbt.hit.load(self.memory, sbt_index, 1)?;

        let mut committed = None;
        if handle != STATE_EXIT {
            let pipeline = self.pipeline;
            if let Some((intersection, any_hit)) = pipeline.procedural(handle) {
                let mut report = IntersectionReport::new(any_hit.cloned(), opaque);
                let ray = {
                    let mut ctx = ShaderContext {
                        memory: self.memory,
                        scratch: &mut self.scratch,
                        stack_ptr: self.stack_ptr,
                        arg: self.arg,
                        shader_record: record,
                        launch_id: self.launch_id,
                        launch_size: self.launch_size,
                        ray: candidate,
                        report: Some(&mut report),
                    };
                    intersection(&mut ctx)?;
                    ctx.ray
                };
                if report.committed {
                    committed = Some((ray, report.attributes, report.terminated));
                }
            }
        } else {
            // no intersection shader: the box itself is the primitive
            let (t0, t1) = intersect_aabb(&Aabb::from_array(node.aabb), walk.origin, walk.dir, walk.inv_dir);
            if t0 <= t1 && t0 < self.ray.tmax && t1 >= self.ray.tmin {
                let mut ray = candidate;
                ray.tmax = t0.max(self.ray.tmin);
                committed = Some((ray, [0; MAX_HIT_ATTRIB_SIZE as usize], false));
            }
        }

        let Some((ray, attributes, terminated)) = committed else {
            return Ok(Flow::Continue);
        };
        self.commit(ray, sbt_index, attributes, outcome)?;
        if flags & TERMINATE_ON_FIRST_HIT != 0 || terminated {
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }
}
