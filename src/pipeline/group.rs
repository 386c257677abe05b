//! Shader groups, the flattened state table, group handles and stack sizing.

use tracing::debug;

use super::shader::{Shader, ShaderCode, ShaderStage};
use super::{AnyHitFn, IntersectionFn, SegmentFn, CALL_OVERHEAD, FIRST_GROUP_STATE, HANDLE_SIZE};
use crate::accel::Device;
use crate::util::{align_up, Error, Result};

/// Group of shaders addressed by one SBT record.
///
/// Members are indices into [`PipelineCreateInfo::stages`]; `None` is an
/// unused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderGroup {
    /// A raygen, miss or callable shader.
    General { general: u32 },
    TrianglesHit { closest_hit: Option<u32>, any_hit: Option<u32> },
    ProceduralHit { closest_hit: Option<u32>, any_hit: Option<u32>, intersection: u32 },
}

/// Member selector for [`Pipeline::shader_group_stack_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupShader {
    General,
    ClosestHit,
    AnyHit,
    Intersection,
}

/// Scratch a group needs.
///
/// `recursive` covers the general or closest-hit shader including the
/// frame it pushes when it calls out; `non_recursive` covers the any-hit
/// and intersection shaders that run inline during traversal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GroupStackSize {
    pub recursive: u32,
    pub non_recursive: u32,
}

#[derive(Clone)]
pub struct PipelineCreateInfo {
    pub stages: Vec<Shader>,
    pub groups: Vec<ShaderGroup>,
    pub max_recursion_depth: u32,
    /// Stack size is supplied with every launch instead of computed here.
    pub dynamic_stack_size: bool,
}

impl PipelineCreateInfo {
    pub fn new(stages: Vec<Shader>, groups: Vec<ShaderGroup>) -> Self {
        Self { stages, groups, max_recursion_depth: 1, dynamic_stack_size: false }
    }

    pub fn with_max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    pub fn with_dynamic_stack_size(mut self) -> Self {
        self.dynamic_stack_size = true;
        self
    }
}

/// One entry of the dispatcher's state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Exit,
    Traversal,
    /// Group entry: first segment of its general or closest-hit shader.
    Entry { shader: usize },
    /// Hit group without a closest-hit shader; its handle never selects it.
    Unused { group: usize },
    /// Segment `segment` of `shader`, reached by returning from a call
    /// whose frame was `frame` bytes.
    Resume { shader: usize, segment: usize, frame: u32 },
}

/// A compiled ray-tracing pipeline.
pub struct Pipeline {
    stages: Vec<Shader>,
    groups: Vec<ShaderGroup>,
    states: Vec<State>,
    /// First resume state of each segmented shader.
    resume_base: Vec<u32>,
    handles: Vec<[u32; 2]>,
    stack_sizes: Vec<GroupStackSize>,
    default_stack_size: u32,
    dynamic_stack_size: bool,
    max_recursion_depth: u32,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.len())
            .field("groups", &self.groups)
            .field("states", &self.states.len())
            .field("default_stack_size", &self.default_stack_size)
            .field("dynamic_stack_size", &self.dynamic_stack_size)
            .finish()
    }
}

/// Bytes a call from `shader` pushes: its aligned frame plus the hit
/// attribute block. The 16-byte resume slot follows.
#[inline]
pub(crate) fn call_frame_size(shader: &Shader) -> u32 {
    align_up(shader.stack_size() as u64, 16) as u32 + (CALL_OVERHEAD - 16)
}

fn check_member(stages: &[Shader], index: u32, expected: &[ShaderStage], group: usize) -> Result<()> {
    let shader = stages.get(index as usize).ok_or_else(|| {
        Error::InvalidPipeline(format!("group {group} references missing stage {index}"))
    })?;
    if !expected.contains(&shader.stage()) {
        return Err(Error::InvalidPipeline(format!(
            "group {group}: stage {index} is a {} shader",
            shader.stage().name()
        )));
    }
    Ok(())
}

impl Pipeline {
    pub fn new(info: PipelineCreateInfo, max_recursion_depth: u32) -> Result<Self> {
        use ShaderStage::*;

        if info.max_recursion_depth > max_recursion_depth {
            return Err(Error::InvalidPipeline(format!(
                "recursion depth {} exceeds the limit of {}",
                info.max_recursion_depth, max_recursion_depth
            )));
        }

        let stages = &info.stages;
        for (i, group) in info.groups.iter().enumerate() {
            match *group {
                ShaderGroup::General { general } => {
                    check_member(stages, general, &[Raygen, Miss, Callable], i)?
                }
                ShaderGroup::TrianglesHit { closest_hit, any_hit } => {
                    if let Some(s) = closest_hit {
                        check_member(stages, s, &[ClosestHit], i)?;
                    }
                    if let Some(s) = any_hit {
                        check_member(stages, s, &[AnyHit], i)?;
                    }
                }
                ShaderGroup::ProceduralHit { closest_hit, any_hit, intersection } => {
                    if let Some(s) = closest_hit {
                        check_member(stages, s, &[ClosestHit], i)?;
                    }
                    if let Some(s) = any_hit {
                        check_member(stages, s, &[AnyHit], i)?;
                    }
                    check_member(stages, intersection, &[Intersection], i)?;
                }
            }
        }

        let group_count = info.groups.len() as u32;

        // entries first, then resume points in stage order
        let mut states = vec![State::Exit, State::Traversal];
        let mut handles = Vec::with_capacity(info.groups.len());
        let mut stack_sizes = Vec::with_capacity(info.groups.len());
        for (i, group) in info.groups.iter().enumerate() {
            let idx = FIRST_GROUP_STATE + i as u32;
            let (main, handle) = match *group {
                ShaderGroup::General { general } => (Some(general), [idx, 0]),
                ShaderGroup::TrianglesHit { closest_hit, any_hit } => (
                    closest_hit,
                    [closest_hit.map_or(0, |_| idx), any_hit.map_or(0, |_| idx)],
                ),
                ShaderGroup::ProceduralHit { closest_hit, .. } => {
                    (closest_hit, [closest_hit.map_or(0, |_| idx), idx])
                }
            };
            states.push(match main {
                Some(s) => State::Entry { shader: s as usize },
                None => State::Unused { group: i },
            });
            handles.push(handle);
            stack_sizes.push(group_stack_size(stages, group));
        }

        let mut resume_base = vec![0; stages.len()];
        for (s, shader) in stages.iter().enumerate() {
            if let ShaderCode::Segments(segments) = shader.code() {
                resume_base[s] = states.len() as u32;
                let frame = call_frame_size(shader);
                // segment `len` is the return epilogue
                for segment in 1..=segments.len() {
                    states.push(State::Resume { shader: s, segment, frame });
                }
            }
        }

        let default_stack_size =
            compute_stack_size(stages, &info.groups, &stack_sizes, info.max_recursion_depth);

        debug!(
            groups = group_count,
            states = states.len(),
            stack_size = default_stack_size,
            dynamic = info.dynamic_stack_size,
            "created ray-tracing pipeline"
        );

        Ok(Self {
            stages: info.stages,
            groups: info.groups,
            states,
            resume_base,
            handles,
            stack_sizes,
            default_stack_size,
            dynamic_stack_size: info.dynamic_stack_size,
            max_recursion_depth: info.max_recursion_depth,
        })
    }

    #[inline]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    #[inline]
    pub fn group(&self, index: usize) -> Option<&ShaderGroup> {
        self.groups.get(index)
    }

    #[inline]
    pub fn stage(&self, index: usize) -> Option<&Shader> {
        self.stages.get(index)
    }

    /// Total states, including exit, traversal and resume points.
    #[inline]
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    #[inline]
    pub(crate) fn state(&self, index: u32) -> Option<State> {
        self.states.get(index as usize).copied()
    }

    /// State resuming `shader` at `segment`.
    #[inline]
    pub(crate) fn resume_state(&self, shader: usize, segment: usize) -> u32 {
        self.resume_base[shader] + segment as u32 - 1
    }

    pub(crate) fn segment(&self, shader: usize, segment: usize) -> Option<&SegmentFn> {
        match self.stages.get(shader)?.code() {
            ShaderCode::Segments(s) => s.get(segment),
            _ => None,
        }
    }

    fn code_of(&self, index: Option<u32>) -> Option<&ShaderCode> {
        index.and_then(|s| self.stages.get(s as usize)).map(|s| s.code())
    }

    fn group_of_handle(&self, handle: u32) -> Option<&ShaderGroup> {
        handle
            .checked_sub(FIRST_GROUP_STATE)
            .and_then(|g| self.groups.get(g as usize))
    }

    /// Any-hit shader selected by a triangle hit record's second handle word.
    pub(crate) fn triangle_any_hit(&self, handle: u32) -> Option<&AnyHitFn> {
        match self.group_of_handle(handle)? {
            ShaderGroup::TrianglesHit { any_hit, .. } => match self.code_of(*any_hit)? {
                ShaderCode::AnyHit(f) => Some(f),
                _ => None,
            },
            _ => None,
        }
    }

    /// Intersection shader and paired any-hit selected by a procedural hit
    /// record's second handle word.
    pub(crate) fn procedural(&self, handle: u32) -> Option<(&IntersectionFn, Option<&AnyHitFn>)> {
        match self.group_of_handle(handle)? {
            ShaderGroup::ProceduralHit { any_hit, intersection, .. } => {
                let ShaderCode::Intersection(f) = self.code_of(Some(*intersection))? else {
                    return None;
                };
                let any_hit = match self.code_of(*any_hit) {
                    Some(ShaderCode::AnyHit(a)) => Some(a),
                    _ => None,
                };
                Some((f, any_hit))
            }
            _ => None,
        }
    }

    /// Handle of one group: state index of its general/closest-hit entry,
    /// then of its any-hit/intersection entry, zero padded.
    pub fn group_handle(&self, group: usize) -> Option<[u8; HANDLE_SIZE as usize]> {
        let [h0, h1] = *self.handles.get(group)?;
        let mut out = [0u8; HANDLE_SIZE as usize];
        out[0..4].copy_from_slice(&h0.to_le_bytes());
        out[4..8].copy_from_slice(&h1.to_le_bytes());
        Some(out)
    }

    /// Handles of `count` groups starting at `first`, packed back to back.
    pub fn group_handles(&self, first: usize, count: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(count * HANDLE_SIZE as usize);
        for g in first..first + count {
            let handle = self.group_handle(g).ok_or_else(|| {
                Error::InvalidPipeline(format!("group {g} out of range ({} groups)", self.groups.len()))
            })?;
            out.extend_from_slice(&handle);
        }
        Ok(out)
    }

    pub fn group_stack_sizes(&self) -> &[GroupStackSize] {
        &self.stack_sizes
    }

    /// Stack bytes one member of a group needs.
    pub fn shader_group_stack_size(&self, group: usize, which: GroupShader) -> Result<u32> {
        let size = self.stack_sizes.get(group).ok_or_else(|| {
            Error::InvalidPipeline(format!("group {group} out of range ({} groups)", self.groups.len()))
        })?;
        Ok(match which {
            GroupShader::AnyHit | GroupShader::Intersection => size.non_recursive,
            GroupShader::General | GroupShader::ClosestHit => size.recursive,
        })
    }

    /// Scratch bytes per invocation when the stack size is not dynamic.
    #[inline]
    pub fn default_stack_size(&self) -> u32 {
        self.default_stack_size
    }

    #[inline]
    pub fn has_dynamic_stack_size(&self) -> bool {
        self.dynamic_stack_size
    }

    #[inline]
    pub fn max_recursion_depth(&self) -> u32 {
        self.max_recursion_depth
    }
}

fn group_stack_size(stages: &[Shader], group: &ShaderGroup) -> GroupStackSize {
    let recursive = |s: Option<u32>| {
        s.and_then(|s| stages.get(s as usize))
            .map_or(0, |shader| shader.stack_size().max(call_frame_size(shader) + 16))
    };
    let inline = |s: Option<u32>| s.and_then(|s| stages.get(s as usize)).map_or(0, |s| s.stack_size());

    match *group {
        ShaderGroup::General { general } => {
            GroupStackSize { recursive: recursive(Some(general)), non_recursive: 0 }
        }
        ShaderGroup::TrianglesHit { closest_hit, any_hit } => GroupStackSize {
            recursive: recursive(closest_hit),
            non_recursive: inline(any_hit),
        },
        ShaderGroup::ProceduralHit { closest_hit, any_hit, intersection } => GroupStackSize {
            recursive: recursive(closest_hit),
            non_recursive: inline(any_hit).max(inline(Some(intersection))),
        },
    }
}

/// `raygen + min(depth, 1) * max(chit, miss, inline) + max(depth - 1, 0) * max(chit, miss) + 2 * callable`.
fn compute_stack_size(
    stages: &[Shader],
    groups: &[ShaderGroup],
    sizes: &[GroupStackSize],
    depth: u32,
) -> u32 {
    let (mut raygen, mut callable, mut chit, mut miss, mut non_recursive) = (0, 0, 0, 0, 0);

    for (group, size) in groups.iter().zip(sizes) {
        non_recursive = non_recursive.max(size.non_recursive);
        let main = match *group {
            ShaderGroup::General { general } => Some(general),
            ShaderGroup::TrianglesHit { closest_hit, .. }
            | ShaderGroup::ProceduralHit { closest_hit, .. } => closest_hit,
        };
        let Some(shader) = main.and_then(|s| stages.get(s as usize)) else {
            continue;
        };
        let slot = match shader.stage() {
            ShaderStage::Raygen => &mut raygen,
            ShaderStage::Miss => &mut miss,
            ShaderStage::ClosestHit => &mut chit,
            ShaderStage::Callable => &mut callable,
            ShaderStage::AnyHit | ShaderStage::Intersection => continue,
        };
        *slot = (*slot).max(size.recursive);
    }

    raygen
        + depth.min(1) * chit.max(miss).max(non_recursive)
        + depth.saturating_sub(1) * chit.max(miss)
        + 2 * callable
}

impl Device<'_> {
    /// Compile shader groups into a pipeline, bounded by the configured
    /// maximum recursion depth.
    pub fn create_pipeline(&self, info: PipelineCreateInfo) -> Result<Pipeline> {
        Pipeline::new(info, self.settings().max_ray_recursion_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{AnyHitStatus, Exit};

    fn ret(stage: fn(u32) -> Shader, stack: u32) -> Shader {
        stage(stack).then(|_| Ok(Exit::Return))
    }

    fn sample() -> PipelineCreateInfo {
        PipelineCreateInfo::new(
            vec![
                ret(Shader::raygen, 20),                                     // 0
                ret(Shader::miss, 8),                                        // 1
                ret(Shader::closest_hit, 0).then(|_| Ok(Exit::Return)),      // 2
                Shader::any_hit(40, |_| Ok(AnyHitStatus::Accept)),           // 3
                Shader::intersection(72, |_| Ok(())),                        // 4
                ret(Shader::callable, 16),                                   // 5
            ],
            vec![
                ShaderGroup::General { general: 0 },
                ShaderGroup::General { general: 1 },
                ShaderGroup::TrianglesHit { closest_hit: Some(2), any_hit: Some(3) },
                ShaderGroup::ProceduralHit { closest_hit: None, any_hit: Some(3), intersection: 4 },
                ShaderGroup::General { general: 5 },
            ],
        )
    }

    #[test]
    fn test_state_table_and_handles() {
        let p = Pipeline::new(sample(), 31).unwrap();
        assert_eq!(p.state(0), Some(State::Exit));
        assert_eq!(p.state(1), Some(State::Traversal));
        assert_eq!(p.state(2), Some(State::Entry { shader: 0 }));
        assert_eq!(p.state(5), Some(State::Unused { group: 3 }));

        // one resume point per segment of each segmented shader: 1 + 1 + 2 + 1
        assert_eq!(p.state_count(), 2 + 5 + 5);
        let r = p.resume_state(2, 1);
        assert_eq!(p.state(r), Some(State::Resume { shader: 2, segment: 1, frame: 32 }));
        assert_eq!(p.state(r + 1), Some(State::Resume { shader: 2, segment: 2, frame: 32 }));

        let h = p.group_handles(0, 5).unwrap();
        assert_eq!(h.len(), 5 * 32);
        let words: Vec<u32> = h.chunks(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
        assert_eq!(&words[0..2], &[2, 0]);
        assert_eq!(&words[16..18], &[4, 4]);
        assert_eq!(&words[24..26], &[0, 5]);
        assert!(words[2..8].iter().all(|w| *w == 0));
        assert!(p.group_handles(4, 2).is_err());

        assert!(p.triangle_any_hit(4).is_some());
        assert!(p.triangle_any_hit(5).is_none());
        assert!(p.procedural(5).is_some());
        assert!(p.procedural(0).is_none());
    }

    #[test]
    fn test_stack_sizes() {
        let p = Pipeline::new(sample().with_max_recursion_depth(3), 31).unwrap();
        let sizes = p.group_stack_sizes();
        // align16(20) + 32 attributes + 16 resume slot
        assert_eq!(sizes[0], GroupStackSize { recursive: 80, non_recursive: 0 });
        assert_eq!(sizes[1].recursive, 64);
        assert_eq!(sizes[2], GroupStackSize { recursive: 48, non_recursive: 40 });
        assert_eq!(sizes[3], GroupStackSize { recursive: 0, non_recursive: 72 });

        assert_eq!(p.shader_group_stack_size(2, GroupShader::AnyHit).unwrap(), 40);
        assert_eq!(p.shader_group_stack_size(2, GroupShader::ClosestHit).unwrap(), 48);
        assert!(p.shader_group_stack_size(9, GroupShader::General).is_err());

        // 80 + 1 * max(48, 64, 72) + 2 * max(48, 64) + 2 * 64
        assert_eq!(p.default_stack_size(), 80 + 72 + 128 + 128);

        let p = Pipeline::new(sample().with_max_recursion_depth(0), 31).unwrap();
        assert_eq!(p.default_stack_size(), 80 + 128);
    }

    #[test]
    fn test_invalid_groups() {
        let mut info = sample();
        info.groups[0] = ShaderGroup::General { general: 2 };
        assert!(matches!(Pipeline::new(info, 31), Err(Error::InvalidPipeline(_))));

        let mut info = sample();
        info.groups[2] = ShaderGroup::TrianglesHit { closest_hit: Some(3), any_hit: None };
        assert!(Pipeline::new(info, 31).is_err());

        let mut info = sample();
        info.groups.push(ShaderGroup::General { general: 99 });
        assert!(Pipeline::new(info, 31).is_err());

        assert!(Pipeline::new(sample().with_max_recursion_depth(32), 31).is_err());
    }
}
