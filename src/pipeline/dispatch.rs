//! The shader-call dispatcher.
//!
//! Every launch id runs one [`RayInvocation`]: a loop over the pipeline's
//! state table that executes exactly one state per iteration until the
//! current index drops to [`STATE_EXIT`]. Calls push a frame on the
//! invocation's scratch stack:
//!
//! ```text
//! caller sp -> | caller frame (align16) | hit attributes (32) | resume slot (16) | <- callee sp
//! ```
//!
//! The resume slot holds the state to continue at and the caller's payload
//! offset. A return pops the slot; the resume state then drops the caller
//! frame and runs the caller's next segment.

use rayon::prelude::*;
use tracing::{debug, trace};

use super::group::{call_frame_size, Pipeline, State};
use super::sbt::ShaderBindingTable;
use super::shader::{Exit, RayState, ShaderContext, ShaderStage, TraceArgs};
use super::traversal::{Intersector, SoftwareIntersector};
use super::{STATE_EXIT, STATE_TRAVERSAL};
use crate::accel::Device;
use crate::memory::{DeviceAddress, DeviceMemory};
use crate::util::{read_u32, read_u64, write_u32, write_u64, Error, Result};

/// Dispatcher state of one launch id.
pub(crate) struct RayInvocation<'a> {
    pub memory: &'a dyn DeviceMemory,
    pub pipeline: &'a Pipeline,
    pub sbt: &'a ShaderBindingTable,
    pub intersector: &'a dyn Intersector,
    /// Traversal stack capacity in node ids.
    pub stack_entries: usize,
    pub scratch: Vec<u8>,
    pub idx: u32,
    pub stack_ptr: u32,
    /// Payload offset of the running shader, relative to `stack_ptr`.
    pub arg: i64,
    pub shader_record: DeviceAddress,
    pub ray: RayState,
    pub launch_id: [u32; 3],
    pub launch_size: [u32; 3],
}

impl<'a> RayInvocation<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory: &'a dyn DeviceMemory,
        pipeline: &'a Pipeline,
        sbt: &'a ShaderBindingTable,
        intersector: &'a dyn Intersector,
        stack_entries: usize,
        stack_size: u32,
        launch_id: [u32; 3],
        launch_size: [u32; 3],
    ) -> Self {
        Self {
            memory,
            pipeline,
            sbt,
            intersector,
            stack_entries,
            scratch: vec![0; stack_size as usize],
            idx: STATE_EXIT,
            stack_ptr: 0,
            arg: 0,
            shader_record: 0,
            ray: RayState::default(),
            launch_id,
            launch_size,
        }
    }

    /// Run from the raygen record until the raygen shader returns.
    pub fn run(&mut self) -> Result<()> {
        let (handle, record) = self.sbt.raygen.load(self.memory, 0, 0)?;
        self.idx = handle;
        self.shader_record = record;
        self.stack_ptr = 0;
        self.arg = 0;

        while self.idx != STATE_EXIT {
            trace!(idx = self.idx, sp = self.stack_ptr, "dispatch");
            match self.pipeline.state(self.idx) {
                Some(State::Exit) => break,
                Some(State::Traversal) => self.traverse()?,
                Some(State::Entry { shader }) => self.run_segment(shader, 0)?,
                Some(State::Resume { shader, segment, frame }) => {
                    self.stack_ptr = self.stack_ptr.checked_sub(frame).ok_or_else(|| {
                        Error::other(format!("resume below the stack base (sp {})", self.stack_ptr))
                    })?;
                    self.run_segment(shader, segment)?
                }
                Some(State::Unused { group }) => {
                    return Err(Error::InvalidPipeline(format!(
                        "group {group} has no closest-hit shader"
                    )))
                }
                None => {
                    return Err(Error::InvalidPipeline(format!(
                        "state {} out of range ({} states)",
                        self.idx,
                        self.pipeline.state_count()
                    )))
                }
            }
        }
        Ok(())
    }

    fn overflow(&self, required: u64) -> Error {
        Error::StackOverflow { required: required as usize, available: self.scratch.len() }
    }

    fn run_segment(&mut self, shader_index: usize, segment: usize) -> Result<()> {
        let pipeline = self.pipeline;
        let shader = pipeline.stage(shader_index).ok_or_else(|| {
            Error::InvalidPipeline(format!("missing stage {shader_index}"))
        })?;

        let Some(body) = pipeline.segment(shader_index, segment) else {
            // past the last segment: implicit return
            return self.finish(shader.stage());
        };

        let needed = self.stack_ptr as u64 + shader.stack_size() as u64;
        if needed > self.scratch.len() as u64 {
            return Err(self.overflow(needed));
        }

        let exit = {
            let mut ctx = ShaderContext {
                memory: self.memory,
                scratch: &mut self.scratch,
                stack_ptr: self.stack_ptr,
                arg: self.arg,
                shader_record: self.shader_record,
                launch_id: self.launch_id,
                launch_size: self.launch_size,
                ray: self.ray,
                report: None,
            };
            body(&mut ctx)?
        };

        match exit {
            Exit::Return => self.finish(shader.stage()),
            Exit::TraceRay(args) => {
                self.call(shader_index, call_frame_size(shader), segment + 1, args.payload)?;
                self.begin_trace(&args);
                self.idx = STATE_TRAVERSAL;
                Ok(())
            }
            Exit::ExecuteCallable { sbt_index, payload } => {
                self.call(shader_index, call_frame_size(shader), segment + 1, payload)?;
                let (handle, record) = self.sbt.callable.load(self.memory, sbt_index, 0)?;
                if handle == STATE_EXIT {
                    return self.ret();
                }
                self.idx = handle;
                self.shader_record = record;
                Ok(())
            }
        }
    }

    /// Push the caller frame and resume slot and point the payload at the
    /// caller's `payload` offset.
    fn call(&mut self, shader: usize, frame: u32, resume_segment: usize, payload: u32) -> Result<()> {
        let slot = self.stack_ptr as u64 + frame as u64;
        let callee_sp = slot + 16;
        if callee_sp > self.scratch.len() as u64 {
            return Err(self.overflow(callee_sp));
        }
        let slot = slot as usize;
        let resume = self.pipeline.resume_state(shader, resume_segment);
        write_u32(&mut self.scratch, slot, resume);
        write_u32(&mut self.scratch, slot + 4, 0);
        write_u64(&mut self.scratch, slot + 8, self.arg as u64);

        self.stack_ptr = callee_sp as u32;
        self.arg = payload as i64 - (frame as i64 + 16);
        Ok(())
    }

    /// Pop the resume slot.
    pub(crate) fn ret(&mut self) -> Result<()> {
        let sp = self.stack_ptr.checked_sub(16).ok_or_else(|| {
            Error::other("return with an empty call stack")
        })?;
        self.stack_ptr = sp;
        self.idx = read_u32(&self.scratch, sp as usize);
        self.arg = read_u64(&self.scratch, sp as usize + 8) as i64;
        Ok(())
    }

    fn finish(&mut self, stage: ShaderStage) -> Result<()> {
        if stage == ShaderStage::Raygen {
            self.idx = STATE_EXIT;
            Ok(())
        } else {
            self.ret()
        }
    }

    fn begin_trace(&mut self, args: &TraceArgs) {
        self.ray.accel = args.accel;
        self.ray.flags = args.flags;
        self.ray.cull_mask = args.cull_mask & 0xFF;
        self.ray.sbt_offset = args.sbt_offset & 0xF;
        self.ray.sbt_stride = args.sbt_stride & 0xF;
        self.ray.miss_index = args.miss_index & 0xFFFF;
        self.ray.origin = args.origin;
        self.ray.tmin = args.tmin;
        self.ray.direction = args.direction;
        self.ray.tmax = args.tmax;
    }

    /// Store a hit attribute block below the current stack pointer.
    pub(crate) fn write_attributes(&mut self, attributes: &[u8]) -> Result<()> {
        let start = self.stack_ptr as i64 + super::HIT_ATTRIB_OFFSET;
        let end = start + attributes.len() as i64;
        if start < 0 || end > self.scratch.len() as i64 {
            return Err(self.overflow(end.max(0) as u64));
        }
        self.scratch[start as usize..end as usize].copy_from_slice(attributes);
        Ok(())
    }
}

impl Device<'_> {
    /// Launch `launch_size` independent invocations with the software
    /// intersector.
    ///
    /// `stack_size` is the per-invocation scratch size and only applies to
    /// pipelines with a dynamic stack size; others use their computed size.
    pub fn trace_rays(
        &self,
        pipeline: &Pipeline,
        sbt: &ShaderBindingTable,
        launch_size: [u32; 3],
        stack_size: u32,
    ) -> Result<()> {
        self.trace_rays_with(pipeline, sbt, launch_size, stack_size, &SoftwareIntersector)
    }

    /// [`trace_rays`](Self::trace_rays) with an injected box/triangle intersector.
    #[tracing::instrument(skip_all, fields(width = launch_size[0], height = launch_size[1], depth = launch_size[2]))]
    pub fn trace_rays_with(
        &self,
        pipeline: &Pipeline,
        sbt: &ShaderBindingTable,
        launch_size: [u32; 3],
        stack_size: u32,
        intersector: &dyn Intersector,
    ) -> Result<()> {
        let stack_size = if pipeline.has_dynamic_stack_size() {
            stack_size
        } else {
            pipeline.default_stack_size()
        };
        let [w, h, d] = launch_size.map(u64::from);
        let total = w * h * d;
        let stack_entries = self.settings().traversal_stack_entries;

        let run = |i: u64| -> Result<()> {
            let launch_id = [(i % w) as u32, ((i / w) % h) as u32, (i / (w * h)) as u32];
            RayInvocation::new(
                self.memory(),
                pipeline,
                sbt,
                intersector,
                stack_entries,
                stack_size,
                launch_id,
                launch_size,
            )
            .run()
        };

        if self.settings().parallel {
            (0..total).into_par_iter().try_for_each(run)?;
        } else {
            (0..total).try_for_each(run)?;
        }

        debug!(invocations = total, stack_size, "trace complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::memory::{Heap, MemoryExt, MemoryKind};
    use crate::pipeline::{PipelineCreateInfo, SbtLayout, Shader, ShaderGroup};
    use crate::util::Vec3;

    fn miss_ray() -> TraceArgs {
        TraceArgs::new(0, Vec3::ZERO, Vec3::Z, 100.0)
    }

    /// Raygen traces into nothing; the miss shader calls a callable that
    /// doubles its input, then stores the result into the payload.
    fn nested_pipeline(out: DeviceAddress, info_dynamic: bool) -> Pipeline {
        let raygen = Shader::raygen(16)
            .then(|ctx| {
                ctx.write_local(0, &0u32)?;
                Ok(Exit::TraceRay(miss_ray().with_payload(0)))
            })
            .then(move |ctx| {
                let v: u32 = ctx.read_local(0)?;
                let [x, y, _] = ctx.launch_id();
                let w = ctx.launch_size()[0];
                ctx.memory().write_u32(out + 4 * (y * w + x) as u64, v)?;
                Ok(Exit::Return)
            });
        let miss = Shader::miss(8)
            .then(|ctx| {
                ctx.write_local(0, &21u32)?;
                Ok(Exit::ExecuteCallable { sbt_index: 0, payload: 0 })
            })
            .then(|ctx| {
                let v: u32 = ctx.read_local(0)?;
                ctx.write_payload(&(v + ctx.launch_id()[0]))?;
                Ok(Exit::Return)
            });
        let callable = Shader::callable(0).then(|ctx| {
            let v: u32 = ctx.read_payload()?;
            ctx.write_payload(&(v * 2))?;
            Ok(Exit::Return)
        });

        let mut info = PipelineCreateInfo::new(
            vec![raygen, miss, callable],
            vec![
                ShaderGroup::General { general: 0 },
                ShaderGroup::General { general: 1 },
                ShaderGroup::General { general: 2 },
            ],
        );
        info.dynamic_stack_size = info_dynamic;
        Pipeline::new(info, 31).unwrap()
    }

    #[test]
    fn test_nested_calls() {
        let mut heap = Heap::new(1 << 16);
        let out = heap.allocate(64, MemoryKind::HostVisible).unwrap();
        let pipeline = nested_pipeline(out.address, false);
        let sbt = SbtLayout::new(0).miss(&[1]).callable(&[2]).upload(&pipeline, &mut heap).unwrap();

        let settings = Settings { parallel: false, ..Default::default() };
        let device = Device::new(&heap, settings);
        device.trace_rays(&pipeline, &sbt, [4, 2, 1], 0).unwrap();

        for y in 0..2u32 {
            for x in 0..4u32 {
                let v = heap.read_u32(out.address + 4 * (y * 4 + x) as u64).unwrap();
                assert_eq!(v, 42 + x);
            }
        }
    }

    #[test]
    fn test_parallel_launch() {
        let mut heap = Heap::new(1 << 16);
        let out = heap.allocate(256, MemoryKind::HostVisible).unwrap();
        let pipeline = nested_pipeline(out.address, false);
        let sbt = SbtLayout::new(0).miss(&[1]).callable(&[2]).upload(&pipeline, &mut heap).unwrap();

        let device = Device::new(&heap, Settings::default());
        device.trace_rays(&pipeline, &sbt, [8, 8, 1], 0).unwrap();
        assert_eq!(heap.read_u32(out.address + 4 * 63).unwrap(), 42 + 7);
    }

    #[test]
    fn test_dynamic_stack_overflow() {
        let mut heap = Heap::new(1 << 16);
        let out = heap.allocate(16, MemoryKind::HostVisible).unwrap();
        let pipeline = nested_pipeline(out.address, true);
        let sbt = SbtLayout::new(0).miss(&[1]).callable(&[2]).upload(&pipeline, &mut heap).unwrap();
        let device = Device::new(&heap, Settings { parallel: false, ..Default::default() });

        // raygen frame 16 + 32 attributes + 16 slot
        let err = device.trace_rays(&pipeline, &sbt, [1, 1, 1], 32).unwrap_err();
        assert!(matches!(err, Error::StackOverflow { required: 64, available: 32 }));

        // the miss shader's own call needs another 64 bytes
        let err = device.trace_rays(&pipeline, &sbt, [1, 1, 1], 96).unwrap_err();
        assert!(matches!(err, Error::StackOverflow { required: 128, available: 96 }));

        device.trace_rays(&pipeline, &sbt, [1, 1, 1], 128).unwrap();
        assert_eq!(heap.read_u32(out.address).unwrap(), 42);
    }

    #[test]
    fn test_default_stack_size_is_enough() {
        let mut heap = Heap::new(1 << 16);
        let out = heap.allocate(16, MemoryKind::HostVisible).unwrap();
        let pipeline = nested_pipeline(out.address, false);
        // raygen 64 + miss 64 + 2 * callable 48
        assert_eq!(pipeline.default_stack_size(), 224);
        let sbt = SbtLayout::new(0).miss(&[1]).callable(&[2]).upload(&pipeline, &mut heap).unwrap();
        let device = Device::new(&heap, Settings { parallel: false, ..Default::default() });
        // the argument is ignored without a dynamic stack size
        device.trace_rays(&pipeline, &sbt, [1, 1, 1], 0).unwrap();
    }

    #[test]
    fn test_trace_masks_arguments() {
        let heap = Heap::new(1 << 12);
        let info = PipelineCreateInfo::new(vec![Shader::raygen(0)], vec![ShaderGroup::General { general: 0 }]);
        let pipeline = Pipeline::new(info, 31).unwrap();
        let sbt = ShaderBindingTable::default();
        let mut inv = RayInvocation::new(&heap, &pipeline, &sbt, &SoftwareIntersector, 76, 0, [0; 3], [1; 3]);
        let args = miss_ray()
            .with_cull_mask(0x1FF)
            .with_sbt(0x13, 0x21)
            .with_miss_index(0x1_0002);
        inv.begin_trace(&args);
        assert_eq!(inv.ray.cull_mask, 0xFF);
        assert_eq!((inv.ray.sbt_offset, inv.ray.sbt_stride), (3, 1));
        assert_eq!(inv.ray.miss_index, 2);
    }
}
