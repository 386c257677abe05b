//! Command recording and queue execution.
//!
//! Device-side builds and copies are recorded as a flat list of dispatches,
//! barriers and small buffer updates. [`Queue::submit`] replays the list:
//! every invocation of a dispatch runs (optionally on the rayon pool), and
//! the next command starts only once the whole dispatch has finished, so
//! the barrier commands mark the producer/consumer boundaries.

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::bvh::format::WORKGROUP_SIZE;
use crate::kernels::{Invocation, Kernel};
use crate::memory::{DeviceAddress, DeviceMemory, MemoryExt};
use crate::util::Result;

/// How many invocations a dispatch launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchSize {
    /// Whole workgroups.
    Groups(u32),
    /// Exactly `n` invocations.
    Unaligned(u32),
    /// Workgroup count read from device memory when the dispatch executes.
    Indirect(DeviceAddress),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Dispatch { kernel: Kernel, size: DispatchSize },
    Barrier,
    UpdateBuffer { address: DeviceAddress, data: Vec<u8> },
}

/// The dispatch/barrier/update primitives device builds are recorded into.
pub trait CommandSink {
    fn dispatch(&mut self, kernel: Kernel, size: DispatchSize);
    fn barrier(&mut self);
    fn update_buffer(&mut self, address: DeviceAddress, data: &[u8]);
}

/// Recorded command list.
#[derive(Debug, Default, Clone)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Number of recorded dispatches.
    pub fn dispatch_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::Dispatch { .. }))
            .count()
    }
}

impl CommandSink for CommandBuffer {
    fn dispatch(&mut self, kernel: Kernel, size: DispatchSize) {
        self.commands.push(Command::Dispatch { kernel, size });
    }

    fn barrier(&mut self) {
        self.commands.push(Command::Barrier);
    }

    fn update_buffer(&mut self, address: DeviceAddress, data: &[u8]) {
        self.commands.push(Command::UpdateBuffer {
            address,
            data: data.to_vec(),
        });
    }
}

/// Executes command buffers against device memory.
pub struct Queue<'m> {
    memory: &'m dyn DeviceMemory,
    parallel: bool,
}

impl<'m> Queue<'m> {
    pub fn new(memory: &'m dyn DeviceMemory, parallel: bool) -> Self {
        Self { memory, parallel }
    }

    /// Run every command in order. Stops at the first failing invocation.
    #[tracing::instrument(skip_all, fields(commands = cmd.len()))]
    pub fn submit(&self, cmd: &CommandBuffer) -> Result<()> {
        for command in cmd.commands() {
            match command {
                Command::Dispatch { kernel, size } => self.dispatch(kernel, *size)?,
                Command::Barrier => trace!("barrier"),
                Command::UpdateBuffer { address, data } => self.memory.write(*address, data)?,
            }
        }
        Ok(())
    }

    fn dispatch(&self, kernel: &Kernel, size: DispatchSize) -> Result<()> {
        let (workgroups, invocations) = match size {
            DispatchSize::Groups(x) => (x, x * WORKGROUP_SIZE),
            DispatchSize::Unaligned(n) => (n.div_ceil(WORKGROUP_SIZE), n),
            DispatchSize::Indirect(address) => {
                let x = self.memory.read_u32(address)?;
                (x, x * WORKGROUP_SIZE)
            }
        };
        debug!(kernel = kernel.name(), workgroups, invocations, "dispatch");

        let memory = self.memory;
        let invoke = |global_id: u32| kernel.invoke(memory, Invocation { global_id, workgroups });
        if self.parallel {
            (0..invocations).into_par_iter().try_for_each(invoke)
        } else {
            (0..invocations).try_for_each(invoke)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{CopyArgs, CopyMode};
    use crate::memory::{Heap, MemoryKind};

    #[test]
    fn test_record() {
        let mut cmd = CommandBuffer::new();
        assert!(cmd.is_empty());
        cmd.barrier();
        cmd.update_buffer(0x100, &[1, 2, 3]);
        cmd.dispatch(
            Kernel::Copy(CopyArgs { src_addr: 0, dst_addr: 0, mode: CopyMode::Copy }),
            DispatchSize::Groups(1),
        );
        assert_eq!(cmd.len(), 3);
        assert_eq!(cmd.dispatch_count(), 1);
        assert_eq!(cmd.commands()[0], Command::Barrier);
    }

    #[test]
    fn test_submit_update_and_indirect_zero() {
        let mut heap = Heap::new(1 << 20);
        let buf = heap.allocate(64, MemoryKind::DeviceLocal).unwrap();

        let mut cmd = CommandBuffer::new();
        cmd.update_buffer(buf.address + 8, &7u32.to_le_bytes());
        // zero workgroups at the indirect address: nothing runs
        cmd.dispatch(
            Kernel::Copy(CopyArgs { src_addr: 0, dst_addr: 0, mode: CopyMode::Copy }),
            DispatchSize::Indirect(buf.address),
        );
        for parallel in [false, true] {
            Queue::new(&heap, parallel).submit(&cmd).unwrap();
        }
        assert_eq!(heap.read_u32(buf.address + 8).unwrap(), 7);
    }
}
