//! Data-parallel build and copy kernels.
//!
//! Each kernel is a pure function of its arguments and invocation id that
//! loads and stores through [`DeviceMemory`]. Invocations of one dispatch
//! never touch each other's outputs; ordering between dispatches comes only
//! from the barriers recorded around them.

pub mod copy;
pub mod internal;
pub mod leaf;

pub use copy::{CopyArgs, CopyMode};
pub use internal::InternalArgs;
pub use leaf::{LeafArgs, LeafPrimitive};

use crate::memory::DeviceMemory;
use crate::util::Result;

/// Position of one invocation in its dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    pub global_id: u32,
    /// Workgroups in the dispatch (x).
    pub workgroups: u32,
}

/// A kernel together with its push constants.
#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    Leaf(LeafArgs),
    Internal(InternalArgs),
    Copy(CopyArgs),
}

impl Kernel {
    /// Run one invocation.
    pub fn invoke(&self, memory: &dyn DeviceMemory, inv: Invocation) -> Result<()> {
        match self {
            Self::Leaf(args) => leaf::run(args, memory, inv),
            Self::Internal(args) => internal::run(args, memory, inv),
            Self::Copy(args) => copy::run(args, memory, inv),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Leaf(_) => "leaf",
            Self::Internal(_) => "internal",
            Self::Copy(_) => "copy",
        }
    }
}
