//! Device address space and the buffer-mapping layer.
//!
//! Acceleration structures, scratch arrays, geometry inputs and shader
//! binding tables all live in caller-owned regions of one flat `u64`
//! address space. The core never owns memory: it only computes offsets
//! and goes through [`DeviceMemory`] for every load, store and host map.
//!
//! [`Heap`] is the in-process implementation used by the CLI and tests.

mod heap;

pub use heap::{Heap, MemoryKind};

use std::ops::{Deref, DerefMut};

use bytemuck::Pod;
use parking_lot::MappedRwLockWriteGuard;

use crate::util::{Error, Result};

/// Address in the flat device address space. Zero is the null reference.
pub type DeviceAddress = u64;

/// Contiguous range of device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRegion {
    pub address: DeviceAddress,
    pub size: u64,
}

impl BufferRegion {
    #[inline]
    pub const fn new(address: DeviceAddress, size: u64) -> Self {
        Self { address, size }
    }

    /// First address past the region.
    #[inline]
    pub const fn end(&self) -> DeviceAddress {
        self.address + self.size
    }

    /// Check if `[address, address + len)` lies inside the region.
    #[inline]
    pub fn contains(&self, address: DeviceAddress, len: u64) -> bool {
        address >= self.address && address.saturating_add(len) <= self.end()
    }

    /// Sub-range starting `offset` bytes in, clamped to the region.
    pub fn slice(&self, offset: u64, size: u64) -> Self {
        let offset = offset.min(self.size);
        Self::new(self.address + offset, size.min(self.size - offset))
    }
}

/// Either a device address or host-resident bytes.
///
/// Host builds read geometry from host memory; recorded device builds only
/// accept device addresses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceOrHostAddress<'a> {
    Device(DeviceAddress),
    Host(&'a [u8]),
}

impl<'a> DeviceOrHostAddress<'a> {
    /// Null reference.
    pub const NULL: Self = Self::Device(0);

    #[inline]
    pub fn is_null(&self) -> bool {
        match self {
            Self::Device(a) => *a == 0,
            Self::Host(b) => b.is_empty(),
        }
    }

    /// Device address, or `InvalidDescriptor` for host data.
    pub fn device(&self) -> Result<DeviceAddress> {
        match self {
            Self::Device(a) => Ok(*a),
            Self::Host(_) => Err(Error::invalid("host address used in a device build")),
        }
    }

    /// Host bytes, or `InvalidDescriptor` for a device address.
    pub fn host(&self) -> Result<&'a [u8]> {
        match self {
            Self::Host(b) => Ok(b),
            Self::Device(_) => Err(Error::invalid("device address used in a host build")),
        }
    }
}

/// Exclusive host view of a mapped region. Device access to the same
/// allocation blocks until the guard drops.
pub struct MappedRegion<'a> {
    guard: MappedRwLockWriteGuard<'a, [u8]>,
}

impl<'a> MappedRegion<'a> {
    pub fn new(guard: MappedRwLockWriteGuard<'a, [u8]>) -> Self {
        Self { guard }
    }
}

impl Deref for MappedRegion<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for MappedRegion<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

/// The buffer-mapping and device load/store contract.
///
/// Loads and stores may run concurrently from many invocations; ordering
/// between dispatches comes only from the caller's barriers.
pub trait DeviceMemory: Send + Sync {
    /// Copy `out.len()` bytes starting at `address` into `out`.
    fn read(&self, address: DeviceAddress, out: &mut [u8]) -> Result<()>;

    /// Store `data` at `address`.
    fn write(&self, address: DeviceAddress, data: &[u8]) -> Result<()>;

    /// Map a region for exclusive host access.
    ///
    /// Fails with [`Error::OutOfMemory`] when the backing buffer is not
    /// host visible, before anything is written.
    fn map(&self, region: BufferRegion) -> Result<MappedRegion<'_>>;
}

/// Typed helpers over [`DeviceMemory`].
pub trait MemoryExt {
    fn read_bytes(&self, address: DeviceAddress, len: usize) -> Result<Vec<u8>>;
    fn read_u32(&self, address: DeviceAddress) -> Result<u32>;
    fn read_u64(&self, address: DeviceAddress) -> Result<u64>;
    fn read_pod<T: Pod>(&self, address: DeviceAddress) -> Result<T>;
    fn write_u32(&self, address: DeviceAddress, value: u32) -> Result<()>;
    fn write_u64(&self, address: DeviceAddress, value: u64) -> Result<()>;
    fn write_pod<T: Pod>(&self, address: DeviceAddress, value: &T) -> Result<()>;
}

impl<M: DeviceMemory + ?Sized> MemoryExt for M {
    fn read_bytes(&self, address: DeviceAddress, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read(address, &mut out)?;
        Ok(out)
    }

    fn read_u32(&self, address: DeviceAddress) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read(address, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64(&self, address: DeviceAddress) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read(address, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn read_pod<T: Pod>(&self, address: DeviceAddress) -> Result<T> {
        let bytes = self.read_bytes(address, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    fn write_u32(&self, address: DeviceAddress, value: u32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    fn write_u64(&self, address: DeviceAddress, value: u64) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    fn write_pod<T: Pod>(&self, address: DeviceAddress, value: &T) -> Result<()> {
        self.write(address, bytemuck::bytes_of(value))
    }
}
