//! In-process device heap.

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::debug;

use super::{BufferRegion, DeviceAddress, DeviceMemory, MappedRegion};
use crate::util::{align_up, Error, Result};

/// First address handed out; keeps zero free as the null reference.
const HEAP_BASE: DeviceAddress = 0x1_0000;

/// Allocation granularity.
const HEAP_ALIGNMENT: u64 = 256;

/// Where an allocation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Mappable from the host.
    HostVisible,
    /// Device loads and stores only; [`DeviceMemory::map`] fails.
    DeviceLocal,
}

struct Allocation {
    region: BufferRegion,
    kind: MemoryKind,
    bytes: RwLock<Vec<u8>>,
}

/// Bump-allocated flat address space with one lock per allocation.
///
/// Allocation takes `&mut self`; once the buffers a workload needs exist,
/// the heap is shared and every access goes through `&self`.
pub struct Heap {
    allocations: Vec<Allocation>,
    next: DeviceAddress,
    capacity: u64,
    used: u64,
}

impl Heap {
    /// Create a heap that can hand out up to `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            allocations: Vec::new(),
            next: HEAP_BASE,
            capacity,
            used: 0,
        }
    }

    /// Allocate a zero-filled buffer.
    pub fn allocate(&mut self, size: u64, kind: MemoryKind) -> Result<BufferRegion> {
        let padded = align_up(size.max(1), HEAP_ALIGNMENT);
        if self.used + padded > self.capacity {
            return Err(Error::oom(format!(
                "heap exhausted: {} bytes requested, {} of {} in use",
                size, self.used, self.capacity
            )));
        }
        let len = usize::try_from(size).map_err(|_| Error::oom("allocation exceeds host address space"))?;

        let region = BufferRegion::new(self.next, size);
        self.allocations.push(Allocation {
            region,
            kind,
            bytes: RwLock::new(vec![0u8; len]),
        });
        self.next += padded;
        self.used += padded;
        debug!(address = region.address, size, ?kind, "allocated buffer");
        Ok(region)
    }

    /// Allocate a host-visible buffer holding `data`.
    pub fn upload(&mut self, data: &[u8]) -> Result<BufferRegion> {
        let region = self.allocate(data.len() as u64, MemoryKind::HostVisible)?;
        self.write(region.address, data)?;
        Ok(region)
    }

    /// Bytes currently handed out, including alignment padding.
    pub fn used(&self) -> u64 {
        self.used
    }

    fn find(&self, address: DeviceAddress, len: usize) -> Result<(&Allocation, usize)> {
        let idx = self
            .allocations
            .partition_point(|a| a.region.address <= address);
        let alloc = idx
            .checked_sub(1)
            .map(|i| &self.allocations[i])
            .filter(|a| a.region.contains(address, len as u64))
            .ok_or(Error::InvalidAddress { address, len })?;
        Ok((alloc, (address - alloc.region.address) as usize))
    }
}

impl DeviceMemory for Heap {
    fn read(&self, address: DeviceAddress, out: &mut [u8]) -> Result<()> {
        let (alloc, offset) = self.find(address, out.len())?;
        let bytes = alloc.bytes.read();
        out.copy_from_slice(&bytes[offset..offset + out.len()]);
        Ok(())
    }

    fn write(&self, address: DeviceAddress, data: &[u8]) -> Result<()> {
        let (alloc, offset) = self.find(address, data.len())?;
        let mut bytes = alloc.bytes.write();
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn map(&self, region: BufferRegion) -> Result<MappedRegion<'_>> {
        let len = region.size as usize;
        let (alloc, offset) = self
            .find(region.address, len)
            .map_err(|_| Error::oom(format!("cannot map {:#x}+{}", region.address, region.size)))?;
        if alloc.kind != MemoryKind::HostVisible {
            return Err(Error::oom(format!(
                "buffer at {:#x} is not host visible",
                alloc.region.address
            )));
        }
        let guard = RwLockWriteGuard::map(alloc.bytes.write(), |v| &mut v[offset..offset + len]);
        Ok(MappedRegion::new(guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryExt;

    #[test]
    fn test_allocate_and_access() {
        let mut heap = Heap::new(1 << 20);
        let a = heap.allocate(100, MemoryKind::HostVisible).unwrap();
        let b = heap.allocate(16, MemoryKind::DeviceLocal).unwrap();
        assert_ne!(a.address, 0);
        assert_eq!(a.address % HEAP_ALIGNMENT, 0);
        assert!(b.address >= a.end());

        heap.write_u64(a.address + 8, 0xABCD).unwrap();
        assert_eq!(heap.read_u64(a.address + 8).unwrap(), 0xABCD);
        heap.write_u32(b.address, 7).unwrap();
        assert_eq!(heap.read_u32(b.address).unwrap(), 7);
    }

    #[test]
    fn test_out_of_range_access() {
        let mut heap = Heap::new(1 << 20);
        let a = heap.allocate(16, MemoryKind::HostVisible).unwrap();
        assert!(matches!(
            heap.read_u64(a.address + 12),
            Err(Error::InvalidAddress { .. })
        ));
        assert!(heap.read_u32(0).is_err());
    }

    #[test]
    fn test_map_requires_host_visible() {
        let mut heap = Heap::new(1 << 20);
        let host = heap.allocate(64, MemoryKind::HostVisible).unwrap();
        let dev = heap.allocate(64, MemoryKind::DeviceLocal).unwrap();

        {
            let mut m = heap.map(host.slice(16, 16)).unwrap();
            m[0] = 0x5A;
        }
        assert_eq!(heap.read_bytes(host.address + 16, 1).unwrap(), vec![0x5A]);
        assert!(matches!(heap.map(dev), Err(Error::OutOfMemory(_))));
    }

    #[test]
    fn test_capacity() {
        let mut heap = Heap::new(512);
        heap.allocate(300, MemoryKind::HostVisible).unwrap();
        assert!(matches!(
            heap.allocate(300, MemoryKind::HostVisible),
            Err(Error::OutOfMemory(_))
        ));
    }
}
