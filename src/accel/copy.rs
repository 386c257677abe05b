//! Copies, portable (de)serialization and property queries.

use tracing::debug;

use super::{AccelerationStructure, Compatibility, Device, PropertyKind, VERSION_TOKEN_SIZE};
use crate::bvh::format::{
    read_node, AccelHeader, SerializationHeader, HEADER_SIZE, INSTANCE_NODE_SIZE,
    INSTANCE_PTR_LOW_MASK, SERIALIZATION_HEADER_SIZE,
};
use crate::command::{CommandSink, DispatchSize};
use crate::kernels::{CopyArgs, CopyMode, Kernel};
use crate::memory::{BufferRegion, DeviceAddress};
use crate::util::{read_u64, write_u64, Error, Result};

/// Offset of the indirect copy workgroup count in [`AccelHeader`].
const COPY_DISPATCH_OFFSET: u64 = std::mem::offset_of!(AccelHeader, copy_dispatch_size) as u64;

/// Blob header plus one 8-byte pointer per instance.
fn table_size(instance_count: u64) -> Result<usize> {
    instance_count
        .checked_mul(8)
        .and_then(|n| n.checked_add(SERIALIZATION_HEADER_SIZE))
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| Error::invalid(format!("instance count {instance_count} overflows the pointer table")))
}

/// The instance nodes a header describes must lie inside `len` bytes.
fn check_instance_region(header: &AccelHeader, count: u64, len: usize) -> Result<()> {
    let end = count
        .checked_mul(INSTANCE_NODE_SIZE)
        .and_then(|n| n.checked_add(header.instance_offset));
    match end {
        Some(end) if end <= len as u64 => Ok(()),
        _ => Err(Error::invalid("instance region exceeds the structure")),
    }
}

impl Device<'_> {
    /// Header of `accel`, read through a host mapping.
    pub fn header(&self, accel: &AccelerationStructure) -> Result<AccelHeader> {
        let mapped = self.memory.map(accel.region.slice(0, HEADER_SIZE))?;
        Ok(read_node(&mapped))
    }

    /// Host copy of the structure's `compacted_size` bytes.
    fn read_structure(&self, accel: &AccelerationStructure) -> Result<(AccelHeader, Vec<u8>)> {
        let mapped = self.memory.map(accel.region)?;
        let header: AccelHeader = read_node(&mapped);
        let len = header.compacted_size as usize;
        let bytes = mapped
            .get(..len)
            .ok_or_else(|| Error::invalid(format!("compacted size {len} exceeds the structure buffer")))?
            .to_vec();
        Ok((header, bytes))
    }

    /// Write `bytes` at the start of `dst` through a host mapping.
    fn write_structure(&self, dst: &AccelerationStructure, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 > dst.region.size {
            return Err(Error::invalid(format!(
                "{} bytes do not fit a {} byte structure",
                bytes.len(),
                dst.region.size
            )));
        }
        let mut mapped = self.memory.map(BufferRegion::new(dst.address(), bytes.len() as u64))?;
        mapped.copy_from_slice(bytes);
        Ok(())
    }

    /// Duplicate `src` into `dst` on the host.
    #[tracing::instrument(skip_all, fields(src = src.address(), dst = dst.address()))]
    pub fn copy(&self, src: &AccelerationStructure, dst: &AccelerationStructure) -> Result<()> {
        let (_, bytes) = self.read_structure(src)?;
        self.write_structure(dst, &bytes)
    }

    /// Serialize `src` into `dst`, which must hold `serialization_size` bytes.
    /// Returns the bytes written.
    #[tracing::instrument(skip_all, fields(src = src.address()))]
    pub fn copy_to_portable(&self, src: &AccelerationStructure, dst: &mut [u8]) -> Result<usize> {
        let (header, bytes) = self.read_structure(src)?;
        let count = header.instance_count as u64;
        let table = table_size(count)?;
        let total = table + bytes.len();
        if dst.len() < total {
            return Err(Error::invalid(format!("portable buffer needs {total} bytes, got {}", dst.len())));
        }

        let blob = SerializationHeader {
            driver_uuid: self.driver_uuid,
            compat: [0; 16],
            serialization_size: header.serialization_size,
            compacted_size: header.compacted_size,
            instance_count: count,
        };
        dst[..SERIALIZATION_HEADER_SIZE as usize].copy_from_slice(bytemuck::bytes_of(&blob));

        check_instance_region(&header, count, bytes.len())?;
        let (head, data) = dst.split_at_mut(table);
        data[..bytes.len()].copy_from_slice(&bytes);
        for i in 0..count {
            let node = (header.instance_offset + i * INSTANCE_NODE_SIZE) as usize;
            let ptr = read_u64(data, node);
            write_u64(head, table_size(i)?, ptr & !INSTANCE_PTR_LOW_MASK);
            write_u64(data, node, ptr & INSTANCE_PTR_LOW_MASK);
        }
        debug!(bytes = total, instances = count, "serialized");
        Ok(total)
    }

    /// Deserialize a portable blob into `dst`, relocating instance pointers
    /// through the blob's pointer table.
    #[tracing::instrument(skip_all, fields(dst = dst.address()))]
    pub fn copy_from_portable(&self, src: &[u8], dst: &AccelerationStructure) -> Result<()> {
        if self.check_compatibility(src) != Compatibility::Compatible {
            return Err(Error::Incompatible);
        }
        if (src.len() as u64) < SERIALIZATION_HEADER_SIZE {
            return Err(Error::invalid("portable blob shorter than its header"));
        }
        let blob: SerializationHeader = read_node(src);
        let table = table_size(blob.instance_count)?;
        let end = usize::try_from(blob.compacted_size)
            .ok()
            .and_then(|n| n.checked_add(table))
            .ok_or_else(|| Error::invalid("portable blob sizes overflow"))?;
        let mut bytes = src
            .get(table..end)
            .ok_or_else(|| Error::invalid("portable blob shorter than its header claims"))?
            .to_vec();
        if bytes.len() < HEADER_SIZE as usize {
            return Err(Error::invalid("portable blob has no structure header"));
        }

        let header: AccelHeader = read_node(&bytes);
        check_instance_region(&header, blob.instance_count, bytes.len())?;
        for i in 0..blob.instance_count {
            let node = (header.instance_offset + i * INSTANCE_NODE_SIZE) as usize;
            let ptr = read_u64(&bytes, node);
            let base = read_u64(src, table_size(i)?);
            write_u64(&mut bytes, node, (ptr & INSTANCE_PTR_LOW_MASK) | base);
        }
        self.write_structure(dst, &bytes)?;
        debug!(bytes = bytes.len(), instances = blob.instance_count, "deserialized");
        Ok(())
    }

    /// Record a device copy sized by the source header.
    pub fn cmd_copy(&self, sink: &mut dyn CommandSink, src: &AccelerationStructure, dst: &AccelerationStructure) {
        sink.dispatch(
            Kernel::Copy(CopyArgs { src_addr: src.address(), dst_addr: dst.address(), mode: CopyMode::Copy }),
            DispatchSize::Indirect(src.address() + COPY_DISPATCH_OFFSET),
        );
    }

    /// Record serialization of `src` into the buffer at `dst`.
    pub fn cmd_copy_to_portable(&self, sink: &mut dyn CommandSink, src: &AccelerationStructure, dst: DeviceAddress) {
        sink.dispatch(
            Kernel::Copy(CopyArgs { src_addr: src.address(), dst_addr: dst, mode: CopyMode::Serialize }),
            DispatchSize::Indirect(src.address() + COPY_DISPATCH_OFFSET),
        );
        sink.barrier();
        let mut ids = [0u8; 32];
        ids[..16].copy_from_slice(&self.driver_uuid);
        sink.update_buffer(dst, &ids);
    }

    /// Record deserialization of the blob at `src` into `dst`.
    pub fn cmd_copy_from_portable(&self, sink: &mut dyn CommandSink, src: DeviceAddress, dst: &AccelerationStructure) {
        sink.dispatch(
            Kernel::Copy(CopyArgs { src_addr: src, dst_addr: dst.address(), mode: CopyMode::Deserialize }),
            DispatchSize::Groups(self.settings.deserialize_workgroups),
        );
    }

    /// Gather one header field per structure into `out` at `stride` bytes
    /// apart. Elements that would not fit entirely are skipped.
    pub fn write_properties(
        &self,
        accels: &[AccelerationStructure],
        kind: PropertyKind,
        out: &mut [u8],
        stride: usize,
    ) -> Result<()> {
        for (i, accel) in accels.iter().enumerate() {
            let header = self.header(accel)?;
            let value = match kind {
                PropertyKind::CompactedSize => header.compacted_size,
                PropertyKind::SerializationSize => header.serialization_size,
            };
            let at = stride * i;
            if at + 8 <= out.len() {
                write_u64(out, at, value);
            }
        }
        Ok(())
    }

    /// Whether a portable blob starting with `version` was written by a
    /// build with this driver UUID.
    pub fn check_compatibility(&self, version: &[u8]) -> Compatibility {
        match version.get(..VERSION_TOKEN_SIZE) {
            Some(token) if token[..16] == self.driver_uuid && token[16..].iter().all(|&b| b == 0) => {
                Compatibility::Compatible
            }
            _ => Compatibility::Incompatible,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::memory::{Heap, MemoryKind};

    #[test]
    fn test_check_compatibility() {
        let heap = Heap::new(1 << 16);
        let device = Device::with_uuid(&heap, Settings::default(), [7; 16]);
        let mut token = [0u8; 32];
        token[..16].copy_from_slice(&[7; 16]);
        assert_eq!(device.check_compatibility(&token), Compatibility::Compatible);
        token[20] = 1;
        assert_eq!(device.check_compatibility(&token), Compatibility::Incompatible);
        assert_eq!(device.check_compatibility(&token[..8]), Compatibility::Incompatible);
        assert_eq!(device.check_compatibility(&[0u8; 32]), Compatibility::Incompatible);
    }

    #[test]
    fn test_write_properties_stride_bounds() {
        let mut heap = Heap::new(1 << 20);
        let a = heap.allocate(256, MemoryKind::HostVisible).unwrap();
        let b = heap.allocate(256, MemoryKind::HostVisible).unwrap();
        let mut header = AccelHeader::default();
        header.set_sizes(320, 0);
        crate::memory::MemoryExt::write_pod(&heap, a.address, &header).unwrap();
        header.set_sizes(640, 0);
        crate::memory::MemoryExt::write_pod(&heap, b.address, &header).unwrap();

        let device = Device::new(&heap, Settings::default());
        let accels = [device.create_structure(a).unwrap(), device.create_structure(b).unwrap()];

        let mut out = [0u8; 20];
        device.write_properties(&accels, PropertyKind::CompactedSize, &mut out, 12).unwrap();
        assert_eq!(read_u64(&out, 0), 320);
        assert_eq!(read_u64(&out, 12), 640);

        let mut short = [0xFFu8; 16];
        device.write_properties(&accels, PropertyKind::SerializationSize, &mut short, 12).unwrap();
        assert_eq!(read_u64(&short, 0), 320 + 128);
        assert_eq!(&short[12..], &[0xFF; 4]);
    }

    #[test]
    fn test_copy_requires_host_visible() {
        let mut heap = Heap::new(1 << 20);
        let src = heap.allocate(256, MemoryKind::DeviceLocal).unwrap();
        let dst = heap.allocate(256, MemoryKind::HostVisible).unwrap();
        let device = Device::new(&heap, Settings::default());
        let src = device.create_structure(src).unwrap();
        let dst = device.create_structure(dst).unwrap();
        assert!(matches!(device.copy(&src, &dst), Err(Error::OutOfMemory(_))));
    }
}
