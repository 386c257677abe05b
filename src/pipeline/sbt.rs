//! Shader binding table regions.
//!
//! Each record starts with a 32-byte group handle; the dispatcher reads
//! the first handle word (or the second, for any-hit and intersection
//! lookups) and exposes the bytes after the handle as the shader record.

use super::group::Pipeline;
use super::HANDLE_SIZE;
use crate::memory::{DeviceAddress, DeviceMemory, Heap, MemoryExt};
use crate::util::{align_up, Error, Result};

/// Alignment of each region's base address.
pub const SBT_BASE_ALIGNMENT: u64 = 64;

/// Strided array of SBT records in device memory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SbtRegion {
    pub address: DeviceAddress,
    pub stride: u64,
    pub size: u64,
}

impl SbtRegion {
    #[inline]
    pub fn record(&self, index: u32) -> DeviceAddress {
        self.address + index as u64 * self.stride
    }

    /// First (`word == 0`) or second handle word of record `index`, and the
    /// address of its shader record data.
    pub(crate) fn load(&self, memory: &dyn DeviceMemory, index: u32, word: u64) -> Result<(u32, DeviceAddress)> {
        let record = self.record(index);
        let handle = memory.read_u32(record + word * 4)?;
        Ok((handle, record + HANDLE_SIZE as u64))
    }
}

/// The four regions a launch reads.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShaderBindingTable {
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
    pub callable: SbtRegion,
}

impl ShaderBindingTable {
    /// Hit record index of a candidate:
    /// `sbt_offset + instance_sbt_offset + sbt_stride * geometry_index`.
    #[inline]
    pub fn hit_index(sbt_offset: u32, instance_sbt_offset: u32, sbt_stride: u32, geometry_index: u32) -> u32 {
        sbt_offset
            .wrapping_add(instance_sbt_offset & 0x00FF_FFFF)
            .wrapping_add(sbt_stride.wrapping_mul(geometry_index))
    }
}

/// Group indices placed into each region, with optional inline data per
/// record.
#[derive(Debug, Default, Clone)]
pub struct SbtLayout {
    pub raygen: u32,
    pub miss: Vec<u32>,
    pub hit: Vec<u32>,
    pub callable: Vec<u32>,
    /// Bytes after the handle in every record.
    pub record_data_size: u32,
}

impl SbtLayout {
    pub fn new(raygen: u32) -> Self {
        Self { raygen, ..Default::default() }
    }

    pub fn miss(mut self, groups: &[u32]) -> Self {
        self.miss = groups.to_vec();
        self
    }

    pub fn hit(mut self, groups: &[u32]) -> Self {
        self.hit = groups.to_vec();
        self
    }

    pub fn callable(mut self, groups: &[u32]) -> Self {
        self.callable = groups.to_vec();
        self
    }

    pub fn record_data_size(mut self, size: u32) -> Self {
        self.record_data_size = size;
        self
    }

    /// Record stride: handle plus data, rounded to 32 bytes.
    pub fn stride(&self) -> u64 {
        align_up(HANDLE_SIZE as u64 + self.record_data_size as u64, 32)
    }

    /// Encode all four regions into one buffer. Offsets in the returned
    /// table are relative to the buffer start.
    pub fn encode(&self, pipeline: &Pipeline) -> Result<(Vec<u8>, ShaderBindingTable)> {
        let stride = self.stride();
        let mut out = Vec::new();
        let mut region = |groups: &[u32]| -> Result<SbtRegion> {
            let base = align_up(out.len() as u64, SBT_BASE_ALIGNMENT);
            out.resize(base as usize, 0);
            for &g in groups {
                let handle = pipeline.group_handle(g as usize).ok_or_else(|| {
                    Error::InvalidPipeline(format!("SBT references missing group {g}"))
                })?;
                let start = out.len();
                out.resize(start + stride as usize, 0);
                out[start..start + HANDLE_SIZE as usize].copy_from_slice(&handle);
            }
            Ok(SbtRegion { address: base, stride, size: groups.len() as u64 * stride })
        };

        let table = ShaderBindingTable {
            raygen: region(&[self.raygen])?,
            miss: region(&self.miss)?,
            hit: region(&self.hit)?,
            callable: region(&self.callable)?,
        };
        Ok((out, table))
    }

    /// Encode and upload into host-visible memory of `heap`.
    pub fn upload(&self, pipeline: &Pipeline, heap: &mut Heap) -> Result<ShaderBindingTable> {
        let (bytes, mut table) = self.encode(pipeline)?;
        let base = heap.upload(&bytes)?.address;
        for region in [&mut table.raygen, &mut table.miss, &mut table.hit, &mut table.callable] {
            region.address += base;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Exit, PipelineCreateInfo, Shader, ShaderGroup};

    fn pipeline() -> Pipeline {
        let info = PipelineCreateInfo::new(
            vec![
                Shader::raygen(0).then(|_| Ok(Exit::Return)),
                Shader::miss(0).then(|_| Ok(Exit::Return)),
                Shader::closest_hit(0).then(|_| Ok(Exit::Return)),
            ],
            vec![
                ShaderGroup::General { general: 0 },
                ShaderGroup::General { general: 1 },
                ShaderGroup::TrianglesHit { closest_hit: Some(2), any_hit: None },
            ],
        );
        Pipeline::new(info, 31).unwrap()
    }

    #[test]
    fn test_hit_index() {
        assert_eq!(ShaderBindingTable::hit_index(1, 2, 3, 4), 15);
        // instance offset keeps 24 bits
        assert_eq!(ShaderBindingTable::hit_index(0, 0xFF00_0001, 0, 9), 1);
    }

    #[test]
    fn test_encode_layout() {
        let p = pipeline();
        let layout = SbtLayout::new(0).miss(&[1, 1]).hit(&[2]).record_data_size(8);
        assert_eq!(layout.stride(), 64);

        let (bytes, table) = layout.encode(&p).unwrap();
        assert_eq!(table.raygen, SbtRegion { address: 0, stride: 64, size: 64 });
        assert_eq!(table.miss, SbtRegion { address: 64, stride: 64, size: 128 });
        assert_eq!(table.hit.address, 192);
        assert_eq!(table.callable.size, 0);
        assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[128..132], &3u32.to_le_bytes());
        assert_eq!(&bytes[192..196], &4u32.to_le_bytes());

        assert!(SbtLayout::new(7).encode(&p).is_err());
    }

    #[test]
    fn test_upload_and_load() {
        let p = pipeline();
        let mut heap = Heap::new(1 << 16);
        let table = SbtLayout::new(0).miss(&[1]).hit(&[2]).upload(&p, &mut heap).unwrap();
        let (handle, record) = table.hit.load(&heap, 0, 0).unwrap();
        assert_eq!(handle, 4);
        assert_eq!(record, table.hit.address + 32);
        assert_eq!(table.miss.load(&heap, 0, 1).unwrap().0, 0);
    }
}
