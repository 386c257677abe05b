//! Acceleration-structure device facade.
//!
//! [`Device`] ties the builders, kernels and copy paths to one device
//! memory and one set of [`Settings`]. Structures are plain handles over
//! caller-owned buffer regions; nothing here allocates device memory.
//!
//! ```ignore
//! let sizes = get_build_sizes(&geometries, &[1]);
//! let region = heap.allocate(sizes.structure_size, MemoryKind::HostVisible)?;
//! let device = Device::new(&heap, Settings::default());
//! let accel = device.create_structure(region)?;
//! device.build(&accel, &geometries, &[BuildRange::new(1)])?;
//! ```

mod copy;
mod device_build;

pub use device_build::BuildInfo;

use tracing::debug;

use crate::bvh::geometry::{BuildRange, Geometry};
use crate::bvh::format::HEADER_PAD;
use crate::bvh::{get_build_sizes, host_build, AccelHeader, BuildSizes};
use crate::config::Settings;
use crate::memory::{BufferRegion, DeviceAddress, DeviceMemory};
use crate::util::{Error, Result};

/// Bytes of the version token [`Device::check_compatibility`] inspects.
pub const VERSION_TOKEN_SIZE: usize = 32;

/// UUID of this build; portable blobs carry it and are only accepted by a
/// matching build.
pub const DRIVER_UUID: [u8; 16] = parse_uuid(env!("RTACCEL_DRIVER_UUID"));

const fn parse_uuid(hex: &str) -> [u8; 16] {
    const fn nibble(c: u8) -> u8 {
        match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => panic!("driver uuid is not hex"),
        }
    }
    let bytes = hex.as_bytes();
    assert!(bytes.len() == 32, "driver uuid must be 32 hex digits");
    let mut out = [0u8; 16];
    let mut i = 0;
    while i < 16 {
        out[i] = (nibble(bytes[2 * i]) << 4) | nibble(bytes[2 * i + 1]);
        i += 1;
    }
    out
}

/// Handle of a structure living in a caller-owned buffer region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccelerationStructure {
    region: BufferRegion,
}

impl AccelerationStructure {
    /// Device address; instance records and traces refer to the structure by it.
    #[inline]
    pub fn address(&self) -> DeviceAddress {
        self.region.address
    }

    #[inline]
    pub fn region(&self) -> BufferRegion {
        self.region
    }
}

/// Header field reported by [`Device::write_properties`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    CompactedSize,
    SerializationSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    Incompatible,
}

/// Device-level entry points for building, copying and querying structures.
pub struct Device<'m> {
    memory: &'m dyn DeviceMemory,
    settings: Settings,
    driver_uuid: [u8; 16],
}

impl<'m> Device<'m> {
    pub fn new(memory: &'m dyn DeviceMemory, settings: Settings) -> Self {
        Self::with_uuid(memory, settings, DRIVER_UUID)
    }

    /// Device reporting a different driver UUID.
    pub fn with_uuid(memory: &'m dyn DeviceMemory, settings: Settings, driver_uuid: [u8; 16]) -> Self {
        Self { memory, settings, driver_uuid }
    }

    pub fn memory(&self) -> &'m dyn DeviceMemory {
        self.memory
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn driver_uuid(&self) -> [u8; 16] {
        self.driver_uuid
    }

    /// Wrap a buffer region. Node ids need the base to be 64-byte aligned,
    /// and the region must hold at least the header and the root node.
    pub fn create_structure(&self, region: BufferRegion) -> Result<AccelerationStructure> {
        if region.address == 0 || region.address % 64 != 0 {
            return Err(Error::invalid(format!(
                "structure address {:#x} is not 64-byte aligned",
                region.address
            )));
        }
        if region.size < HEADER_PAD {
            return Err(Error::oom(format!(
                "structure region of {} bytes is smaller than the {HEADER_PAD} byte header and root",
                region.size
            )));
        }
        debug!(address = region.address, size = region.size, "created structure");
        Ok(AccelerationStructure { region })
    }

    /// Release a handle. The buffer itself stays with its owner.
    pub fn destroy_structure(&self, accel: AccelerationStructure) {
        debug!(address = accel.address(), "destroyed structure");
    }

    pub fn address(&self, accel: &AccelerationStructure) -> DeviceAddress {
        accel.address()
    }

    pub fn get_build_sizes(&self, geometries: &[Geometry<'_>], max_primitive_counts: &[u32]) -> BuildSizes {
        get_build_sizes(geometries, max_primitive_counts)
    }

    /// Host-synchronous build. The structure's buffer must be host visible
    /// and the geometry data host resident.
    pub fn build(
        &self,
        accel: &AccelerationStructure,
        geometries: &[Geometry<'_>],
        ranges: &[BuildRange],
    ) -> Result<AccelHeader> {
        host_build::build(self.memory, accel.region, geometries, ranges)
    }

    /// Host builds of independent structures, one after another.
    pub fn build_many(&self, infos: &[BuildInfo<'_>]) -> Result<Vec<AccelHeader>> {
        infos
            .iter()
            .map(|info| self.build(info.dst, info.geometries, info.ranges))
            .collect()
    }
}
