//! Little-endian field access on raw node, header and blob bytes.

use byteorder::{ByteOrder, LittleEndian};

use super::{Aabb, Vec3};

#[inline]
pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&bytes[offset..])
}

#[inline]
pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    LittleEndian::read_u64(&bytes[offset..])
}

#[inline]
pub fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    LittleEndian::read_f32(&bytes[offset..])
}

#[inline]
pub fn read_vec3(bytes: &[u8], offset: usize) -> Vec3 {
    Vec3::new(
        read_f32(bytes, offset),
        read_f32(bytes, offset + 4),
        read_f32(bytes, offset + 8),
    )
}

/// Reads a `min.xyz, max.xyz` box.
#[inline]
pub fn read_aabb(bytes: &[u8], offset: usize) -> Aabb {
    Aabb::new(read_vec3(bytes, offset), read_vec3(bytes, offset + 12))
}

#[inline]
pub fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut bytes[offset..], value);
}

#[inline]
pub fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    LittleEndian::write_u64(&mut bytes[offset..], value);
}

#[inline]
pub fn write_f32(bytes: &mut [u8], offset: usize, value: f32) {
    LittleEndian::write_f32(&mut bytes[offset..], value);
}

#[inline]
pub fn write_vec3(bytes: &mut [u8], offset: usize, v: Vec3) {
    write_f32(bytes, offset, v.x);
    write_f32(bytes, offset + 4, v.y);
    write_f32(bytes, offset + 8, v.z);
}

#[inline]
pub fn write_aabb(bytes: &mut [u8], offset: usize, b: &Aabb) {
    write_vec3(bytes, offset, b.min);
    write_vec3(bytes, offset + 12, b.max);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_access() {
        let mut buf = [0u8; 40];
        write_u32(&mut buf, 0, 0xDEAD_BEEF);
        write_u64(&mut buf, 8, 0x0123_4567_89AB_CDEF);
        write_aabb(&mut buf, 16, &Aabb::new(Vec3::new(1.0, 2.0, 3.0), Vec3::splat(4.0)));

        assert_eq!(buf[0], 0xEF);
        assert_eq!(read_u32(&buf, 0), 0xDEAD_BEEF);
        assert_eq!(read_u64(&buf, 8), 0x0123_4567_89AB_CDEF);
        assert_eq!(read_vec3(&buf, 16), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(read_aabb(&buf, 16).max, Vec3::splat(4.0));
    }
}
