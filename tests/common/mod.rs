//! Helpers shared by the integration tests.

#![allow(dead_code)]

use rtaccel::bvh::geometry::IDENTITY_TRANSFORM;
use rtaccel::prelude::*;
use rtaccel::util::Rows3x4;

/// Vertices (0,0,0), (1,0,0), (0,1,0).
pub const UNIT_TRIANGLE: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];

pub fn translation(x: f32, y: f32, z: f32) -> Rows3x4 {
    let mut t = IDENTITY_TRANSFORM;
    t[0][3] = x;
    t[1][3] = y;
    t[2][3] = z;
    t
}

pub fn host_triangles(vertices: &[u8], flags: u32) -> Geometry<'_> {
    Geometry::triangles(
        TrianglesData {
            vertex_format: VertexFormat::R32G32B32Sfloat,
            vertex_data: DeviceOrHostAddress::Host(vertices),
            vertex_stride: 12,
            max_vertex: (vertices.len() / 12).saturating_sub(1) as u32,
            index_type: IndexType::None,
            index_data: DeviceOrHostAddress::NULL,
            transform_data: DeviceOrHostAddress::NULL,
        },
        flags,
    )
}

pub fn host_aabbs(boxes: &[u8], flags: u32) -> Geometry<'_> {
    Geometry::aabbs(AabbsData { data: DeviceOrHostAddress::Host(boxes), stride: 24 }, flags)
}

pub fn host_instances(records: &[u8]) -> Geometry<'_> {
    Geometry::instances(InstancesData { data: DeviceOrHostAddress::Host(records), array_of_pointers: false }, 0)
}

/// Allocate a host-visible structure sized for `geometries` and build it.
pub fn build_host(heap: &mut Heap, geometries: &[Geometry<'_>], counts: &[u32]) -> (AccelerationStructure, AccelHeader) {
    let sizes = get_build_sizes(geometries, counts);
    let region = heap
        .allocate(sizes.structure_size, MemoryKind::HostVisible)
        .expect("allocate structure");
    let device = Device::new(&*heap, Settings::default());
    let accel = device.create_structure(region).expect("create structure");
    let ranges: Vec<_> = counts.iter().map(|&n| BuildRange::new(n)).collect();
    let header = device.build(&accel, geometries, &ranges).expect("host build");
    (accel, header)
}

/// What one traced ray reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub t: f32,
    pub primitive_id: u32,
    pub instance_id: u32,
    pub hit_kind: u32,
    pub barycentrics: [f32; 2],
}

/// Trace one ray per launch id through a raygen/miss/closest-hit pipeline.
/// `None` marks rays that reached the miss shader.
pub fn trace(heap: &mut Heap, accel: DeviceAddress, rays: &[(Vec3, Vec3)]) -> Vec<Option<Hit>> {
    trace_with_flags(heap, accel, rays, 0)
}

pub fn trace_with_flags(heap: &mut Heap, accel: DeviceAddress, rays: &[(Vec3, Vec3)], flags: u32) -> Vec<Option<Hit>> {
    trace_with(heap, accel, rays, move |args| args.with_flags(flags))
}

/// Raygen shader tracing `rays[launch_id.x]` with a 32-byte payload and
/// storing the payload to `out + 32 * launch_id.x`.
pub fn raygen<F>(accel: DeviceAddress, rays: &[(Vec3, Vec3)], out: DeviceAddress, adjust: F) -> Shader
where
    F: Fn(TraceArgs) -> TraceArgs + Send + Sync + 'static,
{
    let ray_list = rays.to_vec();
    Shader::raygen(32)
        .then(move |ctx| {
            let (origin, dir) = ray_list[ctx.launch_id()[0] as usize];
            ctx.write_local(0, &[0u32; 8])?;
            Ok(Exit::TraceRay(adjust(TraceArgs::new(accel, origin, dir, 1e30).with_payload(0))))
        })
        .then(move |ctx| {
            let result: [u32; 8] = ctx.read_local(0)?;
            let i = ctx.launch_id()[0] as u64;
            ctx.memory().write_pod(out + 32 * i, &result)?;
            Ok(Exit::Return)
        })
}

/// Miss shader writing marker 2.
pub fn miss_shader() -> Shader {
    Shader::miss(0).then(|ctx| {
        ctx.write_payload(&[2u32, 0, 0, 0, 0, 0, 0, 0])?;
        Ok(Exit::Return)
    })
}

/// Closest-hit shader writing marker 1 and the committed hit.
pub fn closest_hit_shader() -> Shader {
    Shader::closest_hit(0).then(|ctx| {
        let ray = *ctx.ray();
        let [u, v] = ctx.barycentrics()?;
        ctx.write_payload(&[
            1u32,
            ray.tmax.to_bits(),
            ray.primitive_id,
            ray.instance_id,
            ray.hit_kind,
            u.to_bits(),
            v.to_bits(),
            ray.custom_index(),
        ])?;
        Ok(Exit::Return)
    })
}

pub fn decode(r: [u32; 8]) -> Option<Hit> {
    match r[0] {
        1 => Some(Hit {
            t: f32::from_bits(r[1]),
            primitive_id: r[2],
            instance_id: r[3],
            hit_kind: r[4],
            barycentrics: [f32::from_bits(r[5]), f32::from_bits(r[6])],
        }),
        2 => None,
        other => panic!("ray finished without miss or hit (marker {other})"),
    }
}

pub fn read_results(heap: &Heap, out: DeviceAddress, count: usize) -> Vec<[u32; 8]> {
    (0..count as u64).map(|i| heap.read_pod(out + 32 * i).expect("read result")).collect()
}

/// [`trace`] with every trace call's arguments passed through `adjust`.
pub fn trace_with<F>(heap: &mut Heap, accel: DeviceAddress, rays: &[(Vec3, Vec3)], adjust: F) -> Vec<Option<Hit>>
where
    F: Fn(TraceArgs) -> TraceArgs + Send + Sync + 'static,
{
    let out = heap
        .allocate(rays.len().max(1) as u64 * 32, MemoryKind::HostVisible)
        .expect("allocate output")
        .address;

    let info = PipelineCreateInfo::new(
        vec![raygen(accel, rays, out, adjust), miss_shader(), closest_hit_shader()],
        vec![
            ShaderGroup::General { general: 0 },
            ShaderGroup::General { general: 1 },
            ShaderGroup::TrianglesHit { closest_hit: Some(2), any_hit: None },
        ],
    );
    let pipeline = Pipeline::new(info, 31).expect("pipeline");
    let sbt = SbtLayout::new(0).miss(&[1]).hit(&[2]).upload(&pipeline, heap).expect("sbt");

    let device = Device::new(&*heap, Settings::default());
    device
        .trace_rays(&pipeline, &sbt, [rays.len() as u32, 1, 1], 0)
        .expect("trace_rays");

    read_results(heap, out, rays.len()).into_iter().map(decode).collect()
}

/// Rays shot down +z over a grid covering [-span, span] in x and y.
pub fn ray_grid(n: u32, span: f32, z: f32) -> Vec<(Vec3, Vec3)> {
    let mut rays = Vec::new();
    for y in 0..n {
        for x in 0..n {
            let fx = -span + 2.0 * span * (x as f32 + 0.5) / n as f32;
            let fy = -span + 2.0 * span * (y as f32 + 0.5) / n as f32;
            rays.push((Vec3::new(fx, fy, z), Vec3::Z));
        }
    }
    rays
}
