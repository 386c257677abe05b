//! rtaccel CLI - build, serialize, inspect and trace BVH scenes.

mod scene;

use std::env;
use std::path::Path;
use std::process;
use std::time::Instant;

use tracing::debug;
use tracing_subscriber::EnvFilter;

use rtaccel::bvh::format::{read_node, SerializationHeader, SERIALIZATION_HEADER_SIZE};
use rtaccel::bvh::inspect;
use rtaccel::memory::{Heap, MemoryExt, MemoryKind};
use rtaccel::pipeline::{
    Exit, Pipeline, PipelineCreateInfo, SbtLayout, Shader, ShaderGroup, TraceArgs,
    HIT_KIND_BACK_FACING, HIT_KIND_FRONT_FACING,
};
use rtaccel::util::{Aabb, Vec3};
use rtaccel::{Compatibility, Device, Error, Result, Settings};

use scene::Scene;

/// Environment variable holding the tracing filter.
const LOG_ENV: &str = "RTACCEL_LOG";

const HEAP_SIZE: u64 = 256 << 20;

fn init_logging(verbosity: Option<&str>, settings: &Settings) {
    let filter = match verbosity {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
            EnvFilter::new(settings.log_filter.as_deref().unwrap_or("warn"))
        }),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let args: Vec<String> = env::args().collect();

    // Parse global flags
    let mut verbosity = None;
    let mut filtered_args: Vec<&str> = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "-v" | "--verbose" => verbosity = Some("debug"),
            "-vv" | "--trace" => verbosity = Some("trace"),
            "-q" | "--quiet" => verbosity = Some("error"),
            _ => filtered_args.push(arg),
        }
    }

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            process::exit(1);
        }
    };
    init_logging(verbosity, &settings);

    if filtered_args.is_empty() {
        print_help();
        return;
    }

    let result = match filtered_args[0] {
        "sizes" | "s" => {
            let Some(file) = filtered_args.get(1) else {
                usage("rtaccel sizes <scene.json>");
            };
            cmd_sizes(file)
        }
        "build" | "b" => {
            let (Some(file), Some(out)) = (filtered_args.get(1), flag_value(&filtered_args, &["-o", "--output"])) else {
                usage("rtaccel build <scene.json> -o <blob>");
            };
            cmd_build(file, out, &settings)
        }
        "inspect" | "i" => {
            let Some(file) = filtered_args.get(1) else {
                usage("rtaccel inspect <blob>");
            };
            cmd_inspect(file, &settings)
        }
        "trace" | "t" => {
            let Some(file) = filtered_args.get(1) else {
                usage("rtaccel trace <scene.json> [-W N] [-H N]");
            };
            let width = parse_dim(&filtered_args, &["-W", "--width"], 64);
            let height = parse_dim(&filtered_args, &["-H", "--height"], 32);
            cmd_trace(file, width, height, &settings)
        }
        "version" | "-V" | "--version" => {
            print_banner();
            Ok(())
        }
        "help" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!();
            print_help();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn usage(text: &str) -> ! {
    eprintln!("Error: missing arguments");
    eprintln!("Usage: {}", text);
    process::exit(1);
}

/// Value following any of `names`.
fn flag_value<'a>(args: &[&'a str], names: &[&str]) -> Option<&'a str> {
    args.iter()
        .position(|a| names.contains(a))
        .and_then(|i| args.get(i + 1))
        .copied()
}

fn parse_dim(args: &[&str], names: &[&str], default: u32) -> u32 {
    match flag_value(args, names) {
        Some(v) => match v.parse::<u32>() {
            Ok(n) if n > 0 => n,
            _ => {
                eprintln!("Error: '{}' is not a positive integer", v);
                process::exit(1);
            }
        },
        None => default,
    }
}

fn print_banner() {
    println!(
        "rtaccel {} (built {} {})",
        env!("CARGO_PKG_VERSION"),
        env!("RTACCEL_BUILD_DATE"),
        env!("RTACCEL_BUILD_TIME")
    );
}

fn print_help() {
    print_banner();
    println!();
    println!("USAGE:");
    println!("    rtaccel [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    s, sizes   <scene.json>             Print build size estimates");
    println!("    b, build   <scene.json> -o <blob>   Build and write a portable blob");
    println!("    i, inspect <blob>                   Show blob compatibility, header and node census");
    println!("    t, trace   <scene.json> [-W N -H N] Trace an orthographic ray grid, print a hit map");
    println!("    version                             Show version");
    println!("    help                                Show this help");
    println!();
    println!("OPTIONS:");
    println!("    -v, --verbose   Debug logging");
    println!("    -vv, --trace    Trace logging");
    println!("    -q, --quiet     Errors only");
    println!();
    println!("ENVIRONMENT:");
    println!("    {}     tracing filter (e.g. rtaccel=debug)", LOG_ENV);
    println!("    {}  settings JSON file", rtaccel::config::CONFIG_ENV);
}

fn cmd_sizes(path: &str) -> Result<()> {
    let scene = Scene::load(path)?;
    println!("{:<16} {:>14} {:>14} {:>14}", "structure", "size", "build scratch", "update scratch");
    for (name, sizes) in scene.sizes()? {
        println!(
            "{:<16} {:>14} {:>14} {:>14}",
            name, sizes.structure_size, sizes.build_scratch_size, sizes.update_scratch_size
        );
    }
    Ok(())
}

fn cmd_build(path: &str, out: &str, settings: &Settings) -> Result<()> {
    let scene = Scene::load(path)?;
    let mut heap = Heap::new(HEAP_SIZE);
    let start = Instant::now();
    let built = scene.build(&mut heap, settings)?;
    debug!(elapsed_ms = start.elapsed().as_millis() as u64, "build finished");

    let device = Device::new(&heap, settings.clone());
    let mut blob = vec![0u8; built.header.serialization_size as usize];
    let written = device.copy_to_portable(&built.root, &mut blob)?;
    blob.truncate(written);
    std::fs::write(out, &blob)?;

    println!("Structures:   {}", built.structures);
    println!("Compacted:    {} bytes", built.header.compacted_size);
    println!("Serialized:   {} bytes -> {}", written, out);
    if built.header.instance_count > 0 {
        println!("Note: instance references point into this process's heap");
    }
    Ok(())
}

fn cmd_inspect(path: &str, settings: &Settings) -> Result<()> {
    let blob = std::fs::read(Path::new(path))?;
    let heap = Heap::new(0);
    let device = Device::new(&heap, settings.clone());

    let compat = device.check_compatibility(&blob);
    println!("File:          {}", path);
    println!(
        "Compatibility: {}",
        match compat {
            Compatibility::Compatible => "compatible",
            Compatibility::Incompatible => "incompatible (written by another build)",
        }
    );

    if (blob.len() as u64) < SERIALIZATION_HEADER_SIZE {
        return Err(Error::invalid("blob shorter than its header"));
    }
    let header: SerializationHeader = read_node(&blob);
    let table = (SERIALIZATION_HEADER_SIZE + 8 * header.instance_count) as usize;
    let bytes = blob
        .get(table..table + header.compacted_size as usize)
        .filter(|b| b.len() >= std::mem::size_of::<rtaccel::bvh::AccelHeader>())
        .ok_or_else(|| Error::invalid("blob shorter than its header claims"))?;

    let accel: rtaccel::bvh::AccelHeader = read_node(bytes);
    let bounds = accel.bounds();
    println!("Compacted:     {} bytes", header.compacted_size);
    println!("Serialized:    {} bytes", header.serialization_size);
    println!("Instances:     {}", header.instance_count);
    println!("Root node:     {:#x}", accel.root_node_id);
    println!("Bounds:        {:?} .. {:?}", bounds.min.to_array(), bounds.max.to_array());
    println!("Nodes:         {}", inspect(bytes)?);
    Ok(())
}

/// Orthographic grid over the scene bounds, looking down +z.
fn view_window(bounds: Aabb) -> (Vec3, Vec3) {
    if bounds.is_nan() || bounds.is_empty() {
        return (Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0));
    }
    (bounds.min, bounds.max)
}

fn cmd_trace(path: &str, width: u32, height: u32, settings: &Settings) -> Result<()> {
    let scene = Scene::load(path)?;
    let mut heap = Heap::new(HEAP_SIZE);
    let built = scene.build(&mut heap, settings)?;
    let accel = built.root.address();
    let (lo, hi) = view_window(built.header.bounds());
    let out = heap.allocate(width as u64 * height as u64 * 4, MemoryKind::HostVisible)?.address;

    let raygen = Shader::raygen(16)
        .then(move |ctx| {
            let [x, y, _] = ctx.launch_id();
            let [w, h, _] = ctx.launch_size();
            let fx = (x as f32 + 0.5) / w as f32;
            let fy = (y as f32 + 0.5) / h as f32;
            let origin = Vec3::new(lo.x + fx * (hi.x - lo.x), hi.y - fy * (hi.y - lo.y), lo.z - 1.0);
            ctx.write_local(0, &(b'.' as u32))?;
            Ok(Exit::TraceRay(TraceArgs::new(accel, origin, Vec3::Z, f32::MAX).with_payload(0)))
        })
        .then(move |ctx| {
            let [x, y, _] = ctx.launch_id();
            let w = ctx.launch_size()[0];
            let v: u32 = ctx.read_local(0)?;
            ctx.memory().write_u32(out + 4 * (y as u64 * w as u64 + x as u64), v)?;
            Ok(Exit::Return)
        });
    let miss = Shader::miss(0).then(|_| Ok(Exit::Return));
    let closest_hit = Shader::closest_hit(0).then(|ctx| {
        let c = match ctx.ray().hit_kind {
            HIT_KIND_FRONT_FACING => b'#',
            HIT_KIND_BACK_FACING => b'+',
            _ => b'*',
        };
        ctx.write_payload(&(c as u32))?;
        Ok(Exit::Return)
    });

    let info = PipelineCreateInfo::new(
        vec![raygen, miss, closest_hit],
        vec![
            ShaderGroup::General { general: 0 },
            ShaderGroup::General { general: 1 },
            ShaderGroup::TrianglesHit { closest_hit: Some(2), any_hit: None },
        ],
    );
    let pipeline = Pipeline::new(info, settings.max_ray_recursion_depth)?;
    let sbt = SbtLayout::new(0).miss(&[1]).hit(&[2]).upload(&pipeline, &mut heap)?;

    let device = Device::new(&heap, settings.clone());
    let start = Instant::now();
    device.trace_rays(&pipeline, &sbt, [width, height, 1], 0)?;
    debug!(elapsed_ms = start.elapsed().as_millis() as u64, "trace finished");

    let pixels = heap.read_bytes(out, width as usize * height as usize * 4)?;
    for row in pixels.chunks_exact(width as usize * 4) {
        let line: String = row.chunks_exact(4).map(|p| p[0] as char).collect();
        println!("{}", line);
    }
    Ok(())
}
