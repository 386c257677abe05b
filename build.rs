fn main() {
    let now = time::OffsetDateTime::now_utc();
    let date_fmt = time::format_description::parse("[month repr:short] [day padding:space] [year]")
        .expect("valid date format");
    let time_fmt = time::format_description::parse("[hour]:[minute]:[second]")
        .expect("valid time format");

    let date = std::env::var("RTACCEL_BUILD_DATE")
        .unwrap_or_else(|_| now.format(&date_fmt).unwrap_or_else(|_| "unknown".to_string()));
    let time = std::env::var("RTACCEL_BUILD_TIME")
        .unwrap_or_else(|_| now.format(&time_fmt).unwrap_or_else(|_| "unknown".to_string()));

    // Portable blobs are only accepted by the build that wrote them.
    let uuid = std::env::var("RTACCEL_DRIVER_UUID")
        .ok()
        .filter(|s| s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or_else(|| {
            let version = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();
            let name = std::env::var("CARGO_PKG_NAME").unwrap_or_default();
            let hi = fnv1a(format!("{}-{}", name, version).as_bytes());
            let lo = fnv1a(&now.unix_timestamp_nanos().to_le_bytes());
            format!("{:016x}{:016x}", hi, lo)
        });

    println!("cargo:rustc-env=RTACCEL_BUILD_DATE={}", date);
    println!("cargo:rustc-env=RTACCEL_BUILD_TIME={}", time);
    println!("cargo:rustc-env=RTACCEL_DRIVER_UUID={}", uuid);
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}
