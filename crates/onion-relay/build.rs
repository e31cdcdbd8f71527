//! Record build information for `onion-relay build-info`.

fn main() {
    // enabled cargo features; ours are lowercase with '-'
    let features = std::env::vars()
        .filter_map(|(env_name, val)| feature_name(env_name, val))
        .map(|feature| feature.replace('_', "-").to_lowercase())
        .collect::<Vec<_>>()
        .join(",");
    println!("cargo:rustc-env=BUILD_FEATURES={features}");

    for (var, name) in [
        ("OPT_LEVEL", "BUILD_OPT_LEVEL"),
        ("PROFILE", "BUILD_PROFILE"),
        ("DEBUG", "BUILD_DEBUG"),
        ("TARGET", "BUILD_TARGET"),
        ("HOST", "BUILD_HOST"),
    ] {
        let val = std::env::var(var).unwrap_or_else(|_| panic!("cargo did not set {var}"));
        println!("cargo:rustc-env={name}={val}");
    }

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".into());
    let rustc_version = std::process::Command::new(rustc)
        .arg("--version")
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .unwrap_or_else(|_| "unknown".into());
    println!("cargo:rustc-env=BUILD_RUSTC_VERSION={rustc_version}");
}

/// Returns `Some` if `name` begins with "CARGO_FEATURE_" and `val` is "1".
fn feature_name(name: String, val: String) -> Option<String> {
    let feature = name.strip_prefix("CARGO_FEATURE_")?;
    if val != "1" {
        return None;
    }
    Some(feature.to_string())
}
