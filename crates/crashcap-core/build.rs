//! Build script for crashcap-core
//!
//! This script checks system requirements before compilation:
//! - Minimum Rust version (C string literals need 1.77.0+)
//! - Target support (capture backends exist for Linux and macOS on x86_64 and aarch64)
//!
//! Unsupported targets still compile; `handler::install` and `Writer::create`
//! report `UnsupportedPlatform` at runtime.

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 77, 0);

        if rustc_version < min_rust_version {
            panic!(
                "crashcap-core requires Rust {} or newer, found {}",
                min_rust_version, rustc_version
            );
        }
    } else {
        // If we can't get version (e.g., in some build environments), just warn
        println!("cargo:warning=could not verify Rust version");
    }

    check_target_support();
}

fn check_target_support()
{
    // The build script runs on the host, so read the target from cargo's environment
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();

    let os_supported = matches!(os.as_str(), "linux" | "android" | "macos");
    let arch_supported = matches!(arch.as_str(), "x86_64" | "aarch64");

    // Named in `UnsupportedPlatform` errors
    println!("cargo:rustc-env=CRASHCAP_TARGET_DESCRIPTION={arch}-{os}");

    if !(os_supported && arch_supported) {
        println!(
            "cargo:warning=crashcap-core has no capture backend for {arch}-{os}; \
             installing handlers will fail with UnsupportedPlatform"
        );
    }
}
