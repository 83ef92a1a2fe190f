//! Build script stamping the `bh` version string.
//!
//! Compile-time environment:
//! - `BH_BUILD_TIMESTAMP`: UTC time of the build
//! - `BH_GIT_COMMIT`: short commit hash, or "unknown" outside a git checkout
//! - `BH_VERSION`: `<crate version> (<commit> <timestamp>)`, shown by `bh --version`

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let commit = short_commit().unwrap_or_else(|| "unknown".to_string());
    let version = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();

    println!("cargo:rustc-env=BH_BUILD_TIMESTAMP={}", timestamp);
    println!("cargo:rustc-env=BH_GIT_COMMIT={}", commit);
    println!("cargo:rustc-env=BH_VERSION={} ({} {})", version, commit, timestamp);
}

fn short_commit() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let commit = String::from_utf8(output.stdout).ok()?;
    Some(commit.trim().to_string()).filter(|c| !c.is_empty())
}
