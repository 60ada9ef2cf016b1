//! Build script for syncdeck
//!
//! Exposes git and toolchain details to `version.rs` as `SYNCDECK_*` env vars.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let dirty = match run("git", &["status", "--porcelain"]) {
        Some(out) if !out.is_empty() => "true",
        Some(_) => "false",
        None => "unknown",
    };

    let vars = [
        ("GIT_HASH", run("git", &["rev-parse", "--short=8", "HEAD"])),
        ("GIT_BRANCH", run("git", &["rev-parse", "--abbrev-ref", "HEAD"])),
        ("GIT_DIRTY", Some(dirty.to_string())),
        (
            "BUILD_TIMESTAMP",
            Some(chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()),
        ),
        ("TARGET", env::var("TARGET").ok()),
        ("PROFILE", env::var("PROFILE").ok()),
        ("RUSTC_VERSION", run("rustc", &["--version"])),
    ];

    for (name, value) in vars {
        let value = value.filter(|v| !v.is_empty()).unwrap_or_else(|| "unknown".to_string());
        println!("cargo:rustc-env=SYNCDECK_{}={}", name, value);
    }
}

/// Trimmed stdout of a successful command
fn run(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok().map(|s| s.trim().to_string())
}
