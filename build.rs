//! Build script for the node executor
//!
//! Embeds build-time information reported by `node-executor version`:
//! - Git commit hash
//! - Target triple and profile
//! - Rust compiler version

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=build.rs");

    let git_hash = command_output("git", &["rev-parse", "--short=8", "HEAD"]);
    let rustc_version = command_output("rustc", &["--version"]);
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=NODE_EXECUTOR_GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=NODE_EXECUTOR_TARGET={}", target);
    println!("cargo:rustc-env=NODE_EXECUTOR_PROFILE={}", profile);
    println!("cargo:rustc-env=NODE_EXECUTOR_RUSTC_VERSION={}", rustc_version);
}

/// Run a command and return its trimmed stdout, or "unknown"
fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
