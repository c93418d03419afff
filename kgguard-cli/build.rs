//! Build script for kgguard-cli
//!
//! Stamps the long version string with git hash, build date, and rustc.

use std::process::Command;

fn capture(cmd: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(cmd).args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let s = String::from_utf8(out.stdout).ok()?;
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn main() {
    println!("cargo:rerun-if-changed=../.git/HEAD");

    let git_hash = capture("git", &["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".into());
    let build_date = capture("date", &["-u", "+%Y-%m-%d"]).unwrap_or_else(|| "unknown".into());
    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".into());
    let rustc_version = capture(&rustc, &["--version"]).unwrap_or_else(|| "unknown".into());

    println!("cargo:rustc-env=KGGUARD_GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=KGGUARD_BUILD_DATE={}", build_date);
    println!("cargo:rustc-env=KGGUARD_RUSTC={}", rustc_version);
}
