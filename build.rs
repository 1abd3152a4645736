// SPDX-License-Identifier: GPL-3.0-only

use std::process::Command;

fn main() {
    // Re-run build script if git HEAD changes
    println!("cargo::rerun-if-changed=.git/HEAD");
    println!("cargo::rerun-if-changed=.git/refs/tags");
    println!("cargo::rerun-if-env-changed=SCANFLOW_VERSION");

    // Packagers may pin the version explicitly
    let version = std::env::var("SCANFLOW_VERSION").unwrap_or_else(|_| git_version());

    println!("cargo::rustc-env=GIT_VERSION={}", version);
}

/// Package version decorated with the commit it was built from
///
/// - "0.1.0-abcdef1" at a tagged commit
/// - "0.1.0-dirty-abcdef1" after it
/// - the bare package version outside a git checkout
fn git_version() -> String {
    let package = env!("CARGO_PKG_VERSION");
    let Some(hash) = git(&["rev-parse", "--short", "HEAD"]) else {
        return package.to_string();
    };

    match git(&["describe", "--tags", "--exact-match", "--match", "v*"]) {
        Some(tag) => format!("{}-{}", tag.strip_prefix('v').unwrap_or(&tag), hash),
        None => format!("{}-dirty-{}", package, hash),
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}
