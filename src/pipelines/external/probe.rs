// SPDX-License-Identifier: GPL-3.0-only

//! Helper program availability

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::debug;

/// Cached availability per program (checked once per process)
static AVAILABILITY: OnceLock<Mutex<HashMap<String, bool>>> = OnceLock::new();

/// Whether `program` can be run as a helper
///
/// Only the first word of `program` is looked at; the rest is taken as
/// arguments. Names without a slash are searched on `PATH`. The answer is
/// remembered for the lifetime of the process.
pub fn helper_available(program: &str) -> bool {
    let cache = AVAILABILITY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut known = cache.lock().unwrap_or_else(|e| e.into_inner());

    if let Some(&available) = known.get(program) {
        return available;
    }

    let available = locate(program).is_some();
    debug!(program, available, "Probed helper program");
    known.insert(program.to_string(), available);
    available
}

/// Resolve the executable behind `program`
fn locate(program: &str) -> Option<PathBuf> {
    let name = program.split_whitespace().next()?;

    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
