// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline-wide constants

use std::time::Duration;

/// Shell used to run helper command lines
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Bytes requested from the acquisition source per pull
pub const DEFAULT_SOURCE_CHUNK: usize = 64 * 1024;

/// Read buffer size used when the pipe capacity cannot be queried
///
/// This is POSIX `PIPE_BUF` on Linux and the smallest capacity any supported
/// kernel hands out.
pub const FALLBACK_PIPE_CAPACITY: usize = 4096;

/// Upper bound on the helper read buffer, whatever the pipe reports
pub const MAX_HELPER_READ_BUFFER: usize = 1024 * 1024;

/// Longest a helper stage sleeps between unproductive pump steps
pub const DEFAULT_HELPER_WAIT: Duration = Duration::from_millis(50);

/// Queued bytes above which the bridge starts warning about a slow reader
pub const DEFAULT_CACHE_HIGH_WATER: usize = 256 * 1024 * 1024;

/// Content types announced by sources and stages
pub mod content_type {
    /// Uncompressed scan lines, `depth * components` bits per pixel
    pub const RASTER: &str = "image/x-raster";
    /// Portable anymap
    pub const PNM: &str = "image/x-portable-anymap";
    /// Anything a helper emits that the pipeline does not interpret
    pub const OCTET_STREAM: &str = "application/octet-stream";
}

/// Name of the application, used for the config directory and thread names
pub const APP_NAME: &str = "scanflow";

/// Map a bit depth and component count to a human readable pixel layout
pub fn pixel_layout_label(depth: u8, components: u8) -> Option<&'static str> {
    match (depth, components) {
        (1, 1) => Some("lineart"),
        (8, 1) => Some("gray8"),
        (16, 1) => Some("gray16"),
        (8, 3) => Some("rgb24"),
        (16, 3) => Some("rgb48"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_layout_labels() {
        assert_eq!(pixel_layout_label(8, 1), Some("gray8"));
        assert_eq!(pixel_layout_label(8, 3), Some("rgb24"));
        assert_eq!(pixel_layout_label(1, 1), Some("lineart"));
        assert_eq!(pixel_layout_label(12, 2), None);
    }

    #[test]
    fn test_fallback_capacity_fits_limit() {
        assert!(FALLBACK_PIPE_CAPACITY <= MAX_HELPER_READ_BUFFER);
    }
}
