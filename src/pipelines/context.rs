// SPDX-License-Identifier: GPL-3.0-only

//! Image context: geometry, sample layout and byte accounting
//!
//! A context is created at begin-of-sequence, refined at begin-of-image and
//! finalized at end-of-image. Dimensions stay fixed while the image's bytes
//! flow; only the octet counter moves.

use crate::constants::content_type;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Line order of the image data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Orientation {
    /// First line is the top of the page
    #[default]
    TopToBottom,
    /// First line is the bottom of the page
    BottomToTop,
}

/// Metadata describing the current image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Pixels per line, `None` when unknown
    pub width: Option<u32>,
    /// Lines per image, `None` when unknown (e.g. sheet-fed until the end)
    pub height: Option<u32>,
    /// Bits per sample
    pub depth: u8,
    /// Samples per pixel
    pub components: u8,
    /// Trailing octets at the end of every scan line
    pub padding_octets: u32,
    /// Trailing lines at the end of the image
    pub padding_lines: u32,
    /// Horizontal resolution in dpi
    pub x_resolution: u32,
    /// Vertical resolution in dpi
    pub y_resolution: u32,
    /// MIME type of the payload
    pub content_type: String,
    /// Line order
    pub orientation: Orientation,
    /// Octets seen so far for this image
    octets_seen: u64,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            depth: 8,
            components: 1,
            padding_octets: 0,
            padding_lines: 0,
            x_resolution: 0,
            y_resolution: 0,
            content_type: content_type::RASTER.to_string(),
            orientation: Orientation::default(),
            octets_seen: 0,
        }
    }
}

impl Context {
    /// Raster image context of known size
    pub fn raster(width: u32, height: u32, depth: u8, components: u8) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            depth,
            components,
            ..Self::default()
        }
    }

    /// Set resolution in dpi
    pub fn with_resolution(mut self, x: u32, y: u32) -> Self {
        self.x_resolution = x;
        self.y_resolution = y;
        self
    }

    /// Set the line order
    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    /// Set per-line and trailing-line padding
    pub fn with_padding(mut self, octets: u32, lines: u32) -> Self {
        self.padding_octets = octets;
        self.padding_lines = lines;
        self
    }

    /// Set the payload MIME type
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    /// Whether the payload is plain scan lines this crate can reason about
    pub fn is_raster(&self) -> bool {
        self.content_type == content_type::RASTER
    }

    /// Bits used by one pixel
    pub fn bits_per_pixel(&self) -> u32 {
        u32::from(self.depth) * u32::from(self.components)
    }

    /// Octets of pixel data per line, without padding
    pub fn scan_width(&self) -> Option<usize> {
        let width = u64::from(self.width?);
        let bits = width * u64::from(self.bits_per_pixel());
        usize::try_from(bits.div_ceil(8)).ok()
    }

    /// Octets per line including padding
    pub fn octets_per_line(&self) -> Option<usize> {
        self.scan_width().map(|scan| scan + self.padding_octets as usize)
    }

    /// Lines per image including padding lines
    pub fn lines_per_image(&self) -> Option<u64> {
        self.height.map(|h| u64::from(h) + u64::from(self.padding_lines))
    }

    /// Declared size of the image in octets, when known
    pub fn octets_per_image(&self) -> Option<u64> {
        let line = self.octets_per_line()? as u64;
        Some(line * self.lines_per_image()?)
    }

    /// Octets counted so far
    pub fn octets_seen(&self) -> u64 {
        self.octets_seen
    }

    /// Complete lines counted so far
    pub fn lines_seen(&self) -> Option<u64> {
        match self.octets_per_line()? {
            0 => None,
            line => Some(self.octets_seen / line as u64),
        }
    }

    /// Count octets that went by
    pub fn add_octets(&mut self, count: usize) {
        self.octets_seen = self.octets_seen.saturating_add(count as u64);
    }

    /// Start counting from zero for a new image
    pub fn reset_counters(&mut self) {
        self.octets_seen = 0;
    }

    /// Reconcile the declared size with the octets actually seen
    ///
    /// Returns `true` when they agreed. On a mismatch the height is corrected
    /// to what was delivered (or cleared if the data is not line aligned) and
    /// the discrepancy is logged. An unknown height is filled in silently.
    pub fn reconcile(&mut self) -> bool {
        if !self.is_raster() {
            return true;
        }

        let seen = self.octets_seen;
        let line = self.octets_per_line().filter(|&l| l > 0).map(|l| l as u64);
        let corrected_height = line
            .filter(|l| seen % l == 0)
            .map(|l| (seen / l).saturating_sub(u64::from(self.padding_lines)))
            .and_then(|h| u32::try_from(h).ok());

        match self.octets_per_image() {
            Some(expected) if expected == seen => true,
            Some(expected) => {
                warn!(
                    expected,
                    seen,
                    width = ?self.width,
                    height = ?self.height,
                    corrected_height = ?corrected_height,
                    "Image size mismatch at end-of-image, correcting context"
                );
                self.height = corrected_height;
                false
            }
            None => {
                if self.height.is_none() && corrected_height.is_some() {
                    debug!(seen, height = ?corrected_height, "Resolved unknown image height");
                    self.height = corrected_height;
                }
                true
            }
        }
    }
}
