// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! This module provides command-line functionality for:
//! - Running a raw image through a session
//! - Probing helper programs
//! - Showing the effective configuration

use scanflow::backends::{MapOptions, OptionValue, RawFileDevice};
use scanflow::constants::pixel_layout_label;
use scanflow::pipelines::{Orientation, helper_available};
use scanflow::{Context, PipelineConfig, PipelineError, ReadStatus, Session};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Geometry of a raw image file given on the command line
pub struct RawImage {
    pub input: PathBuf,
    pub width: u32,
    pub height: Option<u32>,
    pub depth: u8,
    pub components: u8,
    pub padding_octets: u32,
    pub resolution: Option<u32>,
    pub bottom_up: bool,
}

impl RawImage {
    fn context(&self) -> Context {
        let mut ctx = Context::raster(
            self.width,
            self.height.unwrap_or_default(),
            self.depth,
            self.components,
        )
        .with_padding(self.padding_octets, 0)
        .with_orientation(if self.bottom_up {
            Orientation::BottomToTop
        } else {
            Orientation::TopToBottom
        });
        if let Some(dpi) = self.resolution {
            ctx = ctx.with_resolution(dpi, dpi);
        }
        ctx.height = self.height;
        ctx
    }
}

/// Run one raw image through padding removal and an optional helper
pub fn run_raw(
    config: PipelineConfig,
    image: RawImage,
    helper: Option<String>,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut options = MapOptions::new();
    if let Some(helper) = helper {
        options.set("helper", OptionValue::Text(helper));
    }

    let ctx = image.context();
    eprintln!(
        "Input: {} ({}x{}, {})",
        image.input.display(),
        image.width,
        image
            .height
            .map(|h| h.to_string())
            .unwrap_or_else(|| "?".to_string()),
        pixel_layout_label(image.depth, image.components).unwrap_or("custom layout"),
    );

    let device = RawFileDevice::new(&image.input, ctx, options);
    let mut session = Session::new(device, config);

    let mut sink: Box<dyn Write> = match &output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    // Set up Ctrl+C handler: the first press cancels, a second one exits
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_clone = interrupted.clone();
    let cancel = session.cancel_handle();
    ctrlc::set_handler(move || {
        if interrupted_clone.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        cancel.cancel();
    })?;

    let started = Instant::now();
    let mut images = 0usize;
    let mut total = 0usize;
    let mut buf = vec![0u8; 64 * 1024];

    'images: while !interrupted.load(Ordering::SeqCst) {
        match session.start() {
            Ok(()) => {}
            Err(PipelineError::NoMoreImages | PipelineError::Cancelled) => break,
            Err(e) => return Err(e.into()),
        }

        loop {
            match session.read(&mut buf) {
                Ok(ReadStatus::Data(n)) => {
                    sink.write_all(&buf[..n])?;
                    total += n;
                }
                Ok(ReadStatus::EndOfImage) => break,
                Err(PipelineError::Cancelled) => {
                    eprintln!("Cancelled");
                    break 'images;
                }
                Err(e) => return Err(e.into()),
            }
        }
        images += 1;

        let done = session.get_context();
        eprintln!(
            "Image {}: {} bytes, {}x{}, {} dpi, {:?}",
            images,
            done.octets_seen(),
            done.width.map(|w| w.to_string()).unwrap_or_default(),
            done.height.map(|h| h.to_string()).unwrap_or_default(),
            done.y_resolution,
            done.orientation,
        );
    }

    sink.flush()?;
    eprintln!(
        "Wrote {} bytes in {} image(s) ({:.1?})",
        total,
        images,
        started.elapsed()
    );
    if let Some(path) = output {
        eprintln!("Output: {}", path.display());
    }
    Ok(())
}

/// Report whether `program` can be used as a helper
pub fn probe(program: &str) -> Result<(), Box<dyn std::error::Error>> {
    if helper_available(program) {
        println!("{program}: available");
        Ok(())
    } else {
        Err(format!("{program}: not available").into())
    }
}

/// Print the effective configuration as JSON
pub fn print_config(config: &PipelineConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", config.to_json()?);
    if let Some(path) = PipelineConfig::default_path() {
        eprintln!("Config file: {}", path.display());
    }
    Ok(())
}
