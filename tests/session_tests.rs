// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the polling session

use scanflow::backends::{MapOptions, OptionValue, Pulled, ScriptedDevice, ScriptedSource, Source};
use scanflow::backends::{Device, OptionSource};
use scanflow::pipelines::{ExternalProcess, Event, Stage};
use scanflow::session::StageFactory;
use scanflow::{
    Context, Marker, PipelineConfig, PipelineError, PipelineResult, ReadStatus, Session,
    SessionState,
};
use std::thread;
use std::time::{Duration, Instant};

fn gray(width: u32, height: u32) -> Context {
    Context::raster(width, height, 8, 1)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

fn read_image<D: Device>(session: &mut Session<D>, buf_len: usize) -> PipelineResult<Vec<u8>> {
    let mut image = Vec::new();
    let mut buf = vec![0u8; buf_len];
    loop {
        match session.read(&mut buf)? {
            ReadStatus::Data(n) => image.extend_from_slice(&buf[..n]),
            ReadStatus::EndOfImage => return Ok(image),
        }
    }
}

fn helper_stages(program: &'static str) -> StageFactory {
    Box::new(move |_: &dyn OptionSource, config: &PipelineConfig| {
        let stages: Vec<Box<dyn Stage>> =
            vec![Box::new(ExternalProcess::new(program).configured(config))];
        Ok(stages)
    })
}

/// Source producing one endless image
struct Endless {
    phase: u8,
}

impl Source for Endless {
    fn read(&mut self, buf: &mut [u8]) -> PipelineResult<Pulled> {
        let ctx = gray(16, 16);
        match self.phase {
            0 => {
                self.phase = 1;
                Ok(Pulled::Marker(Marker::BeginSequence, ctx))
            }
            1 => {
                self.phase = 2;
                Ok(Pulled::Marker(Marker::BeginImage, ctx))
            }
            _ => {
                thread::sleep(Duration::from_millis(2));
                let n = buf.len().min(16);
                buf[..n].fill(0x55);
                Ok(Pulled::Bytes(n))
            }
        }
    }
}

/// Source that opens an image and then never delivers a byte
struct Stalled {
    phase: u8,
}

impl Source for Stalled {
    fn read(&mut self, _buf: &mut [u8]) -> PipelineResult<Pulled> {
        let ctx = gray(16, 16);
        match self.phase {
            0 => {
                self.phase = 1;
                Ok(Pulled::Marker(Marker::BeginSequence, ctx))
            }
            1 => {
                self.phase = 2;
                Ok(Pulled::Marker(Marker::BeginImage, ctx))
            }
            _ => {
                thread::sleep(Duration::from_millis(5));
                Ok(Pulled::Bytes(0))
            }
        }
    }
}

struct EndlessDevice {
    options: MapOptions,
    stalled: bool,
}

impl Device for EndlessDevice {
    fn open(&mut self) -> PipelineResult<Box<dyn Source>> {
        if self.stalled {
            Ok(Box::new(Stalled { phase: 0 }))
        } else {
            Ok(Box::new(Endless { phase: 0 }))
        }
    }

    fn options(&self) -> &dyn OptionSource {
        &self.options
    }
}

#[test]
fn test_multi_image_sequence_reuses_worker() {
    let ctx = gray(10, 3);
    let images: Vec<Vec<u8>> = (0..3).map(|i| pattern(30, i)).collect();
    let device = ScriptedDevice::new(
        [ScriptedSource::images(&ctx, &images, 4)],
        MapOptions::new(),
    );
    let mut session = Session::new(device, PipelineConfig::default());

    for expected in &images {
        session.start().unwrap();
        assert!(session.has_worker());
        assert_eq!(&read_image(&mut session, 8).unwrap(), expected);
        assert_eq!(session.get_context().height, Some(3));
    }

    assert!(matches!(session.start(), Err(PipelineError::NoMoreImages)));
    assert!(!session.has_worker());
    assert_eq!(session.device().remaining(), 0);
}

#[test]
fn test_unread_tail_is_drained_by_start() {
    let ctx = gray(50, 20);
    let first = pattern(1000, 1);
    let second = pattern(1000, 2);
    let device = ScriptedDevice::new(
        [ScriptedSource::images(&ctx, &[first, second.clone()], 100)],
        MapOptions::new(),
    );
    let mut session = Session::new(device, PipelineConfig::default());

    session.start().unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(session.read(&mut buf).unwrap(), ReadStatus::Data(10));

    session.start().unwrap();
    assert_eq!(read_image(&mut session, 64).unwrap(), second);
}

#[test]
fn test_state_reaches_done_before_end_is_read() {
    let ctx = gray(4, 1);
    let device = ScriptedDevice::new(
        [ScriptedSource::images(&ctx, &[vec![1, 2, 3, 4]], 4)],
        MapOptions::new(),
    );
    let mut session = Session::new(device, PipelineConfig::default());
    session.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while session.state() != SessionState::Done {
        assert!(Instant::now() < deadline, "image end never produced");
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(read_image(&mut session, 16).unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(session.state(), SessionState::NotScanning);
}

#[test]
fn test_source_failure_surfaces_after_buffered_bytes() {
    let ctx = gray(8, 8);
    let script = ScriptedSource::new([
        Event::Control(Marker::BeginSequence, ctx.clone()),
        Event::Control(Marker::BeginImage, ctx.clone()),
        Event::Payload(vec![9; 12]),
    ])
    .fail_with("cover open");
    let device = ScriptedDevice::new([script], MapOptions::new());
    let mut session = Session::new(device, PipelineConfig::default());
    session.start().unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 5];
    let err = loop {
        match session.read(&mut buf) {
            Ok(ReadStatus::Data(n)) => received.extend_from_slice(&buf[..n]),
            Ok(ReadStatus::EndOfImage) => panic!("image should not complete"),
            Err(e) => break e,
        }
    };

    assert_eq!(received, vec![9; 12]);
    assert!(matches!(err, PipelineError::Source(ref m) if m == "cover open"));
    assert_eq!(session.state(), SessionState::NotScanning);
    assert!(!session.has_worker());
    assert!(matches!(
        session.read(&mut buf),
        Err(PipelineError::NotScanning)
    ));
}

#[test]
fn test_helper_failure_surfaces_through_read() {
    let ctx = gray(100, 10);
    let device = ScriptedDevice::new(
        [ScriptedSource::images(&ctx, &[pattern(1000, 3)], 250)],
        MapOptions::new(),
    );
    let mut session = Session::with_stages(
        device,
        PipelineConfig::default(),
        helper_stages("head -c 10; exit 3"),
    );
    session.start().unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 64];
    let err = loop {
        match session.read(&mut buf) {
            Ok(ReadStatus::Data(n)) => received.extend_from_slice(&buf[..n]),
            Ok(ReadStatus::EndOfImage) => panic!("image should not complete"),
            Err(e) => break e,
        }
    };

    assert!(received.len() <= 10);
    match err {
        PipelineError::HelperFailed { command, reason } => {
            assert_eq!(command, "head -c 10; exit 3");
            assert_eq!(reason, "exit status 3");
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(session.state(), SessionState::NotScanning);
}

#[test]
fn test_cancel_ends_image_and_is_idempotent() {
    let device = EndlessDevice {
        options: MapOptions::new(),
        stalled: false,
    };
    let mut session = Session::new(device, PipelineConfig::default());

    // Nothing open yet
    session.cancel();
    assert_eq!(session.state(), SessionState::NotScanning);

    session.start().unwrap();
    let mut buf = [0u8; 32];
    assert!(matches!(session.read(&mut buf), Ok(ReadStatus::Data(_))));

    session.cancel();
    session.cancel();
    let err = loop {
        match session.read(&mut buf) {
            Ok(ReadStatus::Data(_)) => {}
            Ok(ReadStatus::EndOfImage) => panic!("endless image completed"),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, PipelineError::Cancelled));
    assert_eq!(session.state(), SessionState::NotScanning);

    session.cancel();
    assert_eq!(session.state(), SessionState::NotScanning);
}

#[test]
fn test_cancel_handle_reaches_blocked_read() {
    let device = EndlessDevice {
        options: MapOptions::new(),
        stalled: true,
    };
    let mut session = Session::new(device, PipelineConfig::default());
    session.start().unwrap();

    let handle = session.cancel_handle();
    assert!(!handle.is_cancelled());
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.cancel();
    });

    // Nothing is ever produced, so this waits until the cancel lands
    let mut buf = [0u8; 16];
    assert!(matches!(
        session.read(&mut buf),
        Err(PipelineError::Cancelled)
    ));
    canceller.join().unwrap();
    assert_eq!(session.state(), SessionState::NotScanning);
    assert!(!session.has_worker());
}

#[test]
fn test_cancel_does_not_carry_into_next_sequence() {
    let ctx = gray(2, 1);
    let device = ScriptedDevice::new(
        [
            ScriptedSource::images(&ctx, &[vec![1, 2]], 2),
            ScriptedSource::images(&ctx, &[vec![3, 4]], 2),
        ],
        MapOptions::new(),
    );
    let mut session = Session::new(device, PipelineConfig::default());
    let handle = session.cancel_handle();

    assert_eq!(session_image(&mut session), vec![1, 2]);
    assert!(matches!(session.start(), Err(PipelineError::NoMoreImages)));

    // Raised while no worker runs
    handle.cancel();
    assert_eq!(session_image(&mut session), vec![3, 4]);
    assert!(!handle.is_cancelled());
}

fn session_image<D: Device>(session: &mut Session<D>) -> Vec<u8> {
    session.start().unwrap();
    read_image(session, 8).unwrap()
}

#[test]
fn test_padding_and_helper_on_square_image() {
    let ctx = gray(100, 100);
    let data = pattern(10_000, 5);
    let device = ScriptedDevice::new(
        [ScriptedSource::images(&ctx, &[data.clone()], 10_000)],
        MapOptions::new().with("helper", OptionValue::Text("cat".to_string())),
    );
    let mut session = Session::new(device, PipelineConfig::default());

    session.start().unwrap();
    let image = read_image(&mut session, 4096).unwrap();
    assert_eq!(image.len(), 10_000);
    assert_eq!(image, data);

    let done = session.get_context();
    assert_eq!(done.width, Some(100));
    assert_eq!(done.height, Some(100));
    assert_eq!(done.depth, 8);
    assert_eq!(done.octets_seen(), 10_000);
}
