// Pipeline tests: still images, snapshot sources and (on unix) video through a stand-in decoder.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, GenericImageView, GrayImage, Rgb, RgbImage};

use super::encode::resize_and_encode;
use super::fetch::{FileSnapshotSource, SnapshotSource};
use super::pipeline::{IngestOptions, MediaInput, MediaPipeline};
use super::similarity;
use crate::config::Settings;
use crate::error::{FramewiseError, Result};
use crate::timeline::gc::SnapshotRegistry;

fn settings(root: &Path) -> Settings {
    let mut settings = Settings::with_data_dir(root);
    settings.worker_threads = 2;
    settings
}

fn pattern(width: u32, height: u32, seed: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        let v = ((x / (seed + 2)) + (y / (seed + 3)) * seed) % 2;
        if v == 0 {
            Rgb([20, 30, 40])
        } else {
            Rgb([220, 210, 200])
        }
    }))
}

fn write_png(dir: &Path, name: &str, image: &DynamicImage) -> PathBuf {
    let path = dir.join(name);
    image.save(&path).unwrap();
    path
}

fn gray(payload: &[u8]) -> GrayImage {
    image::load_from_memory(payload).unwrap().to_luma8()
}

fn mean_luma(payload: &[u8]) -> f64 {
    let image = gray(payload);
    let total: u64 = image.pixels().map(|p| p.0[0] as u64).sum();
    total as f64 / (image.width() * image.height()) as f64
}

/// A live camera whose scene gets brighter on every fetch.
struct BrighteningCamera {
    name: String,
    calls: AtomicUsize,
}

impl BrighteningCamera {
    fn new(name: &str) -> Arc<dyn SnapshotSource> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
        })
    }
}

impl SnapshotSource for BrighteningCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self) -> Result<Vec<u8>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
        let shade = (20 + call * 45).min(230) as u8;
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(64, 48, |x, y| {
            let v = shade.saturating_add((((x / 4) + (y / 4)) % 2) as u8 * 20);
            Rgb([v, v, v])
        }));
        resize_and_encode(&image, 1280)
    }
}

#[test]
fn test_image_files_keep_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_png(dir.path(), "driveway.png", &pattern(2000, 1000, 1));
    let b = write_png(dir.path(), "porch.png", &pattern(300, 200, 2));

    let pipeline = MediaPipeline::new(&settings(dir.path())).unwrap();
    let options = IngestOptions {
        include_filename: true,
        ..IngestOptions::default()
    };
    let output = pipeline
        .process(&[MediaInput::ImageFile(a), MediaInput::ImageFile(b)], &options)
        .unwrap();

    let labels: Vec<&str> = output.frames.iter().map(|f| f.label.as_str()).collect();
    assert_eq!(labels, vec!["driveway", "porch"]);

    let first = image::load_from_memory(&output.frames[0].payload).unwrap();
    assert_eq!(first.dimensions(), (1280, 640));
    let second = image::load_from_memory(&output.frames[1].payload).unwrap();
    assert_eq!(second.dimensions(), (300, 200));
    assert!(output.key_frame.is_none());
}

#[test]
fn test_labels_hidden_without_include_filename() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_png(dir.path(), "driveway.png", &pattern(64, 64, 1));

    let pipeline = MediaPipeline::new(&settings(dir.path())).unwrap();
    let output = pipeline
        .process(&[MediaInput::ImageFile(a)], &IngestOptions::default())
        .unwrap();
    assert_eq!(output.frames[0].label, "");
}

#[test]
fn test_missing_input_names_the_input() {
    let dir = tempfile::tempdir().unwrap();
    let good = write_png(dir.path(), "good.png", &pattern(64, 64, 1));

    let pipeline = MediaPipeline::new(&settings(dir.path())).unwrap();
    let err = pipeline
        .process(
            &[
                MediaInput::ImageFile(good),
                MediaInput::ImageFile(dir.path().join("missing.png")),
            ],
            &IngestOptions::default(),
        )
        .unwrap_err();

    assert!(matches!(err.root(), FramewiseError::Input(_)));
    assert!(err.to_string().starts_with("missing.png: "));
}

#[test]
fn test_empty_request_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = MediaPipeline::new(&settings(dir.path())).unwrap();
    let err = pipeline.process(&[], &IngestOptions::default()).unwrap_err();
    assert!(matches!(err, FramewiseError::Input(_)));
}

#[test]
fn test_expose_snapshot_archives_first_frame() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = settings(dir.path());
    let still = write_png(dir.path(), "cam.png", &pattern(64, 48, 3));

    let source: Arc<dyn SnapshotSource> = Arc::new(FileSnapshotSource::new("garage", &still));
    let pipeline = MediaPipeline::new(&cfg).unwrap();
    let options = IngestOptions {
        include_filename: true,
        expose_snapshot: true,
        ..IngestOptions::default()
    };
    let output = pipeline.process(&[MediaInput::Snapshot(source)], &options).unwrap();

    assert_eq!(output.frames[0].label, "garage");
    let key_frame = output.key_frame.clone().unwrap();
    assert!(key_frame.starts_with(cfg.snapshot_dir()));
    assert!(key_frame.to_string_lossy().ends_with("-0.jpg"));
    assert_eq!(std::fs::read(&key_frame).unwrap(), output.frames[0].payload);
    assert!(output.holds_key_frame());
}

#[test]
fn test_archived_key_frame_is_pending_until_output_drops() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = settings(dir.path());
    let still = write_png(dir.path(), "cam.png", &pattern(64, 48, 2));
    let registry = Arc::new(SnapshotRegistry::new());

    let pipeline = MediaPipeline::new(&cfg)
        .unwrap()
        .with_snapshots(Arc::clone(&registry));
    let options = IngestOptions {
        expose_snapshot: true,
        ..IngestOptions::default()
    };
    let output = pipeline.process(&[MediaInput::ImageFile(still)], &options).unwrap();

    let name = output
        .key_frame
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap();
    assert!(registry.is_pending(&name));

    drop(output);
    assert!(!registry.is_pending(&name));
}

#[test]
fn test_recording_merges_sources_chronologically() {
    for include_filename in [true, false] {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = MediaPipeline::new(&settings(dir.path())).unwrap();
        let options = IngestOptions {
            max_frames: 3,
            include_filename,
            ..IngestOptions::default()
        };
        let input = MediaInput::Recording {
            sources: vec![BrighteningCamera::new("garage"), BrighteningCamera::new("porch")],
            duration: Duration::from_millis(1500),
        };

        let output = pipeline.process(&[input], &options).unwrap();
        assert_eq!(output.frames.len(), 3);

        let mut last_luma: std::collections::HashMap<&str, f64> = Default::default();
        for (k, frame) in output.frames.iter().enumerate() {
            let ordinal = k + 1;
            if !include_filename {
                assert_eq!(frame.label, format!("Frame {}", ordinal));
                continue;
            }
            let source = ["garage", "porch"]
                .into_iter()
                .find(|s| frame.label == format!("{} (frame {})", s, ordinal))
                .unwrap_or_else(|| panic!("unexpected label {}", frame.label));

            // Each camera brightens over time, so its frames must come out brighter each time
            let luma = mean_luma(&frame.payload);
            if let Some(previous) = last_luma.insert(source, luma) {
                assert!(luma > previous, "{} frames out of order", source);
            }
        }
    }
}

#[test]
fn test_work_area_is_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = settings(dir.path());
    let still = write_png(dir.path(), "a.png", &pattern(32, 32, 1));

    let pipeline = MediaPipeline::new(&cfg).unwrap();
    pipeline
        .process(&[MediaInput::ImageFile(still)], &IngestOptions::default())
        .unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(cfg.work_dir()).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[cfg(unix)]
mod video {
    use super::*;
    use crate::media::decoder::{DecoderOptions, FrameDecoder};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    /// A decoder stand-in that prints a fixed MJPEG stream.
    fn fake_decoder(dir: &Path, stills: &[DynamicImage]) -> FrameDecoder {
        let stream_path = dir.join("stream.mjpeg");
        let mut stream = Vec::new();
        for still in stills {
            stream.extend(resize_and_encode(still, 1280).unwrap());
        }
        std::fs::write(&stream_path, stream).unwrap();

        let program = dir.join("fake-ffmpeg");
        std::fs::write(
            &program,
            format!("#!/bin/sh\ncat >/dev/null 2>&1 || true\ncat '{}'\n", stream_path.display()),
        )
        .unwrap();
        let mut perms = std::fs::metadata(&program).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&program, perms).unwrap();

        FrameDecoder::new(DecoderOptions {
            program,
            timeout: Duration::from_secs(30),
            max_frames: 100,
        })
    }

    fn executable(dir: &Path, body: &str) -> PathBuf {
        let program = dir.join("slow-ffmpeg");
        std::fs::write(&program, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&program).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&program, perms).unwrap();
        program
    }

    #[test]
    fn test_failing_input_cancels_running_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let frame = dir.path().join("frame.jpg");
        std::fs::write(&frame, resize_and_encode(&pattern(32, 32, 1), 1280).unwrap()).unwrap();
        let video = dir.path().join("porch.mp4");
        std::fs::write(&video, b"container").unwrap();

        // sleep runs as a child of the shell and keeps the pipes open
        let program = executable(dir.path(), &format!("sleep 6; cat '{}'", frame.display()));
        let pipeline = MediaPipeline::new(&settings(dir.path()))
            .unwrap()
            .with_decoder(FrameDecoder::new(DecoderOptions {
                program,
                timeout: Duration::from_secs(30),
                max_frames: 100,
            }));

        let started = Instant::now();
        let err = pipeline
            .process(
                &[
                    MediaInput::VideoFile(video),
                    MediaInput::ImageFile(dir.path().join("missing.png")),
                ],
                &IngestOptions::default(),
            )
            .unwrap_err();

        assert!(err.to_string().starts_with("missing.png: "), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_video_keeps_three_most_distinct_frames() {
        let dir = tempfile::tempdir().unwrap();
        let base = pattern(160, 120, 1);
        let stripes = pattern(160, 120, 5);
        let blocks = pattern(160, 120, 9);
        // Scene changes at frames 2 and 5; every other frame repeats its predecessor
        let stills = vec![
            base.clone(),
            base.clone(),
            stripes.clone(),
            stripes.clone(),
            stripes.clone(),
            blocks.clone(),
            blocks.clone(),
            blocks.clone(),
        ];

        let pipeline = MediaPipeline::new(&settings(dir.path()))
            .unwrap()
            .with_decoder(fake_decoder(dir.path(), &stills));

        let output = pipeline
            .process(
                &[MediaInput::VideoBytes {
                    name: "doorbell.mp4".to_string(),
                    bytes: b"not really a video".to_vec(),
                }],
                &IngestOptions::default(),
            )
            .unwrap();

        let labels: Vec<&str> = output.frames.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, vec!["Video frame 1", "Video frame 2", "Video frame 3"]);

        // Each kept frame shows the scene of stills 0, 2 and 5
        let scenes: Vec<GrayImage> = [&base, &stripes, &blocks]
            .iter()
            .map(|still| gray(&resize_and_encode(still, 1280).unwrap()))
            .collect();
        for (expected, frame) in output.frames.iter().enumerate() {
            let kept = gray(&frame.payload);
            let best = (0..scenes.len())
                .max_by(|&a, &b| {
                    similarity::score(&scenes[a], &kept).total_cmp(&similarity::score(&scenes[b], &kept))
                })
                .unwrap();
            assert_eq!(best, expected, "frame {} shows the wrong scene", expected + 1);
        }
    }

    #[test]
    fn test_video_labels_carry_source_name() {
        let dir = tempfile::tempdir().unwrap();
        let stills = vec![pattern(64, 48, 1), pattern(64, 48, 4)];
        let video = dir.path().join("garden.mp4");
        std::fs::write(&video, b"container").unwrap();

        let pipeline = MediaPipeline::new(&settings(dir.path()))
            .unwrap()
            .with_decoder(fake_decoder(dir.path(), &stills));
        let options = IngestOptions {
            include_filename: true,
            ..IngestOptions::default()
        };

        let output = pipeline.process(&[MediaInput::VideoFile(video)], &options).unwrap();
        let labels: Vec<&str> = output.frames.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, vec!["garden.mp4 (frame 1)", "garden.mp4 (frame 2)"]);
    }
}
