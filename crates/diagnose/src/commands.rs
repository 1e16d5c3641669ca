use crate::monitor::Monitor;
use anyhow::Context;
use common::wait_for_resource;
use framebus::metadata::DEFAULT_MAX_OBJECTS;
use framebus::paths::DEFAULT_PROBE_NAMES;
use framebus::shape::DEFAULT_SHAPE;
use framebus::{
    BoundingBox, BusConfig, Frame, FrameRegistry, FrameShape, FrameStats, MetadataRegistry,
    RingBuffer, SharedMetadata, TrackedObject, placeholder_frame,
};
use image::{ImageFormat, RgbImage};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Frames older than this are flagged in `inspect` output.
const STALE_AFTER: Duration = Duration::from_secs(5);

pub struct MonitorOptions {
    pub duration_secs: u64,
    pub interval_ms: u64,
    pub wait_secs: Option<u64>,
}

pub struct PublishOptions {
    pub width: usize,
    pub height: usize,
    pub fps: u32,
    pub frames: Option<u64>,
    pub keep: bool,
}

fn default_names(names: &[String]) -> Vec<String> {
    if names.is_empty() {
        DEFAULT_PROBE_NAMES.iter().map(|n| n.to_string()).collect()
    } else {
        names.to_vec()
    }
}

fn describe_age(age: Option<Duration>) -> String {
    match age {
        Some(age) if age > STALE_AFTER => format!("{:.2}s ago STALE", age.as_secs_f64()),
        Some(age) => format!("{:.2}s ago", age.as_secs_f64()),
        None => "unknown".to_string(),
    }
}

pub fn inspect(config: BusConfig, names: &[String]) -> anyhow::Result<()> {
    let registry = FrameRegistry::new(config.clone());
    let metadata = MetadataRegistry::new(config);

    for name in default_names(names) {
        match registry.force_read_frame(&name) {
            Ok(Some(frame)) => {
                let stats = FrameStats::of(&frame);
                let info = registry.info(&name);
                let source = info
                    .as_ref()
                    .map(|i| {
                        if i.shape.is_fallback() {
                            "fallback shape".to_string()
                        } else {
                            format!("{:?}", i.shape.source)
                        }
                    })
                    .unwrap_or_default();
                println!(
                    "{name}: {} mean={:.2} variance={:.2} source={source} seq={} written={}",
                    FrameShape::of(&frame),
                    stats.mean,
                    stats.variance,
                    info.as_ref().map(|i| i.sequence).unwrap_or(0),
                    describe_age(registry.frame_age(&name)),
                );
            }
            Ok(None) => println!("{name}: NULL"),
            Err(e) => println!("{name}: ERROR {e}"),
        }

        match metadata.read_objects(&name) {
            Ok(Some(objects)) => {
                let trusted = objects.iter().filter(|o| o.is_trusted).count();
                println!("  metadata: {} objects ({trusted} trusted)", objects.len());
            }
            Ok(None) => println!("  metadata: none"),
            Err(e) => println!("  metadata: ERROR {e}"),
        }
    }

    Ok(())
}

/// First well-known buffer that currently yields a frame.
fn find_active(registry: &FrameRegistry) -> Option<String> {
    DEFAULT_PROBE_NAMES.iter().find_map(|name| {
        let active = matches!(registry.force_read_frame(name), Ok(Some(_)));
        println!("{name}: {}", if active { "active" } else { "not active" });
        active.then(|| name.to_string())
    })
}

pub fn monitor(
    config: BusConfig,
    name: Option<String>,
    options: MonitorOptions,
    shutdown: &AtomicBool,
) -> anyhow::Result<()> {
    let registry = FrameRegistry::new(config);

    let name = match name {
        Some(name) => name,
        None => find_active(&registry).with_context(|| {
            format!(
                "No active ring buffer among {}; is the writer running?",
                DEFAULT_PROBE_NAMES.join(", ")
            )
        })?,
    };

    if let Some(wait_secs) = options.wait_secs {
        wait_for_resource(
            || match registry.force_read_frame(&name) {
                Ok(Some(_)) => Ok(()),
                Ok(None) => Err("no frame yet".to_string()),
                Err(e) => Err(e.to_string()),
            },
            Duration::from_millis(200),
            Some(Duration::from_secs(wait_secs)),
            &name,
        )?;
    }

    println!("Monitoring {name} for {}s", options.duration_secs);
    let duration = Duration::from_secs(options.duration_secs);
    let interval = Duration::from_millis(options.interval_ms.max(1));
    let mut monitor = Monitor::default();
    let started = Instant::now();

    while started.elapsed() < duration && !shutdown.load(Ordering::Relaxed) {
        let frame = registry.force_read_frame(&name).unwrap_or_else(|e| {
            tracing::warn!(name = %name, error = %e, "Read failed");
            None
        });
        let sample = monitor.observe(frame);
        let summary = monitor.summary(started.elapsed());
        println!(
            "[{:6.1}s] {sample:<20} | changes {:4} | null {:4} | same {:4} | fps {:5.1}",
            summary.elapsed.as_secs_f64(),
            summary.changes,
            summary.nulls,
            summary.repeats,
            summary.fps,
        );
        thread::sleep(interval);
    }

    let summary = monitor.summary(started.elapsed());
    println!();
    println!("Summary for {name}");
    println!("  elapsed:   {:.1}s", summary.elapsed.as_secs_f64());
    if let Some(shape) = monitor.last_shape() {
        println!("  shape:     {shape}");
    }
    println!("  changes:   {}", summary.changes);
    println!("  null:      {}", summary.nulls);
    println!("  same:      {}", summary.repeats);
    println!("  fps:       {:.1}", summary.fps);

    let issues = summary.issues();
    for issue in &issues {
        println!("  ISSUE: {issue}");
    }
    if !issues.is_empty() {
        anyhow::bail!("{name} looks unhealthy ({} issues)", issues.len());
    }

    println!("{name} looks healthy");
    Ok(())
}

pub fn snapshot(config: BusConfig, name: &str, output: &Path) -> anyhow::Result<()> {
    let _s = common::span!("snapshot");
    let registry = FrameRegistry::new(config);

    let frame = match registry.force_read_frame(name)? {
        Some(frame) => frame,
        None => {
            let shape = registry.info(name).map(|i| i.shape.shape).unwrap_or(DEFAULT_SHAPE);
            println!("{name}: NULL, saving placeholder");
            placeholder_frame(shape)
        }
    };

    let shape = FrameShape::of(&frame);
    if shape.channels != 3 {
        anyhow::bail!("Cannot encode {shape} frame as JPEG; expected 3 channels");
    }

    let pixels: Vec<u8> = frame.iter().copied().collect();
    let image = RgbImage::from_raw(shape.width as u32, shape.height as u32, pixels)
        .context("Frame buffer does not match its shape")?;
    image
        .save_with_format(output, ImageFormat::Jpeg)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Saved {shape} frame from {name} to {}", output.display());
    Ok(())
}

/// Diagonal gradient that shifts every frame, so successive frames always differ.
fn synthetic_frame(shape: FrameShape, index: u64) -> Frame {
    let offset = (index as usize).wrapping_mul(16);
    Frame::from_shape_fn(shape.dim(), |(y, x, c)| {
        (x.wrapping_add(y).wrapping_add(offset).wrapping_add(c * 85) % 256) as u8
    })
}

fn synthetic_objects(index: u64, shape: FrameShape) -> Vec<TrackedObject> {
    let last_seen = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    let span = shape.width.saturating_sub(100).max(1) as u64;

    (0..2u64)
        .map(|id| {
            let x1 = ((index * 8 + id * 200) % span) as f32;
            TrackedObject {
                id,
                bbox: BoundingBox::new(x1, 40.0, x1 + 80.0, 240.0),
                confidence: 0.8,
                class_name: "person".to_string(),
                is_trusted: id == 0,
                face_name: (id == 0).then(|| "resident".to_string()),
                camera_label: "synthetic".to_string(),
                last_seen,
            }
        })
        .collect()
}

pub fn publish(
    config: BusConfig,
    name: &str,
    options: PublishOptions,
    shutdown: &AtomicBool,
) -> anyhow::Result<()> {
    let _s = common::span!("publish");
    let frames = FrameRegistry::new(config.clone());
    let metadata = MetadataRegistry::new(config);

    let requested = FrameShape::rgb(options.height, options.width);
    let allocated = frames
        .create_ring_buffer(name, requested)
        .with_context(|| format!("Failed to create ring buffer {name}"))?;
    metadata
        .create_metadata(name, DEFAULT_MAX_OBJECTS)
        .with_context(|| format!("Failed to create metadata for {name}"))?;
    println!("Publishing {requested} frames to {name} (buffer {allocated}) at {} fps", options.fps);

    let interval = Duration::from_secs_f64(1.0 / options.fps.max(1) as f64);
    let mut written = 0u64;

    while !shutdown.load(Ordering::Relaxed) && options.frames.is_none_or(|limit| written < limit) {
        let tick = Instant::now();

        frames.write_frame(name, &synthetic_frame(requested, written))?;
        if let Err(e) = metadata.write_objects(name, &synthetic_objects(written, allocated)) {
            tracing::warn!(name, error = %e, "Failed to publish metadata");
        }
        written += 1;

        if let Some(remaining) = interval.checked_sub(tick.elapsed()) {
            thread::sleep(remaining);
        }
    }

    tracing::info!(name, frames = written, "Publisher stopped");
    println!("Published {written} frames");

    if options.keep {
        frames.close_all();
        metadata.close_all();
    } else {
        let report = frames.cleanup_all();
        metadata.cleanup_all();
        println!("Cleaned up {} buffers ({} errors)", report.cleaned, report.errors);
    }
    Ok(())
}

pub fn cleanup(config: BusConfig, names: &[String]) -> anyhow::Result<()> {
    let mut errors = 0usize;

    for name in names {
        match RingBuffer::unlink_by_name(&config, name) {
            Ok(true) => println!("{name}: ring buffer removed"),
            Ok(false) => println!("{name}: no ring buffer"),
            Err(e) => {
                errors += 1;
                println!("{name}: ERROR removing ring buffer: {e}");
            }
        }
        match SharedMetadata::unlink_by_name(&config, name) {
            Ok(true) => println!("{name}: metadata removed"),
            Ok(false) => println!("{name}: no metadata"),
            Err(e) => {
                errors += 1;
                println!("{name}: ERROR removing metadata: {e}");
            }
        }
    }

    if errors > 0 {
        anyhow::bail!("Cleanup finished with {errors} errors");
    }
    Ok(())
}
