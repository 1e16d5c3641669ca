use crate::frame::FrameShape;
use crate::paths;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Frame size limits applied when a buffer is allocated and when frames are written.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePolicy {
    pub max_width: usize,
    pub max_height: usize,
    /// Floor applied after downscaling so extreme aspect ratios don't collapse.
    pub min_width: usize,
    pub min_height: usize,
    /// Relative aspect ratio difference below which frames are resized without letterboxing.
    pub aspect_tolerance: f64,
}

impl Default for FramePolicy {
    fn default() -> Self {
        Self {
            max_width: 1280,
            max_height: 720,
            min_width: 640,
            min_height: 480,
            aspect_tolerance: 0.05,
        }
    }
}

impl FramePolicy {
    /// Downscale `shape` to fit the maximum size, preserving aspect ratio.
    ///
    /// Shapes already within limits, and empty shapes, are returned unchanged.
    /// The floor never lifts a side above its maximum.
    pub fn cap_shape(&self, shape: FrameShape) -> FrameShape {
        let FrameShape {
            mut height,
            mut width,
            channels,
        } = shape;

        if shape.is_empty() || (width <= self.max_width && height <= self.max_height) {
            return shape;
        }

        let aspect = width as f64 / height as f64;
        if width > self.max_width {
            width = self.max_width;
            height = (width as f64 / aspect).round() as usize;
        }
        if height > self.max_height {
            height = self.max_height;
            width = (height as f64 * aspect).round() as usize;
        }

        FrameShape::new(
            height.max(self.min_height.min(self.max_height)),
            width.max(self.min_width.min(self.max_width)),
            channels,
        )
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Directory holding the shared memory segments.
    pub shm_dir: PathBuf,
    /// Prefix for named semaphores.
    pub namespace: String,
    /// How long `read()` waits for the "new frame" signal.
    pub read_timeout: Duration,
    /// Upper bound on acquiring a cross-process lock.
    pub lock_timeout: Duration,
    /// Byte budget per tracked object in a metadata region.
    pub metadata_record_bytes: usize,
    pub policy: FramePolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            shm_dir: PathBuf::from(paths::DEFAULT_SHM_DIR),
            namespace: paths::DEFAULT_NAMESPACE.to_string(),
            read_timeout: Duration::from_millis(100),
            lock_timeout: Duration::from_millis(1000),
            metadata_record_bytes: 256,
            policy: FramePolicy::default(),
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let shm_dir = env::var("FRAMEBUS_SHM_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.shm_dir);

        let namespace = env::var("FRAMEBUS_NAMESPACE").unwrap_or(defaults.namespace);

        let read_timeout = parse_var("FRAMEBUS_READ_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.read_timeout);

        let lock_timeout = parse_var("FRAMEBUS_LOCK_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.lock_timeout);

        let metadata_record_bytes =
            parse_var("FRAMEBUS_METADATA_RECORD_BYTES").unwrap_or(defaults.metadata_record_bytes);

        let policy = FramePolicy {
            max_width: parse_var("FRAMEBUS_MAX_WIDTH").unwrap_or(defaults.policy.max_width),
            max_height: parse_var("FRAMEBUS_MAX_HEIGHT").unwrap_or(defaults.policy.max_height),
            min_width: parse_var("FRAMEBUS_MIN_WIDTH").unwrap_or(defaults.policy.min_width),
            min_height: parse_var("FRAMEBUS_MIN_HEIGHT").unwrap_or(defaults.policy.min_height),
            aspect_tolerance: parse_var("FRAMEBUS_ASPECT_TOLERANCE")
                .unwrap_or(defaults.policy.aspect_tolerance),
        };

        Self {
            shm_dir,
            namespace,
            read_timeout,
            lock_timeout,
            metadata_record_bytes,
            policy,
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_cap_shape_keeps_small_frames() {
        let policy = FramePolicy::default();
        let shape = FrameShape::rgb(480, 640);
        assert_eq!(policy.cap_shape(shape), shape);
        assert_eq!(policy.cap_shape(FrameShape::rgb(720, 1280)), FrameShape::rgb(720, 1280));
    }

    #[test]
    fn test_cap_shape_full_hd_to_hd() {
        let policy = FramePolicy::default();
        assert_eq!(
            policy.cap_shape(FrameShape::rgb(1080, 1920)),
            FrameShape::rgb(720, 1280)
        );
    }

    #[test]
    fn test_cap_shape_tall_frame_limits_height() {
        let policy = FramePolicy::default();
        // 4:3 at 1440p: width fits after height is capped
        assert_eq!(
            policy.cap_shape(FrameShape::rgb(1440, 1920)),
            FrameShape::rgb(720, 960)
        );
    }

    #[test]
    fn test_cap_shape_applies_floor() {
        let policy = FramePolicy::default();
        // 4:1 panorama would become 1280x320; the floor lifts height to 480
        assert_eq!(
            policy.cap_shape(FrameShape::rgb(1000, 4000)),
            FrameShape::rgb(480, 1280)
        );
    }

    #[test]
    fn test_cap_shape_floor_never_exceeds_max() {
        let policy = FramePolicy {
            max_height: 360,
            min_height: 480,
            ..FramePolicy::default()
        };
        let capped = policy.cap_shape(FrameShape::rgb(1080, 1920));
        assert_eq!(capped, FrameShape::rgb(360, 640));
        assert!(capped.height <= policy.max_height);

        // Panorama where the floor kicks in on both axes
        let capped = policy.cap_shape(FrameShape::rgb(500, 4000));
        assert_eq!(capped, FrameShape::rgb(360, 1280));
    }

    #[test]
    fn test_cap_shape_leaves_empty_shapes_alone() {
        let policy = FramePolicy::default();
        let degenerate = FrameShape::rgb(0, 2000);
        assert_eq!(policy.cap_shape(degenerate), degenerate);
    }

    #[test]
    fn test_cap_shape_preserves_channels() {
        let policy = FramePolicy::default();
        assert_eq!(policy.cap_shape(FrameShape::new(1080, 1920, 4)).channels, 4);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides_defaults() {
        unsafe {
            env::set_var("FRAMEBUS_SHM_DIR", "/tmp/framebus_cfg");
            env::set_var("FRAMEBUS_MAX_WIDTH", "1920");
            env::set_var("FRAMEBUS_READ_TIMEOUT_MS", "250");
            env::set_var("FRAMEBUS_ASPECT_TOLERANCE", "not-a-number");
        }

        let config = BusConfig::from_env();
        assert_eq!(config.shm_dir, PathBuf::from("/tmp/framebus_cfg"));
        assert_eq!(config.policy.max_width, 1920);
        assert_eq!(config.read_timeout, Duration::from_millis(250));
        assert_eq!(config.policy.aspect_tolerance, 0.05);

        unsafe {
            env::remove_var("FRAMEBUS_SHM_DIR");
            env::remove_var("FRAMEBUS_MAX_WIDTH");
            env::remove_var("FRAMEBUS_READ_TIMEOUT_MS");
            env::remove_var("FRAMEBUS_ASPECT_TOLERANCE");
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        let config = BusConfig::from_env();
        assert_eq!(config.lock_timeout, Duration::from_millis(1000));
        assert_eq!(config.metadata_record_bytes, 256);
        assert_eq!(config.policy, FramePolicy::default());
    }
}
