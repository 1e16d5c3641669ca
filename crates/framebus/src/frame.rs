use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An 8-bit-per-channel image laid out as (height, width, channels).
pub type Frame = Array3<u8>;

/// Mean below which a slot is treated as empty or black.
pub const DARK_MEAN_THRESHOLD: f64 = 10.0;

/// Variance below which a slot is treated as a static fill.
pub const STATIC_VARIANCE_THRESHOLD: f64 = 100.0;

const PLACEHOLDER_BACKGROUND: u8 = 32;
const PLACEHOLDER_BAND: u8 = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl FrameShape {
    pub const fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Three-channel shape, the layout every camera stage produces.
    pub const fn rgb(height: usize, width: usize) -> Self {
        Self::new(height, width, 3)
    }

    pub fn of(frame: &Frame) -> Self {
        let (height, width, channels) = frame.dim();
        Self::new(height, width, channels)
    }

    pub const fn byte_len(&self) -> usize {
        self.height * self.width * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.byte_len() == 0
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }

    pub const fn dim(&self) -> (usize, usize, usize) {
        (self.height, self.width, self.channels)
    }
}

impl From<(usize, usize, usize)> for FrameShape {
    fn from((height, width, channels): (usize, usize, usize)) -> Self {
        Self::new(height, width, channels)
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// Pixel statistics used to tell live frames from empty slots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    pub mean: f64,
    pub variance: f64,
}

impl FrameStats {
    /// Population mean and variance over every byte.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self {
                mean: 0.0,
                variance: 0.0,
            };
        }

        let mut histogram = [0u64; 256];
        for &b in bytes {
            histogram[b as usize] += 1;
        }

        let n = bytes.len() as f64;
        let mean = histogram
            .iter()
            .enumerate()
            .map(|(value, &count)| value as f64 * count as f64)
            .sum::<f64>()
            / n;
        let variance = histogram
            .iter()
            .enumerate()
            .map(|(value, &count)| {
                let d = value as f64 - mean;
                d * d * count as f64
            })
            .sum::<f64>()
            / n;

        Self { mean, variance }
    }

    pub fn of(frame: &Frame) -> Self {
        match frame.as_slice() {
            Some(bytes) => Self::from_bytes(bytes),
            None => Self::from_bytes(&frame.iter().copied().collect::<Vec<_>>()),
        }
    }

    pub fn is_dark(&self) -> bool {
        self.mean < DARK_MEAN_THRESHOLD
    }

    pub fn is_static(&self) -> bool {
        self.variance < STATIC_VARIANCE_THRESHOLD
    }

    /// Whether `alternate` looks like the live frame when `self` looks empty or frozen.
    ///
    /// Best-effort only: a genuinely black or flat scene is indistinguishable
    /// from an unwritten slot.
    pub fn prefers(&self, alternate: &FrameStats) -> bool {
        (self.is_dark() && !alternate.is_dark()) || (self.is_static() && !alternate.is_static())
    }
}

/// Dim frame with a lighter horizontal band, shown while a buffer has no data.
pub fn placeholder_frame(shape: FrameShape) -> Frame {
    let band = shape.height / 3..shape.height - shape.height / 3;
    Frame::from_shape_fn(shape.dim(), |(y, _, _)| {
        if band.contains(&y) {
            PLACEHOLDER_BAND
        } else {
            PLACEHOLDER_BACKGROUND
        }
    })
}

/// Copy a frame into a contiguous byte slice of exactly `frame.len()` bytes.
pub(crate) fn copy_frame_into(frame: &Frame, dst: &mut [u8]) {
    match frame.as_slice() {
        Some(src) => dst.copy_from_slice(src),
        None => {
            for (d, s) in dst.iter_mut().zip(frame.iter()) {
                *d = *s;
            }
        }
    }
}

pub(crate) fn frame_from_bytes(shape: FrameShape, bytes: &[u8]) -> Frame {
    // Length is checked by the caller against the shape
    Frame::from_shape_vec(shape.dim(), bytes[..shape.byte_len()].to_vec())
        .unwrap_or_else(|_| Frame::zeros(shape.dim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    #[test]
    fn test_shape_helpers() {
        let shape = FrameShape::rgb(480, 640);
        assert_eq!(shape.byte_len(), 921_600);
        assert_eq!(shape.to_string(), "480x640x3");
        assert!((shape.aspect_ratio() - 4.0 / 3.0).abs() < 1e-9);
        assert_eq!(FrameShape::from((2, 3, 1)), FrameShape::new(2, 3, 1));
        assert_eq!(FrameShape::of(&Frame::zeros((4, 5, 3))), FrameShape::new(4, 5, 3));
    }

    #[test]
    fn test_stats_uniform_and_mixed() {
        let stats = FrameStats::from_bytes(&[200; 64]);
        assert_eq!(stats.mean, 200.0);
        assert_eq!(stats.variance, 0.0);

        let stats = FrameStats::from_bytes(&[0, 255, 0, 255]);
        assert!((stats.mean - 127.5).abs() < 1e-9);
        assert!((stats.variance - 127.5 * 127.5).abs() < 1e-6);
    }

    #[test]
    fn test_stats_of_non_contiguous_view() {
        let mut frame = Frame::zeros((4, 4, 3));
        frame.slice_mut(s![.., 2.., ..]).fill(100);
        let permuted = frame.clone().permuted_axes([1, 0, 2]);
        assert!(permuted.as_slice().is_none());
        assert_eq!(FrameStats::of(&permuted), FrameStats::of(&frame));
        assert!((FrameStats::of(&frame).mean - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_prefers_live_over_dark_or_static() {
        let black = FrameStats::from_bytes(&[0; 16]);
        let flat_gray = FrameStats::from_bytes(&[128; 16]);
        let live = FrameStats::from_bytes(&[0, 255, 30, 220, 90, 10, 180, 60]);

        assert!(black.prefers(&live));
        assert!(black.prefers(&flat_gray));
        assert!(flat_gray.prefers(&live));
        assert!(!live.prefers(&black));
        assert!(!black.prefers(&black));
    }

    #[test]
    fn test_placeholder_has_band() {
        let frame = placeholder_frame(FrameShape::rgb(30, 40));
        assert_eq!(FrameShape::of(&frame), FrameShape::rgb(30, 40));
        assert_eq!(frame[[0, 0, 0]], PLACEHOLDER_BACKGROUND);
        assert_eq!(frame[[15, 20, 1]], PLACEHOLDER_BAND);
        assert_eq!(frame[[29, 39, 2]], PLACEHOLDER_BACKGROUND);
    }

    #[test]
    fn test_copy_round_trip() {
        let frame = Frame::from_shape_fn((3, 4, 3), |(y, x, c)| (y * 16 + x * 4 + c) as u8);
        let mut bytes = vec![0u8; frame.len()];
        copy_frame_into(&frame, &mut bytes);
        assert_eq!(frame_from_bytes(FrameShape::of(&frame), &bytes), frame);
    }
}
