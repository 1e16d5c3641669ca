//! Shape inference for buffers attached without a local record.
//!
//! The chain is fixed and deterministic:
//! 1. the shape recorded in the control block, when it matches the slot size
//! 2. an exact match against [`KNOWN_RESOLUTIONS`]
//! 3. a 3-channel shape derived from [`ASPECT_RATIOS`], both sides a multiple of
//!    [`DIMENSION_MODULUS`]
//! 4. [`DEFAULT_SHAPE`], reported as [`ShapeSource::Fallback`]

use crate::frame::FrameShape;

/// (height, width) pairs of common camera outputs, tried in order.
pub const KNOWN_RESOLUTIONS: [(usize, usize); 5] = [
    (480, 640),
    (720, 1280),
    (1080, 1920),
    (360, 640),
    (720, 960),
];

/// Width / height ratios tried when no known resolution matches.
pub const ASPECT_RATIOS: [f64; 3] = [4.0 / 3.0, 16.0 / 9.0, 3.0 / 2.0];

pub const DIMENSION_MODULUS: usize = 8;

pub const DEFAULT_SHAPE: FrameShape = FrameShape::rgb(480, 640);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeSource {
    /// Given by whoever created or attached with an explicit shape.
    Declared,
    ControlBlock,
    KnownResolution,
    AspectRatio,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferredShape {
    pub shape: FrameShape,
    pub source: ShapeSource,
}

impl InferredShape {
    pub fn declared(shape: FrameShape) -> Self {
        Self {
            shape,
            source: ShapeSource::Declared,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.source == ShapeSource::Fallback
    }
}

/// Infer the frame shape of a slot holding `byte_len` bytes.
pub fn infer_shape(byte_len: usize, recorded: Option<FrameShape>) -> InferredShape {
    if let Some(shape) = recorded.filter(|s| !s.is_empty() && s.byte_len() == byte_len) {
        return InferredShape {
            shape,
            source: ShapeSource::ControlBlock,
        };
    }

    if let Some(shape) = KNOWN_RESOLUTIONS
        .iter()
        .map(|&(h, w)| FrameShape::rgb(h, w))
        .find(|s| s.byte_len() == byte_len)
    {
        return InferredShape {
            shape,
            source: ShapeSource::KnownResolution,
        };
    }

    if let Some(shape) = derive_from_aspect(byte_len) {
        return InferredShape {
            shape,
            source: ShapeSource::AspectRatio,
        };
    }

    tracing::warn!(
        byte_len,
        fallback = %DEFAULT_SHAPE,
        "Could not infer frame shape from buffer size, using default"
    );
    InferredShape {
        shape: DEFAULT_SHAPE,
        source: ShapeSource::Fallback,
    }
}

fn derive_from_aspect(byte_len: usize) -> Option<FrameShape> {
    if byte_len == 0 || byte_len % 3 != 0 {
        return None;
    }
    let pixels = byte_len / 3;

    ASPECT_RATIOS.iter().find_map(|ratio| {
        let width = round_to_multiple((pixels as f64 * ratio).sqrt().round() as usize);
        if width == 0 || pixels % width != 0 {
            return None;
        }
        let height = pixels / width;
        (height > 0 && height % DIMENSION_MODULUS == 0).then(|| FrameShape::rgb(height, width))
    })
}

fn round_to_multiple(value: usize) -> usize {
    (value + DIMENSION_MODULUS / 2) / DIMENSION_MODULUS * DIMENSION_MODULUS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_shape_wins_when_consistent() {
        let recorded = FrameShape::rgb(500, 700);
        let inferred = infer_shape(recorded.byte_len(), Some(recorded));
        assert_eq!(inferred.shape, recorded);
        assert_eq!(inferred.source, ShapeSource::ControlBlock);
    }

    #[test]
    fn test_inconsistent_recorded_shape_is_ignored() {
        let inferred = infer_shape(480 * 640 * 3, Some(FrameShape::rgb(10, 10)));
        assert_eq!(inferred.shape, FrameShape::rgb(480, 640));
        assert_eq!(inferred.source, ShapeSource::KnownResolution);
    }

    #[test]
    fn test_every_known_resolution_matches_exactly() {
        for (h, w) in KNOWN_RESOLUTIONS {
            let inferred = infer_shape(h * w * 3, None);
            assert_eq!(inferred.shape, FrameShape::rgb(h, w));
            assert_eq!(inferred.source, ShapeSource::KnownResolution);
        }
    }

    #[test]
    fn test_aspect_ratio_derivation() {
        // 800x600 is 4:3 but not in the known list
        let inferred = infer_shape(600 * 800 * 3, None);
        assert_eq!(inferred.shape, FrameShape::rgb(600, 800));
        assert_eq!(inferred.source, ShapeSource::AspectRatio);

        // 1024x576 is 16:9
        let inferred = infer_shape(576 * 1024 * 3, None);
        assert_eq!(inferred.shape, FrameShape::rgb(576, 1024));
        assert_eq!(inferred.source, ShapeSource::AspectRatio);

        // 720x480 is 3:2
        let inferred = infer_shape(480 * 720 * 3, None);
        assert_eq!(inferred.shape, FrameShape::rgb(480, 720));
        assert_eq!(inferred.source, ShapeSource::AspectRatio);
    }

    #[test]
    fn test_unmatched_size_falls_back() {
        let inferred = infer_shape(DEFAULT_SHAPE.byte_len() + 5, None);
        assert!(inferred.is_fallback());
        assert_eq!(inferred.shape, DEFAULT_SHAPE);

        // Divisible by three but no ratio yields multiples of 8
        let inferred = infer_shape(7 * 13 * 3, None);
        assert!(inferred.is_fallback());

        assert!(infer_shape(0, None).is_fallback());
    }

    #[test]
    fn test_inference_is_deterministic() {
        let size = 576 * 1024 * 3;
        assert_eq!(infer_shape(size, None), infer_shape(size, None));
    }
}
