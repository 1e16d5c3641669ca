use crate::errors::BufferError;
use crate::frame::{Frame, FrameShape};
use fast_image_resize::{
    FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer,
    images::{Image, ImageRef},
};
use ndarray::s;
use std::borrow::Cow;

/// Border color for letterboxed frames.
pub const LETTERBOX_COLOR: u8 = 0;

/// How a frame of one shape is mapped onto a buffer of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitPlan {
    /// Shapes already match.
    Unchanged,
    /// Aspect ratios are close enough to stretch directly to the target.
    Stretch,
    /// Scale to `content` and pad `top`/`left` with [`LETTERBOX_COLOR`].
    Letterbox {
        content: FrameShape,
        top: usize,
        left: usize,
    },
}

/// Decide how to fit `source` into `target`. Pure function of the two shapes.
pub fn plan_fit(source: FrameShape, target: FrameShape, tolerance: f64) -> FitPlan {
    if source == target {
        return FitPlan::Unchanged;
    }

    let source_aspect = source.aspect_ratio();
    let target_aspect = target.aspect_ratio();
    if ((source_aspect - target_aspect) / target_aspect).abs() < tolerance {
        return FitPlan::Stretch;
    }

    let scale = (target.width as f64 / source.width as f64)
        .min(target.height as f64 / source.height as f64);
    let width = ((source.width as f64 * scale) as usize).clamp(1, target.width);
    let height = ((source.height as f64 * scale) as usize).clamp(1, target.height);

    FitPlan::Letterbox {
        content: FrameShape::new(height, width, target.channels),
        top: (target.height - height) / 2,
        left: (target.width - width) / 2,
    }
}

/// Produce a frame of exactly `target` shape from `frame`.
///
/// Returns the input untouched when it already matches. Channel count is never
/// converted; a mismatch there is reported as [`BufferError::ShapeMismatch`].
pub fn fit_frame<'a>(
    frame: &'a Frame,
    target: FrameShape,
    tolerance: f64,
) -> Result<Cow<'a, Frame>, BufferError> {
    let source = FrameShape::of(frame);
    if source.channels != target.channels {
        return Err(BufferError::ShapeMismatch {
            expected: target,
            actual: source,
        });
    }
    if source.is_empty() {
        return Err(BufferError::InvalidShape(source));
    }
    if target.is_empty() {
        return Err(BufferError::InvalidShape(target));
    }

    match plan_fit(source, target, tolerance) {
        FitPlan::Unchanged => Ok(Cow::Borrowed(frame)),
        FitPlan::Stretch => Ok(Cow::Owned(resize_exact(frame, target)?)),
        FitPlan::Letterbox { content, top, left } => {
            let resized = resize_exact(frame, content)?;
            let mut canvas = Frame::from_elem(target.dim(), LETTERBOX_COLOR);
            canvas
                .slice_mut(s![top..top + content.height, left..left + content.width, ..])
                .assign(&resized);
            Ok(Cow::Owned(canvas))
        }
    }
}

/// Bilinear resize to `target`, ignoring aspect ratio.
pub fn resize_exact(frame: &Frame, target: FrameShape) -> Result<Frame, BufferError> {
    let source = FrameShape::of(frame);
    let pixel_type = pixel_type(source.channels)?;

    let contiguous;
    let pixels = match frame.as_slice() {
        Some(pixels) => pixels,
        None => {
            contiguous = frame.iter().copied().collect::<Vec<u8>>();
            &contiguous
        }
    };

    let src = ImageRef::new(
        source.width as u32,
        source.height as u32,
        pixels,
        pixel_type,
    )
    .map_err(|e| BufferError::Resize(e.to_string()))?;
    let mut dst = Image::new(target.width as u32, target.height as u32, pixel_type);

    Resizer::new()
        .resize(
            &src,
            &mut dst,
            &ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear)),
        )
        .map_err(|e| BufferError::Resize(e.to_string()))?;

    Frame::from_shape_vec(target.dim(), dst.buffer().to_vec())
        .map_err(|e| BufferError::Resize(e.to_string()))
}

fn pixel_type(channels: usize) -> Result<PixelType, BufferError> {
    match channels {
        1 => Ok(PixelType::U8),
        2 => Ok(PixelType::U8x2),
        3 => Ok(PixelType::U8x3),
        4 => Ok(PixelType::U8x4),
        n => Err(BufferError::Resize(format!("unsupported channel count {n}"))),
    }
}
