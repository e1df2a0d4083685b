//! Packs several reference images into one so each semantic role takes a
//! single input slot of the generative model.

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CompositeError {
    #[error("no images to merge")]
    Empty,

    #[error("none of the {0} images could be decoded")]
    Undecodable(usize),

    #[error("failed to encode composite: {0}")]
    Encode(#[from] image::ImageError),
}

/// Output resolution for a non-square request.
pub fn target_size(aspect_ratio: &str) -> (u32, u32) {
    match aspect_ratio {
        "16:9" => (1344, 768),
        "9:16" => (768, 1344),
        "4:3" => (1152, 896),
        "3:4" => (896, 1152),
        _ => (1024, 1024),
    }
}

/// Merges `images` into one PNG. A single image is returned as is.
pub fn merge(images: &[Vec<u8>], aspect_ratio: &str) -> Result<Vec<u8>, CompositeError> {
    match images {
        [] => return Err(CompositeError::Empty),
        [single] => return Ok(single.clone()),
        _ => {}
    }

    let decoded: Vec<RgbaImage> = images
        .iter()
        .enumerate()
        .filter_map(|(index, bytes)| match image::load_from_memory(bytes) {
            Ok(img) => Some(img.to_rgba8()),
            Err(err) => {
                warn!(index, error = %err, "Skipping undecodable image");
                None
            }
        })
        .collect();

    if decoded.is_empty() {
        return Err(CompositeError::Undecodable(images.len()));
    }

    let mut canvas = grid(&decoded);
    if aspect_ratio != "1:1" {
        let (width, height) = target_size(aspect_ratio);
        canvas = letterbox(&canvas, width, height);
    }
    debug!(
        inputs = images.len(),
        merged = decoded.len(),
        width = canvas.width(),
        height = canvas.height(),
        "Composite ready"
    );

    encode_png(canvas)
}

/// Lays images out row-major on uniform cells sized to the largest input.
fn grid(images: &[RgbaImage]) -> RgbaImage {
    let n = images.len() as u32;
    let cols = (n as f64).sqrt().ceil() as u32;
    let rows = n.div_ceil(cols);

    let cell_w = images.iter().map(RgbaImage::width).max().unwrap_or(0);
    let cell_h = images.iter().map(RgbaImage::height).max().unwrap_or(0);

    let mut canvas = RgbaImage::new(cols * cell_w, rows * cell_h);
    for (i, img) in images.iter().enumerate() {
        let i = i as u32;
        let x = (i % cols) * cell_w + (cell_w - img.width()) / 2;
        let y = (i / cols) * cell_h + (cell_h - img.height()) / 2;
        imageops::replace(&mut canvas, img, x as i64, y as i64);
    }
    canvas
}

/// Scales `img` to fit inside `width`x`height` and centers it on a
/// transparent canvas.
fn letterbox(img: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    let scale = f64::min(
        width as f64 / img.width() as f64,
        height as f64 / img.height() as f64,
    );
    let fit_w = ((img.width() as f64 * scale).round() as u32).clamp(1, width);
    let fit_h = ((img.height() as f64 * scale).round() as u32).clamp(1, height);

    let scaled = imageops::resize(img, fit_w, fit_h, FilterType::Nearest);
    let mut canvas = RgbaImage::new(width, height);
    imageops::replace(
        &mut canvas,
        &scaled,
        ((width - fit_w) / 2) as i64,
        ((height - fit_h) / 2) as i64,
    );
    canvas
}

fn encode_png(img: RgbaImage) -> Result<Vec<u8>, CompositeError> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img).write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
