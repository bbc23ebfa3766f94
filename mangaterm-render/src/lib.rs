use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use mangaterm_core::{RenderImage, Rotation};
use rayon::prelude::*;
use tracing::{instrument, trace};

/// Turns raw cached page bytes into a displayable bitmap.
pub trait PageRenderer: Send + Sync {
    fn render(
        &self,
        bytes: &[u8],
        max_width: u32,
        max_height: u32,
        rotation: Rotation,
    ) -> Result<RenderImage>;
}

/// Decodes common page formats with the `image` crate.
#[derive(Debug, Clone)]
pub struct ImageRenderer {
    grayscale: bool,
}

impl ImageRenderer {
    pub fn new(grayscale: bool) -> Self {
        Self { grayscale }
    }
}

impl Default for ImageRenderer {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PageRenderer for ImageRenderer {
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    fn render(
        &self,
        bytes: &[u8],
        max_width: u32,
        max_height: u32,
        rotation: Rotation,
    ) -> Result<RenderImage> {
        let decoded = image::load_from_memory(bytes).context("failed to decode page image")?;
        let scaled = scale_to_fit(decoded, max_width, max_height);
        let mut rgba = scaled.to_rgba8();

        if self.grayscale {
            to_grayscale(&mut rgba);
        }
        let rgba = match rotation {
            Rotation::Upright => rgba,
            Rotation::Quarter => image::imageops::rotate90(&rgba),
        };

        trace!(width = rgba.width(), height = rgba.height(), "page rendered");
        Ok(RenderImage {
            width: rgba.width(),
            height: rgba.height(),
            pixels: rgba.into_raw(),
        })
    }
}

/// Target size preserving aspect ratio; a zero bound leaves that axis free.
/// Scales up as well as down. Returns `None` when no resize is needed.
pub fn fit_dimensions(
    width: u32,
    height: u32,
    max_width: u32,
    max_height: u32,
) -> Option<(u32, u32)> {
    if (max_width == 0 && max_height == 0) || width == 0 || height == 0 {
        return None;
    }
    let max_width = if max_width == 0 { width } else { max_width };
    let max_height = if max_height == 0 { height } else { max_height };

    let scale_x = f64::from(max_width) / f64::from(width);
    let scale_y = f64::from(max_height) / f64::from(height);
    let scale = scale_x.min(scale_y);
    if scale == 1.0 {
        return None;
    }

    let new_width = ((f64::from(width) * scale) as u32).max(1);
    let new_height = ((f64::from(height) * scale) as u32).max(1);
    Some((new_width, new_height))
}

fn scale_to_fit(image: DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    match fit_dimensions(image.width(), image.height(), max_width, max_height) {
        Some((width, height)) => image.resize_exact(width, height, FilterType::Triangle),
        None => image,
    }
}

/// Luminosity grayscale, alpha untouched.
fn to_grayscale(image: &mut RgbaImage) {
    let pixels: &mut [u8] = image;
    pixels.par_chunks_exact_mut(4).for_each(|px| {
        let gray = (0.299 * f32::from(px[0]) + 0.587 * f32::from(px[1]) + 0.114 * f32::from(px[2]))
            as u8;
        px[0] = gray;
        px[1] = gray;
        px[2] = gray;
    });
}
