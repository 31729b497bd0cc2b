//! Image to input-tensor conversion.
//!
//! The layout expected by classification graphs is NHWC with a batch of
//! one, rows emitted from the bottom of the image up, columns left to right,
//! channels in R, G, B order.

use image::{imageops::FilterType, RgbImage};
use std::path::Path;

use crate::error::{CoachError, Result};

/// Borrowed image input accepted by [`normalize`] and `ModelHandle::predict`.
#[derive(Debug, Clone, Copy)]
pub enum ImageSource<'a> {
    Path(&'a Path),
    Bytes(&'a [u8]),
}

impl<'a> From<&'a Path> for ImageSource<'a> {
    fn from(p: &'a Path) -> Self { ImageSource::Path(p) }
}

impl<'a> From<&'a std::path::PathBuf> for ImageSource<'a> {
    fn from(p: &'a std::path::PathBuf) -> Self { ImageSource::Path(p.as_path()) }
}

impl<'a> From<&'a [u8]> for ImageSource<'a> {
    fn from(b: &'a [u8]) -> Self { ImageSource::Bytes(b) }
}

impl<'a> From<&'a Vec<u8>> for ImageSource<'a> {
    fn from(b: &'a Vec<u8>) -> Self { ImageSource::Bytes(b.as_slice()) }
}

/// Per-model normalization parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizeParams {
    pub target_size: u32,
    pub pixel_mean: f32,
    pub pixel_scale: f32,
}

impl NormalizeParams {
    pub fn validate(&self) -> Result<()> {
        if self.target_size == 0 {
            return Err(CoachError::InvalidInput("target size must be greater than 0".into()));
        }
        if !self.pixel_scale.is_finite() || self.pixel_scale == 0.0 {
            return Err(CoachError::InvalidInput(format!("pixel scale must be finite and non-zero, got {}", self.pixel_scale)));
        }
        if !self.pixel_mean.is_finite() {
            return Err(CoachError::InvalidInput(format!("pixel mean must be finite, got {}", self.pixel_mean)));
        }
        Ok(())
    }
}

/// Flat `[1, size, size, 3]` f32 buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    size: usize,
    data: Vec<f32>,
}

impl ImageTensor {
    pub fn shape(&self) -> [usize; 4] { [1, self.size, self.size, 3] }
    pub fn size(&self) -> usize { self.size }
    pub fn data(&self) -> &[f32] { &self.data }
    pub fn into_data(self) -> Vec<f32> { self.data }
}

pub fn decode(source: ImageSource<'_>) -> Result<RgbImage> {
    let img = match source {
        ImageSource::Bytes(bytes) => image::load_from_memory(bytes)?,
        ImageSource::Path(path) => {
            let bytes = std::fs::read(path).map_err(|e| CoachError::io(path, e))?;
            image::load_from_memory(&bytes)?
        }
    };
    Ok(img.to_rgb8())
}

pub fn normalize(source: ImageSource<'_>, params: NormalizeParams) -> Result<ImageTensor> {
    params.validate()?;
    let img = decode(source)?;
    Ok(tensor_from_rgb(&img, params))
}

/// Stretches `img` to the target square and emits the normalized buffer.
pub fn tensor_from_rgb(img: &RgbImage, params: NormalizeParams) -> ImageTensor {
    let side = params.target_size;
    let resized;
    let img = if img.dimensions() == (side, side) {
        img
    } else {
        resized = image::imageops::resize(img, side, side, FilterType::Triangle);
        &resized
    };

    let size = side as usize;
    let mut data = Vec::with_capacity(size * size * 3);
    for y in (0..side).rev() {
        for x in 0..side {
            let px = img.get_pixel(x, y);
            for c in px.0 {
                data.push((c as f32 - params.pixel_mean) / params.pixel_scale);
            }
        }
    }
    ImageTensor { size, data }
}
