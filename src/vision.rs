//! Image decoding for uploaded files.

use image::imageops::FilterType;
use image::RgbImage;
use thiserror::Error;

/// Side length of the square raster handed to the model.
pub const IMAGE_SIZE: u32 = 512;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Image data is empty")]
    EmptyData,

    #[error("Failed to decode image: {0}")]
    DecodeFailed(#[from] image::ImageError),
}

/// Decode raw upload bytes into a `IMAGE_SIZE` x `IMAGE_SIZE` RGB raster.
///
/// The format is sniffed from the data. The image is stretched to the target
/// size without preserving its aspect ratio.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::EmptyData);
    }

    let image = image::load_from_memory(bytes)?;
    Ok(image
        .resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::CatmullRom)
        .to_rgb8())
}
