use bytes::Bytes;
use image::{
    codecs::jpeg::JpegEncoder,
    imageops::{self, FilterType},
    DynamicImage, ImageError, RgbImage, RgbaImage,
};

/// Encodes an RGB frame as JPEG at `quality` (1..=100).
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Bytes, ImageError> {
    let mut buffer = Vec::with_capacity((frame.width() * frame.height() / 4) as usize);
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
    frame.write_with_encoder(encoder)?;
    Ok(Bytes::from(buffer))
}

/// Scales `frame` to the overlay size and blends the overlay on top.
pub fn composite(frame: &RgbImage, overlay: &RgbaImage) -> RgbImage {
    let (width, height) = overlay.dimensions();
    let mut base = DynamicImage::ImageRgb8(frame.clone()).to_rgba8();
    if base.dimensions() != (width, height) {
        base = imageops::resize(&base, width, height, FilterType::Triangle);
    }
    imageops::overlay(&mut base, overlay, 0, 0);
    DynamicImage::ImageRgba8(base).to_rgb8()
}
