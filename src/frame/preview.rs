use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage, RgbaImage};

use crate::error::EncodeError;
use crate::frame::encoder::{check_dimensions, sample, source_index};

pub const PREVIEW_MIME: &str = "image/jpeg";
const PREVIEW_QUALITY: u8 = 85;

/// What the panel is expected to show, flattened to RGB and JPEG encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Renders the preview in the orientation the user asked for, using the same nearest sampling
/// and palette reduction as the frame encoder.
pub fn render_preview(image: &RgbaImage, width: u32, height: u32) -> Result<Preview, EncodeError> {
    check_dimensions(image, width, height)?;
    let (src_width, src_height) = image.dimensions();

    let mut rendered = RgbImage::new(width, height);
    for y in 0..height {
        let src_y = source_index(y, src_height, height);

        for x in 0..width {
            let src_x = source_index(x, src_width, width);
            rendered.put_pixel(x, y, Rgb(sample(image, src_x, src_y).rgb()));
        }
    }

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, PREVIEW_QUALITY)
        .encode_image(&rendered)
        .map_err(|source| EncodeError::Preview { source })?;

    Ok(Preview { jpeg, width, height })
}
