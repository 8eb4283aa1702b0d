use image::RgbaImage;
use log::debug;

use crate::error::EncodeError;
use crate::frame::palette::{quantise, Colour};

const PIXELS_PER_BYTE: u32 = 4;

/**
 * Requested dimensions that identify the 90° rotated 128x296 panel family. Frames for these
 * panels are always produced in the native (unrotated) 128x296 layout.
 */
pub const ROTATED_WIDTH: u32 = 296;
pub const ROTATED_HEIGHT: u32 = 128;

/// A packed frame buffer: 2 bits per pixel, 4 pixels per byte, most significant pixel first.
/// Every row starts on a byte boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Creates a zeroed frame. Zero is the black code; the encoder overwrites every visible
    /// pixel so only row padding keeps that value.
    pub fn new(width: u32, height: u32) -> Self {
        let len = Frame::stride(width) * height as usize;
        Frame { width, height, data: vec![0; len] }
    }

    pub fn stride(width: u32) -> usize {
        width.div_ceil(PIXELS_PER_BYTE) as usize
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn position(&self, x: u32, y: u32) -> Option<(usize, u32)> {
        if x >= self.width || y >= self.height {
            return None;
        }

        let index = y as usize * Frame::stride(self.width) + (x / PIXELS_PER_BYTE) as usize;
        let shift = (3 - (x % PIXELS_PER_BYTE)) * 2;
        Some((index, shift))
    }

    /// Out of range coordinates are ignored.
    pub fn set_pixel(&mut self, x: u32, y: u32, colour: Colour) {
        if let Some((index, shift)) = self.position(x, y) {
            let mask = !(0b11u8 << shift);
            self.data[index] = (self.data[index] & mask) | (colour.code() << shift);
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Colour> {
        self.position(x, y)
            .map(|(index, shift)| Colour::from_code(self.data[index] >> shift))
    }
}

/// Nearest source pixel for destination coordinate `dst`: `floor((dst + 0.5) * src / dst_dim)`,
/// clamped to the source range. Computed in integers as `(2 * dst + 1) * src / (2 * dst_dim)`.
pub(crate) fn source_index(dst: u32, src_dim: u32, dst_dim: u32) -> u32 {
    let scaled = (2 * dst as u64 + 1) * src_dim as u64 / (2 * dst_dim as u64);
    scaled.min(src_dim.saturating_sub(1) as u64) as u32
}

pub(crate) fn check_dimensions(image: &RgbaImage, width: u32, height: u32) -> Result<(), EncodeError> {
    if width == 0 || height == 0 {
        return Err(EncodeError::InvalidDimensions { width, height });
    }

    let (src_width, src_height) = image.dimensions();
    if src_width == 0 || src_height == 0 {
        return Err(EncodeError::EmptySource { width: src_width, height: src_height });
    }

    Ok(())
}

pub(crate) fn sample(image: &RgbaImage, x: u32, y: u32) -> Colour {
    let [r, g, b, a] = image.get_pixel(x, y).0;
    quantise(r, g, b, a)
}

/// Resizes, quantises and packs `image` into a frame for a `width` x `height` panel.
///
/// A request for 296x128 is served with a native 128x296 frame whose axes are transposed while
/// sampling, so the picture reads correctly on the physically rotated panel.
pub fn encode_frame(image: &RgbaImage, width: u32, height: u32) -> Result<Frame, EncodeError> {
    check_dimensions(image, width, height)?;
    let (src_width, src_height) = image.dimensions();

    let frame = if width == ROTATED_WIDTH && height == ROTATED_HEIGHT {
        let mut frame = Frame::new(ROTATED_HEIGHT, ROTATED_WIDTH);

        for fy in 0..frame.height() {
            let src_x = source_index(fy, src_width, frame.height());

            for fx in 0..frame.width() {
                let src_y = source_index(fx, src_height, frame.width());
                frame.set_pixel(fx, fy, sample(image, src_x, src_y));
            }
        }

        frame
    } else {
        let mut frame = Frame::new(width, height);

        for y in 0..height {
            let src_y = source_index(y, src_height, height);

            for x in 0..width {
                let src_x = source_index(x, src_width, width);
                frame.set_pixel(x, y, sample(image, src_x, src_y));
            }
        }

        frame
    };

    debug!(
        "Encoded {}x{} source into {}x{} frame ({} bytes)",
        src_width, src_height, frame.width(), frame.height(), frame.len()
    );

    Ok(frame)
}

/// Decodes an uploaded image file (png, jpeg, gif, bmp or webp) into an RGBA raster.
pub fn decode_image(bytes: &[u8]) -> Result<RgbaImage, EncodeError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|source| EncodeError::Decode { source })?;
    Ok(decoded.to_rgba8())
}

/// Wraps a raw RGBA buffer (4 bytes per pixel, row major).
pub fn rgba_from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<RgbaImage, EncodeError> {
    let len = data.len();
    RgbaImage::from_raw(width, height, data)
        .filter(|_| len == width as usize * height as usize * 4)
        .ok_or(EncodeError::RasterLength { width, height, len })
}
