//! Conversion of arbitrary raster images into the packed 2-bit-per-pixel
//! frames understood by the ESL panels, plus the RGB preview that is kept in
//! the device shadow.

pub mod encoder;
pub mod palette;
pub mod preview;

pub use encoder::{decode_image, encode_frame, rgba_from_raw, Frame};
pub use palette::{quantise, Colour};
pub use preview::{render_preview, Preview, PREVIEW_MIME};
