/// Still-image thumbnails, PNG encoded.
use crate::error::Result;
use crate::model::{ImageInfo, Thumbnail};
use image::{GenericImageView, ImageFormat};
use std::io::Cursor;
use std::path::Path;

/// Longest edge used when the caller passes `0`.
pub const DEFAULT_MAX_EDGE: u32 = 160;

/// Decode `path`, shrink it to fit in `max_edge` x `max_edge` keeping the
/// aspect ratio, and encode the result as PNG.
pub fn render(path: &Path, max_edge: u32) -> Result<Thumbnail> {
    let max_edge = if max_edge == 0 { DEFAULT_MAX_EDGE } else { max_edge };
    let image = image::open(path)?;
    let small = image.thumbnail(max_edge, max_edge);
    let (width, height) = small.dimensions();

    let mut png = Vec::new();
    small.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(Thumbnail { width, height, png })
}

/// Dimensions without decoding the pixel data.
pub fn image_info(path: &Path, codec: &str) -> Result<ImageInfo> {
    let (width, height) = image::image_dimensions(path)?;
    Ok(ImageInfo {
        codec: Some(codec.to_owned()),
        width,
        height,
    })
}
