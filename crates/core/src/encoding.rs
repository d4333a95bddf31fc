//! Result transport encoding.
//!
//! Pixel buffers travel through the broker as text: RGBA bytes are
//! compressed to PNG and the PNG is base64-encoded. The same PNG path is
//! used to write the finished framebuffer to disk.

use std::io::Cursor;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageFormat};

use crate::accumulator::OutputAccumulator;
use crate::error::CoreError;
use crate::types::Tile;

/// Compress an RGBA tile buffer to PNG and base64-encode it.
pub fn encode_pixels(tile: &Tile, pixels: &[u8]) -> Result<String, CoreError> {
    if pixels.len() != tile.buffer_len() {
        return Err(CoreError::PixelBufferSize {
            width: tile.width,
            height: tile.height,
            expected: tile.buffer_len(),
            actual: pixels.len(),
        });
    }

    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(pixels, tile.width, tile.height, ExtendedColorType::Rgba8)
        .map_err(|e| CoreError::Encoding(format!("PNG encode failed: {e}")))?;

    Ok(STANDARD.encode(png))
}

/// Reverse of [`encode_pixels`]; the decoded image must match the tile's
/// dimensions.
pub fn decode_pixels(tile: &Tile, data: &str) -> Result<Vec<u8>, CoreError> {
    let png = STANDARD
        .decode(data)
        .map_err(|e| CoreError::Encoding(format!("invalid base64: {e}")))?;

    let image = image::load(Cursor::new(png), ImageFormat::Png)
        .map_err(|e| CoreError::Encoding(format!("PNG decode failed: {e}")))?
        .to_rgba8();

    if image.width() != tile.width || image.height() != tile.height {
        return Err(CoreError::Encoding(format!(
            "decoded image is {}x{}, tile is {}x{}",
            image.width(),
            image.height(),
            tile.width,
            tile.height,
        )));
    }

    Ok(image.into_raw())
}

/// Write the accumulator's framebuffer to `path` as a PNG file.
pub fn write_png(path: &Path, output: &OutputAccumulator) -> Result<(), CoreError> {
    image::save_buffer_with_format(
        path,
        output.framebuffer(),
        output.width(),
        output.height(),
        ExtendedColorType::Rgba8,
        ImageFormat::Png,
    )
    .map_err(|e| CoreError::Encoding(format!("failed to write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile() -> Tile {
        Tile {
            x: 0,
            y: 0,
            width: 3,
            height: 2,
            sampling: 1,
        }
    }

    #[test]
    fn encoded_output_is_text_safe() {
        let t = tile();
        let pixels: Vec<u8> = (0..t.buffer_len() as u8).collect();
        let encoded = encode_pixels(&t, &pixels).unwrap();
        assert!(encoded
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'='));
        assert!(!encoded.contains("\r\n"));
        assert_eq!(decode_pixels(&t, &encoded).unwrap(), pixels);
    }

    #[test]
    fn size_mismatch_rejected_on_encode() {
        assert!(matches!(
            encode_pixels(&tile(), &[0; 5]),
            Err(CoreError::PixelBufferSize { .. })
        ));
    }

    #[test]
    fn dimension_mismatch_rejected_on_decode() {
        let t = tile();
        let encoded = encode_pixels(&t, &vec![7; t.buffer_len()]).unwrap();
        let other = Tile { width: 2, height: 3, ..t };
        assert!(matches!(
            decode_pixels(&other, &encoded),
            Err(CoreError::Encoding(_))
        ));
    }

    #[test]
    fn garbage_rejected_on_decode() {
        assert!(matches!(
            decode_pixels(&tile(), "!!not base64!!"),
            Err(CoreError::Encoding(_))
        ));
        assert!(matches!(
            decode_pixels(&tile(), "aGVsbG8="),
            Err(CoreError::Encoding(_))
        ));
    }
}
