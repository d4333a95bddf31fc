//! Framebuffer with monotonic per-tile refinement.
//!
//! [`OutputAccumulator`] remembers, for every tile origin, the highest
//! sampling level written so far. A result is only blitted when its level is
//! at least the stored one, so a late preview can never clobber a finished
//! full-quality tile, while duplicate deliveries of the same level are
//! harmless.

use std::collections::HashMap;

use crate::error::CoreError;
use crate::types::{Tile, BYTES_PER_PIXEL};

/// Outcome of [`OutputAccumulator::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The tile was written into the framebuffer.
    Applied,
    /// A higher sampling level is already stored for this tile.
    Superseded { stored: u32 },
}

/// RGBA framebuffer (row-major, top row first) plus refinement levels.
#[derive(Debug, Clone)]
pub struct OutputAccumulator {
    width: u32,
    height: u32,
    levels: HashMap<(u32, u32), u32>,
    framebuffer: Vec<u8>,
}

impl OutputAccumulator {
    /// Create an all-black, fully transparent framebuffer.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            levels: HashMap::new(),
            framebuffer: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA bytes.
    pub fn framebuffer(&self) -> &[u8] {
        &self.framebuffer
    }

    /// Sampling level currently stored for the tile at `origin`, if any.
    pub fn level_at(&self, origin: (u32, u32)) -> Option<u32> {
        self.levels.get(&origin).copied()
    }

    /// Number of distinct tile origins written so far.
    pub fn tiles_written(&self) -> usize {
        self.levels.len()
    }

    /// Blit `pixels` for `tile` if its sampling level is not lower than the
    /// level already stored at the same origin.
    ///
    /// # Errors
    ///
    /// Fails without touching the framebuffer when the buffer length does
    /// not match the tile or the tile is outside the frame.
    pub fn apply(&mut self, tile: &Tile, pixels: &[u8]) -> Result<ApplyOutcome, CoreError> {
        if pixels.len() != tile.buffer_len() {
            return Err(CoreError::PixelBufferSize {
                width: tile.width,
                height: tile.height,
                expected: tile.buffer_len(),
                actual: pixels.len(),
            });
        }
        if tile.x.saturating_add(tile.width) > self.width
            || tile.y.saturating_add(tile.height) > self.height
        {
            return Err(CoreError::TileOutOfBounds {
                x: tile.x,
                y: tile.y,
                width: tile.width,
                height: tile.height,
                frame_width: self.width,
                frame_height: self.height,
            });
        }

        if let Some(stored) = self.level_at(tile.origin()) {
            if tile.sampling < stored {
                return Ok(ApplyOutcome::Superseded { stored });
            }
        }

        let row_len = tile.width as usize * BYTES_PER_PIXEL;
        let frame_row_len = self.width as usize * BYTES_PER_PIXEL;
        for (row, src) in pixels.chunks_exact(row_len).enumerate() {
            let start = (tile.y as usize + row) * frame_row_len + tile.x as usize * BYTES_PER_PIXEL;
            self.framebuffer[start..start + row_len].copy_from_slice(src);
        }
        self.levels.insert(tile.origin(), tile.sampling);

        Ok(ApplyOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn tile(x: u32, y: u32, sampling: u32) -> Tile {
        Tile {
            x,
            y,
            width: 2,
            height: 2,
            sampling,
        }
    }

    fn solid(tile: &Tile, value: u8) -> Vec<u8> {
        vec![value; tile.buffer_len()]
    }

    fn pixel(acc: &OutputAccumulator, x: u32, y: u32) -> &[u8] {
        let start = ((y * acc.width() + x) as usize) * BYTES_PER_PIXEL;
        &acc.framebuffer()[start..start + BYTES_PER_PIXEL]
    }

    #[test]
    fn full_after_preview_overwrites() {
        let mut acc = OutputAccumulator::new(4, 4);
        let preview = tile(2, 2, 1);
        let full = tile(2, 2, 64);

        assert_eq!(acc.apply(&preview, &solid(&preview, 10)).unwrap(), ApplyOutcome::Applied);
        assert_eq!(acc.apply(&full, &solid(&full, 200)).unwrap(), ApplyOutcome::Applied);

        assert_eq!(acc.level_at((2, 2)), Some(64));
        assert_eq!(pixel(&acc, 3, 3), &[200, 200, 200, 200]);
    }

    #[test]
    fn preview_after_full_is_ignored() {
        let mut acc = OutputAccumulator::new(4, 4);
        let preview = tile(0, 0, 1);
        let full = tile(0, 0, 64);

        acc.apply(&full, &solid(&full, 200)).unwrap();
        assert_eq!(
            acc.apply(&preview, &solid(&preview, 10)).unwrap(),
            ApplyOutcome::Superseded { stored: 64 }
        );

        assert_eq!(acc.level_at((0, 0)), Some(64));
        assert_eq!(pixel(&acc, 1, 1), &[200, 200, 200, 200]);
    }

    #[test]
    fn same_level_redelivery_is_applied() {
        let mut acc = OutputAccumulator::new(4, 4);
        let full = tile(0, 2, 64);
        acc.apply(&full, &solid(&full, 1)).unwrap();
        assert_eq!(acc.apply(&full, &solid(&full, 2)).unwrap(), ApplyOutcome::Applied);
        assert_eq!(pixel(&acc, 0, 2), &[2, 2, 2, 2]);
    }

    #[test]
    fn blit_lands_at_tile_position_only() {
        let mut acc = OutputAccumulator::new(4, 4);
        let t = tile(2, 0, 1);
        acc.apply(&t, &solid(&t, 9)).unwrap();

        assert_eq!(pixel(&acc, 2, 0), &[9, 9, 9, 9]);
        assert_eq!(pixel(&acc, 3, 1), &[9, 9, 9, 9]);
        assert_eq!(pixel(&acc, 1, 0), &[0, 0, 0, 0]);
        assert_eq!(pixel(&acc, 2, 2), &[0, 0, 0, 0]);
        assert_eq!(acc.tiles_written(), 1);
    }

    #[test]
    fn wrong_buffer_length_rejected() {
        let mut acc = OutputAccumulator::new(4, 4);
        let t = tile(0, 0, 1);
        assert_matches!(
            acc.apply(&t, &[0; 3]),
            Err(CoreError::PixelBufferSize { expected: 16, actual: 3, .. })
        );
        assert_eq!(acc.level_at((0, 0)), None);
    }

    #[test]
    fn out_of_bounds_tile_rejected() {
        let mut acc = OutputAccumulator::new(4, 4);
        let t = tile(3, 3, 1);
        assert_matches!(
            acc.apply(&t, &solid(&t, 1)),
            Err(CoreError::TileOutOfBounds { .. })
        );
    }
}
