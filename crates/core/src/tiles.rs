//! Frame decomposition into prioritised tiles.
//!
//! [`decompose_frame`] cuts a frame into a grid of tiles and emits each
//! cell twice: once at the preview sampling level and once at the full
//! level. The result is ordered so that the whole preview pass comes first,
//! centre-out, followed by the full pass, also centre-out. A tile's index in
//! the returned vector is its queue priority.

use std::cmp::Ordering;

use crate::error::CoreError;
use crate::types::{SamplingLevels, Tile};

/// Split a `width` x `height` frame into `tile_size` squares (clipped at the
/// right and bottom edges) at both sampling levels, in processing order.
///
/// Identical inputs always yield identical output.
pub fn decompose_frame(
    width: u32,
    height: u32,
    tile_size: u32,
    levels: SamplingLevels,
) -> Result<Vec<Tile>, CoreError> {
    if tile_size == 0 {
        return Err(CoreError::InvalidFrame(
            "tile size must be greater than zero".to_string(),
        ));
    }

    let cols = width.div_ceil(tile_size) as usize;
    let rows = height.div_ceil(tile_size) as usize;
    let mut tiles = Vec::with_capacity(cols * rows * 2);

    for y in (0..height).step_by(tile_size as usize) {
        for x in (0..width).step_by(tile_size as usize) {
            let cell_width = tile_size.min(width - x);
            let cell_height = tile_size.min(height - y);
            for sampling in [levels.preview, levels.full] {
                tiles.push(Tile {
                    x,
                    y,
                    width: cell_width,
                    height: cell_height,
                    sampling,
                });
            }
        }
    }

    // `sort_by` is stable, so equidistant tiles keep row-major order.
    tiles.sort_by(|a, b| match a.sampling.cmp(&b.sampling) {
        Ordering::Equal => {
            let da = centre_distance(a, width, height, tile_size);
            let db = centre_distance(b, width, height, tile_size);
            da.total_cmp(&db)
        }
        other => other,
    });

    Ok(tiles)
}

/// Distance from the nominal centre of a grid cell to the frame centre.
///
/// Edge cells use the nominal cell size rather than their clipped size so
/// that the ordering only depends on the grid position.
fn centre_distance(tile: &Tile, width: u32, height: u32, tile_size: u32) -> f64 {
    let half = f64::from(tile_size) / 2.0;
    let dx = f64::from(tile.x) + half - f64::from(width) / 2.0;
    let dy = f64::from(tile.y) + half - f64::from(height) / 2.0;
    dx.hypot(dy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels() -> SamplingLevels {
        SamplingLevels {
            preview: 1,
            full: 16,
        }
    }

    /// Count how many tiles of `sampling` cover each pixel.
    fn coverage(tiles: &[Tile], width: u32, height: u32, sampling: u32) -> Vec<u32> {
        let mut grid = vec![0u32; (width * height) as usize];
        for tile in tiles.iter().filter(|t| t.sampling == sampling) {
            for y in tile.y..tile.y + tile.height {
                for x in tile.x..tile.x + tile.width {
                    assert!(x < width && y < height, "tile {tile:?} exceeds frame");
                    grid[(y * width + x) as usize] += 1;
                }
            }
        }
        grid
    }

    // -- partition ----------------------------------------------------------

    #[test]
    fn every_pixel_covered_exactly_once_per_level() {
        for (width, height, tile_size) in [
            (40, 30, 10),
            (41, 29, 10),
            (1, 1, 1),
            (7, 3, 16),
            (100, 1, 3),
            (64, 64, 64),
            (33, 17, 5),
        ] {
            let tiles = decompose_frame(width, height, tile_size, levels()).unwrap();
            for sampling in [1, 16] {
                let grid = coverage(&tiles, width, height, sampling);
                assert!(
                    grid.iter().all(|&n| n == 1),
                    "{width}x{height}/{tile_size} level {sampling} is not an exact partition"
                );
            }
        }
    }

    #[test]
    fn forty_by_thirty_yields_twelve_tiles_per_pass() {
        let tiles = decompose_frame(40, 30, 10, levels()).unwrap();
        assert_eq!(tiles.len(), 24);
        assert_eq!(tiles.iter().filter(|t| t.sampling == 1).count(), 12);
        assert_eq!(tiles.iter().filter(|t| t.sampling == 16).count(), 12);
    }

    #[test]
    fn edge_tiles_are_clipped() {
        let tiles = decompose_frame(25, 12, 10, levels()).unwrap();
        let corner = tiles
            .iter()
            .find(|t| t.origin() == (20, 10))
            .expect("corner tile present");
        assert_eq!((corner.width, corner.height), (5, 2));
    }

    // -- ordering -----------------------------------------------------------

    #[test]
    fn preview_pass_precedes_full_pass() {
        let tiles = decompose_frame(40, 30, 10, levels()).unwrap();
        let first_full = tiles.iter().position(|t| t.sampling == 16).unwrap();
        assert!(tiles[..first_full].iter().all(|t| t.sampling == 1));
        assert!(tiles[first_full..].iter().all(|t| t.sampling == 16));
    }

    #[test]
    fn each_pass_runs_centre_out() {
        let tiles = decompose_frame(50, 50, 10, levels()).unwrap();
        // The 5x5 grid has its centre cell at (20, 20).
        assert_eq!(tiles[0].origin(), (20, 20));
        assert_eq!(tiles[25].origin(), (20, 20));

        for pass in tiles.chunks(25) {
            let distances: Vec<f64> = pass
                .iter()
                .map(|t| centre_distance(t, 50, 50, 10))
                .collect();
            assert!(distances.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn decomposition_is_deterministic() {
        let a = decompose_frame(123, 77, 9, levels()).unwrap();
        let b = decompose_frame(123, 77, 9, levels()).unwrap();
        assert_eq!(a, b);
    }

    // -- edge cases ---------------------------------------------------------

    #[test]
    fn zero_tile_size_rejected() {
        assert!(matches!(
            decompose_frame(10, 10, 0, levels()),
            Err(CoreError::InvalidFrame(_))
        ));
    }

    #[test]
    fn zero_area_frame_yields_no_tiles() {
        assert!(decompose_frame(0, 10, 4, levels()).unwrap().is_empty());
        assert!(decompose_frame(10, 0, 4, levels()).unwrap().is_empty());
    }
}
