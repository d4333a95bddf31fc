use serde::{Deserialize, Serialize};

/// Broker-assigned job identifier. Local runs assign their own.
pub type JobId = u64;

/// Stable identifier of a worker unit within one coordinator.
pub type WorkerId = usize;

/// Bytes per RGBA pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// An axis-aligned pixel rectangle tagged with the sampling level it should
/// be rendered at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Samples per pixel.
    pub sampling: u32,
}

impl Tile {
    /// Top-left corner; identifies the tile across sampling levels.
    pub fn origin(&self) -> (u32, u32) {
        (self.x, self.y)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Length of the RGBA buffer a kernel must return for this tile.
    pub fn buffer_len(&self) -> usize {
        self.pixel_count() * BYTES_PER_PIXEL
    }
}

/// The two sampling levels of a progressive run.
///
/// Every grid cell is rendered once cheaply at `preview` and once more at
/// `full`, which replaces the preview in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingLevels {
    pub preview: u32,
    pub full: u32,
}

impl Default for SamplingLevels {
    fn default() -> Self {
        Self {
            preview: 1,
            full: 64,
        }
    }
}

/// Frame-wide parameters a worker receives once, before its first tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub seed: String,
}
