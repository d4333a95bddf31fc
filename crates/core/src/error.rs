#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Pixel buffer for {width}x{height} tile has {actual} bytes, expected {expected}")]
    PixelBufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Tile {x},{y} {width}x{height} lies outside the {frame_width}x{frame_height} frame")]
    TileOutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        frame_width: u32,
        frame_height: u32,
    },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}
