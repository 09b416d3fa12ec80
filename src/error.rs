//! Error types for terrain-merge.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while reading sources, merging tiles and writing outputs.
///
/// A tile that is simply missing from a store is never an error; see
/// [`TileSource::fetch`](crate::source::TileSource::fetch).
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("input file not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("invalid zoom level {0} (must be 0-30)")]
    InvalidZoom(u8),

    #[error("tile x={x} y={y} is out of range for zoom {z}")]
    InvalidTile { z: u8, x: u32, y: u32 },

    #[error("unknown encoding '{0}' (expected 'mapbox' or 'terrarium')")]
    UnknownEncoding(String),

    #[error("unknown resampling algorithm '{0}' (expected 'nearest', 'bilinear' or 'lanczos')")]
    UnknownResampling(String),

    #[error("mapbox interval must be a positive finite number, got {0}")]
    InvalidInterval(f64),

    #[error("unsupported tile payload: {0}")]
    UnsupportedPayload(String),

    #[error("elevation array has {actual} values, expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("grid size mismatch for {name}: {actual} bytes, expected {expected}")]
    GridSizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid HGT file name: {0}")]
    InvalidHgtName(String),

    #[error("no tiles found at zoom level {0}")]
    EmptyZoom(u8),

    #[error("worker pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("output writer stopped before all tiles were written")]
    WriterDisconnected,
}

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, MergeError>;
