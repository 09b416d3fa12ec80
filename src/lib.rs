//! Merging of terrain-RGB tile pyramids, and export of merged elevations to
//! 1 arc-second HGT cells.

pub mod combine;
pub mod compositor;
pub mod context;
pub mod error;
pub mod grid;
pub mod model;
pub mod pipeline;
pub mod resample;
pub mod source;
pub mod store;
pub mod terrain_rgb;
pub mod tile_image;
pub mod writer;

pub use combine::{combine, CombineStats};
pub use compositor::Compositor;
pub use context::{RunConfig, RunContext};
pub use error::{MergeError, Result};
pub use grid::{GridAssembler, HgtGrid};
pub use model::{CellId, ElevationArray, TileMeta, TileResult, TmsTile, XyzTile};
pub use pipeline::{export_hgt, merge_pyramids, HgtStats, MergeStats, SourceSpec, ZoomSelection};
pub use resample::Resampling;
pub use source::TileSource;
pub use store::{MbTiles, TileStore};
pub use terrain_rgb::{Encoding, NodataPolicy};
pub use writer::{hgt_filename, read_hgt, GridWriter, TileWriter};
