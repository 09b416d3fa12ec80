//! Output writers: degree cells to HGT files, merged tiles back into a pyramid.

mod tiles;

pub use tiles::{encode_tile, TileWriter};

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::error::{MergeError, Result};
use crate::grid::{HgtGrid, HGT_SIZE};
use crate::model::CellId;

/// Byte size of every HGT file: 3601 × 3601 big-endian `i16`.
pub const HGT_BYTES: usize = HGT_SIZE * HGT_SIZE * 2;

const HGT_EXTENSION: &str = "hgt";

/// File name of the HGT file for `cell`, e.g. `N47E008.hgt`.
pub fn hgt_filename(cell: CellId) -> String {
    format!("{}.{}", cell.hgt_name(), HGT_EXTENSION)
}

/// Parses `N47E008`, `s09w077.hgt` and the like back into a cell.
pub fn parse_hgt_name(name: &str) -> Result<CellId> {
    let invalid = || MergeError::InvalidHgtName(name.to_string());
    let stem = name
        .rsplit_once('.')
        .filter(|(_, ext)| ext.eq_ignore_ascii_case(HGT_EXTENSION))
        .map_or(name, |(stem, _)| stem)
        .to_ascii_uppercase();

    if stem.len() != 7 || !stem.is_ascii() {
        return Err(invalid());
    }
    let (lat_part, lon_part) = stem.split_at(3);
    let lat: i32 = lat_part[1..].parse().map_err(|_| invalid())?;
    let lon: i32 = lon_part[1..].parse().map_err(|_| invalid())?;

    let lat = match &lat_part[..1] {
        "N" => lat,
        "S" => -lat,
        _ => return Err(invalid()),
    };
    let lon = match &lon_part[..1] {
        "E" => lon,
        "W" => -lon,
        _ => return Err(invalid()),
    };
    if !(-90..90).contains(&lat) || !(-180..180).contains(&lon) {
        return Err(invalid());
    }
    Ok(CellId::new(lat, lon))
}

/// Reads an HGT file written by [`GridWriter`] (or any SRTM1 tile).
pub fn read_hgt(path: &Path) -> Result<HgtGrid> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cell = parse_hgt_name(&name)?;

    let bytes = fs::read(path)?;
    if bytes.len() != HGT_BYTES {
        return Err(MergeError::GridSizeMismatch {
            name,
            expected: HGT_BYTES,
            actual: bytes.len(),
        });
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    HgtGrid::new(cell, samples)
}

/// Serialises finished cells into a directory of HGT files.
pub struct GridWriter {
    output_dir: PathBuf,
}

impl GridWriter {
    /// Creates the output directory if needed.
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Writes `grid` to `<output_dir>/<cell>.hgt`, replacing any previous file.
    ///
    /// The whole buffer is built in memory, written to a temporary sibling and
    /// renamed into place, so an interrupted write never leaves a short file
    /// under the final name.
    pub fn write(&self, grid: &HgtGrid) -> Result<PathBuf> {
        let name = hgt_filename(grid.cell());
        let path = self.output_dir.join(&name);

        // ビッグエンディアンでバッファを構築
        let mut buffer = Vec::with_capacity(HGT_BYTES);
        for sample in grid.samples() {
            buffer.extend_from_slice(&sample.to_be_bytes());
        }

        let tmp = self.output_dir.join(format!("{}.tmp", name));
        if let Err(e) = write_synced(&tmp, &buffer).and_then(|()| fs::rename(&tmp, &path)) {
            // 一時ファイルを残さない
            if let Err(cleanup) = fs::remove_file(&tmp) {
                debug!("Could not remove {:?}: {}", tmp, cleanup);
            }
            error!("Failed to write {}: {}", name, e);
            return Err(e.into());
        }

        // 書き込み後のサイズを検証
        let written = fs::metadata(&path)?.len() as usize;
        if buffer.len() != HGT_BYTES || written != HGT_BYTES {
            error!(
                "{} has {} bytes on disk, expected {}",
                name, written, HGT_BYTES
            );
            return Err(MergeError::GridSizeMismatch {
                name,
                expected: HGT_BYTES,
                actual: written,
            });
        }

        match grid.min_max() {
            Some((min, max)) => info!(
                "Wrote {} (elevation {}..{} m, {} voids)",
                name,
                min,
                max,
                grid.void_count()
            ),
            None => info!("Wrote {} (all voids)", name),
        }
        debug!("HGT path: {:?}", path);
        Ok(path)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
