//! Run drivers: pyramid merge and HGT export.
//!
//! Both enumerate target tiles from the denser source and fan the tiles out
//! over the run's worker pool. Workers only receive plain data (paths, scheme
//! parameters, tile coordinates) and open their own read connections. Results
//! fan back in over a bounded channel to a single owner: the tile writer
//! thread in pyramid mode, the grid assembler in export mode.

use crossbeam_channel::bounded;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::resume_unwind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::compositor::Compositor;
use crate::context::RunContext;
use crate::error::{MergeError, Result};
use crate::grid::{cells_for, GridAssembler, GridPlan, HgtGrid};
use crate::model::{ElevationArray, TmsTile, MAX_ZOOM};
use crate::source::TileSource;
use crate::store::{MbTiles, TileStore};
use crate::terrain_rgb::{Encoding, NodataPolicy};
use crate::writer::{encode_tile, GridWriter, TileWriter};

/// Tiles committed per write transaction.
const WRITE_BATCH: usize = 256;

/// Tiles handed to the pool at once in export mode, per worker. Keeps the set
/// of open cells small when targets are sorted by cell.
const EXPORT_CHUNK_PER_WORKER: usize = 16;

/// A source pyramid as plain data.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    pub path: PathBuf,
    pub encoding: Encoding,
}

impl SourceSpec {
    pub fn new(path: impl Into<PathBuf>, encoding: Encoding) -> Self {
        Self {
            path: path.into(),
            encoding,
        }
    }

    fn open(&self, nodata: &NodataPolicy) -> Result<TileSource<MbTiles>> {
        let store = MbTiles::open(&self.path)?;
        Ok(TileSource::new(store, self.encoding, nodata.clone()))
    }
}

/// Which zoom levels a pyramid merge covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoomSelection {
    Single(u8),
    /// Every level present in either source.
    All,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub zooms: Vec<u8>,
    pub targets: usize,
    pub tiles_written: usize,
    /// Targets neither source could cover.
    pub tiles_empty: usize,
    pub tiles_failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HgtStats {
    /// Zoom actually read, after clamping to the sources' `maxzoom`.
    pub zoom: u8,
    pub targets: usize,
    pub tiles_with_data: usize,
    pub tiles_failed: usize,
    pub cells_planned: usize,
    pub written: Vec<PathBuf>,
    pub cells_failed: usize,
}

/// Connections held by one worker.
struct Sources {
    primary: TileSource<MbTiles>,
    secondary: Option<TileSource<MbTiles>>,
}

impl Sources {
    fn open(
        primary: &SourceSpec,
        secondary: Option<&SourceSpec>,
        nodata: &NodataPolicy,
    ) -> Result<Self> {
        Ok(Self {
            primary: primary.open(nodata)?,
            secondary: secondary.map(|s| s.open(nodata)).transpose()?,
        })
    }

    fn merge(&self, compositor: &Compositor, tile: TmsTile) -> Result<Option<ElevationArray>> {
        let primary = self.primary.fetch(tile)?;
        let secondary = match &self.secondary {
            Some(source) => source.fetch(tile)?,
            None => None,
        };
        Ok(compositor.merge(primary, secondary, tile))
    }
}

/// Tiles to produce at `zoom`: the index of whichever source lists more tiles.
/// Ties go to the secondary.
pub fn target_tiles<S: TileStore>(
    primary: &S,
    secondary: Option<&S>,
    zoom: u8,
) -> Result<Vec<TmsTile>> {
    let primary_tiles = primary.tile_coords_at_zoom(zoom)?;
    let Some(secondary) = secondary else {
        return Ok(primary_tiles);
    };
    let secondary_tiles = secondary.tile_coords_at_zoom(zoom)?;
    debug!(
        "Zoom {}: primary lists {} tiles, secondary {}",
        zoom,
        primary_tiles.len(),
        secondary_tiles.len()
    );
    Ok(if primary_tiles.len() > secondary_tiles.len() {
        primary_tiles
    } else {
        secondary_tiles
    })
}

fn check_zoom(zoom: u8) -> Result<()> {
    if zoom > MAX_ZOOM {
        return Err(MergeError::InvalidZoom(zoom));
    }
    Ok(())
}

enum TileMessage {
    Encoded(TmsTile, Vec<u8>),
    Empty(TmsTile),
    Failed(TmsTile, String),
}

fn produce_tile(
    sources: &Sources,
    compositor: &Compositor,
    encoding: &Encoding,
    tile: TmsTile,
) -> TileMessage {
    let merged = match sources.merge(compositor, tile) {
        Ok(Some(data)) => data,
        Ok(None) => return TileMessage::Empty(tile),
        Err(e) => return TileMessage::Failed(tile, e.to_string()),
    };
    match encode_tile(encoding, &merged) {
        Ok(bytes) => TileMessage::Encoded(tile, bytes),
        Err(e) => TileMessage::Failed(tile, e.to_string()),
    }
}

/// Writer thread body: owns the output store until the channel closes.
fn drain_tiles(
    mut writer: TileWriter,
    rx: crossbeam_channel::Receiver<TileMessage>,
) -> Result<(TileWriter, MergeStats)> {
    let mut stats = MergeStats::default();
    let mut batch = Vec::with_capacity(WRITE_BATCH);

    for message in rx.iter() {
        match message {
            TileMessage::Encoded(tile, bytes) => {
                batch.push((tile, bytes));
                if batch.len() >= WRITE_BATCH {
                    stats.tiles_written += writer.upsert_encoded(std::mem::take(&mut batch))?;
                }
            }
            TileMessage::Empty(tile) => {
                debug!("No source covers {}", tile);
                stats.tiles_empty += 1;
            }
            TileMessage::Failed(tile, reason) => {
                warn!("Skipping {}: {}", tile, reason);
                stats.tiles_failed += 1;
            }
        }
    }
    stats.tiles_written += writer.upsert_encoded(batch)?;
    Ok((writer, stats))
}

/// Overlays `secondary` on `primary` tile by tile and writes a new pyramid.
///
/// Re-running with the same inputs reproduces the same rows, so an interrupted
/// run can simply be repeated.
pub fn merge_pyramids(
    ctx: &RunContext,
    primary: &SourceSpec,
    secondary: &SourceSpec,
    output: &Path,
    zooms: ZoomSelection,
) -> Result<MergeStats> {
    let config = ctx.config();
    let primary_index = MbTiles::open(&primary.path)?;
    let secondary_index = MbTiles::open(&secondary.path)?;

    let zoom_list: Vec<u8> = match zooms {
        ZoomSelection::Single(z) => {
            check_zoom(z)?;
            vec![z]
        }
        ZoomSelection::All => {
            let mut all: BTreeSet<u8> = primary_index.zoom_levels()?.into_iter().collect();
            all.extend(secondary_index.zoom_levels()?);
            all.into_iter().collect()
        }
    };

    let mut work = Vec::new();
    for &zoom in &zoom_list {
        let targets = target_tiles(&primary_index, Some(&secondary_index), zoom)?;
        if targets.is_empty() {
            warn!("No tiles at zoom {}", zoom);
            continue;
        }
        work.push((zoom, targets));
    }
    if work.is_empty() {
        return Err(MergeError::EmptyZoom(zoom_list.last().copied().unwrap_or(0)));
    }

    let mut metadata: BTreeMap<String, String> = primary_index.metadata()?;
    if let Some(stem) = output.file_stem() {
        metadata.insert("name".to_string(), stem.to_string_lossy().into_owned());
    }
    drop(primary_index);
    drop(secondary_index);

    let writer = TileWriter::new(MbTiles::create(output)?, config.encoding);
    let (tx, rx) = bounded::<TileMessage>(ctx.workers() * 4);
    let compositor = ctx.compositor();

    let (produced, drained) = std::thread::scope(|scope| {
        let handle = scope.spawn(move || drain_tiles(writer, rx));

        let mut produced = Ok(());
        for (zoom, targets) in &work {
            info!("Merging zoom {}: {} tiles", zoom, targets.len());
            produced = ctx.pool().install(|| {
                targets.par_iter().try_for_each_init(
                    || Sources::open(primary, Some(secondary), &config.nodata),
                    |sources, &tile| {
                        let message = match sources {
                            Ok(sources) => {
                                produce_tile(sources, &compositor, &config.encoding, tile)
                            }
                            Err(e) => TileMessage::Failed(tile, e.to_string()),
                        };
                        tx.send(message).map_err(|_| MergeError::WriterDisconnected)
                    },
                )
            });
            if produced.is_err() {
                break;
            }
        }
        drop(tx);
        (produced, handle.join().unwrap_or_else(|e| resume_unwind(e)))
    });

    // 書き込みスレッドのエラーを優先
    let (writer, mut stats) = drained?;
    produced?;

    stats.zooms = work.iter().map(|(z, _)| *z).collect();
    stats.targets = work.iter().map(|(_, t)| t.len()).sum();
    writer.finish(&metadata)?;

    info!(
        "Merged {} tiles over zooms {:?} ({} empty, {} failed)",
        stats.tiles_written, stats.zooms, stats.tiles_empty, stats.tiles_failed
    );
    Ok(stats)
}

/// Highest zoom worth reading: `zoom`, lowered to the largest `maxzoom` the sources advertise.
fn clamp_zoom<S: TileStore>(zoom: u8, primary: &S, secondary: Option<&S>) -> Result<u8> {
    let mut advertised = primary.max_zoom()?;
    if let Some(secondary) = secondary {
        advertised = advertised.max(secondary.max_zoom()?);
    }
    match advertised {
        Some(max) if max < zoom => {
            info!("Requested zoom {} exceeds maxzoom {}, using {}", zoom, max, max);
            Ok(max)
        }
        _ => Ok(zoom),
    }
}

fn write_cell(writer: &GridWriter, grid: &HgtGrid, stats: &mut HgtStats) {
    match writer.write(grid) {
        Ok(path) => stats.written.push(path),
        Err(e) => {
            error!("Failed to write {}: {}", grid.cell(), e);
            stats.cells_failed += 1;
        }
    }
}

/// Merges the sources at `zoom` and writes one HGT file per degree cell touched.
///
/// Cells are written as soon as every tile that overlaps them has been
/// processed. A failed cell is reported in the stats and does not stop the run.
pub fn export_hgt(
    ctx: &RunContext,
    primary: &SourceSpec,
    secondary: Option<&SourceSpec>,
    output_dir: &Path,
    zoom: u8,
) -> Result<HgtStats> {
    check_zoom(zoom)?;
    let config = ctx.config();
    let primary_index = MbTiles::open(&primary.path)?;
    let secondary_index = secondary.map(|s| MbTiles::open(&s.path)).transpose()?;

    let zoom = clamp_zoom(zoom, &primary_index, secondary_index.as_ref())?;
    let mut targets = target_tiles(&primary_index, secondary_index.as_ref(), zoom)?;
    if targets.is_empty() {
        return Err(MergeError::EmptyZoom(zoom));
    }
    drop(primary_index);
    drop(secondary_index);

    // セル単位で処理するようにソート
    targets.sort_by_cached_key(|t| (cells_for(*t).first().copied(), *t));
    let plan = GridPlan::from_tiles(&targets);
    info!(
        "Exporting zoom {}: {} tiles into {} cells",
        zoom,
        targets.len(),
        plan.len()
    );

    let writer = GridWriter::new(output_dir)?;
    let mut assembler = GridAssembler::with_plan(&plan);
    let mut stats = HgtStats {
        zoom,
        targets: targets.len(),
        cells_planned: plan.len(),
        ..HgtStats::default()
    };

    let compositor = ctx.compositor();
    let chunk = ctx.workers() * EXPORT_CHUNK_PER_WORKER;
    let (tx, rx) = bounded::<(TmsTile, std::result::Result<Option<ElevationArray>, String>)>(
        ctx.workers() * 2,
    );

    std::thread::scope(|scope| -> Result<()> {
        let producer = scope.spawn(|| -> Result<()> {
            let tx = tx;
            for batch in targets.chunks(chunk) {
                ctx.pool().install(|| {
                    batch.par_iter().try_for_each_init(
                        || Sources::open(primary, secondary, &config.nodata),
                        |sources, &tile| {
                            let result = match sources {
                                Ok(sources) => sources
                                    .merge(&compositor, tile)
                                    .map_err(|e| e.to_string()),
                                Err(e) => Err(e.to_string()),
                            };
                            tx.send((tile, result))
                                .map_err(|_| MergeError::WriterDisconnected)
                        },
                    )
                })?;
            }
            Ok(())
        });

        // 単一スレッドでセルに集約し、完成したセルから順に書き出す
        for (tile, result) in rx.iter() {
            match result {
                Ok(Some(data)) => {
                    stats.tiles_with_data += 1;
                    assembler.accumulate(tile, &data, &mut |grid| {
                        write_cell(&writer, &grid, &mut stats)
                    });
                }
                Ok(None) => {
                    assembler.skip(tile, &mut |grid| write_cell(&writer, &grid, &mut stats));
                }
                Err(reason) => {
                    warn!("Skipping {}: {}", tile, reason);
                    stats.tiles_failed += 1;
                    assembler.skip(tile, &mut |grid| write_cell(&writer, &grid, &mut stats));
                }
            }
        }

        producer.join().unwrap_or_else(|e| resume_unwind(e))
    })?;

    for grid in assembler.finish() {
        warn!("Cell {} was still open after the last tile", grid.cell());
        write_cell(&writer, &grid, &mut stats);
    }

    info!(
        "Wrote {} of {} cells ({} failed, {} tiles failed)",
        stats.written.len(),
        stats.cells_planned,
        stats.cells_failed,
        stats.tiles_failed
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tile(z: u8, x: u32, y: u32) -> TmsTile {
        TmsTile::new(z, x, y).unwrap()
    }

    #[test]
    fn test_target_tiles_prefers_denser_source() {
        let mut sparse = MemoryStore::new();
        sparse.insert(tile(2, 0, 0), vec![1]);
        let mut dense = MemoryStore::new();
        dense.insert(tile(2, 1, 1), vec![1]);
        dense.insert(tile(2, 2, 1), vec![1]);

        let targets = target_tiles(&sparse, Some(&dense), 2).unwrap();
        assert_eq!(targets.len(), 2);
        let targets = target_tiles(&dense, Some(&sparse), 2).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(target_tiles(&sparse, None, 2).unwrap(), vec![tile(2, 0, 0)]);
    }

    #[test]
    fn test_target_tiles_tie_goes_to_secondary() {
        let mut a = MemoryStore::new();
        a.insert(tile(1, 0, 0), vec![1]);
        let mut b = MemoryStore::new();
        b.insert(tile(1, 1, 1), vec![1]);
        assert_eq!(target_tiles(&a, Some(&b), 1).unwrap(), vec![tile(1, 1, 1)]);
    }

    #[test]
    fn test_clamp_zoom() {
        let mut a = MemoryStore::new();
        a.set_max_zoom(Some(8));
        let mut b = MemoryStore::new();
        b.set_max_zoom(Some(12));
        assert_eq!(clamp_zoom(14, &a, Some(&b)).unwrap(), 12);
        assert_eq!(clamp_zoom(10, &a, Some(&b)).unwrap(), 10);
        assert_eq!(clamp_zoom(14, &MemoryStore::new(), None).unwrap(), 14);
    }
}
