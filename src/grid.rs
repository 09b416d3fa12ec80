//! Accumulation of merged tiles into 1 arc-second degree cells.
//!
//! A cell moves through `Empty → Accumulating → Finalized`. Its buffer is only
//! allocated on the first contribution and is dropped as soon as the cell is
//! finalised. Overlapping contributions are averaged; nodata never takes part.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::error::{MergeError, Result};
use crate::model::{CellId, Crs, ElevationArray, GeoTransform, TmsTile};

/// Samples per side of a 1 arc-second cell, both edges included.
pub const HGT_SIZE: usize = 3601;

/// Sentinel for voids in the grid format.
pub const HGT_VOID: i16 = -32768;

const SAMPLES_PER_DEGREE: f64 = 3600.0;

/// Slack applied when snapping footprint edges onto the sample lattice.
const EDGE_EPSILON: f64 = 1e-6;

/// A finished cell: row-major, north to south, west to east.
#[derive(Debug, Clone, PartialEq)]
pub struct HgtGrid {
    cell: CellId,
    samples: Vec<i16>,
}

impl HgtGrid {
    pub fn new(cell: CellId, samples: Vec<i16>) -> Result<Self> {
        if samples.len() != HGT_SIZE * HGT_SIZE {
            return Err(MergeError::ShapeMismatch {
                expected: HGT_SIZE * HGT_SIZE,
                actual: samples.len(),
            });
        }
        Ok(Self { cell, samples })
    }

    /// A cell holding only voids.
    pub fn void(cell: CellId) -> Self {
        Self {
            cell,
            samples: vec![HGT_VOID; HGT_SIZE * HGT_SIZE],
        }
    }

    pub fn cell(&self) -> CellId {
        self.cell
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn get(&self, row: usize, col: usize) -> i16 {
        self.samples[row * HGT_SIZE + col]
    }

    pub fn void_count(&self) -> usize {
        self.samples.iter().filter(|&&s| s == HGT_VOID).count()
    }

    /// Lowest and highest non-void sample.
    pub fn min_max(&self) -> Option<(i16, i16)> {
        let mut valid = self.samples.iter().copied().filter(|&s| s != HGT_VOID);
        let first = valid.next()?;
        Some(valid.fold((first, first), |(lo, hi), s| (lo.min(s), hi.max(s))))
    }
}

/// Running sums for one cell while tiles are still arriving.
pub struct CellAccumulator {
    cell: CellId,
    sum: Vec<f64>,
    count: Vec<u16>,
}

impl CellAccumulator {
    pub fn new(cell: CellId) -> Self {
        Self {
            cell,
            sum: vec![0.0; HGT_SIZE * HGT_SIZE],
            count: vec![0; HGT_SIZE * HGT_SIZE],
        }
    }

    pub fn cell(&self) -> CellId {
        self.cell
    }

    /// Adds a tile whose pixels cover `footprint` exactly.
    ///
    /// Every grid sample inside the footprint (edges included) takes the tile
    /// pixel it falls in. Returns the number of samples that received a value.
    pub fn accumulate(&mut self, footprint: TmsTile, data: &ElevationArray) -> usize {
        let bounds = footprint.bounds();
        let north = f64::from(self.cell.lat + 1);
        let west = f64::from(self.cell.lon);

        let Some(rows) = sample_range(north - bounds.north, north - bounds.south) else {
            return 0;
        };
        let Some(cols) = sample_range(bounds.west - west, bounds.east - west) else {
            return 0;
        };

        let size = data.size();
        let transform = GeoTransform::for_tile(footprint.to_xyz(), size);
        let pixel = |frac: f64| (frac.floor().max(0.0) as usize).min(size - 1);

        // one mercator projection per column and per row, not per sample
        let col_px: Vec<usize> = cols
            .clone()
            .map(|c| {
                let lon = west + c as f64 / SAMPLES_PER_DEGREE;
                let (x, _) = Crs::WebMercator.from_geographic(lon, 0.0);
                pixel(transform.world_to_pixel(x, transform.origin_y).0)
            })
            .collect();

        let mut written = 0;
        for r in rows {
            let lat = north - r as f64 / SAMPLES_PER_DEGREE;
            let (_, y) = Crs::WebMercator.from_geographic(west, lat);
            let row_px = pixel(transform.world_to_pixel(transform.origin_x, y).1);

            let base = r * HGT_SIZE;
            for (c, &col) in cols.clone().zip(&col_px) {
                let value = data.get(row_px, col);
                if value.is_nan() {
                    continue;
                }
                let idx = base + c;
                // first write when count is 0, running mean afterwards
                self.sum[idx] += f64::from(value);
                self.count[idx] = self.count[idx].saturating_add(1);
                written += 1;
            }
        }
        written
    }

    /// Quantises the mean of every sample; untouched samples become voids.
    pub fn finalize(self) -> HgtGrid {
        let samples = self
            .sum
            .iter()
            .zip(&self.count)
            .map(|(&sum, &count)| {
                if count == 0 {
                    HGT_VOID
                } else {
                    (sum / f64::from(count)).round().clamp(-32767.0, 32767.0) as i16
                }
            })
            .collect();
        HgtGrid {
            cell: self.cell,
            samples,
        }
    }
}

/// Inclusive sample indices covering `[start, end]` degrees from the cell edge.
fn sample_range(start_deg: f64, end_deg: f64) -> Option<std::ops::RangeInclusive<usize>> {
    let first = (start_deg * SAMPLES_PER_DEGREE - EDGE_EPSILON).ceil().max(0.0);
    let last = (end_deg * SAMPLES_PER_DEGREE + EDGE_EPSILON)
        .floor()
        .min((HGT_SIZE - 1) as f64);
    (first <= last).then(|| first as usize..=last as usize)
}

/// How many target tiles will contribute to each cell.
#[derive(Debug, Clone, Default)]
pub struct GridPlan {
    expected: BTreeMap<CellId, usize>,
}

impl GridPlan {
    pub fn from_tiles<'a>(tiles: impl IntoIterator<Item = &'a TmsTile>) -> Self {
        let mut expected = BTreeMap::new();
        for tile in tiles {
            for cell in cells_for(*tile) {
                *expected.entry(cell).or_insert(0) += 1;
            }
        }
        Self { expected }
    }

    pub fn cells(&self) -> impl Iterator<Item = CellId> + '_ {
        self.expected.keys().copied()
    }

    pub fn expected(&self, cell: CellId) -> usize {
        self.expected.get(&cell).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.expected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty()
    }
}

/// Cells a tile contributes to.
pub fn cells_for(tile: TmsTile) -> Vec<CellId> {
    CellId::covering(&tile.bounds())
}

/// Single owner of every in-progress cell.
///
/// Tiles are fed in one at a time; a cell is finalised and passed to the sink
/// the moment the last tile planned for it has been seen, so at most one
/// finished grid is alive at a time.
#[derive(Default)]
pub struct GridAssembler {
    cells: BTreeMap<CellId, CellAccumulator>,
    pending: BTreeMap<CellId, usize>,
    finalized: BTreeSet<CellId>,
}

impl GridAssembler {
    /// An assembler without a plan; cells are only released by [`finish`](Self::finish).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(plan: &GridPlan) -> Self {
        Self {
            pending: plan.expected.clone(),
            ..Self::default()
        }
    }

    /// Number of cells currently holding a buffer.
    pub fn open_cells(&self) -> usize {
        self.cells.len()
    }

    /// Feeds a merged tile. Cells completed by it go to `sink` one by one.
    pub fn accumulate<F>(&mut self, tile: TmsTile, data: &ElevationArray, sink: &mut F)
    where
        F: FnMut(HgtGrid),
    {
        for cell in cells_for(tile) {
            if self.finalized.contains(&cell) {
                warn!("Ignoring tile {} for already finalised cell {}", tile, cell);
                continue;
            }
            let acc = self
                .cells
                .entry(cell)
                .or_insert_with(|| CellAccumulator::new(cell));
            let written = acc.accumulate(tile, data);
            debug!("Tile {} wrote {} samples into {}", tile, written, cell);
            if let Some(grid) = self.count_down(cell) {
                sink(grid);
            }
        }
    }

    /// Records a planned tile that produced no data.
    pub fn skip<F>(&mut self, tile: TmsTile, sink: &mut F)
    where
        F: FnMut(HgtGrid),
    {
        for cell in cells_for(tile) {
            if self.finalized.contains(&cell) {
                continue;
            }
            if let Some(grid) = self.count_down(cell) {
                sink(grid);
            }
        }
    }

    /// Finalises everything still open.
    pub fn finish(self) -> Vec<HgtGrid> {
        self.cells
            .into_values()
            .map(CellAccumulator::finalize)
            .collect()
    }

    fn count_down(&mut self, cell: CellId) -> Option<HgtGrid> {
        let remaining = self.pending.get_mut(&cell)?;
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return None;
        }
        self.pending.remove(&cell);
        self.finalized.insert(cell);
        match self.cells.remove(&cell) {
            Some(acc) => Some(acc.finalize()),
            None => {
                debug!("Cell {} received no data", cell);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::XyzTile;

    fn zoom5_tile() -> TmsTile {
        // lon 0..11.25, lat 0..~11.18
        XyzTile::new(5, 16, 15).unwrap().to_tms()
    }

    fn constant(size: usize, value: f32) -> ElevationArray {
        ElevationArray::new(size, vec![value; size * size]).unwrap()
    }

    #[test]
    fn test_whole_cell_inside_tile() {
        let tile = zoom5_tile();
        let mut acc = CellAccumulator::new(CellId::new(1, 1));
        let written = acc.accumulate(tile, &constant(64, 321.4));
        assert_eq!(written, HGT_SIZE * HGT_SIZE);
        let grid = acc.finalize();
        assert_eq!(grid.void_count(), 0);
        assert_eq!(grid.get(0, 0), 321);
        assert_eq!(grid.get(3600, 3600), 321);
    }

    #[test]
    fn test_partial_cell_keeps_voids_outside_footprint() {
        let tile = zoom5_tile();
        let north = tile.bounds().north;
        let mut acc = CellAccumulator::new(CellId::new(11, 3));
        acc.accumulate(tile, &constant(64, 10.0));
        let grid = acc.finalize();

        // top row is lat 12, above the tile
        assert_eq!(grid.get(0, 1800), HGT_VOID);
        // bottom row is lat 11, inside
        assert_eq!(grid.get(3600, 1800), 10);
        let first_valid_row = ((12.0 - north) * 3600.0).ceil() as usize;
        assert_eq!(grid.get(first_valid_row, 0), 10);
        assert_eq!(grid.get(first_valid_row - 1, 0), HGT_VOID);
    }

    #[test]
    fn test_nodata_never_overwrites() {
        let tile = zoom5_tile();
        let mut acc = CellAccumulator::new(CellId::new(2, 2));
        acc.accumulate(tile, &constant(8, 100.0));
        acc.accumulate(tile, &constant(8, f32::NAN));
        assert_eq!(acc.finalize().get(10, 10), 100);
    }

    #[test]
    fn test_overlap_is_mean() {
        let tile = zoom5_tile();
        let mut acc = CellAccumulator::new(CellId::new(2, 2));
        acc.accumulate(tile, &constant(8, 100.0));
        acc.accumulate(tile, &constant(8, 200.0));
        acc.accumulate(tile, &constant(8, 600.0));
        assert_eq!(acc.finalize().get(1000, 1000), 300);
    }

    #[test]
    fn test_order_independent() {
        let tile = zoom5_tile();
        let arrays = [constant(8, 10.5), constant(8, -3.25), constant(8, 1000.0)];
        let run = |order: [usize; 3]| {
            let mut acc = CellAccumulator::new(CellId::new(5, 5));
            for i in order {
                acc.accumulate(tile, &arrays[i]);
            }
            acc.finalize()
        };
        let a = run([0, 1, 2]);
        assert_eq!(a, run([2, 0, 1]));
        assert_eq!(a, run([1, 2, 0]));
    }

    #[test]
    fn test_quantisation_clips() {
        let tile = zoom5_tile();
        let mut acc = CellAccumulator::new(CellId::new(3, 3));
        acc.accumulate(tile, &constant(4, -40000.0));
        assert_eq!(acc.finalize().get(0, 0), -32767);
    }

    #[test]
    fn test_disjoint_tile_writes_nothing() {
        let tile = XyzTile::new(5, 0, 0).unwrap().to_tms();
        let mut acc = CellAccumulator::new(CellId::new(1, 1));
        assert_eq!(acc.accumulate(tile, &constant(4, 1.0)), 0);
    }

    #[test]
    fn test_assembler_flushes_when_plan_complete() {
        // two zoom-10 tiles side by side inside N46E007
        let a = XyzTile::new(10, 532, 361).unwrap().to_tms();
        let b = XyzTile::new(10, 533, 361).unwrap().to_tms();
        assert_eq!(cells_for(a), vec![CellId::new(46, 7)]);
        assert_eq!(cells_for(b), vec![CellId::new(46, 7)]);

        let plan = GridPlan::from_tiles(&[a, b]);
        assert_eq!(plan.expected(CellId::new(46, 7)), 2);

        let mut assembler = GridAssembler::with_plan(&plan);
        let mut done = Vec::new();
        assembler.accumulate(a, &constant(4, 5.0), &mut |grid| done.push(grid));
        assert!(done.is_empty());
        assert_eq!(assembler.open_cells(), 1);
        assembler.skip(b, &mut |grid| done.push(grid));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].cell(), CellId::new(46, 7));
        assert_eq!(assembler.open_cells(), 0);
        assert!(assembler.finish().is_empty());
    }

    #[test]
    fn test_cell_without_data_is_not_emitted() {
        let a = XyzTile::new(10, 532, 361).unwrap().to_tms();
        let plan = GridPlan::from_tiles(&[a]);
        let mut assembler = GridAssembler::with_plan(&plan);
        let mut emitted = 0;
        assembler.skip(a, &mut |_| emitted += 1);
        assert_eq!(emitted, 0);
    }

    #[test]
    fn test_low_zoom_tile_releases_every_cell() {
        // lon 0..11.25, lat 0..11.18: 12 x 12 cells
        let tile = zoom5_tile();
        let plan = GridPlan::from_tiles(&[tile]);
        assert_eq!(plan.len(), 144);

        let mut assembler = GridAssembler::with_plan(&plan);
        let mut cells = Vec::new();
        assembler.accumulate(tile, &constant(2, 7.0), &mut |grid| {
            assert_eq!(grid.get(3600, 0), 7);
            cells.push(grid.cell());
        });
        assert_eq!(cells.len(), 144);
        assert_eq!(assembler.open_cells(), 0);
        assert_eq!(cells.first(), Some(&CellId::new(0, 0)));
        assert_eq!(cells.last(), Some(&CellId::new(11, 11)));
    }

    #[test]
    fn test_min_max() {
        let mut samples = vec![HGT_VOID; HGT_SIZE * HGT_SIZE];
        samples[5] = -4;
        samples[9] = 12;
        let grid = HgtGrid::new(CellId::new(0, 0), samples).unwrap();
        assert_eq!(grid.min_max(), Some((-4, 12)));
        assert_eq!(HgtGrid::void(CellId::new(0, 0)).min_max(), None);
        assert!(HgtGrid::new(CellId::new(0, 0), vec![0; 4]).is_err());
    }
}
