//! Priority compositing of two sources onto one target tile.

use rayon::prelude::*;
use tracing::debug;

use crate::model::{ElevationArray, GeoTransform, TileResult, TmsTile, DEFAULT_TILE_SIZE};
use crate::resample::{resample, Resampling};

/// Overlays a secondary source on a primary one.
///
/// Wherever the secondary has data it wins; the primary only fills its gaps.
#[derive(Debug, Clone, Copy, Default)]
pub struct Compositor {
    resampling: Resampling,
}

impl Compositor {
    pub fn new(resampling: Resampling) -> Self {
        Self { resampling }
    }

    pub fn resampling(&self) -> Resampling {
        self.resampling
    }

    /// Merged elevations for `target`, `None` when neither source contributes.
    pub fn merge(
        &self,
        primary: Option<TileResult>,
        secondary: Option<TileResult>,
        target: TmsTile,
    ) -> Option<ElevationArray> {
        if primary.is_none() && secondary.is_none() {
            return None;
        }
        let size = primary
            .as_ref()
            .or(secondary.as_ref())
            .map_or(DEFAULT_TILE_SIZE, |r| r.meta.size());

        let base = match primary {
            Some(result) => self.align(result, target, size),
            None => ElevationArray::nodata(size),
        };

        Some(match secondary {
            Some(result) => {
                let overlay = self.align(result, target, size);
                composite(base, &overlay)
            }
            None => base,
        })
    }

    /// Brings a fetched tile onto the exact footprint and resolution of `target`.
    fn align(&self, result: TileResult, target: TmsTile, size: usize) -> ElevationArray {
        if result.meta.covered() == target && result.data.size() == size {
            return result.data;
        }
        debug!(
            "Resampling {} (zoom {}) onto {} at {}px",
            result.meta.covered(),
            result.source_zoom(),
            target,
            size
        );
        resample(
            &result.data,
            &result.meta.transform(),
            result.meta.crs(),
            &GeoTransform::for_tile(target.to_xyz(), size),
            result.meta.crs(),
            size,
            self.resampling,
        )
    }
}

/// Overwrites `base` with every valid pixel of `overlay`. Shapes must match.
pub fn composite(mut base: ElevationArray, overlay: &ElevationArray) -> ElevationArray {
    debug_assert_eq!(base.size(), overlay.size());
    base.values_mut()
        .par_iter_mut()
        .zip(overlay.values().par_iter())
        .for_each(|(out, &value)| {
            if !value.is_nan() {
                *out = value;
            }
        });
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TileMeta;

    fn result(target: TmsTile, covered: TmsTile, size: usize, values: Vec<f32>) -> TileResult {
        TileResult {
            data: ElevationArray::new(size, values).unwrap(),
            meta: TileMeta::builder(target).covered(covered).size(size).build(),
        }
    }

    fn target() -> TmsTile {
        TmsTile::new(4, 8, 9).unwrap()
    }

    #[test]
    fn test_both_absent() {
        assert!(Compositor::default().merge(None, None, target()).is_none());
    }

    #[test]
    fn test_secondary_wins_where_valid() {
        let t = target();
        let primary = result(t, t, 2, vec![100.0; 4]);
        let secondary = result(t, t, 2, vec![50.0, 50.0, f32::NAN, f32::NAN]);
        let merged = Compositor::default()
            .merge(Some(primary), Some(secondary), t)
            .unwrap();
        assert_eq!(merged.values(), &[50.0, 50.0, 100.0, 100.0]);
    }

    #[test]
    fn test_secondary_only_keeps_gaps() {
        let t = target();
        let secondary = result(t, t, 2, vec![f32::NAN, 3.0, 4.0, f32::NAN]);
        let merged = Compositor::default().merge(None, Some(secondary), t).unwrap();
        assert!(merged.values()[0].is_nan());
        assert_eq!(merged.values()[1], 3.0);
        assert!(merged.values()[3].is_nan());
    }

    #[test]
    fn test_primary_size_decides_resolution() {
        let t = target();
        let primary = result(t, t, 4, vec![10.0; 16]);
        let secondary = result(t, t, 2, vec![20.0; 4]);
        let merged = Compositor::new(Resampling::Nearest)
            .merge(Some(primary), Some(secondary), t)
            .unwrap();
        assert_eq!(merged.size(), 4);
        assert!(merged.values().iter().all(|&v| v == 20.0));
    }

    #[test]
    fn test_fallback_tile_is_resampled_to_target() {
        // one parent pixel per quadrant; the target picks up its own quadrant
        let t = target();
        let parent = t.parent().unwrap();
        let values = vec![1.0, 2.0, 3.0, 4.0];
        let primary = result(t, parent, 2, values);
        let merged = Compositor::new(Resampling::Nearest)
            .merge(Some(primary), None, t)
            .unwrap();

        let xyz = t.to_xyz();
        let parent_xyz = parent.to_xyz();
        let col = (xyz.x - parent_xyz.x * 2) as usize;
        let row = (xyz.y - parent_xyz.y * 2) as usize;
        let expected = [1.0, 2.0, 3.0, 4.0][row * 2 + col];
        assert!(merged.values().iter().all(|&v| v == expected));
    }

    #[test]
    fn test_composite_direct() {
        let base = ElevationArray::new(1, vec![1.0]).unwrap();
        let overlay = ElevationArray::new(1, vec![f32::NAN]).unwrap();
        assert_eq!(composite(base, &overlay).values(), &[1.0]);
    }
}
