//! Raster resampling between north-up grids, with NaN as nodata.

use rayon::prelude::*;
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use crate::error::{MergeError, Result};
use crate::model::{Crs, ElevationArray, GeoTransform};

const LANCZOS_A: f64 = 3.0;

/// Interpolation kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resampling {
    /// Closest source pixel. Suited to mask-like data.
    Nearest,
    /// 2×2 linear blend. Cheap, good for upscaling ancestor tiles.
    #[default]
    Bilinear,
    /// Windowed sinc with a = 3, widened when shrinking. Best for downsampling.
    Lanczos,
}

impl Resampling {
    pub fn name(&self) -> &'static str {
        match self {
            Resampling::Nearest => "nearest",
            Resampling::Bilinear => "bilinear",
            Resampling::Lanczos => "lanczos",
        }
    }
}

impl fmt::Display for Resampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Resampling {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(Resampling::Nearest),
            "bilinear" => Ok(Resampling::Bilinear),
            "lanczos" => Ok(Resampling::Lanczos),
            _ => Err(MergeError::UnknownResampling(s.to_string())),
        }
    }
}

/// Resamples `src` onto a `size`×`size` grid described by `dst_transform`.
///
/// Destination pixels whose centre falls outside the source are NaN. NaN source
/// pixels never leak into interpolated values: they are dropped from the kernel
/// and the remaining weights renormalised.
pub fn resample(
    src: &ElevationArray,
    src_transform: &GeoTransform,
    src_crs: Crs,
    dst_transform: &GeoTransform,
    dst_crs: Crs,
    size: usize,
    algorithm: Resampling,
) -> ElevationArray {
    let mapper = PixelMapper {
        src_transform,
        src_crs,
        dst_transform,
        dst_crs,
    };
    let scale = mapper.scale_at(size as f64 / 2.0, size as f64 / 2.0);

    let mut values = vec![f32::NAN; size * size];
    values
        .par_chunks_mut(size.max(1))
        .enumerate()
        .for_each(|(row, out)| {
            for (col, value) in out.iter_mut().enumerate() {
                let (fx, fy) = mapper.map(col as f64 + 0.5, row as f64 + 0.5);
                *value = match algorithm {
                    Resampling::Nearest => sample_nearest(src, fx, fy),
                    Resampling::Bilinear => sample_bilinear(src, fx, fy),
                    Resampling::Lanczos => sample_lanczos(src, fx, fy, scale),
                };
            }
        });

    ElevationArray::from_raw(size, values)
}

struct PixelMapper<'a> {
    src_transform: &'a GeoTransform,
    src_crs: Crs,
    dst_transform: &'a GeoTransform,
    dst_crs: Crs,
}

impl PixelMapper<'_> {
    /// Destination pixel position to fractional source pixel position.
    fn map(&self, col: f64, row: f64) -> (f64, f64) {
        let (x, y) = self.dst_transform.pixel_to_world(col, row);
        let (x, y) = self.dst_crs.transform_to(self.src_crs, x, y);
        self.src_transform.world_to_pixel(x, y)
    }

    /// Source pixels per destination pixel along each axis, at least 1.
    fn scale_at(&self, col: f64, row: f64) -> (f64, f64) {
        let (x0, y0) = self.map(col, row);
        let (x1, _) = self.map(col + 1.0, row);
        let (_, y2) = self.map(col, row + 1.0);
        ((x1 - x0).abs().max(1.0), (y2 - y0).abs().max(1.0))
    }
}

fn inside(src: &ElevationArray, fx: f64, fy: f64) -> bool {
    let n = src.size() as f64;
    fx >= 0.0 && fy >= 0.0 && fx <= n && fy <= n
}

fn sample_nearest(src: &ElevationArray, fx: f64, fy: f64) -> f32 {
    if !inside(src, fx, fy) {
        return f32::NAN;
    }
    let last = src.size() - 1;
    let col = (fx.floor() as usize).min(last);
    let row = (fy.floor() as usize).min(last);
    src.get(row, col)
}

fn sample_bilinear(src: &ElevationArray, fx: f64, fy: f64) -> f32 {
    if !inside(src, fx, fy) {
        return f32::NAN;
    }
    let last = (src.size() - 1) as f64;
    // pixel-centre coordinates, edge pixels extended to the border
    let u = (fx - 0.5).clamp(0.0, last);
    let v = (fy - 0.5).clamp(0.0, last);
    let x0 = u.floor();
    let y0 = v.floor();
    let dx = u - x0;
    let dy = v - y0;
    let (x0, y0) = (x0 as usize, y0 as usize);
    let x1 = (x0 + 1).min(src.size() - 1);
    let y1 = (y0 + 1).min(src.size() - 1);

    let taps = [
        (y0, x0, (1.0 - dx) * (1.0 - dy)),
        (y0, x1, dx * (1.0 - dy)),
        (y1, x0, (1.0 - dx) * dy),
        (y1, x1, dx * dy),
    ];
    weighted(src, taps.into_iter(), 1e-9)
}

fn sample_lanczos(src: &ElevationArray, fx: f64, fy: f64, scale: (f64, f64)) -> f32 {
    if !inside(src, fx, fy) {
        return f32::NAN;
    }
    let n = src.size() as i64;
    let u = fx - 0.5;
    let v = fy - 0.5;
    let (sx, sy) = scale;
    let reach_x = (LANCZOS_A * sx).ceil() as i64;
    let reach_y = (LANCZOS_A * sy).ceil() as i64;
    let cx = u.floor() as i64;
    let cy = v.floor() as i64;

    let mut taps = Vec::with_capacity(((2 * reach_x + 2) * (2 * reach_y + 2)) as usize);
    for yi in (cy - reach_y + 1)..=(cy + reach_y) {
        let wy = lanczos((v - yi as f64) / sy);
        if wy == 0.0 {
            continue;
        }
        let row = yi.clamp(0, n - 1) as usize;
        for xi in (cx - reach_x + 1)..=(cx + reach_x) {
            let wx = lanczos((u - xi as f64) / sx);
            if wx == 0.0 {
                continue;
            }
            taps.push((row, xi.clamp(0, n - 1) as usize, wx * wy));
        }
    }
    weighted(src, taps.into_iter(), 1e-6)
}

fn lanczos(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        return 1.0;
    }
    if x.abs() >= LANCZOS_A {
        return 0.0;
    }
    let px = PI * x;
    LANCZOS_A * px.sin() * (px / LANCZOS_A).sin() / (px * px)
}

fn weighted(
    src: &ElevationArray,
    taps: impl Iterator<Item = (usize, usize, f64)>,
    min_weight: f64,
) -> f32 {
    let mut sum = 0.0;
    let mut total = 0.0;
    for (row, col, w) in taps {
        let value = src.get(row, col);
        if value.is_nan() {
            continue;
        }
        sum += f64::from(value) * w;
        total += w;
    }
    if total.abs() < min_weight {
        f32::NAN
    } else {
        (sum / total) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TmsTile, XyzTile};

    fn ramp(size: usize) -> ElevationArray {
        let values = (0..size * size).map(|i| (i % size) as f32).collect();
        ElevationArray::new(size, values).unwrap()
    }

    #[test]
    fn test_identity_resample() {
        let tile = XyzTile::new(5, 10, 12).unwrap();
        let t = GeoTransform::for_tile(tile, 8);
        let src = ramp(8);
        for algorithm in [Resampling::Nearest, Resampling::Bilinear, Resampling::Lanczos] {
            let out = resample(&src, &t, Crs::WebMercator, &t, Crs::WebMercator, 8, algorithm);
            for (a, b) in src.values().iter().zip(out.values()) {
                assert!((a - b).abs() < 1e-3, "{}: {} vs {}", algorithm, a, b);
            }
        }
    }

    #[test]
    fn test_parent_quadrant_upscale_nearest() {
        // 2x2 parent, upscale its north-west quadrant to a 2x2 child
        let parent = XyzTile::new(1, 0, 0).unwrap();
        let child = XyzTile::new(2, 0, 0).unwrap();
        let src = ElevationArray::new(2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = resample(
            &src,
            &GeoTransform::for_tile(parent, 2),
            Crs::WebMercator,
            &GeoTransform::for_tile(child, 2),
            Crs::WebMercator,
            2,
            Resampling::Nearest,
        );
        assert_eq!(out.values(), &[1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_constant_stays_constant() {
        let parent = TmsTile::new(3, 2, 5).unwrap().to_xyz();
        let child = parent.to_tms();
        let child = TmsTile::new(4, child.x * 2 + 1, child.y * 2).unwrap().to_xyz();
        let src = ElevationArray::new(4, vec![250.0; 16]).unwrap();
        for algorithm in [Resampling::Bilinear, Resampling::Lanczos] {
            let out = resample(
                &src,
                &GeoTransform::for_tile(parent, 4),
                Crs::WebMercator,
                &GeoTransform::for_tile(child, 8),
                Crs::WebMercator,
                8,
                algorithm,
            );
            assert!(out.values().iter().all(|v| (v - 250.0).abs() < 1e-3));
        }
    }

    #[test]
    fn test_nan_does_not_spread() {
        let t = GeoTransform::for_tile(XyzTile::new(3, 1, 1).unwrap(), 2);
        let src = ElevationArray::new(2, vec![10.0, f32::NAN, 10.0, 10.0]).unwrap();
        let nearest =
            resample(&src, &t, Crs::WebMercator, &t, Crs::WebMercator, 2, Resampling::Nearest);
        assert!(nearest.values()[1].is_nan());
        let bilinear =
            resample(&src, &t, Crs::WebMercator, &t, Crs::WebMercator, 2, Resampling::Bilinear);
        // exact-centre sample of the NaN pixel has no other weight
        assert!(bilinear.values()[1].is_nan());
        assert_eq!(bilinear.values()[0], 10.0);
    }

    #[test]
    fn test_outside_source_is_nan() {
        let a = GeoTransform::for_tile(XyzTile::new(2, 0, 0).unwrap(), 4);
        let b = GeoTransform::for_tile(XyzTile::new(2, 3, 3).unwrap(), 4);
        let out = resample(
            &ramp(4),
            &a,
            Crs::WebMercator,
            &b,
            Crs::WebMercator,
            4,
            Resampling::Bilinear,
        );
        assert!(out.values().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_parse_resampling() {
        assert_eq!("Lanczos".parse::<Resampling>().unwrap(), Resampling::Lanczos);
        assert!("cubic".parse::<Resampling>().is_err());
    }
}
