//! Shared data model: tile addressing, footprints, elevation arrays and degree cells.

use std::f64::consts::PI;
use std::fmt;

use crate::error::{MergeError, Result};

/// Highest zoom level accepted anywhere in the crate.
pub const MAX_ZOOM: u8 = 30;

/// Tile size used when neither source tells us better.
pub const DEFAULT_TILE_SIZE: usize = 512;

/// Half the earth's circumference in Web Mercator metres.
pub const HALF_EARTH: f64 = 20_037_508.342_789_244;

fn check_coord(z: u8, x: u32, y: u32) -> Result<()> {
    if z > MAX_ZOOM {
        return Err(MergeError::InvalidZoom(z));
    }
    let n = 1u64 << z;
    if u64::from(x) >= n || u64::from(y) >= n {
        return Err(MergeError::InvalidTile { z, x, y });
    }
    Ok(())
}

/// Tile address in the TMS convention (row 0 at the south edge).
///
/// This is the key space of MBTiles stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TmsTile {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

/// Tile address in the XYZ / slippy-map convention (row 0 at the north edge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct XyzTile {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TmsTile {
    pub fn new(z: u8, x: u32, y: u32) -> Result<Self> {
        check_coord(z, x, y)?;
        Ok(Self { z, x, y })
    }

    /// Builds a tile from raw store columns, rejecting anything out of range.
    pub fn from_row(z: i64, x: i64, y: i64) -> Result<Self> {
        let z = u8::try_from(z).map_err(|_| MergeError::InvalidZoom(u8::MAX))?;
        let invalid = || MergeError::InvalidTile {
            z,
            x: x.clamp(0, i64::from(u32::MAX)) as u32,
            y: y.clamp(0, i64::from(u32::MAX)) as u32,
        };
        let x = u32::try_from(x).map_err(|_| invalid())?;
        let y = u32::try_from(y).map_err(|_| invalid())?;
        Self::new(z, x, y)
    }

    pub fn to_xyz(self) -> XyzTile {
        XyzTile {
            z: self.z,
            x: self.x,
            y: flip_row(self.z, self.y),
        }
    }

    /// The covering tile one level up, `None` at zoom 0.
    ///
    /// Halving the row works in both conventions, so no flip is needed.
    pub fn parent(self) -> Option<Self> {
        (self.z > 0).then(|| Self {
            z: self.z - 1,
            x: self.x / 2,
            y: self.y / 2,
        })
    }

    pub fn bounds(self) -> GeoBounds {
        self.to_xyz().bounds()
    }

    pub fn mercator_bounds(self) -> MercatorBounds {
        self.to_xyz().mercator_bounds()
    }
}

impl XyzTile {
    pub fn new(z: u8, x: u32, y: u32) -> Result<Self> {
        check_coord(z, x, y)?;
        Ok(Self { z, x, y })
    }

    pub fn to_tms(self) -> TmsTile {
        TmsTile {
            z: self.z,
            x: self.x,
            y: flip_row(self.z, self.y),
        }
    }

    pub fn parent(self) -> Option<Self> {
        (self.z > 0).then(|| Self {
            z: self.z - 1,
            x: self.x / 2,
            y: self.y / 2,
        })
    }

    /// Geographic footprint in degrees.
    pub fn bounds(self) -> GeoBounds {
        let n = (1u64 << self.z) as f64;
        let west = self.x as f64 / n * 360.0 - 180.0;
        let east = (self.x + 1) as f64 / n * 360.0 - 180.0;
        let north = (PI * (1.0 - 2.0 * self.y as f64 / n)).sinh().atan().to_degrees();
        let south = (PI * (1.0 - 2.0 * (self.y + 1) as f64 / n))
            .sinh()
            .atan()
            .to_degrees();
        GeoBounds {
            west,
            south,
            east,
            north,
        }
    }

    /// Footprint in EPSG:3857 metres.
    pub fn mercator_bounds(self) -> MercatorBounds {
        let n = (1u64 << self.z) as f64;
        let span = 2.0 * HALF_EARTH / n;
        let min_x = -HALF_EARTH + self.x as f64 * span;
        let max_y = HALF_EARTH - self.y as f64 * span;
        MercatorBounds {
            min_x,
            min_y: max_y - span,
            max_x: min_x + span,
            max_y,
        }
    }
}

impl From<TmsTile> for XyzTile {
    fn from(tile: TmsTile) -> Self {
        tile.to_xyz()
    }
}

impl From<XyzTile> for TmsTile {
    fn from(tile: XyzTile) -> Self {
        tile.to_tms()
    }
}

impl fmt::Display for TmsTile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{} (tms)", self.z, self.x, self.y)
    }
}

fn flip_row(z: u8, y: u32) -> u32 {
    ((1u64 << z) - 1 - u64::from(y)) as u32
}

/// West/south/east/north extent in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MercatorBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// Coordinate reference systems the resampler understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    /// EPSG:3857, metres.
    WebMercator,
    /// EPSG:4326, degrees (x = longitude, y = latitude).
    Geographic,
}

impl Crs {
    pub fn to_geographic(self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Crs::Geographic => (x, y),
            Crs::WebMercator => {
                let lon = x / HALF_EARTH * 180.0;
                let lat = (y / HALF_EARTH * PI).sinh().atan().to_degrees();
                (lon, lat)
            }
        }
    }

    pub fn from_geographic(self, lon: f64, lat: f64) -> (f64, f64) {
        match self {
            Crs::Geographic => (lon, lat),
            Crs::WebMercator => {
                let lat = lat.clamp(-85.051_128_779_806_6, 85.051_128_779_806_6);
                let x = lon / 180.0 * HALF_EARTH;
                let y = (PI / 4.0 + lat.to_radians() / 2.0).tan().ln() / PI * HALF_EARTH;
                (x, y)
            }
        }
    }

    /// Reprojects a point from `self` into `to`.
    pub fn transform_to(self, to: Crs, x: f64, y: f64) -> (f64, f64) {
        if self == to {
            return (x, y);
        }
        let (lon, lat) = self.to_geographic(x, y);
        to.from_geographic(lon, lat)
    }
}

/// North-up affine transform from pixel (col, row) to world (x, y).
///
/// `pixel_height` is negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub origin_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Transform of a `size`×`size` raster covering `tile` in EPSG:3857.
    pub fn for_tile(tile: XyzTile, size: usize) -> Self {
        let b = tile.mercator_bounds();
        let step = (b.max_x - b.min_x) / size as f64;
        Self {
            origin_x: b.min_x,
            pixel_width: step,
            origin_y: b.max_y,
            pixel_height: -step,
        }
    }

    /// World coordinate of a fractional pixel position (0.5 = pixel centre).
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width,
            self.origin_y + row * self.pixel_height,
        )
    }

    /// Fractional pixel position of a world coordinate.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (y - self.origin_y) / self.pixel_height,
        )
    }
}

/// Square grid of elevations, row-major, north to south. NaN is "no data".
#[derive(Debug, Clone, PartialEq)]
pub struct ElevationArray {
    size: usize,
    values: Vec<f32>,
}

impl ElevationArray {
    pub fn new(size: usize, values: Vec<f32>) -> Result<Self> {
        let expected = size * size;
        if values.len() != expected {
            return Err(MergeError::ShapeMismatch {
                expected,
                actual: values.len(),
            });
        }
        Ok(Self { size, values })
    }

    /// Wraps a buffer whose length is already known to be `size * size`.
    pub(crate) fn from_raw(size: usize, values: Vec<f32>) -> Self {
        debug_assert_eq!(values.len(), size * size);
        Self { size, values }
    }

    /// An array of the given side length holding only nodata.
    pub fn nodata(size: usize) -> Self {
        Self {
            size,
            values: vec![f32::NAN; size * size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.values[row * self.size + col]
    }

    pub fn valid_count(&self) -> usize {
        self.values.iter().filter(|v| !v.is_nan()).count()
    }
}

/// Immutable description of where an elevation array sits on the earth.
///
/// New instances are derived through [`TileMetaBuilder`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileMeta {
    requested: TmsTile,
    covered: TmsTile,
    size: usize,
    bounds: GeoBounds,
    transform: GeoTransform,
    crs: Crs,
}

impl TileMeta {
    pub fn builder(requested: TmsTile) -> TileMetaBuilder {
        TileMetaBuilder {
            requested,
            covered: requested,
            size: DEFAULT_TILE_SIZE,
        }
    }

    /// Starts a builder pre-filled with this metadata.
    pub fn to_builder(&self) -> TileMetaBuilder {
        TileMetaBuilder {
            requested: self.requested,
            covered: self.covered,
            size: self.size,
        }
    }

    /// Tile the caller asked for.
    pub fn requested(&self) -> TmsTile {
        self.requested
    }

    /// Tile whose footprint the data actually covers.
    pub fn covered(&self) -> TmsTile {
        self.covered
    }

    /// Zoom at which the data was found; differs from the request after ancestor fallback.
    pub fn source_zoom(&self) -> u8 {
        self.covered.z
    }

    pub fn is_fallback(&self) -> bool {
        self.covered != self.requested
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bounds(&self) -> GeoBounds {
        self.bounds
    }

    pub fn transform(&self) -> GeoTransform {
        self.transform
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TileMetaBuilder {
    requested: TmsTile,
    covered: TmsTile,
    size: usize,
}

impl TileMetaBuilder {
    pub fn covered(mut self, tile: TmsTile) -> Self {
        self.covered = tile;
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn build(self) -> TileMeta {
        let xyz = self.covered.to_xyz();
        TileMeta {
            requested: self.requested,
            covered: self.covered,
            size: self.size,
            bounds: xyz.bounds(),
            transform: GeoTransform::for_tile(xyz, self.size),
            crs: Crs::WebMercator,
        }
    }
}

/// Decoded elevations of one tile together with their footprint.
#[derive(Debug, Clone)]
pub struct TileResult {
    pub data: ElevationArray,
    pub meta: TileMeta,
}

impl TileResult {
    pub fn source_zoom(&self) -> u8 {
        self.meta.source_zoom()
    }
}

/// One-degree grid cell, identified by its south-west corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId {
    pub lat: i32,
    pub lon: i32,
}

impl CellId {
    pub fn new(lat: i32, lon: i32) -> Self {
        Self { lat, lon }
    }

    /// Cells whose interior overlaps `bounds`.
    pub fn covering(bounds: &GeoBounds) -> Vec<CellId> {
        let lat_min = bounds.south.floor() as i32;
        let lat_max = (bounds.north.ceil() as i32 - 1).max(lat_min);
        let lon_min = bounds.west.floor() as i32;
        let lon_max = (bounds.east.ceil() as i32 - 1).max(lon_min);

        let mut cells = Vec::new();
        for lat in lat_min..=lat_max {
            for lon in lon_min..=lon_max {
                cells.push(CellId { lat, lon });
            }
        }
        cells
    }

    /// Standard HGT base name, e.g. `N47E008` or `S09W077`.
    pub fn hgt_name(&self) -> String {
        let lat = if self.lat >= 0 {
            format!("N{:02}", self.lat)
        } else {
            format!("S{:02}", self.lat.unsigned_abs())
        };
        let lon = if self.lon >= 0 {
            format!("E{:03}", self.lon)
        } else {
            format!("W{:03}", self.lon.unsigned_abs())
        };
        format!("{}{}", lat, lon)
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hgt_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tms_xyz_flip() {
        let tms = TmsTile::new(3, 2, 0).unwrap();
        let xyz = tms.to_xyz();
        assert_eq!(xyz, XyzTile { z: 3, x: 2, y: 7 });
        assert_eq!(xyz.to_tms(), tms);
    }

    #[test]
    fn test_parent_agrees_across_conventions() {
        for y in 0..16 {
            let tms = TmsTile::new(4, 5, y).unwrap();
            let via_tms = tms.parent().unwrap().to_xyz();
            let via_xyz = tms.to_xyz().parent().unwrap();
            assert_eq!(via_tms, via_xyz, "row {}", y);
        }
        assert!(TmsTile::new(0, 0, 0).unwrap().parent().is_none());
    }

    #[test]
    fn test_invalid_coordinates() {
        assert!(matches!(
            TmsTile::new(2, 4, 0),
            Err(MergeError::InvalidTile { .. })
        ));
        assert!(matches!(
            TmsTile::new(31, 0, 0),
            Err(MergeError::InvalidZoom(31))
        ));
        assert!(TmsTile::from_row(1, -1, 0).is_err());
    }

    #[test]
    fn test_bounds_zoom_zero() {
        let b = XyzTile::new(0, 0, 0).unwrap().bounds();
        assert!((b.west + 180.0).abs() < 1e-9);
        assert!((b.east - 180.0).abs() < 1e-9);
        assert!((b.north - 85.051_128_779_806_6).abs() < 1e-6);
        assert!((b.south + 85.051_128_779_806_6).abs() < 1e-6);
    }

    #[test]
    fn test_tms_bounds_are_south_origin() {
        // TMS row 0 at zoom 1 is the southern half
        let b = TmsTile::new(1, 0, 0).unwrap().bounds();
        assert!(b.north.abs() < 1e-9);
        assert!(b.south < -85.0);
    }

    #[test]
    fn test_mercator_roundtrip() {
        let (x, y) = Crs::WebMercator.from_geographic(8.5, 47.3);
        let (lon, lat) = Crs::WebMercator.to_geographic(x, y);
        assert!((lon - 8.5).abs() < 1e-9);
        assert!((lat - 47.3).abs() < 1e-9);
    }

    #[test]
    fn test_transform_covers_tile() {
        let tile = XyzTile::new(2, 1, 1).unwrap();
        let t = GeoTransform::for_tile(tile, 256);
        let b = tile.mercator_bounds();
        let (x, y) = t.pixel_to_world(256.0, 256.0);
        assert!((x - b.max_x).abs() < 1e-6);
        assert!((y - b.min_y).abs() < 1e-6);
        let (col, row) = t.world_to_pixel(b.min_x, b.max_y);
        assert!(col.abs() < 1e-9 && row.abs() < 1e-9);
    }

    #[test]
    fn test_meta_builder_derives_fallback() {
        let requested = TmsTile::new(3, 4, 4).unwrap();
        let meta = TileMeta::builder(requested).size(256).build();
        assert!(!meta.is_fallback());

        let parent = requested.parent().unwrap();
        let fallback = meta.to_builder().covered(parent).build();
        assert!(fallback.is_fallback());
        assert_eq!(fallback.source_zoom(), 2);
        assert_eq!(fallback.requested(), requested);
        assert_eq!(fallback.bounds(), parent.bounds());
    }

    #[test]
    fn test_elevation_array_shape() {
        assert!(ElevationArray::new(2, vec![0.0; 3]).is_err());
        let arr = ElevationArray::new(2, vec![1.0, f32::NAN, 3.0, 4.0]).unwrap();
        assert_eq!(arr.get(1, 0), 3.0);
        assert_eq!(arr.valid_count(), 3);
    }

    #[test]
    fn test_hgt_names() {
        assert_eq!(CellId::new(47, 8).hgt_name(), "N47E008");
        assert_eq!(CellId::new(-9, -77).hgt_name(), "S09W077");
        assert_eq!(CellId::new(0, -1).hgt_name(), "N00W001");
    }

    #[test]
    fn test_cells_covering() {
        let b = GeoBounds {
            west: 7.5,
            south: 46.2,
            east: 9.0,
            north: 47.9,
        };
        let cells = CellId::covering(&b);
        assert_eq!(
            cells,
            vec![
                CellId::new(46, 7),
                CellId::new(46, 8),
                CellId::new(47, 7),
                CellId::new(47, 8)
            ]
        );
    }
}
