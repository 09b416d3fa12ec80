//! Pyramid lookup with ancestor fallback.

use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{ElevationArray, TileMeta, TileResult, TmsTile};
use crate::store::TileStore;
use crate::terrain_rgb::{Encoding, NodataPolicy};
use crate::tile_image::decode_rgb;

/// Read-only elevation view over a tile store.
pub struct TileSource<S> {
    store: S,
    encoding: Encoding,
    nodata: NodataPolicy,
}

impl<S: TileStore> TileSource<S> {
    pub fn new(store: S, encoding: Encoding, nodata: NodataPolicy) -> Self {
        Self {
            store,
            encoding,
            nodata,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Decoded elevations for `tile`, or for its nearest stored ancestor.
    ///
    /// Missing and undecodable tiles are both skipped over; `None` means no
    /// ancestor down to zoom 0 could be used. Only store failures are errors.
    pub fn fetch(&self, tile: TmsTile) -> Result<Option<TileResult>> {
        let mut current = Some(tile);

        while let Some(candidate) = current {
            if let Some(bytes) = self.store.get_tile(candidate)? {
                match self.decode(&bytes) {
                    Ok(data) => {
                        if candidate != tile {
                            debug!("Tile {} served from ancestor {}", tile, candidate);
                        }
                        let meta = TileMeta::builder(tile)
                            .covered(candidate)
                            .size(data.size())
                            .build();
                        return Ok(Some(TileResult { data, meta }));
                    }
                    Err(e) => warn!("Treating tile {} as absent: {}", candidate, e),
                }
            }
            current = candidate.parent();
        }

        Ok(None)
    }

    fn decode(&self, bytes: &[u8]) -> Result<ElevationArray> {
        let pixels = decode_rgb(bytes)?;
        let values = self.encoding.decode_pixels(&pixels.rgb, &self.nodata);
        ElevationArray::new(pixels.size, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::writer::encode_tile;

    fn tile(z: u8, x: u32, y: u32) -> TmsTile {
        TmsTile::new(z, x, y).unwrap()
    }

    fn constant_tile(value: f32, size: usize) -> Vec<u8> {
        let data = ElevationArray::new(size, vec![value; size * size]).unwrap();
        encode_tile(&Encoding::Terrarium, &data).unwrap()
    }

    fn source(store: MemoryStore) -> TileSource<MemoryStore> {
        TileSource::new(store, Encoding::Terrarium, NodataPolicy::default())
    }

    #[test]
    fn test_exact_hit() {
        let mut store = MemoryStore::new();
        store.insert(tile(3, 1, 2), constant_tile(42.0, 4));
        let result = source(store).fetch(tile(3, 1, 2)).unwrap().unwrap();
        assert_eq!(result.source_zoom(), 3);
        assert!(!result.meta.is_fallback());
        assert!(result.data.values().iter().all(|&v| v == 42.0));
    }

    #[test]
    fn test_falls_back_to_root() {
        let mut store = MemoryStore::new();
        store.insert(tile(0, 0, 0), constant_tile(7.0, 4));
        let source = source(store);

        for (x, y) in [(0, 0), (1023, 1023), (517, 3)] {
            let result = source.fetch(tile(10, x, y)).unwrap().unwrap();
            assert_eq!(result.source_zoom(), 0);
            assert_eq!(result.meta.requested(), tile(10, x, y));
            assert_eq!(result.data.values()[0], 7.0);
        }
    }

    #[test]
    fn test_nearest_ancestor_wins() {
        let mut store = MemoryStore::new();
        store.insert(tile(0, 0, 0), constant_tile(1.0, 2));
        store.insert(tile(2, 1, 1), constant_tile(2.0, 2));
        let result = source(store).fetch(tile(4, 5, 6)).unwrap().unwrap();
        assert_eq!(result.source_zoom(), 2);
        assert_eq!(result.meta.covered(), tile(2, 1, 1));
    }

    #[test]
    fn test_corrupt_tile_is_skipped() {
        let mut store = MemoryStore::new();
        store.insert(tile(0, 0, 0), constant_tile(5.0, 2));
        store.insert(tile(1, 0, 0), b"garbage".to_vec());
        let result = source(store).fetch(tile(1, 0, 0)).unwrap().unwrap();
        assert_eq!(result.source_zoom(), 0);
    }

    #[test]
    fn test_nothing_found() {
        let mut store = MemoryStore::new();
        store.insert(tile(1, 1, 1), constant_tile(5.0, 2));
        assert!(source(store).fetch(tile(3, 0, 0)).unwrap().is_none());
    }
}
