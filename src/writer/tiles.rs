use std::collections::BTreeMap;
use tracing::debug;

use crate::error::Result;
use crate::model::{ElevationArray, TmsTile};
use crate::store::MbTiles;
use crate::terrain_rgb::Encoding;
use crate::tile_image::encode_png;

/// Terrain-RGB PNG payload for an elevation array. Deterministic for equal input.
pub fn encode_tile(encoding: &Encoding, data: &ElevationArray) -> Result<Vec<u8>> {
    let rgb = encoding.encode_pixels(data.values());
    encode_png(&rgb, data.size())
}

/// Owns the output store of a pyramid merge. Only one may exist per file.
pub struct TileWriter {
    store: MbTiles,
    encoding: Encoding,
    written: usize,
}

impl TileWriter {
    pub fn new(store: MbTiles, encoding: Encoding) -> Self {
        Self {
            store,
            encoding,
            written: 0,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Re-encodes `data` and inserts or replaces the row at `tile`.
    pub fn upsert(&mut self, tile: TmsTile, data: &ElevationArray) -> Result<()> {
        let payload = encode_tile(&self.encoding, data)?;
        self.store.upsert_tile(tile, &payload)?;
        self.written += 1;
        Ok(())
    }

    /// Writes already-encoded payloads in one transaction.
    pub fn upsert_encoded(&mut self, batch: Vec<(TmsTile, Vec<u8>)>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let n = self.store.upsert_batch(batch)?;
        self.written += n;
        debug!("Committed {} tiles ({} total)", n, self.written);
        Ok(n)
    }

    /// Writes the pyramid description and drops unreferenced payloads.
    ///
    /// `minzoom`/`maxzoom` describe every zoom the store holds, including ones
    /// written by earlier runs.
    pub fn finish(mut self, extra: &BTreeMap<String, String>) -> Result<MbTiles> {
        let mut metadata = extra.clone();
        // 出力ピラミッドの記述を上書き
        metadata.insert("format".to_string(), "png".to_string());
        metadata.insert("encoding".to_string(), self.encoding.name().to_string());
        let zooms = self.store.zoom_levels()?;
        if let (Some(min), Some(max)) = (zooms.first(), zooms.last()) {
            metadata.insert("minzoom".to_string(), min.to_string());
            metadata.insert("maxzoom".to_string(), max.to_string());
        }
        self.store.replace_metadata(&metadata)?;

        let pruned = self.store.prune_orphans()?;
        if pruned > 0 {
            debug!("Pruned {} unreferenced payloads", pruned);
        }
        Ok(self.store)
    }
}
