//! Concatenation of finished pyramids into one store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{MergeError, Result};
use crate::store::MbTiles;

const COPY_BATCH: usize = 512;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CombineStats {
    pub sources: usize,
    pub tiles_copied: usize,
    pub payloads_pruned: usize,
}

/// Copies every tile of `sources` into `destination`, in order.
///
/// A key present in several sources ends up with the payload of the last one.
/// Metadata is taken from the last source, with `minzoom`/`maxzoom` rewritten
/// to what the destination actually holds.
pub fn combine(destination: &Path, sources: &[PathBuf]) -> Result<CombineStats> {
    if let Some(missing) = sources.iter().find(|p| !p.is_file()) {
        return Err(MergeError::MissingInput(missing.clone()));
    }

    let mut output = MbTiles::create(destination)?;
    let mut stats = CombineStats::default();
    let mut metadata = BTreeMap::new();

    for path in sources {
        if path == destination {
            warn!("Skipping {:?}: it is the destination", path);
            continue;
        }
        let source = MbTiles::open(path)?;
        let mut batch = Vec::with_capacity(COPY_BATCH);
        let mut copied = 0;

        source.for_each_tile(|tile, data| {
            batch.push((tile, data));
            if batch.len() >= COPY_BATCH {
                copied += output.upsert_batch(std::mem::take(&mut batch))?;
            }
            Ok(())
        })?;
        copied += output.upsert_batch(batch)?;

        info!("Copied {} tiles from {:?}", copied, path);
        stats.tiles_copied += copied;
        stats.sources += 1;
        metadata = source.metadata()?;
    }

    let zooms = output.zoom_levels()?;
    if let (Some(min), Some(max)) = (zooms.first(), zooms.last()) {
        metadata.insert("minzoom".to_string(), min.to_string());
        metadata.insert("maxzoom".to_string(), max.to_string());
    }
    output.replace_metadata(&metadata)?;

    stats.payloads_pruned = output.prune_orphans()?;
    output.vacuum()?;
    info!(
        "Combined {} sources into {:?} ({} payloads pruned)",
        stats.sources, destination, stats.payloads_pruned
    );
    Ok(stats)
}
