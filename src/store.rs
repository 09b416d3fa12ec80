//! MBTiles container access.
//!
//! Tiles are keyed by TMS `(zoom_level, tile_column, tile_row)`. Stores created
//! here use the deduplicated layout (`tiles_shallow` + `tiles_data`, content
//! addressed by SHA-256) behind the standard `tiles` view, so any MBTiles reader
//! can consume them and any MBTiles file can be read back through the same queries.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{MergeError, Result};
use crate::model::TmsTile;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS metadata (name TEXT, value TEXT);
    CREATE TABLE IF NOT EXISTS tiles_shallow (
        zoom_level INTEGER,
        tile_column INTEGER,
        tile_row INTEGER,
        tile_data_id TEXT,
        PRIMARY KEY (zoom_level, tile_column, tile_row)
    ) WITHOUT ROWID;
    CREATE TABLE IF NOT EXISTS tiles_data (
        tile_data_id TEXT PRIMARY KEY,
        tile_data BLOB
    );
    CREATE VIEW IF NOT EXISTS tiles AS
        SELECT tiles_shallow.zoom_level AS zoom_level,
               tiles_shallow.tile_column AS tile_column,
               tiles_shallow.tile_row AS tile_row,
               tiles_data.tile_data AS tile_data
        FROM tiles_shallow
        JOIN tiles_data ON tiles_shallow.tile_data_id = tiles_data.tile_data_id;
";

/// Read access to a tile pyramid.
pub trait TileStore {
    /// Payload stored at `tile`, `None` when absent.
    fn get_tile(&self, tile: TmsTile) -> Result<Option<Vec<u8>>>;

    /// Every tile listed at `zoom`.
    fn tile_coords_at_zoom(&self, zoom: u8) -> Result<Vec<TmsTile>>;

    /// The `maxzoom` metadata entry, if present and parseable.
    fn max_zoom(&self) -> Result<Option<u8>>;
}

/// Content id of a tile payload.
pub fn content_id(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// An MBTiles file on disk.
pub struct MbTiles {
    conn: Connection,
    path: PathBuf,
}

impl MbTiles {
    /// Opens an existing store read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(MergeError::MissingInput(path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Opens a store for writing, creating the file and schema when needed.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        debug!("Opened output store {:?}", path);
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn zoom_levels(&self) -> Result<Vec<u8>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT zoom_level FROM tiles ORDER BY zoom_level")?;
        let zooms = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(zooms
            .into_iter()
            .filter_map(|z| u8::try_from(z).ok())
            .collect())
    }

    pub fn tile_count_at_zoom(&self, zoom: u8) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tiles WHERE zoom_level = ?1",
            params![zoom],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn metadata(&self) -> Result<BTreeMap<String, String>> {
        let mut stmt = self.conn.prepare("SELECT name, value FROM metadata")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(name, value)| (name, value.unwrap_or_default()))
            .collect())
    }

    pub fn metadata_value(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE name = ?1",
                params![name],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    pub fn set_metadata(&self, name: &str, value: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM metadata WHERE name = ?1", params![name])?;
        self.conn.execute(
            "INSERT INTO metadata (name, value) VALUES (?1, ?2)",
            params![name, value],
        )?;
        Ok(())
    }

    /// Replaces the whole metadata table.
    pub fn replace_metadata(&mut self, entries: &BTreeMap<String, String>) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM metadata", [])?;
        {
            let mut stmt = tx.prepare("INSERT INTO metadata (name, value) VALUES (?1, ?2)")?;
            for (name, value) in entries {
                stmt.execute(params![name, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Inserts or replaces one tile. Equal payloads share one `tiles_data` row.
    pub fn upsert_tile(&self, tile: TmsTile, data: &[u8]) -> Result<()> {
        upsert(&self.conn, tile, data)
    }

    /// Upserts many tiles in a single transaction.
    pub fn upsert_batch<I>(&mut self, tiles: I) -> Result<usize>
    where
        I: IntoIterator<Item = (TmsTile, Vec<u8>)>,
    {
        let tx = self.conn.transaction()?;
        let mut written = 0;
        for (tile, data) in tiles {
            upsert(&tx, tile, &data)?;
            written += 1;
        }
        tx.commit()?;
        Ok(written)
    }

    /// Calls `f` for every tile in the store, in key order.
    pub fn for_each_tile<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(TmsTile, Vec<u8>) -> Result<()>,
    {
        let mut stmt = self.conn.prepare(
            "SELECT zoom_level, tile_column, tile_row, tile_data FROM tiles
             ORDER BY zoom_level, tile_column, tile_row",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let (z, x, y): (i64, i64, i64) = (row.get(0)?, row.get(1)?, row.get(2)?);
            match TmsTile::from_row(z, x, y) {
                Ok(tile) => f(tile, row.get(3)?)?,
                Err(e) => warn!("Skipping row in {:?}: {}", self.path, e),
            }
        }
        Ok(())
    }

    /// Deletes payloads no longer referenced by any tile. Returns the number removed.
    pub fn prune_orphans(&self) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM tiles_data WHERE tile_data_id NOT IN
             (SELECT DISTINCT tile_data_id FROM tiles_shallow)",
            [],
        )?;
        Ok(removed)
    }

    pub fn vacuum(&self) -> Result<()> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }
}

fn upsert(conn: &Connection, tile: TmsTile, data: &[u8]) -> Result<()> {
    let id = content_id(data);
    conn.prepare_cached(
        "INSERT OR IGNORE INTO tiles_data (tile_data_id, tile_data) VALUES (?1, ?2)",
    )?
    .execute(params![id, data])?;
    conn.prepare_cached(
        "INSERT OR REPLACE INTO tiles_shallow (zoom_level, tile_column, tile_row, tile_data_id)
         VALUES (?1, ?2, ?3, ?4)",
    )?
    .execute(params![tile.z, tile.x, tile.y, id])?;
    Ok(())
}

impl TileStore for MbTiles {
    fn get_tile(&self, tile: TmsTile) -> Result<Option<Vec<u8>>> {
        let data = self
            .conn
            .prepare_cached(
                "SELECT tile_data FROM tiles
                 WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
            )?
            .query_row(params![tile.z, tile.x, tile.y], |row| row.get(0))
            .optional()?;
        Ok(data)
    }

    fn tile_coords_at_zoom(&self, zoom: u8) -> Result<Vec<TmsTile>> {
        let mut stmt = self.conn.prepare(
            "SELECT tile_column, tile_row FROM tiles WHERE zoom_level = ?1
             ORDER BY tile_column, tile_row",
        )?;
        let rows = stmt
            .query_map(params![zoom], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut tiles = Vec::with_capacity(rows.len());
        for (x, y) in rows {
            match TmsTile::from_row(i64::from(zoom), x, y) {
                Ok(tile) => tiles.push(tile),
                Err(e) => warn!("Skipping row in {:?}: {}", self.path, e),
            }
        }
        Ok(tiles)
    }

    fn max_zoom(&self) -> Result<Option<u8>> {
        let Some(raw) = self.metadata_value("maxzoom")? else {
            return Ok(None);
        };
        match raw.trim().parse::<u8>() {
            Ok(z) => Ok(Some(z)),
            Err(e) => {
                warn!("Could not parse maxzoom '{}' in {:?}: {}", raw, self.path, e);
                Ok(None)
            }
        }
    }
}

/// In-memory tile pyramid, handy for tests and for staging small merges.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    tiles: BTreeMap<TmsTile, Vec<u8>>,
    max_zoom: Option<u8>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tile: TmsTile, data: Vec<u8>) {
        self.tiles.insert(tile, data);
    }

    pub fn set_max_zoom(&mut self, zoom: Option<u8>) {
        self.max_zoom = zoom;
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

impl TileStore for MemoryStore {
    fn get_tile(&self, tile: TmsTile) -> Result<Option<Vec<u8>>> {
        Ok(self.tiles.get(&tile).cloned())
    }

    fn tile_coords_at_zoom(&self, zoom: u8) -> Result<Vec<TmsTile>> {
        Ok(self.tiles.keys().filter(|t| t.z == zoom).copied().collect())
    }

    fn max_zoom(&self) -> Result<Option<u8>> {
        Ok(self.max_zoom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tile(z: u8, x: u32, y: u32) -> TmsTile {
        TmsTile::new(z, x, y).unwrap()
    }

    #[test]
    fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = MbTiles::open(dir.path().join("nope.mbtiles"));
        assert!(matches!(result, Err(MergeError::MissingInput(_))));
    }

    #[test]
    fn test_upsert_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.mbtiles");
        let store = MbTiles::create(&path).unwrap();

        store.upsert_tile(tile(1, 0, 1), b"first").unwrap();
        store.upsert_tile(tile(1, 0, 1), b"second").unwrap();
        store.upsert_tile(tile(1, 1, 1), b"second").unwrap();
        store.set_metadata("maxzoom", "1").unwrap();
        drop(store);

        let store = MbTiles::open(&path).unwrap();
        assert_eq!(
            store.get_tile(tile(1, 0, 1)).unwrap().as_deref(),
            Some(&b"second"[..])
        );
        assert!(store.get_tile(tile(1, 1, 0)).unwrap().is_none());
        assert_eq!(store.tile_count_at_zoom(1).unwrap(), 2);
        assert_eq!(store.max_zoom().unwrap(), Some(1));
        assert_eq!(store.zoom_levels().unwrap(), vec![1]);
    }

    #[test]
    fn test_prune_orphans_and_dedup() {
        let dir = TempDir::new().unwrap();
        let mut store = MbTiles::create(dir.path().join("out.mbtiles")).unwrap();
        store
            .upsert_batch(vec![
                (tile(2, 0, 0), b"a".to_vec()),
                (tile(2, 0, 1), b"a".to_vec()),
                (tile(2, 0, 2), b"b".to_vec()),
            ])
            .unwrap();
        // overwrite the only reference to "b"
        store.upsert_tile(tile(2, 0, 2), b"a").unwrap();
        assert_eq!(store.prune_orphans().unwrap(), 1);
        assert_eq!(store.prune_orphans().unwrap(), 0);
    }

    #[test]
    fn test_unparseable_maxzoom() {
        let dir = TempDir::new().unwrap();
        let store = MbTiles::create(dir.path().join("m.mbtiles")).unwrap();
        store.set_metadata("maxzoom", "lots").unwrap();
        store.set_metadata("maxzoom", "twelve").unwrap();
        assert_eq!(store.max_zoom().unwrap(), None);
        assert_eq!(store.metadata().unwrap().len(), 1);
    }

    #[test]
    fn test_content_id_is_stable() {
        assert_eq!(content_id(b"abc"), content_id(b"abc"));
        assert_ne!(content_id(b"abc"), content_id(b"abd"));
        assert_eq!(content_id(b"").len(), 64);
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::new();
        store.insert(tile(0, 0, 0), vec![1]);
        store.insert(tile(1, 1, 0), vec![2]);
        assert_eq!(store.tile_coords_at_zoom(1).unwrap(), vec![tile(1, 1, 0)]);
        assert_eq!(store.get_tile(tile(0, 0, 0)).unwrap(), Some(vec![1]));
    }
}
