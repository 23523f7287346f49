use bincode::{deserialize_from, serialize_into};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use uuid::Uuid;

use crate::sheet::Sheet;

/// The in-memory sheet collection, persisted as one gzip-compressed bincode
/// snapshot. The whole store is rewritten after every mutation while the
/// caller still holds the store lock, so a snapshot is never partial.
pub type SheetStore = HashMap<Uuid, Sheet>;

pub fn save_store(store: &SheetStore, path: &Path) -> std::io::Result<()> {
    let file = File::create(path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut writer = std::io::BufWriter::new(encoder);

    serialize_into(&mut writer, store)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    Ok(())
}

pub fn load_store(path: &Path) -> std::io::Result<SheetStore> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(file);
    let mut reader = std::io::BufReader::new(decoder);

    let store: SheetStore = deserialize_from(&mut reader)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    Ok(store)
}

/// Startup helper: an absent snapshot file is a fresh install, not an error.
pub fn load_or_default(path: &Path) -> std::io::Result<SheetStore> {
    if path.exists() {
        load_store(path)
    } else {
        Ok(SheetStore::new())
    }
}
