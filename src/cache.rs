use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::geocoder::{GeocodeResult, ProviderKind};

#[derive(Debug, Deserialize)]
struct CacheRow {
    address: Option<String>,
    lat: Option<String>,
    lon: Option<String>,
    source: Option<String>,
    raw_json: Option<String>,
}

#[derive(Debug, Serialize)]
struct CacheRowOut<'a> {
    address: &'a str,
    lat: f64,
    lon: f64,
    source: &'a str,
    raw_json: String,
}

/// Address → coordinates store backed by a CSV file.
///
/// Only lookups that produced both coordinates are ever kept, so a missing
/// key means "never found" and the address is retried on the next run.
#[derive(Debug, Default)]
pub struct GeoCache {
    path: Option<PathBuf>,
    entries: HashMap<String, GeocodeResult>,
}

impl GeoCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the cache at `path`. A missing file is an empty cache; rows that
    /// cannot be read back are dropped.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut cache = Self {
            path: Some(path.clone()),
            entries: HashMap::new(),
        };

        let mut reader = match csv::ReaderBuilder::new().flexible(true).from_path(&path) {
            Ok(reader) => reader,
            Err(err) if is_not_found(&err) => {
                debug!(target: "geocode_cache", path = %path.display(), "no cache file yet");
                return Ok(cache);
            }
            Err(err) => return Err(AppError::Csv(err)),
        };

        let mut skipped = 0_usize;
        for row in reader.deserialize::<CacheRow>() {
            match row.ok().and_then(parse_row) {
                Some((address, result)) => {
                    cache.entries.insert(address, result);
                }
                None => skipped += 1,
            }
        }

        info!(
            target: "geocode_cache",
            path = %path.display(),
            entries = cache.entries.len(),
            skipped,
            "geocode cache loaded"
        );
        Ok(cache)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&GeocodeResult> {
        self.entries.get(key)
    }

    /// Stores `result` under `key` unless it lacks coordinates. Returns whether it was stored.
    pub fn put(&mut self, key: impl Into<String>, result: GeocodeResult) -> bool {
        if !result.is_found() {
            return false;
        }
        self.entries.insert(key.into(), result);
        true
    }

    /// Writes every entry to a sibling temp file, then renames it over the target.
    pub fn save(&self) -> AppResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = temp_path(path);
        {
            let mut writer = csv::Writer::from_path(&tmp_path)?;
            let mut keys: Vec<&String> = self.entries.keys().collect();
            keys.sort();
            for key in keys {
                let result = &self.entries[key];
                let Some((lat, lon)) = result.coordinates() else {
                    continue;
                };
                writer.serialize(CacheRowOut {
                    address: key,
                    lat,
                    lon,
                    source: result.provider(),
                    raw_json: serde_json::to_string(result.raw())?,
                })?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp_path, path)?;

        debug!(
            target: "geocode_cache",
            path = %path.display(),
            entries = self.entries.len(),
            "geocode cache saved"
        );
        Ok(())
    }
}

fn parse_row(row: CacheRow) -> Option<(String, GeocodeResult)> {
    let address = row.address?.trim().to_string();
    if address.is_empty() {
        return None;
    }
    let lat = row.lat?.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
    let lon = row.lon?.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
    let source = row
        .source
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| ProviderKind::Nominatim.as_str().to_string());
    let raw = match row.raw_json.filter(|text| !text.trim().is_empty()) {
        Some(text) => serde_json::from_str::<Value>(&text)
            .unwrap_or_else(|_| json!({ "_raw_json_parse_error": text })),
        None => json!({}),
    };
    Some((address, GeocodeResult::found(source, lat, lon, raw)))
}

fn is_not_found(err: &csv::Error) -> bool {
    matches!(err.kind(), csv::ErrorKind::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("geocode_cache.csv"));
    name.push(".tmp");
    path.with_file_name(name)
}
