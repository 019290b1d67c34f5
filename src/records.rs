use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::fallback::{FallbackGeocoder, ResolutionSource};
use crate::geocoder::Geocoder;
use crate::normalize::{detect_postal_code, normalize_space, to_half_width};
use crate::review::{ReviewEntry, ReviewLog};

pub const LAT_OUTPUT_COLUMN: &str = "緯度";
pub const LON_OUTPUT_COLUMN: &str = "経度";

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// Header names the augmenter looks for, in priority order.
#[derive(Debug, Clone)]
pub struct ColumnLayout {
    pub address_candidates: Vec<String>,
    /// Prefecture, city, block and building columns joined when no address column exists.
    pub component_groups: Vec<Vec<String>>,
    pub postal_columns: Vec<String>,
    pub lat_aliases: Vec<String>,
    pub lon_aliases: Vec<String>,
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self {
            address_candidates: owned(&[
                "住所", "所在地", "Address", "address", "所在地住所", "住所1", "住所２", "住所2",
                "所在地1", "所在地2",
            ]),
            component_groups: vec![
                owned(&["都道府県", "pref", "prefecture", "都"]),
                owned(&["市区町村", "city", "区市町村", "市", "区", "町", "村"]),
                owned(&[
                    "町名", "番地", "丁目", "地番", "番", "号", "町域", "大字", "小字", "丁",
                ]),
                owned(&["建物名", "ビル名", "マンション名", "建屋", "建物", "号室", "階"]),
            ],
            postal_columns: owned(&[
                "郵便番号", "郵便", "郵便No", "Zip", "ZIP", "PostCode", "Postcode", "PostalCode",
                "postal_code",
            ]),
            lat_aliases: owned(&[LAT_OUTPUT_COLUMN, "lat", "latitude", "緯度(度)"]),
            lon_aliases: owned(&[LON_OUTPUT_COLUMN, "lon", "lng", "longitude", "経度(度)"]),
        }
    }
}

fn matches_any(header: &str, names: &[String]) -> bool {
    names
        .iter()
        .any(|name| name == header || name.to_lowercase() == header.to_lowercase())
}

fn indices_matching(headers: &[String], names: &[String]) -> Vec<usize> {
    headers
        .iter()
        .enumerate()
        .filter(|(_, header)| matches_any(header, names))
        .map(|(index, _)| index)
        .collect()
}

/// First exact match in candidate order, then the first case-insensitive one.
pub fn detect_address_column(headers: &[String], candidates: &[String]) -> Option<usize> {
    candidates
        .iter()
        .find_map(|name| headers.iter().position(|header| header == name))
        .or_else(|| {
            candidates.iter().find_map(|name| {
                let name = name.to_lowercase();
                headers
                    .iter()
                    .position(|header| header.to_lowercase() == name)
            })
        })
}

#[derive(Debug, Clone)]
struct ResolvedLayout {
    address: Option<usize>,
    components: Vec<Vec<usize>>,
    postal: Vec<usize>,
    lat: usize,
    lon: usize,
    existing_lat: Option<usize>,
    existing_lon: Option<usize>,
    appended: Vec<String>,
}

impl ResolvedLayout {
    fn new(headers: &[String], layout: &ColumnLayout) -> Self {
        let existing_lat = indices_matching(headers, &layout.lat_aliases).first().copied();
        let existing_lon = indices_matching(headers, &layout.lon_aliases).first().copied();

        let mut appended = Vec::new();
        let mut next_index = headers.len();
        let mut output_slot = |existing: Option<usize>, name: &str| {
            existing.unwrap_or_else(|| {
                appended.push(name.to_string());
                next_index += 1;
                next_index - 1
            })
        };
        let lat = output_slot(existing_lat, LAT_OUTPUT_COLUMN);
        let lon = output_slot(existing_lon, LON_OUTPUT_COLUMN);

        Self {
            address: detect_address_column(headers, &layout.address_candidates),
            components: layout
                .component_groups
                .iter()
                .map(|group| indices_matching(headers, group))
                .collect(),
            postal: indices_matching(headers, &layout.postal_columns),
            lat,
            lon,
            existing_lat,
            existing_lon,
            appended,
        }
    }

    fn address(&self, row: &[String]) -> String {
        let cell = |index: usize| row.get(index).map(|value| normalize_space(&to_half_width(value)));
        if let Some(index) = self.address {
            return cell(index).unwrap_or_default();
        }
        self.components
            .iter()
            .filter_map(|group| {
                group
                    .iter()
                    .filter_map(|index| cell(*index))
                    .find(|value| !value.is_empty())
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn postal_code(&self, row: &[String]) -> Option<String> {
        self.postal
            .iter()
            .filter_map(|index| row.get(*index))
            .find_map(|value| detect_postal_code(value))
    }

    fn existing_coordinates(&self, row: &[String]) -> Option<(f64, f64)> {
        let parse = |index: Option<usize>| {
            row.get(index?)
                .and_then(|value| value.trim().parse::<f64>().ok())
        };
        parse(self.existing_lat).zip(parse(self.existing_lon))
    }
}

#[derive(Debug, Clone)]
pub struct EnrichProgress {
    pub total_rows: usize,
    pub processed: usize,
    pub resolved: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichStats {
    pub total_rows: usize,
    pub skipped_existing: usize,
    pub skipped_empty: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub cache_hits: usize,
}

pub type ProgressObserver = Arc<dyn Fn(EnrichProgress) + Send + Sync>;

/// Adds coordinates to a CSV table, filling only cells that are still blank.
pub struct CsvEnricher {
    layout: ColumnLayout,
    origin: String,
}

impl Default for CsvEnricher {
    fn default() -> Self {
        Self::new(ColumnLayout::default())
    }
}

impl CsvEnricher {
    pub fn new(layout: ColumnLayout) -> Self {
        Self {
            layout,
            origin: "csv".to_string(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub async fn enrich_file<G: Geocoder>(
        &self,
        input: &Path,
        output: &Path,
        geocoder: &mut FallbackGeocoder<G>,
        review: Option<&ReviewLog>,
        observer: Option<ProgressObserver>,
    ) -> AppResult<EnrichStats> {
        let reader = File::open(input)
            .map_err(|err| AppError::Path(format!("{}: {err}", input.display())))?;
        let writer = File::create(output)?;
        self.enrich(reader, writer, geocoder, review, observer).await
    }

    pub async fn enrich<R: Read, W: Write, G: Geocoder>(
        &self,
        input: R,
        output: W,
        geocoder: &mut FallbackGeocoder<G>,
        review: Option<&ReviewLog>,
        observer: Option<ProgressObserver>,
    ) -> AppResult<EnrichStats> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(input);
        let headers = reader
            .headers()?
            .iter()
            .map(|header| header.trim_start_matches('\u{feff}').trim().to_string())
            .collect::<Vec<_>>();
        let rows = reader
            .records()
            .map(|record| record.map(|r| r.iter().map(str::to_string).collect::<Vec<_>>()))
            .collect::<Result<Vec<_>, _>>()?;

        let resolved_layout = ResolvedLayout::new(&headers, &self.layout);
        if resolved_layout.address.is_none()
            && resolved_layout.components.iter().all(Vec::is_empty)
        {
            warn!(?headers, "no address or address-component columns found");
        }
        let width = headers.len() + resolved_layout.appended.len();

        let mut writer = csv::Writer::from_writer(output);
        let mut header_out = headers.clone();
        header_out.extend(resolved_layout.appended.iter().cloned());
        writer.write_record(&header_out)?;

        let total_rows = rows.len();
        let mut stats = EnrichStats {
            total_rows,
            ..EnrichStats::default()
        };
        info!(total_rows, origin = %self.origin, "csv enrichment started");

        for (index, mut row) in rows.into_iter().enumerate() {
            if row.len() < width {
                row.resize(width, String::new());
            }
            self.fill_row(&mut row, index, &resolved_layout, geocoder, review, &mut stats)
                .await?;
            writer.write_record(&row)?;

            if let Some(callback) = &observer {
                callback(EnrichProgress {
                    total_rows,
                    processed: index + 1,
                    resolved: stats.resolved,
                });
            }
        }
        writer.flush()?;

        info!(
            resolved = stats.resolved,
            unresolved = stats.unresolved,
            skipped_existing = stats.skipped_existing,
            skipped_empty = stats.skipped_empty,
            "csv enrichment finished"
        );
        Ok(stats)
    }

    async fn fill_row<G: Geocoder>(
        &self,
        row: &mut [String],
        index: usize,
        layout: &ResolvedLayout,
        geocoder: &mut FallbackGeocoder<G>,
        review: Option<&ReviewLog>,
        stats: &mut EnrichStats,
    ) -> AppResult<()> {
        if layout.existing_coordinates(row).is_some() {
            stats.skipped_existing += 1;
            return Ok(());
        }

        let address = layout.address(row);
        if address.is_empty() {
            stats.skipped_empty += 1;
            return Ok(());
        }
        let postal = layout.postal_code(row);

        let resolution = geocoder
            .resolve_with_source(&address, postal.as_deref())
            .await;
        if let Some((lat, lon)) = resolution.result.coordinates() {
            row[layout.lat] = lat.to_string();
            row[layout.lon] = lon.to_string();
            stats.resolved += 1;
            if resolution.source == ResolutionSource::Cache {
                stats.cache_hits += 1;
            }
            return Ok(());
        }

        stats.unresolved += 1;
        // Header is line 1.
        let line = index + 2;
        debug!(line, address = %address, "row left blank");
        if let Some(review) = review {
            review.record(ReviewEntry::new(
                self.origin.clone(),
                line.to_string(),
                address,
                postal,
                resolution.result.note().unwrap_or("unresolved"),
            ))?;
        }
        Ok(())
    }
}
