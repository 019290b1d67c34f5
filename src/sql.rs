//! Rewrites `INSERT INTO <table> (...) VALUES (...), ...;` statements in a SQL
//! dump so every tuple carries `lat`/`lng` values.
//!
//! Only the statements for configured tables are touched; every other byte of
//! the script is copied through. The tokenizers work on bytes because all the
//! delimiters are ASCII, which keeps slicing on UTF-8 boundaries.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::fallback::FallbackGeocoder;
use crate::geocoder::Geocoder;
use crate::review::{ReviewEntry, ReviewLog};

pub const ADDRESS_COLUMN: &str = "address";
pub const LAT_COLUMN: &str = "lat";
pub const LNG_COLUMN: &str = "lng";

static NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[+-]?(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][+-]?\d+)?$").unwrap()
});

static COLUMN_LIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\(\s*([^)]+?)\s*\)\s*VALUES").unwrap());

/// One literal from a VALUES tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    /// Numeric literal, kept as written.
    Number(String),
    /// Unescaped string contents.
    Text(String),
    /// Anything else (function calls, keywords), kept as written.
    Raw(String),
}

impl SqlValue {
    pub fn to_sql(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Number(text) | SqlValue::Raw(text) => text.clone(),
            SqlValue::Text(text) => format!("'{}'", text.replace('\'', "''")),
        }
    }

    pub fn coordinate(value: f64) -> Self {
        SqlValue::Number(value.to_string())
    }

    fn is_blank(&self) -> bool {
        match self {
            SqlValue::Null => true,
            SqlValue::Text(text) => text.is_empty(),
            _ => false,
        }
    }
}

/// Index of the quote closing the string literal that opens at `start`.
fn closing_quote(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                i += 2;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

fn classify(token: &str) -> SqlValue {
    let token = token.trim();
    if token.is_empty() || token.eq_ignore_ascii_case("NULL") {
        return SqlValue::Null;
    }
    let bytes = token.as_bytes();
    if bytes[0] == b'\'' && closing_quote(bytes, 0) == Some(bytes.len() - 1) {
        return SqlValue::Text(token[1..token.len() - 1].replace("''", "'"));
    }
    if NUMBER.is_match(token) {
        return SqlValue::Number(token.to_string());
    }
    SqlValue::Raw(token.to_string())
}

/// Tokenizes one `( ... )` tuple.
pub fn parse_values_row(row: &str) -> AppResult<Vec<SqlValue>> {
    let row = row.trim();
    let inner = row
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| AppError::Parse(format!("tuple is not parenthesized: {}", preview(row))))?;

    let bytes = inner.as_bytes();
    let mut values = Vec::new();
    let mut token_start = 0;
    let mut depth = 0_usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                i = closing_quote(bytes, i).ok_or_else(|| {
                    AppError::Parse(format!("unclosed string literal in {}", preview(row)))
                })?;
            }
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                values.push(classify(&inner[token_start..i]));
                token_start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    values.push(classify(&inner[token_start..]));
    Ok(values)
}

/// Splits a VALUES section into its top-level `( ... )` tuples.
pub fn split_value_tuples(section: &str) -> AppResult<Vec<&str>> {
    let bytes = section.as_bytes();
    let mut tuples = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'(' {
            i += 1;
            continue;
        }
        let start = i;
        let mut depth = 0_usize;
        let mut end = None;
        while i < bytes.len() {
            match bytes[i] {
                b'\'' => {
                    i = closing_quote(bytes, i).ok_or_else(|| {
                        AppError::Parse(format!(
                            "unclosed string literal in {}",
                            preview(&section[start..])
                        ))
                    })?;
                }
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i + 1);
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        let end = end.ok_or_else(|| {
            AppError::Parse(format!("unterminated tuple: {}", preview(&section[start..])))
        })?;
        tuples.push(&section[start..end]);
        i = end;
    }
    Ok(tuples)
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect()
}

fn bare_column_name(column: &str) -> String {
    column
        .trim()
        .trim_matches(|c| c == '`' || c == '"')
        .trim()
        .to_ascii_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CoordinateSlots {
    address: usize,
    lat: usize,
    lng: usize,
}

/// A single parsed INSERT statement, without its terminating `;`.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    head: String,
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
}

impl InsertStatement {
    /// Returns `None` when the text has no `(columns) VALUES` shape.
    pub fn parse(statement: &str) -> AppResult<Option<Self>> {
        let Some(caps) = COLUMN_LIST.captures(statement) else {
            return Ok(None);
        };
        let (Some(whole), Some(list)) = (caps.get(0), caps.get(1)) else {
            return Ok(None);
        };
        let columns = list
            .as_str()
            .split(',')
            .map(|column| column.trim().to_string())
            .collect();
        let rows = split_value_tuples(&statement[whole.end()..])?
            .into_iter()
            .map(parse_values_row)
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Some(Self {
            head: statement[..whole.start()].to_string(),
            columns,
            rows,
        }))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<SqlValue>] {
        &self.rows
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| bare_column_name(column) == name)
    }

    /// Makes sure `lat`/`lng` exist, inserting them right after `pivot` (or
    /// after `address` when the pivot is absent). `None` without an address column.
    fn ensure_coordinate_columns(&mut self, pivot: &str) -> Option<CoordinateSlots> {
        let address = self.column_index(ADDRESS_COLUMN)?;
        if let (Some(lat), Some(lng)) = (
            self.column_index(LAT_COLUMN),
            self.column_index(LNG_COLUMN),
        ) {
            return Some(CoordinateSlots { address, lat, lng });
        }

        let at = self
            .column_index(&pivot.to_ascii_lowercase())
            .unwrap_or(address)
            + 1;
        self.columns.insert(at, LAT_COLUMN.to_string());
        self.columns.insert(at + 1, LNG_COLUMN.to_string());
        for row in &mut self.rows {
            let at = at.min(row.len());
            row.insert(at, SqlValue::Null);
            row.insert(at + 1, SqlValue::Null);
        }
        let address = if address >= at { address + 2 } else { address };
        Some(CoordinateSlots {
            address,
            lat: at,
            lng: at + 1,
        })
    }

    pub fn render(&self) -> String {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let values = row.iter().map(SqlValue::to_sql).collect::<Vec<_>>();
                format!("({})", values.join(", "))
            })
            .collect::<Vec<_>>();
        format!(
            "{}({}) VALUES\n  {}",
            self.head,
            self.columns.join(", "),
            rows.join(",\n  ")
        )
    }
}

/// Which table to rewrite and which column `lat`/`lng` should follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRule {
    pub table: String,
    pub pivot: String,
}

impl TableRule {
    pub fn new(table: impl Into<String>, pivot: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            pivot: pivot.into(),
        }
    }

    /// Parses `TABLE=PIVOT`.
    pub fn parse(spec: &str) -> AppResult<Self> {
        match spec.split_once('=') {
            Some((table, pivot)) if !table.trim().is_empty() && !pivot.trim().is_empty() => {
                Ok(Self::new(table.trim(), pivot.trim()))
            }
            _ => Err(AppError::Config(format!(
                "table rule must look like TABLE=PIVOT, got {spec:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RewriteStats {
    pub statements: usize,
    pub malformed: usize,
    pub rows: usize,
    pub skipped_existing: usize,
    pub skipped_empty: usize,
    pub filled: usize,
    pub unresolved: usize,
}

pub struct SqlRewriter {
    tables: Vec<TableRule>,
    origin: String,
}

impl Default for SqlRewriter {
    fn default() -> Self {
        Self::new(vec![
            TableRule::new("TRAVEL_SPOT", "url"),
            TableRule::new("GMAPM", "homepage"),
        ])
    }
}

impl SqlRewriter {
    pub fn new(tables: Vec<TableRule>) -> Self {
        Self {
            tables,
            origin: "sql".to_string(),
        }
    }

    /// Label written to review entries, usually the input file name.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn tables(&self) -> &[TableRule] {
        &self.tables
    }

    fn head_pattern(&self) -> AppResult<Regex> {
        let names = self
            .tables
            .iter()
            .map(|rule| regex::escape(&rule.table))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r#"(?i)INSERT\s+INTO\s+[`"]?({names})[`"]?\s*\("#))
            .map_err(|err| AppError::Config(format!("invalid table list: {err}")))
    }

    fn pivot_for(&self, table: &str) -> &str {
        self.tables
            .iter()
            .find(|rule| rule.table.eq_ignore_ascii_case(table))
            .map(|rule| rule.pivot.as_str())
            .unwrap_or(ADDRESS_COLUMN)
    }

    /// Number of tuples in the statements this rewriter would touch.
    pub fn count_target_rows(&self, sql: &str) -> usize {
        let Ok(head) = self.head_pattern() else {
            return 0;
        };
        let mut rows = 0;
        let mut pos = 0;
        while let Some(found) = head.find_at(sql, pos) {
            let end = statement_end(sql, found.end());
            if let Ok(Some(insert)) = InsertStatement::parse(&sql[found.start()..end]) {
                rows += insert.rows.len();
            }
            pos = end;
        }
        rows
    }

    /// Rewrites every matching INSERT in `sql`, resolving addresses through `geocoder`.
    pub async fn rewrite_script<G: Geocoder>(
        &self,
        sql: &str,
        geocoder: &mut FallbackGeocoder<G>,
        review: Option<&ReviewLog>,
    ) -> AppResult<(String, RewriteStats)> {
        let mut stats = RewriteStats::default();
        if self.tables.is_empty() {
            return Ok((sql.to_string(), stats));
        }
        let head = self.head_pattern()?;
        let mut out = String::with_capacity(sql.len() + sql.len() / 8);
        let mut pos = 0;

        while let Some(caps) = head.captures_at(sql, pos) {
            let (Some(whole), Some(table)) = (caps.get(0), caps.get(1)) else {
                break;
            };
            let end = statement_end(sql, whole.end());
            out.push_str(&sql[pos..whole.start()]);
            stats.statements += 1;

            let statement = &sql[whole.start()..end];
            let pivot = self.pivot_for(table.as_str());
            match InsertStatement::parse(statement) {
                Ok(Some(mut insert)) => {
                    let label = table.as_str().to_ascii_uppercase();
                    let touched = self
                        .fill_statement(&mut insert, pivot, &label, geocoder, review, &mut stats)
                        .await?;
                    if touched {
                        out.push_str(&insert.render());
                    } else {
                        out.push_str(statement);
                    }
                }
                Ok(None) => out.push_str(statement),
                Err(err) => {
                    warn!(%err, table = table.as_str(), "leaving malformed INSERT unchanged");
                    stats.malformed += 1;
                    out.push_str(statement);
                }
            }
            pos = end;
        }
        out.push_str(&sql[pos..]);

        info!(
            statements = stats.statements,
            rows = stats.rows,
            filled = stats.filled,
            unresolved = stats.unresolved,
            "sql rewrite finished"
        );
        Ok((out, stats))
    }

    async fn fill_statement<G: Geocoder>(
        &self,
        insert: &mut InsertStatement,
        pivot: &str,
        table: &str,
        geocoder: &mut FallbackGeocoder<G>,
        review: Option<&ReviewLog>,
        stats: &mut RewriteStats,
    ) -> AppResult<bool> {
        let Some(slots) = insert.ensure_coordinate_columns(pivot) else {
            debug!(table, "no address column; statement kept as is");
            return Ok(false);
        };

        for (index, row) in insert.rows.iter_mut().enumerate() {
            stats.rows += 1;
            let need_lat = row.get(slots.lat).map_or(false, SqlValue::is_blank);
            let need_lng = row.get(slots.lng).map_or(false, SqlValue::is_blank);
            if !need_lat && !need_lng {
                stats.skipped_existing += 1;
                continue;
            }
            let address = match row.get(slots.address) {
                Some(SqlValue::Text(text)) if !text.trim().is_empty() => text.trim().to_string(),
                _ => {
                    stats.skipped_empty += 1;
                    continue;
                }
            };

            let result = geocoder.resolve(&address, None).await;
            match result.coordinates() {
                Some((lat, lng)) => {
                    if need_lat {
                        row[slots.lat] = SqlValue::coordinate(lat);
                    }
                    if need_lng {
                        row[slots.lng] = SqlValue::coordinate(lng);
                    }
                    stats.filled += 1;
                }
                None => {
                    stats.unresolved += 1;
                    if let Some(review) = review {
                        review.record(ReviewEntry::new(
                            self.origin.clone(),
                            format!("{table}#{}", index + 1),
                            address,
                            None,
                            result.note().unwrap_or("unresolved"),
                        ))?;
                    }
                }
            }
        }
        Ok(true)
    }
}

/// Byte offset of the `;` closing the statement whose column list opens just
/// before `from`, or the end of the script.
fn statement_end(sql: &str, from: usize) -> usize {
    let bytes = sql.as_bytes();
    let mut depth = 1_usize;
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => match closing_quote(bytes, i) {
                Some(close) => i = close,
                None => return bytes.len(),
            },
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b';' if depth == 0 => return i,
            _ => {}
        }
        i += 1;
    }
    bytes.len()
}
