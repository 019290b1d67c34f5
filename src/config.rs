use std::{env, io};

use serde::Serialize;
use tracing::{debug, warn};

use crate::geocoder::ProviderKind;

const DEFAULT_REVIEW_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_REVIEW_BUFFER_MAX_FILES: usize = 5;
const DEFAULT_PROVIDER_ORDER: &str = "gsi,geocoding_jp,nominatim";
const PUBLIC_NOMINATIM_HOST: &str = "nominatim.openstreetmap.org";
const PUBLIC_NOMINATIM_MIN_INTERVAL_MS: u64 = 1_000;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub user_agent: String,
    pub contact_email: Option<String>,
    pub accept_language: Option<String>,
    pub country_codes: Option<String>,
    pub nominatim_endpoint: String,
    pub gsi_endpoint: String,
    pub geocoding_jp_endpoint: String,
    pub csis_endpoint: String,
    pub nominatim_min_interval_ms: u64,
    pub gsi_min_interval_ms: u64,
    pub geocoding_jp_min_interval_ms: u64,
    pub csis_min_interval_ms: u64,
    pub http_timeout_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_base_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub provider_order: Vec<ProviderKind>,
    pub review_batch_size: usize,
    pub review_buffer_max_bytes: u64,
    pub review_buffer_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub user_agent: String,
    pub has_contact_email: bool,
    pub accept_language: Option<String>,
    pub country_codes: Option<String>,
    pub nominatim_endpoint: String,
    pub gsi_endpoint: String,
    pub geocoding_jp_endpoint: String,
    pub csis_endpoint: String,
    pub nominatim_min_interval_ms: u64,
    pub gsi_min_interval_ms: u64,
    pub geocoding_jp_min_interval_ms: u64,
    pub csis_min_interval_ms: u64,
    pub http_timeout_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_base_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub provider_order: Vec<&'static str>,
    pub review_batch_size: usize,
    pub review_buffer_max_bytes: u64,
    pub review_buffer_max_files: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let nominatim_endpoint = env::var("NOMINATIM_URL")
            .unwrap_or_else(|_| ProviderKind::Nominatim.default_endpoint().to_string());
        let nominatim_min_interval_ms = clamp_public_interval(
            &nominatim_endpoint,
            parse_u64(
                "NOMINATIM_MIN_INTERVAL_MS",
                ProviderKind::Nominatim.default_min_interval_ms(),
            ),
        );

        Self {
            user_agent: non_empty_var("GEOFILL_USER_AGENT")
                .unwrap_or_else(|| format!("geofill/{}", env!("CARGO_PKG_VERSION"))),
            contact_email: non_empty_var("GEO_EMAIL"),
            accept_language: optional_with_default("GEOCODE_LANGUAGE", "ja"),
            country_codes: optional_with_default("GEOCODE_COUNTRYCODES", "jp"),
            nominatim_endpoint,
            gsi_endpoint: env::var("GSI_URL")
                .unwrap_or_else(|_| ProviderKind::Gsi.default_endpoint().to_string()),
            geocoding_jp_endpoint: env::var("GEOCODING_JP_URL")
                .unwrap_or_else(|_| ProviderKind::GeocodingJp.default_endpoint().to_string()),
            csis_endpoint: env::var("CSIS_URL")
                .unwrap_or_else(|_| ProviderKind::Csis.default_endpoint().to_string()),
            nominatim_min_interval_ms,
            gsi_min_interval_ms: parse_u64(
                "GSI_MIN_INTERVAL_MS",
                ProviderKind::Gsi.default_min_interval_ms(),
            ),
            geocoding_jp_min_interval_ms: parse_u64(
                "GEOCODING_JP_MIN_INTERVAL_MS",
                ProviderKind::GeocodingJp.default_min_interval_ms(),
            ),
            csis_min_interval_ms: parse_u64(
                "CSIS_MIN_INTERVAL_MS",
                ProviderKind::Csis.default_min_interval_ms(),
            ),
            http_timeout_secs: parse_u64("GEOCODE_HTTP_TIMEOUT_SECS", 30).max(1),
            retry_max_attempts: parse_u32("GEOCODE_MAX_ATTEMPTS", 5).max(1),
            retry_base_backoff_ms: parse_u64("GEOCODE_BACKOFF_BASE_MS", 1_200),
            retry_max_backoff_ms: parse_u64("GEOCODE_BACKOFF_MAX_MS", 60_000),
            provider_order: parse_providers(
                &env::var("GEOCODE_PROVIDERS").unwrap_or_else(|_| DEFAULT_PROVIDER_ORDER.into()),
            ),
            review_batch_size: parse_usize("REVIEW_BATCH_SIZE", 25).max(1),
            review_buffer_max_bytes: parse_u64(
                "REVIEW_BUFFER_MAX_BYTES",
                DEFAULT_REVIEW_BUFFER_MAX_BYTES,
            ),
            review_buffer_max_files: parse_usize(
                "REVIEW_BUFFER_MAX_FILES",
                DEFAULT_REVIEW_BUFFER_MAX_FILES,
            )
            .max(1),
        }
    }

    /// Identifying user agent, with the contact address appended when one is configured.
    pub fn user_agent_header(&self) -> String {
        match &self.contact_email {
            Some(email) => format!("{} contact:{email}", self.user_agent),
            None => self.user_agent.clone(),
        }
    }

    pub fn endpoint_for(&self, kind: ProviderKind) -> &str {
        match kind {
            ProviderKind::Nominatim => &self.nominatim_endpoint,
            ProviderKind::Gsi => &self.gsi_endpoint,
            ProviderKind::GeocodingJp => &self.geocoding_jp_endpoint,
            ProviderKind::Csis => &self.csis_endpoint,
        }
    }

    pub fn min_interval_ms_for(&self, kind: ProviderKind) -> u64 {
        match kind {
            ProviderKind::Nominatim => self.nominatim_min_interval_ms,
            ProviderKind::Gsi => self.gsi_min_interval_ms,
            ProviderKind::GeocodingJp => self.geocoding_jp_min_interval_ms,
            ProviderKind::Csis => self.csis_min_interval_ms,
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            user_agent: self.user_agent.clone(),
            has_contact_email: self.contact_email.is_some(),
            accept_language: self.accept_language.clone(),
            country_codes: self.country_codes.clone(),
            nominatim_endpoint: self.nominatim_endpoint.clone(),
            gsi_endpoint: self.gsi_endpoint.clone(),
            geocoding_jp_endpoint: self.geocoding_jp_endpoint.clone(),
            csis_endpoint: self.csis_endpoint.clone(),
            nominatim_min_interval_ms: self.nominatim_min_interval_ms,
            gsi_min_interval_ms: self.gsi_min_interval_ms,
            geocoding_jp_min_interval_ms: self.geocoding_jp_min_interval_ms,
            csis_min_interval_ms: self.csis_min_interval_ms,
            http_timeout_secs: self.http_timeout_secs,
            retry_max_attempts: self.retry_max_attempts,
            retry_base_backoff_ms: self.retry_base_backoff_ms,
            retry_max_backoff_ms: self.retry_max_backoff_ms,
            provider_order: self.provider_order.iter().map(|p| p.as_str()).collect(),
            review_batch_size: self.review_batch_size,
            review_buffer_max_bytes: self.review_buffer_max_bytes,
            review_buffer_max_files: self.review_buffer_max_files,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

// The public instance's usage policy forbids more than one request per second.
fn clamp_public_interval(endpoint: &str, interval_ms: u64) -> u64 {
    if endpoint.contains(PUBLIC_NOMINATIM_HOST) && interval_ms < PUBLIC_NOMINATIM_MIN_INTERVAL_MS {
        warn!(
            interval_ms,
            "public Nominatim requires at least one second between requests; clamping"
        );
        PUBLIC_NOMINATIM_MIN_INTERVAL_MS
    } else {
        interval_ms
    }
}

pub(crate) fn parse_providers(value: &str) -> Vec<ProviderKind> {
    let mut providers = Vec::new();
    for tag in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match ProviderKind::parse(tag) {
            Ok(kind) if !providers.contains(&kind) => providers.push(kind),
            Ok(_) => {}
            Err(err) => warn!(%err, "ignoring unknown provider in GEOCODE_PROVIDERS"),
        }
    }
    if providers.is_empty() {
        providers = vec![ProviderKind::Gsi, ProviderKind::GeocodingJp, ProviderKind::Nominatim];
    }
    providers
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// Unset falls back to the default; set-but-empty disables the hint.
fn optional_with_default(key: &str, default: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if value.trim().is_empty() => None,
        Ok(value) => Some(value.trim().to_string()),
        Err(_) => Some(default.to_string()),
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}
