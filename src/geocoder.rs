use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::header::{ACCEPT_LANGUAGE, RETRY_AFTER};
use reqwest::{Client, Response, Url};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::rate_limit::RateLimiter;

const TRANSIENT_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// The geocoding backends this crate knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenStreetMap Nominatim search.
    Nominatim,
    /// Geospatial Information Authority of Japan address search. Addresses only.
    Gsi,
    /// geocoding.jp, which also resolves landmark and facility names.
    GeocodingJp,
    /// CSIS simple geocoding service of the University of Tokyo.
    Csis,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Nominatim => "nominatim",
            ProviderKind::Gsi => "gsi",
            ProviderKind::GeocodingJp => "geocoding_jp",
            ProviderKind::Csis => "csis",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "nominatim" | "osm" => Ok(ProviderKind::Nominatim),
            "gsi" => Ok(ProviderKind::Gsi),
            "geocoding_jp" | "geocodingjp" => Ok(ProviderKind::GeocodingJp),
            "csis" => Ok(ProviderKind::Csis),
            _ => Err(AppError::Config(format!("unknown geocoding provider: {value}"))),
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderKind::Nominatim => "https://nominatim.openstreetmap.org/search",
            ProviderKind::Gsi => "https://msearch.gsi.go.jp/address-search/AddressSearch",
            ProviderKind::GeocodingJp => "https://www.geocoding.jp/api/",
            ProviderKind::Csis => "https://geocode.csis.u-tokyo.ac.jp/cgi-bin/simple_geocode.cgi",
        }
    }

    pub fn default_min_interval_ms(&self) -> u64 {
        match self {
            ProviderKind::Nominatim => 1_000,
            ProviderKind::Gsi => 1_000,
            ProviderKind::GeocodingJp => 10_000,
            ProviderKind::Csis => 1_000,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one lookup. Absent coordinates mean "not found"; `raw` keeps
/// the provider payload (or a diagnostic note) for auditing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodeResult {
    latitude: Option<f64>,
    longitude: Option<f64>,
    provider: String,
    raw: Value,
}

impl GeocodeResult {
    pub fn found(provider: impl Into<String>, latitude: f64, longitude: f64, raw: Value) -> Self {
        Self {
            latitude: Some(latitude),
            longitude: Some(longitude),
            provider: provider.into(),
            raw,
        }
    }

    pub fn not_found(provider: impl Into<String>, note: &str) -> Self {
        Self {
            latitude: None,
            longitude: None,
            provider: provider.into(),
            raw: json!({ "note": note }),
        }
    }

    pub(crate) fn failed(provider: impl Into<String>, error: &str) -> Self {
        Self {
            latitude: None,
            longitude: None,
            provider: provider.into(),
            raw: json!({ "error": error }),
        }
    }

    pub fn latitude(&self) -> Option<f64> {
        self.latitude
    }

    pub fn longitude(&self) -> Option<f64> {
        self.longitude
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }

    pub fn is_found(&self) -> bool {
        self.coordinates().is_some()
    }

    /// Diagnostic attached to an absent result, if any.
    pub fn note(&self) -> Option<&str> {
        self.raw
            .get("note")
            .or_else(|| self.raw.get("error"))
            .and_then(Value::as_str)
    }
}

/// One geocoding backend. Implementations never fail: every problem becomes
/// an absent-coordinate result.
#[async_trait]
pub trait Geocoder: Send + Sync {
    fn provider(&self) -> ProviderKind;

    async fn geocode_once(&self, query: &str) -> GeocodeResult;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_backoff: Duration::from_millis(config.retry_base_backoff_ms),
            max_backoff: Duration::from_millis(config.retry_max_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(1_200),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Everything needed to build a [`GeocodeClient`] for one provider.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub endpoint: String,
    pub user_agent: String,
    pub accept_language: Option<String>,
    pub country_codes: Option<String>,
    pub contact_email: Option<String>,
    pub min_interval: Duration,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ProviderSettings {
    pub fn new(kind: ProviderKind, user_agent: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: kind.default_endpoint().to_string(),
            user_agent: user_agent.into(),
            accept_language: None,
            country_codes: None,
            contact_email: None,
            min_interval: Duration::from_millis(kind.default_min_interval_ms()),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(kind: ProviderKind, config: &AppConfig) -> Self {
        Self {
            kind,
            endpoint: config.endpoint_for(kind).to_string(),
            user_agent: config.user_agent_header(),
            accept_language: config.accept_language.clone(),
            country_codes: config.country_codes.clone(),
            contact_email: config.contact_email.clone(),
            min_interval: Duration::from_millis(config.min_interval_ms_for(kind)),
            timeout: Duration::from_secs(config.http_timeout_secs),
            retry: RetryPolicy::from_config(config),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.accept_language = language;
        self
    }

    pub fn with_country_codes(mut self, codes: Option<String>) -> Self {
        self.country_codes = codes;
        self
    }

    pub fn with_contact_email(mut self, email: Option<String>) -> Self {
        self.contact_email = email;
        self
    }
}

enum Failure {
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    Permanent(String),
}

/// HTTP client for a single provider, rate-limited and retrying transient errors.
pub struct GeocodeClient {
    http: Client,
    kind: ProviderKind,
    endpoint: Url,
    accept_language: Option<String>,
    country_codes: Option<String>,
    contact_email: Option<String>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    jitter_rng: Mutex<StdRng>,
}

impl GeocodeClient {
    pub fn new(settings: ProviderSettings) -> AppResult<Self> {
        let endpoint = Url::parse(&settings.endpoint).map_err(|err| {
            AppError::Config(format!(
                "invalid {} endpoint {}: {err}",
                settings.kind, settings.endpoint
            ))
        })?;
        let http = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.timeout)
            .build()?;

        Ok(Self {
            http,
            kind: settings.kind,
            endpoint,
            accept_language: settings.accept_language,
            country_codes: settings.country_codes,
            contact_email: settings.contact_email,
            limiter: RateLimiter::new(settings.min_interval),
            retry: settings.retry,
            jitter_rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    pub fn from_config(kind: ProviderKind, config: &AppConfig) -> AppResult<Self> {
        Self::new(ProviderSettings::from_config(kind, config))
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn request_url(&self, query: &str) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            if self.kind == ProviderKind::Csis {
                pairs.append_pair("charset", "UTF8").append_pair("addr", query);
            } else {
                pairs.append_pair("q", query);
            }
            if self.kind == ProviderKind::Nominatim {
                pairs
                    .append_pair("format", "jsonv2")
                    .append_pair("limit", "1")
                    .append_pair("addressdetails", "0");
                if let Some(codes) = &self.country_codes {
                    pairs.append_pair("countrycodes", codes);
                }
                if let Some(language) = &self.accept_language {
                    pairs.append_pair("accept-language", language);
                }
                if let Some(email) = &self.contact_email {
                    pairs.append_pair("email", email);
                }
            }
        }
        url
    }

    async fn fetch(&self, query: &str) -> Result<String, Failure> {
        let mut request = self.http.get(self.request_url(query));
        if let Some(language) = &self.accept_language {
            request = request.header(ACCEPT_LANGUAGE, language.as_str());
        }

        let response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        if TRANSIENT_STATUSES.contains(&status.as_u16()) {
            return Err(Failure::Transient {
                reason: format!("status {status}"),
                retry_after: retry_after(&response),
            });
        }
        if !status.is_success() {
            return Err(Failure::Permanent(format!("status {status}")));
        }

        response.text().await.map_err(classify_transport_error)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(6);
        let base = self.retry.base_backoff.saturating_mul(1 << exponent);
        let jitter_cap = (self.retry.base_backoff.as_millis() as u64 / 4).max(1);
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..jitter_cap))
        };
        (base + jitter).min(self.retry.max_backoff)
    }
}

#[async_trait]
impl Geocoder for GeocodeClient {
    fn provider(&self) -> ProviderKind {
        self.kind
    }

    async fn geocode_once(&self, query: &str) -> GeocodeResult {
        let query = query.trim();
        if query.is_empty() {
            return GeocodeResult::not_found(self.kind.as_str(), "empty_query");
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.wait_if_needed().await;
            let outcome = self.fetch(query).await;
            self.limiter.mark_completed().await;

            match outcome {
                Ok(body) => {
                    let result = parse_response(self.kind, &body);
                    debug!(
                        provider = %self.kind,
                        query,
                        found = result.is_found(),
                        "geocode response parsed"
                    );
                    return result;
                }
                Err(Failure::Transient {
                    reason,
                    retry_after,
                }) if attempt < self.retry.max_attempts => {
                    let delay = retry_after
                        .map(|hint| hint.min(self.retry.max_backoff))
                        .unwrap_or_else(|| self.backoff_delay(attempt));
                    warn!(
                        provider = %self.kind,
                        attempt,
                        %reason,
                        "transient geocoding failure; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(Failure::Transient { reason, .. }) => {
                    warn!(
                        provider = %self.kind,
                        attempt,
                        %reason,
                        query,
                        "geocoding retries exhausted"
                    );
                    return GeocodeResult::failed(self.kind.as_str(), "retries_exhausted");
                }
                Err(Failure::Permanent(reason)) => {
                    warn!(provider = %self.kind, %reason, query, "geocoding request failed");
                    return GeocodeResult::failed(self.kind.as_str(), "request_failed");
                }
            }
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> Failure {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Failure::Transient {
            reason: err.to_string(),
            retry_after: None,
        }
    } else {
        Failure::Permanent(err.to_string())
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Turns a successful response body into a result. Malformed payloads yield
/// an absent result tagged `parse_error`; empty result sets are `no_result`.
pub fn parse_response(kind: ProviderKind, body: &str) -> GeocodeResult {
    let parsed = match kind {
        ProviderKind::Nominatim => parse_nominatim(body),
        ProviderKind::Gsi => parse_gsi(body),
        ProviderKind::GeocodingJp => parse_geocoding_jp(body),
        ProviderKind::Csis => parse_csis(body),
    };
    match parsed {
        Ok(Some((lat, lon, raw))) => GeocodeResult::found(kind.as_str(), lat, lon, raw),
        Ok(None) => GeocodeResult::not_found(kind.as_str(), "no_result"),
        Err(err) => {
            warn!(provider = %kind, %err, "unparseable geocoding response");
            GeocodeResult::failed(kind.as_str(), "parse_error")
        }
    }
}

type Parsed = AppResult<Option<(f64, f64, Value)>>;

fn parse_nominatim(body: &str) -> Parsed {
    let value: Value = serde_json::from_str(body)?;
    let first = match value.as_array().and_then(|list| list.first()) {
        Some(first) => first,
        None if value.is_array() => return Ok(None),
        None => return Err(AppError::Parse("expected a JSON array".into())),
    };
    let lat = coordinate(first.get("lat")).ok_or_else(|| AppError::Parse("missing lat".into()))?;
    let lon = coordinate(first.get("lon")).ok_or_else(|| AppError::Parse("missing lon".into()))?;
    Ok(Some((lat, lon, first.clone())))
}

fn parse_gsi(body: &str) -> Parsed {
    let value: Value = serde_json::from_str(body)?;
    let first = match value.as_array().and_then(|list| list.first()) {
        Some(first) => first,
        None if value.is_array() => return Ok(None),
        None => return Err(AppError::Parse("expected a JSON array".into())),
    };
    // GeoJSON order: [longitude, latitude]
    let coords = first
        .pointer("/geometry/coordinates")
        .and_then(Value::as_array)
        .filter(|pair| pair.len() >= 2)
        .ok_or_else(|| AppError::Parse("missing geometry.coordinates".into()))?;
    let lon = coordinate(coords.first()).ok_or_else(|| AppError::Parse("bad longitude".into()))?;
    let lat = coordinate(coords.get(1)).ok_or_else(|| AppError::Parse("bad latitude".into()))?;
    Ok(Some((lat, lon, first.clone())))
}

fn parse_geocoding_jp(body: &str) -> Parsed {
    let document = roxmltree::Document::parse(body)
        .map_err(|err| AppError::Parse(format!("invalid XML: {err}")))?;
    let text_of = |name: &str| {
        document
            .descendants()
            .find(|node| node.tag_name().name() == name)
            .and_then(|node| node.text())
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
    };

    if let Some(error) = text_of("error") {
        debug!(%error, "geocoding.jp reported no match");
        return Ok(None);
    }
    let (Some(lat_text), Some(lng_text)) = (text_of("lat"), text_of("lng")) else {
        return Ok(None);
    };
    let lat = lat_text
        .parse::<f64>()
        .map_err(|err| AppError::Parse(format!("bad lat {lat_text}: {err}")))?;
    let lng = lng_text
        .parse::<f64>()
        .map_err(|err| AppError::Parse(format!("bad lng {lng_text}: {err}")))?;
    let raw = json!({
        "address": text_of("address"),
        "lat": lat_text,
        "lng": lng_text,
    });
    Ok(Some((lat, lng, raw)))
}

fn parse_csis(body: &str) -> Parsed {
    let document = roxmltree::Document::parse(body)
        .map_err(|err| AppError::Parse(format!("invalid XML: {err}")))?;
    // Several candidates may come back; the first is the best match.
    let Some(candidate) = document
        .descendants()
        .find(|node| node.tag_name().name() == "candidate")
    else {
        return Ok(None);
    };
    let text_of = |name: &str| {
        candidate
            .children()
            .find(|node| node.tag_name().name() == name)
            .and_then(|node| node.text())
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
    };

    let (Some(lat_text), Some(lon_text)) = (text_of("latitude"), text_of("longitude")) else {
        return Ok(None);
    };
    let lat = lat_text
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| AppError::Parse(format!("bad latitude {lat_text}")))?;
    let lon = lon_text
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| AppError::Parse(format!("bad longitude {lon_text}")))?;
    let raw = json!({
        "address": text_of("address"),
        "latitude": lat_text,
        "longitude": lon_text,
        "level": text_of("iLvl"),
    });
    Ok(Some((lat, lon, raw)))
}

fn coordinate(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Number(number) => number.as_f64(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}
