use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::cache::GeoCache;
use crate::errors::AppResult;
use crate::geocoder::{GeocodeResult, Geocoder};
use crate::normalize::build_ladder;

pub const NOTE_ALL_FALLBACKS_FAILED: &str = "all_fallbacks_failed";
pub const NOTE_EMPTY_ADDRESS: &str = "empty_address";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Cache,
    Network,
    Unresolved,
    Empty,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub result: GeocodeResult,
    pub source: ResolutionSource,
    /// The ladder candidate that produced the hit.
    pub query: Option<String>,
    /// Index of that candidate in the ladder.
    pub step: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolveStats {
    pub requested: usize,
    pub cache_hits: usize,
    pub network_calls: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub skipped_empty: usize,
}

/// Resolves noisy addresses by walking the degradation ladder against the
/// cache and then one provider, keeping only successes.
pub struct FallbackGeocoder<G> {
    client: G,
    cache: GeoCache,
    stats: ResolveStats,
}

impl<G: Geocoder> FallbackGeocoder<G> {
    pub fn new(client: G, cache: GeoCache) -> Self {
        Self {
            client,
            cache,
            stats: ResolveStats::default(),
        }
    }

    pub fn client(&self) -> &G {
        &self.client
    }

    pub fn cache(&self) -> &GeoCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut GeoCache {
        &mut self.cache
    }

    pub fn stats(&self) -> &ResolveStats {
        &self.stats
    }

    pub fn save_cache(&self) -> AppResult<()> {
        self.cache.save()
    }

    pub fn into_parts(self) -> (G, GeoCache) {
        (self.client, self.cache)
    }

    pub async fn resolve(&mut self, raw_address: &str, postal_code: Option<&str>) -> GeocodeResult {
        self.resolve_with_source(raw_address, postal_code).await.result
    }

    /// Cached candidates are consulted first, most specific wins; then each
    /// candidate goes to the provider in order until one has coordinates.
    pub async fn resolve_with_source(
        &mut self,
        raw_address: &str,
        postal_code: Option<&str>,
    ) -> Resolution {
        self.stats.requested += 1;
        let provider = self.client.provider();
        let ladder = build_ladder(raw_address, postal_code);
        if ladder.is_empty() {
            self.stats.skipped_empty += 1;
            return Resolution {
                result: GeocodeResult::not_found(provider.as_str(), NOTE_EMPTY_ADDRESS),
                source: ResolutionSource::Empty,
                query: None,
                step: None,
            };
        }

        for (step, candidate) in ladder.iter().enumerate() {
            if let Some(hit) = self.cache.get(candidate).filter(|hit| hit.is_found()) {
                trace!(step, candidate = %candidate, "geocode cache hit");
                self.stats.cache_hits += 1;
                self.stats.resolved += 1;
                return Resolution {
                    result: hit.clone(),
                    source: ResolutionSource::Cache,
                    query: Some(candidate.clone()),
                    step: Some(step),
                };
            }
        }

        for (step, candidate) in ladder.iter().enumerate() {
            self.stats.network_calls += 1;
            let result = self.client.geocode_once(candidate).await;
            if result.is_found() {
                debug!(
                    provider = %provider,
                    step,
                    candidate = %candidate,
                    "address resolved"
                );
                self.cache.put(candidate.clone(), result.clone());
                self.stats.resolved += 1;
                return Resolution {
                    result,
                    source: ResolutionSource::Network,
                    query: Some(candidate.clone()),
                    step: Some(step),
                };
            }
            trace!(step, candidate = %candidate, note = ?result.note(), "candidate missed");
        }

        warn!(
            provider = %provider,
            address = raw_address,
            attempts = ladder.len(),
            "all fallback candidates failed"
        );
        self.stats.unresolved += 1;
        Resolution {
            result: GeocodeResult::not_found(provider.as_str(), NOTE_ALL_FALLBACKS_FAILED),
            source: ResolutionSource::Unresolved,
            query: None,
            step: None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::geocoder::ProviderKind;
    use crate::normalize::build_ladder;

    /// Answers from a fixed table and records every query it receives.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedGeocoder {
        pub answers: HashMap<String, (f64, f64)>,
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedGeocoder {
        pub fn answering(pairs: &[(&str, (f64, f64))]) -> Self {
            Self {
                answers: pairs
                    .iter()
                    .map(|(query, coords)| (query.to_string(), *coords))
                    .collect(),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Geocoder for ScriptedGeocoder {
        fn provider(&self) -> ProviderKind {
            ProviderKind::Nominatim
        }

        async fn geocode_once(&self, query: &str) -> GeocodeResult {
            self.calls.lock().push(query.to_string());
            match self.answers.get(query) {
                Some((lat, lon)) => {
                    GeocodeResult::found("nominatim", *lat, *lon, json!({ "q": query }))
                }
                None => GeocodeResult::not_found("nominatim", "no_result"),
            }
        }
    }

    const MARUNOUCHI: &str = "東京都千代田区丸の内1-1-1 第一ビル 3F（受付）";

    #[tokio::test]
    async fn resolves_at_building_stripped_step() {
        let ladder = build_ladder(MARUNOUCHI, None);
        let target = ladder[2].clone();
        assert_eq!(target, "東京都千代田区丸の内1-1-1 第一ビル");

        let client = ScriptedGeocoder::answering(&[(target.as_str(), (35.681, 139.767))]);
        let mut geocoder = FallbackGeocoder::new(client.clone(), GeoCache::in_memory());
        let resolution = geocoder.resolve_with_source(MARUNOUCHI, None).await;

        assert_eq!(resolution.result.coordinates(), Some((35.681, 139.767)));
        assert_eq!(resolution.source, ResolutionSource::Network);
        assert_eq!(resolution.step, Some(2));
        assert_eq!(client.calls(), ladder[..3].to_vec());

        let cached = geocoder.cache().get(&target).expect("stored under candidate key");
        assert_eq!(cached.provider(), "nominatim");
        assert!(geocoder.cache().get(&ladder[0]).is_none());
        assert_eq!(geocoder.cache().len(), 1);
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let ladder = build_ladder(MARUNOUCHI, None);
        let client = ScriptedGeocoder::answering(&[
            (ladder[1].as_str(), (35.6, 139.7)),
            (ladder[2].as_str(), (1.0, 1.0)),
        ]);
        let mut geocoder = FallbackGeocoder::new(client.clone(), GeoCache::in_memory());
        let result = geocoder.resolve(MARUNOUCHI, None).await;

        assert_eq!(result.coordinates(), Some((35.6, 139.7)));
        assert_eq!(client.calls(), vec![ladder[0].clone(), ladder[1].clone()]);
    }

    #[tokio::test]
    async fn empty_address_makes_no_calls() {
        let client = ScriptedGeocoder::default();
        let mut geocoder = FallbackGeocoder::new(client.clone(), GeoCache::in_memory());

        let result = geocoder.resolve("", None).await;
        assert!(!result.is_found());
        assert_eq!(result.note(), Some(NOTE_EMPTY_ADDRESS));

        let result = geocoder.resolve("\u{3000} ", Some("100-0005")).await;
        assert!(!result.is_found());
        assert!(client.calls().is_empty());
        assert_eq!(geocoder.stats().skipped_empty, 2);
    }

    #[tokio::test]
    async fn cached_candidate_skips_the_client() {
        let mut cache = GeoCache::in_memory();
        cache.put(
            "千代田区丸の内",
            GeocodeResult::found("gsi", 35.68, 139.76, json!({})),
        );
        let client = ScriptedGeocoder::default();
        let mut geocoder = FallbackGeocoder::new(client.clone(), cache);

        let resolution = geocoder
            .resolve_with_source("千代田区丸の内 3F（本社受付）", None)
            .await;
        assert_eq!(resolution.step, Some(2));
        assert_eq!(resolution.source, ResolutionSource::Cache);
        assert_eq!(resolution.result.coordinates(), Some((35.68, 139.76)));
        assert!(client.calls().is_empty());
        assert_eq!(geocoder.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn exhausts_ladder_without_caching_failures() {
        let ladder = build_ladder(MARUNOUCHI, Some("100-0005"));
        let client = ScriptedGeocoder::default();
        let mut geocoder = FallbackGeocoder::new(client.clone(), GeoCache::in_memory());

        let result = geocoder.resolve(MARUNOUCHI, Some("100-0005")).await;
        assert!(!result.is_found());
        assert_eq!(result.note(), Some(NOTE_ALL_FALLBACKS_FAILED));
        assert_eq!(client.calls(), ladder);
        assert!(client.calls().len() <= 6);
        assert!(geocoder.cache().is_empty());
        assert_eq!(geocoder.stats().unresolved, 1);
        assert_eq!(geocoder.stats().network_calls, ladder.len());
    }

    #[tokio::test]
    async fn second_resolve_is_served_from_cache() {
        let ladder = build_ladder(MARUNOUCHI, None);
        let client = ScriptedGeocoder::answering(&[(ladder[0].as_str(), (35.0, 139.0))]);
        let mut geocoder = FallbackGeocoder::new(client.clone(), GeoCache::in_memory());

        geocoder.resolve(MARUNOUCHI, None).await;
        let again = geocoder.resolve_with_source(MARUNOUCHI, None).await;
        assert_eq!(again.source, ResolutionSource::Cache);
        assert_eq!(client.calls().len(), 1);
    }
}
