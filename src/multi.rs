use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::geocoder::{GeocodeClient, GeocodeResult, Geocoder, ProviderKind};

/// Free-text lookup across several backends with different coverage.
///
/// Each provider is asked exactly once with the query as given; the first
/// one to return coordinates wins. Degrading the query is
/// [`FallbackGeocoder`](crate::fallback::FallbackGeocoder)'s job, not this one's.
pub struct MultiProviderGeocoder<G = GeocodeClient> {
    providers: Vec<G>,
}

impl MultiProviderGeocoder<GeocodeClient> {
    /// Builds one rate-limited client per entry of `provider_order`.
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let providers = config
            .provider_order
            .iter()
            .map(|kind| GeocodeClient::from_config(*kind, config))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self::new(providers))
    }
}

impl<G: Geocoder> MultiProviderGeocoder<G> {
    pub fn new(providers: Vec<G>) -> Self {
        Self { providers }
    }

    pub fn providers(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.providers.iter().map(Geocoder::provider)
    }

    pub async fn geocode(&self, query: &str) -> Option<GeocodeResult> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }

        for provider in &self.providers {
            let result = provider.geocode_once(query).await;
            if result.is_found() {
                info!(provider = %provider.provider(), query, "free-text lookup resolved");
                return Some(result);
            }
            debug!(
                provider = %provider.provider(),
                note = ?result.note(),
                "provider had no match; trying next"
            );
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    struct FixedProvider {
        kind: ProviderKind,
        answer: Option<(f64, f64)>,
        log: Arc<Mutex<Vec<(ProviderKind, String)>>>,
    }

    #[async_trait]
    impl Geocoder for FixedProvider {
        fn provider(&self) -> ProviderKind {
            self.kind
        }

        async fn geocode_once(&self, query: &str) -> GeocodeResult {
            self.log.lock().push((self.kind, query.to_string()));
            match self.answer {
                Some((lat, lon)) => GeocodeResult::found(self.kind.as_str(), lat, lon, json!({})),
                None => GeocodeResult::not_found(self.kind.as_str(), "no_result"),
            }
        }
    }

    fn chain(
        answers: &[(ProviderKind, Option<(f64, f64)>)],
    ) -> (
        MultiProviderGeocoder<FixedProvider>,
        Arc<Mutex<Vec<(ProviderKind, String)>>>,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let providers = answers
            .iter()
            .map(|(kind, answer)| FixedProvider {
                kind: *kind,
                answer: *answer,
                log: log.clone(),
            })
            .collect();
        (MultiProviderGeocoder::new(providers), log)
    }

    #[tokio::test]
    async fn returns_first_provider_with_coordinates() {
        let (geocoder, log) = chain(&[
            (ProviderKind::Gsi, None),
            (ProviderKind::GeocodingJp, Some((35.658581, 139.745433))),
            (ProviderKind::Nominatim, Some((1.0, 1.0))),
        ]);

        let result = geocoder.geocode("東京タワー").await.unwrap();
        assert_eq!(result.provider(), "geocoding_jp");
        assert_eq!(result.coordinates(), Some((35.658581, 139.745433)));
        assert_eq!(
            *log.lock(),
            vec![
                (ProviderKind::Gsi, "東京タワー".to_string()),
                (ProviderKind::GeocodingJp, "東京タワー".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn sends_the_query_unchanged_to_every_provider() {
        let (geocoder, log) = chain(&[(ProviderKind::Gsi, None), (ProviderKind::Nominatim, None)]);
        let query = "丸の内1-1-1 第一ビル 3F（受付）";

        assert!(geocoder.geocode(query).await.is_none());
        assert!(log.lock().iter().all(|(_, sent)| sent == query));
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn empty_query_calls_nobody() {
        let (geocoder, log) = chain(&[(ProviderKind::Gsi, Some((35.0, 139.0)))]);
        assert!(geocoder.geocode("  ").await.is_none());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn lists_providers_in_order() {
        let (geocoder, _) = chain(&[
            (ProviderKind::Nominatim, None),
            (ProviderKind::Gsi, None),
        ]);
        assert_eq!(
            geocoder.providers().collect::<Vec<_>>(),
            vec![ProviderKind::Nominatim, ProviderKind::Gsi]
        );
    }
}
