use std::fs;
use std::time::Duration;

use httptest::matchers::{all_of, contains, not, request, url_decoded};
use httptest::responders::json_encoded;
use httptest::{Expectation, Server};
use serde_json::json;
use tempfile::tempdir;

use geofill::{
    CsvEnricher, FallbackGeocoder, GeoCache, GeocodeClient, ProviderKind, ProviderSettings,
    RetryPolicy, ReviewLog, SqlRewriter,
};

fn fake_nominatim(server: &Server) -> GeocodeClient {
    let settings = ProviderSettings::new(ProviderKind::Nominatim, "geofill-test/0.1")
        .with_endpoint(server.url_str("/search"))
        .with_min_interval(Duration::from_millis(1))
        .with_retry(RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        });
    GeocodeClient::new(settings).unwrap()
}

fn answer(server: &Server, query: &'static str, lat: &str, lon: &str) {
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", query)))),
        ])
        .respond_with(json_encoded(json!([{ "lat": lat, "lon": lon }]))),
    );
}

#[tokio::test]
async fn csv_batch_persists_cache_for_the_next_run() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("spots.csv");
    let output = dir.path().join("spots_geocoded.csv");
    let cache_path = dir.path().join("spots_geocode_cache.csv");
    fs::write(
        &input,
        "名称,住所\n東京駅,東京都千代田区丸の内1-9-1\n大阪城,大阪府大阪市中央区大阪城1-1\n",
    )
    .unwrap();

    {
        let server = Server::run();
        answer(&server, "東京都千代田区丸の内1-9-1", "35.6812", "139.7671");
        answer(&server, "大阪府大阪市中央区大阪城1-1", "34.6873", "135.5262");

        let mut geocoder =
            FallbackGeocoder::new(fake_nominatim(&server), GeoCache::load(&cache_path).unwrap());
        let review = ReviewLog::with_limits(dir.path(), 10, 1024 * 1024, 2).unwrap();
        let stats = CsvEnricher::default()
            .enrich_file(&input, &output, &mut geocoder, Some(&review), None)
            .await
            .unwrap();
        assert_eq!(stats.resolved, 2);
        assert_eq!(stats.cache_hits, 0);
        geocoder.save_cache().unwrap();
    }

    let written = fs::read_to_string(&output).unwrap();
    assert!(written.starts_with("名称,住所,緯度,経度\n"));
    assert!(written.contains("東京駅,東京都千代田区丸の内1-9-1,35.6812,139.7671"));
    assert!(written.contains("大阪城,大阪府大阪市中央区大阪城1-1,34.6873,135.5262"));

    // No expectations: any request fails the test.
    let server = Server::run();
    let mut geocoder =
        FallbackGeocoder::new(fake_nominatim(&server), GeoCache::load(&cache_path).unwrap());
    assert_eq!(geocoder.cache().len(), 2);
    let rerun = dir.path().join("rerun.csv");
    let stats = CsvEnricher::default()
        .enrich_file(&input, &rerun, &mut geocoder, None, None)
        .await
        .unwrap();
    assert_eq!(stats.resolved, 2);
    assert_eq!(stats.cache_hits, 2);
    assert_eq!(geocoder.stats().network_calls, 0);
    assert_eq!(fs::read_to_string(&rerun).unwrap(), written);
}

#[tokio::test]
async fn sql_dump_gets_coordinates_after_pivot() {
    let server = Server::run();
    answer(&server, "京都府京都市東山区清水1-294", "34.9949", "135.7850");
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/search"),
            request::query(url_decoded(not(contains(("q", "京都府京都市東山区清水1-294"))))),
        ])
        .times(2)
        .respond_with(json_encoded(json!([]))),
    );

    let sql = "SET NAMES utf8mb4;\n\
INSERT INTO `TRAVEL_SPOT` (`id`, `name`, `address`, `url`, `memo`) VALUES\n\
(1, '清水寺', '京都府京都市東山区清水1-294', 'https://www.kiyomizudera.or.jp/', 'It''s busy'),\n\
(2, '謎の場所', '存在しない町', NULL, NULL);\n";

    let dir = tempdir().unwrap();
    let review = ReviewLog::with_limits(dir.path(), 1, 1024 * 1024, 2).unwrap();
    let mut geocoder = FallbackGeocoder::new(fake_nominatim(&server), GeoCache::in_memory());
    let (out, stats) = SqlRewriter::default()
        .with_origin("seed.sql")
        .rewrite_script(sql, &mut geocoder, Some(&review))
        .await
        .unwrap();

    assert!(out.starts_with("SET NAMES utf8mb4;\n"));
    assert!(out.contains(
        "INSERT INTO `TRAVEL_SPOT` (`id`, `name`, `address`, `url`, lat, lng, `memo`) VALUES"
    ));
    assert!(out.contains(
        "(1, '清水寺', '京都府京都市東山区清水1-294', 'https://www.kiyomizudera.or.jp/', 34.9949, 135.785, 'It''s busy')"
    ));
    assert!(out.contains("(2, '謎の場所', '存在しない町', NULL, NULL, NULL, NULL);"));
    assert_eq!(stats.filled, 1);
    assert_eq!(stats.unresolved, 1);

    let logged = fs::read_to_string(review.buffer_path()).unwrap();
    assert!(logged.contains("\"origin\":\"seed.sql\""));
    assert!(logged.contains("\"locator\":\"TRAVEL_SPOT#2\""));
    assert!(logged.contains("all_fallbacks_failed"));
}
