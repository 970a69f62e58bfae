//! Forex Exporter Integration Tests
//!
//! End-to-end wiring of scheduler, registry, metrics server and shutdown
//! coordinator:
//! - Polled rates show up on `/metrics`
//! - A failing pair is isolated from the others
//! - Shutdown stops every subsystem within the grace period

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use forex_exporter::adapters::{build_source, SourceSettings};
use forex_exporter::config::parse_currency_pairs;
use forex_exporter::{
    Args, CurrencyPair, Error, ExchangeRate, ForexMetrics, ListenAddr, MetricsServer, PollScheduler,
    RateSource, Result, ShutdownCoordinator,
};

const GRACE: Duration = Duration::from_secs(10);

// =============================================================================
// Helpers
// =============================================================================

/// Fixed rates per pair; pairs listed in `failing` always error.
struct StaticSource {
    failing: HashSet<String>,
}

#[async_trait]
impl RateSource for StaticSource {
    async fn initialize(&mut self, _pairs: &[CurrencyPair]) -> Result<()> {
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(3600)
    }

    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_one(&self, pair: &CurrencyPair) -> Result<ExchangeRate> {
        if self.failing.contains(&pair.to_string()) {
            return Err(Error::fetch(pair, "static", "upstream returned garbage"));
        }
        let rate = match pair.target() {
            "EUR" => 0.92,
            "JPY" => 187.5,
            _ => 1.0,
        };
        Ok(ExchangeRate::new(rate, 1_700_000_000))
    }
}

fn loopback() -> ListenAddr {
    ListenAddr {
        host: "127.0.0.1".to_string(),
        port: 0,
    }
}

async fn scrape(addr: std::net::SocketAddr) -> String {
    reqwest::get(format!("http://{}/metrics", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap()
}

/// Poll until `predicate` holds for the scrape output, or give up after 5s.
async fn scrape_until(addr: std::net::SocketAddr, predicate: impl Fn(&str) -> bool) -> String {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let body = scrape(addr).await;
        if predicate(&body) || tokio::time::Instant::now() > deadline {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// End-to-End Tests
// =============================================================================

#[tokio::test]
async fn test_polled_rates_are_scrapeable() {
    let pairs = parse_currency_pairs("USD/EUR,GBP/JPY,EUR/CHF").unwrap();
    let metrics = Arc::new(ForexMetrics::new().unwrap());
    let coordinator = ShutdownCoordinator::new(GRACE);

    let (server, _failures) = MetricsServer::bind(&loopback(), Arc::clone(&metrics), GRACE)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    coordinator.track("metrics-server", server.start(coordinator.token()));

    let source = StaticSource {
        failing: HashSet::from(["EUR/CHF".to_string()]),
    };
    let handle = PollScheduler::new(pairs, Arc::clone(&metrics), GRACE)
        .start(Box::new(source), coordinator.token())
        .await
        .unwrap();
    coordinator.track("poll-scheduler", handle);

    let body = scrape_until(addr, |b| b.contains("fetch_errors_total{")).await;

    assert!(body.contains(
        r#"forex_exporter_exchange_rate{provider="static",source_currency="USD",target_currency="EUR"} 0.92"#
    ));
    assert!(body.contains(
        r#"forex_exporter_exchange_rate{provider="static",source_currency="GBP",target_currency="JPY"} 187.5"#
    ));
    assert!(body.contains(
        r#"forex_exporter_exchange_rate_timestamp_seconds{provider="static",source_currency="GBP",target_currency="JPY"} 1700000000"#
    ));
    assert!(!body.contains(
        r#"forex_exporter_exchange_rate{provider="static",source_currency="EUR",target_currency="CHF"}"#
    ));
    assert!(body.contains(
        r#"forex_exporter_fetch_errors_total{provider="static",source_currency="EUR",target_currency="CHF"} 1"#
    ));

    tokio::time::timeout(GRACE * 2, coordinator.shutdown())
        .await
        .unwrap()
        .unwrap();
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_twelvedata_source_end_to_end() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/currency_conversion"))
        .and(query_param("symbol", "USD/EUR"))
        .and(query_param("apikey", "integration-key"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"symbol":"USD/EUR","rate":0.9321,"amount":0.9321,"timestamp":1700000123}"#,
        ))
        .mount(&provider)
        .await;

    let settings = SourceSettings {
        name: "twelvedata".to_string(),
        api_key: Some("integration-key".to_string()),
        base_url: provider.uri(),
    };
    let source = build_source(&settings).unwrap();
    let metrics = Arc::new(ForexMetrics::new().unwrap());
    let shutdown = CancellationToken::new();

    let handle = PollScheduler::new(
        parse_currency_pairs("USD/EUR").unwrap(),
        Arc::clone(&metrics),
        GRACE,
    )
    .start(source, shutdown.clone())
    .await
    .unwrap();

    let pair: CurrencyPair = "USD/EUR".parse().unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while metrics.latest(&pair, "twelvedata").is_none() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(
        metrics.latest(&pair, "twelvedata"),
        Some(ExchangeRate::new(0.9321, 1_700_000_123))
    );

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_missing_api_key_prevents_start() {
    let settings = SourceSettings {
        name: "twelvedata".to_string(),
        api_key: None,
        base_url: "http://127.0.0.1:9".to_string(),
    };
    let source = build_source(&settings).unwrap();
    let metrics = Arc::new(ForexMetrics::new().unwrap());

    let result = PollScheduler::new(
        parse_currency_pairs("USD/EUR").unwrap(),
        Arc::clone(&metrics),
        GRACE,
    )
    .start(source, CancellationToken::new())
    .await;

    assert!(matches!(result, Err(Error::Config(_))));
    assert!(metrics.is_empty());
}

#[tokio::test]
async fn test_malformed_pairs_rejected_before_startup() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let listen = format!("127.0.0.1:{}", port);

    for raw in ["US/EUR", "123/EUR", "USD-EUR", "USD/EUR,USD/EUR"] {
        let args = Args::try_parse_from([
            "forex-exporter",
            "--currency-pairs",
            raw,
            "--twelvedata-api-key",
            "test-key",
            "--listen",
            listen.as_str(),
        ])
        .unwrap();

        assert!(matches!(args.into_config(), Err(Error::Config(_))), "{raw}");
    }

    // Configuration is validated before the metrics server binds.
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());
}
