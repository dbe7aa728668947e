//! End-to-end runs of the pipeline entry points against scripted endpoints.

use std::sync::Arc;

use bikeshare_ingest::error::AppError;
use bikeshare_ingest::models::{
    BatchOutcome, BatchStatus, Config, Manifest, ManifestEntry, PollOutcome, PollerState,
    RateLimitConfig, RetryConfig, RowCounts, SkipReason,
};
use bikeshare_ingest::pipeline::{self, PipelineContext};
use bikeshare_ingest::storage::{MemoryStore, Store, TripLog, WatermarkStore};
use bikeshare_ingest::utils::http::{HttpClient, Scripted, ScriptedHttpClient};
use tempfile::TempDir;

const JAN: &str = "https://data.test/Mobi_System_Data_2023-01.csv";
const FEB: &str = "https://data.test/Mobi_System_Data_2023-02.csv";
const FEED: &str = "https://gbfs.test/station_status.json";
const SITE: &str = "https://bikes.test/";

const JAN_CSV: &str = "\
Departure,Return,Bike,Electric bike,Departure station,Return station,Membership type,Covered distance (m),Duration (sec.)
2023-01-05 08:00,2023-01-05 08:15,1001,False,0152 Main & Union,0020 Pender & Burrard,Annual Plus,2100,900
2023-01-05 09:00,2023-01-05 09:20,1002,True,0153 Union & Gore,0020 Pender & Burrard,24 Hour,3200,1200
2023-01-06 10:00,2023-01-06 10:05,1003,False,0020 Pender & Burrard,0152 Main & Union,Annual Plus,800,300
2023-01-06 11:00,2023-01-06 10:30,1004,False,0152 Main & Union,0153 Union & Gore,Annual Plus,1500,600
";

struct Harness {
    ctx: PipelineContext,
    store: Arc<MemoryStore>,
    client: Arc<ScriptedHttpClient>,
    _staging: TempDir,
}

fn config(staging: &TempDir) -> Config {
    let mut config = Config::default();
    config.paths.staging_dir = staging.path().to_path_buf();
    config.governor.default_rate = RateLimitConfig {
        requests: 1000,
        window_ms: 1000,
        burst: 10,
    };
    config.governor.retry = RetryConfig {
        max_attempts: 2,
        base_delay_ms: 1,
        multiplier: 1.0,
        max_delay_ms: 1,
        jitter: false,
    };
    config.poller.feed_url = FEED.into();
    config.poller.failure_threshold = 3;
    config.poller.interval_secs = 30;
    config.poller.degraded_multiplier = 2.0;
    config.poller.max_interval_secs = 600;
    config.poller.attempts_per_poll = 1;
    config.crawler.disallow = vec!["^/admin".into()];
    config
}

fn harness_with(store: Arc<MemoryStore>, client: Arc<ScriptedHttpClient>, tweak: impl FnOnce(&mut Config)) -> Harness {
    let staging = TempDir::new().unwrap();
    let mut config = config(&staging);
    tweak(&mut config);
    let http: Arc<dyn HttpClient> = client.clone();
    let sink: Arc<dyn Store> = store.clone();
    Harness {
        ctx: PipelineContext::new(config, http, sink),
        store,
        client,
        _staging: staging,
    }
}

fn harness() -> Harness {
    harness_with(
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedHttpClient::new()),
        |_| {},
    )
}

fn january() -> Manifest {
    Manifest::new(vec![ManifestEntry::new("2023-01", JAN)])
}

#[tokio::test]
async fn ingest_merges_valid_rows_and_quarantines_the_rest() {
    let h = harness();
    h.client.always(JAN, Scripted::ok(JAN, JAN_CSV));

    let summary = pipeline::run_historical_ingest(&h.ctx, &january())
        .await
        .unwrap();

    let report = summary.report("2023-01").unwrap();
    assert_eq!(report.outcome, BatchOutcome::Ingested);
    assert_eq!(report.counts, RowCounts::new(4, 3, 0, 1));
    assert_eq!(h.store.trip_count().await.unwrap(), 3);

    let quarantined = h.store.quarantined();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].reason.code(), "non-monotonic-trip");

    let wm = h.store.watermark("2023-01").await.unwrap().unwrap();
    assert_eq!(wm.status, BatchStatus::Ingested);
    assert_eq!(wm.counts, RowCounts::new(4, 3, 0, 1));
}

#[tokio::test]
async fn rerunning_a_manifest_leaves_the_log_unchanged() {
    let h = harness();
    h.client.always(JAN, Scripted::ok(JAN, JAN_CSV));
    pipeline::run_historical_ingest(&h.ctx, &january())
        .await
        .unwrap();
    let trips = h.store.trips();

    let again = pipeline::run_historical_ingest(&h.ctx, &january())
        .await
        .unwrap();
    assert_eq!(
        again.report("2023-01").unwrap().outcome,
        BatchOutcome::AlreadyIngested
    );
    assert_eq!(h.client.request_count(JAN), 1);
    assert_eq!(h.store.trips(), trips);

    // A forced refresh re-validates every row and merges nothing new.
    let refresh = harness_with(h.store.clone(), h.client.clone(), |c| c.fetcher.refresh = true);
    let refreshed = pipeline::run_historical_ingest(&refresh.ctx, &january())
        .await
        .unwrap();
    assert_eq!(
        refreshed.report("2023-01").unwrap().counts,
        RowCounts::new(4, 0, 3, 1)
    );
    assert_eq!(refresh.store.trips(), trips);
    assert_eq!(refresh.store.quarantined().len(), 1);
    let wm = refresh.store.watermark("2023-01").await.unwrap().unwrap();
    assert_eq!(wm.counts, RowCounts::new(4, 0, 3, 1));
}

#[tokio::test]
async fn one_bad_batch_does_not_block_the_others() {
    let h = harness();
    h.client
        .always(JAN, Scripted::ok(JAN, JAN_CSV))
        .always(FEB, Scripted::html(FEB, "<html>Google Drive can't scan this file</html>"));
    let manifest = Manifest::new(vec![
        ManifestEntry::new("2023-01", JAN),
        ManifestEntry::new("2023-02", FEB),
    ]);

    let summary = pipeline::run_historical_ingest(&h.ctx, &manifest)
        .await
        .unwrap();

    assert_eq!(summary.count(BatchOutcome::Ingested), 1);
    assert_eq!(
        summary.report("2023-02").unwrap().outcome,
        BatchOutcome::UnexpectedContent
    );
    let wm = h.store.watermark("2023-02").await.unwrap().unwrap();
    assert_eq!(wm.status, BatchStatus::QuarantinedPartial);
    assert_eq!(wm.attempts, 1);
}

#[tokio::test]
async fn persistent_fetch_failure_leaves_the_batch_pending() {
    let h = harness();
    h.client.always(JAN, Scripted::status(JAN, 503));

    let summary = pipeline::run_historical_ingest(&h.ctx, &january())
        .await
        .unwrap();

    assert_eq!(
        summary.report("2023-01").unwrap().outcome,
        BatchOutcome::FetchFailed
    );
    assert_eq!(h.client.request_count(JAN), 2);
    let wm = h.store.watermark("2023-01").await.unwrap().unwrap();
    assert_eq!(wm.status, BatchStatus::Pending);
    assert!(wm.last_error.unwrap().contains("503"));
}

#[tokio::test]
async fn unknown_layout_fails_only_that_batch() {
    let h = harness();
    h.client
        .always(JAN, Scripted::ok(JAN, JAN_CSV))
        .always(FEB, Scripted::ok(FEB, "a,b,c\n1,2,3\n"));
    let manifest = Manifest::new(vec![
        ManifestEntry::new("2023-01", JAN),
        ManifestEntry::new("2023-02", FEB),
    ]);

    let summary = pipeline::run_historical_ingest(&h.ctx, &manifest)
        .await
        .unwrap();
    assert_eq!(
        summary.report("2023-02").unwrap().outcome,
        BatchOutcome::SchemaUnrecognized
    );
    assert_eq!(
        summary.report("2023-01").unwrap().outcome,
        BatchOutcome::Ingested
    );
}

#[tokio::test]
async fn structural_failures_abort_the_run() {
    let h = harness();
    let empty = pipeline::run_historical_ingest(&h.ctx, &Manifest::default())
        .await
        .unwrap_err();
    assert!(matches!(empty, AppError::Config(_)));

    h.store.set_unavailable(true);
    let unreachable = pipeline::run_historical_ingest(&h.ctx, &january())
        .await
        .unwrap_err();
    assert!(matches!(unreachable, AppError::Store(_)));
    assert_eq!(h.client.request_count(JAN), 0);
}

#[tokio::test]
async fn failing_feed_degrades_then_recovers() {
    let h = harness();
    for _ in 0..5 {
        h.client.enqueue(FEED, Scripted::status(FEED, 500));
    }
    h.client.enqueue(
        FEED,
        Scripted::ok(
            FEED,
            r#"{"last_updated":1700000000,"data":{"stations":[{"station_id":"0152","num_bikes_available":3,"num_docks_available":9}]}}"#,
        ),
    );
    let poller = h.ctx.station_poller();
    let base = h.ctx.config.poller.interval();
    let degraded = h.ctx.config.poller.degraded_interval();

    let mut reports = Vec::new();
    for _ in 0..6 {
        reports.push(poller.poll_now(h.store.as_ref()).await.unwrap());
    }

    assert_eq!(reports[1].state, PollerState::Idle);
    assert_eq!(reports[1].next_interval, base);
    assert_eq!(reports[2].state, PollerState::Degraded);
    assert!(reports[2].next_interval >= degraded);
    assert!(reports[4].next_interval > reports[2].next_interval);
    assert_eq!(reports[4].consecutive_failures, 5);

    assert!(matches!(reports[5].outcome, PollOutcome::Success { snapshots: 1, .. }));
    assert_eq!(reports[5].state, PollerState::Idle);
    assert_eq!(reports[5].next_interval, base);
    assert_eq!(reports[5].consecutive_failures, 0);
    assert_eq!(h.store.snapshots().len(), 1);
}

#[tokio::test]
async fn scheduled_cycles_respect_the_interval() {
    let h = harness();
    h.client.always(
        FEED,
        Scripted::ok(FEED, r#"{"data":{"stations":[{"station_id":"1","num_bikes_available":1,"num_docks_available":1}]}}"#),
    );
    let poller = h.ctx.station_poller();

    let first = pipeline::run_station_poll_cycle(&h.ctx, &poller).await.unwrap();
    let second = pipeline::run_station_poll_cycle(&h.ctx, &poller).await.unwrap();
    assert!(first.is_success());
    assert!(matches!(second.outcome, PollOutcome::Skipped { .. }));
    assert_eq!(h.client.request_count(FEED), 1);
}

#[tokio::test]
async fn crawl_skips_disallowed_paths() {
    let h = harness();
    h.client
        .always(
            SITE,
            Scripted::html(
                SITE,
                r#"<a href="/admin/settings">Admin</a> <a href="/stations">Stations</a>"#,
            ),
        )
        .always(
            "https://bikes.test/stations",
            Scripted::html("https://bikes.test/stations", "<title>Stations</title>"),
        );

    let summary = pipeline::run_crawl(&h.ctx, &[SITE.to_string()])
        .await
        .unwrap();

    let urls: Vec<_> = h.store.pages().into_iter().map(|p| p.url).collect();
    assert_eq!(urls, vec![SITE, "https://bikes.test/stations"]);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].url, "https://bikes.test/admin/settings");
    assert_eq!(summary.skipped[0].reason, SkipReason::Disallowed);
    assert_eq!(h.client.request_count("https://bikes.test/admin/settings"), 0);
}

#[tokio::test]
async fn discovery_produces_a_valid_manifest() {
    let h = harness();
    let page = h.ctx.config.discovery.page_url.clone();
    h.client.always(
        &page,
        Scripted::html(
            &page,
            r#"<a href="https://drive.google.com/file/d/abc123/view">March 2024</a>
               <a href="/files/2024-02.csv">February 2024</a>"#,
        ),
    );

    let manifest = pipeline::run_discovery(&h.ctx).await.unwrap();
    assert!(manifest.validate().is_ok());
    assert_eq!(manifest.resources[0].vintage, "2024-02");
    assert_eq!(
        manifest.resources[1].url,
        "https://drive.google.com/uc?export=download&id=abc123"
    );
}
