//! End-to-end update check workflow against a mock update server

use std::sync::Arc;
use std::time::Duration;

use otasync_updates::*;
use serde_json::json;
use tempfile::TempDir;

const PATH: &str = "/walleye/nightly";

/// Timer that records nothing and never fires
struct ManualTimer;

impl CheckTimer for ManualTimer {
    fn schedule_repeating(&self, _interval: Duration) {}
    fn cancel_repeating(&self) {}
    fn schedule_once(&self, _delay: Duration) {}
    fn cancel_once(&self) {}
}

fn record(id: &str, datetime: i64) -> serde_json::Value {
    json!({
        "id": id,
        "datetime": datetime,
        "filename": format!("lineage-21.0-{}-nightly-walleye.zip", datetime),
        "romtype": "nightly",
        "size": 1_048_576,
        "url": format!("https://mirror.example.com/{}.zip", id),
        "version": "21.0",
    })
}

fn manifest(records: Vec<serde_json::Value>) -> String {
    json!({ "response": records }).to_string()
}

fn service(dir: &TempDir, server: &mockito::Server) -> UpdaterService {
    let config = UpdaterConfig {
        server_url: format!("{}/{{device}}/{{type}}", server.url()),
        device: "walleye".to_string(),
        channel: "nightly".to_string(),
        cache_dir: dir.path().join("cache"),
        downloads_dir: dir.path().join("downloads"),
        build: DeviceBuild {
            version: "21.0".to_string(),
            timestamp: 1_000,
            incremental: "eng.1".to_string(),
        },
        ..Default::default()
    };
    let fetcher = Arc::new(HttpManifestFetcher::with_defaults().unwrap());
    UpdaterService::new(config, fetcher, Arc::new(ManualTimer)).unwrap()
}

fn ids(service: &UpdaterService) -> Vec<String> {
    service.registry().list().into_iter().map(|u| u.id).collect()
}

#[tokio::test]
async fn test_new_update_discovered_and_scheduled() {
    let mut server = mockito::Server::new_async().await;
    let dir = TempDir::new().unwrap();
    let service = service(&dir, &server);

    let v1 = server
        .mock("GET", PATH)
        .with_status(200)
        .with_body(manifest(vec![record("u1", 2_000)]))
        .create_async()
        .await;
    let report = service.check_now(CheckTrigger::Manual).await.unwrap();
    assert!(report.outcome.is_success());
    assert_eq!(ids(&service), vec!["u1"]);
    v1.remove_async().await;

    let _v2 = server
        .mock("GET", PATH)
        .with_status(200)
        .with_body(manifest(vec![record("u1", 2_000), record("u2", 3_000)]))
        .create_async()
        .await;
    let report = service.check_now(CheckTrigger::Manual).await.unwrap();

    assert_eq!(
        report.outcome,
        CheckOutcome::Success {
            newly_discovered: true,
            manifest_changed: true
        }
    );
    assert_eq!(report.status, CheckStatus::UpdatesFound);
    assert_eq!(ids(&service), vec!["u2", "u1"]);
    assert!(service.schedule_state().periodic.is_some());
    assert!(!service.schedule_state().retry_armed());

    let committed = std::fs::read(dir.path().join("cache").join("updates.json")).unwrap();
    let committed = Manifest::parse(&committed).unwrap();
    assert_eq!(committed.entries().len(), 2);
}

#[tokio::test]
async fn test_server_error_keeps_manifest_and_arms_retry() {
    let mut server = mockito::Server::new_async().await;
    let dir = TempDir::new().unwrap();
    let service = service(&dir, &server);

    let ok = server
        .mock("GET", PATH)
        .with_status(200)
        .with_body(manifest(vec![record("u1", 2_000)]))
        .create_async()
        .await;
    service.check_now(CheckTrigger::Manual).await.unwrap();
    ok.remove_async().await;
    let digest = service.manifest_digest().await.unwrap();

    let _failing = server
        .mock("GET", PATH)
        .with_status(503)
        .create_async()
        .await;
    let report = service.check_now(CheckTrigger::Scheduled).await.unwrap();
    service.check_now(CheckTrigger::Scheduled).await.unwrap();

    assert!(matches!(report.outcome, CheckOutcome::Failed { .. }));
    assert_eq!(service.status(), CheckStatus::CheckFailed);
    assert!(service.schedule_state().retry_armed());
    assert_eq!(service.manifest_digest().await.unwrap(), digest);
    assert_eq!(ids(&service), vec!["u1"]);
}

#[tokio::test]
async fn test_incompatible_records_are_ignored() {
    let mut server = mockito::Server::new_async().await;
    let dir = TempDir::new().unwrap();
    let service = service(&dir, &server);

    let mut other_channel = record("weekly-1", 5_000);
    other_channel["romtype"] = json!("weekly");
    let older_build = record("old", 500);
    let broken = json!({ "id": "broken" });

    let _mock = server
        .mock("GET", PATH)
        .with_status(200)
        .with_body(manifest(vec![
            record("u1", 2_000),
            other_channel,
            older_build,
            broken,
        ]))
        .create_async()
        .await;

    let report = service.check_now(CheckTrigger::Manual).await.unwrap();
    assert!(report.outcome.is_success());
    assert_eq!(ids(&service), vec!["u1"]);
}

#[tokio::test]
async fn test_local_import_survives_refresh() {
    let mut server = mockito::Server::new_async().await;
    let dir = TempDir::new().unwrap();
    let service = service(&dir, &server);

    let _mock = server
        .mock("GET", PATH)
        .with_status(200)
        .with_body(manifest(vec![record("u1", 2_000)]))
        .create_async()
        .await;

    let package = dir.path().join("sideload.zip");
    std::fs::write(&package, vec![0x50u8; 8192]).unwrap();
    let local = service.import_file(&package).await.unwrap();

    service.check_now(CheckTrigger::Manual).await.unwrap();

    let stored = service.registry().get(&local.id).unwrap();
    assert_eq!(stored.origin, UpdateOrigin::Local);
    assert!(!stored.available_online);
    assert_eq!(stored.metadata.size, 8192);
    assert!(dir.path().join("downloads").join(LOCAL_UPDATE_FILE).exists());
    assert_eq!(service.registry().len(), 2);
}

#[tokio::test]
async fn test_readers_see_consistent_snapshots_during_checks() {
    let mut server = mockito::Server::new_async().await;
    let dir = TempDir::new().unwrap();
    let service = Arc::new(service(&dir, &server));

    let _mock = server
        .mock("GET", PATH)
        .with_status(200)
        .with_body(manifest(vec![
            record("u1", 2_000),
            record("u2", 3_000),
            record("u3", 4_000),
        ]))
        .expect_at_least(1)
        .create_async()
        .await;

    let registry = service.registry();
    let reader = tokio::spawn(async move {
        for _ in 0..200 {
            let list = registry.list();
            let mut seen = std::collections::HashSet::new();
            for pair in list.windows(2) {
                assert!(pair[0].timestamp >= pair[1].timestamp);
            }
            for update in &list {
                assert!(seen.insert(update.id.clone()));
            }
            tokio::task::yield_now().await;
        }
    });

    for _ in 0..3 {
        match service.check_now(CheckTrigger::Scheduled).await {
            Ok(report) => assert!(report.outcome.is_success()),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    reader.await.unwrap();
    assert_eq!(ids(&service), vec!["u3", "u2", "u1"]);
}
