mod common;

use common::*;
use tile_crawler::{batch, FetchSettings, FileConfig, JobSpec, Outcome};

fn job(name: &str, template: String, outdir: &std::path::Path) -> JobSpec {
    JobSpec {
        name: Some(name.to_owned()),
        zoom: Some(10),
        bbox: Some("116.3,39.8,116.5,40.0".to_owned()),
        settings: FetchSettings {
            template: Some(template),
            outdir: Some(outdir.to_path_buf()),
            retries: Some(0),
            concurrency: Some(2),
            ..FetchSettings::default()
        },
        ..JobSpec::default()
    }
}

#[tokio::test]
async fn failed_probe_skips_only_that_job() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let file = FileConfig {
        jobs: vec![
            job("broken", server.template("broken"), &dir.path().join("broken")),
            job("good", server.template("tiles"), &dir.path().join("good")),
        ],
        ..FileConfig::default()
    };

    let reports = batch::run_jobs(&file, &FetchSettings::default(), false).await;

    assert_eq!(reports.len(), 2);
    assert!(matches!(reports[0].outcome, Outcome::Skipped(_)));
    assert!(!dir.path().join("broken").exists());

    let tiles = match &reports[1].outcome {
        Outcome::Fetched(plan, report) => {
            assert_eq!(report.successes, plan.rect.tile_count());
            plan.rect.tile_count()
        }
        other => panic!("unexpected outcome {:?}", other),
    };

    // one probe per job, then the good job's tiles
    assert_eq!(server.hits(), 2 + tiles);
    assert_eq!(files_under(&dir.path().join("good")).len(), tiles);
}

#[tokio::test]
async fn file_headers_apply_to_every_job() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let template = format!("{}?sign={{sign}}", server.template("auth"));
    let file = FileConfig {
        headers: maplit::btreemap! { "X-Api-Key".to_owned() => API_KEY.to_owned() },
        tokens: maplit::btreemap! { "sign".to_owned() => SIGN.to_owned() },
        jobs: vec![job("auth", template, &dir.path().join("auth"))],
        ..FileConfig::default()
    };

    let reports = batch::run_jobs(&file, &FetchSettings::default(), false).await;

    match &reports[0].outcome {
        Outcome::Fetched(_, report) => assert_eq!(report.failures, 0),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn cli_layer_overrides_jobs() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let file = FileConfig {
        jobs: vec![job("overridden", server.template("broken"), &dir.path().join("a"))],
        ..FileConfig::default()
    };
    let cli = FetchSettings {
        template: Some(server.template("tiles")),
        ..FetchSettings::default()
    };

    let reports = batch::run_jobs(&file, &cli, false).await;

    assert!(matches!(reports[0].outcome, Outcome::Fetched(_, _)));
    assert!(!files_under(&dir.path().join("a")).is_empty());
}
