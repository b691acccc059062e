//! Drives the fetcher over areas: single runs, job lists and dry runs.

use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::bounding_box::BoundingBox;
use crate::config::{FetchConfig, FetchSettings, FileConfig, JobSpec};
use crate::error::InputError;
use crate::fetch::{convert_webp_to_png, BatchReport, FetchResult, Fetcher};
use crate::geojson;
use crate::tile::{Tile, TileRect, MAX_ZOOM};

/// The area a fetch covers.
#[derive(Clone, Debug, PartialEq)]
pub enum Area {
    Bbox(BoundingBox),
    GeoJson(PathBuf),
}

impl Area {
    /// Picks the job's GeoJSON file if it has one, its bbox otherwise.
    pub fn from_job(job: &JobSpec) -> Result<Self, InputError> {
        match (&job.geojson, &job.bbox) {
            (Some(path), _) => Ok(Area::GeoJson(path.clone())),
            (None, Some(bbox)) => Ok(Area::Bbox(bbox.parse()?)),
            (None, None) => Err(InputError::MissingArea),
        }
    }

    pub fn bounding_box(&self) -> Result<BoundingBox> {
        match self {
            Area::Bbox(bbox) => Ok(*bbox),
            Area::GeoJson(path) => geojson::bbox_from_file(path),
        }
    }
}

/// The tiles an area resolves to at one zoom level.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plan {
    pub bbox: BoundingBox,
    pub rect: TileRect,
}

impl Plan {
    pub fn new(area: &Area, zoom: Option<u8>) -> Result<Self> {
        let zoom = check_zoom(zoom)?;
        let bbox = area.bounding_box()?;

        Ok(Self {
            bbox,
            rect: bbox.tile_rect(zoom),
        })
    }

    /// The tile at the center of the area, used to probe a job.
    pub fn center_tile(&self) -> Tile {
        Tile::from_point(self.bbox.center(), self.rect.z)
    }
}

pub fn check_zoom(zoom: Option<u8>) -> Result<u8, InputError> {
    match zoom {
        None => Err(InputError::MissingZoom),
        Some(z) if z > MAX_ZOOM => Err(InputError::ZoomTooDeep(z)),
        Some(z) => Ok(z),
    }
}

/// What happened to one fetch run or job.
#[derive(Debug)]
pub enum Outcome {
    /// Dry run: the tiles were computed but nothing was requested.
    Planned(Plan),
    Fetched(Plan, BatchReport),
    /// The job never started, eg. for lack of a zoom level or because its
    /// probe request failed.
    Skipped(anyhow::Error),
    Failed(anyhow::Error),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Planned(plan) => write!(f, "would fetch {}", plan.rect),
            Outcome::Fetched(plan, report) => write!(f, "{}: {}", plan.rect, report),
            Outcome::Skipped(e) => write!(f, "skipped: {:#}", e),
            Outcome::Failed(e) => write!(f, "failed: {:#}", e),
        }
    }
}

#[derive(Debug)]
pub struct JobReport {
    pub name: String,
    pub outcome: Outcome,
}

/// Fetches every tile of `plan` as configured by `config`.
pub async fn fetch_plan(config: &FetchConfig, plan: &Plan) -> Result<BatchReport> {
    let fetcher = Fetcher::new(config.fetch_options())?;
    let store = config.store();
    tokio::fs::create_dir_all(store.root())
        .await
        .with_context(|| format!("failed creating tile store {}", store.root().display()))?;

    info!(rect = %plan.rect, outdir = %store.root().display(), "fetching tiles");
    Ok(fetcher
        .fetch_rect(&config.url_format(), &store, plan.rect, config.concurrency)
        .await)
}

/// Plans `area` at `zoom` and, unless `dry_run` is set, fetches it.
///
/// Invalid input (no zoom, bad GeoJSON) is returned as an error before any
/// request is made.
pub async fn run(
    config: &FetchConfig,
    area: &Area,
    zoom: Option<u8>,
    dry_run: bool,
) -> Result<Outcome> {
    let plan = Plan::new(area, zoom)?;
    info!(rect = %plan.rect, "computed tile range");

    if dry_run {
        return Ok(Outcome::Planned(plan));
    }

    let report = fetch_plan(config, &plan).await?;
    Ok(Outcome::Fetched(plan, report))
}

/// Runs the config file's jobs one after another.
///
/// A job that can't be planned, fails its probe or errors out is reported and
/// the remaining jobs still run.
pub async fn run_jobs(file: &FileConfig, cli: &FetchSettings, dry_run: bool) -> Vec<JobReport> {
    let mut reports = Vec::with_capacity(file.jobs.len());

    for (i, job) in file.jobs.iter().enumerate() {
        let name = job.name.clone().unwrap_or_else(|| format!("job-{}", i));
        info!(job = %name, "starting job");

        let outcome = run_job(file, job, cli, dry_run).await;
        match &outcome {
            Outcome::Skipped(_) | Outcome::Failed(_) => warn!(job = %name, %outcome, "job did not complete"),
            _ => info!(job = %name, %outcome, "job finished"),
        }

        reports.push(JobReport { name, outcome });
    }

    reports
}

async fn run_job(file: &FileConfig, job: &JobSpec, cli: &FetchSettings, dry_run: bool) -> Outcome {
    let config = file.job_config(job, cli);

    let plan = match Area::from_job(job)
        .map_err(anyhow::Error::from)
        .and_then(|area| Plan::new(&area, job.zoom))
    {
        Ok(plan) => plan,
        Err(e) => return Outcome::Skipped(e),
    };

    if dry_run {
        return Outcome::Planned(plan);
    }

    if let Err(e) = probe(&config, &plan).await {
        return Outcome::Skipped(e);
    }

    match fetch_plan(&config, &plan).await {
        Ok(report) => Outcome::Fetched(plan, report),
        Err(e) => Outcome::Failed(e),
    }
}

/// Requests the center tile of `plan` once to validate headers and tokens.
pub async fn probe(config: &FetchConfig, plan: &Plan) -> Result<()> {
    let fetcher = Fetcher::new(config.fetch_options())?;
    let url = config.url_format().tile_url(&plan.center_tile());

    fetcher
        .probe(&url)
        .await
        .context("validation request failed")?;
    info!(url = %url, "validation request succeeded");

    Ok(())
}

/// Downloads a single URL into the configured output folder, naming the
/// file after the URL's last path segment.
pub async fn download_url(config: &FetchConfig, url: &str) -> Result<FetchResult> {
    let fetcher = Fetcher::new(config.fetch_options())?;
    let target = config.output_folder.join(file_name_of(url));
    info!(url, target = %target.display(), "downloading single URL");

    let result = fetcher.fetch_one(url, &target).await;
    if let (true, Some(path)) = (config.convert_webp_to_png, result.path()) {
        match convert_webp_to_png(path).await {
            Ok(Some(png)) => info!(path = %png.display(), "converted to PNG"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "webp conversion failed"),
        }
    }

    Ok(result)
}

fn file_name_of(url: &str) -> String {
    let path = url.split(|c: char| c == '?' || c == '#').next().unwrap_or_default();
    let name = match path.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map_or("", |(_, p)| p),
        None => path,
    };

    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("tile")
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_prefers_geojson() {
        let job = JobSpec {
            bbox: Some("1,2,3,4".to_owned()),
            geojson: Some(PathBuf::from("a.geojson")),
            ..JobSpec::default()
        };
        assert_eq!(Area::from_job(&job).unwrap(), Area::GeoJson(PathBuf::from("a.geojson")));

        let job = JobSpec {
            bbox: Some("1,2,3,4".to_owned()),
            ..JobSpec::default()
        };
        assert_eq!(
            Area::from_job(&job).unwrap(),
            Area::Bbox(BoundingBox::new(1.0, 2.0, 3.0, 4.0))
        );

        assert_eq!(Area::from_job(&JobSpec::default()), Err(InputError::MissingArea));
    }

    #[test]
    fn plan_requires_zoom() {
        let area = Area::Bbox(BoundingBox::new(116.3, 39.8, 116.5, 40.0));

        let err = Plan::new(&area, None).unwrap_err();
        assert_eq!(err.downcast_ref::<InputError>(), Some(&InputError::MissingZoom));

        let err = Plan::new(&area, Some(40)).unwrap_err();
        assert_eq!(err.downcast_ref::<InputError>(), Some(&InputError::ZoomTooDeep(40)));
    }

    #[test]
    fn center_tile_lies_in_rect() {
        let area = Area::Bbox(BoundingBox::new(116.3, 39.8, 116.5, 40.0));
        let plan = Plan::new(&area, Some(12)).unwrap();
        assert!(plan.rect.contains(&plan.center_tile()));
    }

    #[tokio::test]
    async fn dry_run_makes_no_requests() {
        let config = FetchSettings {
            template: Some("http://127.0.0.1:9/{z}/{x}/{y}".to_owned()),
            outdir: Some(PathBuf::from("/nonexistent/never/created")),
            ..FetchSettings::default()
        }
        .resolve();
        let area = Area::Bbox(BoundingBox::new(116.3, 39.8, 116.5, 40.0));

        match run(&config, &area, Some(10), true).await.unwrap() {
            Outcome::Planned(plan) => assert_eq!(plan.rect.tile_count(), 4),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!config.output_folder.exists());
    }

    #[tokio::test]
    async fn invalid_jobs_are_skipped() {
        let file = FileConfig {
            jobs: vec![
                JobSpec {
                    name: Some("no-zoom".to_owned()),
                    bbox: Some("1,2,3,4".to_owned()),
                    ..JobSpec::default()
                },
                JobSpec {
                    bbox: Some("1,2,3".to_owned()),
                    zoom: Some(3),
                    ..JobSpec::default()
                },
                JobSpec {
                    name: Some("ok".to_owned()),
                    bbox: Some("1,2,3,4".to_owned()),
                    zoom: Some(3),
                    ..JobSpec::default()
                },
            ],
            ..FileConfig::default()
        };

        let reports = run_jobs(&file, &FetchSettings::default(), true).await;

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].name, "no-zoom");
        assert!(matches!(reports[0].outcome, Outcome::Skipped(_)));
        assert_eq!(reports[1].name, "job-1");
        assert!(matches!(reports[1].outcome, Outcome::Skipped(_)));
        assert!(matches!(reports[2].outcome, Outcome::Planned(_)));
    }

    #[test]
    fn single_url_file_names() {
        assert_eq!(file_name_of("https://t.example/a/b/3.png?k=1"), "3.png");
        assert_eq!(file_name_of("https://t.example/"), "tile");
        assert_eq!(file_name_of("https://t.example"), "tile");
        assert_eq!(file_name_of("https://t.example/img#frag"), "img");
    }
}
