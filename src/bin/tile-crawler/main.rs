mod args;
mod validators;

use anyhow::{anyhow, Context, Result};
use args::{Args, Command, FetchArgs, StitchAllArgs, StitchArea, StitchArgs};
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tile_crawler::{
    batch, config::DEFAULT_OUTDIR, parse_format, stitch, stitch_zooms, FileConfig, Outcome, Plan,
    TileRect, TileStore, DEFAULT_TILE_SIZE,
};

/// Assumed average tile size for dry-run estimates.
const BYTES_PER_TILE: f64 = 10_000f64;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Fetch(fetch) => run_fetch(fetch).await,
        Command::Stitch(stitch) => run_stitch(stitch),
        Command::StitchAll(stitch_all) => run_stitch_all(stitch_all),
        Command::Stats { input } => run_stats(&input),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_fetch(args: FetchArgs) -> Result<()> {
    let file = FileConfig::discover(args.config.as_deref())?;

    if let Some(url) = &args.single_url {
        let config = file.network().overlay(&args.settings).resolve();
        let result = batch::download_url(&config, url).await?;
        return match result.path() {
            Some(path) => {
                info!(path = %path.display(), "downloaded");
                Ok(())
            }
            None => Err(anyhow!("failed downloading {}", url)),
        };
    }

    let area = match &args.area {
        Some(area) => area,
        None => return run_job_list(&file, &args).await,
    };

    let config = file.network().overlay(&args.settings).resolve();
    match batch::run(&config, area, args.zoom, args.dry_run).await? {
        Outcome::Planned(plan) => print_estimate(&plan),
        Outcome::Fetched(plan, report) => {
            if report.failures > 0 {
                warn!(rect = %plan.rect, %report, "some tiles could not be fetched");
            } else {
                info!(rect = %plan.rect, %report, "done");
            }
        }
        other => info!(outcome = %other, "done"),
    }

    Ok(())
}

async fn run_job_list(file: &FileConfig, args: &FetchArgs) -> Result<()> {
    if file.jobs.is_empty() {
        return Err(anyhow!(
            "nothing to fetch: pass --bbox or --geojson, or list jobs in the config file"
        ));
    }

    let reports = batch::run_jobs(file, &args.settings, args.dry_run).await;
    for report in &reports {
        match &report.outcome {
            Outcome::Planned(plan) => {
                eprint!("{}: ", report.name);
                print_estimate(plan);
            }
            outcome => eprintln!("{}: {}", report.name, outcome),
        }
    }

    Ok(())
}

fn print_estimate(plan: &Plan) {
    let tile_count = plan.rect.tile_count();

    eprintln!(
        "would download {} tiles ({}), approx {}, assuming 10 kb per tile",
        tile_count,
        plan.rect,
        pretty_bytes::converter::convert((tile_count as f64) * BYTES_PER_TILE)
    );
}

fn run_stitch(args: StitchArgs) -> Result<()> {
    let rect = match args.area {
        StitchArea::Bbox(bbox) => bbox.tile_rect(args.zoom),
        StitchArea::Range { x, y } => TileRect::new(args.zoom, x, y).saturated(),
    };
    let format = args.format.as_deref().map(parse_format).transpose()?;
    let store = TileStore::new(&args.input);

    let report = stitch(&store, rect, &args.output, args.tile_size, format)?;
    if report.is_complete() {
        info!(%report, "stitched");
    } else {
        warn!(
            %report,
            missing = format!("{:.1}%", report.missing_ratio() * 100_f64),
            "stitched with missing tiles"
        );
    }

    Ok(())
}

fn run_stitch_all(args: StitchAllArgs) -> Result<()> {
    let defaults = FileConfig::discover(args.config.as_deref())?.defaults;

    let input = args
        .input
        .or(defaults.outdir)
        .unwrap_or_else(|| DEFAULT_OUTDIR.into());
    let tile_size = args
        .tile_size
        .or(defaults.tile_size)
        .unwrap_or(DEFAULT_TILE_SIZE);
    let format = args
        .format
        .or(defaults.format)
        .as_deref()
        .map(parse_format)
        .transpose()
        .context("invalid stitch format")?;

    let store = TileStore::new(input);
    let results = stitch_zooms(
        &store,
        &args.bbox,
        args.min_zoom..=args.max_zoom,
        &args.output_dir,
        tile_size,
        format,
    );

    let mut failed = 0;
    for (z, result) in results {
        match result {
            Ok(report) => info!(%report, "stitched"),
            Err(e) => {
                failed += 1;
                warn!(zoom = z, error = %format!("{:#}", e), "stitching failed");
            }
        }
    }

    if failed > 0 {
        return Err(anyhow!("{} zoom level(s) failed to stitch", failed));
    }

    Ok(())
}

fn run_stats(input: &Path) -> Result<()> {
    let store = TileStore::new(input);
    let stats = store.stats()?;

    if stats.is_empty() {
        println!("no tiles in {}", input.display());
        return Ok(());
    }

    for (z, count) in &stats {
        println!("zoom {:>2}: {} tiles", z, count);
    }
    println!("total: {} tiles", stats.values().sum::<usize>());

    if let Some(coverage) = store.coverage()? {
        println!(
            "zoom {} covers {} (approx. bbox {:.5},{:.5},{:.5},{:.5})",
            coverage.rect.z,
            coverage.rect,
            coverage.bbox.min_lon,
            coverage.bbox.min_lat,
            coverage.bbox.max_lon,
            coverage.bbox.max_lat
        );
    }

    Ok(())
}
