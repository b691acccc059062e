use clap::{
    app_from_crate, crate_authors, crate_description, crate_name, crate_version, value_t_or_exit,
    AppSettings, Arg, ArgMatches, SubCommand,
};
use std::{path::PathBuf, str::FromStr};

use crate::validators::*;
use tile_crawler::{config::DEFAULT_OUTDIR, Area, BoundingBox, FetchSettings, DEFAULT_TILE_SIZE};

const FETCH_CMD: &str = "fetch";
const STITCH_CMD: &str = "stitch";
const STITCH_ALL_CMD: &str = "stitch-all";
const STATS_CMD: &str = "stats";

const VERBOSE_ARG: &str = "verbose";
const CONFIG_ARG: &str = "config";
const BBOX_ARG: &str = "bbox";
const GEOJSON_ARG: &str = "geojson";
const ZOOM_ARG: &str = "zoom";
const URL_ARG: &str = "url";
const SINGLE_URL_ARG: &str = "single_url";
const OUTPUT_ARG: &str = "output";
const PARALLEL_FETCHES_ARG: &str = "concurrency";
const REQUEST_RETRIES_ARG: &str = "retries";
const TIMEOUT_ARG: &str = "timeout";
const SKIP_EXISTING_ARG: &str = "skip_existing";
const CONVERT_WEBP_ARG: &str = "convert_webp_to_png";
const REFERER_ARG: &str = "referer";
const USER_AGENT_ARG: &str = "user_agent";
const HEADER_ARG: &str = "header";
const HEADERS_JSON_ARG: &str = "headers";
const TOKEN_ARG: &str = "token";
const DRY_RUN_ARG: &str = "dry_run";
const INPUT_ARG: &str = "input";
const OUTPUT_DIR_ARG: &str = "output_dir";
const XRANGE_ARG: &str = "xrange";
const YRANGE_ARG: &str = "yrange";
const TILE_SIZE_ARG: &str = "tile_size";
const FORMAT_ARG: &str = "format";
const MIN_ZOOM_ARG: &str = "min_zoom";
const MAX_ZOOM_ARG: &str = "max_zoom";

pub struct Args {
    pub verbose: bool,
    pub command: Command,
}

pub enum Command {
    Fetch(FetchArgs),
    Stitch(StitchArgs),
    StitchAll(StitchAllArgs),
    Stats { input: PathBuf },
}

pub struct FetchArgs {
    /// `None` runs the config file's job list.
    pub area: Option<Area>,
    pub zoom: Option<u8>,
    pub single_url: Option<String>,
    pub config: Option<PathBuf>,
    pub dry_run: bool,
    /// The CLI layer of the fetch settings, only holding what was passed.
    pub settings: FetchSettings,
}

pub enum StitchArea {
    Bbox(BoundingBox),
    Range {
        x: (usize, usize),
        y: (usize, usize),
    },
}

pub struct StitchArgs {
    pub zoom: u8,
    pub area: StitchArea,
    pub input: PathBuf,
    pub output: PathBuf,
    pub tile_size: u32,
    pub format: Option<String>,
}

/// Unset values fall back to the config file's `defaults`.
pub struct StitchAllArgs {
    pub bbox: BoundingBox,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub input: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub tile_size: Option<u32>,
    pub format: Option<String>,
    pub config: Option<PathBuf>,
}

impl Args {
    pub fn parse() -> Self {
        let matches = get_matches();
        let verbose = matches.is_present(VERBOSE_ARG);

        let command = match matches.subcommand() {
            (FETCH_CMD, Some(m)) => Command::Fetch(FetchArgs::from_matches(m)),
            (STITCH_CMD, Some(m)) => Command::Stitch(StitchArgs::from_matches(m)),
            (STITCH_ALL_CMD, Some(m)) => Command::StitchAll(StitchAllArgs::from_matches(m)),
            (_, m) => Command::Stats {
                input: m
                    .and_then(|m| m.value_of(INPUT_ARG))
                    .unwrap_or(DEFAULT_OUTDIR)
                    .into(),
            },
        };

        Self { verbose, command }
    }
}

impl FetchArgs {
    fn from_matches(m: &ArgMatches) -> Self {
        let area = match (m.value_of(BBOX_ARG), m.value_of(GEOJSON_ARG)) {
            (_, Some(path)) => Some(Area::GeoJson(path.into())),
            (Some(_), None) => Some(Area::Bbox(value_t_or_exit!(m, BBOX_ARG, BoundingBox))),
            (None, None) => None,
        };

        Self {
            area,
            zoom: optional(m, ZOOM_ARG),
            single_url: m.value_of(SINGLE_URL_ARG).map(str::to_owned),
            config: m.value_of(CONFIG_ARG).map(PathBuf::from),
            dry_run: m.is_present(DRY_RUN_ARG),
            settings: cli_settings(m),
        }
    }
}

impl StitchArgs {
    fn from_matches(m: &ArgMatches) -> Self {
        let area = match (m.value_of(XRANGE_ARG), m.value_of(YRANGE_ARG)) {
            (Some(x), Some(y)) => match (parse_range(x), parse_range(y)) {
                (Ok(x), Ok(y)) => StitchArea::Range { x, y },
                (Err(e), _) | (_, Err(e)) => {
                    clap::Error::with_description(&e.to_string(), clap::ErrorKind::ValueValidation)
                        .exit()
                }
            },
            _ => StitchArea::Bbox(value_t_or_exit!(m, BBOX_ARG, BoundingBox)),
        };

        Self {
            zoom: value_t_or_exit!(m, ZOOM_ARG, u8),
            area,
            input: m.value_of(INPUT_ARG).unwrap_or(DEFAULT_OUTDIR).into(),
            output: value_t_or_exit!(m, OUTPUT_ARG, PathBuf),
            tile_size: optional(m, TILE_SIZE_ARG).unwrap_or(DEFAULT_TILE_SIZE),
            format: m.value_of(FORMAT_ARG).map(str::to_owned),
        }
    }
}

impl StitchAllArgs {
    fn from_matches(m: &ArgMatches) -> Self {
        let min_zoom = value_t_or_exit!(m, MIN_ZOOM_ARG, u8);
        let max_zoom = value_t_or_exit!(m, MAX_ZOOM_ARG, u8);

        Self {
            bbox: value_t_or_exit!(m, BBOX_ARG, BoundingBox),
            min_zoom: min_zoom.min(max_zoom),
            max_zoom: min_zoom.max(max_zoom),
            input: m.value_of(INPUT_ARG).map(PathBuf::from),
            output_dir: m.value_of(OUTPUT_DIR_ARG).unwrap_or(".").into(),
            tile_size: optional(m, TILE_SIZE_ARG),
            format: m.value_of(FORMAT_ARG).map(str::to_owned),
            config: m.value_of(CONFIG_ARG).map(PathBuf::from),
        }
    }
}

/// Values have passed their validator by now, so parsing can't fail.
fn optional<T: FromStr>(m: &ArgMatches, name: &str) -> Option<T> {
    m.value_of(name).and_then(|v| v.parse().ok())
}

fn flag(m: &ArgMatches, name: &str) -> Option<bool> {
    if m.is_present(name) {
        Some(true)
    } else {
        None
    }
}

/// Collects the fetch flags into a settings layer. Later header sources win:
/// `--headers` JSON, then `--header`, then `--referer` and `--user-agent`.
fn cli_settings(m: &ArgMatches) -> FetchSettings {
    let mut headers = m
        .value_of(HEADERS_JSON_ARG)
        .and_then(|v| parse_json_object(v).ok())
        .unwrap_or_default();
    headers.extend(
        m.values_of(HEADER_ARG)
            .into_iter()
            .flatten()
            .filter_map(parse_header),
    );
    if let Some(referer) = m.value_of(REFERER_ARG) {
        headers.insert("Referer".to_owned(), referer.to_owned());
    }
    if let Some(user_agent) = m.value_of(USER_AGENT_ARG) {
        headers.insert("User-Agent".to_owned(), user_agent.to_owned());
    }

    let tokens = m
        .values_of(TOKEN_ARG)
        .into_iter()
        .flatten()
        .filter_map(parse_token)
        .collect();

    FetchSettings {
        template: m.value_of(URL_ARG).map(str::to_owned),
        outdir: m.value_of(OUTPUT_ARG).map(PathBuf::from),
        concurrency: optional(m, PARALLEL_FETCHES_ARG),
        skip_existing: flag(m, SKIP_EXISTING_ARG),
        timeout: optional(m, TIMEOUT_ARG),
        retries: optional(m, REQUEST_RETRIES_ARG),
        convert_webp_to_png: flag(m, CONVERT_WEBP_ARG),
        headers,
        tokens,
        ..FetchSettings::default()
    }
}

fn config_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name(CONFIG_ARG)
        .help("The JSON config file. Defaults to ./config.json if it exists.")
        .takes_value(true)
        .short("c")
        .long("config")
}

fn tile_size_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name(TILE_SIZE_ARG)
        .help("The side length of a tile in pixels (default 256)")
        .validator(is_numeric_min(1))
        .takes_value(true)
        .long("tile-size")
}

fn format_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name(FORMAT_ARG)
        .help("The output image format, eg. png or jpg. Defaults to the output file's extension.")
        .validator(is_format)
        .takes_value(true)
        .long("format")
}

fn fetch_cmd<'a, 'b>() -> clap::App<'a, 'b> {
    SubCommand::with_name(FETCH_CMD)
        .about("Download the tiles of an area, or run the config file's jobs")
        .arg(
            Arg::with_name(BBOX_ARG)
                .help("The area to fetch as `min_lon,min_lat,max_lon,max_lat` (in degrees)")
                .validator(is_bbox)
                .takes_value(true)
                .allow_hyphen_values(true)
                .short("b")
                .long("bbox"),
        )
        .arg(
            Arg::with_name(GEOJSON_ARG)
                .help("A GeoJSON file whose bounding box is the area to fetch")
                .conflicts_with(BBOX_ARG)
                .takes_value(true)
                .short("g")
                .long("geojson"),
        )
        .arg(
            Arg::with_name(ZOOM_ARG)
                .help("The zoom level to fetch")
                .validator(is_zoom)
                .takes_value(true)
                .short("z")
                .long("zoom"),
        )
        .arg(
            Arg::with_name(URL_ARG)
                .help("The URL with format specifiers `{x}`, `{y}`, `{z}` to fetch the tiles from. Also supports `{s}`, rotated between `a`, `b` and `c` to spread the load between servers, and named tokens passed with --token.")
                .takes_value(true)
                .short("u")
                .long("url"),
        )
        .arg(
            Arg::with_name(SINGLE_URL_ARG)
                .help("Download this one URL into the output folder instead of a tile range")
                .conflicts_with_all(&[BBOX_ARG, GEOJSON_ARG])
                .takes_value(true)
                .long("single-url"),
        )
        .arg(
            Arg::with_name(OUTPUT_ARG)
                .help("The folder to store the tiles in, laid out as `{z}/{x}/{y}.{ext}`")
                .takes_value(true)
                .short("o")
                .long("output"),
        )
        .arg(
            Arg::with_name(PARALLEL_FETCHES_ARG)
                .help("The amount of tiles fetched in parallel.")
                .validator(is_numeric_min(1))
                .takes_value(true)
                .short("r")
                .long("concurrency"),
        )
        .arg(
            Arg::with_name(REQUEST_RETRIES_ARG)
                .help("The amount of times to retry a failed HTTP request.")
                .validator(is_numeric_min(0))
                .takes_value(true)
                .long("retries"),
        )
        .arg(
            Arg::with_name(TIMEOUT_ARG)
                .help("The timeout (in seconds) for fetching a single tile. Pass 0 for no timeout.")
                .validator(is_numeric_min(0))
                .takes_value(true)
                .short("t")
                .long("timeout"),
        )
        .arg(
            Arg::with_name(SKIP_EXISTING_ARG)
                .help("Don't fetch tiles that are already downloaded")
                .long("skip-existing"),
        )
        .arg(
            Arg::with_name(CONVERT_WEBP_ARG)
                .help("Write a PNG copy next to every downloaded WebP tile")
                .long("convert-webp-to-png"),
        )
        .arg(
            Arg::with_name(REFERER_ARG)
                .help("The Referer header to send")
                .takes_value(true)
                .long("referer"),
        )
        .arg(
            Arg::with_name(USER_AGENT_ARG)
                .help("The User-Agent header to send")
                .takes_value(true)
                .long("user-agent"),
        )
        .arg(
            Arg::with_name(HEADER_ARG)
                .help("An extra request header as `Name: value`. May be repeated.")
                .validator(is_header)
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .short("H")
                .long("header"),
        )
        .arg(
            Arg::with_name(HEADERS_JSON_ARG)
                .help("Extra request headers as a JSON object")
                .validator(is_json_object)
                .takes_value(true)
                .long("headers"),
        )
        .arg(
            Arg::with_name(TOKEN_ARG)
                .help("A URL template token as `key=value`. May be repeated.")
                .validator(is_token)
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .long("token"),
        )
        .arg(config_arg())
        .arg(
            Arg::with_name(DRY_RUN_ARG)
                .help("Don't actually fetch anything, just determine how many tiles would be fetched.")
                .long("dry-run"),
        )
}

fn stitch_cmd<'a, 'b>() -> clap::App<'a, 'b> {
    SubCommand::with_name(STITCH_CMD)
        .about("Stitch stored tiles into a single image")
        .arg(
            Arg::with_name(ZOOM_ARG)
                .help("The zoom level to stitch")
                .validator(is_zoom)
                .required(true)
                .takes_value(true)
                .short("z")
                .long("zoom"),
        )
        .arg(
            Arg::with_name(BBOX_ARG)
                .help("The area to stitch as `min_lon,min_lat,max_lon,max_lat` (in degrees)")
                .validator(is_bbox)
                .required_unless(XRANGE_ARG)
                .takes_value(true)
                .allow_hyphen_values(true)
                .short("b")
                .long("bbox"),
        )
        .arg(
            Arg::with_name(XRANGE_ARG)
                .help("The inclusive tile column range as `min,max`")
                .validator(is_range)
                .conflicts_with(BBOX_ARG)
                .requires(YRANGE_ARG)
                .takes_value(true)
                .long("xrange"),
        )
        .arg(
            Arg::with_name(YRANGE_ARG)
                .help("The inclusive tile row range as `min,max`")
                .validator(is_range)
                .conflicts_with(BBOX_ARG)
                .requires(XRANGE_ARG)
                .takes_value(true)
                .long("yrange"),
        )
        .arg(
            Arg::with_name(INPUT_ARG)
                .help("The tile store to read from")
                .default_value(DEFAULT_OUTDIR)
                .takes_value(true)
                .short("i")
                .long("input"),
        )
        .arg(
            Arg::with_name(OUTPUT_ARG)
                .help("The image file to write")
                .required(true)
                .takes_value(true)
                .short("o")
                .long("output"),
        )
        .arg(tile_size_arg())
        .arg(format_arg())
}

fn stitch_all_cmd<'a, 'b>() -> clap::App<'a, 'b> {
    SubCommand::with_name(STITCH_ALL_CMD)
        .about("Stitch an area once for every zoom level in a range")
        .arg(
            Arg::with_name(BBOX_ARG)
                .help("The area to stitch as `min_lon,min_lat,max_lon,max_lat` (in degrees)")
                .validator(is_bbox)
                .required(true)
                .takes_value(true)
                .allow_hyphen_values(true)
                .short("b")
                .long("bbox"),
        )
        .arg(
            Arg::with_name(MIN_ZOOM_ARG)
                .help("The minimum zoom level to stitch")
                .validator(is_zoom)
                .required(true)
                .takes_value(true)
                .long("min-zoom"),
        )
        .arg(
            Arg::with_name(MAX_ZOOM_ARG)
                .help("The maximum zoom level to stitch")
                .validator(is_zoom)
                .required(true)
                .takes_value(true)
                .long("max-zoom"),
        )
        .arg(
            Arg::with_name(INPUT_ARG)
                .help("The tile store to read from. Defaults to the config's `defaults.outdir`.")
                .takes_value(true)
                .short("i")
                .long("input"),
        )
        .arg(
            Arg::with_name(OUTPUT_DIR_ARG)
                .help("The folder to write the images to")
                .takes_value(true)
                .short("o")
                .long("output-dir"),
        )
        .arg(tile_size_arg())
        .arg(format_arg())
        .arg(config_arg())
}

fn stats_cmd<'a, 'b>() -> clap::App<'a, 'b> {
    SubCommand::with_name(STATS_CMD)
        .about("Count stored tiles per zoom level and estimate their coverage")
        .arg(
            Arg::with_name(INPUT_ARG)
                .help("The tile store to inspect")
                .default_value(DEFAULT_OUTDIR)
                .takes_value(true)
                .short("i")
                .long("input"),
        )
}

fn get_matches() -> ArgMatches<'static> {
    app_from_crate!()
        .setting(AppSettings::GlobalVersion)
        .setting(AppSettings::VersionlessSubcommands)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name(VERBOSE_ARG)
                .help("Log debug output. RUST_LOG takes precedence.")
                .global(true)
                .short("v")
                .long("verbose"),
        )
        .subcommand(fetch_cmd())
        .subcommand(stitch_cmd())
        .subcommand(stitch_all_cmd())
        .subcommand(stats_cmd())
        .get_matches()
}
