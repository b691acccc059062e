//! Layered configuration.
//!
//! Fetch settings are resolved from up to four layers, the most specific
//! winning per field: built-in defaults, the config file's top-level
//! `headers`/`tokens`/`proxies`, a job record and finally CLI flags.

use anyhow::{Context, Result};
use clap::crate_version;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::fetch::{FetchOptions, BACKOFF_STEP};
use crate::store::TileStore;
use crate::url::UrlFormat;

pub const DEFAULT_TEMPLATE: &str = "https://tile.openstreetmap.org/{z}/{x}/{y}.png";
pub const DEFAULT_OUTDIR: &str = "out";
pub const DEFAULT_CONCURRENCY: usize = 32;
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Proxy URLs applied to every request of a job.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Proxies {
    pub http: Option<String>,
    pub https: Option<String>,
    pub all: Option<String>,
}

impl Proxies {
    fn overlay(&self, top: &Proxies) -> Proxies {
        Proxies {
            http: top.http.clone().or_else(|| self.http.clone()),
            https: top.https.clone().or_else(|| self.https.clone()),
            all: top.all.clone().or_else(|| self.all.clone()),
        }
    }

    pub(crate) fn to_reqwest(&self) -> Result<Vec<reqwest::Proxy>> {
        let mut proxies = Vec::new();
        if let Some(url) = &self.http {
            proxies.push(reqwest::Proxy::http(url).with_context(|| format!("invalid http proxy `{}`", url))?);
        }
        if let Some(url) = &self.https {
            proxies.push(reqwest::Proxy::https(url).with_context(|| format!("invalid https proxy `{}`", url))?);
        }
        if let Some(url) = &self.all {
            proxies.push(reqwest::Proxy::all(url).with_context(|| format!("invalid proxy `{}`", url))?);
        }
        Ok(proxies)
    }
}

/// One layer of fetch settings. Every field is optional; unset fields fall
/// through to the layer below.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct FetchSettings {
    pub template: Option<String>,
    pub outdir: Option<PathBuf>,
    pub concurrency: Option<usize>,
    /// Accepted for compatibility; the concurrency cap is the only throttle.
    pub rate: Option<f64>,
    pub skip_existing: Option<bool>,
    /// Per-request timeout in seconds, `0` disables it.
    pub timeout: Option<u64>,
    pub retries: Option<u32>,
    pub convert_webp_to_png: Option<bool>,
    #[serde(default, deserialize_with = "scalar_map")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "scalar_map")]
    pub tokens: BTreeMap<String, String>,
    #[serde(default)]
    pub proxies: Proxies,
}

impl FetchSettings {
    /// Lays `top` over `self`. Headers and tokens are merged key by key.
    pub fn overlay(&self, top: &FetchSettings) -> FetchSettings {
        let mut headers = self.headers.clone();
        headers.extend(top.headers.clone());
        let mut tokens = self.tokens.clone();
        tokens.extend(top.tokens.clone());

        FetchSettings {
            template: top.template.clone().or_else(|| self.template.clone()),
            outdir: top.outdir.clone().or_else(|| self.outdir.clone()),
            concurrency: top.concurrency.or(self.concurrency),
            rate: top.rate.or(self.rate),
            skip_existing: top.skip_existing.or(self.skip_existing),
            timeout: top.timeout.or(self.timeout),
            retries: top.retries.or(self.retries),
            convert_webp_to_png: top.convert_webp_to_png.or(self.convert_webp_to_png),
            headers,
            tokens,
            proxies: self.proxies.overlay(&top.proxies),
        }
    }

    /// Fills every unset field from the built-in defaults.
    pub fn resolve(&self) -> FetchConfig {
        if let Some(rate) = self.rate.filter(|r| *r > 0_f64) {
            debug!(rate, "ignoring request rate, concurrency is the only throttle");
        }

        let mut headers = default_headers();
        headers.extend(self.headers.clone());

        FetchConfig {
            template: self
                .template
                .clone()
                .unwrap_or_else(|| DEFAULT_TEMPLATE.to_owned()),
            output_folder: self
                .outdir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTDIR)),
            concurrency: self.concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1),
            skip_existing: self.skip_existing.unwrap_or(false),
            timeout: Duration::from_secs(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            retries: self.retries.unwrap_or(DEFAULT_RETRIES),
            convert_webp_to_png: self.convert_webp_to_png.unwrap_or(false),
            headers,
            tokens: self.tokens.clone(),
            proxies: self.proxies.clone(),
        }
    }
}

fn default_headers() -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(
        "User-Agent".to_owned(),
        format!("tile-crawler/{}", crate_version!()),
    );
    headers.insert("Accept".to_owned(), "image/webp,*/*".to_owned());
    headers
}

/// Tile fetching configuration, fully resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchConfig {
    /// The URL template including the replacement specifiers `{x}`, `{y}`
    /// and `{z}`, plus any named tokens.
    pub template: String,

    /// The tile store root.
    pub output_folder: PathBuf,

    /// Maximum number of requests in flight.
    pub concurrency: usize,

    /// Whether to skip tiles that are already downloaded.
    pub skip_existing: bool,

    /// Timeout for fetching a single tile.
    ///
    /// The zero duration disables the timeout.
    pub timeout: Duration,

    /// How many times to retry a failed request.
    pub retries: u32,

    /// Whether to write a PNG copy next to every downloaded WebP tile.
    pub convert_webp_to_png: bool,

    pub headers: BTreeMap<String, String>,
    pub tokens: BTreeMap<String, String>,
    pub proxies: Proxies,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchSettings::default().resolve()
    }
}

impl FetchConfig {
    pub fn url_format(&self) -> UrlFormat {
        let tokens: HashMap<String, String> = self.tokens.clone().into_iter().collect();
        UrlFormat::new(self.template.clone()).with_tokens(tokens)
    }

    pub fn store(&self) -> TileStore {
        TileStore::new(&self.output_folder)
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            timeout: self.timeout,
            retries: self.retries,
            skip_existing: self.skip_existing,
            convert_webp_to_png: self.convert_webp_to_png,
            backoff_step: BACKOFF_STEP,
            headers: self.headers.clone(),
            proxies: self.proxies.clone(),
        }
    }
}

/// Stitching fallbacks from the config file's `defaults` record.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct StitchDefaults {
    pub outdir: Option<PathBuf>,
    pub tile_size: Option<u32>,
    pub format: Option<String>,
}

/// A job-list entry.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct JobSpec {
    pub name: Option<String>,
    pub zoom: Option<u8>,
    /// `min_lon,min_lat,max_lon,max_lat`
    pub bbox: Option<String>,
    pub geojson: Option<PathBuf>,
    #[serde(flatten)]
    pub settings: FetchSettings,
}

/// The JSON configuration file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub defaults: StitchDefaults,
    #[serde(default, deserialize_with = "scalar_map")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "scalar_map")]
    pub tokens: BTreeMap<String, String>,
    #[serde(default)]
    pub proxies: Proxies,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing config file {}", path.display()))?;

        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Loads `explicit` if given, otherwise `./config.json` if it exists,
    /// otherwise an empty configuration.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    Self::load(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// The file-level network settings shared by every job.
    pub fn network(&self) -> FetchSettings {
        FetchSettings {
            headers: self.headers.clone(),
            tokens: self.tokens.clone(),
            proxies: self.proxies.clone(),
            ..FetchSettings::default()
        }
    }

    /// Resolves the settings of a job: defaults < file < job < CLI.
    pub fn job_config(&self, job: &JobSpec, cli: &FetchSettings) -> FetchConfig {
        self.network().overlay(&job.settings).overlay(cli).resolve()
    }
}

/// Deserializes a JSON object of scalars into strings, so tokens such as
/// `"expireTime": 1700000000` needn't be quoted.
fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?;

    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "defaults": { "outdir": "map", "tile_size": 512 },
        "headers": { "Referer": "https://example.com/", "X-Shared": "file" },
        "tokens": { "sign": "abc", "expireTime": 1700000000 },
        "proxies": { "https": "http://127.0.0.1:3128" },
        "jobs": [
            {
                "name": "beijing",
                "zoom": 10,
                "bbox": "116.3,39.8,116.5,40.0",
                "template": "https://t.example/{z}/{x}/{y}?sign={sign}",
                "concurrency": 4,
                "rate": 0,
                "skip_existing": true,
                "headers": { "X-Shared": "job" },
                "tokens": { "sign": "job-sign" }
            },
            { "geojson": "area.geojson" }
        ],
        "something_else": true
    }"#;

    #[test]
    fn parses_file() {
        let config: FileConfig = serde_json::from_str(SAMPLE).unwrap();

        assert_eq!(config.defaults.tile_size, Some(512));
        assert_eq!(config.defaults.outdir, Some(PathBuf::from("map")));
        assert_eq!(config.tokens["expireTime"], "1700000000");
        assert_eq!(config.jobs.len(), 2);

        let job = &config.jobs[0];
        assert_eq!(job.name.as_deref(), Some("beijing"));
        assert_eq!(job.zoom, Some(10));
        assert_eq!(job.settings.concurrency, Some(4));
        assert_eq!(job.settings.skip_existing, Some(true));
        assert_eq!(config.jobs[1].geojson, Some(PathBuf::from("area.geojson")));
    }

    #[test]
    fn layers_resolve_most_specific_first() {
        let config: FileConfig = serde_json::from_str(SAMPLE).unwrap();
        let cli = FetchSettings {
            concurrency: Some(8),
            headers: maplit::btreemap! { "User-Agent".to_owned() => "cli".to_owned() },
            ..FetchSettings::default()
        };

        let resolved = config.job_config(&config.jobs[0], &cli);

        assert_eq!(resolved.concurrency, 8);
        assert!(resolved.skip_existing);
        assert_eq!(resolved.retries, DEFAULT_RETRIES);
        assert_eq!(resolved.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(resolved.output_folder, PathBuf::from(DEFAULT_OUTDIR));
        assert_eq!(resolved.headers["X-Shared"], "job");
        assert_eq!(resolved.headers["Referer"], "https://example.com/");
        assert_eq!(resolved.headers["User-Agent"], "cli");
        assert_eq!(resolved.headers["Accept"], "image/webp,*/*");
        assert_eq!(resolved.tokens["sign"], "job-sign");
        assert_eq!(resolved.tokens["expireTime"], "1700000000");
        assert_eq!(resolved.proxies.https.as_deref(), Some("http://127.0.0.1:3128"));
    }

    #[test]
    fn defaults() {
        let config = FetchConfig::default();

        assert_eq!(config.template, DEFAULT_TEMPLATE);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert!(!config.skip_existing);
        assert!(!config.convert_webp_to_png);
        assert!(config.headers["User-Agent"].starts_with("tile-crawler/"));
    }

    #[test]
    fn zero_concurrency_is_raised() {
        let settings = FetchSettings {
            concurrency: Some(0),
            ..FetchSettings::default()
        };
        assert_eq!(settings.resolve().concurrency, 1);
    }

    #[test]
    fn url_format_carries_tokens() {
        let config = FetchSettings {
            template: Some("{z}/{x}/{y}?sign={sign}".to_owned()),
            tokens: maplit::btreemap! { "sign".to_owned() => "s".to_owned() },
            ..FetchSettings::default()
        }
        .resolve();

        let url = config.url_format().tile_url(&crate::Tile::new(1, 2, 3));
        assert_eq!(url, "3/1/2?sign=s");
    }

    #[test]
    fn missing_config_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        assert!(FileConfig::load(&path).is_err());
    }
}
