use anyhow::{anyhow, bail, ensure, Context, Result};
use futures::{future, prelude::*, stream};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::Proxies;
use crate::store::{self, TileStore};
use crate::tile::TileRect;
use crate::url::UrlFormat;

/// Linear backoff unit: the n-th retry waits `n * BACKOFF_STEP`.
pub(crate) const BACKOFF_STEP: Duration = Duration::from_millis(500);
const ZERO_DURATION: Duration = Duration::from_secs(0);
const DEFAULT_EXTENSION: &str = "png";

/// Per-request behaviour of a [`Fetcher`].
#[derive(Clone, Debug, PartialEq)]
pub struct FetchOptions {
    /// Timeout of a single request; the zero duration disables it.
    pub timeout: Duration,
    /// Additional attempts after the first one failed.
    pub retries: u32,
    /// Treat an already stored, non-empty tile as done.
    pub skip_existing: bool,
    /// Write a PNG copy next to every downloaded WebP file.
    pub convert_webp_to_png: bool,
    pub backoff_step: Duration,
    pub headers: BTreeMap<String, String>,
    pub proxies: Proxies,
}

impl Default for FetchOptions {
    fn default() -> Self {
        crate::config::FetchConfig::default().fetch_options()
    }
}

/// Outcome of fetching a single tile.
#[derive(Debug)]
pub enum FetchResult {
    /// The tile is stored at the given path.
    Success(PathBuf),
    /// Every attempt failed; holds the error of the last one.
    Failure(anyhow::Error),
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchResult::Success(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            FetchResult::Success(path) => Some(path),
            FetchResult::Failure(_) => None,
        }
    }
}

/// Aggregated counts of a rectangle fetch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BatchReport {
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
}

impl BatchReport {
    pub fn record(&mut self, result: &FetchResult) {
        self.total += 1;
        if result.is_success() {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total {}, succeeded {}, failed {}",
            self.total, self.successes, self.failures
        )
    }
}

/// Downloads tiles over a shared HTTP client.
pub struct Fetcher {
    client: reqwest::Client,
    options: FetchOptions,
}

impl Fetcher {
    pub fn new(options: FetchOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if options.timeout > ZERO_DURATION {
            builder = builder.timeout(options.timeout);
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name `{}`", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header `{}`", name))?;
            headers.insert(name, value);
        }

        for proxy in options.proxies.to_reqwest()? {
            builder = builder.proxy(proxy);
        }

        let client = builder
            .default_headers(headers)
            .build()
            .context("failed creating HTTP client")?;

        Ok(Self { client, options })
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// Fetches `url` into `out_base`, retrying with linear backoff.
    ///
    /// `out_base` may omit the extension, in which case it's derived from the
    /// URL or the response's content type. With `skip_existing` set, an
    /// already stored non-empty file short-circuits without any request.
    pub async fn fetch_one(&self, url: &str, out_base: &Path) -> FetchResult {
        if self.options.skip_existing {
            if let Some(existing) = store::existing_file(out_base) {
                debug!(path = %existing.display(), "tile exists, skipping");
                return FetchResult::Success(existing);
            }
        }

        let mut attempt: u32 = 1;
        loop {
            match self.attempt(url, out_base).await {
                Ok(path) => return FetchResult::Success(path),
                Err(e) if attempt > self.options.retries => {
                    return FetchResult::Failure(e);
                }
                Err(e) => {
                    debug!(url, attempt, error = %e, "tile request failed, retrying");
                    tokio::time::sleep(self.options.backoff_step * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(&self, url: &str, out_base: &Path) -> Result<PathBuf> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed fetching {}", url))?;

        if response.status() != StatusCode::OK {
            bail!("received status {} fetching {}", response.status(), url);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        store::ensure_parent(out_base).await?;
        let temp = store::temp_path(out_base);
        if let Err(e) = stream_to_file(response, &temp).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.context(format!("failed streaming {} to disk", url)));
        }

        let ext = infer_extension(url, content_type.as_deref());
        store::publish(&temp, &store::final_path(out_base, &ext)).await
    }

    /// Fetches every tile of `rect` into `store`, with at most `concurrency`
    /// requests in flight.
    ///
    /// Individual failures never abort the batch; they're counted in the
    /// returned report.
    pub async fn fetch_rect(
        &self,
        url_fmt: &UrlFormat,
        store: &TileStore,
        rect: TileRect,
        concurrency: usize,
    ) -> BatchReport {
        let pb = progress_bar(rect.tile_count() as u64);

        let report = stream::iter(rect.tiles())
            .map(|tile| {
                let url = url_fmt.tile_url(&tile);
                let base = store.tile_base(&tile);

                async move {
                    let result = self.fetch_one(&url, &base).await;
                    match &result {
                        FetchResult::Success(path) if self.options.convert_webp_to_png => {
                            if let Err(e) = convert_webp_to_png(path).await {
                                warn!(tile = %tile, error = %e, "webp conversion failed");
                            }
                        }
                        FetchResult::Failure(e) => {
                            warn!(tile = %tile, url = %url, error = %e, "failed fetching tile");
                        }
                        _ => {}
                    }
                    result
                }
            })
            .buffer_unordered(concurrency.max(1))
            .fold(BatchReport::default(), |mut report, result| {
                report.record(&result);
                pb.inc(1);
                future::ready(report)
            })
            .await;

        pb.finish_and_clear();
        info!(%rect, %report, "finished fetching tiles");

        report
    }

    /// Requests a single URL and checks it yields a non-empty image.
    ///
    /// Used to gate a job before its bulk fetch, so bad credentials or
    /// templates are detected with one request.
    pub async fn probe(&self, url: &str) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("probe request to {} failed", url))?;

        let status = response.status();
        ensure!(status == StatusCode::OK, "probe returned HTTP {}", status);

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        ensure!(
            content_type.contains("image"),
            "probe returned non-image content type `{}`",
            content_type
        );

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            if !chunk.context("failed reading probe response")?.is_empty() {
                return Ok(());
            }
        }

        Err(anyhow!("probe returned an empty body"))
    }
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    let style = ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:60.cyan/blue} {pos:>7}/{len:7} ETA: {eta} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("##-");
    pb.set_style(style);
    pb
}

async fn stream_to_file(response: reqwest::Response, path: &Path) -> Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed creating {}", path.display()))?;

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;

    Ok(())
}

/// Derives the stored file extension of a download.
///
/// The URL path's extension wins, then the `image/*` subtype of the content
/// type (`jpeg` becomes `jpg`), then `png`.
pub fn infer_extension(url: &str, content_type: Option<&str>) -> String {
    let from_url = Url::parse(url).ok().and_then(|url| {
        let name = url.path_segments()?.last()?.to_owned();
        let ext = Path::new(&name).extension()?.to_str()?.to_ascii_lowercase();
        Some(ext).filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
    });
    if let Some(ext) = from_url {
        return ext;
    }

    let from_mime = content_type.and_then(|ct| {
        let mime = ct.split(';').next()?.trim().to_ascii_lowercase();
        let subtype = mime.strip_prefix("image/")?.to_owned();
        match subtype.as_str() {
            "" => None,
            "jpeg" => Some("jpg".to_owned()),
            _ => Some(subtype),
        }
    });

    from_mime.unwrap_or_else(|| DEFAULT_EXTENSION.to_owned())
}

/// Writes a PNG copy next to a WebP file.
///
/// Returns `Ok(None)` for anything that isn't WebP. Callers treat errors as
/// non-fatal; the original file stays in place either way.
pub async fn convert_webp_to_png(path: &Path) -> Result<Option<PathBuf>> {
    if !store::has_extension(path, "webp") {
        return Ok(None);
    }

    let src = path.to_path_buf();
    let png = tokio::task::spawn_blocking(move || {
        let image = store::decode_file(&src)?;
        store::encode_png(&image)
    })
    .await
    .context("webp conversion task failed")??;

    let target = path.with_extension("png");
    let temp = store::temp_path(&target);
    if let Err(e) = tokio::fs::write(&temp, &png).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e).with_context(|| format!("failed writing {}", target.display()));
    }

    store::publish(&temp, &target).await.map(Some)
}
