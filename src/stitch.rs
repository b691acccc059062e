//! Compositing stored tiles into one large raster.

use anyhow::{anyhow, Context, Result};
use image::{imageops, DynamicImage, ImageFormat, RgbaImage};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::bounding_box::BoundingBox;
use crate::store::{self, TileStore};
use crate::tile::TileRect;

pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Largest RGBA canvas a stitch allocates, 4 GiB.
pub const MAX_CANVAS_BYTES: u64 = 1 << 32;

/// Output formats with an encoder compiled in.
const OUTPUT_FORMATS: &[ImageFormat] = &[ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::WebP];

/// Result of a stitch. Missing tiles don't make a stitch fail; they're only
/// counted here.
#[derive(Clone, Debug, PartialEq)]
pub struct StitchReport {
    pub z: u8,
    pub x_min: usize,
    pub x_max: usize,
    pub y_min: usize,
    pub y_max: usize,
    pub cols: usize,
    pub rows: usize,
    pub total: usize,
    pub missing: usize,
    pub output: PathBuf,
}

impl StitchReport {
    /// Share of the rectangle that had no usable tile, from 0 to 1.
    pub fn missing_ratio(&self) -> f64 {
        self.missing as f64 / self.total as f64
    }

    pub fn is_complete(&self) -> bool {
        self.missing == 0
    }
}

impl fmt::Display for StitchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "zoom {}: x {}..{} ({} cols), y {}..{} ({} rows), {} tiles, {} missing -> {}",
            self.z,
            self.x_min,
            self.x_max,
            self.cols,
            self.y_min,
            self.y_max,
            self.rows,
            self.total,
            self.missing,
            self.output.display()
        )
    }
}

/// Parses an output format name such as `png`, `PNG`, `jpg` or `webp`.
pub fn parse_format(name: &str) -> Result<ImageFormat> {
    ImageFormat::from_extension(name.to_ascii_lowercase())
        .filter(|format| OUTPUT_FORMATS.contains(format))
        .ok_or_else(|| anyhow!("unsupported image format `{}`, use png, jpg or webp", name))
}

/// Composites every tile of `rect` from `store` into a single image at
/// `output`.
///
/// The canvas starts fully transparent. Absent tiles and tiles that fail to
/// decode are counted as missing and leave their cell transparent. Without an
/// explicit `format`, it's taken from `output`'s extension, falling back to
/// PNG; an `output` without extension gets the format's extension.
pub fn stitch(
    store: &TileStore,
    rect: TileRect,
    output: &Path,
    tile_size: u32,
    format: Option<ImageFormat>,
) -> Result<StitchReport> {
    let cols = rect.cols();
    let rows = rect.rows();
    let width = canvas_side(cols, tile_size)?;
    let height = canvas_side(rows, tile_size)?;
    check_canvas(width, height)?;

    let mut canvas = RgbaImage::new(width, height);
    let mut missing = 0;

    let pb = ProgressBar::new(rect.tile_count() as u64);
    if let Ok(style) = ProgressStyle::with_template("{bar:60.green} {pos:>7}/{len:7} {msg}") {
        pb.set_style(style);
    }

    for tile in pb.wrap_iter(rect.tiles()) {
        let path = match store.resolve(&tile) {
            Some(path) => path,
            None => {
                missing += 1;
                continue;
            }
        };

        let image = match store::decode_file(&path) {
            Ok(image) => image.to_rgba8(),
            Err(e) => {
                warn!(tile = %tile, error = %e, "unreadable tile, treating as missing");
                missing += 1;
                continue;
            }
        };

        let image = if image.width() > tile_size || image.height() > tile_size {
            imageops::crop_imm(&image, 0, 0, tile_size, tile_size).to_image()
        } else {
            image
        };

        let px = ((tile.x - rect.x_min) as u32 * tile_size) as i64;
        let py = ((tile.y - rect.y_min) as u32 * tile_size) as i64;
        imageops::overlay(&mut canvas, &image, px, py);
    }
    pb.finish_and_clear();

    let format = match format {
        Some(format) => format,
        None => ImageFormat::from_path(output).unwrap_or(ImageFormat::Png),
    };
    let output = if output.extension().is_some() {
        output.to_path_buf()
    } else {
        output.with_extension(format.extensions_str().first().copied().unwrap_or("png"))
    };

    save(canvas, &output, format)?;

    let report = StitchReport {
        z: rect.z,
        x_min: rect.x_min,
        x_max: rect.x_max,
        y_min: rect.y_min,
        y_max: rect.y_max,
        cols,
        rows,
        total: rect.tile_count(),
        missing,
        output,
    };
    info!(%report, "stitched tiles");

    Ok(report)
}

/// Stitches `bbox` once per zoom level into `output_dir`, naming each image
/// `<min_lon>_<min_lat>_<max_lon>_<max_lat>_z<zoom>.<ext>`, PNG unless
/// `format` says otherwise.
///
/// A zoom level that fails doesn't stop the others.
pub fn stitch_zooms(
    store: &TileStore,
    bbox: &BoundingBox,
    zooms: RangeInclusive<u8>,
    output_dir: &Path,
    tile_size: u32,
    format: Option<ImageFormat>,
) -> Vec<(u8, Result<StitchReport>)> {
    let stem = bbox.file_stem();
    let ext = format.map_or("png", |f| f.extensions_str().first().copied().unwrap_or("png"));

    zooms
        .map(|z| {
            let output = output_dir.join(format!("{}_z{}.{}", stem, z, ext));
            let rect = bbox.tile_rect(z);
            info!(%rect, output = %output.display(), "stitching zoom level");
            (z, stitch(store, rect, &output, tile_size, format))
        })
        .collect()
}

fn canvas_side(tiles: usize, tile_size: u32) -> Result<u32> {
    u32::try_from(tiles)
        .ok()
        .and_then(|n| n.checked_mul(tile_size))
        .ok_or_else(|| anyhow!("{} tiles of {} px exceed the maximum image size", tiles, tile_size))
}

fn check_canvas(width: u32, height: u32) -> Result<()> {
    let bytes = u64::from(width)
        .checked_mul(u64::from(height))
        .and_then(|px| px.checked_mul(4))
        .filter(|bytes| *bytes <= MAX_CANVAS_BYTES);

    match bytes {
        Some(_) => Ok(()),
        None => Err(anyhow!(
            "a {}x{} px canvas exceeds the limit of {} bytes, stitch a smaller area or zoom",
            width,
            height,
            MAX_CANVAS_BYTES
        )),
    }
}

/// Encodes the canvas next to `output` and renames it into place.
fn save(canvas: RgbaImage, output: &Path, format: ImageFormat) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed creating directory {}", parent.display()))?;
    }

    let image = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(canvas).to_rgb8()),
        _ => DynamicImage::ImageRgba8(canvas),
    };

    let temp = store::temp_path(output);
    if let Err(e) = image.save_with_format(&temp, format) {
        let _ = std::fs::remove_file(&temp);
        return Err(e).with_context(|| format!("failed encoding {}", output.display()));
    }

    std::fs::rename(&temp, output).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        anyhow!(e).context(format!("failed writing {}", output.display()))
    })
}
