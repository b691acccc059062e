//! File system backed tile storage laid out as `<root>/<z>/<x>/<y>.<ext>`.
//!
//! Tiles are never modified in place: every write goes to a uniquely named
//! temporary sibling which is then renamed onto its final path, so a reader
//! only ever sees complete files.

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat, ImageReader, RgbaImage};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fs, process};
use tracing::debug;

use crate::bounding_box::BoundingBox;
use crate::tile::{Tile, TileRect, MAX_ZOOM};

/// Stored tile formats in lookup priority order.
pub const PREFERRED_EXTENSIONS: &[&str] = &["png", "webp", "jpg", "jpeg"];

const TEMP_EXTENSION: &str = "part";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug, PartialEq)]
pub struct TileStore {
    root: PathBuf,
}

/// Geographic extent of the deepest zoom level present in a store.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coverage {
    pub rect: TileRect,
    pub bbox: BoundingBox,
}

impl TileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the tile without any extension, `<root>/<z>/<x>/<y>`.
    pub fn tile_base(&self, tile: &Tile) -> PathBuf {
        let mut path = self.root.join(tile.z.to_string());
        path.push(tile.x.to_string());
        path.push(tile.y.to_string());
        path
    }

    /// Finds the stored file for `tile`.
    ///
    /// Checks [`PREFERRED_EXTENSIONS`] in order, then falls back to any file in
    /// the column directory whose stem is the tile's row. File contents are not
    /// validated.
    pub fn resolve(&self, tile: &Tile) -> Option<PathBuf> {
        let base = self.tile_base(tile);

        let preferred = PREFERRED_EXTENSIONS
            .iter()
            .map(|ext| base.with_extension(ext))
            .find(|p| p.is_file());
        if preferred.is_some() {
            return preferred;
        }

        let stem = tile.y.to_string();
        let entries = fs::read_dir(base.parent()?).ok()?;
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| {
                p.is_file()
                    && p.file_stem().map_or(false, |s| s == stem.as_str())
                    && !is_temp(p)
            })
    }

    /// Atomically stores `bytes` as the image for `tile`.
    pub async fn write(&self, tile: &Tile, bytes: &[u8], ext_hint: &str) -> Result<PathBuf> {
        let base = self.tile_base(tile);
        ensure_parent(&base).await?;

        let temp = temp_path(&base);
        if let Err(e) = tokio::fs::write(&temp, bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e).with_context(|| format!("failed writing tile {}", tile));
        }

        publish(&temp, &final_path(&base, ext_hint)).await
    }

    /// Raw bytes of the stored tile, if any.
    pub fn read(&self, tile: &Tile) -> Result<Option<Vec<u8>>> {
        match self.resolve(tile) {
            Some(path) => fs::read(&path)
                .with_context(|| format!("failed reading {}", path.display()))
                .map(Some),
            None => Ok(None),
        }
    }

    /// The stored tile as PNG bytes, transcoding other formats on the fly.
    pub fn read_png(&self, tile: &Tile) -> Result<Option<Vec<u8>>> {
        let path = match self.resolve(tile) {
            Some(path) => path,
            None => return Ok(None),
        };

        if has_extension(&path, "png") {
            return self.read(tile);
        }

        let image = decode_file(&path)?;
        encode_png(&DynamicImage::ImageRgba8(image.to_rgba8())).map(Some)
    }

    /// Number of stored tiles per zoom level.
    pub fn stats(&self) -> Result<BTreeMap<u8, usize>> {
        let mut stats = BTreeMap::new();

        for (z, z_dir) in numeric_children(&self.root)? {
            if z > MAX_ZOOM as usize {
                continue;
            }
            let mut count = 0;
            for (_, x_dir) in numeric_children(&z_dir)? {
                count += stored_rows(&x_dir)?.len();
            }
            stats.insert(z as u8, count);
        }

        Ok(stats)
    }

    /// Estimates which area the deepest populated zoom level covers.
    pub fn coverage(&self) -> Result<Option<Coverage>> {
        let deepest = numeric_children(&self.root)?
            .into_iter()
            .filter(|(z, _)| *z <= MAX_ZOOM as usize)
            .max_by_key(|(z, _)| *z);
        let (z, z_dir) = match deepest {
            Some(found) => found,
            None => return Ok(None),
        };

        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for (x, x_dir) in numeric_children(&z_dir)? {
            let rows = stored_rows(&x_dir)?;
            if !rows.is_empty() {
                xs.push(x);
                ys.extend(rows);
            }
        }

        let (x_min, x_max) = match (xs.iter().min(), xs.iter().max()) {
            (Some(min), Some(max)) => (*min, *max),
            _ => return Ok(None),
        };
        let (y_min, y_max) = match (ys.iter().min(), ys.iter().max()) {
            (Some(min), Some(max)) => (*min, *max),
            _ => return Ok(None),
        };

        let z = z as u8;
        let nw = Tile::new(x_min, y_min, z).nw_corner();
        let se = Tile::new(x_max + 1, y_max + 1, z).nw_corner();

        Ok(Some(Coverage {
            rect: TileRect::new(z, (x_min, x_max), (y_min, y_max)),
            bbox: BoundingBox::new(nw.lon, se.lat, se.lon, nw.lat),
        }))
    }
}

/// Returns the already stored, non-empty file for `base`, if any.
///
/// A base with an extension is checked as-is; otherwise the bare path and
/// every preferred extension are tried.
pub fn existing_file(base: &Path) -> Option<PathBuf> {
    let non_empty = |p: &Path| fs::metadata(p).map_or(false, |m| m.is_file() && m.len() > 0);

    if non_empty(base) {
        return Some(base.to_path_buf());
    }
    if base.extension().is_some() {
        return None;
    }

    PREFERRED_EXTENSIONS
        .iter()
        .map(|ext| base.with_extension(ext))
        .find(|p| non_empty(p))
}

/// A temporary sibling of `base` unique to this process and call.
pub fn temp_path(base: &Path) -> PathBuf {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = OsString::from(base.as_os_str());
    name.push(format!(".{}-{}.{}", process::id(), seq, TEMP_EXTENSION));
    PathBuf::from(name)
}

/// The published path of `base`: kept as-is if it already carries an
/// extension, otherwise `ext` is appended.
pub fn final_path(base: &Path, ext: &str) -> PathBuf {
    if base.extension().is_some() {
        base.to_path_buf()
    } else {
        base.with_extension(ext.trim_start_matches('.'))
    }
}

/// Renames a fully written temporary file onto its final path.
///
/// On failure the temporary file is removed and nothing is left at `target`.
pub async fn publish(temp: &Path, target: &Path) -> Result<PathBuf> {
    match tokio::fs::rename(temp, target).await {
        Ok(()) => {
            debug!(path = %target.display(), "published tile");
            Ok(target.to_path_buf())
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(temp).await;
            Err(e).with_context(|| format!("failed moving tile into {}", target.display()))
        }
    }
}

pub(crate) async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed creating directory {}", parent.display()))?;
    }
    Ok(())
}

/// A fully transparent square PNG, served in place of absent tiles.
pub fn placeholder_png(size: u32) -> Result<Vec<u8>> {
    encode_png(&DynamicImage::ImageRgba8(RgbaImage::new(size, size)))
}

pub(crate) fn decode_file(path: &Path) -> Result<DynamicImage> {
    ImageReader::open(path)
        .with_context(|| format!("failed opening {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed reading {}", path.display()))?
        .decode()
        .with_context(|| format!("failed decoding {}", path.display()))
}

pub(crate) fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .context("failed encoding PNG")?;
    Ok(buf.into_inner())
}

pub(crate) fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case(ext))
}

fn is_temp(path: &Path) -> bool {
    has_extension(path, TEMP_EXTENSION)
}

/// Subdirectories of `dir` whose names are plain integers.
fn numeric_children(dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let entries =
        fs::read_dir(dir).with_context(|| format!("failed listing {}", dir.display()))?;

    Ok(entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|p| {
            let n = p.file_name()?.to_str()?.parse().ok()?;
            Some((n, p))
        })
        .collect())
}

/// Rows of the tiles stored in a column directory.
fn stored_rows(x_dir: &Path) -> Result<Vec<usize>> {
    let entries =
        fs::read_dir(x_dir).with_context(|| format!("failed listing {}", x_dir.display()))?;

    Ok(entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && !is_temp(p))
        .filter_map(|p| p.file_stem()?.to_str()?.parse().ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn store() -> (tempfile::TempDir, TileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path());
        (dir, store)
    }

    fn put(store: &TileStore, tile: &Tile, ext: &str, bytes: &[u8]) -> PathBuf {
        let path = store.tile_base(tile).with_extension(ext);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, bytes).unwrap();
        path
    }

    fn png_bytes() -> Vec<u8> {
        let image = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        encode_png(&DynamicImage::ImageRgba8(image)).unwrap()
    }

    #[test]
    fn layout() {
        let store = TileStore::new("tiles");
        assert_eq!(
            store.tile_base(&Tile::new(842, 387, 10)),
            Path::new("tiles/10/842/387")
        );
    }

    #[test]
    fn resolve_prefers_png() {
        let (_dir, store) = store();
        let tile = Tile::new(1, 2, 3);

        put(&store, &tile, "jpg", b"jpg");
        let webp = put(&store, &tile, "webp", b"webp");
        assert_eq!(store.resolve(&tile), Some(webp));

        let png = put(&store, &tile, "png", b"png");
        assert_eq!(store.resolve(&tile), Some(png));
    }

    #[test]
    fn resolve_falls_back_to_scan() {
        let (_dir, store) = store();
        let tile = Tile::new(1, 2, 3);
        assert_eq!(store.resolve(&tile), None);

        put(&store, &Tile::new(1, 22, 3), "png", b"other row");
        let gif = put(&store, &tile, "gif", b"gif");
        assert_eq!(store.resolve(&tile), Some(gif));
    }

    #[tokio::test]
    async fn write_publishes_atomically() {
        let (_dir, store) = store();
        let tile = Tile::new(5, 6, 7);

        let path = store.write(&tile, b"tile bytes", "webp").await.unwrap();
        assert_eq!(path, store.tile_base(&tile).with_extension("webp"));
        assert_eq!(fs::read(&path).unwrap(), b"tile bytes");

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_temp(&e.path()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn interrupted_write_is_invisible() {
        let (_dir, store) = store();
        let tile = Tile::new(5, 6, 7);
        let base = store.tile_base(&tile);
        fs::create_dir_all(base.parent().unwrap()).unwrap();

        // a download that died before being renamed
        fs::write(temp_path(&base), b"trunc").unwrap();

        assert_eq!(store.resolve(&tile), None);
        assert_eq!(existing_file(&base), None);
        assert_eq!(store.stats().unwrap().get(&7), Some(&0));
    }

    #[tokio::test]
    async fn failed_publish_cleans_up() {
        let (dir, _store) = store();
        let temp = temp_path(&dir.path().join("tile"));
        fs::write(&temp, b"data").unwrap();

        let target = dir.path().join("missing-dir").join("tile.png");
        assert!(publish(&temp, &target).await.is_err());
        assert!(!temp.exists());
        assert!(!target.exists());
    }

    #[test]
    fn temp_paths_are_unique() {
        let base = Path::new("out/1/2/3");
        assert_ne!(temp_path(base), temp_path(base));
        assert!(is_temp(&temp_path(base)));
    }

    #[test]
    fn final_path_keeps_existing_extension() {
        assert_eq!(final_path(Path::new("out/3"), ".jpg"), Path::new("out/3.jpg"));
        assert_eq!(final_path(Path::new("out/a.webp"), "png"), Path::new("out/a.webp"));
    }

    #[test]
    fn existing_file_ignores_empty_files() {
        let (_dir, store) = store();
        let tile = Tile::new(0, 0, 1);
        let base = store.tile_base(&tile);

        put(&store, &tile, "png", b"");
        assert_eq!(existing_file(&base), None);

        let jpg = put(&store, &tile, "jpg", b"data");
        assert_eq!(existing_file(&base), Some(jpg));
    }

    #[test]
    fn read_png_transcodes() {
        let (_dir, store) = store();
        let tile = Tile::new(0, 1, 1);
        assert_eq!(store.read_png(&tile).unwrap(), None);

        let image = RgbaImage::from_pixel(4, 4, Rgba([200, 0, 0, 255]));
        let path = store.tile_base(&tile).with_extension("jpg");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        DynamicImage::ImageRgba8(image)
            .to_rgb8()
            .save_with_format(&path, ImageFormat::Jpeg)
            .unwrap();

        let png = store.read_png(&tile).unwrap().unwrap();
        assert_eq!(image::guess_format(&png).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn read_png_passes_png_through() {
        let (_dir, store) = store();
        let tile = Tile::new(0, 1, 1);
        let bytes = png_bytes();
        put(&store, &tile, "png", &bytes);

        assert_eq!(store.read_png(&tile).unwrap(), Some(bytes));
    }

    #[test]
    fn placeholder_is_transparent() {
        let png = placeholder_png(256).unwrap();
        let image = image::load_from_memory(&png).unwrap().to_rgba8();

        assert_eq!(image.dimensions(), (256, 256));
        assert!(image.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn stats_and_coverage() {
        let (_dir, store) = store();
        assert_eq!(store.coverage().unwrap(), None);

        put(&store, &Tile::new(0, 0, 1), "png", b"a");
        put(&store, &Tile::new(4, 5, 3), "png", b"a");
        put(&store, &Tile::new(5, 6, 3), "jpg", b"a");
        put(&store, &Tile::new(5, 7, 3), "webp", b"a");

        let stats = store.stats().unwrap();
        assert_eq!(stats.get(&1), Some(&1));
        assert_eq!(stats.get(&3), Some(&3));

        let coverage = store.coverage().unwrap().unwrap();
        assert_eq!(coverage.rect, TileRect::new(3, (4, 5), (5, 7)));
        assert_eq!(coverage.bbox.min_lon, 0.0);
        assert_eq!(coverage.bbox.max_lon, 90.0);
        assert!(coverage.bbox.max_lat > coverage.bbox.min_lat);
    }
}
