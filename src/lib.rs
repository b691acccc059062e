//! Download slippy-map tiles to your disk en-masse and stitch them into
//! large images.
//!
//! **Use with caution.** Downloading tiles en-masse can easily overload a
//! tile server. Respect the usage policy of the server you point this at.
//!
//! # Usage
//!
//! The crate ships a CLI, `tile-crawler`, with the subcommands `fetch`,
//! `stitch`, `stitch-all` and `stats`. Run it with `-h` / `--help` for the
//! full list of options.
//!
//! It is also available as a library.
//!
//! # CLI Example
//!
//! ```bash
//! tile-crawler fetch \
//!   --url "https://{s}.tile.openstreetmap.de/{z}/{x}/{y}.png" \
//!   --bbox 116.3,39.8,116.5,40.0 \
//!   --zoom 10 \
//!   --output ./tiles \
//!   --concurrency 8
//!
//! tile-crawler stitch --zoom 10 --bbox 116.3,39.8,116.5,40.0 \
//!   --input ./tiles --output beijing_z10.png
//! ```
//!
//! # Library Example
//! ```rust,no_run
//! use std::path::Path;
//! use tile_crawler::{batch, stitch, Area, BoundingBox, FetchSettings};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = FetchSettings {
//!     template: Some("https://tile.openstreetmap.org/{z}/{x}/{y}.png".into()),
//!     outdir: Some("./tiles".into()),
//!     concurrency: Some(4),
//!     ..FetchSettings::default()
//! }
//! .resolve();
//!
//! let bbox = BoundingBox::new(116.3, 39.8, 116.5, 40.0);
//! batch::run(&config, &Area::Bbox(bbox), Some(10), false).await?;
//!
//! let report = stitch(&config.store(), bbox.tile_rect(10), Path::new("beijing.png"), 256, None)?;
//! println!("{} of {} tiles missing", report.missing, report.total);
//! # Ok(())
//! # }
//! ```

pub mod batch;
mod bounding_box;
pub mod config;
mod error;
mod fetch;
pub mod geojson;
pub mod store;
mod stitch;
mod tile;
mod url;

pub use batch::{Area, JobReport, Outcome, Plan};
pub use bounding_box::BoundingBox;
pub use config::{FetchConfig, FetchSettings, FileConfig, JobSpec};
pub use error::InputError;
pub use fetch::{
    convert_webp_to_png, infer_extension, BatchReport, FetchOptions, FetchResult, Fetcher,
};
pub use stitch::{parse_format, stitch, stitch_zooms, StitchReport, DEFAULT_TILE_SIZE};
pub use store::TileStore;
pub use tile::{tiles_per_side, GeoPoint, Tile, TileRect, LAT_LIMIT, MAX_ZOOM};
pub use url::UrlFormat;
