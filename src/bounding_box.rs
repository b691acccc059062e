use std::fmt;
use std::str::FromStr;

use crate::error::InputError;
use crate::tile::{
    clamp_lat, clamp_lon, lat_to_y, lon_to_x, saturate, GeoPoint, TileRect, MAX_ZOOM,
};

/// A geographic bounding box given in degrees.
///
/// # Example
/// ```rust
/// # use tile_crawler::BoundingBox;
/// let beijing: BoundingBox = "116.3,39.8,116.5,40.0".parse().unwrap();
/// assert_eq!(beijing.max_lat, 40.0);
/// ```
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Creates a bounding box, swapping the bounds of each axis if they're
    /// given in reverse order.
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon: min_lon.min(max_lon),
            min_lat: min_lat.min(max_lat),
            max_lon: min_lon.max(max_lon),
            max_lat: min_lat.max(max_lat),
        }
    }

    /// The geometric center of the box.
    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.min_lat + self.max_lat) / 2_f64,
            (self.min_lon + self.max_lon) / 2_f64,
        )
    }

    /// Computes the inclusive rectangle of tiles covering the box at `zoom`.
    ///
    /// This is the single routine both the fetch and the stitch path use, so
    /// the same box and zoom always address the same tiles.
    ///
    /// The northern edge yields the numerically smaller row because tile rows
    /// grow southward.
    ///
    /// # Panics
    /// Panics if `zoom` exceeds [`MAX_ZOOM`].
    pub fn tile_rect(&self, zoom: u8) -> TileRect {
        assert!(zoom <= MAX_ZOOM);

        let min_lon = clamp_lon(self.min_lon);
        let max_lon = clamp_lon(self.max_lon);
        let north = clamp_lat(self.max_lat);
        let south = clamp_lat(self.min_lat);

        let x_min = saturate(lon_to_x(min_lon, zoom), zoom);
        let x_max = saturate(lon_to_x(max_lon, zoom), zoom);
        let y_min = saturate(lat_to_y(north, zoom), zoom);
        let y_max = saturate(lat_to_y(south, zoom), zoom);

        TileRect::new(zoom, (x_min, x_max), (y_min, y_max))
    }

    /// Formats the box for use in file names, eg. `116.3000_39.8000_116.5000_40.0000`.
    pub fn file_stem(&self) -> String {
        format!(
            "{:.4}_{:.4}_{:.4}_{:.4}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

impl FromStr for BoundingBox {
    type Err = InputError;

    /// Parses `min_lon,min_lat,max_lon,max_lat`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| InputError::InvalidBbox(s.to_owned()))?;

        match parts.as_slice() {
            [min_lon, min_lat, max_lon, max_lat]
                if parts.iter().all(|v| v.is_finite()) =>
            {
                Ok(Self::new(*min_lon, *min_lat, *max_lon, *max_lat))
            }
            _ => Err(InputError::InvalidBbox(s.to_owned())),
        }
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}
