use std::f64::consts::PI;
use std::fmt;

/// Northern- and southernmost latitude representable in Web-Mercator.
pub const LAT_LIMIT: f64 = 85.05112878;
const LON_LIMIT: f64 = 180_f64;

/// Deepest zoom level accepted anywhere in the crate.
pub const MAX_ZOOM: u8 = 30;

/// A geographic position in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Saturates latitude into the Mercator-valid range and longitude into
    /// `[-180, 180]`.
    pub fn clamped(self) -> Self {
        Self {
            lat: clamp_lat(self.lat),
            lon: clamp_lon(self.lon),
        }
    }
}

pub(crate) fn clamp_lat(lat: f64) -> f64 {
    lat.max(-LAT_LIMIT).min(LAT_LIMIT)
}

pub(crate) fn clamp_lon(lon: f64) -> f64 {
    lon.max(-LON_LIMIT).min(LON_LIMIT)
}

/// Number of tiles along one axis at `zoom`. Zoom levels beyond
/// [`MAX_ZOOM`] count as [`MAX_ZOOM`].
pub fn tiles_per_side(zoom: u8) -> usize {
    1usize << zoom.min(MAX_ZOOM)
}

/// Fractional tile column of `lon` at `zoom`, unclamped.
pub(crate) fn lon_to_x(lon_deg: f64, zoom: u8) -> f64 {
    (lon_deg + 180_f64) / 360_f64 * tiles_per_side(zoom) as f64
}

/// Fractional tile row of `lat` at `zoom`, unclamped.
pub(crate) fn lat_to_y(lat_deg: f64, zoom: u8) -> f64 {
    let lat_rad = lat_deg.to_radians();
    let merc = (lat_rad.tan() + 1_f64 / lat_rad.cos()).ln();

    (1_f64 - merc / PI) / 2_f64 * tiles_per_side(zoom) as f64
}

/// Floors a fractional tile coordinate and saturates it into `[0, 2^zoom - 1]`.
pub(crate) fn saturate(coord: f64, zoom: u8) -> usize {
    let max = (tiles_per_side(zoom) - 1) as f64;
    let floored = coord.floor();

    if floored.is_nan() || floored <= 0_f64 {
        0
    } else if floored >= max {
        max as usize
    } else {
        floored as usize
    }
}

/// A slippy-map tile with x, y and z-coordinate.
/// ref: https://wiki.openstreetmap.org/wiki/Slippy_map_tilenames
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Tile {
    pub x: usize,
    pub y: usize,
    pub z: u8,
}

impl Tile {
    pub fn new(x: usize, y: usize, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Projects a position given in degrees onto the tile containing it.
    ///
    /// Out-of-range input never fails: the position is clamped to the
    /// Mercator-valid area and the resulting indices are saturated into
    /// `[0, 2^zoom - 1]`. A zoom beyond [`MAX_ZOOM`] is lowered to it.
    ///
    /// # Example
    /// ```rust
    /// # use tile_crawler::Tile;
    /// let tile = Tile::from_lat_lon(90.0, 200.0, 5);
    /// assert_eq!((tile.x, tile.y), (31, 0));
    /// ```
    pub fn from_lat_lon(lat_deg: f64, lon_deg: f64, zoom: u8) -> Self {
        let zoom = zoom.min(MAX_ZOOM);
        let p = GeoPoint::new(lat_deg, lon_deg).clamped();

        Self::new(
            saturate(lon_to_x(p.lon, zoom), zoom),
            saturate(lat_to_y(p.lat, zoom), zoom),
            zoom,
        )
    }

    pub fn from_point(point: GeoPoint, zoom: u8) -> Self {
        Self::from_lat_lon(point.lat, point.lon, zoom)
    }

    /// The north-west corner of the tile.
    pub fn nw_corner(&self) -> GeoPoint {
        self.position(self.x as f64, self.y as f64)
    }

    /// The geographic center of the tile.
    pub fn center(&self) -> GeoPoint {
        self.position(self.x as f64 + 0.5, self.y as f64 + 0.5)
    }

    fn position(&self, x: f64, y: f64) -> GeoPoint {
        let n = tiles_per_side(self.z) as f64;
        let lon = x / n * 360_f64 - 180_f64;
        let lat = (PI * (1_f64 - 2_f64 * y / n)).sinh().atan().to_degrees();

        GeoPoint::new(lat, lon)
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// An inclusive rectangle of tile indices at a fixed zoom.
///
/// Construction through [`TileRect::new`] keeps `x_min <= x_max` and
/// `y_min <= y_max`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TileRect {
    pub z: u8,
    pub x_min: usize,
    pub x_max: usize,
    pub y_min: usize,
    pub y_max: usize,
}

impl TileRect {
    /// Creates a rectangle from two (possibly reversed) index pairs.
    pub fn new(z: u8, (x1, x2): (usize, usize), (y1, y2): (usize, usize)) -> Self {
        Self {
            z,
            x_min: x1.min(x2),
            x_max: x1.max(x2),
            y_min: y1.min(y2),
            y_max: y1.max(y2),
        }
    }

    pub fn cols(&self) -> usize {
        self.x_max - self.x_min + 1
    }

    pub fn rows(&self) -> usize {
        self.y_max - self.y_min + 1
    }

    pub fn tile_count(&self) -> usize {
        self.cols() * self.rows()
    }

    pub fn contains(&self, tile: &Tile) -> bool {
        tile.z == self.z
            && (self.x_min..=self.x_max).contains(&tile.x)
            && (self.y_min..=self.y_max).contains(&tile.y)
    }

    /// Saturates both corners into `[0, 2^z - 1]`, dropping indices that
    /// can't exist at this zoom.
    pub fn saturated(self) -> Self {
        let max = tiles_per_side(self.z) - 1;

        Self::new(
            self.z.min(MAX_ZOOM),
            (self.x_min.min(max), self.x_max.min(max)),
            (self.y_min.min(max), self.y_max.min(max)),
        )
    }

    /// Iterates over every tile in the rectangle, column by column.
    pub fn tiles(&self) -> impl Iterator<Item = Tile> + fmt::Debug {
        let TileRect {
            z,
            x_min,
            x_max,
            y_min,
            y_max,
        } = *self;

        (x_min..=x_max).flat_map(move |x| (y_min..=y_max).map(move |y| Tile::new(x, y, z)))
    }
}

impl fmt::Display for TileRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "zoom {} X {}..{} Y {}..{} ({} tiles)",
            self.z,
            self.x_min,
            self.x_max,
            self.y_min,
            self.y_max,
            self.tile_count()
        )
    }
}
