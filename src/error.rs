use thiserror::Error;

use crate::tile::MAX_ZOOM;

/// Invalid input for a single fetch or stitch operation.
///
/// These block the affected operation from starting; in a job list they
/// skip the job instead of aborting the run.
#[derive(Debug, Error, PartialEq)]
pub enum InputError {
    #[error("bbox must be `min_lon,min_lat,max_lon,max_lat`, got `{0}`")]
    InvalidBbox(String),

    #[error("range must be two integers separated by a comma, got `{0}`")]
    InvalidRange(String),

    #[error("a zoom level is required")]
    MissingZoom,

    #[error("zoom {0} exceeds the maximum of {}", MAX_ZOOM)]
    ZoomTooDeep(u8),

    #[error("either a bbox or a GeoJSON file is required")]
    MissingArea,

    #[error("no coordinates found in GeoJSON")]
    EmptyGeometry,
}
