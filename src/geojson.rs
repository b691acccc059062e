//! Bounding boxes of GeoJSON documents.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;

use crate::bounding_box::BoundingBox;
use crate::error::InputError;

/// Reads a GeoJSON file (FeatureCollection, Feature or bare geometry) and
/// returns the bounding box of every coordinate it contains.
pub fn bbox_from_file(path: &Path) -> Result<BoundingBox> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading GeoJSON file {}", path.display()))?;
    let doc: Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing GeoJSON file {}", path.display()))?;

    Ok(bbox_from_value(&doc)?)
}

pub fn bbox_from_value(doc: &Value) -> Result<BoundingBox, InputError> {
    let mut positions = Vec::new();
    collect_positions(doc, &mut positions);

    let (first, rest) = positions.split_first().ok_or(InputError::EmptyGeometry)?;
    let init = (first[0], first[1], first[0], first[1]);
    let (min_lon, min_lat, max_lon, max_lat) =
        rest.iter().fold(init, |(x0, y0, x1, y1), p| {
            (x0.min(p[0]), y0.min(p[1]), x1.max(p[0]), y1.max(p[1]))
        });

    Ok(BoundingBox::new(min_lon, min_lat, max_lon, max_lat))
}

fn collect_positions(obj: &Value, out: &mut Vec<[f64; 2]>) {
    match obj.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => each(obj.get("features"), out),
        Some("Feature") => {
            if let Some(geometry) = obj.get("geometry") {
                collect_positions(geometry, out);
            }
        }
        Some("GeometryCollection") => each(obj.get("geometries"), out),
        Some("Point") | Some("MultiPoint") | Some("LineString") | Some("MultiLineString")
        | Some("Polygon") | Some("MultiPolygon") => {
            if let Some(coords) = obj.get("coordinates") {
                walk_coordinates(coords, out);
            }
        }
        _ => {}
    }
}

fn each(list: Option<&Value>, out: &mut Vec<[f64; 2]>) {
    if let Some(items) = list.and_then(Value::as_array) {
        for item in items {
            collect_positions(item, out);
        }
    }
}

/// Descends nested coordinate arrays down to `[lon, lat, ...]` positions.
fn walk_coordinates(coords: &Value, out: &mut Vec<[f64; 2]>) {
    let items = match coords.as_array() {
        Some(items) => items,
        None => return,
    };

    match (items.get(0).and_then(Value::as_f64), items.get(1).and_then(Value::as_f64)) {
        (Some(lon), Some(lat)) => out.push([lon, lat]),
        _ => {
            for item in items {
                walk_coordinates(item, out);
            }
        }
    }
}
