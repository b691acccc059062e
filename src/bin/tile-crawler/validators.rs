use serde_json::Value;
use std::collections::BTreeMap;
use tile_crawler::{parse_format, BoundingBox, InputError, MAX_ZOOM};

pub fn is_numeric_min(min: usize) -> impl Fn(String) -> Result<(), String> {
    move |v: String| {
        let val = v
            .parse::<usize>()
            .map_err(|_| "must be numeric".to_owned())?;

        if val < min {
            return Err(format!("must be >= {}", min));
        }

        Ok(())
    }
}

pub fn is_zoom(v: String) -> Result<(), String> {
    let val = v.parse::<u8>().map_err(|_| "must be numeric".to_owned())?;

    if val > MAX_ZOOM {
        return Err(format!("must be <= {}", MAX_ZOOM));
    }

    Ok(())
}

pub fn is_bbox(v: String) -> Result<(), String> {
    v.parse::<BoundingBox>()
        .map(|_| ())
        .map_err(|e| e.to_string())
}

pub fn is_range(v: String) -> Result<(), String> {
    parse_range(&v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn is_format(v: String) -> Result<(), String> {
    parse_format(&v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn is_header(v: String) -> Result<(), String> {
    parse_header(&v)
        .map(|_| ())
        .ok_or_else(|| "must look like `Name: value`".to_owned())
}

pub fn is_token(v: String) -> Result<(), String> {
    parse_token(&v)
        .map(|_| ())
        .ok_or_else(|| "must look like `key=value`".to_owned())
}

pub fn is_json_object(v: String) -> Result<(), String> {
    parse_json_object(&v).map(|_| ())
}

/// Parses an inclusive `min,max` index range, in either order.
pub fn parse_range(v: &str) -> Result<(usize, usize), InputError> {
    let err = || InputError::InvalidRange(v.to_owned());

    let (a, b) = v.split_once(',').ok_or_else(err)?;
    let a = a.trim().parse::<usize>().map_err(|_| err())?;
    let b = b.trim().parse::<usize>().map_err(|_| err())?;

    Ok((a.min(b), a.max(b)))
}

pub fn parse_header(v: &str) -> Option<(String, String)> {
    let (name, value) = v.split_once(':')?;
    let name = name.trim();

    if name.is_empty() {
        return None;
    }

    Some((name.to_owned(), value.trim().to_owned()))
}

pub fn parse_token(v: &str) -> Option<(String, String)> {
    let (key, value) = v.split_once('=')?;
    let key = key.trim();

    if key.is_empty() {
        return None;
    }

    Some((key.to_owned(), value.to_owned()))
}

/// Parses a JSON object of scalars, stringifying numbers and booleans.
pub fn parse_json_object(v: &str) -> Result<BTreeMap<String, String>, String> {
    let map = serde_json::from_str::<BTreeMap<String, Value>>(v)
        .map_err(|e| format!("must be a JSON object: {}", e))?;

    Ok(map
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}
