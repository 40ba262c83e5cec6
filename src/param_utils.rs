use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, HashMap};

/// Extract a parameter as f64 with a default value
pub fn get_param_f64(params: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    params.get(key).copied().unwrap_or(default)
}

/// Extract a parameter as f64, clamped to a range with finite checks
pub fn get_param_f64_clamped(
    params: &HashMap<String, f64>,
    key: &str,
    default: f64,
    min: f64,
    max: f64,
) -> f64 {
    let raw = params.get(key).copied().unwrap_or(default);
    if !raw.is_finite() {
        return default;
    }
    raw.clamp(min, max)
}

/// Extract a parameter as usize, rounded and clamped to a range with finite checks
pub fn get_param_usize_rounded_clamped(
    params: &HashMap<String, f64>,
    key: &str,
    default: usize,
    min: usize,
    max: usize,
) -> usize {
    let raw = params.get(key).copied().unwrap_or(default as f64);
    if !raw.is_finite() {
        return default;
    }
    raw.round().clamp(min as f64, max as f64) as usize
}

pub fn coerce_binary_param(value: f64, default: f64) -> f64 {
    if !value.is_finite() {
        return default;
    }

    if value >= 0.5 {
        1.0
    } else {
        0.0
    }
}

/// Get a finite parameter value, returns None if not found or not finite
pub fn finite_param(params: &HashMap<String, f64>, key: &str) -> Option<f64> {
    params.get(key).copied().filter(|v| v.is_finite())
}

/// Parses `key=value` pairs such as `rsiPeriod=14` into a parameter map.
pub fn parse_parameter_assignments<S: AsRef<str>>(pairs: &[S]) -> Result<HashMap<String, f64>> {
    let mut params = HashMap::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Parameter {} must look like key=value", pair))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("Parameter {} has an empty name", pair));
        }
        let value: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("Parameter {} has a non-numeric value", key))?;
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

/// Parses grids such as `rsiPeriod=10,14,20` into value lists per key.
pub fn parse_parameter_ranges<S: AsRef<str>>(grids: &[S]) -> Result<BTreeMap<String, Vec<f64>>> {
    let mut ranges = BTreeMap::new();
    for grid in grids {
        let grid = grid.as_ref();
        let (key, values) = grid
            .split_once('=')
            .ok_or_else(|| anyhow!("Range {} must look like key=v1,v2,...", grid))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("Range {} has an empty name", grid));
        }
        let values = values
            .split(',')
            .map(|value| {
                value
                    .trim()
                    .parse::<f64>()
                    .with_context(|| format!("Range {} has a non-numeric value {:?}", key, value))
            })
            .collect::<Result<Vec<f64>>>()?;
        ranges.insert(key.to_string(), values);
    }
    Ok(ranges)
}
