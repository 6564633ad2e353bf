use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::config::{DatasetDescriptor, DepthBand, SourceWindow};
use crate::domain::LonConvention;
use crate::error::SyncError;
use crate::granule::{CanonicalGranule, GridVariable, Provenance, RawGranule};

const RESOLUTION_EPSILON: f64 = 1e-9;

pub struct Harmonizer;

impl Harmonizer {
    pub fn harmonize(
        raw: &RawGranule,
        dataset: &DatasetDescriptor,
        window: &SourceWindow,
        date: NaiveDate,
    ) -> Result<CanonicalGranule, SyncError> {
        check_raw_shape(raw, window)?;

        let layer = select_layer(raw.depth.as_deref(), dataset.surface_band)?;
        let layer_len = raw.layer_len();
        let offset = layer.map(|(index, _)| index * layer_len).unwrap_or(0);

        let mut renamed = BTreeMap::new();
        let mut layers = Vec::with_capacity(dataset.variables.len());
        for canonical in &dataset.variables {
            let (native, variable) = window
                .variables
                .iter()
                .filter(|(_, target)| *target == canonical)
                .find_map(|(native, _)| raw.variables.get(native).map(|var| (native, var)))
                .ok_or_else(|| {
                    SyncError::Harmonization(format!(
                        "source {} provides no variable for canonical {canonical}",
                        window.source_id
                    ))
                })?;
            if native != canonical {
                renamed.insert(native.clone(), canonical.clone());
            }
            layers.push((
                canonical.clone(),
                variable.data[offset..offset + layer_len].to_vec(),
            ));
        }

        let rows = raw.lat.len();
        let lat: Vec<f64> = raw.lat.iter().map(|value| value.clamp(-90.0, 90.0)).collect();
        let (lon, order, lon_remapped) =
            normalize_lon_axis(&raw.lon, window.convention, dataset.convention);
        if lon_remapped {
            for (_, values) in layers.iter_mut() {
                *values = reorder_columns(values, rows, &order);
            }
        }

        let factor = resample_factor(window.resolution, dataset.target_resolution);
        let (lat, lon, layers) = if factor > 1 {
            let cols = lon.len();
            let layers = layers
                .into_iter()
                .map(|(name, values)| (name, block_mean(&values, rows, cols, factor)))
                .collect::<Vec<_>>();
            (axis_block_mean(&lat, factor), axis_block_mean(&lon, factor), layers)
        } else {
            (lat, lon, layers)
        };

        Ok(CanonicalGranule {
            dataset: dataset.id.clone(),
            date,
            lat,
            lon,
            variables: layers
                .into_iter()
                .map(|(name, values)| GridVariable { name, values })
                .collect(),
            provenance: Provenance {
                source_id: window.source_id.clone(),
                native_convention: window.convention,
                lon_remapped,
                depth_selected: layer.map(|(_, depth)| depth),
                resample_factor: factor,
                renamed,
                tool: format!("ocean-sync/{}", env!("CARGO_PKG_VERSION")),
            },
        })
    }
}

pub fn to_signed_longitude(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

pub fn to_positive_longitude(lon: f64) -> f64 {
    lon.rem_euclid(360.0)
}

pub fn block_mean(values: &[f64], rows: usize, cols: usize, factor: usize) -> Vec<f64> {
    let out_rows = rows.div_ceil(factor);
    let out_cols = cols.div_ceil(factor);
    let mut out = Vec::with_capacity(out_rows * out_cols);
    for block_row in 0..out_rows {
        for block_col in 0..out_cols {
            let mut sum = 0.0;
            let mut count = 0usize;
            for row in block_row * factor..((block_row + 1) * factor).min(rows) {
                for col in block_col * factor..((block_col + 1) * factor).min(cols) {
                    let value = values[row * cols + col];
                    if value.is_finite() {
                        sum += value;
                        count += 1;
                    }
                }
            }
            out.push(if count == 0 { f64::NAN } else { sum / count as f64 });
        }
    }
    out
}

fn axis_block_mean(axis: &[f64], factor: usize) -> Vec<f64> {
    axis.chunks(factor)
        .map(|chunk| chunk.iter().sum::<f64>() / chunk.len() as f64)
        .collect()
}

fn resample_factor(native: f64, target: f64) -> usize {
    if native + RESOLUTION_EPSILON >= target {
        return 1;
    }
    let ratio = target / native;
    let factor = ratio.round().max(1.0) as usize;
    if (ratio - factor as f64).abs() > 0.05 {
        tracing::warn!(native, target, factor, "resolution ratio is not integral; rounding");
    }
    factor
}

fn check_raw_shape(raw: &RawGranule, window: &SourceWindow) -> Result<(), SyncError> {
    if raw.lat.is_empty() || raw.lon.is_empty() {
        return Err(SyncError::Harmonization("empty coordinate axis".to_string()));
    }
    if raw.depth.as_ref().map(Vec::is_empty).unwrap_or(false) {
        return Err(SyncError::Harmonization("empty depth axis".to_string()));
    }
    if raw
        .lat
        .iter()
        .chain(raw.lon.iter())
        .any(|value| !value.is_finite())
    {
        return Err(SyncError::Harmonization("non-finite coordinate value".to_string()));
    }
    let expected = raw.depth_len() * raw.layer_len();
    for (name, variable) in &raw.variables {
        if window.variables.contains_key(name) && variable.data.len() != expected {
            return Err(SyncError::Harmonization(format!(
                "variable {name} has {} cells, expected {expected}",
                variable.data.len()
            )));
        }
    }
    Ok(())
}

fn select_layer(
    depth: Option<&[f64]>,
    band: Option<DepthBand>,
) -> Result<Option<(usize, f64)>, SyncError> {
    let Some(depth) = depth else {
        return Ok(None);
    };
    let candidates = depth
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, value)| value.is_finite())
        .filter(|(_, value)| band.map(|band| band.contains(value.abs())).unwrap_or(true));
    let shallowest = candidates.min_by(|a, b| a.1.abs().total_cmp(&b.1.abs()));
    match (shallowest, band) {
        (Some(layer), _) => Ok(Some(layer)),
        (None, Some(band)) => Err(SyncError::Harmonization(format!(
            "no depth layer within {}..{} m",
            band.min_depth, band.max_depth
        ))),
        (None, None) => Err(SyncError::Harmonization("no usable depth layer".to_string())),
    }
}

fn normalize_lon_axis(
    lon: &[f64],
    native: LonConvention,
    canonical: LonConvention,
) -> (Vec<f64>, Vec<usize>, bool) {
    let converted: Vec<f64> = match (native, canonical) {
        (LonConvention::Positive, LonConvention::Signed) => {
            lon.iter().copied().map(to_signed_longitude).collect()
        }
        (LonConvention::Signed, LonConvention::Positive) => {
            lon.iter().copied().map(to_positive_longitude).collect()
        }
        _ => return (lon.to_vec(), (0..lon.len()).collect(), false),
    };
    let mut order: Vec<usize> = (0..converted.len()).collect();
    order.sort_by(|a, b| converted[*a].total_cmp(&converted[*b]));
    let sorted = order.iter().map(|index| converted[*index]).collect();
    (sorted, order, true)
}

fn reorder_columns(values: &[f64], rows: usize, order: &[usize]) -> Vec<f64> {
    let cols = order.len();
    let mut out = Vec::with_capacity(values.len());
    for row in 0..rows {
        let base = row * cols;
        out.extend(order.iter().map(|col| values[base + col]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_longitude_examples() {
        assert_eq!(to_signed_longitude(200.0), -160.0);
        assert!((to_signed_longitude(359.75) - -0.25).abs() < 1e-12);
        assert_eq!(to_signed_longitude(0.0), 0.0);
        assert_eq!(to_signed_longitude(180.0), -180.0);
    }

    #[test]
    fn block_mean_of_uniform_block() {
        let values = vec![10.0; 16];
        assert_eq!(block_mean(&values, 4, 4, 4), vec![10.0]);
    }

    #[test]
    fn block_mean_skips_non_finite_cells() {
        let values = vec![10.0, 20.0, 30.0, f64::NAN, 40.0, f64::NAN, f64::INFINITY, f64::NAN];
        let mean = block_mean(&values, 2, 4, 4);
        assert_eq!(mean, vec![25.0]);
    }

    #[test]
    fn block_with_only_missing_cells_stays_missing() {
        let values = vec![f64::NAN, f64::NAN, 1.0, 3.0];
        let mean = block_mean(&values, 2, 2, 1);
        assert!(mean[0].is_nan());
        assert_eq!(block_mean(&values, 2, 2, 2), vec![2.0]);
    }

    #[test]
    fn select_shallowest_layer_in_band() {
        let band = DepthBand {
            min_depth: 0.0,
            max_depth: 5.0,
        };
        let depth = [10.0, 3.0, 0.5, 50.0];
        assert_eq!(select_layer(Some(&depth), Some(band)).unwrap(), Some((2, 0.5)));

        let deep = [10.0, 50.0];
        assert!(select_layer(Some(&deep), Some(band)).is_err());
        assert_eq!(select_layer(None, Some(band)).unwrap(), None);
    }

    #[test]
    fn lon_axis_is_sorted_after_remap() {
        let (lon, order, remapped) = normalize_lon_axis(
            &[0.0, 90.0, 180.0, 270.0],
            LonConvention::Positive,
            LonConvention::Signed,
        );
        assert!(remapped);
        assert_eq!(lon, vec![-180.0, -90.0, 0.0, 90.0]);
        assert_eq!(order, vec![2, 3, 0, 1]);
    }
}
