//! Reassembly of series split across several reply packets
//!
//! Long replies such as modulation sequences arrive as fragments that each
//! carry a start index and a slice of one or more parallel series. Fragments
//! may arrive in any order.
//!
//! Control data downloads carry no start index: their rows are concatenated
//! in arrival order.

use std::collections::BTreeMap;

use lanternlibgs::{Fields, LanternError, LanternResult, Packet};

/// Merge reply fragments into complete series
///
/// `start_field` names the start index inside each fragment's reply data and
/// `series` the parallel series to collect. Every index of `0..total` must be
/// covered by some fragment; a fragment reaching past `total` is
/// malformed. Returns the series keyed by name.
pub fn reassemble(
    fragments: &[Packet],
    start_field: &str,
    series: &[&str],
    total: usize,
) -> LanternResult<BTreeMap<String, Vec<f64>>> {
    let mut slots: Vec<Vec<Option<f64>>> = vec![vec![None; total]; series.len()];

    for fragment in fragments {
        let data = fragment
            .reply_data()
            .ok_or_else(|| LanternError::malformed("fragment without reply data"))?;
        let start = start_index(data, start_field)?;

        for (slot, name) in slots.iter_mut().zip(series) {
            let values = data
                .get(*name)
                .and_then(|v| v.to_f64_vec())
                .ok_or_else(|| LanternError::malformed(format!("fragment without series '{}'", name)))?;
            if start + values.len() > total {
                return Err(LanternError::malformed(format!(
                    "fragment {}..{} of '{}' overflows {} points",
                    start,
                    start + values.len(),
                    name,
                    total
                )));
            }
            for (i, value) in values.into_iter().enumerate() {
                slot[start + i] = Some(value);
            }
        }
    }

    let mut out = BTreeMap::new();
    for (slot, name) in slots.into_iter().zip(series) {
        let complete: Option<Vec<f64>> = slot.iter().copied().collect();
        match complete {
            Some(values) => {
                out.insert(name.to_string(), values);
            }
            None => {
                let missing = slot.iter().filter(|v| v.is_none()).count();
                return Err(LanternError::Incomplete(format!(
                    "{} of {} points of '{}' missing",
                    missing, total, name
                )));
            }
        }
    }
    Ok(out)
}

/// Points covered by the fragments received so far, counting overlaps once
pub fn covered_points(fragments: &[Packet], start_field: &str, series: &str) -> usize {
    let mut covered = std::collections::BTreeSet::new();
    for data in fragments.iter().filter_map(Packet::reply_data) {
        let len = data.get(series).map(|v| v.element_count()).unwrap_or(0);
        if let Ok(start) = start_index(data, start_field) {
            covered.extend(start..start + len);
        }
    }
    covered.len()
}

/// Join the rows of fragments without a start index, in arrival order
///
/// Every fragment must carry every series, and the series of one fragment
/// must have the same length.
pub fn concatenate(fragments: &[Packet], series: &[&str]) -> LanternResult<BTreeMap<String, Vec<f64>>> {
    let mut out: BTreeMap<String, Vec<f64>> =
        series.iter().map(|name| (name.to_string(), Vec::new())).collect();

    for data in fragments.iter().filter_map(Packet::reply_data) {
        let mut rows = None;
        for name in series {
            let values = data
                .get(*name)
                .and_then(|v| v.to_f64_vec())
                .ok_or_else(|| LanternError::malformed(format!("fragment without series '{}'", name)))?;
            match rows {
                Some(n) if n != values.len() => {
                    return Err(LanternError::malformed(format!(
                        "series '{}' has {} rows, expected {}",
                        name,
                        values.len(),
                        n
                    )));
                }
                _ => rows = Some(values.len()),
            }
            out.entry(name.to_string()).or_default().extend(values);
        }
    }
    Ok(out)
}

/// Rows received so far in fragments without a start index
pub fn received_rows(fragments: &[Packet], series: &str) -> usize {
    fragments
        .iter()
        .filter_map(Packet::reply_data)
        .map(|data| data.get(series).map(|v| v.element_count()).unwrap_or(0))
        .sum()
}

fn start_index(data: &Fields, start_field: &str) -> LanternResult<usize> {
    data.get(start_field)
        .and_then(|v| v.as_i64())
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| LanternError::malformed(format!("fragment without '{}'", start_field)))
}
