use serde::{Deserialize, Serialize};

// ── Division guard ────────────────────────────────────────────────────────────

/// `numerator / denominator`, or `None` when the denominator is zero.
pub fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator == 0.0 || !denominator.is_finite() {
        return None;
    }
    Some(numerator / denominator)
}

/// Percentage `numerator / denominator * 100` rounded to two decimals, or
/// `None` when the denominator is zero.
pub fn percent(numerator: f64, denominator: f64) -> Option<f64> {
    ratio(numerator, denominator).map(|r| round2(r * 100.0))
}

// ── Rounding ──────────────────────────────────────────────────────────────────

/// Round half away from zero to `places` decimals.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    let rounded = (value * factor).round() / factor;
    // Normalise -0.0 so serialised output never shows "-0.0".
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Precision used for percentages.
pub fn round2(value: f64) -> f64 {
    round_to(value, 2)
}

/// Precision used for averages.
pub fn round4(value: f64) -> f64 {
    round_to(value, 4)
}

// ── Growth ────────────────────────────────────────────────────────────────────

/// Period-over-period growth, always carrying the lag value it came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Growth {
    /// Lag in days (or months for month grain rows).
    pub lag: u32,
    /// Value `lag` periods earlier; `None` when the lag falls before the
    /// spine.
    pub lag_value: Option<f64>,
    /// Percentage change; `None` when the lag value is missing or zero.
    pub growth_pct: Option<f64>,
}

impl Growth {
    pub fn compute(current: f64, lag: u32, lag_value: Option<f64>) -> Self {
        let growth_pct = lag_value.and_then(|prior| percent(current - prior, prior));
        Self {
            lag,
            lag_value,
            growth_pct,
        }
    }

    /// Growth of `series[idx]` against `series[idx - lag]`.
    pub fn at(series: &[f64], idx: usize, lag: u32) -> Self {
        let current = series.get(idx).copied().unwrap_or(0.0);
        let lag_value = idx
            .checked_sub(lag as usize)
            .and_then(|prior| series.get(prior).copied());
        Self::compute(current, lag, lag_value)
    }
}

// ── Rolling frames ────────────────────────────────────────────────────────────

/// Trailing sums over a dense daily series: element `i` is the sum of
/// `values[i + 1 - len ..= i]`, clipped at the series start.
pub fn rolling_sums(values: &[f64], len: usize) -> Vec<f64> {
    let mut prefix = Vec::with_capacity(values.len() + 1);
    prefix.push(0.0);
    for v in values {
        let last = prefix.last().copied().unwrap_or(0.0);
        prefix.push(last + v);
    }
    (0..values.len())
        .map(|i| {
            let end = i + 1;
            let start = end.saturating_sub(len);
            prefix[end] - prefix[start]
        })
        .collect()
}

/// Trailing means over a dense daily series, rounded to four decimals.
///
/// Zero days inside the frame count toward the denominator.
pub fn rolling_averages(values: &[f64], len: usize) -> Vec<f64> {
    rolling_sums(values, len)
        .into_iter()
        .enumerate()
        .map(|(i, sum)| {
            let frame = (i + 1).min(len).max(1);
            round4(sum / frame as f64)
        })
        .collect()
}

// ── Rank & share ──────────────────────────────────────────────────────────────

/// Dense positional rank (1-based) by value descending, ties broken by key
/// ascending. Returned ranks line up with the input order.
pub fn rank_desc<K: Ord>(entries: &[(K, f64)]) -> Vec<u32> {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| {
        entries[b]
            .1
            .total_cmp(&entries[a].1)
            .then_with(|| entries[a].0.cmp(&entries[b].0))
    });
    let mut ranks = vec![0u32; entries.len()];
    for (pos, idx) in order.into_iter().enumerate() {
        ranks[idx] = pos as u32 + 1;
    }
    ranks
}

/// Share of `value` in `total` as a percentage.
pub fn share_pct(value: f64, total: f64) -> Option<f64> {
    percent(value, total)
}
