/// Bins covered by one hourly rolling estimate at 15-minute resolution.
const WINDOW: usize = 4;

/// Recovers per-bin increments from a trailing hourly rolling sum.
///
/// `reversed` must be newest-first. Each value minus the previous three recovered values is
/// that bin's increment; negatives are clipped to zero and the result is rounded to one
/// decimal only after every increment has been recovered.
pub fn undo_rolling_sum(reversed: &[f64]) -> Vec<f64> {
    let mut result: Vec<f64> = Vec::with_capacity(reversed.len());
    for (i, value) in reversed.iter().enumerate() {
        let start = i.saturating_sub(WINDOW - 1);
        let previous: f64 = result[start..i].iter().sum();
        result.push(value - previous);
    }
    result
        .into_iter()
        .map(|v| (v.max(0.0) * 10.0).round() / 10.0)
        .collect()
}
