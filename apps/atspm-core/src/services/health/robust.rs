use chrono::{Duration, NaiveDateTime};

/// Median of the finite values; `None` when there are none.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(median_of_sorted(&sorted))
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// Trailing time-window median over `(t - window, t]`.
///
/// `points` must be sorted by timestamp. A point gets `None` until at least `min_periods`
/// finite values fall inside its window.
pub fn rolling_median(
    points: &[(NaiveDateTime, f64)],
    window: Duration,
    min_periods: usize,
) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(points.len());
    let mut sorted: Vec<f64> = Vec::new();
    let mut tail = 0usize;

    for &(ts, value) in points {
        if value.is_finite() {
            let at = sorted.partition_point(|v| v.total_cmp(&value).is_lt());
            sorted.insert(at, value);
        }
        while tail < points.len() && points[tail].0 <= ts - window {
            let expired = points[tail].1;
            if expired.is_finite() {
                if let Ok(at) = sorted.binary_search_by(|v| v.total_cmp(&expired)) {
                    sorted.remove(at);
                }
            }
            tail += 1;
        }
        if sorted.len() >= min_periods.max(1) {
            out.push(Some(median_of_sorted(&sorted)));
        } else {
            out.push(None);
        }
    }
    out
}
