use crate::services::aggregation::types::DeviceId;
use crate::services::health::robust::{median, rolling_median};
use crate::time::{day_period, iso_weekday};
use chrono::{Duration, NaiveDateTime};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Series identity: (device, detector).
pub type SeriesKey = (DeviceId, i16);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub key: SeriesKey,
    pub timestamp: NaiveDateTime,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecomposedPoint {
    pub key: SeriesKey,
    pub timestamp: NaiveDateTime,
    pub total: f64,
    pub rolling_median: f64,
    pub season_day: f64,
    pub season_week: f64,
    pub residual: f64,
}

impl DecomposedPoint {
    /// Baseline the observed total is compared against.
    pub fn expected(&self) -> f64 {
        self.total - self.residual
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecomposeSettings {
    pub window: Duration,
    pub min_periods: usize,
    pub bin_size: u32,
}

struct Staged {
    key: SeriesKey,
    timestamp: NaiveDateTime,
    total: f64,
    rolling: f64,
    detrend: f64,
    period: u32,
    weekday: u32,
}

/// Robust median decomposition per series.
///
/// Two detrending passes follow the trailing rolling median: a time-of-day median of the
/// detrended values, then a weekday × time-of-day median of what remains. Points without a
/// rolling baseline are dropped.
pub fn decompose(points: &[SeriesPoint], settings: &DecomposeSettings) -> Vec<DecomposedPoint> {
    let mut series: BTreeMap<SeriesKey, Vec<(NaiveDateTime, f64)>> = BTreeMap::new();
    for point in points {
        series
            .entry(point.key)
            .or_default()
            .push((point.timestamp, point.total));
    }

    let mut staged = Vec::new();
    for (key, mut values) in series {
        values.sort_by(|a, b| a.0.cmp(&b.0));
        let medians = rolling_median(&values, settings.window, settings.min_periods);
        for ((timestamp, total), rolling) in values.into_iter().zip(medians) {
            let Some(rolling) = rolling else {
                continue;
            };
            staged.push(Staged {
                key,
                timestamp,
                total,
                rolling,
                detrend: total - rolling,
                period: day_period(timestamp, settings.bin_size),
                weekday: iso_weekday(timestamp),
            });
        }
    }

    let season_day = group_medians(staged.iter().map(|s| ((s.key, s.period), s.detrend)));
    let deseason: Vec<f64> = staged
        .iter()
        .map(|s| {
            let day = season_day
                .get(&(s.key, s.period))
                .copied()
                .unwrap_or(f64::NAN);
            s.detrend - day
        })
        .collect();

    let season_week = group_medians(
        staged
            .iter()
            .zip(&deseason)
            .map(|(s, value)| ((s.key, s.weekday, s.period), *value)),
    );

    staged
        .iter()
        .zip(deseason)
        .filter_map(|(s, deseason)| {
            let day = season_day.get(&(s.key, s.period)).copied()?;
            let week = season_week.get(&(s.key, s.weekday, s.period)).copied()?;
            let residual = deseason - week;
            residual.is_finite().then_some(DecomposedPoint {
                key: s.key,
                timestamp: s.timestamp,
                total: s.total,
                rolling_median: s.rolling,
                season_day: day,
                season_week: week,
                residual,
            })
        })
        .collect()
}

fn group_medians<G: Hash + Eq>(values: impl Iterator<Item = (G, f64)>) -> HashMap<G, f64> {
    let mut groups: HashMap<G, Vec<f64>> = HashMap::new();
    for (group, value) in values {
        groups.entry(group).or_default().push(value);
    }
    groups
        .into_iter()
        .filter_map(|(key, values)| Some((key, median(&values)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ts;

    fn settings(min_periods: usize) -> DecomposeSettings {
        DecomposeSettings {
            window: Duration::days(7),
            min_periods,
            bin_size: 15,
        }
    }

    #[test]
    fn residual_is_total_minus_all_components() {
        let start = ts("2024-03-01 00:00:00");
        let points: Vec<SeriesPoint> = (0..96 * 14)
            .map(|i| {
                let timestamp = start + Duration::minutes(15 * i);
                let total = (i % 96) as f64 + if i % 7 == 0 { 5.0 } else { 0.0 };
                SeriesPoint {
                    key: (1, 2),
                    timestamp,
                    total,
                }
            })
            .collect();
        let out = decompose(&points, &settings(50));
        // The first 49 points have no baseline yet.
        assert_eq!(out.len(), points.len() - 49);
        for p in &out {
            let rebuilt = p.rolling_median + p.season_day + p.season_week + p.residual;
            assert!((rebuilt - p.total).abs() < 1e-9);
            assert!((p.expected() + p.residual - p.total).abs() < 1e-9);
        }
    }

    #[test]
    fn constant_series_has_zero_residual() {
        let start = ts("2024-03-04 00:00:00");
        let points: Vec<SeriesPoint> = (0..20)
            .map(|i| SeriesPoint {
                key: (5, 1),
                timestamp: start + Duration::minutes(15 * i),
                total: 12.0,
            })
            .collect();
        let out = decompose(&points, &settings(1));
        assert_eq!(out.len(), 20);
        assert!(out.iter().all(|p| p.residual == 0.0 && p.rolling_median == 12.0));
    }
}
