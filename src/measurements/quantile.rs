//! Quantile Aggregator (C8, spec.md §4.10). Turns a slice of nanosecond
//! latency samples into a `{p50, p95, p99, max, min, avg, count}` summary
//! using linear-interpolation nearest-rank quantiles.

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuantileResult {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
    pub min: f64,
    pub avg: f64,
    pub count: usize,
}

/// Linear-interpolation quantile over a pre-sorted ascending slice.
fn interpolated_quantile(sorted: &[i64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = q * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower] as f64;
    }
    let frac = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
}

/// Compute the full summary for one stage's samples (nanoseconds). Accepts
/// samples in any order; sorts a local copy.
pub fn summarize(samples: &[i64]) -> QuantileResult {
    if samples.is_empty() {
        return QuantileResult { p50: 0.0, p95: 0.0, p99: 0.0, max: 0.0, min: 0.0, avg: 0.0, count: 0 };
    }

    let mut sorted = samples.to_vec();
    sorted.sort_unstable();

    let sum: i64 = sorted.iter().sum();
    let avg = sum as f64 / sorted.len() as f64;

    QuantileResult {
        p50: interpolated_quantile(&sorted, 0.50),
        p95: interpolated_quantile(&sorted, 0.95),
        p99: interpolated_quantile(&sorted, 0.99),
        max: *sorted.last().unwrap() as f64,
        min: *sorted.first().unwrap() as f64,
        avg,
        count: sorted.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_zeroed_summary() {
        let s = summarize(&[]);
        assert_eq!(s.count, 0);
        assert_eq!(s.p50, 0.0);
    }

    #[test]
    fn single_sample_all_quantiles_equal_the_sample() {
        let s = summarize(&[42]);
        assert_eq!(s.p50, 42.0);
        assert_eq!(s.p95, 42.0);
        assert_eq!(s.p99, 42.0);
        assert_eq!(s.max, 42.0);
        assert_eq!(s.min, 42.0);
        assert_eq!(s.avg, 42.0);
    }

    #[test]
    fn quantiles_are_ordered_and_avg_within_bounds() {
        let samples: Vec<i64> = (1..=1000).collect();
        let s = summarize(&samples);
        assert!(s.p50 <= s.p95);
        assert!(s.p95 <= s.p99);
        assert!(s.p99 <= s.max);
        assert!(s.avg >= s.min && s.avg <= s.max);
    }

    #[test]
    fn unsorted_input_is_handled() {
        let samples = vec![5, 1, 4, 2, 3];
        let s = summarize(&samples);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 5.0);
        assert_eq!(s.p50, 3.0);
    }

    #[test]
    fn known_interpolation_value() {
        // [10, 20, 30, 40] at p50 (rank=1.5) interpolates to 25.
        let s = summarize(&[10, 20, 30, 40]);
        assert_eq!(s.p50, 25.0);
    }
}
