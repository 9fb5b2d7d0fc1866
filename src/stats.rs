use std::fmt;

use serde::Serialize;

/// Newton refinements used by [`newton_sqrt`].
const SQRT_ITERATIONS: usize = 20;

/// Descriptive statistics of one set of observations.
///
/// Every field except `count` is `None` when the input was empty, so an
/// undefined statistic never reads as a real zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub std: Option<f64>,
}

impl Summary {
    pub fn empty() -> Summary {
        Summary {
            count: 0,
            mean: None,
            median: None,
            min: None,
            max: None,
            std: None,
        }
    }

    /// Computes count, mean, median, min, max and population standard
    /// deviation without sort, sum or sqrt library primitives.
    ///
    /// The caller's slice is never reordered; sorting happens on a private copy.
    pub fn compute<T>(observations: &[T]) -> Summary
    where
        T: Copy + Into<f64>,
    {
        if observations.is_empty() {
            return Summary::empty();
        }

        let mut sorted: Vec<f64> = observations.iter().map(|&value| value.into()).collect();
        exchange_sort(&mut sorted);

        let n = count(&sorted);
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };

        let (min, max) = (sorted[0], sorted[n - 1]);
        if min == max {
            return Summary {
                count: n,
                mean: Some(min),
                median: Some(median),
                min: Some(min),
                max: Some(max),
                std: Some(0.0),
            };
        }

        let mut total = 0.0;
        for &value in observations {
            total += value.into();
        }
        let mut mean = total / n as f64;
        // rounding in the sum can push the mean just past the extremes
        if mean < min {
            mean = min;
        } else if mean > max {
            mean = max;
        }

        let mut squared_deviations = 0.0;
        for &value in observations {
            let deviation = value.into() - mean;
            squared_deviations += deviation * deviation;
        }
        let variance = squared_deviations / n as f64;

        Summary {
            count: n,
            mean: Some(mean),
            median: Some(median),
            min: Some(min),
            max: Some(max),
            std: Some(newton_sqrt(variance)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn field(value: Option<f64>) -> String {
            match value {
                Some(value) => format!("{:.1}", value),
                None => "undefined".to_string(),
            }
        }

        writeln!(f, "count:  {}", self.count)?;
        writeln!(f, "mean:   {}", field(self.mean))?;
        writeln!(f, "median: {}", field(self.median))?;
        writeln!(f, "min:    {}", field(self.min))?;
        writeln!(f, "max:    {}", field(self.max))?;
        write!(f, "std:    {}", field(self.std))
    }
}

/// Stable ascending bubble sort. Stops after the first pass without a swap.
fn exchange_sort(values: &mut [f64]) {
    let mut unsorted = values.len();
    while unsorted > 1 {
        let mut swapped = false;
        for j in 0..unsorted - 1 {
            if values[j] > values[j + 1] {
                values.swap(j, j + 1);
                swapped = true;
            }
        }
        if !swapped {
            break;
        }
        unsorted -= 1;
    }
}

fn count(values: &[f64]) -> usize {
    let mut n = 0;
    for _ in values {
        n += 1;
    }
    n
}

/// Newton's method seeded with the power of two nearest the root, so the
/// fixed iteration count converges across the whole `f64` range.
fn newton_sqrt(value: f64) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }

    let (mut guess, mut square) = (1.0, 1.0);
    while square > value {
        guess /= 2.0;
        square /= 4.0;
    }
    while square * 4.0 <= value {
        guess *= 2.0;
        square *= 4.0;
    }

    for _ in 0..SQRT_ITERATIONS {
        guess = (guess + value / guess) / 2.0;
    }
    guess
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use proptest::{collection::vec, prelude::*};

    use super::*;

    fn reference_std(values: &[f64]) -> f64 {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        variance.sqrt()
    }

    #[test]
    fn five_scores() {
        let stats = Summary::compute(&[1300, 1450, 1200, 1500, 1350]);
        assert_eq!(stats.count, 5);
        assert_eq!(stats.mean, Some(1360.0));
        assert_eq!(stats.median, Some(1350.0));
        assert_eq!(stats.min, Some(1200.0));
        assert_eq!(stats.max, Some(1500.0));
        // population std: sqrt(57000 / 5)
        assert_relative_eq!(stats.std.unwrap(), 11400f64.sqrt(), max_relative = 1e-12);
    }

    #[test]
    fn identical_scores_have_zero_std() {
        let stats = Summary::compute(&[1000.0, 1000.0, 1000.0]);
        assert_eq!(stats.mean, Some(1000.0));
        assert_eq!(stats.median, Some(1000.0));
        assert_eq!(stats.min, Some(1000.0));
        assert_eq!(stats.max, Some(1000.0));
        assert_eq!(stats.std, Some(0.0));
    }

    #[test]
    fn identical_fractions_stay_in_range() {
        let stats = Summary::compute(&[0.1, 0.1, 0.1]);
        assert_eq!(stats.mean, Some(0.1));
        assert_eq!(stats.min, Some(0.1));
        assert_eq!(stats.max, Some(0.1));
        assert_eq!(stats.std, Some(0.0));

        let stats = Summary::compute(&[0.7; 10]);
        assert_eq!(stats.mean, Some(0.7));
        assert_eq!(stats.std, Some(0.0));
    }

    #[test]
    fn tiny_spread_has_tiny_std() {
        let stats = Summary::compute(&[0.1, 0.1, 0.1 + 1e-15]);
        let (min, max) = (stats.min.unwrap(), stats.max.unwrap());
        assert!(min <= stats.mean.unwrap() && stats.mean.unwrap() <= max);
        assert!(stats.std.unwrap() < 1e-15);
    }

    #[test]
    fn empty_input_is_undefined() {
        let stats = Summary::compute::<f64>(&[]);
        assert_eq!(stats, Summary::empty());
        assert!(stats.is_empty());
        assert!(stats.mean.is_none() && stats.std.is_none() && stats.median.is_none());

        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["count"], 0);
        assert!(json["mean"].is_null());
        assert!(json["std"].is_null());
    }

    #[test]
    fn even_count_median_is_midpoint() {
        let stats = Summary::compute(&[600, 1600]);
        assert_eq!(stats.median, Some(1100.0));
        assert_eq!(stats.mean, Some(1100.0));
    }

    #[test]
    fn single_observation() {
        let stats = Summary::compute(&[-42.5]);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.median, Some(-42.5));
        assert_eq!(stats.std, Some(0.0));
    }

    #[test]
    fn input_is_not_reordered() {
        let scores = vec![1500.0, 900.0, 1200.0];
        let _ = Summary::compute(&scores);
        assert_eq!(scores, vec![1500.0, 900.0, 1200.0]);
    }

    #[test]
    fn nan_propagates() {
        let stats = Summary::compute(&[1.0, f64::NAN, 3.0]);
        assert_eq!(stats.count, 3);
        assert!(stats.mean.unwrap().is_nan());
        assert!(stats.std.unwrap().is_nan());
    }

    #[test]
    fn display_marks_undefined_fields() {
        let text = Summary::empty().to_string();
        assert!(text.starts_with("count:  0"));
        assert!(text.contains("mean:   undefined"));
        assert!(text.ends_with("std:    undefined"));

        let text = Summary::compute(&[600, 1600]).to_string();
        assert!(text.contains("median: 1100.0"));
    }

    #[test]
    fn exchange_sort_orders_duplicates_and_negatives() {
        let mut values = vec![3.0, -1.0, 3.0, 0.0, -7.5, 2.0];
        exchange_sort(&mut values);
        assert_eq!(values, vec![-7.5, -1.0, 0.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn newton_sqrt_converges() {
        for value in [1e-300, 1e-30, 1e-10, 1e-3, 0.25, 2.0, 11400.0, 1e6, 1e300] {
            assert_relative_eq!(newton_sqrt(value), value.sqrt(), max_relative = 1e-12);
        }
        assert_eq!(newton_sqrt(0.0), 0.0);
        assert!(newton_sqrt(f64::NAN).is_nan());
    }

    #[test]
    fn large_sample_std_matches_reference() {
        // deterministic LCG so the sample is reproducible
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let scores: Vec<f64> = (0..2000)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                400.0 + ((state >> 33) % 1201) as f64
            })
            .collect();

        let stats = Summary::compute(&scores);
        assert_eq!(stats.count, 2000);
        assert_relative_eq!(
            stats.std.unwrap(),
            reference_std(&scores),
            max_relative = 1e-6
        );
    }

    proptest! {
        #[test]
        fn ordering_invariants(scores in vec(400i32..=1600, 1..300)) {
            let stats = Summary::compute(&scores);
            let (min, max) = (stats.min.unwrap(), stats.max.unwrap());
            prop_assert_eq!(stats.count, scores.len());
            prop_assert!(min <= stats.median.unwrap() && stats.median.unwrap() <= max);
            prop_assert!(min <= stats.mean.unwrap() && stats.mean.unwrap() <= max);
        }

        #[test]
        fn fractional_ordering_invariants(scores in vec(-1e4f64..1e4, 1..200)) {
            let stats = Summary::compute(&scores);
            let (min, max) = (stats.min.unwrap(), stats.max.unwrap());
            let (mean, median) = (stats.mean.unwrap(), stats.median.unwrap());
            prop_assert!(min <= median && median <= max);
            prop_assert!(min <= mean && mean <= max);
            prop_assert!(stats.std.unwrap() >= 0.0);
            let error = (stats.std.unwrap() - reference_std(&scores)).abs();
            prop_assert!(error <= 1e-6 * (max - min).max(1e-9));
        }

        #[test]
        fn repeated_fraction_has_zero_std(value in -1e4f64..1e4, n in 1usize..50) {
            let stats = Summary::compute(&vec![value; n]);
            prop_assert_eq!(stats.mean, Some(value));
            prop_assert_eq!(stats.std, Some(0.0));
        }

        #[test]
        fn order_invariant(scores in vec(400i32..=1600, 1..300)) {
            let mut reversed = scores.clone();
            reversed.reverse();
            let mut rotated = scores.clone();
            rotated.rotate_left(scores.len() / 2);

            let expected = Summary::compute(&scores);
            for permutation in [reversed, rotated] {
                let stats = Summary::compute(&permutation);
                prop_assert_eq!(stats.count, expected.count);
                prop_assert_eq!(stats.median, expected.median);
                prop_assert_eq!(stats.min, expected.min);
                prop_assert_eq!(stats.max, expected.max);
                // integer sums are exact; deviations may round differently
                prop_assert_eq!(stats.mean, expected.mean);
                let (std, expected_std) = (stats.std.unwrap(), expected.std.unwrap());
                prop_assert!((std - expected_std).abs() <= 1e-9 * expected_std.max(1.0));
            }
        }

        #[test]
        fn std_matches_reference(scores in vec(400i32..=1600, 1..500)) {
            let values: Vec<f64> = scores.iter().map(|&s| s as f64).collect();
            let std = Summary::compute(&scores).std.unwrap();
            let reference = reference_std(&values);
            prop_assert!((std - reference).abs() <= 1e-6 * reference.max(1e-9));
        }
    }
}
