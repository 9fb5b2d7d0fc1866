use std::{collections::HashSet, path::Path};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    dataset::{Dataset, ScoreRecord},
    stats::Summary,
};

/// Multiplier of the interquartile range used for outlier fences.
const FENCE_FACTOR: f64 = 1.5;

/// Largest histogram a config may ask for.
const MAX_BINS: f64 = 10_000.0;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub histogram: HistogramConfig,
    pub percentiles: Vec<f64>,
    pub bands: Vec<Band>,
    pub top_n: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct HistogramConfig {
    pub start: f64,
    pub end: f64,
    pub width: f64,
}

/// A labelled score range; `min` is inclusive and `max` exclusive.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Band {
    pub label: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl Band {
    fn new(label: &str, min: Option<f64>, max: Option<f64>) -> Band {
        Band {
            label: label.to_string(),
            min,
            max,
        }
    }

    fn contains(&self, score: f64) -> bool {
        self.min.map_or(true, |min| score >= min) && self.max.map_or(true, |max| score < max)
    }
}

impl Default for HistogramConfig {
    fn default() -> Self {
        HistogramConfig {
            start: 600.0,
            end: 1650.0,
            width: 50.0,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            histogram: HistogramConfig::default(),
            percentiles: vec![25.0, 50.0, 75.0, 90.0, 95.0],
            bands: vec![
                Band::new("Outstanding (1500+)", Some(1500.0), None),
                Band::new("Excellent (1400-1499)", Some(1400.0), Some(1500.0)),
                Band::new("Very Good (1300-1399)", Some(1300.0), Some(1400.0)),
                Band::new("Good (1200-1299)", Some(1200.0), Some(1300.0)),
                Band::new("Below Average (<1200)", None, Some(1200.0)),
            ],
            top_n: 10,
        }
    }
}

impl AnalysisConfig {
    pub fn from_yaml_file(path: &Path) -> Result<AnalysisConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read {}", path.display()))?;
        let config: AnalysisConfig =
            serde_yaml::from_str(&content).context("Failed to parse analysis config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let HistogramConfig { start, end, width } = self.histogram;
        if !(width > 0.0) {
            bail!("histogram width must be positive, got {}", width);
        }
        if !(end > start) {
            bail!("histogram end {} must be greater than start {}", end, start);
        }
        let bins = ((end - start) / width).ceil();
        if !bins.is_finite() || bins > MAX_BINS {
            bail!(
                "histogram of width {} over {}..{} needs {} bins, at most {} are allowed",
                width,
                start,
                end,
                bins,
                MAX_BINS
            );
        }
        if let Some(p) = self.percentiles.iter().find(|p| !(0.0..=100.0).contains(*p)) {
            bail!("percentile {} is outside 0..=100", p);
        }
        let mut labels = HashSet::new();
        if let Some(band) = self.bands.iter().find(|band| !labels.insert(&band.label)) {
            bail!("duplicate band label `{}`", band.label);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quartiles {
    pub q1: f64,
    pub q3: f64,
    pub iqr: f64,
    pub lower_fence: f64,
    pub upper_fence: f64,
    pub outliers: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PercentilePoint {
    pub percentile: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Histogram {
    pub bins: Vec<Bin>,
    pub out_of_range: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BandCount {
    pub count: usize,
    /// Share of all scores, in percent.
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedRecord {
    pub name: Option<String>,
    pub score: f64,
    pub percentile_rank: f64,
}

/// Least-squares line through `(index, score)` with 1-based file order indices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendLine {
    pub slope: f64,
    pub intercept: f64,
}

/// One step of the empirical distribution function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CdfPoint {
    pub score: f64,
    pub cumulative: f64,
}

/// Normal distribution matched to the summary, for density and CDF overlays.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NormalFit {
    pub mean: f64,
    pub std: f64,
    /// Squared correlation of the normal probability plot. `None` below two
    /// scores or when every score is equal.
    pub qq_r_squared: Option<f64>,
}

/// Everything a chart renderer needs to draw the score distribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub summary: Summary,
    pub quartiles: Option<Quartiles>,
    pub percentiles: Vec<PercentilePoint>,
    pub histogram: Histogram,
    pub bands: IndexMap<String, BandCount>,
    pub bottom: Vec<RankedRecord>,
    pub top: Vec<RankedRecord>,
    pub trend: Option<TrendLine>,
    pub cdf: Vec<CdfPoint>,
    pub normal_fit: Option<NormalFit>,
}

impl Analysis {
    pub fn compute(dataset: &Dataset, config: &AnalysisConfig) -> Result<Analysis> {
        config.validate()?;

        let scores = dataset.scores();
        let mut sorted = scores.clone();
        sorted.sort_by(f64::total_cmp);

        let percentiles = if sorted.is_empty() {
            Vec::new()
        } else {
            config
                .percentiles
                .iter()
                .map(|&percentile| PercentilePoint {
                    percentile,
                    score: percentile_of_sorted(&sorted, percentile),
                })
                .collect()
        };

        let (bottom, top) = extremes(&dataset.records, &sorted, config.top_n);
        let summary = Summary::compute(&scores);
        let normal_fit = match (summary.mean, summary.std) {
            (Some(mean), Some(std)) => Some(NormalFit {
                mean,
                std,
                qq_r_squared: qq_r_squared(&sorted),
            }),
            _ => None,
        };

        Ok(Analysis {
            summary,
            quartiles: quartiles(&sorted),
            percentiles,
            histogram: histogram(&scores, &config.histogram),
            bands: band_counts(&scores, &config.bands),
            bottom,
            top,
            trend: trend_line(&scores),
            cdf: empirical_cdf(&sorted),
            normal_fit,
        })
    }
}

/// Linear interpolation between closest ranks, `rank = p / 100 * (n - 1)`.
/// `sorted` must be non-empty and ascending.
pub fn percentile_of_sorted(sorted: &[f64], percentile: f64) -> f64 {
    let rank = percentile / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}

/// Percentage of `sorted` at or below `score`.
pub fn percentile_rank(sorted: &[f64], score: f64) -> f64 {
    let at_or_below = sorted.partition_point(|&s| s <= score);
    at_or_below as f64 / sorted.len() as f64 * 100.0
}

fn quartiles(sorted: &[f64]) -> Option<Quartiles> {
    if sorted.is_empty() {
        return None;
    }
    let q1 = percentile_of_sorted(sorted, 25.0);
    let q3 = percentile_of_sorted(sorted, 75.0);
    let iqr = q3 - q1;
    let lower_fence = q1 - FENCE_FACTOR * iqr;
    let upper_fence = q3 + FENCE_FACTOR * iqr;
    let outliers = sorted
        .iter()
        .copied()
        .filter(|&s| s < lower_fence || s > upper_fence)
        .collect();

    Some(Quartiles {
        q1,
        q3,
        iqr,
        lower_fence,
        upper_fence,
        outliers,
    })
}

fn histogram(scores: &[f64], config: &HistogramConfig) -> Histogram {
    let bin_count = ((config.end - config.start) / config.width).ceil() as usize;
    let mut bins: Vec<Bin> = (0..bin_count)
        .map(|i| Bin {
            lower: config.start + i as f64 * config.width,
            upper: (config.start + (i + 1) as f64 * config.width).min(config.end),
            count: 0,
        })
        .collect();

    let mut out_of_range = 0;
    for &score in scores {
        if !(score >= config.start && score <= config.end) {
            out_of_range += 1;
            continue;
        }
        // the last bin is closed on the right
        let index = (((score - config.start) / config.width) as usize).min(bin_count - 1);
        bins[index].count += 1;
    }

    Histogram { bins, out_of_range }
}

fn band_counts(scores: &[f64], bands: &[Band]) -> IndexMap<String, BandCount> {
    bands
        .iter()
        .map(|band| {
            let count = scores.iter().filter(|&&s| band.contains(s)).count();
            let share = if scores.is_empty() {
                0.0
            } else {
                count as f64 / scores.len() as f64 * 100.0
            };
            (band.label.clone(), BandCount { count, share })
        })
        .collect()
}

fn extremes(
    records: &[ScoreRecord],
    sorted: &[f64],
    n: usize,
) -> (Vec<RankedRecord>, Vec<RankedRecord>) {
    let mut ordered: Vec<&ScoreRecord> = records.iter().collect();
    ordered.sort_by(|a, b| a.score.total_cmp(&b.score));

    let ranked = |record: &&ScoreRecord| RankedRecord {
        name: record.name.clone(),
        score: record.score,
        percentile_rank: percentile_rank(sorted, record.score),
    };

    let bottom = ordered.iter().take(n).map(ranked).collect();
    let top = ordered
        .iter()
        .skip(ordered.len().saturating_sub(n))
        .map(ranked)
        .collect();
    (bottom, top)
}

fn trend_line(scores: &[f64]) -> Option<TrendLine> {
    if scores.is_empty() {
        return None;
    }
    let n = scores.len() as f64;
    let mean_x = (n + 1.0) / 2.0;
    let mean_y = scores.iter().sum::<f64>() / n;

    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, &y) in scores.iter().enumerate() {
        let dx = (i + 1) as f64 - mean_x;
        sxy += dx * (y - mean_y);
        sxx += dx * dx;
    }
    let slope = if sxx == 0.0 { 0.0 } else { sxy / sxx };

    Some(TrendLine {
        slope,
        intercept: mean_y - slope * mean_x,
    })
}

fn empirical_cdf(sorted: &[f64]) -> Vec<CdfPoint> {
    let n = sorted.len() as f64;
    sorted
        .iter()
        .enumerate()
        .map(|(i, &score)| CdfPoint {
            score,
            cumulative: (i + 1) as f64 / n,
        })
        .collect()
}

/// Filliben's estimate of the uniform order statistic medians.
fn uniform_order_medians(n: usize) -> Vec<f64> {
    let last = 0.5f64.powf(1.0 / n as f64);
    (0..n)
        .map(|i| {
            if i == n - 1 {
                last
            } else if i == 0 {
                1.0 - last
            } else {
                (i as f64 + 1.0 - 0.3175) / (n as f64 + 0.365)
            }
        })
        .collect()
}

fn qq_r_squared(sorted: &[f64]) -> Option<f64> {
    if sorted.len() < 2 {
        return None;
    }
    let theoretical: Vec<f64> = uniform_order_medians(sorted.len())
        .into_iter()
        .map(inverse_normal_cdf)
        .collect();

    let n = sorted.len() as f64;
    let mean_x = theoretical.iter().sum::<f64>() / n;
    let mean_y = sorted.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (&x, &y) in theoretical.iter().zip(sorted) {
        let (dx, dy) = (x - mean_x, y - mean_y);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return None;
    }
    Some(sxy * sxy / (sxx * syy))
}

/// Acklam's rational approximation of the standard normal quantile function.
/// Relative error stays below 1.15e-9 on `(0, 1)`.
fn inverse_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239e0,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838e0,
        -2.549_732_539_343_734e0,
        4.374_664_141_464_968e0,
        2.938_163_982_698_783e0,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996e0,
        3.754_408_661_907_416e0,
    ];
    const P_LOW: f64 = 0.02425;

    let tail = |q: f64| {
        let num = ((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5];
        let den = (((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0;
        num / den
    };

    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p > 1.0 - P_LOW {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    } else {
        let q = p - 0.5;
        let r = q * q;
        let num = (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q;
        let den = ((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0;
        num / den
    }
}
