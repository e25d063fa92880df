//! Per-tick metrics and field statistics.

use serde::{Deserialize, Serialize};

use crate::species::SPECIES_COUNT;

/// One metrics log entry, appended after every executed tick. The log is
/// unbounded; long-running hosts drain it periodically.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step: u64,
    pub avg_energy: f32,
    pub avg_energy_by_species: [f32; SPECIES_COUNT],
    pub dna_species_sizes: [usize; SPECIES_COUNT],
    pub dna_global_size: usize,
}

/// Aggregate over all agents' energy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyStats {
    pub avg: f32,
    pub min: f32,
    pub max: f32,
}

/// Summary over the mycelium density field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MycelStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
}

/// Distribution statistics of one scalar field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub p95: f32,
    /// Shannon entropy over a histogram of `bins` buckets, in nats.
    pub entropy: f32,
    /// Entropy divided by `ln(bins)`.
    pub norm_entropy: f32,
}

/// Histogram-based statistics over a field buffer. A flat field (max equals
/// min) or a degenerate bin count yields zero entropy.
#[must_use]
pub fn field_stats(values: &[f32], bins: usize) -> FieldStats {
    let mut stats = FieldStats::default();
    if values.is_empty() {
        return stats;
    }

    stats.min = values[0];
    stats.max = values[0];
    let mut sum = 0.0f64;
    for &v in values {
        stats.min = stats.min.min(v);
        stats.max = stats.max.max(v);
        sum += f64::from(v);
    }
    stats.mean = (sum / values.len() as f64) as f32;

    let mut sorted = values.to_vec();
    let idx = ((0.95 * (sorted.len() - 1) as f64).floor()) as usize;
    sorted.sort_by(f32::total_cmp);
    stats.p95 = sorted[idx];

    if bins <= 1 || stats.max <= stats.min {
        return stats;
    }

    let range = f64::from(stats.max - stats.min);
    let mut hist = vec![0u32; bins];
    for &v in values {
        let bin = ((f64::from(v - stats.min) / range) * bins as f64).floor() as i64;
        let bin = bin.clamp(0, bins as i64 - 1) as usize;
        hist[bin] += 1;
    }

    let denom = values.len() as f64;
    let mut entropy = 0.0f64;
    for count in hist {
        if count == 0 {
            continue;
        }
        let p = f64::from(count) / denom;
        entropy -= p * p.ln();
    }
    stats.entropy = entropy as f32;
    stats.norm_entropy = (entropy / (bins as f64).ln()) as f32;
    stats
}
