//! Dissimilarity measures over topic-distribution vectors.
//!
//! Every [`Metric`] is symmetric, returns `0.0` for identical vectors and is
//! fully deterministic, so neighbor graphs built with it are reproducible.

use serde::{Deserialize, Serialize};

/// Smoothing added to each component before computing divergences.
const EPS: f32 = f32::EPSILON;

/// Pluggable comparator for the nearest-neighbor index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cosine,
    JensenShannon,
    Hellinger,
    /// Weighted Jaccard over non-negative components.
    Jaccard,
    /// Mean of the four measures above.
    Combined,
}

impl Metric {
    pub fn distance(self, x: &[f32], y: &[f32]) -> f32 {
        debug_assert_eq!(x.len(), y.len());
        match self {
            Metric::Cosine => cosine(x, y),
            Metric::JensenShannon => jensen_shannon(x, y),
            Metric::Hellinger => hellinger(x, y),
            Metric::Jaccard => jaccard(x, y),
            Metric::Combined => {
                (cosine(x, y) + jensen_shannon(x, y) + hellinger(x, y) + jaccard(x, y)) / 4.0
            }
        }
    }
}

fn cosine(x: &[f32], y: &[f32]) -> f32 {
    let (mut dot, mut nx, mut ny) = (0.0f32, 0.0f32, 0.0f32);
    for (a, b) in x.iter().zip(y) {
        dot += a * b;
        nx += a * a;
        ny += b * b;
    }
    if nx == 0.0 && ny == 0.0 {
        0.0
    } else if nx == 0.0 || ny == 0.0 {
        1.0
    } else {
        (1.0 - dot / (nx * ny).sqrt()).max(0.0)
    }
}

fn jensen_shannon(x: &[f32], y: &[f32]) -> f32 {
    let dim = x.len() as f32;
    let sx: f32 = x.iter().sum::<f32>() + EPS * dim;
    let sy: f32 = y.iter().sum::<f32>() + EPS * dim;
    let mut out = 0.0f32;
    for (a, b) in x.iter().zip(y) {
        let p = (a + EPS) / sx;
        let q = (b + EPS) / sy;
        let m = 0.5 * (p + q);
        out += 0.5 * (p * (p / m).ln() + q * (q / m).ln());
    }
    out.max(0.0)
}

fn hellinger(x: &[f32], y: &[f32]) -> f32 {
    let sx: f32 = x.iter().sum();
    let sy: f32 = y.iter().sum();
    if sx == 0.0 && sy == 0.0 {
        return 0.0;
    }
    if sx == 0.0 || sy == 0.0 {
        return 1.0;
    }
    let bc: f32 = x.iter().zip(y).map(|(a, b)| (a * b).sqrt()).sum();
    // rounding can push 1 - bc/norm slightly below zero for identical inputs
    (1.0 - bc / (sx * sy).sqrt()).max(0.0).sqrt()
}

fn jaccard(x: &[f32], y: &[f32]) -> f32 {
    let sx: f32 = x.iter().sum();
    let sy: f32 = y.iter().sum();
    if sx == 0.0 && sy == 0.0 {
        return 0.0;
    }
    if sx == 0.0 || sy == 0.0 {
        return 1.0;
    }
    let intersection: f32 = x.iter().zip(y).map(|(a, b)| a.min(*b)).sum();
    (1.0 - 2.0 * intersection / (sx + sy)).max(0.0)
}
