//! NN-descent neighbor index with online insertion.
//!
//! A full build starts every row from random neighbors and repeatedly runs a
//! local join (a neighbor of my neighbor is likely my neighbor) until the
//! number of improvements per iteration falls below a small fraction of
//! `n * k`. Small corpora are solved exactly.
//!
//! Insertion never rebuilds. Each new vector finds its neighbors with a beam
//! search over the existing graph (or exhaustively while the corpus is small),
//! then offers itself to each of those rows so existing lists pick up closer
//! newcomers. A bounded local join over the new rows' neighborhoods finishes
//! the batch. Vectors are inserted one by one, so later vectors of a batch
//! see the earlier ones.
//!
//! All randomness comes from a seeded generator, making builds and updates
//! reproducible.

use super::NeighborGraph;
use crate::config::AnnConfig;
use crate::distance::Metric;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashSet};
use tracing::{debug, info, instrument, warn};

/// Stop a build once an iteration improves fewer than `DELTA * n * k` entries.
const DELTA: f64 = 0.001;

/// A scored neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: u32,
    pub distance: f32,
}

impl Neighbor {
    fn order(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.id.cmp(&other.id))
    }
}

impl Eq for Neighbor {}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order(other)
    }
}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Vectors plus sorted neighbor lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnIndex {
    metric: Metric,
    k: usize,
    vectors: Vec<Vec<f32>>,
    neighbors: Vec<Vec<Neighbor>>,
}

impl AnnIndex {
    pub fn new(metric: Metric, k: usize) -> Self {
        Self {
            metric,
            k,
            vectors: Vec::new(),
            neighbors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Vector dimension, `None` while empty.
    pub fn dimension(&self) -> Option<usize> {
        self.vectors.first().map(Vec::len)
    }

    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    /// Project the index onto the id-only graph served to queries.
    pub fn graph(&self) -> NeighborGraph {
        NeighborGraph::new(
            self.k,
            self.neighbors
                .iter()
                .map(|row| row.iter().map(|n| n.id).collect())
                .collect(),
        )
    }

    /// Build an index over `vectors` from scratch.
    #[instrument(level = "info", skip_all, fields(n = vectors.len(), k = config.neighbors))]
    pub fn build(vectors: Vec<Vec<f32>>, config: &AnnConfig) -> Self {
        let mut index = Self::new(config.metric, config.neighbors);
        let n = vectors.len();
        index.vectors = vectors;
        index.neighbors = vec![Vec::new(); n];
        if n < 2 {
            return index;
        }

        if n <= config.exact_below.max(index.k + 1) {
            index.neighbors = (0..n)
                .into_par_iter()
                .map(|i| index.exact_neighbors(&index.vectors[i], Some(i)))
                .collect();
            info!("Built exact neighbor lists");
            return index;
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        for i in 0..n {
            let picks = sample(&mut rng, n - 1, index.k.min(n - 1));
            for p in picks {
                // skip over i so the sample ranges over the other n - 1 rows
                let j = if p >= i { p + 1 } else { p };
                let d = index.distance(i, j);
                let candidate = Neighbor {
                    id: j as u32,
                    distance: d,
                };
                push_neighbor(&mut index.neighbors[i], candidate, index.k);
            }
        }

        let stop_below = (DELTA * n as f64 * index.k as f64).max(1.0) as usize;
        for iteration in 0..config.build_iterations {
            let mut reverse: Vec<Vec<u32>> = vec![Vec::new(); n];
            for (i, row) in index.neighbors.iter().enumerate() {
                for nb in row {
                    reverse[nb.id as usize].push(i as u32);
                }
            }

            let mut updates = 0usize;
            for v in 0..n {
                let mut candidates: Vec<u32> = index.neighbors[v].iter().map(|nb| nb.id).collect();
                candidates.extend(reverse[v].iter().take(index.k));
                candidates.sort_unstable();
                candidates.dedup();
                updates += index.local_join(&candidates);
            }
            debug!(iteration, updates, "NN-descent iteration");
            if updates < stop_below {
                break;
            }
        }
        info!("Built NN-descent neighbor lists");
        index
    }

    /// Insert `new_vectors` in order, assigning ids `len()..len() + new.len()`.
    ///
    /// Returns the ids of pre-existing rows whose neighbor lists changed.
    #[instrument(level = "info", skip_all, fields(existing = self.len(), new = new_vectors.len()))]
    pub fn insert_batch(
        &mut self,
        new_vectors: Vec<Vec<f32>>,
        config: &AnnConfig,
    ) -> BTreeSet<u32> {
        let first_new = self.len();
        let mut revised = BTreeSet::new();
        let mut rng = StdRng::seed_from_u64(config.seed ^ first_new as u64);

        for vector in new_vectors {
            let id = self.len();
            // small corpora: score every row and offer the newcomer to all of
            // them, which keeps every list exact
            let (found, offer_to) = if id <= config.exact_below.max(self.k + 1) {
                let all = self.scored(&vector, None);
                let mut top = all.clone();
                top.sort_unstable();
                top.truncate(self.k);
                (top, all)
            } else {
                let found = self.search_with(&vector, self.k, config.search_width, &mut rng);
                (found.clone(), found)
            };

            self.vectors.push(vector);
            self.neighbors.push(found);

            for nb in offer_to {
                let row = &mut self.neighbors[nb.id as usize];
                if push_neighbor(row, Neighbor { id: id as u32, distance: nb.distance }, self.k)
                    && (nb.id as usize) < first_new
                {
                    revised.insert(nb.id);
                }
            }
        }

        let mut frontier: Vec<usize> = (first_new..self.len()).collect();
        for round in 0..config.refine_rounds {
            let mut touched = HashSet::new();
            for &v in &frontier {
                let candidates: Vec<u32> = std::iter::once(v as u32)
                    .chain(self.neighbors[v].iter().map(|nb| nb.id))
                    .collect();
                for (a, b) in self.local_join_pairs(&candidates) {
                    touched.insert(a);
                    touched.insert(b);
                }
            }
            debug!(round, touched = touched.len(), "Refined neighborhoods");
            for &t in &touched {
                if (t as usize) < first_new {
                    revised.insert(t);
                }
            }
            frontier = touched.into_iter().map(|t| t as usize).collect();
            frontier.sort_unstable();
            if frontier.is_empty() {
                break;
            }
        }

        info!(inserted = self.len() - first_new, revised = revised.len(), "Inserted vectors");
        revised
    }

    /// Approximate `k` nearest rows to `query`, nearest first.
    #[cfg(test)]
    pub fn search(&self, query: &[f32], k: usize, width: usize, seed: u64) -> Vec<Neighbor> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.search_with(query, k, width, &mut rng)
    }

    fn search_with(
        &self,
        query: &[f32],
        k: usize,
        width: usize,
        rng: &mut StdRng,
    ) -> Vec<Neighbor> {
        let n = self.len();
        if n == 0 {
            return Vec::new();
        }
        let width = width.max(k).max(1);
        let mut visited: HashSet<u32> = HashSet::new();
        let mut frontier: BinaryHeap<Reverse<Neighbor>> = BinaryHeap::new();
        let mut best: Vec<Neighbor> = Vec::with_capacity(width + 1);

        let entries = (width / 4).clamp(1, n);
        for e in sample(rng, n, entries) {
            let nb = Neighbor {
                id: e as u32,
                distance: self.metric.distance(query, &self.vectors[e]),
            };
            visited.insert(nb.id);
            push_neighbor(&mut best, nb, width);
            frontier.push(Reverse(nb));
        }

        while let Some(Reverse(current)) = frontier.pop() {
            if best.len() >= width && best.last().is_some_and(|w| current.distance > w.distance) {
                break;
            }
            for nb in &self.neighbors[current.id as usize] {
                if !visited.insert(nb.id) {
                    continue;
                }
                let cand = Neighbor {
                    id: nb.id,
                    distance: self.metric.distance(query, &self.vectors[nb.id as usize]),
                };
                if push_neighbor(&mut best, cand, width) {
                    frontier.push(Reverse(cand));
                }
            }
        }

        best.truncate(k);
        best
    }

    /// Exhaustive neighbors of `query`, skipping row `skip`.
    fn exact_neighbors(&self, query: &[f32], skip: Option<usize>) -> Vec<Neighbor> {
        let mut all = self.scored(query, skip);
        all.sort_unstable();
        all.truncate(self.k);
        all
    }

    /// Distance from `query` to every row except `skip`, in id order.
    fn scored(&self, query: &[f32], skip: Option<usize>) -> Vec<Neighbor> {
        self.vectors
            .iter()
            .enumerate()
            .filter(|(j, _)| Some(*j) != skip)
            .map(|(j, v)| Neighbor {
                id: j as u32,
                distance: self.metric.distance(query, v),
            })
            .collect()
    }

    fn distance(&self, a: usize, b: usize) -> f32 {
        self.metric.distance(&self.vectors[a], &self.vectors[b])
    }

    /// Offer every pair in `candidates` to each other's lists; returns the
    /// number of list changes.
    fn local_join(&mut self, candidates: &[u32]) -> usize {
        self.local_join_pairs(candidates).len()
    }

    /// Like [`Self::local_join`] but returns the rows that changed, as pairs.
    fn local_join_pairs(&mut self, candidates: &[u32]) -> Vec<(u32, u32)> {
        let mut changed = Vec::new();
        for (x, &a) in candidates.iter().enumerate() {
            for &b in &candidates[x + 1..] {
                if a == b {
                    continue;
                }
                let d = self.distance(a as usize, b as usize);
                let into_a = push_neighbor(
                    &mut self.neighbors[a as usize],
                    Neighbor { id: b, distance: d },
                    self.k,
                );
                let into_b = push_neighbor(
                    &mut self.neighbors[b as usize],
                    Neighbor { id: a, distance: d },
                    self.k,
                );
                if into_a || into_b {
                    changed.push((a, b));
                }
            }
        }
        changed
    }

    /// Warn when the configured metric or `k` differs from the persisted index.
    pub fn check_config(&self, config: &AnnConfig) {
        if self.metric != config.metric || self.k != config.neighbors {
            warn!(
                index_metric = ?self.metric,
                index_k = self.k,
                config_metric = ?config.metric,
                config_k = config.neighbors,
                "Index parameters differ from configuration; keeping index parameters until rebuild"
            );
        }
    }
}

/// Insert `cand` into the sorted, bounded `list` unless it is already present
/// or not better than the current worst. Returns whether the list changed.
fn push_neighbor(list: &mut Vec<Neighbor>, cand: Neighbor, k: usize) -> bool {
    if k == 0 || list.iter().any(|n| n.id == cand.id) {
        return false;
    }
    if list.len() >= k {
        match list.last() {
            Some(worst) if cand < *worst => {
                list.pop();
            }
            _ => return false,
        }
    }
    let pos = list.partition_point(|n| *n < cand);
    list.insert(pos, cand);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(k: usize, exact_below: usize) -> AnnConfig {
        AnnConfig {
            neighbors: k,
            metric: Metric::Cosine,
            search_width: 32,
            exact_below,
            refine_rounds: 1,
            build_iterations: 10,
            seed: 7,
        }
    }

    /// Points on the unit circle; neighbors by angle are easy to reason about.
    fn circle(n: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                let t = i as f32 / n as f32 * std::f32::consts::PI / 2.0;
                vec![t.cos() + 0.01, t.sin() + 0.01]
            })
            .collect()
    }

    fn recall(index: &AnnIndex, k: usize) -> f64 {
        let mut hit = 0usize;
        for i in 0..index.len() {
            let truth: HashSet<u32> = index
                .exact_neighbors(&index.vectors[i], Some(i))
                .into_iter()
                .take(k)
                .map(|n| n.id)
                .collect();
            hit += index.neighbors[i].iter().filter(|n| truth.contains(&n.id)).count();
        }
        hit as f64 / (index.len() * k) as f64
    }

    #[test]
    fn test_push_neighbor_keeps_sorted_bounded_unique() {
        let mut list = Vec::new();
        assert!(push_neighbor(&mut list, Neighbor { id: 1, distance: 0.5 }, 2));
        assert!(push_neighbor(&mut list, Neighbor { id: 2, distance: 0.1 }, 2));
        assert!(!push_neighbor(&mut list, Neighbor { id: 2, distance: 0.0 }, 2));
        assert!(!push_neighbor(&mut list, Neighbor { id: 3, distance: 0.9 }, 2));
        assert!(push_neighbor(&mut list, Neighbor { id: 4, distance: 0.3 }, 2));
        let ids: Vec<u32> = list.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![2, 4]);
    }

    #[test]
    fn test_exact_build_excludes_self() {
        let index = AnnIndex::build(circle(10), &config(3, 256));
        let graph = index.graph();
        assert_eq!(graph.row_count(), 10);
        graph.validate().unwrap();
        assert_eq!(recall(&index, 3), 1.0);
        let first = graph.neighbors(0, 3).unwrap();
        assert_eq!(first[0], 1);
    }

    #[test]
    fn test_nn_descent_build_has_high_recall() {
        let index = AnnIndex::build(circle(300), &config(8, 0));
        index.graph().validate().unwrap();
        assert!(recall(&index, 8) > 0.9, "recall {}", recall(&index, 8));
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = AnnIndex::build(circle(120), &config(5, 0)).graph();
        let b = AnnIndex::build(circle(120), &config(5, 0)).graph();
        assert_eq!(a, b);
    }

    #[test]
    fn test_insert_batch_appends_rows_and_revises_existing() {
        let mut points = circle(40);
        let newcomers: Vec<Vec<f32>> = points.iter().step_by(2).cloned().collect();
        points = points.into_iter().skip(1).step_by(2).collect();

        let cfg = config(3, 256);
        let mut index = AnnIndex::build(points, &cfg);
        assert_eq!(index.len(), 20);

        let revised = index.insert_batch(newcomers, &cfg);
        assert_eq!(index.len(), 40);
        assert!(!revised.is_empty());
        index.graph().validate().unwrap();
        assert_eq!(recall(&index, 3), 1.0);
    }

    #[test]
    fn test_graph_search_insertion_keeps_recall() {
        let all = circle(400);
        let cfg = config(6, 50);
        let mut index = AnnIndex::build(all[..300].to_vec(), &cfg);
        index.insert_batch(all[300..].to_vec(), &cfg);
        assert_eq!(index.len(), 400);
        index.graph().validate().unwrap();
        assert!(recall(&index, 6) > 0.85, "recall {}", recall(&index, 6));
    }

    #[test]
    fn test_insert_into_empty_index() {
        let cfg = config(2, 256);
        let mut index = AnnIndex::new(cfg.metric, cfg.neighbors);
        index.insert_batch(vec![vec![1.0, 0.0]], &cfg);
        assert_eq!(index.graph().neighbors(0, 2), Some(&[][..]));
        index.insert_batch(vec![vec![0.9, 0.1], vec![0.0, 1.0]], &cfg);
        assert_eq!(index.graph().neighbors(0, 2), Some(&[1, 2][..]));
        assert_eq!(index.dimension(), Some(2));
    }

    #[test]
    fn test_search_finds_nearest() {
        let index = AnnIndex::build(circle(200), &config(6, 0));
        let hits = index.search(&index.vectors()[100].clone(), 3, 32, 1);
        assert_eq!(hits[0].id, 100);
        assert!(hits.iter().any(|h| h.id == 99 || h.id == 101));
    }
}
