//! Approximate nearest-neighbor index over topic vectors.
//!
//! Two structures are persisted separately:
//!
//! - [`NeighborGraph`]: for each dense index, the ids of its `k` nearest rows
//!   (self excluded), ordered nearest first. This is all the query layer needs
//!   and its row count is the pipeline's "index updated" signal.
//! - [`AnnIndex`]: the vectors and scored neighbor lists needed to extend the
//!   graph online. Loaded only by the ingestion pipeline.
//!
//! # Submodules
//!
//! - [`nndescent`]: NN-descent construction and incremental insertion

pub mod nndescent;

pub use nndescent::AnnIndex;

use serde::{Deserialize, Serialize};

/// Per-row nearest neighbors, addressed by dense index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NeighborGraph {
    /// Target neighbors per row. Rows may be shorter while the corpus has
    /// fewer than `k + 1` articles.
    pub k: usize,
    rows: Vec<Vec<u32>>,
}

impl NeighborGraph {
    pub fn new(k: usize, rows: Vec<Vec<u32>>) -> Self {
        Self { k, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// The first `limit` neighbors of `index`, nearest first.
    pub fn neighbors(&self, index: u32, limit: usize) -> Option<&[u32]> {
        self.rows
            .get(index as usize)
            .map(|row| &row[..row.len().min(limit)])
    }

    /// Check that no row references itself or an id outside the graph.
    pub fn validate(&self) -> Result<(), String> {
        let n = self.rows.len();
        for (i, row) in self.rows.iter().enumerate() {
            if let Some(bad) = row.iter().find(|&&id| id as usize == i || id as usize >= n) {
                return Err(format!("row {i} references invalid neighbor {bad}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neighbors_truncates_to_limit() {
        let graph = NeighborGraph::new(
            3,
            vec![vec![1, 2, 3], vec![0, 2, 3], vec![1, 0, 3], vec![2, 1, 0]],
        );
        assert_eq!(graph.row_count(), 4);
        assert_eq!(graph.neighbors(0, 2), Some(&[1, 2][..]));
        assert_eq!(graph.neighbors(3, 10), Some(&[2, 1, 0][..]));
        assert_eq!(graph.neighbors(4, 2), None);
    }

    #[test]
    fn test_validate_rejects_self_and_out_of_range() {
        assert!(NeighborGraph::new(1, vec![vec![1], vec![0]]).validate().is_ok());
        assert!(NeighborGraph::new(1, vec![vec![0], vec![0]]).validate().is_err());
        assert!(NeighborGraph::new(1, vec![vec![2], vec![0]]).validate().is_err());
    }
}
