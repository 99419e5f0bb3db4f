//! Batched index iteration
//!
//! Shared by every in-memory batch source.

use rand::seq::SliceRandom;
use rand::thread_rng;

/// Data loader for batched iteration
#[derive(Debug, Clone)]
pub struct DataLoader {
    indices: Vec<usize>,
    batch_size: usize,
    current_pos: usize,
    shuffle: bool,
}

impl DataLoader {
    /// Create a new data loader
    pub fn new(dataset_size: usize, batch_size: usize, shuffle: bool) -> Self {
        let mut indices: Vec<usize> = (0..dataset_size).collect();
        if shuffle {
            indices.shuffle(&mut thread_rng());
        }

        Self {
            indices,
            batch_size: batch_size.max(1),
            current_pos: 0,
            shuffle,
        }
    }

    /// Get number of batches
    pub fn num_batches(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }

    /// Configured batch size
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Reset the loader for a new epoch
    pub fn reset(&mut self) {
        self.current_pos = 0;
        if self.shuffle {
            self.indices.shuffle(&mut thread_rng());
        }
    }

    /// Get next batch of indices
    pub fn next_batch(&mut self) -> Option<Vec<i64>> {
        if self.current_pos >= self.indices.len() {
            return None;
        }

        let end = (self.current_pos + self.batch_size).min(self.indices.len());
        let batch = self.indices[self.current_pos..end]
            .iter()
            .map(|&i| i as i64)
            .collect();
        self.current_pos = end;

        Some(batch)
    }
}

impl Iterator for DataLoader {
    type Item = Vec<i64>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_loader() {
        let loader = DataLoader::new(100, 32, false);
        assert_eq!(loader.num_batches(), 4); // 32 + 32 + 32 + 4 = 100
    }

    #[test]
    fn test_data_loader_iteration() {
        let mut loader = DataLoader::new(10, 3, false);
        let batches: Vec<_> = loader.by_ref().collect();

        assert_eq!(batches.len(), 4);
        assert_eq!(batches[0], vec![0, 1, 2]);
        assert_eq!(batches[3].len(), 1);

        loader.reset();
        assert_eq!(loader.next_batch(), Some(vec![0, 1, 2]));
    }

    #[test]
    fn test_shuffled_loader_covers_all_indices() {
        let mut loader = DataLoader::new(17, 5, true);
        let mut seen: Vec<i64> = loader.by_ref().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..17).collect::<Vec<i64>>());
    }
}
