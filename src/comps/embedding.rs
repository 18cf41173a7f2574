//! Embedding index - standardized per-property vectors for bulk cosine scoring
//!
//! The whole dataset is scored against a subject with one matrix-vector
//! product, so aggregation order is fixed regardless of pool size.

use crate::comps::features::EPSILON;
use crate::comps::scorer::{sanitise, SimilarityScorer};
use crate::comps::types::{FeatureVector, FilteredCandidate, ScorerVariant, Similarity, SubjectQuery};
use crate::error::{CompError, Result};
use crate::ingestion::write::read_json;
use crate::ingestion::{PropertyRecord, PropertyType, SaleRecord, StructureType};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const EMBEDDING_DIM: usize = 16;

type RawEmbedding = [Option<f64>; EMBEDDING_DIM];

/// Raw (unscaled) embedding columns; `None` marks a missing value, which
/// standardizes to the column mean
pub fn raw_embedding(property: &PropertyRecord, price: Option<f64>, reference_year: i32) -> RawEmbedding {
    let type_flag = |ty: PropertyType| Some(if property.property_type == ty { 1.0 } else { 0.0 });

    [
        Some(property.living_area.max(0.0).ln_1p()),
        Some(property.lot_size.max(0.0).ln_1p()),
        Some(property.bedrooms as f64),
        Some(property.bathrooms),
        property
            .year_built
            .map(|year| (reference_year - year).max(0) as f64),
        Some(property.location.latitude),
        Some(property.location.longitude),
        Some(property.condition.ordinal() as f64),
        Some(property.quality.ordinal() as f64),
        type_flag(PropertyType::SingleFamily),
        type_flag(PropertyType::Townhouse),
        type_flag(PropertyType::Condo),
        type_flag(PropertyType::MultiFamily),
        match property.structure_type {
            StructureType::Detached => Some(1.0),
            StructureType::SemiDetached => Some(0.5),
            StructureType::Attached => Some(0.0),
            StructureType::Unknown => None,
        },
        Some(property.feature_tags.len() as f64),
        price.filter(|p| *p > 0.0).map(f64::ln),
    ]
}

/// Per-column standardization fitted on the indexed sales
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeatureScaler {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl FeatureScaler {
    pub fn fit(rows: &[RawEmbedding]) -> Self {
        let mut mean = vec![0.0; EMBEDDING_DIM];
        let mut std = vec![1.0; EMBEDDING_DIM];

        for col in 0..EMBEDDING_DIM {
            let values: Vec<f64> = rows.iter().filter_map(|row| row[col]).collect();
            if values.is_empty() {
                continue;
            }
            let n = values.len() as f64;
            let m = values.iter().sum::<f64>() / n;
            let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
            mean[col] = m;
            // Constant columns carry no signal; keep them at zero after scaling
            std[col] = if variance.sqrt() < EPSILON { 1.0 } else { variance.sqrt() };
        }

        FeatureScaler { mean, std }
    }

    pub fn transform(&self, raw: &RawEmbedding) -> Array1<f64> {
        Array1::from_iter(raw.iter().enumerate().map(|(col, value)| match value {
            Some(v) => (v - self.mean[col]) / self.std[col],
            None => 0.0,
        }))
    }
}

/// Serialized index: embeddings, scaler and the parallel sale metadata
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EmbeddingArtifact {
    pub dimension: usize,
    pub reference_year: i32,
    pub built_at: DateTime<Utc>,
    pub scaler: FeatureScaler,
    pub embeddings: Vec<Vec<f64>>,
    /// Row i describes embeddings[i]; doubles as the serving dataset
    pub metadata: Vec<SaleRecord>,
}

impl EmbeddingArtifact {
    pub fn new(index: &EmbeddingIndex, metadata: Vec<SaleRecord>) -> Self {
        EmbeddingArtifact {
            dimension: EMBEDDING_DIM,
            reference_year: index.reference_year,
            built_at: Utc::now(),
            scaler: index.scaler.clone(),
            embeddings: index.matrix.outer_iter().map(|row| row.to_vec()).collect(),
            metadata,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_json(path).map_err(|e| {
            CompError::ModelUnavailable(format!("cannot read {}: {}", path.display(), e))
        })
    }
}

/// Dense embedding matrix with precomputed row norms
#[derive(Debug, Clone)]
pub struct EmbeddingIndex {
    matrix: Array2<f64>,
    norms: Array1<f64>,
    scaler: FeatureScaler,
    reference_year: i32,
    /// (identifier, normalized address) -> matrix row
    rows: HashMap<(String, String), usize>,
}

impl EmbeddingIndex {
    /// Fit a scaler on `sales` and embed every one of them
    pub fn build(sales: &[SaleRecord], reference_year: i32) -> Result<Self> {
        let raws: Vec<RawEmbedding> = sales
            .iter()
            .map(|sale| raw_embedding(&sale.property, Some(sale.sale_price), reference_year))
            .collect();
        let scaler = FeatureScaler::fit(&raws);

        let flat: Vec<f64> = raws
            .iter()
            .flat_map(|raw| scaler.transform(raw).to_vec())
            .collect();
        let matrix = Array2::from_shape_vec((sales.len(), EMBEDDING_DIM), flat)
            .map_err(|e| CompError::Internal(format!("embedding matrix shape: {}", e)))?;

        Ok(Self::assemble(matrix, scaler, reference_year, sales))
    }

    /// Rebuild the index from an artifact, returning the metadata as the dataset
    pub fn from_artifact(artifact: EmbeddingArtifact) -> Result<(Self, Vec<SaleRecord>)> {
        let rows = artifact.embeddings.len();
        if artifact.dimension != EMBEDDING_DIM
            || artifact.scaler.mean.len() != EMBEDDING_DIM
            || artifact.scaler.std.len() != EMBEDDING_DIM
        {
            return Err(CompError::ModelUnavailable(format!(
                "embedding dimension {} does not match {}",
                artifact.dimension, EMBEDDING_DIM
            )));
        }
        if rows != artifact.metadata.len() {
            return Err(CompError::ModelUnavailable(format!(
                "{} embeddings but {} metadata rows",
                rows,
                artifact.metadata.len()
            )));
        }
        if artifact
            .embeddings
            .iter()
            .any(|row| row.len() != EMBEDDING_DIM || row.iter().any(|v| !v.is_finite()))
        {
            return Err(CompError::ModelUnavailable(
                "embedding rows must be finite and full width".to_string(),
            ));
        }

        let flat: Vec<f64> = artifact.embeddings.into_iter().flatten().collect();
        let matrix = Array2::from_shape_vec((rows, EMBEDDING_DIM), flat)
            .map_err(|e| CompError::ModelUnavailable(format!("embedding matrix shape: {}", e)))?;

        let index = Self::assemble(
            matrix,
            artifact.scaler,
            artifact.reference_year,
            &artifact.metadata,
        );
        info!(
            "✓ Loaded {} embeddings (built {})",
            index.len(),
            artifact.built_at
        );
        Ok((index, artifact.metadata))
    }

    fn assemble(
        matrix: Array2<f64>,
        scaler: FeatureScaler,
        reference_year: i32,
        sales: &[SaleRecord],
    ) -> Self {
        let norms = matrix.map_axis(Axis(1), |row| row.dot(&row).sqrt());
        let mut rows = HashMap::with_capacity(sales.len());
        let mut collisions = 0;
        for (idx, sale) in sales.iter().enumerate() {
            let key = row_key(sale);
            if let Some(&first) = rows.get(&key) {
                collisions += 1;
                if collisions <= 10 {
                    warn!(
                        "Embedding row {} repeats {} at '{}'; lookups use row {}",
                        idx,
                        sale.id(),
                        sale.property.address,
                        first
                    );
                }
                continue;
            }
            rows.insert(key, idx);
        }
        if collisions > 0 {
            warn!("{} embedding rows share an identifier and address with an earlier row", collisions);
        }

        EmbeddingIndex {
            matrix,
            norms,
            scaler,
            reference_year,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row_of(&self, sale: &SaleRecord) -> Option<usize> {
        self.rows.get(&row_key(sale)).copied()
    }

    /// Embed a property that may not be in the index
    pub fn embed(&self, property: &PropertyRecord, price: Option<f64>) -> Array1<f64> {
        self.scaler
            .transform(&raw_embedding(property, price, self.reference_year))
    }

    /// Similarity (0-100) of `query` against every indexed row, in row order
    pub fn similarities(&self, query: ArrayView1<'_, f64>) -> Array1<f64> {
        let query_norm = query.dot(&query).sqrt();
        let dots = self.matrix.dot(&query);

        Zip::from(&dots)
            .and(&self.norms)
            .map_collect(|&dot, &norm| cosine_to_score(dot, norm * query_norm))
    }

    /// Similarity (0-100) between two embeddings
    pub fn similarity(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
        let denom = a.dot(&a).sqrt() * b.dot(&b).sqrt();
        cosine_to_score(a.dot(&b), denom)
    }
}

fn row_key(sale: &SaleRecord) -> (String, String) {
    (sale.id().to_string(), sale.property.address_key())
}

/// Rescale cosine from [-1, 1] to [0, 100]; a zero vector is neutral
fn cosine_to_score(dot: f64, denom: f64) -> f64 {
    if denom < EPSILON {
        return 50.0;
    }
    let cosine = (dot / denom).clamp(-1.0, 1.0);
    sanitise((cosine + 1.0) / 2.0 * 100.0)
}

/// Scorer backed by the precomputed index; candidates outside the index
/// are embedded on the fly with the same scaler
#[derive(Debug, Clone)]
pub struct EmbeddingScorer {
    index: Arc<EmbeddingIndex>,
}

impl EmbeddingScorer {
    pub fn new(index: Arc<EmbeddingIndex>) -> Self {
        EmbeddingScorer { index }
    }

    pub fn index(&self) -> &EmbeddingIndex {
        &self.index
    }

    fn subject_embedding(&self, query: &SubjectQuery) -> Array1<f64> {
        self.index.embed(&query.subject, query.estimated_value)
    }

    fn candidate_embedding(&self, sale: &SaleRecord) -> Array1<f64> {
        match self.index.row_of(sale) {
            Some(row) => self.index.matrix.row(row).to_owned(),
            None => self.index.embed(&sale.property, Some(sale.sale_price)),
        }
    }
}

impl SimilarityScorer for EmbeddingScorer {
    fn variant(&self) -> ScorerVariant {
        ScorerVariant::Embedding
    }

    fn score(
        &self,
        query: &SubjectQuery,
        candidate: &FilteredCandidate<'_>,
        _features: &FeatureVector,
    ) -> Result<Similarity> {
        let subject = self.subject_embedding(query);
        let comp = self.candidate_embedding(candidate.sale);
        Ok(Similarity {
            score: EmbeddingIndex::similarity(subject.view(), comp.view()),
            band: None,
        })
    }

    fn score_batch(
        &self,
        query: &SubjectQuery,
        candidates: &[FilteredCandidate<'_>],
        _features: &[FeatureVector],
    ) -> Vec<Result<Similarity>> {
        let subject = self.subject_embedding(query);
        let all = self.index.similarities(subject.view());
        let mut embedded_on_the_fly = 0;

        let scores = candidates
            .iter()
            .map(|candidate| {
                let score = match self.index.row_of(candidate.sale) {
                    Some(row) => all[row],
                    None => {
                        embedded_on_the_fly += 1;
                        let comp = self
                            .index
                            .embed(&candidate.sale.property, Some(candidate.sale.sale_price));
                        EmbeddingIndex::similarity(subject.view(), comp.view())
                    }
                };
                Ok(Similarity { score, band: None })
            })
            .collect();

        debug!(
            "Embedding scores for {} candidates ({} outside the index)",
            candidates.len(),
            embedded_on_the_fly
        );
        scores
    }
}
