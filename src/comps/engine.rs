//! Recommendation engine - the pipeline plus the shared, swappable context
//!
//! [`Recommender`] runs filter -> extract -> score -> rank -> explain for one
//! query. [`EngineContext`] bundles a recommender with the loaded dataset and
//! is immutable once built. [`CompEngine`] holds the current context behind an
//! `Arc` that reloads replace atomically, so in-flight requests keep the
//! snapshot they started with.

use crate::comps::adjust::{adjust, AdjustmentRates};
use crate::comps::embedding::{EmbeddingArtifact, EmbeddingIndex, EmbeddingScorer};
use crate::comps::explain::{explain, summarize};
use crate::comps::features::extract_features;
use crate::comps::filter::apply_filters;
use crate::comps::rank::{rank, rank_terms, reference_price_per_sqft, RankWeights};
use crate::comps::scorer::{sanitise, LearnedScorer, RuleBasedScorer, SimilarityScorer};
use crate::comps::types::{
    EngineVariant, FeatureVector, FilteredCandidate, RankedComp, RankedResult, ResultMetadata,
    ScoredCandidate, ScorerVariant, Similarity, SubjectQuery, SubjectRequest, DEFAULT_TOP_K,
};
use crate::config::{EngineConfig, ScorerChoice};
use crate::error::{CompError, Result};
use crate::ingestion::parse::{normalize_sales, NormalizeOptions};
use crate::ingestion::{enrich, load_dataset, NormalizeStats, RawRecord, SaleRecord};
use crate::price_per_sqft;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Only the first few scorer failures per request are logged individually
const MAX_FALLBACK_WARNINGS: usize = 10;

/// Runs one query against a candidate pool
pub struct Recommender {
    /// Primary scorer; `None` means rule-based only
    scorer: Option<Box<dyn SimilarityScorer>>,
    rule: RuleBasedScorer,
    weights: RankWeights,
    top_k: usize,
    adjustment_rates: AdjustmentRates,
}

impl Recommender {
    pub fn new(
        scorer: Option<Box<dyn SimilarityScorer>>,
        weights: RankWeights,
        top_k: usize,
    ) -> Result<Self> {
        weights.validate()?;
        Ok(Recommender {
            scorer,
            rule: RuleBasedScorer::default(),
            weights,
            top_k,
            adjustment_rates: AdjustmentRates::default(),
        })
    }

    pub fn with_adjustment_rates(mut self, rates: AdjustmentRates) -> Result<Self> {
        rates.validate()?;
        self.adjustment_rates = rates;
        Ok(self)
    }

    pub fn rule_based() -> Self {
        Recommender {
            scorer: None,
            rule: RuleBasedScorer::default(),
            weights: RankWeights::default(),
            top_k: DEFAULT_TOP_K,
            adjustment_rates: AdjustmentRates::default(),
        }
    }

    /// Variant reported when every candidate is scored by the primary scorer
    pub fn scorer_variant(&self) -> ScorerVariant {
        self.scorer
            .as_ref()
            .map(|s| s.variant())
            .unwrap_or(ScorerVariant::Fallback)
    }

    pub fn engine_variant(&self) -> EngineVariant {
        match self.scorer_variant() {
            ScorerVariant::Embedding => EngineVariant::PrecomputedEmbeddings,
            _ => EngineVariant::FullScan,
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Rank an already-normalized pool
    pub fn recommend(&self, query: &SubjectQuery, pool: &[SaleRecord]) -> Result<RankedResult> {
        let started = Instant::now();
        query.validate()?;

        let (candidates, counts) = apply_filters(query, pool);
        let features: Vec<FeatureVector> = candidates
            .iter()
            .map(|candidate| extract_features(query, candidate))
            .collect();
        let (similarities, fallback_scored) = self.score_pool(query, &candidates, &features);

        let reference_ppsf = reference_price_per_sqft(&candidates);
        let scored: Vec<ScoredCandidate<'_>> = candidates
            .into_iter()
            .zip(features)
            .zip(similarities)
            .map(|((candidate, features), (similarity, scorer))| {
                let terms = rank_terms(query, &candidate, similarity.score, reference_ppsf);
                let composite = self.weights.composite(&terms);
                debug!(
                    "Candidate {}: similarity {:.2} ({}), composite {:.3}",
                    candidate.sale.id(),
                    similarity.score,
                    scorer,
                    composite
                );
                ScoredCandidate {
                    candidate,
                    features,
                    similarity,
                    scorer,
                    terms,
                    composite,
                }
            })
            .collect();
        let scored_count = scored.len();

        let comps: Vec<RankedComp> = rank(scored, self.top_k)
            .iter()
            .enumerate()
            .map(|(idx, candidate)| self.ranked_comp(query, idx + 1, candidate))
            .collect();

        let scorer_variant = if fallback_scored > 0 {
            ScorerVariant::Fallback
        } else {
            self.scorer_variant()
        };

        let metadata = ResultMetadata {
            request_id: Uuid::new_v4(),
            as_of: query.as_of,
            total_candidates: counts.total_candidates,
            excluded_self: counts.excluded_self,
            after_distance: counts.after_distance,
            after_recency: counts.after_recency,
            after_compatibility: counts.after_compatibility,
            scored: scored_count,
            returned: comps.len(),
            dropped_records: 0,
            scorer_variant,
            fallback_scored,
            engine_variant: self.engine_variant(),
            processing_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            "Request {}: {} comps from {} candidates ({}) in {} ms [{}]",
            metadata.request_id,
            metadata.returned,
            metadata.total_candidates,
            counts,
            metadata.processing_ms,
            metadata.scorer_variant
        );

        Ok(RankedResult { comps, metadata })
    }

    /// Normalize a raw pool, then rank it; dropped records are counted
    pub fn recommend_raw(
        &self,
        query: &SubjectQuery,
        pool: &[RawRecord],
        options: &NormalizeOptions,
    ) -> Result<RankedResult> {
        query.validate()?;
        let (sales, stats) = normalize_sales(pool, options);
        let (sales, _) = enrich::enrich_all(sales);

        let mut result = self.recommend(query, &sales)?;
        result.metadata.dropped_records = stats.dropped;
        Ok(result)
    }

    /// Score the pool with the primary scorer, falling back per candidate
    fn score_pool(
        &self,
        query: &SubjectQuery,
        candidates: &[FilteredCandidate<'_>],
        features: &[FeatureVector],
    ) -> (Vec<(Similarity, ScorerVariant)>, usize) {
        let scorer = match &self.scorer {
            Some(scorer) => scorer,
            None => {
                let all: Vec<(Similarity, ScorerVariant)> = features
                    .iter()
                    .map(|f| (self.rule_similarity(f), ScorerVariant::Fallback))
                    .collect();
                return (all, 0);
            }
        };

        let mut fallbacks = 0;
        let results = scorer
            .score_batch(query, candidates, features)
            .into_iter()
            .zip(candidates)
            .zip(features)
            .map(|((result, candidate), f)| match result {
                Ok(similarity) => (
                    Similarity {
                        score: sanitise(similarity.score),
                        band: similarity.band,
                    },
                    scorer.variant(),
                ),
                Err(e) => {
                    fallbacks += 1;
                    if fallbacks <= MAX_FALLBACK_WARNINGS {
                        warn!(
                            "{} scorer failed for {}, using rule-based fallback: {}",
                            scorer.variant(),
                            candidate.sale.id(),
                            e
                        );
                    }
                    (self.rule_similarity(f), ScorerVariant::Fallback)
                }
            })
            .collect();

        if fallbacks > MAX_FALLBACK_WARNINGS {
            warn!("... and {} more scorer fallbacks", fallbacks - MAX_FALLBACK_WARNINGS);
        }
        (results, fallbacks)
    }

    fn rule_similarity(&self, features: &FeatureVector) -> Similarity {
        Similarity {
            score: self.rule.score_features(features),
            band: None,
        }
    }

    fn ranked_comp(
        &self,
        query: &SubjectQuery,
        rank: usize,
        candidate: &ScoredCandidate<'_>,
    ) -> RankedComp {
        let sale = candidate.candidate.sale;
        let adjustments = adjust(&query.subject, &candidate.candidate, &self.adjustment_rates);
        RankedComp {
            rank,
            sale: sale.clone(),
            distance_km: candidate.candidate.distance_km,
            days_since_sale: candidate.candidate.days_since_sale,
            type_compatibility: candidate.candidate.type_compatibility,
            similarity_score: candidate.similarity.score,
            confidence_band: candidate.similarity.band,
            composite_score: candidate.composite,
            scorer: candidate.scorer,
            price_per_sqft: price_per_sqft(sale.sale_price, sale.property.living_area),
            adjusted_price: sale.sale_price + adjustments.total,
            adjustments,
            explanations: explain(candidate, &self.weights, self.rule.weights()),
            summary: summarize(candidate),
        }
    }
}

/// Serializable view of a context, for readiness and reload responses
#[derive(Debug, Clone, Serialize)]
pub struct ContextSummary {
    pub ready: bool,
    pub dataset_loaded: bool,
    pub records: usize,
    pub dropped_records: usize,
    pub scorer_variant: ScorerVariant,
    pub engine_variant: EngineVariant,
    pub loaded_at: DateTime<Utc>,
}

/// Everything one request needs, immutable after load
pub struct EngineContext {
    recommender: Recommender,
    dataset: Option<Vec<SaleRecord>>,
    stats: NormalizeStats,
    loaded_at: DateTime<Utc>,
    /// An artifact-backed scorer was requested but could not be loaded
    degraded: bool,
}

impl EngineContext {
    pub fn new(recommender: Recommender, dataset: Vec<SaleRecord>, stats: NormalizeStats) -> Self {
        EngineContext {
            recommender,
            dataset: Some(dataset),
            stats,
            loaded_at: Utc::now(),
            degraded: false,
        }
    }

    /// Context with no dataset; serves nothing until a reload succeeds
    pub fn empty(config: &EngineConfig) -> Self {
        let recommender = Recommender::new(None, config.rank_weights, config.top_k)
            .and_then(|r| r.with_adjustment_rates(config.adjustment_rates))
            .unwrap_or_else(|_| Recommender::rule_based());
        EngineContext {
            recommender,
            dataset: None,
            stats: NormalizeStats::default(),
            loaded_at: Utc::now(),
            degraded: config.scorer != ScorerChoice::Rule,
        }
    }

    /// Load scorer artifacts and the dataset named by `config`
    pub fn load(config: &EngineConfig) -> Result<Self> {
        let started = Instant::now();
        info!(
            "Loading engine context (scorer: {}, dataset: {:?})",
            config.scorer, config.dataset_path
        );

        let (scorer, embedded) = load_scorer(config);
        let degraded = config.scorer != ScorerChoice::Rule && scorer.is_none();
        let recommender = Recommender::new(scorer, config.rank_weights, config.top_k)?
            .with_adjustment_rates(config.adjustment_rates)?;

        let (dataset, stats) = match embedded {
            Some(sales) => {
                let stats = NormalizeStats {
                    accepted: sales.len(),
                    ..Default::default()
                };
                (sales, stats)
            }
            None => {
                let loaded = load_dataset(&config.dataset_path, &config.normalize_options())
                    .map_err(|e| match e {
                        CompError::DatasetUnavailable(_) => e,
                        other => CompError::DatasetUnavailable(format!(
                            "{}: {}",
                            config.dataset_path.display(),
                            other
                        )),
                    })?;
                (loaded.sales, loaded.stats)
            }
        };

        let context = EngineContext {
            recommender,
            dataset: Some(dataset),
            stats,
            loaded_at: Utc::now(),
            degraded,
        };
        info!(
            "✓ Engine context ready in {} ms ({} records, scorer: {}, engine: {})",
            started.elapsed().as_millis(),
            context.records(),
            context.recommender.scorer_variant(),
            context.recommender.engine_variant()
        );
        Ok(context)
    }

    /// True once a dataset is loaded and the requested scorer is serving
    pub fn is_ready(&self) -> bool {
        self.dataset.is_some() && !self.degraded
    }

    pub fn records(&self) -> usize {
        self.dataset.as_ref().map(Vec::len).unwrap_or(0)
    }

    pub fn dataset(&self) -> Option<&[SaleRecord]> {
        self.dataset.as_deref()
    }

    pub fn recommender(&self) -> &Recommender {
        &self.recommender
    }

    pub fn recommend(&self, query: &SubjectQuery) -> Result<RankedResult> {
        let dataset = self.dataset.as_ref().ok_or_else(|| {
            CompError::DatasetUnavailable("no dataset has been loaded".to_string())
        })?;
        let mut result = self.recommender.recommend(query, dataset)?;
        result.metadata.dropped_records = self.stats.dropped;
        Ok(result)
    }

    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            ready: self.is_ready(),
            dataset_loaded: self.dataset.is_some(),
            records: self.records(),
            dropped_records: self.stats.dropped,
            scorer_variant: self.recommender.scorer_variant(),
            engine_variant: self.recommender.engine_variant(),
            loaded_at: self.loaded_at,
        }
    }
}

fn load_learned(path: &Path) -> Result<Box<dyn SimilarityScorer>> {
    let scorer: Box<dyn SimilarityScorer> = Box::new(LearnedScorer::load(path)?);
    Ok(scorer)
}

/// Embedding scorer plus the artifact's metadata, which serves as the dataset
fn load_embeddings(path: &Path) -> Result<(Box<dyn SimilarityScorer>, Vec<SaleRecord>)> {
    let artifact = EmbeddingArtifact::load(path)?;
    let (index, metadata) = EmbeddingIndex::from_artifact(artifact)?;
    let scorer: Box<dyn SimilarityScorer> = Box::new(EmbeddingScorer::new(Arc::new(index)));
    Ok((scorer, metadata))
}

/// Pick the scorer named by the configuration. Missing artifacts degrade to
/// rule-based scoring instead of failing the load.
fn load_scorer(config: &EngineConfig) -> (Option<Box<dyn SimilarityScorer>>, Option<Vec<SaleRecord>>) {
    match config.scorer {
        ScorerChoice::Rule => (None, None),
        ScorerChoice::Learned => match load_learned(&config.model_path) {
            Ok(scorer) => (Some(scorer), None),
            Err(e) => {
                warn!("Learned scorer unavailable, using rule-based fallback: {}", e);
                (None, None)
            }
        },
        ScorerChoice::Embedding => match load_embeddings(&config.embeddings_path) {
            Ok((scorer, metadata)) => (Some(scorer), Some(metadata)),
            Err(e) => {
                warn!("Embedding scorer unavailable, using rule-based fallback: {}", e);
                (None, None)
            }
        },
        ScorerChoice::Auto => {
            match load_embeddings(&config.embeddings_path) {
                Ok((scorer, metadata)) => return (Some(scorer), Some(metadata)),
                Err(e) => info!("No embedding artifact: {}", e),
            }
            match load_learned(&config.model_path) {
                Ok(scorer) => (Some(scorer), None),
                Err(e) => {
                    warn!("No scoring artifacts, using rule-based fallback: {}", e);
                    (None, None)
                }
            }
        }
    }
}

/// Process-wide engine state with serialized reloads
pub struct CompEngine {
    config: EngineConfig,
    context: RwLock<Arc<EngineContext>>,
    reload_lock: tokio::sync::Mutex<()>,
}

impl CompEngine {
    pub fn new(config: EngineConfig) -> Self {
        let context = EngineContext::empty(&config);
        Self::with_context(config, context)
    }

    pub fn with_context(config: EngineConfig, context: EngineContext) -> Self {
        CompEngine {
            config,
            context: RwLock::new(Arc::new(context)),
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Build an engine and attempt the first load; a failed load leaves an
    /// empty, not-ready context in place
    pub async fn initialize(config: EngineConfig) -> Self {
        let engine = CompEngine::new(config);
        if let Err(e) = engine.reload().await {
            error!("Initial engine load failed: {}", e);
        }
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current context; stays valid even if a reload swaps it out
    pub fn snapshot(&self) -> Arc<EngineContext> {
        self.context.read().clone()
    }

    /// Replace the current context, returning the previous one
    pub fn swap(&self, context: EngineContext) -> Arc<EngineContext> {
        std::mem::replace(&mut *self.context.write(), Arc::new(context))
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot().is_ready()
    }

    /// Load a fresh context off the async runtime and swap it in
    pub async fn reload(&self) -> Result<ContextSummary> {
        let _guard = self.reload_lock.lock().await;
        let config = self.config.clone();

        let context = tokio::task::spawn_blocking(move || EngineContext::load(&config))
            .await
            .map_err(|e| CompError::Internal(format!("reload task failed: {}", e)))??;

        let summary = context.summary();
        self.swap(context);
        info!("✓ Engine context swapped ({} records)", summary.records);
        Ok(summary)
    }

    pub async fn recommend(&self, request: SubjectRequest) -> Result<RankedResult> {
        let query = request.into_query(&self.config.query_defaults())?;
        self.recommend_query(query).await
    }

    pub async fn recommend_query(&self, query: SubjectQuery) -> Result<RankedResult> {
        let context = self.snapshot();
        run_with_budget(self.config.request_timeout_ms, move || context.recommend(&query)).await
    }
}

/// Run blocking work on the blocking pool with a time budget. On timeout the
/// result is discarded; the work holds only shared read-only state.
async fn run_with_budget<T, F>(budget_ms: u64, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(work);
    match tokio::time::timeout(Duration::from_millis(budget_ms), task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(CompError::Internal(format!("scoring task failed: {}", e))),
        Err(_) => {
            warn!("Request exceeded its {} ms budget", budget_ms);
            Err(CompError::Timeout(budget_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comps::scorer::{LogisticModel, ModelArtifact, DEFAULT_BLEND, RULE_WEIGHTS};
    use crate::comps::features::FEATURE_NAMES;
    use crate::comps::test_support::{as_of, sale_at, subject_at};
    use crate::ingestion::write::write_json_atomic;
    use crate::ingestion::PropertyType;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    /// Degrees of latitude per kilometre on a 6371 km sphere
    const DEG_PER_KM: f64 = 1.0 / 111.194_926_6;

    struct FailingScorer;

    impl SimilarityScorer for FailingScorer {
        fn variant(&self) -> ScorerVariant {
            ScorerVariant::Learned
        }

        fn score(
            &self,
            _query: &SubjectQuery,
            _candidate: &FilteredCandidate<'_>,
            _features: &FeatureVector,
        ) -> Result<Similarity> {
            Err(CompError::ModelUnavailable("weights went missing".to_string()))
        }
    }

    fn townhouse_query() -> SubjectQuery {
        let mut subject = subject_at(44.23, -76.59, PropertyType::Townhouse);
        subject.living_area = 2000.0;
        subject.bedrooms = 3;
        subject.bathrooms = 2.0;
        let mut query = SubjectQuery::new(subject);
        query.as_of = as_of();
        query
    }

    fn townhouse_pool(query: &SubjectQuery) -> Vec<SaleRecord> {
        let mut best = sale_at("best", 44.23 + 2.1 * DEG_PER_KM, -76.59, 168);
        best.property.property_type = PropertyType::Townhouse;
        best.property.structure_type = query.subject.structure_type;
        best.property.living_area = 2000.0;

        let mut far = sale_at("far", 45.5, -76.59, 30);
        far.property.property_type = PropertyType::Townhouse;

        let mut duplex = sale_at("duplex", 44.231, -76.591, 20);
        duplex.property.property_type = PropertyType::MultiFamily;

        vec![far, duplex, best]
    }

    fn mixed_pool() -> Vec<SaleRecord> {
        (0..8)
            .map(|i| {
                let mut sale = sale_at(
                    &format!("c{}", i),
                    44.23 + i as f64 * 0.01,
                    -76.59,
                    30 + i * 40,
                );
                sale.property.living_area = 1500.0 + i as f64 * 100.0;
                sale.sale_price = 400_000.0 + i as f64 * 25_000.0;
                sale
            })
            .collect()
    }

    fn model_artifact() -> ModelArtifact {
        ModelArtifact {
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            primary: LogisticModel {
                weights: RULE_WEIGHTS.iter().map(|w| w * 12.0).collect(),
                bias: -6.0,
            },
            secondary: None,
            blend: DEFAULT_BLEND,
            calibration: Vec::new(),
            confidence_band: 5.0,
        }
    }

    #[test]
    fn test_townhouse_scenario() {
        let query = townhouse_query();
        let pool = townhouse_pool(&query);
        let result = Recommender::rule_based().recommend(&query, &pool).unwrap();

        assert_eq!(result.comps.len(), 1);
        let top = &result.comps[0];
        assert_eq!(top.rank, 1);
        assert_eq!(top.sale.id(), "best");
        assert!((top.distance_km - 2.1).abs() < 0.01, "{}", top.distance_km);
        assert_eq!(top.days_since_sale, 168);
        assert!(top.similarity_score >= 90.0, "{}", top.similarity_score);
        assert!(!top.explanations.is_empty());
        assert_eq!(top.price_per_sqft, Some(250.0));
        // 1.1 km past the free radius and 78 days past the free window
        assert_eq!(top.adjustments.living_area, 0.0);
        assert!((top.adjustments.location - -2_200.0).abs() < 20.0);
        assert!((top.adjustments.time - -7_800.0).abs() < 1e-6);
        assert!((top.adjusted_price - (500_000.0 + top.adjustments.total)).abs() < 1e-6);

        let meta = &result.metadata;
        assert_eq!(meta.total_candidates, 3);
        assert_eq!(meta.after_distance, 2);
        assert_eq!(meta.after_compatibility, 1);
        assert_eq!(meta.scorer_variant, ScorerVariant::Fallback);
        assert_eq!(meta.engine_variant, EngineVariant::FullScan);
    }

    #[test]
    fn test_empty_pool_returns_empty_result() {
        let result = Recommender::rule_based()
            .recommend(&townhouse_query(), &[])
            .unwrap();
        assert!(result.comps.is_empty());
        assert_eq!(result.metadata.total_candidates, 0);
        assert_eq!(result.metadata.returned, 0);
    }

    #[test]
    fn test_recommend_is_idempotent() {
        let mut query = townhouse_query();
        query.subject.property_type = PropertyType::SingleFamily;
        let pool = mixed_pool();
        let recommender = Recommender::rule_based();

        let first = recommender.recommend(&query, &pool).unwrap();
        let second = recommender.recommend(&query, &pool).unwrap();
        assert_eq!(first.comps.len(), 3);
        assert_eq!(
            serde_json::to_value(&first.comps).unwrap(),
            serde_json::to_value(&second.comps).unwrap()
        );
        assert_ne!(first.metadata.request_id, second.metadata.request_id);
    }

    #[test]
    fn test_returns_min_of_k_and_survivors() {
        let mut query = townhouse_query();
        query.subject.property_type = PropertyType::SingleFamily;
        let pool = mixed_pool();

        let wide = Recommender::new(None, RankWeights::default(), 50).unwrap();
        let result = wide.recommend(&query, &pool).unwrap();
        assert_eq!(result.comps.len(), result.metadata.after_compatibility);

        for pair in result.comps.windows(2) {
            assert!(pair[0].composite_score >= pair[1].composite_score - 1e-6);
        }
        let ranks: Vec<usize> = result.comps.iter().map(|c| c.rank).collect();
        assert_eq!(ranks, (1..=result.comps.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_invalid_query_fails_before_filtering() {
        let mut query = townhouse_query();
        query.max_distance_km = -5.0;
        let err = Recommender::rule_based()
            .recommend(&query, &mixed_pool())
            .unwrap_err();
        assert!(err.is_validation());

        query.max_distance_km = 50.0;
        query.max_days_since_sale = 0;
        assert!(Recommender::rule_based()
            .recommend(&query, &mixed_pool())
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_failing_scorer_falls_back_per_candidate() {
        let mut query = townhouse_query();
        query.subject.property_type = PropertyType::SingleFamily;
        let pool = mixed_pool();

        let failing: Box<dyn SimilarityScorer> = Box::new(FailingScorer);
        let recommender = Recommender::new(Some(failing), RankWeights::default(), 3).unwrap();
        let result = recommender.recommend(&query, &pool).unwrap();
        let baseline = Recommender::rule_based().recommend(&query, &pool).unwrap();

        assert_eq!(result.metadata.scorer_variant, ScorerVariant::Fallback);
        assert_eq!(result.metadata.fallback_scored, result.metadata.scored);
        assert!(result.comps.iter().all(|c| c.scorer == ScorerVariant::Fallback));
        let ids: Vec<&str> = result.comps.iter().map(|c| c.sale.id()).collect();
        let expected: Vec<&str> = baseline.comps.iter().map(|c| c.sale.id()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_learned_scorer_reports_band() {
        let mut query = townhouse_query();
        query.subject.property_type = PropertyType::SingleFamily;
        let scorer: Box<dyn SimilarityScorer> = Box::new(LearnedScorer::new(model_artifact()).unwrap());
        let recommender = Recommender::new(Some(scorer), RankWeights::default(), 3).unwrap();

        let result = recommender.recommend(&query, &mixed_pool()).unwrap();
        assert_eq!(result.metadata.scorer_variant, ScorerVariant::Learned);
        assert_eq!(result.metadata.fallback_scored, 0);
        for comp in &result.comps {
            let band = comp.confidence_band.unwrap();
            assert!(band.low <= comp.similarity_score && comp.similarity_score <= band.high);
        }
    }

    #[test]
    fn test_recommend_raw_counts_dropped_records() {
        let mut query = townhouse_query();
        query.subject.property_type = PropertyType::SingleFamily;
        let raw: Vec<RawRecord> = vec![
            json!({ "id": "ok", "address": "5 Elm St", "gla": 1900, "lat": 44.24, "lon": -76.59,
                    "close_price": 510000, "close_date": "2024-04-01", "property_type": "Detached" }),
            json!({ "id": "no_gla", "address": "7 Elm St", "close_price": 480000 }),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();

        let result = Recommender::rule_based()
            .recommend_raw(&query, &raw, &NormalizeOptions::default())
            .unwrap();
        assert_eq!(result.metadata.dropped_records, 1);
        assert_eq!(result.metadata.total_candidates, 1);
        assert_eq!(result.comps[0].sale.id(), "ok");
    }

    #[test]
    fn test_townhouse_scenario_from_sparse_records() {
        // Only size, rooms, location and type are known on either side
        let request = SubjectRequest {
            subject: json!({ "gla": 2000, "bedrooms": 3, "bathrooms": 2,
                             "lat": 44.23, "lon": -76.59, "property_type": "Townhouse" })
            .as_object()
            .cloned()
            .unwrap(),
            max_distance_km: Some(50.0),
            max_days_since_sale: Some(730),
            estimated_value: None,
            as_of: Some(as_of()),
        };
        let query = request
            .into_query(&crate::comps::types::QueryDefaults::default())
            .unwrap();

        let raw: Vec<RawRecord> = vec![
            json!({ "id": "best", "gla": 2000, "bedrooms": 3, "bathrooms": 2,
                    "lat": 44.23 + 2.1 * DEG_PER_KM, "lon": -76.59, "property_type": "Townhouse",
                    "close_price": 500000, "close_date": "2024-01-14" }),
            json!({ "id": "far", "gla": 2000, "bedrooms": 3, "bathrooms": 2,
                    "lat": 45.5, "lon": -76.59, "property_type": "Townhouse",
                    "close_price": 500000, "close_date": "2024-05-01" }),
            json!({ "id": "duplex", "gla": 2000, "bedrooms": 3, "bathrooms": 2,
                    "lat": 44.231, "lon": -76.591, "property_type": "Duplex",
                    "close_price": 500000, "close_date": "2024-05-01" }),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();

        let result = Recommender::rule_based()
            .recommend_raw(&query, &raw, &NormalizeOptions::default())
            .unwrap();
        assert_eq!(result.comps.len(), 1);
        let top = &result.comps[0];
        assert_eq!(top.sale.id(), "best");
        assert_eq!(top.rank, 1);
        assert_eq!(top.days_since_sale, 168);
        assert!(top.similarity_score >= 90.0, "{}", top.similarity_score);
    }

    fn write_dataset(path: &Path, count: usize) {
        let properties: Vec<serde_json::Value> = (0..count)
            .map(|i| {
                json!({
                    "id": format!("p{}", i),
                    "address": format!("{} Queen St", i + 10),
                    "gla": 1700 + i * 50,
                    "lat": 44.23 + i as f64 * 0.005,
                    "lon": -76.49,
                    "property_type": "Detached",
                    "close_price": 450000 + i * 10000,
                    "close_date": "2024-05-01"
                })
            })
            .collect();
        fs::write(path, json!({ "properties": properties }).to_string()).unwrap();
    }

    fn config_in(dir: &Path, scorer: ScorerChoice) -> EngineConfig {
        EngineConfig {
            dataset_path: dir.join("dataset.json"),
            model_path: dir.join("model.json"),
            embeddings_path: dir.join("embeddings.json"),
            scorer,
            ..EngineConfig::default()
        }
    }

    fn subject_request() -> SubjectRequest {
        serde_json::from_value(json!({
            "subject": { "address": "1 Subject Rd", "gla": 1800, "lat": 44.23, "lon": -76.49,
                         "property_type": "Detached" },
            "as_of": "2024-06-30"
        }))
        .unwrap()
    }

    #[test]
    fn test_missing_model_degrades_to_fallback() {
        let temp = tempdir().unwrap();
        write_dataset(&temp.path().join("dataset.json"), 5);
        fs::write(temp.path().join("model.json"), "{ not json").unwrap();

        let context = EngineContext::load(&config_in(temp.path(), ScorerChoice::Learned)).unwrap();
        assert!(!context.is_ready());
        assert_eq!(context.records(), 5);

        let query = subject_request()
            .into_query(&EngineConfig::default().query_defaults())
            .unwrap();
        let result = context.recommend(&query).unwrap();
        assert_eq!(result.metadata.scorer_variant, ScorerVariant::Fallback);
        assert!(!result.comps.is_empty());
    }

    #[test]
    fn test_learned_artifact_makes_context_ready() {
        let temp = tempdir().unwrap();
        write_dataset(&temp.path().join("dataset.json"), 5);
        write_json_atomic(&temp.path().join("model.json"), &model_artifact(), 1).unwrap();

        let context = EngineContext::load(&config_in(temp.path(), ScorerChoice::Auto)).unwrap();
        assert!(context.is_ready());
        assert_eq!(context.summary().scorer_variant, ScorerVariant::Learned);
    }

    #[test]
    fn test_embedding_artifact_serves_as_dataset() {
        let temp = tempdir().unwrap();
        let sales: Vec<SaleRecord> = (0..6)
            .map(|i| sale_at(&format!("e{}", i), 44.23 + i as f64 * 0.01, -76.49, 40))
            .collect();
        let index = EmbeddingIndex::build(&sales, 2024).unwrap();
        write_json_atomic(
            &temp.path().join("embeddings.json"),
            &EmbeddingArtifact::new(&index, sales),
            6,
        )
        .unwrap();

        let context = EngineContext::load(&config_in(temp.path(), ScorerChoice::Auto)).unwrap();
        assert!(context.is_ready());
        assert_eq!(context.records(), 6);

        let query = subject_request()
            .into_query(&EngineConfig::default().query_defaults())
            .unwrap();
        let result = context.recommend(&query).unwrap();
        assert_eq!(result.metadata.engine_variant, EngineVariant::PrecomputedEmbeddings);
        assert_eq!(result.metadata.scorer_variant, ScorerVariant::Embedding);
    }

    #[test]
    fn test_missing_dataset_is_unavailable() {
        let temp = tempdir().unwrap();
        let err = EngineContext::load(&config_in(temp.path(), ScorerChoice::Rule))
            .err()
            .unwrap();
        assert!(matches!(err, CompError::DatasetUnavailable(_)));
    }

    #[tokio::test]
    async fn test_engine_reload_swaps_context() {
        let temp = tempdir().unwrap();
        let dataset = temp.path().join("dataset.json");
        write_dataset(&dataset, 3);

        let engine = CompEngine::new(config_in(temp.path(), ScorerChoice::Rule));
        assert!(!engine.is_ready());
        assert!(matches!(
            engine.recommend(subject_request()).await,
            Err(CompError::DatasetUnavailable(_))
        ));

        let summary = engine.reload().await.unwrap();
        assert!(summary.ready);
        assert_eq!(summary.records, 3);
        let before = engine.snapshot();

        write_dataset(&dataset, 7);
        engine.reload().await.unwrap();
        assert_eq!(before.records(), 3);
        assert_eq!(engine.snapshot().records(), 7);

        let result = engine.recommend(subject_request()).await.unwrap();
        assert_eq!(result.metadata.total_candidates, 7);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_context() {
        let temp = tempdir().unwrap();
        let dataset = temp.path().join("dataset.json");
        write_dataset(&dataset, 3);

        let engine = CompEngine::initialize(config_in(temp.path(), ScorerChoice::Rule)).await;
        assert!(engine.is_ready());

        fs::remove_file(&dataset).unwrap();
        assert!(engine.reload().await.is_err());
        assert_eq!(engine.snapshot().records(), 3);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let temp = tempdir().unwrap();
        write_dataset(&temp.path().join("dataset.json"), 3);
        let engine = CompEngine::initialize(config_in(temp.path(), ScorerChoice::Rule)).await;

        let mut request = subject_request();
        request.max_days_since_sale = Some(-1);
        assert!(engine.recommend(request).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_budget_exceeded_is_timeout() {
        let result: Result<()> = run_with_budget(10, || {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(CompError::Timeout(10))));

        let quick = run_with_budget(1_000, || Ok(7)).await.unwrap();
        assert_eq!(quick, 7);
    }
}
