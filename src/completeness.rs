use crate::types::{
    Component, CompletionStatus, ExtractionResult, FinancialData, MarketInfo, Result,
    SectorMention, Sentiment, SentimentAnalysis, StockMention,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Per-article master record: which of the five extraction sub-components
/// were durably persisted, plus a denormalized summary for quick lookups.
/// Upserted by guid, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletenessRecord {
    pub article_guid: String,
    pub target_date: NaiveDate,
    pub completion_status: CompletionStatus,
    pub components_saved: Vec<Component>,
    pub overall_sentiment: Option<Sentiment>,
    pub tickers_mentioned: Vec<String>,
    pub sectors_affected: Vec<String>,
    pub market_moving: bool,
    pub has_financial_data: bool,
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

impl CompletenessRecord {
    /// Build the in-progress record from whatever sub-payloads are present.
    pub fn from_result(target_date: NaiveDate, result: &ExtractionResult) -> Self {
        Self {
            article_guid: result.article_guid.clone(),
            target_date,
            completion_status: CompletionStatus::InProgress,
            components_saved: Vec::new(),
            overall_sentiment: result.sentiment.as_ref().map(|s| s.overall_sentiment),
            tickers_mentioned: result.tickers(),
            sectors_affected: result.sector_names(),
            market_moving: result.is_market_moving(),
            has_financial_data: result.has_financial_numbers(),
            confidence: result.extraction_confidence,
            updated_at: Utc::now(),
        }
    }
}

/// Extraction metadata stamped onto every persisted component record.
#[derive(Debug, Clone)]
pub struct ExtractionContext {
    pub target_date: NaiveDate,
    pub extraction_timestamp: DateTime<Utc>,
    pub extraction_model: String,
}

impl ExtractionContext {
    pub fn new(target_date: NaiveDate, result: &ExtractionResult) -> Self {
        Self {
            target_date,
            extraction_timestamp: result.extraction_timestamp,
            extraction_model: result.extraction_model.clone(),
        }
    }
}

/// Downstream document store holding one master record and up to five
/// component records per article. Every write is an upsert keyed by guid
/// (or guid + sub-key for list components), so replays are safe.
#[async_trait]
pub trait ComponentStore: Send + Sync {
    async fn upsert_master(&self, record: &CompletenessRecord) -> Result<()>;

    async fn get_master(&self, guid: &str) -> Result<Option<CompletenessRecord>>;

    /// Guids with a master record for the date.
    async fn master_guids_for(&self, date: NaiveDate) -> Result<HashSet<String>>;

    /// Guids with at least one component record for the date, across all
    /// five component collections.
    async fn component_guids_for(&self, date: NaiveDate) -> Result<HashSet<String>>;

    async fn save_sentiment(
        &self,
        guid: &str,
        payload: &SentimentAnalysis,
        ctx: &ExtractionContext,
    ) -> Result<()>;

    async fn save_stocks(
        &self,
        guid: &str,
        payload: &[StockMention],
        ctx: &ExtractionContext,
    ) -> Result<()>;

    async fn save_sectors(
        &self,
        guid: &str,
        payload: &[SectorMention],
        ctx: &ExtractionContext,
    ) -> Result<()>;

    async fn save_market(
        &self,
        guid: &str,
        payload: &MarketInfo,
        ctx: &ExtractionContext,
    ) -> Result<()>;

    async fn save_financial(
        &self,
        guid: &str,
        payload: &FinancialData,
        ctx: &ExtractionContext,
    ) -> Result<()>;
}

/// Outcome of a `save_complete` call.
#[derive(Debug, Clone, Serialize)]
pub struct SaveOutcome {
    pub completion_status: CompletionStatus,
    pub components_saved: Vec<Component>,
    pub failed_components: Vec<Component>,
}

/// Result of a completeness lookup for one guid.
#[derive(Debug, Clone, Serialize)]
pub struct CompletenessCheck {
    pub exists: bool,
    pub completion_status: Option<CompletionStatus>,
    pub missing_components: Vec<Component>,
}

/// Tracks which articles were already processed and how completely their
/// extraction sub-components were persisted.
pub struct CompletenessTracker {
    store: Arc<dyn ComponentStore>,
}

impl CompletenessTracker {
    pub fn new(store: Arc<dyn ComponentStore>) -> Self {
        Self { store }
    }

    /// Guids the orchestrator must skip for the date.
    ///
    /// Unions master-record guids with guids found directly in the component
    /// collections, so a guid whose master upsert failed but whose component
    /// save succeeded is still treated as processed.
    pub async fn processed_guids(&self, date: NaiveDate) -> Result<HashSet<String>> {
        let mut guids = self.store.master_guids_for(date).await?;
        let from_components = self.store.component_guids_for(date).await?;
        let master_count = guids.len();
        guids.extend(from_components);
        debug!(
            "Processed guids for {}: {} from master records, {} total",
            date,
            master_count,
            guids.len()
        );
        Ok(guids)
    }

    /// Persist a full extraction result: master record first (in_progress),
    /// then each present sub-component independently, then the master's
    /// terminal state. Re-calling with the same guid replays the upserts.
    pub async fn save_complete(
        &self,
        date: NaiveDate,
        result: &ExtractionResult,
    ) -> Result<SaveOutcome> {
        let guid = &result.article_guid;
        let ctx = ExtractionContext::new(date, result);
        let mut record = CompletenessRecord::from_result(date, result);

        if let Err(e) = self.store.upsert_master(&record).await {
            // The component saves below may still succeed; processed_guids
            // covers that case through the component collections.
            warn!("Initial master upsert failed for {}: {}", guid, e);
        }

        let present = result.present_components();
        let mut saved = Vec::new();
        let mut failed = Vec::new();

        if let Some(payload) = &result.sentiment {
            record_attempt(
                Component::Sentiment,
                self.store.save_sentiment(guid, payload, &ctx).await,
                guid,
                &mut saved,
                &mut failed,
            );
        }
        if let Some(payload) = result.stocks.as_deref() {
            record_attempt(
                Component::Stocks,
                self.store.save_stocks(guid, payload, &ctx).await,
                guid,
                &mut saved,
                &mut failed,
            );
        }
        if let Some(payload) = result.sectors.as_deref() {
            record_attempt(
                Component::Sectors,
                self.store.save_sectors(guid, payload, &ctx).await,
                guid,
                &mut saved,
                &mut failed,
            );
        }
        if let Some(payload) = &result.market {
            record_attempt(
                Component::Market,
                self.store.save_market(guid, payload, &ctx).await,
                guid,
                &mut saved,
                &mut failed,
            );
        }
        if let Some(payload) = &result.financial {
            record_attempt(
                Component::Financial,
                self.store.save_financial(guid, payload, &ctx).await,
                guid,
                &mut saved,
                &mut failed,
            );
        }

        let completion_status =
            if present.len() == Component::ALL.len() && failed.is_empty() {
                CompletionStatus::Completed
            } else {
                CompletionStatus::Partial
            };

        record.components_saved = saved.clone();
        record.completion_status = completion_status;
        record.updated_at = Utc::now();
        self.store.upsert_master(&record).await?;

        info!(
            "Saved extraction for {}: {:?} ({} of {} components)",
            guid,
            completion_status,
            saved.len(),
            Component::ALL.len()
        );

        Ok(SaveOutcome {
            completion_status,
            components_saved: saved,
            failed_components: failed,
        })
    }

    /// Check how completely an article was persisted.
    pub async fn check_completeness(&self, guid: &str) -> Result<CompletenessCheck> {
        match self.store.get_master(guid).await? {
            Some(record) => {
                let saved: HashSet<Component> =
                    record.components_saved.iter().copied().collect();
                let missing = Component::ALL
                    .iter()
                    .copied()
                    .filter(|c| !saved.contains(c))
                    .collect();
                Ok(CompletenessCheck {
                    exists: true,
                    completion_status: Some(record.completion_status),
                    missing_components: missing,
                })
            }
            None => Ok(CompletenessCheck {
                exists: false,
                completion_status: None,
                missing_components: Component::ALL.to_vec(),
            }),
        }
    }
}

fn record_attempt(
    component: Component,
    attempt: Result<()>,
    guid: &str,
    saved: &mut Vec<Component>,
    failed: &mut Vec<Component>,
) {
    match attempt {
        Ok(()) => saved.push(component),
        Err(e) => {
            warn!("Failed to persist {} component for {}: {}", component, guid, e);
            failed.push(component);
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    masters: HashMap<String, CompletenessRecord>,
    sentiment: HashMap<String, (NaiveDate, SentimentAnalysis)>,
    stocks: HashMap<String, (NaiveDate, Vec<StockMention>)>,
    sectors: HashMap<String, (NaiveDate, Vec<SectorMention>)>,
    market: HashMap<String, (NaiveDate, MarketInfo)>,
    financial: HashMap<String, (NaiveDate, FinancialData)>,
}

/// In-process component store for tests, demos and database-less runs.
///
/// Individual component saves (or all master upserts) can be configured to
/// fail, to exercise partial-save accounting.
#[derive(Default)]
pub struct MemoryComponentStore {
    inner: RwLock<MemoryInner>,
    fail_components: HashSet<Component>,
    fail_master: bool,
}

impl MemoryComponentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failing_components(mut self, components: impl IntoIterator<Item = Component>) -> Self {
        self.fail_components = components.into_iter().collect();
        self
    }

    pub fn with_failing_master(mut self) -> Self {
        self.fail_master = true;
        self
    }

    fn check_failure(&self, guid: &str, component: Component) -> Result<()> {
        if self.fail_components.contains(&component) {
            return Err(crate::types::AggregatorError::ComponentPersist {
                guid: guid.to_string(),
                component,
                message: "simulated persistence failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ComponentStore for MemoryComponentStore {
    async fn upsert_master(&self, record: &CompletenessRecord) -> Result<()> {
        if self.fail_master {
            return Err(crate::types::AggregatorError::General(
                "simulated master upsert failure".to_string(),
            ));
        }
        let mut inner = self.inner.write().await;
        inner
            .masters
            .insert(record.article_guid.clone(), record.clone());
        Ok(())
    }

    async fn get_master(&self, guid: &str) -> Result<Option<CompletenessRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.masters.get(guid).cloned())
    }

    async fn master_guids_for(&self, date: NaiveDate) -> Result<HashSet<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .masters
            .values()
            .filter(|r| r.target_date == date)
            .map(|r| r.article_guid.clone())
            .collect())
    }

    async fn component_guids_for(&self, date: NaiveDate) -> Result<HashSet<String>> {
        let inner = self.inner.read().await;
        let mut guids = HashSet::new();
        guids.extend(
            inner
                .sentiment
                .iter()
                .filter(|(_, (d, _))| *d == date)
                .map(|(g, _)| g.clone()),
        );
        guids.extend(
            inner
                .stocks
                .iter()
                .filter(|(_, (d, _))| *d == date)
                .map(|(g, _)| g.clone()),
        );
        guids.extend(
            inner
                .sectors
                .iter()
                .filter(|(_, (d, _))| *d == date)
                .map(|(g, _)| g.clone()),
        );
        guids.extend(
            inner
                .market
                .iter()
                .filter(|(_, (d, _))| *d == date)
                .map(|(g, _)| g.clone()),
        );
        guids.extend(
            inner
                .financial
                .iter()
                .filter(|(_, (d, _))| *d == date)
                .map(|(g, _)| g.clone()),
        );
        Ok(guids)
    }

    async fn save_sentiment(
        &self,
        guid: &str,
        payload: &SentimentAnalysis,
        ctx: &ExtractionContext,
    ) -> Result<()> {
        self.check_failure(guid, Component::Sentiment)?;
        let mut inner = self.inner.write().await;
        inner
            .sentiment
            .insert(guid.to_string(), (ctx.target_date, payload.clone()));
        Ok(())
    }

    async fn save_stocks(
        &self,
        guid: &str,
        payload: &[StockMention],
        ctx: &ExtractionContext,
    ) -> Result<()> {
        self.check_failure(guid, Component::Stocks)?;
        let mut inner = self.inner.write().await;
        inner
            .stocks
            .insert(guid.to_string(), (ctx.target_date, payload.to_vec()));
        Ok(())
    }

    async fn save_sectors(
        &self,
        guid: &str,
        payload: &[SectorMention],
        ctx: &ExtractionContext,
    ) -> Result<()> {
        self.check_failure(guid, Component::Sectors)?;
        let mut inner = self.inner.write().await;
        inner
            .sectors
            .insert(guid.to_string(), (ctx.target_date, payload.to_vec()));
        Ok(())
    }

    async fn save_market(
        &self,
        guid: &str,
        payload: &MarketInfo,
        ctx: &ExtractionContext,
    ) -> Result<()> {
        self.check_failure(guid, Component::Market)?;
        let mut inner = self.inner.write().await;
        inner
            .market
            .insert(guid.to_string(), (ctx.target_date, payload.clone()));
        Ok(())
    }

    async fn save_financial(
        &self,
        guid: &str,
        payload: &FinancialData,
        ctx: &ExtractionContext,
    ) -> Result<()> {
        self.check_failure(guid, Component::Financial)?;
        let mut inner = self.inner.write().await;
        inner
            .financial
            .insert(guid.to_string(), (ctx.target_date, payload.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FinancialFigure;

    fn result_with(components: &[Component]) -> ExtractionResult {
        let set: HashSet<Component> = components.iter().copied().collect();
        ExtractionResult {
            article_guid: "guid-x".to_string(),
            article_title: "title".to_string(),
            article_category: "markets".to_string(),
            extraction_timestamp: Utc::now(),
            extraction_model: "test-model".to_string(),
            extraction_confidence: 0.9,
            sentiment: set.contains(&Component::Sentiment).then(|| SentimentAnalysis {
                overall_sentiment: Sentiment::Positive,
                sentiment_score: 0.7,
                key_factors: vec!["earnings".to_string()],
            }),
            stocks: set.contains(&Component::Stocks).then(|| {
                vec![StockMention {
                    ticker: "VCB".to_string(),
                    company_name: Some("Vietcombank".to_string()),
                    sentiment: Sentiment::Positive,
                    impact_type: "financial".to_string(),
                    price_impact: "up".to_string(),
                    confidence: 0.9,
                }]
            }),
            sectors: set.contains(&Component::Sectors).then(|| {
                vec![SectorMention {
                    sector_name: "Banking".to_string(),
                    sentiment: Sentiment::Positive,
                    impact_description: "strong quarter".to_string(),
                    affected_companies: vec!["Vietcombank".to_string()],
                }]
            }),
            market: set.contains(&Component::Market).then(|| MarketInfo {
                scope: "sector".to_string(),
                exchange: "HOSE".to_string(),
                market_moving: false,
                impact_magnitude: None,
                key_indices: Vec::new(),
            }),
            financial: set.contains(&Component::Financial).then(|| FinancialData {
                has_numbers: true,
                revenues: Vec::new(),
                profits: Vec::new(),
                percentages: vec![FinancialFigure {
                    value: "25%".to_string(),
                    context: None,
                }],
                amounts: Vec::new(),
            }),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[tokio::test]
    async fn partial_input_yields_partial_status() {
        let store = Arc::new(MemoryComponentStore::new());
        let tracker = CompletenessTracker::new(store);

        let outcome = tracker
            .save_complete(date(), &result_with(&[Component::Sentiment, Component::Stocks]))
            .await
            .unwrap();

        assert_eq!(outcome.completion_status, CompletionStatus::Partial);
        assert_eq!(
            outcome.components_saved,
            vec![Component::Sentiment, Component::Stocks]
        );
        assert!(outcome.failed_components.is_empty());

        let check = tracker.check_completeness("guid-x").await.unwrap();
        assert!(check.exists);
        assert_eq!(check.completion_status, Some(CompletionStatus::Partial));
        assert_eq!(
            check.missing_components,
            vec![Component::Sectors, Component::Market, Component::Financial]
        );
    }

    #[tokio::test]
    async fn full_input_yields_completed_status() {
        let store = Arc::new(MemoryComponentStore::new());
        let tracker = CompletenessTracker::new(store);

        let outcome = tracker
            .save_complete(date(), &result_with(&Component::ALL))
            .await
            .unwrap();

        assert_eq!(outcome.completion_status, CompletionStatus::Completed);
        assert_eq!(outcome.components_saved.len(), 5);
    }

    #[tokio::test]
    async fn component_failure_downgrades_to_partial() {
        let store =
            Arc::new(MemoryComponentStore::new().with_failing_components([Component::Market]));
        let tracker = CompletenessTracker::new(store);

        let outcome = tracker
            .save_complete(date(), &result_with(&Component::ALL))
            .await
            .unwrap();

        assert_eq!(outcome.completion_status, CompletionStatus::Partial);
        assert_eq!(outcome.failed_components, vec![Component::Market]);
        assert_eq!(outcome.components_saved.len(), 4);

        // The guid must still be treated as processed.
        let processed = tracker.processed_guids(date()).await.unwrap();
        assert!(processed.contains("guid-x"));
    }

    #[tokio::test]
    async fn component_records_cover_master_upsert_failure() {
        let store = Arc::new(MemoryComponentStore::new().with_failing_master());
        let tracker = CompletenessTracker::new(store);

        // The terminal master upsert fails, but the component saves landed.
        assert!(tracker
            .save_complete(date(), &result_with(&Component::ALL))
            .await
            .is_err());

        let processed = tracker.processed_guids(date()).await.unwrap();
        assert!(processed.contains("guid-x"));
    }

    #[tokio::test]
    async fn save_complete_is_idempotent() {
        let store = Arc::new(MemoryComponentStore::new());
        let tracker = CompletenessTracker::new(store);
        let result = result_with(&Component::ALL);

        let first = tracker.save_complete(date(), &result).await.unwrap();
        let second = tracker.save_complete(date(), &result).await.unwrap();
        assert_eq!(first.completion_status, second.completion_status);

        let processed = tracker.processed_guids(date()).await.unwrap();
        assert_eq!(processed.len(), 1);
    }
}
