use crate::aggregate::AggregationStore;
use crate::completeness::CompletenessTracker;
use crate::feed::ArticleFeed;
use crate::producer::ExtractionProducer;
use crate::types::{AggregatorError, Result, SourceArticle};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Articles per batch.
    pub batch_size: usize,
    /// Delay between articles, to respect producer rate limits.
    pub article_delay: Duration,
    /// Delay between batches.
    pub batch_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            article_delay: Duration::from_secs(1),
            batch_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Processing,
    Completed,
    Failed,
}

/// Progress tracking for one orchestrator run over a backlog.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub total_batches: usize,
    pub completed_batches: usize,
    pub total_articles: usize,
    pub processed_articles: usize,
    pub successful_extractions: usize,
    pub failed_extractions: usize,
    pub errors: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Session {
    fn new(session_id: Uuid, total_articles: Option<usize>, batch_size: usize) -> Self {
        let total_articles = total_articles.unwrap_or(0);
        Self {
            session_id,
            status: SessionStatus::Created,
            total_batches: total_articles.div_ceil(batch_size),
            completed_batches: 0,
            total_articles,
            processed_articles: 0,
            successful_extractions: 0,
            failed_extractions: 0,
            errors: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
        }
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total_batches == 0 {
            return 0.0;
        }
        self.completed_batches as f64 / self.total_batches as f64 * 100.0
    }

    pub fn success_rate(&self) -> f64 {
        if self.processed_articles == 0 {
            return 0.0;
        }
        self.successful_extractions as f64 / self.processed_articles as f64 * 100.0
    }
}

/// Final accounting for one backlog run.
#[derive(Debug, Clone, Serialize)]
pub struct SessionResult {
    pub session_id: Uuid,
    pub date: NaiveDate,
    pub total_candidates: usize,
    pub already_processed: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub errors: Vec<String>,
}

/// Drives a day's article backlog through extraction, aggregation and
/// completeness tracking in fixed-size batches, with failure accounting
/// isolated per article and per batch.
///
/// All collaborators are injected at construction; the orchestrator holds
/// no global state.
pub struct PipelineOrchestrator {
    feed: Arc<dyn ArticleFeed>,
    producer: Arc<dyn ExtractionProducer>,
    tracker: Arc<CompletenessTracker>,
    store: Arc<AggregationStore>,
    config: PipelineConfig,
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
}

impl PipelineOrchestrator {
    pub fn new(
        feed: Arc<dyn ArticleFeed>,
        producer: Arc<dyn ExtractionProducer>,
        tracker: Arc<CompletenessTracker>,
        store: Arc<AggregationStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            feed,
            producer,
            tracker,
            store,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new session, optionally sized up front.
    pub async fn create_session(&self, total_articles: Option<usize>) -> Uuid {
        let session_id = Uuid::new_v4();
        let session = Session::new(session_id, total_articles, self.config.batch_size);
        self.sessions.write().await.insert(session_id, session);
        info!("Created extraction session {}", session_id);
        session_id
    }

    pub async fn session(&self, session_id: Uuid) -> Option<Session> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        sessions
    }

    /// Process the day's backlog to completion.
    pub async fn process_backlog(&self, date: NaiveDate) -> Result<SessionResult> {
        let session_id = self.create_session(None).await;
        self.run_backlog(date, session_id).await
    }

    /// Fire-and-forget variant: starts the run on a background task and
    /// returns the session id immediately. Progress is visible through
    /// `session()`.
    pub async fn spawn_backlog(self: &Arc<Self>, date: NaiveDate) -> Uuid {
        let session_id = self.create_session(None).await;
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run_backlog(date, session_id).await {
                error!("Background session {} failed: {}", session_id, e);
            }
        });
        session_id
    }

    async fn run_backlog(&self, date: NaiveDate, session_id: Uuid) -> Result<SessionResult> {
        match self.run_batches(date, session_id).await {
            Ok(result) => Ok(result),
            Err(e) => {
                // Only errors escaping the batch loop reach this arm; they
                // terminate the session.
                let message = format!("Fatal error: {}", e);
                error!("Session {} failed: {}", session_id, message);
                self.update_session(session_id, |session| {
                    session.status = SessionStatus::Failed;
                    session.end_time = Some(Utc::now());
                    session.errors.push(message);
                })
                .await;
                Err(e)
            }
        }
    }

    async fn run_batches(&self, date: NaiveDate, session_id: Uuid) -> Result<SessionResult> {
        let candidates = self.feed.articles_for(date).await?;
        let processed_guids = self.tracker.processed_guids(date).await?;

        let work: Vec<SourceArticle> = candidates
            .iter()
            .filter(|a| !processed_guids.contains(&a.guid))
            .cloned()
            .collect();
        let already_processed = candidates.len() - work.len();

        info!(
            "Session {}: {} candidates for {}, {} already processed, {} to do",
            session_id,
            candidates.len(),
            date,
            already_processed,
            work.len()
        );

        let total_batches = work.len().div_ceil(self.config.batch_size.max(1));
        self.update_session(session_id, |session| {
            session.status = SessionStatus::Processing;
            session.total_articles = work.len();
            session.total_batches = total_batches;
        })
        .await;

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut errors: Vec<String> = Vec::new();

        for (batch_num, batch) in work.chunks(self.config.batch_size.max(1)).enumerate() {
            if batch_num > 0 && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }

            info!(
                "Session {}: processing batch {}/{} ({} articles)",
                session_id,
                batch_num + 1,
                total_batches,
                batch.len()
            );

            let (batch_succeeded, batch_failed) = self
                .process_batch(date, batch, batch_num + 1, &mut errors)
                .await;
            succeeded += batch_succeeded;
            failed += batch_failed;

            self.update_session(session_id, |session| {
                session.completed_batches += 1;
                session.processed_articles += batch.len();
                session.successful_extractions += batch_succeeded;
                session.failed_extractions += batch_failed;
                session.errors = errors.clone();
            })
            .await;
        }

        self.update_session(session_id, |session| {
            session.status = SessionStatus::Completed;
            session.end_time = Some(Utc::now());
        })
        .await;

        let processed = work.len();
        let success_rate = if processed > 0 {
            succeeded as f64 / processed as f64 * 100.0
        } else {
            0.0
        };

        info!(
            "Session {} completed: {}/{} succeeded ({:.1}%)",
            session_id, succeeded, processed, success_rate
        );

        Ok(SessionResult {
            session_id,
            date,
            total_candidates: candidates.len(),
            already_processed,
            processed,
            succeeded,
            failed,
            success_rate,
            errors,
        })
    }

    /// Process one batch. Per-article failures are folded into the counts;
    /// a batch-level extraction failure marks every article in the batch
    /// failed. Never propagates an error, so the session always continues
    /// to the next batch.
    async fn process_batch(
        &self,
        date: NaiveDate,
        batch: &[SourceArticle],
        batch_num: usize,
        errors: &mut Vec<String>,
    ) -> (usize, usize) {
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        // Missing required fields disqualify just that article.
        let mut valid: Vec<SourceArticle> = Vec::new();
        for article in batch {
            match validate_article(article) {
                Ok(()) => valid.push(article.clone()),
                Err(e) => {
                    warn!("Skipping article in batch {}: {}", batch_num, e);
                    errors.push(e.to_string());
                    failed += 1;
                }
            }
        }

        let extraction = match self
            .producer
            .extract_batch(&valid, self.config.article_delay)
            .await
        {
            Ok(extraction) => extraction,
            Err(e) => {
                let message = format!("Batch {} failed: {}", batch_num, e);
                error!("{}", message);
                errors.push(message);
                failed += valid.len();
                return (succeeded, failed);
            }
        };

        failed += extraction.failed_extractions;
        errors.extend(extraction.errors.iter().cloned());

        let by_guid: HashMap<&str, &SourceArticle> =
            valid.iter().map(|a| (a.guid.as_str(), a)).collect();

        for result in &extraction.results {
            let Some(&article) = by_guid.get(result.article_guid.as_str()) else {
                // Producer returned a result for an article it was not given.
                errors.push(format!(
                    "Batch {}: unexpected result for unknown guid {}",
                    batch_num, result.article_guid
                ));
                failed += 1;
                continue;
            };

            match self.store.append(date, result, article).await {
                Ok(receipt) => {
                    succeeded += 1;

                    match self.tracker.save_complete(date, result).await {
                        Ok(outcome) if !outcome.failed_components.is_empty() => {
                            let message = format!(
                                "Article {}: saved partially, missing components: {}",
                                result.article_guid,
                                outcome
                                    .failed_components
                                    .iter()
                                    .map(|c| c.to_string())
                                    .collect::<Vec<_>>()
                                    .join(", ")
                            );
                            warn!("{}", message);
                            errors.push(message);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            // The aggregate entry exists, so the article
                            // still counts as succeeded.
                            let message = format!(
                                "Article {}: completeness record failed: {}",
                                result.article_guid, e
                            );
                            warn!("{}", message);
                            errors.push(message);
                        }
                    }

                    if receipt.index % 50 == 0 && receipt.index > 0 {
                        info!(
                            "Aggregate for {} reached {} articles",
                            date, receipt.total_articles
                        );
                    }
                }
                Err(e) => {
                    let message =
                        format!("Article {}: aggregate append failed: {}", result.article_guid, e);
                    warn!("{}", message);
                    errors.push(message);
                    failed += 1;
                }
            }
        }

        (succeeded, failed)
    }

    async fn update_session<F: FnOnce(&mut Session)>(&self, session_id: Uuid, apply: F) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&session_id) {
            apply(session);
        }
    }
}

/// Check the fields the pipeline cannot proceed without.
fn validate_article(article: &SourceArticle) -> Result<()> {
    if article.guid.trim().is_empty() {
        return Err(AggregatorError::MissingField {
            guid: article.title.clone(),
            field: "guid",
        });
    }
    if article.title.trim().is_empty() {
        return Err(AggregatorError::MissingField {
            guid: article.guid.clone(),
            field: "title",
        });
    }
    if article.full_text.trim().is_empty() {
        return Err(AggregatorError::MissingField {
            guid: article.guid.clone(),
            field: "full_text",
        });
    }
    if !article.url.is_empty() {
        url::Url::parse(&article.url)?;
    }
    Ok(())
}
