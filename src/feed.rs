use crate::types::{AggregatorError, Result, SourceArticle};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{info, warn};

/// Trait for sources that deliver the backlog of candidate articles for a
/// calendar date (crawler output, database dump, fixture set).
#[async_trait]
pub trait ArticleFeed: Send + Sync {
    /// Human-readable name for this source.
    fn source_name(&self) -> String;

    /// Fetch the candidate articles for the given date.
    async fn articles_for(&self, date: NaiveDate) -> Result<Vec<SourceArticle>>;
}

/// Feed backed by per-day crawler JSON dumps on disk.
///
/// Expects `<base_dir>/<YYYY-MM-DD>/articles_<YYYY-MM-DD>.json` holding
/// either `{"articles": [...]}` or a bare article array. Entries without
/// full text are dropped: they never made it through HTML extraction and
/// carry nothing to analyze.
pub struct JsonBacklogFeed {
    base_dir: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BacklogFile {
    Wrapped { articles: Vec<SourceArticle> },
    Bare(Vec<SourceArticle>),
}

impl JsonBacklogFeed {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn backlog_path(&self, date: NaiveDate) -> PathBuf {
        let day = date.format("%Y-%m-%d").to_string();
        self.base_dir.join(&day).join(format!("articles_{}.json", day))
    }
}

#[async_trait]
impl ArticleFeed for JsonBacklogFeed {
    fn source_name(&self) -> String {
        format!("json_backlog({})", self.base_dir.display())
    }

    async fn articles_for(&self, date: NaiveDate) -> Result<Vec<SourceArticle>> {
        let path = self.backlog_path(date);
        if !path.exists() {
            return Err(AggregatorError::General(format!(
                "No article backlog found at {}",
                path.display()
            )));
        }

        let raw = tokio::fs::read_to_string(&path).await?;
        let parsed: BacklogFile = serde_json::from_str(&raw)?;
        let all = match parsed {
            BacklogFile::Wrapped { articles } => articles,
            BacklogFile::Bare(articles) => articles,
        };

        let total = all.len();
        let articles: Vec<SourceArticle> = all
            .into_iter()
            .filter(|a| !a.full_text.trim().is_empty())
            .collect();

        if articles.len() < total {
            warn!(
                "Dropped {} of {} articles without extracted text for {}",
                total - articles.len(),
                total,
                date
            );
        }
        info!(
            "Loaded {} candidate articles for {} from {}",
            articles.len(),
            date,
            path.display()
        );

        Ok(articles)
    }
}

/// In-memory feed used by tests and demos.
pub struct StaticFeed {
    name: String,
    articles: Vec<SourceArticle>,
}

impl StaticFeed {
    pub fn new(name: impl Into<String>, articles: Vec<SourceArticle>) -> Self {
        Self {
            name: name.into(),
            articles,
        }
    }
}

#[async_trait]
impl ArticleFeed for StaticFeed {
    fn source_name(&self) -> String {
        self.name.clone()
    }

    async fn articles_for(&self, _date: NaiveDate) -> Result<Vec<SourceArticle>> {
        Ok(self.articles.clone())
    }
}
