use crate::types::{
    AggregatorError, ExtractionResult, FinancialData, ImpactMagnitude, MarketInfo, Result,
    SectorMention, Sentiment, SentimentAnalysis, SourceArticle, StockMention,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Bucket key for market-moving articles in the market-impact index.
pub const MARKET_MOVING_BUCKET: &str = "market_moving";

const AGGREGATE_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateMetadata {
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: String,
    pub total_articles: u64,
    pub successful_extractions: u64,
    pub failed_extractions: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentimentBucket {
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketImpactCounters {
    pub market_moving_articles: u64,
    pub high_impact_articles: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinancialMetricCounters {
    pub articles_with_numbers: u64,
    pub total_revenue_mentions: u64,
    pub total_profit_mentions: u64,
    pub total_percentage_mentions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerCount {
    pub ticker: String,
    pub mention_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectorCount {
    pub sector: String,
    pub article_count: u64,
}

/// Derived statistics, fully recomputed after every append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub sentiment_overview: BTreeMap<Sentiment, SentimentBucket>,
    pub market_impact: MarketImpactCounters,
    pub financial_metrics: FinancialMetricCounters,
    pub top_stocks: Vec<TickerCount>,
    pub top_sectors: Vec<SectorCount>,
}

impl AggregateSummary {
    fn empty() -> Self {
        let mut sentiment_overview = BTreeMap::new();
        for label in Sentiment::ALL {
            sentiment_overview.insert(label, SentimentBucket::default());
        }
        Self {
            sentiment_overview,
            market_impact: MarketImpactCounters::default(),
            financial_metrics: FinancialMetricCounters::default(),
            top_stocks: Vec::new(),
            top_sectors: Vec::new(),
        }
    }
}

/// Inverted indexes mapping keys to article positions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyIndexes {
    pub by_ticker: BTreeMap<String, Vec<usize>>,
    pub by_sector: BTreeMap<String, Vec<usize>>,
    pub by_sentiment: BTreeMap<Sentiment, Vec<usize>>,
    pub by_market_impact: BTreeMap<String, Vec<usize>>,
    pub by_time: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    pub title: String,
    pub category: String,
    pub description: String,
    pub url: String,
    pub pub_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSnapshot {
    pub full_text: String,
}

/// Denormalized per-article fields precomputed at append time; indexes and
/// queries read these instead of re-deriving from the raw payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickAccess {
    pub tickers: Vec<String>,
    pub sectors: Vec<String>,
    pub overall_sentiment: Sentiment,
    pub sentiment_score: f64,
    pub is_market_moving: bool,
    pub has_financial_numbers: bool,
    pub confidence_score: f64,
}

/// One processed article inside the daily aggregate. `index` is the entry's
/// position in the article list, assigned once and never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleEntry {
    pub index: usize,
    pub guid: String,
    pub extraction_timestamp: DateTime<Utc>,
    pub extraction_model: String,
    pub extraction_confidence: f64,
    pub source: SourceInfo,
    pub content: ContentSnapshot,
    pub sentiment: Option<SentimentAnalysis>,
    pub stocks: Option<Vec<StockMention>>,
    pub sectors: Option<Vec<SectorMention>>,
    pub market: Option<MarketInfo>,
    pub financial: Option<FinancialData>,
    pub quick_access: QuickAccess,
}

/// The per-calendar-day aggregate document: an append-only article list,
/// five inverted indexes, a guid lookup table, and derived summary
/// statistics. Serialized verbatim as the on-disk daily master file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub metadata: AggregateMetadata,
    pub summary: AggregateSummary,
    pub indexes: DailyIndexes,
    pub articles: Vec<ArticleEntry>,
    pub lookup_table: BTreeMap<String, usize>,
}

impl DailyAggregate {
    pub fn new(date: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            metadata: AggregateMetadata {
                date,
                created_at: now,
                last_updated: now,
                version: AGGREGATE_VERSION.to_string(),
                total_articles: 0,
                successful_extractions: 0,
                failed_extractions: 0,
            },
            summary: AggregateSummary::empty(),
            indexes: DailyIndexes::default(),
            articles: Vec::new(),
            lookup_table: BTreeMap::new(),
        }
    }

    /// Append an extraction result, update all indexes and recompute the
    /// summary. A guid already present in the lookup table is rejected so
    /// positions, index buckets and totals stay consistent.
    pub fn append_entry(
        &mut self,
        result: &ExtractionResult,
        article: &SourceArticle,
        success_threshold: f64,
    ) -> Result<usize> {
        let guid = if article.guid.trim().is_empty() {
            format!("unknown_{}", &Uuid::new_v4().simple().to_string()[..8])
        } else {
            article.guid.clone()
        };

        if self.lookup_table.contains_key(&guid) {
            return Err(AggregatorError::DuplicateArticle {
                guid,
                date: self.metadata.date,
            });
        }

        let index = self.articles.len();
        let quick_access = QuickAccess {
            tickers: result.tickers(),
            sectors: result.sector_names(),
            overall_sentiment: result.overall_sentiment(),
            sentiment_score: result
                .sentiment
                .as_ref()
                .map(|s| s.sentiment_score)
                .unwrap_or(0.0),
            is_market_moving: result.is_market_moving(),
            has_financial_numbers: result.has_financial_numbers(),
            confidence_score: result.extraction_confidence,
        };

        let entry = ArticleEntry {
            index,
            guid: guid.clone(),
            extraction_timestamp: result.extraction_timestamp,
            extraction_model: result.extraction_model.clone(),
            extraction_confidence: result.extraction_confidence,
            source: SourceInfo {
                title: article.title.clone(),
                category: article.category.clone(),
                description: article.description.clone(),
                url: article.url.clone(),
                pub_date: article.pub_date.clone(),
            },
            content: ContentSnapshot {
                full_text: article.full_text.clone(),
            },
            sentiment: result.sentiment.clone(),
            stocks: result.stocks.clone(),
            sectors: result.sectors.clone(),
            market: result.market.clone(),
            financial: result.financial.clone(),
            quick_access,
        };

        self.update_indexes(&entry, index);
        self.articles.push(entry);
        self.lookup_table.insert(guid, index);

        self.metadata.total_articles += 1;
        if result.extraction_confidence > success_threshold {
            self.metadata.successful_extractions += 1;
        } else {
            self.metadata.failed_extractions += 1;
        }
        self.metadata.last_updated = Utc::now();

        self.recompute_summary();

        Ok(index)
    }

    fn update_indexes(&mut self, entry: &ArticleEntry, index: usize) {
        for ticker in &entry.quick_access.tickers {
            self.indexes
                .by_ticker
                .entry(ticker.clone())
                .or_default()
                .push(index);
        }
        for sector in &entry.quick_access.sectors {
            self.indexes
                .by_sector
                .entry(sector.clone())
                .or_default()
                .push(index);
        }
        self.indexes
            .by_sentiment
            .entry(entry.quick_access.overall_sentiment)
            .or_default()
            .push(index);
        if entry.quick_access.is_market_moving {
            self.indexes
                .by_market_impact
                .entry(MARKET_MOVING_BUCKET.to_string())
                .or_default()
                .push(index);
        }
        self.indexes.by_time.push(index);
    }

    /// Recompute every derived statistic from the indexes and article list.
    fn recompute_summary(&mut self) {
        let total = self.metadata.total_articles;

        let mut sentiment_overview = BTreeMap::new();
        for label in Sentiment::ALL {
            let count = self
                .indexes
                .by_sentiment
                .get(&label)
                .map(|positions| positions.len() as u64)
                .unwrap_or(0);
            let percentage = if total > 0 {
                round2(count as f64 / total as f64 * 100.0)
            } else {
                0.0
            };
            sentiment_overview.insert(label, SentimentBucket { count, percentage });
        }
        self.summary.sentiment_overview = sentiment_overview;

        self.summary.market_impact = MarketImpactCounters {
            market_moving_articles: self
                .indexes
                .by_market_impact
                .get(MARKET_MOVING_BUCKET)
                .map(|positions| positions.len() as u64)
                .unwrap_or(0),
            high_impact_articles: self
                .articles
                .iter()
                .filter(|a| {
                    a.market
                        .as_ref()
                        .map(|m| m.impact_magnitude == Some(ImpactMagnitude::High))
                        .unwrap_or(false)
                })
                .count() as u64,
        };

        let mut financial = FinancialMetricCounters::default();
        for entry in &self.articles {
            if entry.quick_access.has_financial_numbers {
                financial.articles_with_numbers += 1;
            }
            if let Some(data) = &entry.financial {
                financial.total_revenue_mentions += data.revenues.len() as u64;
                financial.total_profit_mentions += data.profits.len() as u64;
                financial.total_percentage_mentions += data.percentages.len() as u64;
            }
        }
        self.summary.financial_metrics = financial;

        self.summary.top_stocks = top_buckets(&self.indexes.by_ticker)
            .into_iter()
            .map(|(ticker, count)| TickerCount {
                ticker,
                mention_count: count,
            })
            .collect();
        self.summary.top_sectors = top_buckets(&self.indexes.by_sector)
            .into_iter()
            .map(|(sector, count)| SectorCount {
                sector,
                article_count: count,
            })
            .collect();
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Top-10 buckets by cardinality; ties break on key order so the ranking
/// is stable across rewrites.
fn top_buckets(index: &BTreeMap<String, Vec<usize>>) -> Vec<(String, u64)> {
    let mut counts: Vec<(String, u64)> = index
        .iter()
        .map(|(key, positions)| (key.clone(), positions.len() as u64))
        .collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts.truncate(10);
    counts
}

/// Receipt returned by a successful append.
#[derive(Debug, Clone, Serialize)]
pub struct AppendReceipt {
    pub index: usize,
    pub total_articles: u64,
    pub summary: AggregateSummary,
}

/// A date with persisted aggregate data.
#[derive(Debug, Clone, Serialize)]
pub struct AvailableDate {
    pub date: NaiveDate,
    pub path: PathBuf,
    pub file_size_bytes: u64,
}

/// File-backed store for daily aggregates.
///
/// One JSON document per calendar date at
/// `<data_dir>/<YYYY>/<MM>/master_<YYYY-MM-DD>.json`. Every append is a
/// full read-modify-write of the day's document, serialized through a
/// per-date mutex so concurrent appends cannot lose updates.
pub struct AggregationStore {
    data_dir: PathBuf,
    success_threshold: f64,
    locks: std::sync::Mutex<HashMap<NaiveDate, Arc<Mutex<()>>>>,
}

impl AggregationStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        info!("Aggregation store initialized at {}", data_dir.display());
        Ok(Self {
            data_dir,
            success_threshold: 0.5,
            locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Confidence above which an append counts as a successful extraction.
    pub fn with_success_threshold(mut self, threshold: f64) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn master_path(&self, date: NaiveDate) -> PathBuf {
        self.data_dir
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string())
            .join(format!("master_{}.json", date.format("%Y-%m-%d")))
    }

    fn date_lock(&self, date: NaiveDate) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("date lock map poisoned");
        locks.entry(date).or_default().clone()
    }

    /// Append one extraction result to the day's aggregate, creating the
    /// document lazily on first append.
    pub async fn append(
        &self,
        date: NaiveDate,
        result: &ExtractionResult,
        article: &SourceArticle,
    ) -> Result<AppendReceipt> {
        let lock = self.date_lock(date);
        let _guard = lock.lock().await;

        let mut aggregate = match self.read_document(date).await? {
            Some(existing) => existing,
            None => DailyAggregate::new(date),
        };

        let index = aggregate.append_entry(result, article, self.success_threshold)?;
        self.write_document(&aggregate).await?;

        debug!(
            "Added article {} to aggregate for {} at position {}",
            result.article_guid, date, index
        );

        Ok(AppendReceipt {
            index,
            total_articles: aggregate.metadata.total_articles,
            summary: aggregate.summary,
        })
    }

    /// Load the day's aggregate, if any.
    pub async fn load(&self, date: NaiveDate) -> Result<Option<DailyAggregate>> {
        self.read_document(date).await
    }

    async fn read_document(&self, date: NaiveDate) -> Result<Option<DailyAggregate>> {
        let path = self.master_path(date);
        if !path.exists() {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn write_document(&self, aggregate: &DailyAggregate) -> Result<()> {
        let path = self.master_path(aggregate.metadata.date);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let serialized = serde_json::to_string_pretty(aggregate)?;

        // Write-then-rename keeps a reader from ever seeing a torn document.
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, serialized).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    /// All dates with persisted aggregate data, newest first.
    pub fn available_dates(&self) -> Result<Vec<AvailableDate>> {
        let mut dates = Vec::new();

        for year_entry in read_dir_or_empty(&self.data_dir)? {
            let year_path = year_entry.path();
            if !year_path.is_dir() || !is_numeric_name(&year_path) {
                continue;
            }
            for month_entry in read_dir_or_empty(&year_path)? {
                let month_path = month_entry.path();
                if !month_path.is_dir() || !is_numeric_name(&month_path) {
                    continue;
                }
                for file_entry in read_dir_or_empty(&month_path)? {
                    let path = file_entry.path();
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    let Some(date_part) = name
                        .strip_prefix("master_")
                        .and_then(|rest| rest.strip_suffix(".json"))
                    else {
                        continue;
                    };
                    let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
                        continue;
                    };
                    let file_size_bytes = file_entry.metadata().map(|m| m.len()).unwrap_or(0);
                    dates.push(AvailableDate {
                        date,
                        path,
                        file_size_bytes,
                    });
                }
            }
        }

        dates.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(dates)
    }
}

fn read_dir_or_empty(path: &Path) -> Result<Vec<std::fs::DirEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(path)?.collect::<std::io::Result<Vec<_>>>()?;
    Ok(entries)
}

fn is_numeric_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}
