use crate::aggregate::{
    AggregateMetadata, AggregateSummary, AggregationStore, ArticleEntry, AvailableDate,
    DailyAggregate, MARKET_MOVING_BUCKET,
};
use crate::types::{AggregatorError, Result, Sentiment};
use crate::utils::truncate_preview;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Characters of article text returned when full content is not requested.
pub const PREVIEW_CHARS: usize = 500;

/// Filters for querying a daily aggregate. Empty lists do not constrain.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub tickers: Vec<String>,
    pub sectors: Vec<String>,
    pub sentiments: Vec<Sentiment>,
    pub market_moving_only: bool,
    pub min_confidence: Option<f64>,
    pub limit: Option<usize>,
    pub include_full_content: bool,
}

impl QueryFilters {
    /// Whether any constraint is active. `include_full_content` only shapes
    /// the returned payload, it is not a constraint.
    pub fn has_constraints(&self) -> bool {
        !self.tickers.is_empty()
            || !self.sectors.is_empty()
            || !self.sentiments.is_empty()
            || self.market_moving_only
            || self.min_confidence.is_some()
            || self.limit.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuerySummary {
    pub total_articles_available: usize,
    pub articles_matched: usize,
    pub articles_returned: usize,
    pub query_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyQueryResponse {
    pub date: NaiveDate,
    pub metadata: AggregateMetadata,
    pub summary: AggregateSummary,
    /// Present only when article filtering ran.
    pub query_summary: Option<QuerySummary>,
    pub articles: Vec<ArticleEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickerAnalysis {
    pub date: NaiveDate,
    pub ticker: String,
    pub total_articles: usize,
    pub sentiment_distribution: BTreeMap<Sentiment, u64>,
    pub avg_confidence: f64,
    pub impact_type_distribution: BTreeMap<String, u64>,
    pub price_impact_distribution: BTreeMap<String, u64>,
    pub articles: Vec<ArticleEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectorAnalysis {
    pub date: NaiveDate,
    pub sector: String,
    pub total_articles: usize,
    pub sentiment_distribution: BTreeMap<Sentiment, u64>,
    pub affected_companies: Vec<String>,
    pub articles: Vec<ArticleEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub focus_tickers: Vec<String>,
    pub focus_sectors: Vec<String>,
    pub total_articles: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutiveSummary {
    pub total_articles_analyzed: usize,
    pub dominant_sentiment: Sentiment,
    pub sentiment_distribution: BTreeMap<Sentiment, u64>,
    pub market_moving_articles: u64,
    pub market_moving_ratio: f64,
    pub articles_with_financial_data: u64,
    pub avg_confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StockArticleRef {
    pub title: String,
    pub url: String,
    pub pub_date: String,
    pub sentiment: Sentiment,
    pub impact_type: String,
    pub price_impact: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StockReportSection {
    pub ticker: String,
    pub total_mentions: usize,
    pub primary_sentiment: Sentiment,
    pub sentiment_distribution: BTreeMap<Sentiment, u64>,
    pub impact_type_distribution: BTreeMap<String, u64>,
    pub price_impact_distribution: BTreeMap<String, u64>,
    pub avg_confidence: f64,
    pub articles: Vec<StockArticleRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectorArticleRef {
    pub title: String,
    pub url: String,
    pub sentiment: Sentiment,
    pub impact_description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectorReportSection {
    pub sector: String,
    pub total_articles: usize,
    pub primary_sentiment: Sentiment,
    pub sentiment_distribution: BTreeMap<Sentiment, u64>,
    pub affected_companies: Vec<String>,
    pub key_impacts: Vec<String>,
    pub articles: Vec<SectorArticleRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketOverview {
    pub market_moving_articles: usize,
    pub market_moving_percentage: f64,
    pub scope_distribution: BTreeMap<String, u64>,
    pub exchange_distribution: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportAppendix {
    pub all_tickers_mentioned: Vec<String>,
    pub all_sectors_mentioned: Vec<String>,
    pub sentiment_distribution: BTreeMap<Sentiment, u64>,
}

/// Report-ready composition over query output. Read-only: building a
/// report persists nothing.
#[derive(Debug, Clone, Serialize)]
pub struct ReportBundle {
    pub report_metadata: ReportMetadata,
    pub executive_summary: ExecutiveSummary,
    pub stock_analysis: Vec<StockReportSection>,
    pub sector_analysis: Vec<SectorReportSection>,
    pub market_overview: MarketOverview,
    pub detailed_articles: Vec<ArticleEntry>,
    pub appendix: ReportAppendix,
}

/// Filter and lookup logic over the daily aggregate's indexes.
pub struct QueryEngine {
    store: Arc<AggregationStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<AggregationStore>) -> Self {
        Self { store }
    }

    /// Query a day's aggregate.
    ///
    /// With no active constraint this returns metadata and summary only (no
    /// article payload). Active filter categories are OR within a category
    /// and AND across categories.
    pub async fn query(&self, date: NaiveDate, filters: &QueryFilters) -> Result<DailyQueryResponse> {
        let aggregate = self.load_aggregate(date).await?;

        if !filters.has_constraints() {
            debug!("Summary-only query for {}", date);
            return Ok(DailyQueryResponse {
                date,
                metadata: aggregate.metadata,
                summary: aggregate.summary,
                query_summary: None,
                articles: Vec::new(),
            });
        }

        let matched = filter_positions(&aggregate, filters);
        let articles = collect_articles(&aggregate, &matched, filters.limit, filters.include_full_content);

        let query_summary = QuerySummary {
            total_articles_available: aggregate.articles.len(),
            articles_matched: matched.len(),
            articles_returned: articles.len(),
            query_timestamp: Utc::now(),
        };

        Ok(DailyQueryResponse {
            date,
            metadata: aggregate.metadata,
            summary: aggregate.summary,
            query_summary: Some(query_summary),
            articles,
        })
    }

    /// Entity-scoped analysis for a single ticker.
    pub async fn ticker_analysis(
        &self,
        date: NaiveDate,
        ticker: &str,
        include_full_content: bool,
    ) -> Result<TickerAnalysis> {
        let aggregate = self.load_aggregate(date).await?;
        let filters = QueryFilters {
            tickers: vec![ticker.to_string()],
            include_full_content,
            ..Default::default()
        };
        let matched = filter_positions(&aggregate, &filters);
        let articles = collect_articles(&aggregate, &matched, None, include_full_content);

        let mut sentiment_distribution = BTreeMap::new();
        let mut impact_type_distribution = BTreeMap::new();
        let mut price_impact_distribution = BTreeMap::new();
        let mut confidence_sum = 0.0;

        for entry in &articles {
            *sentiment_distribution
                .entry(entry.quick_access.overall_sentiment)
                .or_insert(0) += 1;
            confidence_sum += entry.quick_access.confidence_score;

            if let Some(stock) = entry
                .stocks
                .as_deref()
                .unwrap_or_default()
                .iter()
                .find(|s| s.ticker == ticker)
            {
                *impact_type_distribution
                    .entry(stock.impact_type.clone())
                    .or_insert(0) += 1;
                *price_impact_distribution
                    .entry(stock.price_impact.clone())
                    .or_insert(0) += 1;
            }
        }

        let avg_confidence = if articles.is_empty() {
            0.0
        } else {
            round3(confidence_sum / articles.len() as f64)
        };

        Ok(TickerAnalysis {
            date,
            ticker: ticker.to_string(),
            total_articles: articles.len(),
            sentiment_distribution,
            avg_confidence,
            impact_type_distribution,
            price_impact_distribution,
            articles,
        })
    }

    /// Entity-scoped analysis for a single sector.
    pub async fn sector_analysis(
        &self,
        date: NaiveDate,
        sector: &str,
        include_full_content: bool,
    ) -> Result<SectorAnalysis> {
        let aggregate = self.load_aggregate(date).await?;
        let filters = QueryFilters {
            sectors: vec![sector.to_string()],
            include_full_content,
            ..Default::default()
        };
        let matched = filter_positions(&aggregate, &filters);
        let articles = collect_articles(&aggregate, &matched, None, include_full_content);

        let mut sentiment_distribution = BTreeMap::new();
        let mut companies = BTreeSet::new();

        for entry in &articles {
            *sentiment_distribution
                .entry(entry.quick_access.overall_sentiment)
                .or_insert(0) += 1;
            for mention in entry.sectors.as_deref().unwrap_or_default() {
                if mention.sector_name == sector {
                    companies.extend(mention.affected_companies.iter().cloned());
                }
            }
        }

        Ok(SectorAnalysis {
            date,
            sector: sector.to_string(),
            total_articles: articles.len(),
            sentiment_distribution,
            affected_companies: companies.into_iter().collect(),
            articles,
        })
    }

    /// Build the report bundle for the date, optionally focused on specific
    /// tickers and/or sectors.
    pub async fn export_report(
        &self,
        date: NaiveDate,
        tickers: Option<Vec<String>>,
        sectors: Option<Vec<String>>,
    ) -> Result<ReportBundle> {
        let aggregate = self.load_aggregate(date).await?;
        let focus_tickers = tickers.unwrap_or_default();
        let focus_sectors = sectors.unwrap_or_default();

        let filters = QueryFilters {
            tickers: focus_tickers.clone(),
            sectors: focus_sectors.clone(),
            include_full_content: true,
            ..Default::default()
        };
        let matched = filter_positions(&aggregate, &filters);
        let articles = collect_articles(&aggregate, &matched, None, true);

        let executive_summary = build_executive_summary(&articles);
        let stock_analysis = build_stock_sections(&articles, &focus_tickers);
        let sector_analysis = build_sector_sections(&articles, &focus_sectors);
        let market_overview = build_market_overview(&articles);
        let appendix = build_appendix(&articles);

        Ok(ReportBundle {
            report_metadata: ReportMetadata {
                date,
                generated_at: Utc::now(),
                focus_tickers,
                focus_sectors,
                total_articles: articles.len(),
            },
            executive_summary,
            stock_analysis,
            sector_analysis,
            market_overview,
            detailed_articles: articles,
            appendix,
        })
    }

    /// All dates with persisted aggregate data, newest first.
    pub fn available_dates(&self) -> Result<Vec<AvailableDate>> {
        self.store.available_dates()
    }

    async fn load_aggregate(&self, date: NaiveDate) -> Result<DailyAggregate> {
        self.store
            .load(date)
            .await?
            .ok_or(AggregatorError::AggregateNotFound { date })
    }
}

/// Intersect the active filter categories over the index buckets. Within a
/// category the requested values are unioned; categories AND together.
fn filter_positions(aggregate: &DailyAggregate, filters: &QueryFilters) -> Vec<usize> {
    let mut candidates: BTreeSet<usize> = (0..aggregate.articles.len()).collect();

    if !filters.tickers.is_empty() {
        let mut bucket_union = BTreeSet::new();
        for ticker in &filters.tickers {
            if let Some(positions) = aggregate.indexes.by_ticker.get(ticker) {
                bucket_union.extend(positions.iter().copied());
            }
        }
        candidates = candidates.intersection(&bucket_union).copied().collect();
    }

    if !filters.sectors.is_empty() {
        let mut bucket_union = BTreeSet::new();
        for sector in &filters.sectors {
            if let Some(positions) = aggregate.indexes.by_sector.get(sector) {
                bucket_union.extend(positions.iter().copied());
            }
        }
        candidates = candidates.intersection(&bucket_union).copied().collect();
    }

    if !filters.sentiments.is_empty() {
        let mut bucket_union = BTreeSet::new();
        for sentiment in &filters.sentiments {
            if let Some(positions) = aggregate.indexes.by_sentiment.get(sentiment) {
                bucket_union.extend(positions.iter().copied());
            }
        }
        candidates = candidates.intersection(&bucket_union).copied().collect();
    }

    if filters.market_moving_only {
        let bucket: BTreeSet<usize> = aggregate
            .indexes
            .by_market_impact
            .get(MARKET_MOVING_BUCKET)
            .map(|positions| positions.iter().copied().collect())
            .unwrap_or_default();
        candidates = candidates.intersection(&bucket).copied().collect();
    }

    if let Some(min_confidence) = filters.min_confidence {
        candidates.retain(|&i| aggregate.articles[i].extraction_confidence >= min_confidence);
    }

    // BTreeSet iteration is already chronological (ascending position).
    candidates.into_iter().collect()
}

fn collect_articles(
    aggregate: &DailyAggregate,
    positions: &[usize],
    limit: Option<usize>,
    include_full_content: bool,
) -> Vec<ArticleEntry> {
    let take = limit.unwrap_or(positions.len());
    positions
        .iter()
        .take(take)
        .map(|&i| {
            let mut entry = aggregate.articles[i].clone();
            if !include_full_content {
                entry.content.full_text = truncate_preview(&entry.content.full_text, PREVIEW_CHARS);
            }
            entry
        })
        .collect()
}

fn sentiment_distribution(articles: &[ArticleEntry]) -> BTreeMap<Sentiment, u64> {
    let mut distribution = BTreeMap::new();
    for entry in articles {
        *distribution
            .entry(entry.quick_access.overall_sentiment)
            .or_insert(0) += 1;
    }
    distribution
}

fn dominant_sentiment(distribution: &BTreeMap<Sentiment, u64>) -> Sentiment {
    distribution
        .iter()
        .max_by_key(|(_, count)| **count)
        .map(|(sentiment, _)| *sentiment)
        .unwrap_or(Sentiment::Neutral)
}

fn build_executive_summary(articles: &[ArticleEntry]) -> ExecutiveSummary {
    let distribution = sentiment_distribution(articles);
    let market_moving = articles
        .iter()
        .filter(|a| a.quick_access.is_market_moving)
        .count() as u64;
    let with_numbers = articles
        .iter()
        .filter(|a| a.quick_access.has_financial_numbers)
        .count() as u64;
    let total = articles.len();
    let avg_confidence = if total == 0 {
        0.0
    } else {
        round3(
            articles
                .iter()
                .map(|a| a.quick_access.confidence_score)
                .sum::<f64>()
                / total as f64,
        )
    };
    let market_moving_ratio = if total == 0 {
        0.0
    } else {
        round2(market_moving as f64 / total as f64 * 100.0)
    };

    ExecutiveSummary {
        total_articles_analyzed: total,
        dominant_sentiment: dominant_sentiment(&distribution),
        sentiment_distribution: distribution,
        market_moving_articles: market_moving,
        market_moving_ratio,
        articles_with_financial_data: with_numbers,
        avg_confidence,
    }
}

fn build_stock_sections(
    articles: &[ArticleEntry],
    focus_tickers: &[String],
) -> Vec<StockReportSection> {
    let mut sections: BTreeMap<String, StockReportSection> = BTreeMap::new();

    for entry in articles {
        for stock in entry.stocks.as_deref().unwrap_or_default() {
            if stock.ticker.is_empty() {
                continue;
            }
            if !focus_tickers.is_empty() && !focus_tickers.contains(&stock.ticker) {
                continue;
            }

            let section = sections
                .entry(stock.ticker.clone())
                .or_insert_with(|| StockReportSection {
                    ticker: stock.ticker.clone(),
                    total_mentions: 0,
                    primary_sentiment: Sentiment::Neutral,
                    sentiment_distribution: BTreeMap::new(),
                    impact_type_distribution: BTreeMap::new(),
                    price_impact_distribution: BTreeMap::new(),
                    avg_confidence: 0.0,
                    articles: Vec::new(),
                });

            section.total_mentions += 1;
            *section.sentiment_distribution.entry(stock.sentiment).or_insert(0) += 1;
            *section
                .impact_type_distribution
                .entry(stock.impact_type.clone())
                .or_insert(0) += 1;
            *section
                .price_impact_distribution
                .entry(stock.price_impact.clone())
                .or_insert(0) += 1;
            // Accumulate; averaged below once all mentions are in.
            section.avg_confidence += stock.confidence;
            section.articles.push(StockArticleRef {
                title: entry.source.title.clone(),
                url: entry.source.url.clone(),
                pub_date: entry.source.pub_date.clone(),
                sentiment: stock.sentiment,
                impact_type: stock.impact_type.clone(),
                price_impact: stock.price_impact.clone(),
                confidence: stock.confidence,
            });
        }
    }

    sections
        .into_values()
        .map(|mut section| {
            if section.total_mentions > 0 {
                section.avg_confidence =
                    round3(section.avg_confidence / section.total_mentions as f64);
            }
            section.primary_sentiment = dominant_sentiment(&section.sentiment_distribution);
            section
        })
        .collect()
}

fn build_sector_sections(
    articles: &[ArticleEntry],
    focus_sectors: &[String],
) -> Vec<SectorReportSection> {
    struct SectorAccumulator {
        sentiment_distribution: BTreeMap<Sentiment, u64>,
        affected_companies: BTreeSet<String>,
        key_impacts: Vec<String>,
        articles: Vec<SectorArticleRef>,
    }

    let mut sections: BTreeMap<String, SectorAccumulator> = BTreeMap::new();

    for entry in articles {
        for mention in entry.sectors.as_deref().unwrap_or_default() {
            if mention.sector_name.is_empty() {
                continue;
            }
            if !focus_sectors.is_empty() && !focus_sectors.contains(&mention.sector_name) {
                continue;
            }

            let acc = sections
                .entry(mention.sector_name.clone())
                .or_insert_with(|| SectorAccumulator {
                    sentiment_distribution: BTreeMap::new(),
                    affected_companies: BTreeSet::new(),
                    key_impacts: Vec::new(),
                    articles: Vec::new(),
                });

            *acc.sentiment_distribution.entry(mention.sentiment).or_insert(0) += 1;
            acc.affected_companies
                .extend(mention.affected_companies.iter().cloned());
            if !mention.impact_description.is_empty() && acc.key_impacts.len() < 3 {
                acc.key_impacts.push(mention.impact_description.clone());
            }
            acc.articles.push(SectorArticleRef {
                title: entry.source.title.clone(),
                url: entry.source.url.clone(),
                sentiment: mention.sentiment,
                impact_description: mention.impact_description.clone(),
            });
        }
    }

    sections
        .into_iter()
        .map(|(sector, acc)| SectorReportSection {
            sector,
            total_articles: acc.articles.len(),
            primary_sentiment: dominant_sentiment(&acc.sentiment_distribution),
            sentiment_distribution: acc.sentiment_distribution,
            affected_companies: acc.affected_companies.into_iter().collect(),
            key_impacts: acc.key_impacts,
            articles: acc.articles,
        })
        .collect()
}

fn build_market_overview(articles: &[ArticleEntry]) -> MarketOverview {
    let market_moving = articles
        .iter()
        .filter(|a| a.quick_access.is_market_moving)
        .count();

    let mut scope_distribution = BTreeMap::new();
    let mut exchange_distribution = BTreeMap::new();
    for entry in articles {
        if let Some(market) = &entry.market {
            if !market.scope.is_empty() {
                *scope_distribution.entry(market.scope.clone()).or_insert(0) += 1;
            }
            if !market.exchange.is_empty() {
                *exchange_distribution
                    .entry(market.exchange.clone())
                    .or_insert(0) += 1;
            }
        }
    }

    let market_moving_percentage = if articles.is_empty() {
        0.0
    } else {
        round2(market_moving as f64 / articles.len() as f64 * 100.0)
    };

    MarketOverview {
        market_moving_articles: market_moving,
        market_moving_percentage,
        scope_distribution,
        exchange_distribution,
    }
}

fn build_appendix(articles: &[ArticleEntry]) -> ReportAppendix {
    let mut tickers = BTreeSet::new();
    let mut sectors = BTreeSet::new();
    for entry in articles {
        tickers.extend(entry.quick_access.tickers.iter().cloned());
        sectors.extend(entry.quick_access.sectors.iter().cloned());
    }
    ReportAppendix {
        all_tickers_mentioned: tickers.into_iter().collect(),
        all_sectors_mentioned: sectors.into_iter().collect(),
        sentiment_distribution: sentiment_distribution(articles),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
