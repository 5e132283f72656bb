use chrono::{NaiveDate, TimeZone, Utc};
use finnews_aggregator::{
    AggregationStore, ExtractionResult, FinancialData, FinancialFigure, MarketInfo, QueryEngine,
    QueryFilters, SectorMention, Sentiment, SentimentAnalysis, SourceArticle, StockMention,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

fn temp_data_dir() -> PathBuf {
    std::env::temp_dir().join(format!("finnews-aggregate-test-{}", Uuid::new_v4()))
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

fn fixture(
    guid: &str,
    tickers: &[&str],
    sectors: &[&str],
    sentiment: Sentiment,
    confidence: f64,
) -> (ExtractionResult, SourceArticle) {
    let article = SourceArticle {
        title: format!("Article {}", guid),
        category: "markets".to_string(),
        description: format!("Description for {}", guid),
        full_text: format!(
            "Full text for {}. {}",
            guid,
            "Market commentary continues at length. ".repeat(30)
        ),
        url: format!("https://news.example.com/{}", guid),
        guid: guid.to_string(),
        pub_date: "2024-01-01T08:00:00Z".to_string(),
    };

    let result = ExtractionResult {
        article_guid: guid.to_string(),
        article_title: article.title.clone(),
        article_category: article.category.clone(),
        extraction_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
        extraction_model: "test-model".to_string(),
        extraction_confidence: confidence,
        sentiment: Some(SentimentAnalysis {
            overall_sentiment: sentiment,
            sentiment_score: match sentiment {
                Sentiment::Positive => 0.7,
                Sentiment::Negative => -0.7,
                Sentiment::Neutral => 0.0,
            },
            key_factors: vec!["earnings".to_string()],
        }),
        stocks: Some(
            tickers
                .iter()
                .map(|ticker| StockMention {
                    ticker: ticker.to_string(),
                    company_name: None,
                    sentiment,
                    impact_type: "financial".to_string(),
                    price_impact: "up".to_string(),
                    confidence: 0.85,
                })
                .collect(),
        ),
        sectors: Some(
            sectors
                .iter()
                .map(|sector| SectorMention {
                    sector_name: sector.to_string(),
                    sentiment,
                    impact_description: format!("{} outlook", sector),
                    affected_companies: tickers.iter().map(|t| t.to_string()).collect(),
                })
                .collect(),
        ),
        market: Some(MarketInfo {
            scope: "sector".to_string(),
            exchange: "HOSE".to_string(),
            market_moving: false,
            impact_magnitude: None,
            key_indices: Vec::new(),
        }),
        financial: Some(FinancialData {
            has_numbers: true,
            revenues: Vec::new(),
            profits: Vec::new(),
            percentages: vec![FinancialFigure {
                value: "12%".to_string(),
                context: None,
            }],
            amounts: Vec::new(),
        }),
    };

    (result, article)
}

#[tokio::test]
async fn three_appends_build_consistent_indexes_and_summary() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    let store = AggregationStore::new(temp_data_dir()).unwrap();

    let (r1, a1) = fixture("a1", &["VCB"], &["Banking"], Sentiment::Positive, 0.9);
    let (r2, a2) = fixture("a2", &["VCB", "FPT"], &["Banking"], Sentiment::Negative, 0.8);
    let (r3, a3) = fixture("a3", &["FPT"], &["Technology"], Sentiment::Neutral, 0.7);

    store.append(day(), &r1, &a1).await.unwrap();
    store.append(day(), &r2, &a2).await.unwrap();
    let receipt = store.append(day(), &r3, &a3).await.unwrap();
    assert_eq!(receipt.index, 2);
    assert_eq!(receipt.total_articles, 3);

    let aggregate = store.load(day()).await.unwrap().unwrap();
    info!("Aggregate has {} articles", aggregate.articles.len());

    assert_eq!(aggregate.metadata.total_articles, 3);
    assert_eq!(aggregate.metadata.successful_extractions, 3);

    let positive = &aggregate.summary.sentiment_overview[&Sentiment::Positive];
    assert_eq!(positive.count, 1);
    assert_eq!(positive.percentage, 33.33);

    assert_eq!(aggregate.indexes.by_ticker["VCB"], vec![0, 1]);
    assert_eq!(aggregate.indexes.by_ticker["FPT"], vec![1, 2]);
    assert_eq!(aggregate.indexes.by_time, vec![0, 1, 2]);

    let top: Vec<(&str, u64)> = aggregate
        .summary
        .top_stocks
        .iter()
        .map(|t| (t.ticker.as_str(), t.mention_count))
        .collect();
    assert!(top.contains(&("VCB", 2)));
    assert!(top.contains(&("FPT", 2)));

    // Sum of sentiment counts equals the article total.
    let sentiment_total: u64 = aggregate
        .summary
        .sentiment_overview
        .values()
        .map(|bucket| bucket.count)
        .sum();
    assert_eq!(sentiment_total, aggregate.metadata.total_articles);

    // Every ticker index position points at an entry carrying that ticker.
    for (ticker, positions) in &aggregate.indexes.by_ticker {
        for &i in positions {
            assert!(i < aggregate.articles.len());
            assert!(aggregate.articles[i].quick_access.tickers.contains(ticker));
        }
    }

    // The lookup table resolves every guid to its own entry.
    for (guid, &index) in &aggregate.lookup_table {
        assert_eq!(&aggregate.articles[index].guid, guid);
    }
}

#[tokio::test]
async fn sentiment_invariant_holds_across_many_appends() {
    let store = AggregationStore::new(temp_data_dir()).unwrap();
    let labels = [
        Sentiment::Positive,
        Sentiment::Negative,
        Sentiment::Neutral,
        Sentiment::Positive,
        Sentiment::Positive,
        Sentiment::Negative,
        Sentiment::Neutral,
    ];

    for (i, label) in labels.iter().enumerate() {
        let (result, article) = fixture(&format!("g{}", i), &["VCB"], &["Banking"], *label, 0.9);
        store.append(day(), &result, &article).await.unwrap();

        let aggregate = store.load(day()).await.unwrap().unwrap();
        let sentiment_total: u64 = aggregate
            .summary
            .sentiment_overview
            .values()
            .map(|bucket| bucket.count)
            .sum();
        assert_eq!(sentiment_total, aggregate.metadata.total_articles);
    }
}

#[tokio::test]
async fn duplicate_guid_append_is_rejected() {
    let store = AggregationStore::new(temp_data_dir()).unwrap();
    let (result, article) = fixture("dup", &["VCB"], &["Banking"], Sentiment::Positive, 0.9);

    store.append(day(), &result, &article).await.unwrap();
    let second = store.append(day(), &result, &article).await;
    assert!(second.is_err());

    // The rejected append left nothing behind.
    let aggregate = store.load(day()).await.unwrap().unwrap();
    assert_eq!(aggregate.metadata.total_articles, 1);
    assert_eq!(aggregate.indexes.by_ticker["VCB"], vec![0]);
}

#[tokio::test]
async fn low_confidence_appends_count_as_failed_extractions() {
    let store = AggregationStore::new(temp_data_dir()).unwrap();
    let (high, a1) = fixture("hi", &["VCB"], &["Banking"], Sentiment::Positive, 0.9);
    let (low, a2) = fixture("lo", &["FPT"], &["Technology"], Sentiment::Neutral, 0.3);

    store.append(day(), &high, &a1).await.unwrap();
    store.append(day(), &low, &a2).await.unwrap();

    let aggregate = store.load(day()).await.unwrap().unwrap();
    assert_eq!(aggregate.metadata.total_articles, 2);
    assert_eq!(aggregate.metadata.successful_extractions, 1);
    assert_eq!(aggregate.metadata.failed_extractions, 1);
}

#[tokio::test]
async fn no_filter_query_returns_summary_only() {
    let store = Arc::new(AggregationStore::new(temp_data_dir()).unwrap());
    let (result, article) = fixture("a1", &["VCB"], &["Banking"], Sentiment::Positive, 0.9);
    store.append(day(), &result, &article).await.unwrap();

    let engine = QueryEngine::new(store);
    let response = engine.query(day(), &QueryFilters::default()).await.unwrap();

    assert!(response.articles.is_empty());
    assert!(response.query_summary.is_none());
    assert_eq!(response.metadata.total_articles, 1);
    assert_eq!(response.summary.sentiment_overview[&Sentiment::Positive].count, 1);
}

#[tokio::test]
async fn ticker_and_sector_filters_intersect() {
    let store = Arc::new(AggregationStore::new(temp_data_dir()).unwrap());

    // a1 mentions VCB without the Banking sector; a2 has both.
    let (r1, a1) = fixture("a1", &["VCB"], &["Insurance"], Sentiment::Positive, 0.9);
    let (r2, a2) = fixture("a2", &["VCB"], &["Banking"], Sentiment::Negative, 0.9);
    store.append(day(), &r1, &a1).await.unwrap();
    store.append(day(), &r2, &a2).await.unwrap();

    let engine = QueryEngine::new(store);
    let response = engine
        .query(
            day(),
            &QueryFilters {
                tickers: vec!["VCB".to_string()],
                sectors: vec!["Banking".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(response.articles.len(), 1);
    assert_eq!(response.articles[0].guid, "a2");

    let summary = response.query_summary.unwrap();
    assert_eq!(summary.total_articles_available, 2);
    assert_eq!(summary.articles_matched, 1);
}

#[tokio::test]
async fn intersection_matches_manual_bucket_intersection() {
    let store = Arc::new(AggregationStore::new(temp_data_dir()).unwrap());

    let specs: [(&str, &[&str], &[&str]); 5] = [
        ("x1", &["VCB"], &["Banking"]),
        ("x2", &["VCB", "FPT"], &["Banking", "Technology"]),
        ("x3", &["FPT"], &["Technology"]),
        ("x4", &["VCB"], &["Banking"]),
        ("x5", &["HPG"], &["Materials"]),
    ];
    for (guid, tickers, sectors) in specs {
        let (result, article) = fixture(guid, tickers, sectors, Sentiment::Neutral, 0.9);
        store.append(day(), &result, &article).await.unwrap();
    }

    let aggregate = store.load(day()).await.unwrap().unwrap();
    let expected: Vec<usize> = aggregate.indexes.by_ticker["VCB"]
        .iter()
        .copied()
        .filter(|i| aggregate.indexes.by_sector["Banking"].contains(i))
        .collect();

    let engine = QueryEngine::new(store);
    let response = engine
        .query(
            day(),
            &QueryFilters {
                tickers: vec!["VCB".to_string()],
                sectors: vec!["Banking".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let matched: Vec<usize> = response.articles.iter().map(|a| a.index).collect();
    assert_eq!(matched, expected);
}

#[tokio::test]
async fn min_confidence_and_limit_apply_after_index_filters() {
    let store = Arc::new(AggregationStore::new(temp_data_dir()).unwrap());

    for (guid, confidence) in [("c1", 0.95), ("c2", 0.55), ("c3", 0.9), ("c4", 0.85)] {
        let (result, article) = fixture(guid, &["VCB"], &["Banking"], Sentiment::Positive, confidence);
        store.append(day(), &result, &article).await.unwrap();
    }

    let engine = QueryEngine::new(store);
    let response = engine
        .query(
            day(),
            &QueryFilters {
                tickers: vec!["VCB".to_string()],
                min_confidence: Some(0.8),
                limit: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // c2 is filtered out; the limit keeps the two earliest matches.
    let guids: Vec<&str> = response.articles.iter().map(|a| a.guid.as_str()).collect();
    assert_eq!(guids, vec!["c1", "c3"]);
    assert_eq!(response.query_summary.unwrap().articles_matched, 3);
}

#[tokio::test]
async fn article_text_is_truncated_unless_full_content_requested() {
    let store = Arc::new(AggregationStore::new(temp_data_dir()).unwrap());
    let (result, article) = fixture("long", &["VCB"], &["Banking"], Sentiment::Positive, 0.9);
    let original_len = article.full_text.chars().count();
    assert!(original_len > 500);
    store.append(day(), &result, &article).await.unwrap();

    let engine = QueryEngine::new(store);

    let preview = engine
        .query(
            day(),
            &QueryFilters {
                tickers: vec!["VCB".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let preview_text = &preview.articles[0].content.full_text;
    assert!(preview_text.ends_with("..."));
    assert!(preview_text.chars().count() <= 503);

    let full = engine
        .query(
            day(),
            &QueryFilters {
                tickers: vec!["VCB".to_string()],
                include_full_content: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(full.articles[0].content.full_text.chars().count(), original_len);
}

#[tokio::test]
async fn ticker_analysis_summarizes_matched_articles() {
    let store = Arc::new(AggregationStore::new(temp_data_dir()).unwrap());

    let (r1, a1) = fixture("t1", &["VCB"], &["Banking"], Sentiment::Positive, 0.9);
    let (r2, a2) = fixture("t2", &["VCB"], &["Banking"], Sentiment::Positive, 0.7);
    let (r3, a3) = fixture("t3", &["FPT"], &["Technology"], Sentiment::Negative, 0.8);
    store.append(day(), &r1, &a1).await.unwrap();
    store.append(day(), &r2, &a2).await.unwrap();
    store.append(day(), &r3, &a3).await.unwrap();

    let engine = QueryEngine::new(store);
    let analysis = engine.ticker_analysis(day(), "VCB", false).await.unwrap();

    assert_eq!(analysis.total_articles, 2);
    assert_eq!(analysis.sentiment_distribution[&Sentiment::Positive], 2);
    assert_eq!(analysis.avg_confidence, 0.8);
    assert_eq!(analysis.impact_type_distribution["financial"], 2);
}

#[tokio::test]
async fn sector_analysis_unions_affected_companies() {
    let store = Arc::new(AggregationStore::new(temp_data_dir()).unwrap());

    let (r1, a1) = fixture("s1", &["VCB"], &["Banking"], Sentiment::Positive, 0.9);
    let (r2, a2) = fixture("s2", &["BID", "CTG"], &["Banking"], Sentiment::Neutral, 0.8);
    store.append(day(), &r1, &a1).await.unwrap();
    store.append(day(), &r2, &a2).await.unwrap();

    let engine = QueryEngine::new(store);
    let analysis = engine.sector_analysis(day(), "Banking", false).await.unwrap();

    assert_eq!(analysis.total_articles, 2);
    assert_eq!(
        analysis.affected_companies,
        vec!["BID".to_string(), "CTG".to_string(), "VCB".to_string()]
    );
}

#[tokio::test]
async fn report_bundle_composes_query_output() {
    let store = Arc::new(AggregationStore::new(temp_data_dir()).unwrap());

    let (mut r1, a1) = fixture("rep1", &["VCB"], &["Banking"], Sentiment::Positive, 0.9);
    r1.market.as_mut().unwrap().market_moving = true;
    let (r2, a2) = fixture("rep2", &["FPT"], &["Technology"], Sentiment::Positive, 0.8);
    store.append(day(), &r1, &a1).await.unwrap();
    store.append(day(), &r2, &a2).await.unwrap();

    let engine = QueryEngine::new(store);
    let report = engine.export_report(day(), None, None).await.unwrap();

    assert_eq!(report.report_metadata.total_articles, 2);
    assert_eq!(report.executive_summary.dominant_sentiment, Sentiment::Positive);
    assert_eq!(report.executive_summary.market_moving_articles, 1);
    assert_eq!(report.executive_summary.market_moving_ratio, 50.0);
    assert_eq!(report.stock_analysis.len(), 2);
    assert_eq!(report.sector_analysis.len(), 2);
    assert_eq!(report.detailed_articles.len(), 2);
    assert_eq!(
        report.appendix.all_tickers_mentioned,
        vec!["FPT".to_string(), "VCB".to_string()]
    );

    // Focused report only keeps the requested ticker sections.
    let focused = engine
        .export_report(day(), Some(vec!["VCB".to_string()]), None)
        .await
        .unwrap();
    assert_eq!(focused.stock_analysis.len(), 1);
    assert_eq!(focused.stock_analysis[0].ticker, "VCB");
    assert_eq!(focused.detailed_articles.len(), 1);
}

#[tokio::test]
async fn available_dates_lists_persisted_days_newest_first() {
    let store = Arc::new(AggregationStore::new(temp_data_dir()).unwrap());

    let jan = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let feb = NaiveDate::from_ymd_opt(2024, 2, 15).unwrap();
    let (r1, a1) = fixture("d1", &["VCB"], &["Banking"], Sentiment::Positive, 0.9);
    let (r2, a2) = fixture("d2", &["FPT"], &["Technology"], Sentiment::Neutral, 0.9);
    store.append(jan, &r1, &a1).await.unwrap();
    store.append(feb, &r2, &a2).await.unwrap();

    let dates = store.available_dates().unwrap();
    assert_eq!(dates.len(), 2);
    assert_eq!(dates[0].date, feb);
    assert_eq!(dates[1].date, jan);
    assert!(dates[0].file_size_bytes > 0);

    let engine = QueryEngine::new(Arc::clone(&store));
    let missing = engine
        .query(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            &QueryFilters::default(),
        )
        .await;
    assert!(missing.is_err());
}
