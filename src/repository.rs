use crate::completeness::{CompletenessRecord, ComponentStore, ExtractionContext};
use crate::types::{
    Component, CompletionStatus, FinancialData, MarketInfo, Result, SectorMention, Sentiment,
    SentimentAnalysis, StockMention,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Pool, Postgres, Row};
use std::collections::HashSet;
use tracing::{debug, info};

/// Postgres-backed component store: one master table plus five component
/// tables, every write an upsert so extraction replays are safe.
pub struct PgComponentStore {
    db: Pool<Postgres>,
}

impl PgComponentStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let db = PgPool::connect(database_url).await?;
        let store = Self { db };
        store.ensure_schema().await?;
        info!("Postgres component store connected");
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.db
    }

    async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS extraction_master (
                article_guid TEXT PRIMARY KEY,
                target_date DATE NOT NULL,
                completion_status TEXT NOT NULL,
                components_saved JSONB NOT NULL DEFAULT '[]',
                overall_sentiment TEXT,
                tickers_mentioned JSONB NOT NULL DEFAULT '[]',
                sectors_affected JSONB NOT NULL DEFAULT '[]',
                market_moving BOOLEAN NOT NULL DEFAULT FALSE,
                has_financial_data BOOLEAN NOT NULL DEFAULT FALSE,
                confidence DOUBLE PRECISION NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_master_target_date ON extraction_master (target_date)",
            r#"
            CREATE TABLE IF NOT EXISTS extraction_sentiment (
                article_guid TEXT PRIMARY KEY,
                target_date DATE NOT NULL,
                overall_sentiment TEXT NOT NULL,
                sentiment_score DOUBLE PRECISION NOT NULL,
                key_factors JSONB NOT NULL DEFAULT '[]',
                extraction_timestamp TIMESTAMPTZ NOT NULL,
                extraction_model TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sentiment_target_date ON extraction_sentiment (target_date)",
            r#"
            CREATE TABLE IF NOT EXISTS extraction_stocks (
                article_guid TEXT NOT NULL,
                ticker TEXT NOT NULL,
                target_date DATE NOT NULL,
                company_name TEXT,
                sentiment TEXT NOT NULL,
                impact_type TEXT NOT NULL,
                price_impact TEXT NOT NULL,
                confidence DOUBLE PRECISION NOT NULL,
                extraction_timestamp TIMESTAMPTZ NOT NULL,
                extraction_model TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (article_guid, ticker)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_stocks_target_date ON extraction_stocks (target_date)",
            "CREATE INDEX IF NOT EXISTS idx_stocks_ticker ON extraction_stocks (ticker)",
            r#"
            CREATE TABLE IF NOT EXISTS extraction_sectors (
                article_guid TEXT NOT NULL,
                sector_name TEXT NOT NULL,
                target_date DATE NOT NULL,
                sentiment TEXT NOT NULL,
                impact_description TEXT NOT NULL,
                affected_companies JSONB NOT NULL DEFAULT '[]',
                extraction_timestamp TIMESTAMPTZ NOT NULL,
                extraction_model TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (article_guid, sector_name)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sectors_target_date ON extraction_sectors (target_date)",
            r#"
            CREATE TABLE IF NOT EXISTS extraction_market (
                article_guid TEXT PRIMARY KEY,
                target_date DATE NOT NULL,
                scope TEXT NOT NULL,
                exchange TEXT NOT NULL,
                market_moving BOOLEAN NOT NULL,
                impact_magnitude TEXT,
                key_indices JSONB NOT NULL DEFAULT '[]',
                extraction_timestamp TIMESTAMPTZ NOT NULL,
                extraction_model TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_market_target_date ON extraction_market (target_date)",
            r#"
            CREATE TABLE IF NOT EXISTS extraction_financial (
                article_guid TEXT PRIMARY KEY,
                target_date DATE NOT NULL,
                has_numbers BOOLEAN NOT NULL,
                revenues JSONB NOT NULL DEFAULT '[]',
                profits JSONB NOT NULL DEFAULT '[]',
                percentages JSONB NOT NULL DEFAULT '[]',
                amounts JSONB NOT NULL DEFAULT '[]',
                extraction_timestamp TIMESTAMPTZ NOT NULL,
                extraction_model TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_financial_target_date ON extraction_financial (target_date)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.db).await?;
        }
        debug!("Component store schema ensured");
        Ok(())
    }

    async fn guids_for(&self, table: &str, date: NaiveDate) -> Result<HashSet<String>> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT article_guid FROM {} WHERE target_date = $1",
            table
        ))
        .bind(date)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("article_guid").ok())
            .collect())
    }
}

fn sentiment_from_str(value: &str) -> Sentiment {
    match value {
        "positive" => Sentiment::Positive,
        "negative" => Sentiment::Negative,
        _ => Sentiment::Neutral,
    }
}

fn status_to_str(status: CompletionStatus) -> &'static str {
    match status {
        CompletionStatus::InProgress => "in_progress",
        CompletionStatus::Partial => "partial",
        CompletionStatus::Completed => "completed",
    }
}

fn status_from_str(value: &str) -> CompletionStatus {
    match value {
        "completed" => CompletionStatus::Completed,
        "partial" => CompletionStatus::Partial,
        _ => CompletionStatus::InProgress,
    }
}

#[async_trait]
impl ComponentStore for PgComponentStore {
    async fn upsert_master(&self, record: &CompletenessRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO extraction_master
                (article_guid, target_date, completion_status, components_saved,
                 overall_sentiment, tickers_mentioned, sectors_affected,
                 market_moving, has_financial_data, confidence, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (article_guid) DO UPDATE SET
                target_date = EXCLUDED.target_date,
                completion_status = EXCLUDED.completion_status,
                components_saved = EXCLUDED.components_saved,
                overall_sentiment = EXCLUDED.overall_sentiment,
                tickers_mentioned = EXCLUDED.tickers_mentioned,
                sectors_affected = EXCLUDED.sectors_affected,
                market_moving = EXCLUDED.market_moving,
                has_financial_data = EXCLUDED.has_financial_data,
                confidence = EXCLUDED.confidence,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.article_guid)
        .bind(record.target_date)
        .bind(status_to_str(record.completion_status))
        .bind(serde_json::to_value(&record.components_saved).unwrap_or_default())
        .bind(record.overall_sentiment.map(|s| s.as_str()))
        .bind(serde_json::to_value(&record.tickers_mentioned).unwrap_or_default())
        .bind(serde_json::to_value(&record.sectors_affected).unwrap_or_default())
        .bind(record.market_moving)
        .bind(record.has_financial_data)
        .bind(record.confidence)
        .bind(record.updated_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn get_master(&self, guid: &str) -> Result<Option<CompletenessRecord>> {
        let row = sqlx::query("SELECT * FROM extraction_master WHERE article_guid = $1")
            .bind(guid)
            .fetch_optional(&self.db)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let components_json: serde_json::Value = row.try_get("components_saved")?;
        let components_saved: Vec<Component> =
            serde_json::from_value(components_json).unwrap_or_default();
        let tickers_json: serde_json::Value = row.try_get("tickers_mentioned")?;
        let sectors_json: serde_json::Value = row.try_get("sectors_affected")?;

        Ok(Some(CompletenessRecord {
            article_guid: row.try_get("article_guid")?,
            target_date: row.try_get("target_date")?,
            completion_status: status_from_str(row.try_get::<String, _>("completion_status")?.as_str()),
            components_saved,
            overall_sentiment: row
                .try_get::<Option<String>, _>("overall_sentiment")?
                .map(|s| sentiment_from_str(&s)),
            tickers_mentioned: serde_json::from_value(tickers_json).unwrap_or_default(),
            sectors_affected: serde_json::from_value(sectors_json).unwrap_or_default(),
            market_moving: row.try_get("market_moving")?,
            has_financial_data: row.try_get("has_financial_data")?,
            confidence: row.try_get("confidence")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        }))
    }

    async fn master_guids_for(&self, date: NaiveDate) -> Result<HashSet<String>> {
        self.guids_for("extraction_master", date).await
    }

    async fn component_guids_for(&self, date: NaiveDate) -> Result<HashSet<String>> {
        let mut guids = HashSet::new();
        for table in [
            "extraction_sentiment",
            "extraction_stocks",
            "extraction_sectors",
            "extraction_market",
            "extraction_financial",
        ] {
            guids.extend(self.guids_for(table, date).await?);
        }
        Ok(guids)
    }

    async fn save_sentiment(
        &self,
        guid: &str,
        payload: &SentimentAnalysis,
        ctx: &ExtractionContext,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO extraction_sentiment
                (article_guid, target_date, overall_sentiment, sentiment_score,
                 key_factors, extraction_timestamp, extraction_model, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (article_guid) DO UPDATE SET
                target_date = EXCLUDED.target_date,
                overall_sentiment = EXCLUDED.overall_sentiment,
                sentiment_score = EXCLUDED.sentiment_score,
                key_factors = EXCLUDED.key_factors,
                extraction_timestamp = EXCLUDED.extraction_timestamp,
                extraction_model = EXCLUDED.extraction_model
            "#,
        )
        .bind(guid)
        .bind(ctx.target_date)
        .bind(payload.overall_sentiment.as_str())
        .bind(payload.sentiment_score)
        .bind(serde_json::to_value(&payload.key_factors).unwrap_or_default())
        .bind(ctx.extraction_timestamp)
        .bind(&ctx.extraction_model)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn save_stocks(
        &self,
        guid: &str,
        payload: &[StockMention],
        ctx: &ExtractionContext,
    ) -> Result<()> {
        for stock in payload {
            sqlx::query(
                r#"
                INSERT INTO extraction_stocks
                    (article_guid, ticker, target_date, company_name, sentiment,
                     impact_type, price_impact, confidence, extraction_timestamp,
                     extraction_model, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (article_guid, ticker) DO UPDATE SET
                    target_date = EXCLUDED.target_date,
                    company_name = EXCLUDED.company_name,
                    sentiment = EXCLUDED.sentiment,
                    impact_type = EXCLUDED.impact_type,
                    price_impact = EXCLUDED.price_impact,
                    confidence = EXCLUDED.confidence,
                    extraction_timestamp = EXCLUDED.extraction_timestamp,
                    extraction_model = EXCLUDED.extraction_model
                "#,
            )
            .bind(guid)
            .bind(&stock.ticker)
            .bind(ctx.target_date)
            .bind(&stock.company_name)
            .bind(stock.sentiment.as_str())
            .bind(&stock.impact_type)
            .bind(&stock.price_impact)
            .bind(stock.confidence)
            .bind(ctx.extraction_timestamp)
            .bind(&ctx.extraction_model)
            .bind(Utc::now())
            .execute(&self.db)
            .await?;
        }

        Ok(())
    }

    async fn save_sectors(
        &self,
        guid: &str,
        payload: &[SectorMention],
        ctx: &ExtractionContext,
    ) -> Result<()> {
        for sector in payload {
            sqlx::query(
                r#"
                INSERT INTO extraction_sectors
                    (article_guid, sector_name, target_date, sentiment,
                     impact_description, affected_companies, extraction_timestamp,
                     extraction_model, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (article_guid, sector_name) DO UPDATE SET
                    target_date = EXCLUDED.target_date,
                    sentiment = EXCLUDED.sentiment,
                    impact_description = EXCLUDED.impact_description,
                    affected_companies = EXCLUDED.affected_companies,
                    extraction_timestamp = EXCLUDED.extraction_timestamp,
                    extraction_model = EXCLUDED.extraction_model
                "#,
            )
            .bind(guid)
            .bind(&sector.sector_name)
            .bind(ctx.target_date)
            .bind(sector.sentiment.as_str())
            .bind(&sector.impact_description)
            .bind(serde_json::to_value(&sector.affected_companies).unwrap_or_default())
            .bind(ctx.extraction_timestamp)
            .bind(&ctx.extraction_model)
            .bind(Utc::now())
            .execute(&self.db)
            .await?;
        }

        Ok(())
    }

    async fn save_market(
        &self,
        guid: &str,
        payload: &MarketInfo,
        ctx: &ExtractionContext,
    ) -> Result<()> {
        let magnitude = payload.impact_magnitude.map(|m| {
            serde_json::to_value(m)
                .ok()
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_default()
        });

        sqlx::query(
            r#"
            INSERT INTO extraction_market
                (article_guid, target_date, scope, exchange, market_moving,
                 impact_magnitude, key_indices, extraction_timestamp,
                 extraction_model, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (article_guid) DO UPDATE SET
                target_date = EXCLUDED.target_date,
                scope = EXCLUDED.scope,
                exchange = EXCLUDED.exchange,
                market_moving = EXCLUDED.market_moving,
                impact_magnitude = EXCLUDED.impact_magnitude,
                key_indices = EXCLUDED.key_indices,
                extraction_timestamp = EXCLUDED.extraction_timestamp,
                extraction_model = EXCLUDED.extraction_model
            "#,
        )
        .bind(guid)
        .bind(ctx.target_date)
        .bind(&payload.scope)
        .bind(&payload.exchange)
        .bind(payload.market_moving)
        .bind(magnitude)
        .bind(serde_json::to_value(&payload.key_indices).unwrap_or_default())
        .bind(ctx.extraction_timestamp)
        .bind(&ctx.extraction_model)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn save_financial(
        &self,
        guid: &str,
        payload: &FinancialData,
        ctx: &ExtractionContext,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO extraction_financial
                (article_guid, target_date, has_numbers, revenues, profits,
                 percentages, amounts, extraction_timestamp, extraction_model,
                 created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (article_guid) DO UPDATE SET
                target_date = EXCLUDED.target_date,
                has_numbers = EXCLUDED.has_numbers,
                revenues = EXCLUDED.revenues,
                profits = EXCLUDED.profits,
                percentages = EXCLUDED.percentages,
                amounts = EXCLUDED.amounts,
                extraction_timestamp = EXCLUDED.extraction_timestamp,
                extraction_model = EXCLUDED.extraction_model
            "#,
        )
        .bind(guid)
        .bind(ctx.target_date)
        .bind(payload.has_numbers)
        .bind(serde_json::to_value(&payload.revenues).unwrap_or_default())
        .bind(serde_json::to_value(&payload.profits).unwrap_or_default())
        .bind(serde_json::to_value(&payload.percentages).unwrap_or_default())
        .bind(serde_json::to_value(&payload.amounts).unwrap_or_default())
        .bind(ctx.extraction_timestamp)
        .bind(&ctx.extraction_model)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        Ok(())
    }
}
