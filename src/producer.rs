use crate::scoring::ConfidenceScorer;
use crate::types::{
    AggregatorError, ExtractionResult, FinancialData, FinancialFigure, MarketInfo, Result,
    SectorMention, Sentiment, SentimentAnalysis, SourceArticle, StockMention,
};
use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Results for batch extraction of multiple articles.
#[derive(Debug, Clone, Serialize)]
pub struct BatchExtraction {
    pub total_articles: usize,
    pub successful_extractions: usize,
    pub failed_extractions: usize,
    pub extraction_time_seconds: f64,
    pub results: Vec<ExtractionResult>,
    pub errors: Vec<String>,
}

impl BatchExtraction {
    pub fn success_rate(&self) -> f64 {
        if self.total_articles == 0 {
            return 0.0;
        }
        self.successful_extractions as f64 / self.total_articles as f64 * 100.0
    }
}

/// Trait for producers that turn an article into a structured extraction
/// result (an LLM call in production, a heuristic stand-in in tests).
#[async_trait]
pub trait ExtractionProducer: Send + Sync {
    /// Get the name of this producer.
    fn producer_name(&self) -> String;

    /// The model identifier stamped onto extraction results.
    fn model_name(&self) -> String;

    /// Extract structured information from a single article.
    async fn extract(&self, article: &SourceArticle) -> Result<ExtractionResult>;

    /// Extract a batch of articles, isolating per-article failures into the
    /// batch result. An `Err` from this method means the whole batch failed.
    async fn extract_batch(
        &self,
        articles: &[SourceArticle],
        article_delay: Duration,
    ) -> Result<BatchExtraction> {
        serial_extract(self, articles, article_delay).await
    }
}

/// Run articles through `extract` one at a time with an inter-article delay,
/// folding per-article failures into the batch result.
pub async fn serial_extract<P: ExtractionProducer + ?Sized>(
    producer: &P,
    articles: &[SourceArticle],
    article_delay: Duration,
) -> Result<BatchExtraction> {
    let started = Instant::now();
    let mut results = Vec::new();
    let mut errors = Vec::new();

    for (i, article) in articles.iter().enumerate() {
        if i > 0 && !article_delay.is_zero() {
            tokio::time::sleep(article_delay).await;
        }
        match producer.extract(article).await {
            Ok(result) => {
                debug!("Extracted article {} ({})", article.guid, article.title);
                results.push(result);
            }
            Err(e) => {
                warn!("Extraction failed for article {}: {}", article.guid, e);
                errors.push(format!("Article {}: {}", article.guid, e));
            }
        }
    }

    Ok(BatchExtraction {
        total_articles: articles.len(),
        successful_extractions: results.len(),
        failed_extractions: articles.len() - results.len(),
        extraction_time_seconds: started.elapsed().as_secs_f64(),
        results,
        errors,
    })
}

const POSITIVE_CUES: [&str; 6] = ["surge", "gain", "profit", "record", "beat", "growth"];
const NEGATIVE_CUES: [&str; 6] = ["drop", "loss", "decline", "fall", "scandal", "fraud"];

const SECTOR_CUES: [(&str, &str); 5] = [
    ("bank", "Banking"),
    ("real estate", "Real Estate"),
    ("oil", "Energy"),
    ("tech", "Technology"),
    ("steel", "Materials"),
];

/// Deterministic heuristic producer for development and testing.
///
/// Derives sentiment from keyword cues and tickers from uppercase tokens,
/// so fixture articles can steer the output precisely.
pub struct MockExtractionProducer {
    name: String,
    response_delay_ms: u64,
    fail_guids: HashSet<String>,
    batch_poison: Option<String>,
    scorer: ConfidenceScorer,
}

impl MockExtractionProducer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            response_delay_ms: 0,
            fail_guids: HashSet::new(),
            batch_poison: None,
            scorer: ConfidenceScorer::default(),
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.response_delay_ms = delay_ms;
        self
    }

    /// Articles with these guids fail individual extraction.
    pub fn with_failing_guids(mut self, guids: impl IntoIterator<Item = String>) -> Self {
        self.fail_guids = guids.into_iter().collect();
        self
    }

    /// Any batch containing this guid fails wholesale.
    pub fn with_batch_poison(mut self, guid: impl Into<String>) -> Self {
        self.batch_poison = Some(guid.into());
        self
    }

    fn derive_sentiment(text_lower: &str) -> (Sentiment, f64, Vec<String>) {
        let positives: Vec<String> = POSITIVE_CUES
            .iter()
            .filter(|cue| text_lower.contains(*cue))
            .map(|cue| cue.to_string())
            .collect();
        let negatives: Vec<String> = NEGATIVE_CUES
            .iter()
            .filter(|cue| text_lower.contains(*cue))
            .map(|cue| cue.to_string())
            .collect();

        let (label, score) = if positives.len() > negatives.len() {
            (Sentiment::Positive, 0.6)
        } else if negatives.len() > positives.len() {
            (Sentiment::Negative, -0.6)
        } else {
            (Sentiment::Neutral, 0.0)
        };

        let mut factors = positives;
        factors.extend(negatives);
        (label, score, factors)
    }

    fn derive_tickers(text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut tickers = Vec::new();
        for token in text.split(|c: char| !c.is_ascii_alphanumeric()) {
            let len = token.len();
            if (2..=4).contains(&len)
                && token.chars().all(|c| c.is_ascii_uppercase())
                && seen.insert(token.to_string())
            {
                tickers.push(token.to_string());
            }
        }
        tickers
    }

    fn derive_sectors(text_lower: &str) -> Vec<String> {
        SECTOR_CUES
            .iter()
            .filter(|(cue, _)| text_lower.contains(cue))
            .map(|(_, sector)| sector.to_string())
            .collect()
    }
}

#[async_trait]
impl ExtractionProducer for MockExtractionProducer {
    fn producer_name(&self) -> String {
        format!("mock({})", self.name)
    }

    fn model_name(&self) -> String {
        "mock-extractor-v1".to_string()
    }

    async fn extract(&self, article: &SourceArticle) -> Result<ExtractionResult> {
        if self.response_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.response_delay_ms)).await;
        }

        if self.fail_guids.contains(&article.guid) {
            return Err(AggregatorError::Extraction {
                guid: article.guid.clone(),
                message: "simulated extraction failure".to_string(),
            });
        }

        let text = format!("{} {}", article.title, article.full_text);
        let text_lower = text.to_lowercase();

        let (label, score, factors) = Self::derive_sentiment(&text_lower);
        let tickers = Self::derive_tickers(&text);
        let sectors = Self::derive_sectors(&text_lower);
        let has_numbers = article.full_text.chars().any(|c| c.is_ascii_digit());

        let stocks: Vec<StockMention> = tickers
            .iter()
            .map(|ticker| StockMention {
                ticker: ticker.clone(),
                company_name: None,
                sentiment: label,
                impact_type: "business".to_string(),
                price_impact: match label {
                    Sentiment::Positive => "up",
                    Sentiment::Negative => "down",
                    Sentiment::Neutral => "unchanged",
                }
                .to_string(),
                confidence: 0.8,
            })
            .collect();

        let sector_mentions: Vec<SectorMention> = sectors
            .iter()
            .map(|sector| SectorMention {
                sector_name: sector.clone(),
                sentiment: label,
                impact_description: format!("{} impact on {}", label, sector),
                affected_companies: tickers.clone(),
            })
            .collect();

        let percentages: Vec<FinancialFigure> = text
            .split_whitespace()
            .filter(|token| token.ends_with('%'))
            .map(|token| FinancialFigure {
                value: token.to_string(),
                context: None,
            })
            .collect();

        let mut result = ExtractionResult {
            article_guid: article.guid.clone(),
            article_title: article.title.clone(),
            article_category: article.category.clone(),
            extraction_timestamp: Utc::now(),
            extraction_model: self.model_name(),
            extraction_confidence: 0.0,
            sentiment: Some(SentimentAnalysis {
                overall_sentiment: label,
                sentiment_score: score,
                key_factors: factors,
            }),
            stocks: Some(stocks),
            sectors: Some(sector_mentions),
            market: Some(MarketInfo {
                scope: if text_lower.contains("market") {
                    "market-wide".to_string()
                } else {
                    "single-stock".to_string()
                },
                exchange: "HOSE".to_string(),
                market_moving: text_lower.contains("market"),
                impact_magnitude: None,
                key_indices: Vec::new(),
            }),
            financial: Some(FinancialData {
                has_numbers,
                revenues: Vec::new(),
                profits: Vec::new(),
                percentages,
                amounts: Vec::new(),
            }),
        };
        result.extraction_confidence = self.scorer.score(&result);

        Ok(result)
    }

    async fn extract_batch(
        &self,
        articles: &[SourceArticle],
        article_delay: Duration,
    ) -> Result<BatchExtraction> {
        if let Some(poison) = &self.batch_poison {
            if articles.iter().any(|a| &a.guid == poison) {
                return Err(AggregatorError::General(format!(
                    "simulated batch failure triggered by {}",
                    poison
                )));
            }
        }
        serial_extract(self, articles, article_delay).await
    }
}

/// Configuration for the OpenRouter-backed producer.
#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
}

impl OpenRouterConfig {
    /// Build a config from `OPENROUTER_API_KEY` and optional overrides in
    /// `OPENROUTER_BASE_URL` / `OPENROUTER_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY").map_err(|_| {
            AggregatorError::General(
                "OPENROUTER_API_KEY environment variable is required".to_string(),
            )
        })?;
        Ok(Self {
            api_key,
            base_url: std::env::var("OPENROUTER_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
            model: std::env::var("OPENROUTER_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4o-mini".to_string()),
            temperature: 0.1,
            max_tokens: 4096,
            timeout_seconds: 60,
            max_retries: 3,
            retry_delay_seconds: 5,
        })
    }
}

const EXTRACTION_SYSTEM_PROMPT: &str =
    "You are a financial news extraction expert. Extract structured information \
     from articles and return only a JSON object matching the requested schema.";

const EXTRACTION_PROMPT: &str = r#"Extract structured information from the following news article.

ARTICLE METADATA:
- Title: {title}
- Category: {category}
- Publication date: {pub_date}

ARTICLE TEXT:
{full_text}

Return a JSON object with these keys:

{
  "sentiment_analysis": {
    "overall_sentiment": "positive|negative|neutral",
    "sentiment_score": -1.0 to 1.0,
    "key_factors": ["factors affecting sentiment"]
  },
  "stock_level": [
    {
      "ticker": "VCB",
      "company_name": "company name or null",
      "sentiment": "positive|negative|neutral",
      "impact_type": "financial|business|market|governance|legal|other",
      "price_impact": "up|down|unchanged|unknown",
      "confidence": 0.0 to 1.0
    }
  ],
  "sector_level": [
    {
      "sector_name": "sector name",
      "sentiment": "positive|negative|neutral",
      "impact_description": "how the sector is affected",
      "affected_companies": ["company names"]
    }
  ],
  "market_level": {
    "scope": "market-wide|sector|single-stock|unknown",
    "exchange": "HOSE|HNX|UPCOM|all|unknown",
    "market_moving": true or false,
    "impact_magnitude": "high|medium|low" or null,
    "key_indices": ["VN-Index", "HNX-Index"]
  },
  "financial_data": {
    "has_numbers": true or false,
    "revenues": [{"value": "...", "context": "..."}],
    "profits": [{"value": "...", "context": "..."}],
    "percentages": [{"value": "...", "context": "..."}],
    "amounts": [{"value": "...", "context": "..."}]
  },
  "extraction_confidence": 0.0 to 1.0
}

Return ONLY the JSON object, no additional text."#;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// The model's JSON payload, before it is stamped with article metadata.
#[derive(Deserialize)]
struct RawExtraction {
    sentiment_analysis: Option<SentimentAnalysis>,
    stock_level: Option<Vec<StockMention>>,
    sector_level: Option<Vec<SectorMention>>,
    market_level: Option<MarketInfo>,
    financial_data: Option<FinancialData>,
    extraction_confidence: Option<f64>,
}

/// Producer calling an OpenRouter-compatible chat-completions endpoint.
pub struct OpenRouterProducer {
    client: reqwest::Client,
    config: OpenRouterConfig,
    scorer: ConfidenceScorer,
}

impl OpenRouterProducer {
    pub fn new(config: OpenRouterConfig) -> Result<Self> {
        // Fail early on a malformed endpoint rather than on the first call.
        url::Url::parse(&config.base_url)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()?;

        info!(
            "OpenRouter producer initialized with model {}",
            config.model
        );

        Ok(Self {
            client,
            config,
            scorer: ConfidenceScorer::default(),
        })
    }

    pub fn with_scorer(mut self, scorer: ConfidenceScorer) -> Self {
        self.scorer = scorer;
        self
    }

    fn build_prompt(article: &SourceArticle) -> String {
        EXTRACTION_PROMPT
            .replacen("{title}", &article.title, 1)
            .replacen("{category}", &article.category, 1)
            .replacen("{pub_date}", &article.pub_date, 1)
            .replacen("{full_text}", &article.full_text, 1)
    }

    async fn call_model(&self, article: &SourceArticle) -> Result<ExtractionResult> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: EXTRACTION_SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: Self::build_prompt(article),
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AggregatorError::Extraction {
                guid: article.guid.clone(),
                message: format!(
                    "HTTP {}: {}",
                    status,
                    status.canonical_reason().unwrap_or("Unknown")
                ),
            });
        }

        let chat: ChatResponse = response.json().await?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| AggregatorError::Extraction {
                guid: article.guid.clone(),
                message: "model response contained no choices".to_string(),
            })?;

        let raw: RawExtraction =
            serde_json::from_str(content).map_err(|e| AggregatorError::Extraction {
                guid: article.guid.clone(),
                message: format!("invalid JSON in model response: {}", e),
            })?;

        let mut result = ExtractionResult {
            article_guid: article.guid.clone(),
            article_title: article.title.clone(),
            article_category: article.category.clone(),
            extraction_timestamp: Utc::now(),
            extraction_model: self.config.model.clone(),
            extraction_confidence: 0.0,
            sentiment: raw.sentiment_analysis,
            stocks: raw.stock_level,
            sectors: raw.sector_level,
            market: raw.market_level,
            financial: raw.financial_data,
        };
        result.extraction_confidence = raw
            .extraction_confidence
            .unwrap_or_else(|| self.scorer.score(&result));

        Ok(result)
    }
}

#[async_trait]
impl ExtractionProducer for OpenRouterProducer {
    fn producer_name(&self) -> String {
        format!("openrouter({})", self.config.model)
    }

    fn model_name(&self) -> String {
        self.config.model.clone()
    }

    async fn extract(&self, article: &SourceArticle) -> Result<ExtractionResult> {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_secs(self.config.retry_delay_seconds),
            initial_interval: Duration::from_secs(self.config.retry_delay_seconds),
            max_interval: Duration::from_secs(self.config.retry_delay_seconds * 32),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.config.retry_delay_seconds * 60)),
            ..Default::default()
        };

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match self.call_model(article).await {
                Ok(result) => {
                    debug!(
                        "Extracted {} with confidence {:.3}",
                        article.guid, result.extraction_confidence
                    );
                    return Ok(result);
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.config.max_retries {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!(
                                "Attempt {} failed for article {}, retrying in {:?}",
                                attempt + 1,
                                article.guid,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                }
            }
        }

        error!(
            "Extraction failed for article {} after {} attempts",
            article.guid,
            self.config.max_retries + 1
        );
        Err(last_error.unwrap_or_else(|| AggregatorError::Extraction {
            guid: article.guid.clone(),
            message: "extraction failed with no recorded error".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(guid: &str, title: &str, text: &str) -> SourceArticle {
        SourceArticle {
            title: title.to_string(),
            category: "markets".to_string(),
            description: String::new(),
            full_text: text.to_string(),
            url: format!("https://example.com/{guid}"),
            guid: guid.to_string(),
            pub_date: "2024-01-01".to_string(),
        }
    }

    #[tokio::test]
    async fn mock_extracts_tickers_and_sentiment() {
        let producer = MockExtractionProducer::new("test");
        let result = producer
            .extract(&article(
                "a1",
                "VCB posts record profit",
                "VCB reported a 25% profit surge. Banking sector strength continues.",
            ))
            .await
            .unwrap();

        assert_eq!(result.tickers(), vec!["VCB".to_string()]);
        assert_eq!(result.overall_sentiment(), Sentiment::Positive);
        assert_eq!(result.sector_names(), vec!["Banking".to_string()]);
        assert!(result.has_financial_numbers());
        assert!(result.extraction_confidence > 0.9);
    }

    #[tokio::test]
    async fn serial_batch_isolates_failures() {
        let producer = MockExtractionProducer::new("test")
            .with_failing_guids(vec!["bad".to_string()]);
        let batch = vec![
            article("ok1", "FPT growth", "FPT gain"),
            article("bad", "broken", "text"),
            article("ok2", "HPG growth", "HPG gain"),
        ];

        let outcome = producer
            .extract_batch(&batch, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(outcome.total_articles, 3);
        assert_eq!(outcome.successful_extractions, 2);
        assert_eq!(outcome.failed_extractions, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("bad"));
    }

    #[tokio::test]
    async fn poisoned_batch_fails_wholesale() {
        let producer = MockExtractionProducer::new("test").with_batch_poison("poison");
        let batch = vec![
            article("ok1", "FPT growth", "FPT gain"),
            article("poison", "poison", "text"),
        ];
        assert!(producer.extract_batch(&batch, Duration::ZERO).await.is_err());
    }
}
