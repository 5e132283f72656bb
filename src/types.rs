use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Overall sentiment label used across all analysis levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub const ALL: [Sentiment; 3] = [Sentiment::Positive, Sentiment::Negative, Sentiment::Neutral];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
        }
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactMagnitude {
    High,
    Medium,
    Low,
}

/// Article-level sentiment analysis result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentAnalysis {
    pub overall_sentiment: Sentiment,
    /// Score in [-1.0, 1.0].
    pub sentiment_score: f64,
    #[serde(default)]
    pub key_factors: Vec<String>,
}

/// Per-stock analysis extracted from an article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockMention {
    pub ticker: String,
    pub company_name: Option<String>,
    pub sentiment: Sentiment,
    pub impact_type: String,
    pub price_impact: String,
    pub confidence: f64,
}

/// Per-sector analysis extracted from an article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectorMention {
    pub sector_name: String,
    pub sentiment: Sentiment,
    pub impact_description: String,
    #[serde(default)]
    pub affected_companies: Vec<String>,
}

/// Market-wide analysis extracted from an article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    pub scope: String,
    pub exchange: String,
    pub market_moving: bool,
    pub impact_magnitude: Option<ImpactMagnitude>,
    #[serde(default)]
    pub key_indices: Vec<String>,
}

/// A single financial figure mentioned in an article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialFigure {
    pub value: String,
    pub context: Option<String>,
}

/// Financial numbers extracted from an article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialData {
    pub has_numbers: bool,
    #[serde(default)]
    pub revenues: Vec<FinancialFigure>,
    #[serde(default)]
    pub profits: Vec<FinancialFigure>,
    #[serde(default)]
    pub percentages: Vec<FinancialFigure>,
    #[serde(default)]
    pub amounts: Vec<FinancialFigure>,
}

/// Complete structured extraction result for one article.
///
/// The five sub-payloads are optional: a `None` means the producer did not
/// extract that level, which is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub article_guid: String,
    pub article_title: String,
    pub article_category: String,
    pub extraction_timestamp: DateTime<Utc>,
    pub extraction_model: String,
    pub extraction_confidence: f64,
    pub sentiment: Option<SentimentAnalysis>,
    pub stocks: Option<Vec<StockMention>>,
    pub sectors: Option<Vec<SectorMention>>,
    pub market: Option<MarketInfo>,
    pub financial: Option<FinancialData>,
}

impl ExtractionResult {
    /// The sub-components present in this result.
    pub fn present_components(&self) -> Vec<Component> {
        let mut present = Vec::new();
        if self.sentiment.is_some() {
            present.push(Component::Sentiment);
        }
        if self.stocks.is_some() {
            present.push(Component::Stocks);
        }
        if self.sectors.is_some() {
            present.push(Component::Sectors);
        }
        if self.market.is_some() {
            present.push(Component::Market);
        }
        if self.financial.is_some() {
            present.push(Component::Financial);
        }
        present
    }

    pub fn tickers(&self) -> Vec<String> {
        self.stocks
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|s| s.ticker.clone())
            .collect()
    }

    pub fn sector_names(&self) -> Vec<String> {
        self.sectors
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|s| s.sector_name.clone())
            .collect()
    }

    pub fn overall_sentiment(&self) -> Sentiment {
        self.sentiment
            .as_ref()
            .map(|s| s.overall_sentiment)
            .unwrap_or(Sentiment::Neutral)
    }

    pub fn is_market_moving(&self) -> bool {
        self.market.as_ref().map(|m| m.market_moving).unwrap_or(false)
    }

    pub fn has_financial_numbers(&self) -> bool {
        self.financial.as_ref().map(|f| f.has_numbers).unwrap_or(false)
    }
}

/// An article as delivered by the upstream article source.
///
/// Every field is optional in the wire format; crawler dumps routinely
/// omit fields, and the pipeline validates what it needs per article. The
/// aliases accept the key names the crawler output uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceArticle {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, alias = "description_text")]
    pub description: String,
    #[serde(default, alias = "main_content")]
    pub full_text: String,
    #[serde(default, alias = "link")]
    pub url: String,
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub pub_date: String,
}

/// The five extraction sub-components tracked for completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Sentiment,
    Stocks,
    Sectors,
    Market,
    Financial,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Sentiment,
        Component::Stocks,
        Component::Sectors,
        Component::Market,
        Component::Financial,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Sentiment => "sentiment",
            Component::Stocks => "stocks",
            Component::Sectors => "sectors",
            Component::Market => "market",
            Component::Financial => "financial",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persistence state of an article's extraction sub-components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    InProgress,
    Partial,
    Completed,
}

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Article {guid} is missing required field '{field}'")]
    MissingField { guid: String, field: &'static str },

    #[error("Extraction failed for {guid}: {message}")]
    Extraction { guid: String, message: String },

    #[error("Failed to persist {component} component for {guid}: {message}")]
    ComponentPersist {
        guid: String,
        component: Component,
        message: String,
    },

    #[error("No aggregate data found for {date}")]
    AggregateNotFound { date: NaiveDate },

    #[error("Article {guid} already present in aggregate for {date}")]
    DuplicateArticle { guid: String, date: NaiveDate },

    #[error("General error: {0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
