pub mod aggregate;
pub mod completeness;
pub mod feed;
pub mod pipeline;
pub mod producer;
pub mod query;
pub mod repository;
pub mod scoring;
pub mod types;
pub mod utils;

pub use aggregate::{AggregationStore, AppendReceipt, DailyAggregate};
pub use completeness::{
    CompletenessRecord, CompletenessTracker, ComponentStore, MemoryComponentStore,
};
pub use feed::{ArticleFeed, JsonBacklogFeed, StaticFeed};
pub use pipeline::{PipelineConfig, PipelineOrchestrator, Session, SessionResult, SessionStatus};
pub use producer::{
    BatchExtraction, ExtractionProducer, MockExtractionProducer, OpenRouterConfig,
    OpenRouterProducer,
};
pub use query::{QueryEngine, QueryFilters, ReportBundle};
pub use repository::PgComponentStore;
pub use scoring::ConfidenceScorer;
pub use types::*;
