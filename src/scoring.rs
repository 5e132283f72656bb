use crate::types::{Component, ExtractionResult};

/// Weighted-bonus confidence scorer for extraction results.
///
/// Producers fall back to this when the model output carries no confidence
/// value. The weights are configurable because the score gates the
/// successful/failed accounting downstream.
#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    /// Bonus per stock mention.
    pub stock_bonus: f64,
    /// Cap on the total stock bonus.
    pub stock_bonus_cap: f64,
    /// Bonus when the article contains concrete financial numbers.
    pub numbers_bonus: f64,
    /// Bonus per sentiment key factor.
    pub factor_bonus: f64,
    /// Cap on the total key-factor bonus.
    pub factor_bonus_cap: f64,
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self {
            stock_bonus: 0.05,
            stock_bonus_cap: 0.2,
            numbers_bonus: 0.1,
            factor_bonus: 0.03,
            factor_bonus_cap: 0.15,
        }
    }
}

impl ConfidenceScorer {
    /// Score a result by sub-component coverage plus detail bonuses, capped
    /// at 1.0 and rounded to three decimals.
    pub fn score(&self, result: &ExtractionResult) -> f64 {
        let present = result.present_components().len() as f64;
        let base = present / Component::ALL.len() as f64;

        let mut bonus = 0.0;

        let stock_count = result.stocks.as_deref().map(|s| s.len()).unwrap_or(0);
        if stock_count > 0 {
            bonus += (stock_count as f64 * self.stock_bonus).min(self.stock_bonus_cap);
        }

        if result.has_financial_numbers() {
            bonus += self.numbers_bonus;
        }

        let factor_count = result
            .sentiment
            .as_ref()
            .map(|s| s.key_factors.len())
            .unwrap_or(0);
        if factor_count > 0 {
            bonus += (factor_count as f64 * self.factor_bonus).min(self.factor_bonus_cap);
        }

        ((base + bonus).min(1.0) * 1000.0).round() / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FinancialData, Sentiment, SentimentAnalysis, StockMention};
    use chrono::Utc;

    fn bare_result() -> ExtractionResult {
        ExtractionResult {
            article_guid: "g1".to_string(),
            article_title: "t".to_string(),
            article_category: "c".to_string(),
            extraction_timestamp: Utc::now(),
            extraction_model: "test-model".to_string(),
            extraction_confidence: 0.0,
            sentiment: None,
            stocks: None,
            sectors: None,
            market: None,
            financial: None,
        }
    }

    #[test]
    fn empty_result_scores_zero() {
        let scorer = ConfidenceScorer::default();
        assert_eq!(scorer.score(&bare_result()), 0.0);
    }

    #[test]
    fn bonuses_are_capped() {
        let scorer = ConfidenceScorer::default();
        let mut result = bare_result();
        result.sentiment = Some(SentimentAnalysis {
            overall_sentiment: Sentiment::Positive,
            sentiment_score: 0.8,
            key_factors: vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into(), "f".into()],
        });
        result.stocks = Some(
            (0..10)
                .map(|i| StockMention {
                    ticker: format!("T{i}"),
                    company_name: None,
                    sentiment: Sentiment::Positive,
                    impact_type: "financial".to_string(),
                    price_impact: "up".to_string(),
                    confidence: 0.9,
                })
                .collect(),
        );
        result.financial = Some(FinancialData {
            has_numbers: true,
            revenues: Vec::new(),
            profits: Vec::new(),
            percentages: Vec::new(),
            amounts: Vec::new(),
        });
        // 3/5 base + 0.2 stock cap + 0.1 numbers + 0.15 factor cap
        assert_eq!(scorer.score(&result), 1.0);
    }
}
