use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tiktoken_rs::cl100k_base;

use tether_types::{ModelPricing, ProtocolFamily, TokenUsage, TranscriptEntry};

#[derive(Debug, Error)]
#[error("tokenizer initialization failed: {0}")]
pub struct TokenizerError(String);

/// cl100k token counter. Building the BPE tables is expensive, so one
/// instance is shared per runtime.
pub struct Tokenizer {
    bpe: tiktoken_rs::CoreBPE,
}

impl Tokenizer {
    pub fn new() -> Result<Self, TokenizerError> {
        let bpe = cl100k_base().map_err(|e| TokenizerError(e.to_string()))?;
        Ok(Self { bpe })
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Locally counted output tokens for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub text: u64,
    pub reasoning: u64,
    pub tool_calls: u64,
}

impl TokenCounts {
    pub fn total(&self) -> u64 {
        self.text + self.reasoning + self.tool_calls
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub usage: TokenUsage,
    /// True when the provider reported nothing usable and the numbers are
    /// local estimates.
    pub estimated: bool,
}

/// Accumulates streamed output locally and reconciles it against what the
/// provider reports.
pub struct TokenCostEstimator {
    tokenizer: Arc<Tokenizer>,
    counts: TokenCounts,
    reported: Option<TokenUsage>,
}

impl TokenCostEstimator {
    pub fn new(tokenizer: Arc<Tokenizer>) -> Self {
        Self {
            tokenizer,
            counts: TokenCounts::default(),
            reported: None,
        }
    }

    pub fn counts(&self) -> TokenCounts {
        self.counts
    }

    pub fn reported(&self) -> Option<&TokenUsage> {
        self.reported.as_ref()
    }

    pub fn record_text(&mut self, delta: &str) {
        self.counts.text += self.tokenizer.count_tokens(delta) as u64;
    }

    pub fn record_reasoning(&mut self, delta: &str) {
        self.counts.reasoning += self.tokenizer.count_tokens(delta) as u64;
    }

    pub fn record_tool_arguments(&mut self, arguments: &str) {
        self.counts.tool_calls += self.tokenizer.count_tokens(arguments) as u64;
    }

    pub fn record_usage(&mut self, usage: &TokenUsage) {
        match self.reported.as_mut() {
            Some(existing) => existing.merge(usage),
            None => self.reported = Some(usage.clone()),
        }
    }

    /// Provider numbers win unless they are missing or trivially zero while
    /// local counting saw output. In that case input tokens are estimated from
    /// `transcript`, output from local counts, and cost from `pricing`.
    pub fn reconcile(
        &self,
        transcript: &[TranscriptEntry],
        family: ProtocolFamily,
        pricing: &ModelPricing,
    ) -> UsageReport {
        let reported = self.reported.clone().unwrap_or_default();
        let local_output = self.counts.total();

        if reported.is_trivially_zero() && local_output > 0 {
            let input_tokens = transcript
                .iter()
                .flat_map(|entry| entry.content.iter())
                .map(|block| self.tokenizer.count_tokens(&block.plain_text()) as u64)
                .sum();
            let mut usage = TokenUsage {
                input_tokens,
                output_tokens: local_output,
                cache_write_tokens: 0,
                cache_read_tokens: 0,
                reasoning_tokens: (self.counts.reasoning > 0).then_some(self.counts.reasoning),
                total_cost: None,
            };
            usage.total_cost = Some(calculate_cost(family, pricing, &usage));
            tracing::debug!(
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "provider usage missing, using local estimate"
            );
            return UsageReport {
                usage,
                estimated: true,
            };
        }

        let mut usage = reported;
        if usage.total_cost.is_none() {
            usage.total_cost = Some(calculate_cost(family, pricing, &usage));
        }
        UsageReport {
            usage,
            estimated: false,
        }
    }
}

/// Cost in USD. Anthropic reports input tokens without cache tokens; the
/// OpenAI-compatible family includes them, so they are subtracted first.
pub fn calculate_cost(family: ProtocolFamily, pricing: &ModelPricing, usage: &TokenUsage) -> f64 {
    let cache_write = usage.cache_write_tokens as f64 * pricing.cache_write_price;
    let cache_read = usage.cache_read_tokens as f64 * pricing.cache_read_price;
    let output = usage.output_tokens as f64 * pricing.output_price;
    let input_tokens = match family {
        ProtocolFamily::Anthropic => usage.input_tokens,
        ProtocolFamily::OpenaiCompatible => usage
            .input_tokens
            .saturating_sub(usage.cache_write_tokens + usage.cache_read_tokens),
    };
    let input = input_tokens as f64 * pricing.input_price;
    (input + output + cache_write + cache_read) / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::{ContentBlock, Role};

    fn pricing() -> ModelPricing {
        ModelPricing {
            input_price: 3.0,
            output_price: 15.0,
            cache_write_price: 3.75,
            cache_read_price: 0.3,
        }
    }

    fn usage() -> TokenUsage {
        TokenUsage {
            input_tokens: 1_000,
            output_tokens: 500,
            cache_write_tokens: 200,
            cache_read_tokens: 100,
            ..TokenUsage::default()
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn anthropic_cost_counts_cache_separately() {
        let cost = calculate_cost(ProtocolFamily::Anthropic, &pricing(), &usage());
        assert!(approx(cost, 0.01128), "{cost}");
    }

    #[test]
    fn openai_cost_subtracts_cache_from_input() {
        let cost = calculate_cost(ProtocolFamily::OpenaiCompatible, &pricing(), &usage());
        assert!(approx(cost, 0.01038), "{cost}");
    }

    #[test]
    fn zero_usage_with_local_output_is_estimated() {
        let tokenizer = Arc::new(Tokenizer::new().expect("tokenizer"));
        let mut estimator = TokenCostEstimator::new(tokenizer.clone());
        estimator.record_text("The answer is forty-two.");
        estimator.record_tool_arguments(r#"{"path":"src/main.rs"}"#);
        estimator.record_usage(&TokenUsage::default());

        let transcript = vec![TranscriptEntry::new(
            Role::User,
            vec![ContentBlock::text("What is the answer?")],
        )];
        let report = estimator.reconcile(&transcript, ProtocolFamily::Anthropic, &pricing());

        assert!(report.estimated);
        assert_eq!(
            report.usage.input_tokens,
            tokenizer.count_tokens("What is the answer?") as u64
        );
        assert_eq!(report.usage.output_tokens, estimator.counts().total());
        assert!(report.usage.total_cost.unwrap_or_default() > 0.0);
    }

    #[test]
    fn reported_usage_is_authoritative() {
        let tokenizer = Arc::new(Tokenizer::new().expect("tokenizer"));
        let mut estimator = TokenCostEstimator::new(tokenizer);
        estimator.record_text("lots of locally counted text");
        estimator.record_usage(&TokenUsage {
            input_tokens: 1_000,
            ..TokenUsage::default()
        });
        estimator.record_usage(&TokenUsage {
            output_tokens: 500,
            cache_write_tokens: 200,
            cache_read_tokens: 100,
            ..TokenUsage::default()
        });

        let report = estimator.reconcile(&[], ProtocolFamily::Anthropic, &pricing());

        assert!(!report.estimated);
        assert_eq!(report.usage.input_tokens, 1_000);
        assert_eq!(report.usage.output_tokens, 500);
        assert!(approx(report.usage.total_cost.unwrap_or_default(), 0.01128));
    }

    #[test]
    fn nothing_streamed_keeps_zero_usage() {
        let tokenizer = Arc::new(Tokenizer::new().expect("tokenizer"));
        let estimator = TokenCostEstimator::new(tokenizer);
        let report = estimator.reconcile(&[], ProtocolFamily::OpenaiCompatible, &pricing());
        assert!(!report.estimated);
        assert_eq!(report.usage.output_tokens, 0);
        assert_eq!(report.usage.total_cost, Some(0.0));
    }
}
