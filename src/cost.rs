use crate::config::{env_parse, env_string};
use crate::models::GenerationUsage;
use serde::Serialize;

const PER_MILLION: f64 = 1_000_000.0;

/// Per-million-token prices (USD) and the factor converting USD into the
/// reporting currency.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub image_output_per_million: f64,
    pub currency_factor: f64,
    pub currency: String,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            input_per_million: 0.10,
            output_per_million: 0.40,
            image_output_per_million: 30.00,
            currency_factor: 5.10,
            currency: "BRL".into(),
        }
    }
}

impl PricingTable {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            input_per_million: env_parse("PRICE_INPUT_1M_USD").unwrap_or(defaults.input_per_million),
            output_per_million: env_parse("PRICE_OUTPUT_1M_USD")
                .unwrap_or(defaults.output_per_million),
            image_output_per_million: env_parse("PRICE_IMAGE_OUTPUT_1M_USD")
                .unwrap_or(defaults.image_output_per_million),
            currency_factor: env_parse("USD_TO_BRL").unwrap_or(defaults.currency_factor),
            currency: env_string("COST_CURRENCY").unwrap_or(defaults.currency),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchCostSummary {
    pub calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub image_output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Default)]
pub struct UsageCostAccountant {
    pricing: PricingTable,
}

impl UsageCostAccountant {
    pub fn new(pricing: PricingTable) -> Self {
        Self { pricing }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Sums a batch's usage records and prices them. Pure: same input, same summary.
    ///
    /// The total is left unrounded so batches add up exactly; round only for
    /// display with [`display_cost`].
    pub fn accumulate(&self, usages: &[GenerationUsage]) -> BatchCostSummary {
        let input_tokens: u64 = usages.iter().map(|u| u.input_tokens).sum();
        let output_tokens: u64 = usages.iter().map(|u| u.output_tokens).sum();
        let image_output_tokens: u64 = usages
            .iter()
            .map(|u| u.image_output_tokens.unwrap_or(0))
            .sum();
        let usd = input_tokens as f64 * self.pricing.input_per_million / PER_MILLION
            + output_tokens as f64 * self.pricing.output_per_million / PER_MILLION
            + image_output_tokens as f64 * self.pricing.image_output_per_million / PER_MILLION;
        BatchCostSummary {
            calls: usages.len(),
            input_tokens,
            output_tokens,
            image_output_tokens,
            total_tokens: input_tokens + output_tokens + image_output_tokens,
            total_cost: usd * self.pricing.currency_factor,
            currency: self.pricing.currency.clone(),
        }
    }

    pub fn cost_of(&self, usage: GenerationUsage) -> f64 {
        self.accumulate(&[usage]).total_cost
    }
}

/// Rounds a cost for display: two places normally, four for sub-cent amounts.
pub fn display_cost(cost: f64) -> f64 {
    if cost != 0.0 && cost.abs() < 0.01 {
        round_to(cost, 4)
    } else {
        round_to(cost, 2)
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_cost_matches_per_million_formula() {
        let accountant = UsageCostAccountant::default();
        let usages = [
            GenerationUsage::new(1_200, 350),
            GenerationUsage::new(800, 150),
            GenerationUsage::default(),
        ];
        let summary = accountant.accumulate(&usages);
        assert_eq!(summary.input_tokens, 2_000);
        assert_eq!(summary.output_tokens, 500);
        assert_eq!(summary.total_tokens, 2_500);
        assert_eq!(summary.calls, 3);
        let expected = (2_000.0 * 0.10 / 1e6 + 500.0 * 0.40 / 1e6) * 5.10;
        assert!((summary.total_cost - expected).abs() <= 1e-6, "{}", summary.total_cost);
        assert_eq!(summary.currency, "BRL");
    }

    #[test]
    fn image_tokens_priced_separately() {
        let accountant = UsageCostAccountant::default();
        let usage = GenerationUsage {
            input_tokens: 500,
            output_tokens: 0,
            image_output_tokens: Some(1_290),
        };
        let expected = (500.0 * 0.10 + 1_290.0 * 30.0) / 1e6 * 5.10;
        assert!((accountant.cost_of(usage) - expected).abs() <= 1e-6);
        assert_eq!(accountant.accumulate(&[usage]).total_tokens, 1_790);
    }

    #[test]
    fn empty_batch_costs_nothing() {
        let summary = UsageCostAccountant::default().accumulate(&[]);
        assert_eq!(summary.total_tokens, 0);
        assert_eq!(summary.total_cost, 0.0);
    }

    #[test]
    fn accumulate_is_order_independent() {
        let accountant = UsageCostAccountant::new(PricingTable::default());
        let a = GenerationUsage::new(10, 20);
        let b = GenerationUsage::new(30, 40);
        assert_eq!(accountant.accumulate(&[a, b]), accountant.accumulate(&[b, a]));
    }

    #[test]
    fn doubling_the_batch_doubles_the_cost() {
        let accountant = UsageCostAccountant::default();
        let single = [GenerationUsage::new(1, 0)];
        let once = accountant.accumulate(&single).total_cost;
        let twice = accountant.accumulate(&[single[0], single[0]]).total_cost;
        assert!(once > 0.0);
        assert_eq!(twice, 2.0 * once);

        let mixed = vec![
            GenerationUsage::new(1_200, 350),
            GenerationUsage {
                input_tokens: 3,
                output_tokens: 7,
                image_output_tokens: Some(1_290),
            },
            GenerationUsage::new(1, 1),
        ];
        let doubled: Vec<_> = mixed.iter().chain(mixed.iter()).copied().collect();
        let once = accountant.accumulate(&mixed);
        let twice = accountant.accumulate(&doubled);
        assert_eq!(twice.total_tokens, 2 * once.total_tokens);
        assert_eq!(twice.calls, 2 * once.calls);
        let drift = (twice.total_cost - 2.0 * once.total_cost).abs();
        assert!(drift <= 1e-12 * twice.total_cost, "{drift}");
    }

    #[test]
    fn repeated_accumulation_carries_no_state() {
        let accountant = UsageCostAccountant::default();
        let usages = [GenerationUsage::new(40, 9)];
        let first = accountant.accumulate(&usages);
        let _ = accountant.accumulate(&[GenerationUsage::new(1_000_000, 0)]);
        assert_eq!(accountant.accumulate(&usages), first);
    }

    #[test]
    fn display_rounding() {
        assert_eq!(display_cost(1.23456), 1.23);
        assert_eq!(display_cost(0.001234), 0.0012);
        assert_eq!(display_cost(0.0), 0.0);
    }
}
