use serde::Serialize;

use lmbridge_config::Pricing;

/// Cost breakdown attached to the request-end event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub currency: String,
}

/// `(tokens / unit) * unit_price` per side, rounded to six decimals.
pub fn calculate_cost(input_tokens: u64, output_tokens: u64, pricing: &Pricing) -> CostInfo {
    let unit = if pricing.unit > 0.0 { pricing.unit } else { 1_000_000.0 };
    let input_cost = round6(input_tokens as f64 / unit * pricing.input);
    let output_cost = round6(output_tokens as f64 / unit * pricing.output);
    CostInfo {
        input_tokens,
        output_tokens,
        total_tokens: input_tokens + output_tokens,
        input_cost,
        output_cost,
        total_cost: round6(input_cost + output_cost),
        currency: pricing.currency.clone(),
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
