use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use weft_core::config::ModelPrice;

/// Built-in prices, USD per one million tokens.
pub fn default_prices() -> HashMap<String, ModelPrice> {
    [
        ("gpt-4", 30.0, 60.0),
        ("gpt-4-turbo", 10.0, 30.0),
        ("gpt-3.5-turbo", 0.5, 1.5),
        ("claude-3-opus", 15.0, 75.0),
        ("claude-3-sonnet", 3.0, 15.0),
    ]
    .into_iter()
    .map(|(model, prompt, completion)| (model.to_string(), ModelPrice { prompt, completion }))
    .collect()
}

/// Running per-key spend derived from a static price table.
pub struct CostTracker {
    prices: HashMap<String, ModelPrice>,
    totals: Mutex<HashMap<String, f64>>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::with_prices(default_prices())
    }

    pub fn with_prices(prices: HashMap<String, ModelPrice>) -> Self {
        Self {
            prices,
            totals: Mutex::new(HashMap::new()),
        }
    }

    /// Built-in table with `overrides` merged on top.
    pub fn with_overrides(overrides: &HashMap<String, ModelPrice>) -> Self {
        let mut prices = default_prices();
        prices.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
        Self::with_prices(prices)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, f64>> {
        match self.totals.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn price(&self, model: &str) -> Option<ModelPrice> {
        self.prices.get(model).copied()
    }

    /// Add the cost of one call to `key` and return it. Unknown models cost 0.
    pub fn record_usage(
        &self,
        key: &str,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> f64 {
        let Some(price) = self.price(model) else {
            debug!(model, "No price for model, recording zero cost");
            return 0.0;
        };
        let cost = (prompt_tokens as f64 / 1_000_000.0) * price.prompt
            + (completion_tokens as f64 / 1_000_000.0) * price.completion;
        *self.lock().entry(key.to_string()).or_insert(0.0) += cost;
        cost
    }

    /// Total for one key, or across every key when `None`.
    pub fn get_total_cost(&self, key: Option<&str>) -> f64 {
        let totals = self.lock();
        match key {
            Some(k) => totals.get(k).copied().unwrap_or(0.0),
            None => totals.values().sum(),
        }
    }

    pub fn reset(&self, key: Option<&str>) {
        let mut totals = self.lock();
        match key {
            Some(k) => {
                totals.remove(k);
            }
            None => totals.clear(),
        }
    }
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_million_prompt_tokens_costs_the_prompt_price() {
        let tracker = CostTracker::new();
        let cost = tracker.record_usage("a", "gpt-4", 1_000_000, 0);
        assert_eq!(cost, 30.0);
        assert_eq!(tracker.get_total_cost(Some("a")), 30.0);
    }

    #[test]
    fn unknown_model_costs_nothing() {
        let tracker = CostTracker::new();
        assert_eq!(tracker.record_usage("a", "mystery-model", 500, 500), 0.0);
        assert_eq!(tracker.get_total_cost(None), 0.0);
    }

    #[test]
    fn totals_accumulate_per_key_and_overall() {
        let tracker = CostTracker::new();
        tracker.record_usage("a", "claude-3-sonnet", 1_000_000, 1_000_000);
        tracker.record_usage("b", "gpt-3.5-turbo", 2_000_000, 0);
        assert_eq!(tracker.get_total_cost(Some("a")), 18.0);
        assert_eq!(tracker.get_total_cost(Some("b")), 1.0);
        assert_eq!(tracker.get_total_cost(None), 19.0);

        tracker.reset(Some("a"));
        assert_eq!(tracker.get_total_cost(None), 1.0);
        tracker.reset(None);
        assert_eq!(tracker.get_total_cost(None), 0.0);
    }

    #[test]
    fn overrides_merge_over_defaults() {
        let mut extra = HashMap::new();
        extra.insert(
            "gpt-4".to_string(),
            ModelPrice {
                prompt: 1.0,
                completion: 2.0,
            },
        );
        let tracker = CostTracker::with_overrides(&extra);
        assert_eq!(tracker.record_usage("a", "gpt-4", 1_000_000, 0), 1.0);
        assert!(tracker.price("claude-3-opus").is_some());
    }
}
