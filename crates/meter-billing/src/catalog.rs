//! Pricing Catalog and Billing Configuration
//!
//! The catalog is keyed by stable string ids and validated once at startup:
//! capability prices (USD per million units), subscription plans and points
//! packages.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

use crate::error::{BillingError, Result};

/// Points granted per dollar of upstream cost
pub const DEFAULT_POINTS_PER_DOLLAR: Decimal = dec!(500);

/// Conservative admission threshold, the real cost is unknown pre-flight
pub const DEFAULT_MIN_PREFLIGHT_POINTS: i64 = 10;

/// Price entry for a paid (or free) capability
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityPricing {
    pub id: String,
    pub name: String,
    pub input_price_per_million: Decimal,
    pub output_price_per_million: Decimal,
    #[serde(default)]
    pub free: bool,
}

impl CapabilityPricing {
    fn paid(id: &str, name: &str, input: Decimal, output: Decimal) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input_price_per_million: input,
            output_price_per_million: output,
            free: false,
        }
    }

    fn free(id: &str, name: &str, input: Decimal, output: Decimal) -> Self {
        Self {
            free: true,
            ..Self::paid(id, name, input, output)
        }
    }
}

/// Recurring plan with a daily allowance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPlan {
    pub id: String,
    pub name: String,
    pub price_cents: i64,
    pub daily_points_limit: i64,
    #[serde(default, skip_serializing)]
    pub gateway_price_id: Option<String>,
}

/// One-off points purchase
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsPackage {
    pub id: String,
    pub name: String,
    pub points: i64,
    pub price_cents: i64,
    #[serde(default, skip_serializing)]
    pub gateway_price_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub capabilities: Vec<CapabilityPricing>,
    pub plans: Vec<SubscriptionPlan>,
    pub packages: Vec<PointsPackage>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            capabilities: vec![
                CapabilityPricing::free("devstral-latest", "Devstral Latest", dec!(0.40), dec!(2.00)),
                CapabilityPricing::free("gemini-2.5-flash", "Gemini 2.5 Flash", dec!(0.30), dec!(2.50)),
                CapabilityPricing::paid("claude-opus-4.6", "Claude Opus 4.6", dec!(5), dec!(25)),
                CapabilityPricing::paid("gpt-5.2", "GPT-5.2", dec!(1.75), dec!(14.00)),
                CapabilityPricing::paid("gemini-3.1-pro", "Gemini 3.1 Pro", dec!(2.00), dec!(12.00)),
                CapabilityPricing::paid(
                    "grok-4.1-fast-reasoning",
                    "Grok 4.1 Fast Reasoning",
                    dec!(0.20),
                    dec!(0.50),
                ),
            ],
            // daily limit = (price - margin) * 500 points / 30 days
            plans: vec![
                SubscriptionPlan {
                    id: "basic".into(),
                    name: "Basic Monthly".into(),
                    price_cents: 5000,
                    daily_points_limit: 21_250 / 30,
                    gateway_price_id: None,
                },
                SubscriptionPlan {
                    id: "premium".into(),
                    name: "Premium Monthly".into(),
                    price_cents: 8000,
                    daily_points_limit: 36_000 / 30,
                    gateway_price_id: None,
                },
            ],
            packages: vec![PointsPackage {
                id: "starter".into(),
                name: "Starter Pack".into(),
                points: 3750,
                price_cents: 1000,
                gateway_price_id: None,
            }],
        }
    }
}

impl Catalog {
    pub fn capability(&self, id: &str) -> Result<&CapabilityPricing> {
        self.capabilities
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| BillingError::UnknownCapability(id.to_string()))
    }

    pub fn plan(&self, id: &str) -> Option<&SubscriptionPlan> {
        self.plans.iter().find(|p| p.id == id)
    }

    pub fn package(&self, id: &str) -> Option<&PointsPackage> {
        self.packages.iter().find(|p| p.id == id)
    }

    /// Load from a JSON file
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BillingError::Config(format!("cannot read catalog {path}: {e}")))?;
        serde_json::from_str(&raw)
            .map_err(|e| BillingError::Config(format!("invalid catalog {path}: {e}")))
    }

    /// Fill gateway price ids from `STRIPE_PRICE_<ID>` / `STRIPE_PRICE_SUB_<ID>`
    pub fn with_gateway_prices_from_env(mut self) -> Self {
        for plan in &mut self.plans {
            if plan.gateway_price_id.is_none() {
                plan.gateway_price_id = env_price(&format!("SUB_{}", plan.id));
            }
        }
        for package in &mut self.packages {
            if package.gateway_price_id.is_none() {
                package.gateway_price_id = env_price(&package.id);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for cap in &self.capabilities {
            if !seen.insert(cap.id.as_str()) {
                return Err(BillingError::Config(format!("duplicate capability id: {}", cap.id)));
            }
            if cap.input_price_per_million.is_sign_negative()
                || cap.output_price_per_million.is_sign_negative()
            {
                return Err(BillingError::Config(format!("negative price for capability {}", cap.id)));
            }
        }

        let mut seen = HashSet::new();
        for plan in &self.plans {
            if !seen.insert(plan.id.as_str()) {
                return Err(BillingError::Config(format!("duplicate plan id: {}", plan.id)));
            }
            if plan.daily_points_limit <= 0 || plan.price_cents < 0 {
                return Err(BillingError::Config(format!("invalid limits for plan {}", plan.id)));
            }
        }

        let mut seen = HashSet::new();
        for package in &self.packages {
            if !seen.insert(package.id.as_str()) {
                return Err(BillingError::Config(format!("duplicate package id: {}", package.id)));
            }
            if package.points <= 0 || package.price_cents < 0 {
                return Err(BillingError::Config(format!("invalid points for package {}", package.id)));
            }
        }

        Ok(())
    }
}

fn env_price(suffix: &str) -> Option<String> {
    let key = format!("STRIPE_PRICE_{}", suffix.to_uppercase().replace(['-', '.'], "_"));
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Billing configuration, validated at startup
#[derive(Clone, Debug)]
pub struct BillingConfig {
    pub catalog: Catalog,

    /// Conversion rate from upstream dollars to points
    pub points_per_dollar: Decimal,

    /// Admission threshold in points
    pub min_preflight_points: i64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            catalog: Catalog::default(),
            points_per_dollar: DEFAULT_POINTS_PER_DOLLAR,
            min_preflight_points: DEFAULT_MIN_PREFLIGHT_POINTS,
        }
    }
}

impl BillingConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let catalog = match std::env::var("BILLING_CATALOG_PATH") {
            Ok(path) => Catalog::from_file(&path)?,
            Err(_) => Catalog::default(),
        }
        .with_gateway_prices_from_env();

        let points_per_dollar = match std::env::var("POINTS_PER_DOLLAR") {
            Ok(raw) => Decimal::from_str(raw.trim())
                .map_err(|e| BillingError::Config(format!("POINTS_PER_DOLLAR: {e}")))?,
            Err(_) => DEFAULT_POINTS_PER_DOLLAR,
        };

        let min_preflight_points = match std::env::var("MIN_PREFLIGHT_POINTS") {
            Ok(raw) => raw
                .trim()
                .parse()
                .map_err(|e| BillingError::Config(format!("MIN_PREFLIGHT_POINTS: {e}")))?,
            Err(_) => DEFAULT_MIN_PREFLIGHT_POINTS,
        };

        let config = Self {
            catalog,
            points_per_dollar,
            min_preflight_points,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.points_per_dollar <= Decimal::ZERO {
            return Err(BillingError::Config("POINTS_PER_DOLLAR must be positive".into()));
        }
        if self.min_preflight_points < 0 {
            return Err(BillingError::Config("MIN_PREFLIGHT_POINTS must not be negative".into()));
        }
        self.catalog.validate()
    }

    /// Points owed for one invocation.
    ///
    /// Monotonic in both unit counts, rounded up to a whole point, never
    /// negative. Free capabilities cost nothing.
    pub fn points_cost(&self, capability_id: &str, input_units: u64, output_units: u64) -> Result<i64> {
        let capability = self.catalog.capability(capability_id)?;
        if capability.free {
            return Ok(0);
        }

        let overflow = || BillingError::Config(format!("usage overflows pricing for {capability_id}"));
        let input = Decimal::from(input_units)
            .checked_mul(capability.input_price_per_million)
            .ok_or_else(overflow)?;
        let output = Decimal::from(output_units)
            .checked_mul(capability.output_price_per_million)
            .ok_or_else(overflow)?;
        let dollars = input.checked_add(output).ok_or_else(overflow)? / dec!(1_000_000);
        let points = dollars
            .checked_mul(self.points_per_dollar)
            .ok_or_else(overflow)?
            .ceil();

        Ok(points.to_i64().ok_or_else(overflow)?.max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_is_valid() {
        let config = BillingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.catalog.plan("basic").unwrap().daily_points_limit, 708);
        assert_eq!(config.catalog.plan("premium").unwrap().daily_points_limit, 1200);
        assert_eq!(config.catalog.package("starter").unwrap().points, 3750);
    }

    #[test]
    fn test_free_capability_costs_nothing() {
        let config = BillingConfig::default();
        assert_eq!(config.points_cost("devstral-latest", 1_000_000, 1_000_000).unwrap(), 0);
    }

    #[test]
    fn test_cost_rounds_up_to_whole_points() {
        let config = BillingConfig::default();
        // 10k in * $5/M + 2k out * $25/M = $0.10 -> 50 points
        assert_eq!(config.points_cost("claude-opus-4.6", 10_000, 2_000).unwrap(), 50);
        // a single output unit still costs one point
        assert_eq!(config.points_cost("claude-opus-4.6", 0, 1).unwrap(), 1);
        assert_eq!(config.points_cost("claude-opus-4.6", 0, 0).unwrap(), 0);
    }

    #[test]
    fn test_cost_is_monotonic() {
        let config = BillingConfig::default();
        let mut last = 0;
        for units in (0..50_000).step_by(997) {
            let cost = config.points_cost("gpt-5.2", units, units / 2).unwrap();
            assert!(cost >= last);
            last = cost;
        }
    }

    #[test]
    fn test_unknown_capability_is_rejected() {
        let config = BillingConfig::default();
        assert!(matches!(
            config.points_cost("nope", 1, 1),
            Err(BillingError::UnknownCapability(_))
        ));
    }

    #[test]
    fn test_validation_rejects_duplicates_and_bad_limits() {
        let mut catalog = Catalog::default();
        catalog.plans.push(catalog.plans[0].clone());
        assert!(catalog.validate().is_err());

        let mut catalog = Catalog::default();
        catalog.packages[0].points = 0;
        assert!(catalog.validate().is_err());

        let config = BillingConfig {
            points_per_dollar: Decimal::ZERO,
            ..BillingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_catalog_json_shape() {
        let raw = r#"{
            "capabilities": [
                {"id": "m1", "name": "Model", "inputPricePerMillion": "1.5", "outputPricePerMillion": "3", "free": false}
            ],
            "plans": [{"id": "solo", "name": "Solo", "priceCents": 900, "dailyPointsLimit": 100}],
            "packages": [{"id": "tiny", "name": "Tiny", "points": 10, "priceCents": 100, "gatewayPriceId": "price_1"}]
        }"#;
        let catalog: Catalog = serde_json::from_str(raw).unwrap();
        catalog.validate().unwrap();
        assert_eq!(catalog.capability("m1").unwrap().input_price_per_million, dec!(1.5));
        assert_eq!(catalog.package("tiny").unwrap().gateway_price_id.as_deref(), Some("price_1"));
    }
}
