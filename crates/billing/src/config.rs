//! Billing engine configuration

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Soft features that get a grace window after a downgrade. Anything else is
/// capped immediately once the downgrade applies.
pub const DEFAULT_GRACE_FEATURES: &[&str] = &["accounts", "custom_categories", "recurring_payments"];

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Days over-limit resources stay usable after a downgrade takes effect.
    pub grace_period_days: i64,
    /// Warning emails go out when the grace period ends within this many days.
    pub grace_warning_days: i64,
    /// Length of a paid billing period.
    pub billing_period_days: i64,
    pub plan_cache_ttl: Duration,
    pub grace_features: BTreeSet<String>,
    /// Upper bound on a single best-effort notification send.
    pub notification_timeout: Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            grace_period_days: 7,
            grace_warning_days: 2,
            billing_period_days: 30,
            plan_cache_ttl: Duration::from_secs(300),
            grace_features: DEFAULT_GRACE_FEATURES.iter().map(|s| s.to_string()).collect(),
            notification_timeout: Duration::from_secs(10),
        }
    }
}

impl BillingConfig {
    /// Load from environment variables, falling back to defaults
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let grace_features = match std::env::var("GRACE_FEATURES") {
            Ok(raw) => parse_feature_list(&raw),
            Err(_) => defaults.grace_features,
        };

        let config = Self {
            grace_period_days: env_parse("GRACE_PERIOD_DAYS", defaults.grace_period_days)?,
            grace_warning_days: env_parse("GRACE_WARNING_DAYS", defaults.grace_warning_days)?,
            billing_period_days: env_parse("BILLING_PERIOD_DAYS", defaults.billing_period_days)?,
            plan_cache_ttl: Duration::from_secs(env_parse(
                "PLAN_CACHE_TTL_SECS",
                defaults.plan_cache_ttl.as_secs(),
            )?),
            grace_features,
            notification_timeout: Duration::from_secs(env_parse(
                "NOTIFICATION_TIMEOUT_SECS",
                defaults.notification_timeout.as_secs(),
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BillingResult<()> {
        if self.billing_period_days <= 0 {
            return Err(BillingError::Config(
                "BILLING_PERIOD_DAYS must be positive".to_string(),
            ));
        }
        if self.grace_period_days < 0 || self.grace_warning_days < 0 {
            return Err(BillingError::Config(
                "Grace period settings must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn has_grace_period(&self, feature_code: &str) -> bool {
        self.grace_features.contains(feature_code)
    }
}

fn parse_feature_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value '{}'", key, value))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BillingConfig::default();
        assert_eq!(config.grace_period_days, 7);
        assert_eq!(config.grace_warning_days, 2);
        assert_eq!(config.billing_period_days, 30);
        assert!(config.has_grace_period("accounts"));
        assert!(!config.has_grace_period("goals"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_feature_list() {
        let set = parse_feature_list(" accounts, goals ,,loans");
        assert_eq!(set.len(), 3);
        assert!(set.contains("goals"));
    }

    #[test]
    fn test_validate_rejects_zero_period() {
        let config = BillingConfig {
            billing_period_days: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BillingError::Config(_))));
    }
}
