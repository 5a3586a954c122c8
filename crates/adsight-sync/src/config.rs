//! Environment-driven engine configuration. A variable that is present but
//! unparseable is a startup error, never silently replaced with a default.

use std::time::Duration;

use adsight_core::EntityLevel;
use adsight_storage::BackoffPolicy;

pub const DEFAULT_ACCOUNT_ID: &str = "7414394764";

#[derive(Debug, thiserror::Error)]
#[error("invalid value for {var}: '{value}' ({reason})")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

/// Background re-embed loop settings.
#[derive(Debug, Clone)]
pub struct ReembedConfig {
    pub enabled: bool,
    pub cron: String,
    pub limit: usize,
    pub max_age: Duration,
    pub entity_type: Option<EntityLevel>,
    pub scope_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub default_account: String,
    /// Concurrent provider fetches per reconcile invocation.
    pub day_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub reembed: ReembedConfig,
}

fn parse_number<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError {
            var,
            value,
            reason: "expected an unsigned integer".into(),
        }),
    }
}

fn parse_flag(var: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::trim) {
        None => Ok(default),
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" || v.eq_ignore_ascii_case("yes") => {
            Ok(true)
        }
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" || v.eq_ignore_ascii_case("no") => {
            Ok(false)
        }
        Some(_) => Err(ConfigError {
            var,
            value: raw.unwrap_or_default(),
            reason: "expected true/false".into(),
        }),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let default_account =
            lookup("ADSIGHT_DEFAULT_ACCOUNT").unwrap_or_else(|| DEFAULT_ACCOUNT_ID.to_string());

        let day_concurrency =
            parse_number("ADSIGHT_DAY_CONCURRENCY", lookup("ADSIGHT_DAY_CONCURRENCY"), 4usize)?;
        if day_concurrency == 0 {
            return Err(ConfigError {
                var: "ADSIGHT_DAY_CONCURRENCY",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let fetch_attempts =
            parse_number("ADSIGHT_FETCH_ATTEMPTS", lookup("ADSIGHT_FETCH_ATTEMPTS"), 3usize)?;
        if fetch_attempts == 0 {
            return Err(ConfigError {
                var: "ADSIGHT_FETCH_ATTEMPTS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let enabled =
            parse_flag("ADSIGHT_REEMBED_ENABLED", lookup("ADSIGHT_REEMBED_ENABLED"), false)?;
        let cron = lookup("ADSIGHT_REEMBED_CRON").unwrap_or_else(|| "0 0 * * * *".to_string());

        let limit =
            parse_number("ADSIGHT_REEMBED_LIMIT", lookup("ADSIGHT_REEMBED_LIMIT"), 200usize)?;
        let max_age_hours = parse_number(
            "ADSIGHT_REEMBED_MAX_AGE_HOURS",
            lookup("ADSIGHT_REEMBED_MAX_AGE_HOURS"),
            24u64,
        )?;
        if enabled && (limit == 0 || max_age_hours == 0) {
            return Err(ConfigError {
                var: "ADSIGHT_REEMBED_LIMIT",
                value: format!("limit={limit} max_age_hours={max_age_hours}"),
                reason: "re-embed loop enabled with a zero limit or max age".into(),
            });
        }

        let entity_type = match lookup("ADSIGHT_REEMBED_ENTITY_TYPE") {
            None => None,
            Some(value) => Some(value.parse::<EntityLevel>().map_err(|e| ConfigError {
                var: "ADSIGHT_REEMBED_ENTITY_TYPE",
                value,
                reason: e.to_string(),
            })?),
        };

        Ok(Self {
            default_account,
            day_concurrency,
            backoff: BackoffPolicy {
                max_attempts: fetch_attempts,
                ..BackoffPolicy::default()
            },
            reembed: ReembedConfig {
                enabled,
                cron,
                limit,
                max_age: Duration::from_secs(max_age_hours * 3600),
                entity_type,
                scope_id: lookup("ADSIGHT_REEMBED_SCOPE_ID"),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&'a str, &'a str> = pairs.iter().copied().collect();
        move |var| map.get(var).map(|v| v.to_string())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = SyncConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.default_account, DEFAULT_ACCOUNT_ID);
        assert_eq!(config.day_concurrency, 4);
        assert_eq!(config.backoff.max_attempts, 3);
        assert!(!config.reembed.enabled);
        assert_eq!(config.reembed.limit, 200);
        assert_eq!(config.reembed.max_age, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn unparseable_number_is_an_error_not_a_default() {
        let err = SyncConfig::from_lookup(lookup_from(&[("ADSIGHT_DAY_CONCURRENCY", "four")]))
            .unwrap_err();
        assert_eq!(err.var, "ADSIGHT_DAY_CONCURRENCY");
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(SyncConfig::from_lookup(lookup_from(&[("ADSIGHT_DAY_CONCURRENCY", "0")])).is_err());
    }

    #[test]
    fn enabled_reembed_with_zero_limit_is_rejected() {
        let err = SyncConfig::from_lookup(lookup_from(&[
            ("ADSIGHT_REEMBED_ENABLED", "true"),
            ("ADSIGHT_REEMBED_LIMIT", "0"),
        ]))
        .unwrap_err();
        assert!(err.reason.contains("zero limit"));
    }

    #[test]
    fn entity_type_filter_parses() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("ADSIGHT_REEMBED_ENTITY_TYPE", "keyword"),
            ("ADSIGHT_REEMBED_SCOPE_ID", "7414394764"),
        ]))
        .unwrap();
        assert_eq!(config.reembed.entity_type, Some(EntityLevel::Keyword));
        assert_eq!(config.reembed.scope_id.as_deref(), Some("7414394764"));

        assert!(SyncConfig::from_lookup(lookup_from(&[(
            "ADSIGHT_REEMBED_ENTITY_TYPE",
            "banner"
        )]))
        .is_err());
    }

    #[test]
    fn unrecognized_flag_value_is_rejected() {
        assert!(
            SyncConfig::from_lookup(lookup_from(&[("ADSIGHT_REEMBED_ENABLED", "enabled")]))
                .is_err()
        );
    }
}
