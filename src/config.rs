use std::time::Duration;

use anyhow::Context;

use crate::qa::DEFAULT_CONTEXT_BUDGET_BYTES;

/// Runtime configuration, loaded from the environment. Every field has a
/// default except the credentials, which stay optional: without a GitHub
/// token the fetcher runs unauthenticated, without an OpenAI key the ask
/// endpoint fails upstream.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub environment: String,
    pub github_token: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_api_url: Option<String>,
    pub max_concurrent_analyses: usize,
    pub stage_timeout: Duration,
    pub stage_max_attempts: u32,
    pub stage_retry_backoff: Duration,
    pub ask_timeout: Duration,
    pub context_budget_bytes: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_path = get("DATABASE_URL")
            .map(|url| strip_sqlite_scheme(&url).to_string())
            .unwrap_or_else(|| "repolens.db".to_string());

        Ok(Self {
            database_path,
            port: parse_or(&get, "PORT", 8080)?,
            environment: get("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            github_token: get("GITHUB_TOKEN").filter(|t| !t.is_empty()),
            openai_api_key: get("OPENAI_API_KEY").filter(|k| !k.is_empty()),
            openai_model: get("OPENAI_MODEL")
                .unwrap_or_else(|| crate::llm::DEFAULT_OPENAI_MODEL.to_string()),
            openai_api_url: get("OPENAI_API_URL").filter(|u| !u.is_empty()),
            max_concurrent_analyses: parse_or(&get, "MAX_CONCURRENT_ANALYSES", 4usize)?.max(1),
            stage_timeout: Duration::from_secs(parse_or(&get, "STAGE_TIMEOUT_SECS", 60u64)?),
            stage_max_attempts: parse_or(&get, "STAGE_MAX_ATTEMPTS", 3u32)?.max(1),
            stage_retry_backoff: Duration::from_secs(parse_or(
                &get,
                "STAGE_RETRY_BACKOFF_SECS",
                2u64,
            )?),
            ask_timeout: Duration::from_secs(parse_or(&get, "ASK_TIMEOUT_SECS", 30u64)?),
            context_budget_bytes: parse_or(
                &get,
                "CONTEXT_BUDGET_BYTES",
                DEFAULT_CONTEXT_BUDGET_BYTES,
            )?,
        })
    }

    pub fn is_development(&self) -> bool {
        self.environment != "production"
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has invalid value {:?}", key, raw)),
        None => Ok(default),
    }
}

fn strip_sqlite_scheme(url: &str) -> &str {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_apply_without_env() {
        let config = config_with(&[]).unwrap();
        assert_eq!(config.database_path, "repolens.db");
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_concurrent_analyses, 4);
        assert_eq!(config.stage_timeout, Duration::from_secs(60));
        assert!(config.github_token.is_none());
        assert!(config.is_development());
    }

    #[test]
    fn test_sqlite_scheme_is_stripped() {
        let config = config_with(&[("DATABASE_URL", "sqlite:///var/lib/jobs.db")]).unwrap();
        assert_eq!(config.database_path, "/var/lib/jobs.db");
        let config = config_with(&[("DATABASE_URL", "jobs.db")]).unwrap();
        assert_eq!(config.database_path, "jobs.db");
    }

    #[test]
    fn test_production_environment() {
        let config = config_with(&[("ENVIRONMENT", "production")]).unwrap();
        assert!(!config.is_development());
    }

    #[test]
    fn test_invalid_port_is_an_error() {
        let err = config_with(&[("PORT", "not-a-port")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn test_empty_credentials_count_as_absent() {
        let config = config_with(&[("GITHUB_TOKEN", ""), ("OPENAI_API_KEY", "")]).unwrap();
        assert!(config.github_token.is_none());
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn test_concurrency_floor_is_one() {
        let config = config_with(&[("MAX_CONCURRENT_ANALYSES", "0")]).unwrap();
        assert_eq!(config.max_concurrent_analyses, 1);
    }
}
