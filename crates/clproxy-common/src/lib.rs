use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clproxy_provider_core::config::{
    CircuitBreakerConfig, FallbackStrategy, ProviderConfig, ProviderManagerConfig, ProviderModels,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    MissingEnvVar(#[from] clproxy_provider_core::config::MissingEnvVar),
    #[error("invalid value for {env_var}: {value}")]
    InvalidEnvValue { env_var: &'static str, value: String },
}

const DEFAULT_MAX_TOKENS_LIMIT: u32 = 512_000;
const DEFAULT_MIN_TOKENS_LIMIT: u32 = 100;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Final, process-wide configuration: server bind settings, token-clamping
/// bounds, and the Provider Manager's own config (spec §3, §6).
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub max_tokens_limit: u32,
    pub min_tokens_limit: u32,
    pub anthropic_api_key: Option<String>,
    pub providers: ProviderManagerConfig,
}

/// On-disk shape of the config file (spec §6: "a single JSON document
/// matching ProviderManagerConfig").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderManagerConfigDocument {
    pub providers: Vec<ProviderConfig>,
    #[serde(default = "default_fallback_strategy")]
    pub fallback_strategy: FallbackStrategy,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_fallback_strategy() -> FallbackStrategy {
    FallbackStrategy::Priority
}

fn default_health_check_interval_secs() -> u64 {
    30
}

impl From<ProviderManagerConfigDocument> for ProviderManagerConfig {
    fn from(doc: ProviderManagerConfigDocument) -> Self {
        Self {
            providers: doc.providers,
            fallback_strategy: doc.fallback_strategy,
            health_check_interval_secs: doc.health_check_interval_secs,
            circuit_breaker: doc.circuit_breaker,
        }
    }
}

/// Loads [`GlobalConfig`] from the process environment, per spec §6's
/// "Environment variables consumed" list.
///
/// If `CONFIG_PATH` names an existing file, it is parsed as a
/// [`ProviderManagerConfigDocument`]. Otherwise a single `openai` provider is
/// synthesized from `OPENAI_API_KEY`/`OPENAI_BASE_URL`/`AZURE_API_VERSION`/
/// `BIG_MODEL`/`MIDDLE_MODEL`/`SMALL_MODEL`/`CUSTOM_HEADER_*` - this keeps a
/// single-provider deployment usable without hand-writing a config file.
pub fn load() -> Result<GlobalConfig, ConfigError> {
    load_from_env(&EnvLookup)
}

trait Lookup {
    fn get(&self, key: &str) -> Option<String>;
}

struct EnvLookup;

impl Lookup for EnvLookup {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

fn load_from_env(env: &impl Lookup) -> Result<GlobalConfig, ConfigError> {
    let config_path = env.get("CONFIG_PATH").unwrap_or_else(|| "config.json".to_string());
    let document = if Path::new(&config_path).is_file() {
        read_document(Path::new(&config_path))?
    } else {
        synthesize_document(env)
    };

    let resolved_providers = document
        .providers
        .into_iter()
        .map(|config| config.resolve_env(&|var| env.get(var)))
        .collect::<Result<Vec<_>, _>>()?;

    let providers = ProviderManagerConfig {
        providers: resolved_providers,
        fallback_strategy: document.fallback_strategy,
        health_check_interval_secs: document.health_check_interval_secs,
        circuit_breaker: document.circuit_breaker,
    };

    Ok(GlobalConfig {
        host: env.get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
        port: parse_env(env, "PORT", 8082)?,
        log_level: env.get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        max_tokens_limit: parse_env(env, "MAX_TOKENS_LIMIT", DEFAULT_MAX_TOKENS_LIMIT)?,
        min_tokens_limit: parse_env(env, "MIN_TOKENS_LIMIT", DEFAULT_MIN_TOKENS_LIMIT)?,
        anthropic_api_key: env.get("ANTHROPIC_API_KEY"),
        providers,
    })
}

fn read_document(path: &Path) -> Result<ProviderManagerConfigDocument, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn synthesize_document(env: &impl Lookup) -> ProviderManagerConfigDocument {
    let mut custom_headers = BTreeMap::new();
    for (key, value) in std::env::vars() {
        if let Some(suffix) = key.strip_prefix("CUSTOM_HEADER_") {
            let header_name = suffix.to_ascii_lowercase().replace('_', "-");
            custom_headers.insert(header_name, value);
        }
    }

    let provider = ProviderConfig {
        name: "openai".to_string(),
        enabled: true,
        priority: 0,
        api_key: env.get("OPENAI_API_KEY").unwrap_or_default(),
        base_url: env
            .get("OPENAI_BASE_URL")
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        api_version: env.get("AZURE_API_VERSION"),
        timeout_secs: parse_env(env, "REQUEST_TIMEOUT", DEFAULT_REQUEST_TIMEOUT_SECS).unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        max_retries: parse_env(env, "MAX_RETRIES", DEFAULT_MAX_RETRIES).unwrap_or(DEFAULT_MAX_RETRIES),
        custom_headers,
        models: ProviderModels {
            big: env.get("BIG_MODEL").into_iter().collect(),
            middle: env.get("MIDDLE_MODEL").into_iter().collect(),
            small: env.get("SMALL_MODEL").into_iter().collect(),
        },
    };

    ProviderManagerConfigDocument {
        providers: vec![provider],
        fallback_strategy: FallbackStrategy::Priority,
        health_check_interval_secs: default_health_check_interval_secs(),
        circuit_breaker: CircuitBreakerConfig::default(),
    }
}

fn parse_env<T>(env: &impl Lookup, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env.get(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidEnvValue { env_var: key, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapLookup(HashMap<&'static str, &'static str>);

    impl Lookup for MapLookup {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(key).map(|v| v.to_string())
        }
    }

    #[test]
    fn synthesizes_single_provider_from_legacy_env_vars() {
        let mut map = HashMap::new();
        map.insert("OPENAI_API_KEY", "sk-test");
        map.insert("OPENAI_BASE_URL", "https://example.com/v1");
        map.insert("BIG_MODEL", "gpt-4o");
        map.insert("PORT", "9000");
        let env = MapLookup(map);

        let config = load_from_env(&env).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.providers.providers.len(), 1);
        let provider = &config.providers.providers[0];
        assert_eq!(provider.api_key, "sk-test");
        assert_eq!(provider.models.big, vec!["gpt-4o".to_string()]);
    }

    #[test]
    fn defaults_are_applied_without_any_env() {
        let env = MapLookup(HashMap::new());
        let config = load_from_env(&env).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8082);
        assert_eq!(config.max_tokens_limit, DEFAULT_MAX_TOKENS_LIMIT);
    }
}
