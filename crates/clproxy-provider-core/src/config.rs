use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Which bucket an inbound model name routes to (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    Middle,
    Big,
}

impl SizeClass {
    pub const ALL: [SizeClass; 3] = [SizeClass::Small, SizeClass::Middle, SizeClass::Big];
}

/// Static, JSON-loaded configuration for one upstream provider (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub priority: i32,
    pub api_key: String,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,
    pub models: ProviderModels,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderModels {
    #[serde(default)]
    pub big: Vec<String>,
    #[serde(default)]
    pub middle: Vec<String>,
    #[serde(default)]
    pub small: Vec<String>,
}

impl ProviderModels {
    pub fn for_class(&self, class: SizeClass) -> &[String] {
        match class {
            SizeClass::Big => &self.big,
            SizeClass::Middle => &self.middle,
            SizeClass::Small => &self.small,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    Priority,
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderManagerConfig {
    pub providers: Vec<ProviderConfig>,
    pub fallback_strategy: FallbackStrategy,
    pub health_check_interval_secs: u64,
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Error produced when an enabled provider references an environment
/// variable that is not set (spec §4.2 Construction).
#[derive(Debug, Clone)]
pub struct MissingEnvVar {
    pub provider: String,
    pub variable: String,
}

impl std::fmt::Display for MissingEnvVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "provider '{}' references unset environment variable '{}'",
            self.provider, self.variable
        )
    }
}

impl std::error::Error for MissingEnvVar {}

impl ProviderConfig {
    /// Resolves `${VAR}` placeholders in `api_key`, `base_url`, and
    /// `custom_headers` values against `lookup`. Disabled providers are
    /// returned unresolved and unvalidated - only enabled providers must
    /// resolve cleanly (spec §4.2: "missing env var for an enabled provider
    /// fails construction").
    pub fn resolve_env(&self, lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, MissingEnvVar> {
        if !self.enabled {
            return Ok(self.clone());
        }

        let mut resolved = self.clone();
        resolved.api_key = substitute(&self.name, &self.api_key, lookup)?;
        resolved.base_url = substitute(&self.name, &self.base_url, lookup)?;
        let mut headers = BTreeMap::new();
        for (key, value) in &self.custom_headers {
            headers.insert(key.clone(), substitute(&self.name, value, lookup)?);
        }
        resolved.custom_headers = headers;
        Ok(resolved)
    }
}

fn substitute(
    provider_name: &str,
    template: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<String, MissingEnvVar> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            out.push_str(rest);
            return Ok(out);
        };
        out.push_str(&rest[..start]);
        let var_name = &rest[start + 2..start + end];
        let value = lookup(var_name).ok_or_else(|| MissingEnvVar {
            provider: provider_name.to_string(),
            variable: var_name.to_string(),
        })?;
        out.push_str(&value);
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProviderConfig {
        ProviderConfig {
            name: "openai".to_string(),
            enabled: true,
            priority: 0,
            api_key: "${OPENAI_API_KEY}".to_string(),
            base_url: "https://api.openai.com".to_string(),
            api_version: None,
            timeout_secs: 60,
            max_retries: 2,
            custom_headers: BTreeMap::new(),
            models: ProviderModels::default(),
        }
    }

    #[test]
    fn resolves_present_var() {
        let config = sample();
        let resolved = config
            .resolve_env(&|name| (name == "OPENAI_API_KEY").then(|| "sk-test".to_string()))
            .unwrap();
        assert_eq!(resolved.api_key, "sk-test");
    }

    #[test]
    fn fails_on_missing_var_when_enabled() {
        let config = sample();
        let err = config.resolve_env(&|_| None).unwrap_err();
        assert_eq!(err.variable, "OPENAI_API_KEY");
    }

    #[test]
    fn skips_resolution_when_disabled() {
        let mut config = sample();
        config.enabled = false;
        let resolved = config.resolve_env(&|_| None).unwrap();
        assert_eq!(resolved.api_key, "${OPENAI_API_KEY}");
    }
}
