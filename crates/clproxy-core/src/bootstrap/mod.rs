use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use clproxy_common::GlobalConfig;

use crate::state::AppState;

#[derive(Debug, Clone, Parser)]
#[command(name = "clproxy", version, about = "A protocol-translating reverse proxy between the Claude Messages API and OpenAI-compatible providers")]
pub struct CliArgs {
    /// Path to the provider manager config document (spec §3). Falls back to
    /// `CONFIG_PATH` env, then to synthesizing a single provider from the
    /// legacy `OPENAI_*`/`BIG_MODEL`/... env vars.
    #[arg(long, env = "CONFIG_PATH")]
    pub config_path: Option<String>,
}

pub struct Bootstrap {
    pub config: GlobalConfig,
    pub state: Arc<AppState>,
}

/// Parses CLI/env, loads config, and builds the process-wide [`AppState`].
/// Does not install a tracing subscriber - callers decide how logs are
/// wired (stdout, file, etc.) before or after calling this.
pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args)
}

pub fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    if let Some(path) = sanitize_optional_env_value(args.config_path) {
        // SAFETY-equivalent: single-threaded startup, before any other code
        // reads this variable.
        unsafe { std::env::set_var("CONFIG_PATH", path) };
    }

    let config = clproxy_common::load().context("load configuration")?;
    let state = Arc::new(AppState::new(config.clone()));

    Ok(Bootstrap { config, state })
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Some PaaS systems inject unresolved placeholders like `${VAR}`; treat
    // them as "not set" rather than failing startup.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::sanitize_optional_env_value;

    #[test]
    fn blank_value_is_treated_as_unset() {
        assert_eq!(sanitize_optional_env_value(Some("   ".to_string())), None);
    }

    #[test]
    fn unresolved_placeholder_is_treated_as_unset() {
        assert_eq!(sanitize_optional_env_value(Some("${CONFIG_PATH}".to_string())), None);
    }

    #[test]
    fn real_value_passes_through_trimmed() {
        assert_eq!(
            sanitize_optional_env_value(Some("  config.json  ".to_string())),
            Some("config.json".to_string())
        );
    }
}
