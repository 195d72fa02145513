use std::sync::Arc;

use arc_swap::ArcSwap;

use clproxy_common::GlobalConfig;
use clproxy_provider_core::{ProviderManager, ProviderManagerConfig};

use crate::upstream_client::ReqwestUpstreamClient;

/// Process-wide shared state: the current config and the live Provider
/// Manager built from it. Config reloads (spec §4.7 `/api/config/reload`,
/// `PUT /api/config/providers`) swap both atomically; provider `toggle`
/// mutates the existing manager in place instead.
pub struct AppState {
    pub config: ArcSwap<GlobalConfig>,
    pub manager: ArcSwap<ProviderManager>,
}

impl AppState {
    pub fn new(config: GlobalConfig) -> Self {
        let manager = build_manager(&config.providers);
        Self {
            config: ArcSwap::from_pointee(config),
            manager: ArcSwap::from_pointee(manager),
        }
    }

    pub fn anthropic_api_key(&self) -> Option<String> {
        self.config.load().anthropic_api_key.clone()
    }

    pub fn token_bounds(&self) -> (u32, u32) {
        let config = self.config.load();
        (config.min_tokens_limit, config.max_tokens_limit)
    }

    pub fn manager(&self) -> Arc<ProviderManager> {
        self.manager.load_full()
    }

    /// Replaces the whole Provider Manager with one built from
    /// `providers` (spec §4.7: `PUT /api/config/providers` is a
    /// whole-document replace, never a partial merge). The old manager's
    /// health sweeper is shut down only after the swap, so in-flight
    /// requests holding the old `Arc` keep working until they finish.
    pub async fn replace_providers(&self, providers: ProviderManagerConfig) {
        let next = build_manager(&providers);
        let mut config = self.config.load().as_ref().clone();
        config.providers = providers;
        self.config.store(Arc::new(config));
        let previous = self.manager.swap(Arc::new(next));
        previous.shutdown().await;
    }

    pub async fn reload(&self, config: GlobalConfig) {
        let next = build_manager(&config.providers);
        self.config.store(Arc::new(config));
        let previous = self.manager.swap(Arc::new(next));
        previous.shutdown().await;
    }
}

fn build_manager(providers: &ProviderManagerConfig) -> ProviderManager {
    ProviderManager::new(
        providers.providers.clone(),
        providers.circuit_breaker,
        providers.fallback_strategy,
        providers.health_check_interval_secs,
        |config| {
            Arc::new(
                ReqwestUpstreamClient::new(config.clone())
                    .expect("provider http client configuration is always valid"),
            )
        },
    )
}
