use std::sync::Arc;

use rand::seq::SliceRandom;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{CircuitBreakerConfig, FallbackStrategy, ProviderConfig, SizeClass};
use crate::provider::UpstreamClient;
use crate::state::{ProviderState, ProviderStatus};

/// A provider/model pair returned by [`ProviderManager::pick`] or
/// [`ProviderManager::pick_next_in`], ready to dispatch a single attempt.
#[derive(Clone)]
pub struct Selection {
    pub provider: String,
    pub model: String,
    pub client: Arc<dyn UpstreamClient>,
}

/// Read-only view of one provider's live health, for admin/status surfaces.
#[derive(Debug, Clone)]
pub struct ProviderSnapshot {
    pub name: String,
    pub enabled: bool,
    pub status: ProviderStatus,
    pub failure_count: u32,
}

struct Inner {
    providers: Vec<ProviderState>,
}

struct Sweeper {
    handle: JoinHandle<()>,
    shutdown: tokio::sync::oneshot::Sender<()>,
}

/// Prioritized, failure-aware pool of upstream providers (spec §4.2).
///
/// Construction takes already-enabled, already env-resolved
/// [`ProviderConfig`]s - `${VAR}` substitution and the "missing env var for
/// an enabled provider fails construction" rule live in the config loader,
/// not here, since this crate has no opinion on where configuration bytes
/// come from.
pub struct ProviderManager {
    inner: Arc<Mutex<Inner>>,
    circuit_breaker: CircuitBreakerConfig,
    fallback_strategy: FallbackStrategy,
    health_check_interval: std::time::Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

impl ProviderManager {
    pub fn new(
        configs: Vec<ProviderConfig>,
        circuit_breaker: CircuitBreakerConfig,
        fallback_strategy: FallbackStrategy,
        health_check_interval_secs: u64,
        mut make_client: impl FnMut(&ProviderConfig) -> Arc<dyn UpstreamClient>,
    ) -> Self {
        // Disabled providers are kept (not filtered out) so an admin `toggle`
        // can re-enable them in place without rebuilding the manager.
        let providers = configs
            .into_iter()
            .map(|config| {
                let client = make_client(&config);
                ProviderState::new(config, client)
            })
            .collect();

        Self {
            inner: Arc::new(Mutex::new(Inner { providers })),
            circuit_breaker,
            fallback_strategy,
            health_check_interval: std::time::Duration::from_secs(health_check_interval_secs),
            sweeper: Mutex::new(None),
        }
    }

    /// Count of currently enabled providers, used only to bound fallback
    /// loops (spec §4.6: "bounded by distinct healthy provider count").
    pub async fn enabled_provider_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .providers
            .iter()
            .filter(|state| state.config.enabled)
            .count()
    }

    /// Flips a provider's `enabled` flag in place without touching its
    /// health status - `toggle(false)` then `toggle(true)` restores whatever
    /// status the provider already had (spec §8: restored only if it was
    /// healthy, since a `circuit_open` provider's status is left untouched
    /// by toggling either way). Returns `false` if no such provider exists.
    pub async fn toggle(&self, provider_name: &str, enabled: bool) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.providers.iter_mut().find(|state| state.config.name == provider_name) else {
            return false;
        };
        state.config.enabled = enabled;
        true
    }

    /// Current configs, in construction order - used to serve `GET
    /// /api/config/providers` without leaking live `ProviderState`.
    pub async fn configs(&self) -> Vec<ProviderConfig> {
        self.inner.lock().await.providers.iter().map(|state| state.config.clone()).collect()
    }

    /// Spec §4.2 `pick(size_class, exclude)`.
    pub async fn pick(&self, class: SizeClass, exclude: &[String]) -> Option<Selection> {
        self.ensure_sweeper_started();
        let mut inner = self.inner.lock().await;
        let mut candidate_indices: Vec<usize> = inner
            .providers
            .iter()
            .enumerate()
            .filter(|(_, state)| {
                state.is_selectable(class) && !exclude.iter().any(|name| name == &state.config.name)
            })
            .map(|(index, _)| index)
            .collect();

        if candidate_indices.is_empty() {
            return None;
        }

        order_candidates(&mut candidate_indices, &inner.providers, self.fallback_strategy);
        let index = candidate_indices[0];
        let state = &mut inner.providers[index];
        let model = state.peek_model(class)?.to_string();
        state.advance_cursor(class);

        Some(Selection {
            provider: state.config.name.clone(),
            model,
            client: state.client.clone(),
        })
    }

    /// Spec §4.2 `pick_next_in(provider_name, size_class)`: rotation within a
    /// single named provider, ignoring priority and fallback strategy.
    pub async fn pick_next_in(&self, provider_name: &str, class: SizeClass) -> Option<Selection> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .providers
            .iter_mut()
            .find(|state| state.config.name == provider_name)?;
        if !state.is_selectable(class) {
            return None;
        }
        let model = state.peek_model(class)?.to_string();
        state.advance_cursor(class);
        Some(Selection {
            provider: state.config.name.clone(),
            model,
            client: state.client.clone(),
        })
    }

    pub async fn mark_failure(&self, provider_name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner
            .providers
            .iter_mut()
            .find(|state| state.config.name == provider_name)
        {
            let was_open = state.status() == ProviderStatus::CircuitOpen;
            state.mark_failure(OffsetDateTime::now_utc(), self.circuit_breaker.failure_threshold);
            if !was_open && state.status() == ProviderStatus::CircuitOpen {
                tracing::warn!(provider = provider_name, "circuit opened after repeated failures");
            }
        }
    }

    pub async fn mark_success(&self, provider_name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner
            .providers
            .iter_mut()
            .find(|state| state.config.name == provider_name)
        {
            state.mark_success(OffsetDateTime::now_utc());
        }
    }

    pub async fn provider_snapshot(&self) -> Vec<ProviderSnapshot> {
        let inner = self.inner.lock().await;
        inner
            .providers
            .iter()
            .map(|state| ProviderSnapshot {
                name: state.config.name.clone(),
                enabled: state.config.enabled,
                status: state.status(),
                failure_count: state.failure_count(),
            })
            .collect()
    }

    /// Lazily starts the background health sweeper (spec §4.2: "wakes every
    /// `health_check_interval` seconds"). Idempotent - only the first
    /// selection after construction or after `shutdown` actually spawns it.
    fn ensure_sweeper_started(&self) {
        let Ok(mut guard) = self.sweeper.try_lock() else {
            // Another selection is concurrently starting the sweeper; that
            // caller will finish the job.
            return;
        };
        if guard.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let inner = self.inner.clone();
        let interval = self.health_check_interval;
        let recovery_timeout = TimeDuration::seconds(self.circuit_breaker.recovery_timeout_secs as i64);

        let handle = tokio::spawn(run_sweeper(inner, interval, recovery_timeout, shutdown_rx));

        *guard = Some(Sweeper {
            handle,
            shutdown: shutdown_tx,
        });
    }

    /// Cancels the health sweeper and awaits its termination without
    /// dropping any in-flight responses (spec §5 shutdown semantics) - the
    /// sweeper only touches `ProviderState` bookkeeping, never response
    /// streams, so cancelling it is always safe.
    pub async fn shutdown(&self) {
        let mut guard = self.sweeper.lock().await;
        if let Some(sweeper) = guard.take() {
            let _ = sweeper.shutdown.send(());
            let _ = sweeper.handle.await;
        }
    }
}

fn order_candidates(indices: &mut [usize], providers: &[ProviderState], strategy: FallbackStrategy) {
    match strategy {
        FallbackStrategy::Priority => {
            indices.sort_by(|&a, &b| {
                providers[a]
                    .config
                    .priority
                    .cmp(&providers[b].config.priority)
                    .then_with(|| providers[a].config.name.cmp(&providers[b].config.name))
            });
        }
        // Spec text distinguishes "pseudo-random" (round_robin) from
        // "uniform random" (random) permutations; both are implemented as a
        // uniform Fisher-Yates shuffle since no further distinction is
        // testable from the outside. See DESIGN.md.
        FallbackStrategy::RoundRobin | FallbackStrategy::Random => {
            indices.shuffle(&mut rand::rng());
        }
    }
}

async fn run_sweeper(
    inner: Arc<Mutex<Inner>>,
    interval_duration: std::time::Duration,
    recovery_timeout: TimeDuration,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval_duration);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = OffsetDateTime::now_utc();
                let mut guard = inner.lock().await;
                for state in guard.providers.iter_mut() {
                    if state.sweep_recovery(now, recovery_timeout) {
                        tracing::info!(provider = %state.config.name, "circuit recovered after cooldown");
                    }
                }
            }
            _ = &mut shutdown => {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use clproxy_protocol::openai::create_chat_completions::request::CreateChatCompletionRequest;
    use clproxy_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse;

    use super::*;
    use crate::config::ProviderModels;
    use crate::errors::ProviderResult;
    use crate::provider::ChatCompletionStream;

    struct StubClient;

    #[async_trait]
    impl UpstreamClient for StubClient {
        async fn complete(
            &self,
            _request_id: &str,
            _request: &CreateChatCompletionRequest,
        ) -> ProviderResult<CreateChatCompletionResponse> {
            unimplemented!()
        }

        async fn complete_stream(
            &self,
            _request_id: &str,
            _request: &CreateChatCompletionRequest,
        ) -> ProviderResult<ChatCompletionStream> {
            unimplemented!()
        }

        fn cancel(&self, _request_id: &str) {}
    }

    fn config(name: &str, priority: i32) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            enabled: true,
            priority,
            api_key: "key".to_string(),
            base_url: "https://example.com".to_string(),
            api_version: None,
            timeout_secs: 60,
            max_retries: 2,
            custom_headers: BTreeMap::new(),
            models: ProviderModels {
                big: vec!["gpt-4".to_string()],
                middle: vec![],
                small: vec![],
            },
        }
    }

    fn manager(configs: Vec<ProviderConfig>) -> ProviderManager {
        ProviderManager::new(
            configs,
            CircuitBreakerConfig::default(),
            FallbackStrategy::Priority,
            30,
            |_| Arc::new(StubClient),
        )
    }

    #[tokio::test]
    async fn pick_prefers_lower_priority_then_name() {
        let mgr = manager(vec![config("b", 1), config("a", 1), config("c", 0)]);
        let selection = mgr.pick(SizeClass::Big, &[]).await.unwrap();
        assert_eq!(selection.provider, "c");
    }

    #[tokio::test]
    async fn toggle_off_then_on_preserves_healthy_status() {
        let mgr = manager(vec![config("a", 0)]);
        assert!(mgr.toggle("a", false).await);
        assert!(mgr.pick(SizeClass::Big, &[]).await.is_none());
        assert!(mgr.toggle("a", true).await);
        let snapshot = mgr.provider_snapshot().await;
        assert_eq!(snapshot[0].status, ProviderStatus::Healthy);
    }

    #[tokio::test]
    async fn toggle_off_then_on_preserves_circuit_open_status() {
        let mgr = manager(vec![config("a", 0)]);
        mgr.mark_failure("a").await;
        mgr.mark_failure("a").await;
        mgr.mark_failure("a").await;
        let snapshot = mgr.provider_snapshot().await;
        assert_eq!(snapshot[0].status, ProviderStatus::CircuitOpen);

        mgr.toggle("a", false).await;
        mgr.toggle("a", true).await;
        let snapshot = mgr.provider_snapshot().await;
        assert_eq!(snapshot[0].status, ProviderStatus::CircuitOpen);
    }

    #[tokio::test]
    async fn pick_next_in_does_not_skip_providers() {
        let mgr = manager(vec![ProviderConfig {
            models: ProviderModels {
                big: vec!["a".to_string(), "b".to_string()],
                middle: vec![],
                small: vec![],
            },
            ..config("only", 0)
        }]);
        let first = mgr.pick_next_in("only", SizeClass::Big).await.unwrap();
        let second = mgr.pick_next_in("only", SizeClass::Big).await.unwrap();
        let third = mgr.pick_next_in("only", SizeClass::Big).await.unwrap();
        assert_eq!(first.model, "a");
        assert_eq!(second.model, "b");
        assert_eq!(third.model, "a");
    }
}
