use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::config::{ProviderConfig, SizeClass};
use crate::provider::UpstreamClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Healthy,
    Unhealthy,
    CircuitOpen,
}

/// Per-size-class rotation cursors (spec §3: `next_index[c] in [0, |models[c]|)`).
#[derive(Debug, Clone, Copy, Default)]
pub struct RotationCursors {
    small: usize,
    middle: usize,
    big: usize,
}

impl RotationCursors {
    fn get(&self, class: SizeClass) -> usize {
        match class {
            SizeClass::Small => self.small,
            SizeClass::Middle => self.middle,
            SizeClass::Big => self.big,
        }
    }

    fn set(&mut self, class: SizeClass, value: usize) {
        match class {
            SizeClass::Small => self.small = value,
            SizeClass::Middle => self.middle = value,
            SizeClass::Big => self.big = value,
        }
    }
}

/// Live, mutable state for one enabled provider (spec §3).
///
/// All mutation happens through `&mut self` behind whatever serialization the
/// owning Provider Manager imposes (a single mutex or actor mailbox per
/// spec §5) - this type itself holds no internal locking.
pub struct ProviderState {
    pub config: ProviderConfig,
    pub client: Arc<dyn UpstreamClient>,
    status: ProviderStatus,
    failure_count: u32,
    last_failure_time: Option<OffsetDateTime>,
    last_success_time: Option<OffsetDateTime>,
    cursors: RotationCursors,
}

impl ProviderState {
    pub fn new(config: ProviderConfig, client: Arc<dyn UpstreamClient>) -> Self {
        Self {
            config,
            client,
            status: ProviderStatus::Healthy,
            failure_count: 0,
            last_failure_time: None,
            last_success_time: None,
            cursors: RotationCursors::default(),
        }
    }

    pub fn status(&self) -> ProviderStatus {
        self.status
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_time(&self) -> Option<OffsetDateTime> {
        self.last_failure_time
    }

    pub fn last_success_time(&self) -> Option<OffsetDateTime> {
        self.last_success_time
    }

    /// Only `healthy` providers are selectable - a provider that has taken a
    /// failure but not yet tripped the circuit (`unhealthy`) is excluded too,
    /// not just `circuit_open` ones. Only `mark_success` clears `unhealthy`.
    pub fn is_selectable(&self, class: SizeClass) -> bool {
        self.config.enabled
            && self.status == ProviderStatus::Healthy
            && !self.config.models.for_class(class).is_empty()
    }

    /// Current rotation cursor's model for `class`, or `None` if the list is
    /// empty. Does not advance the cursor; callers advance via
    /// `advance_cursor` only after a selection is committed.
    pub fn peek_model(&self, class: SizeClass) -> Option<&str> {
        let models = self.config.models.for_class(class);
        if models.is_empty() {
            return None;
        }
        let index = self.cursors.get(class) % models.len();
        models.get(index).map(String::as_str)
    }

    pub fn advance_cursor(&mut self, class: SizeClass) {
        let models = self.config.models.for_class(class);
        if models.is_empty() {
            return;
        }
        let next = (self.cursors.get(class) + 1) % models.len();
        self.cursors.set(class, next);
    }

    /// Spec §4.2 `mark_failure`: increments the failure count, timestamps the
    /// failure, and opens the circuit once `failure_threshold` is reached.
    pub fn mark_failure(&mut self, now: OffsetDateTime, failure_threshold: u32) {
        self.failure_count += 1;
        self.last_failure_time = Some(now);
        self.status = if self.failure_count >= failure_threshold {
            ProviderStatus::CircuitOpen
        } else {
            ProviderStatus::Unhealthy
        };
    }

    /// Spec §4.2 `mark_success`: only a successful request rehabilitates a
    /// provider back to `healthy` with a zeroed failure count.
    pub fn mark_success(&mut self, now: OffsetDateTime) {
        self.failure_count = 0;
        self.last_success_time = Some(now);
        self.status = ProviderStatus::Healthy;
    }

    /// Spec §4.2 health sweep: a `circuit_open` provider whose
    /// `recovery_timeout` has elapsed becomes `healthy` again.
    /// `unhealthy` providers are left alone - only `mark_success` clears them.
    pub fn sweep_recovery(&mut self, now: OffsetDateTime, recovery_timeout: time::Duration) -> bool {
        if self.status != ProviderStatus::CircuitOpen {
            return false;
        }
        let Some(last_failure) = self.last_failure_time else {
            return false;
        };
        if now - last_failure >= recovery_timeout {
            self.status = ProviderStatus::Healthy;
            self.failure_count = 0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderModels;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct StubClient;

    #[async_trait::async_trait]
    impl crate::provider::UpstreamClient for StubClient {
        async fn complete(
            &self,
            _request_id: &str,
            _request: &clproxy_protocol::openai::create_chat_completions::request::CreateChatCompletionRequest,
        ) -> ProviderResultAlias {
            unimplemented!()
        }

        async fn complete_stream(
            &self,
            _request_id: &str,
            _request: &clproxy_protocol::openai::create_chat_completions::request::CreateChatCompletionRequest,
        ) -> crate::errors::ProviderResult<crate::provider::ChatCompletionStream> {
            unimplemented!()
        }

        fn cancel(&self, _request_id: &str) {}
    }

    type ProviderResultAlias = crate::errors::ProviderResult<
        clproxy_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse,
    >;

    fn state_with_threshold_models() -> ProviderState {
        let config = ProviderConfig {
            name: "openai".to_string(),
            enabled: true,
            priority: 0,
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
        };
        ProviderState::new(config, Arc::new(StubClient))
    }

    #[test]
    fn circuit_opens_exactly_at_threshold() {
        let mut state = state_with_threshold_models();
        let now = OffsetDateTime::now_utc();
        state.mark_failure(now, 3);
        assert_eq!(state.status(), ProviderStatus::Unhealthy);
        state.mark_failure(now, 3);
        assert_eq!(state.status(), ProviderStatus::Unhealthy);
        state.mark_failure(now, 3);
        assert_eq!(state.status(), ProviderStatus::CircuitOpen);
    }

    #[test]
    fn recovers_only_after_timeout_elapses() {
        let mut state = state_with_threshold_models();
        let now = OffsetDateTime::now_utc();
        state.mark_failure(now, 1);
        assert_eq!(state.status(), ProviderStatus::CircuitOpen);

        let too_soon = now + time::Duration::seconds(5);
        assert!(!state.sweep_recovery(too_soon, time::Duration::seconds(30)));
        assert_eq!(state.status(), ProviderStatus::CircuitOpen);

        let after = now + time::Duration::seconds(31);
        assert!(state.sweep_recovery(after, time::Duration::seconds(30)));
        assert_eq!(state.status(), ProviderStatus::Healthy);
        assert_eq!(state.failure_count(), 0);
    }

    #[test]
    fn unhealthy_is_not_cleared_by_sweep() {
        let mut state = state_with_threshold_models();
        let now = OffsetDateTime::now_utc();
        state.mark_failure(now, 5);
        assert_eq!(state.status(), ProviderStatus::Unhealthy);
        let later = now + time::Duration::seconds(600);
        assert!(!state.sweep_recovery(later, time::Duration::seconds(30)));
        assert_eq!(state.status(), ProviderStatus::Unhealthy);
    }

    #[test]
    fn rotation_cursor_wraps() {
        let mut state = state_with_threshold_models();
        assert_eq!(state.peek_model(SizeClass::Big), Some("gpt-4"));
        state.advance_cursor(SizeClass::Big);
        assert_eq!(state.peek_model(SizeClass::Big), Some("gpt-4"));
        assert_eq!(state.peek_model(SizeClass::Small), None);
    }

    #[test]
    fn unhealthy_provider_is_not_selectable() {
        let mut state = state_with_threshold_models();
        assert!(state.is_selectable(SizeClass::Big));
        state.mark_failure(OffsetDateTime::now_utc(), 3);
        assert_eq!(state.status(), ProviderStatus::Unhealthy);
        assert!(!state.is_selectable(SizeClass::Big));
    }
}
