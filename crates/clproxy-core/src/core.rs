use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use uuid::Uuid;

use clproxy_protocol::claude::create_message::{
    CreateMessageRequest as ClaudeRequest, CreateMessageResponse as ClaudeResponse,
};
use clproxy_protocol::claude::create_message::stream::StreamEvent;
use clproxy_protocol::openai::create_chat_completions::request::CreateChatCompletionRequest;
use clproxy_provider_core::{classify_model, ProviderManager};
use clproxy_transform::generate_content::{transform_request, transform_response, StreamTranslator};

use crate::error::{ErrorKind, ProxyError};

/// Orchestrates one inbound request end to end (spec §4.6): model routing,
/// translation, provider selection, the retry-then-fallback ladder, and
/// (for streaming) the first-byte cutoff past which no further fallback is
/// attempted.
pub struct FallbackController {
    manager: Arc<ProviderManager>,
    token_bounds: (u32, u32),
}

impl FallbackController {
    pub fn new(manager: Arc<ProviderManager>, token_bounds: (u32, u32)) -> Self {
        Self { manager, token_bounds }
    }

    fn clamp_max_tokens(&self, request: &ClaudeRequest) -> ClaudeRequest {
        let (min, max) = self.token_bounds;
        let mut request = request.clone();
        request.max_tokens = request.max_tokens.clamp(min, max);
        request
    }

    pub async fn handle_unary(
        &self,
        request: &ClaudeRequest,
        disconnected: &mut dyn FnMut() -> bool,
    ) -> Result<ClaudeResponse, ProxyError> {
        let request = self.clamp_max_tokens(request);
        let request = &request;
        let request_id = Uuid::new_v4().to_string();
        let class = classify_model(&request.model);
        let mut excluded: Vec<String> = Vec::new();
        let mut last_error: Option<ProxyError> = None;
        let attempt_bound = self.manager.enabled_provider_count().await.max(1);

        for _ in 0..attempt_bound {
            if disconnected() {
                return Err(ProxyError::client_disconnect());
            }

            let Some(selection) = self.manager.pick(class, &excluded).await else {
                return Err(last_error.unwrap_or_else(|| ProxyError::no_provider("no healthy provider available")));
            };

            let openai_request = transform_request(request, selection.model.clone());
            match selection.client.complete(&request_id, &openai_request).await {
                Ok(response) => {
                    self.manager.mark_success(&selection.provider).await;
                    return Ok(transform_response(response, selection.model));
                }
                Err(err) => {
                    let proxy_err = ProxyError::from(err);
                    if !is_fallback_eligible(&proxy_err) {
                        return Err(proxy_err);
                    }

                    if let Some(retry) = self.manager.pick_next_in(&selection.provider, class).await {
                        if disconnected() {
                            return Err(ProxyError::client_disconnect());
                        }
                        let retry_request = transform_request(request, retry.model.clone());
                        match retry.client.complete(&request_id, &retry_request).await {
                            Ok(response) => {
                                self.manager.mark_success(&selection.provider).await;
                                return Ok(transform_response(response, retry.model));
                            }
                            Err(retry_err) => {
                                self.manager.mark_failure(&selection.provider).await;
                                let retry_proxy_err = ProxyError::from(retry_err);
                                if !is_fallback_eligible(&retry_proxy_err) {
                                    return Err(retry_proxy_err);
                                }
                                last_error = Some(retry_proxy_err);
                            }
                        }
                    } else {
                        self.manager.mark_failure(&selection.provider).await;
                        last_error = Some(proxy_err);
                    }
                    excluded.push(selection.provider);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProxyError::no_provider("fallback attempts exhausted")))
    }

    /// Returns a stream of Claude SSE events once the first upstream chunk
    /// has actually been read - the error cases that can still fall back to
    /// another provider are resolved here, before this function returns.
    /// Anything that fails once the returned stream is polled is handled
    /// inside the stream itself (spec §7: no fallback past the first byte).
    pub async fn handle_stream(
        &self,
        request: &ClaudeRequest,
        disconnected: &mut dyn FnMut() -> bool,
    ) -> Result<impl Stream<Item = StreamEvent> + Send + 'static, ProxyError> {
        let request = self.clamp_max_tokens(request);
        let request = &request;
        let request_id = Uuid::new_v4().to_string();
        let class = classify_model(&request.model);
        let mut excluded: Vec<String> = Vec::new();
        let mut last_error: Option<ProxyError> = None;
        let attempt_bound = self.manager.enabled_provider_count().await.max(1);

        for _ in 0..attempt_bound {
            if disconnected() {
                return Err(ProxyError::client_disconnect());
            }

            let Some(selection) = self.manager.pick(class, &excluded).await else {
                return Err(last_error.unwrap_or_else(|| ProxyError::no_provider("no healthy provider available")));
            };

            let openai_request = transform_request(request, selection.model.clone());
            match self.try_start_stream(&request_id, &selection.provider, selection.model.clone(), selection.client.clone(), &openai_request).await {
                StreamAttempt::Started(stream) => return Ok(stream),
                StreamAttempt::Failed(proxy_err) => {
                    if !is_fallback_eligible(&proxy_err) {
                        return Err(proxy_err);
                    }

                    if let Some(retry) = self.manager.pick_next_in(&selection.provider, class).await {
                        let retry_request = transform_request(request, retry.model.clone());
                        match self
                            .try_start_stream(&request_id, &selection.provider, retry.model, retry.client, &retry_request)
                            .await
                        {
                            StreamAttempt::Started(stream) => return Ok(stream),
                            StreamAttempt::Failed(retry_err) => {
                                self.manager.mark_failure(&selection.provider).await;
                                if !is_fallback_eligible(&retry_err) {
                                    return Err(retry_err);
                                }
                                last_error = Some(retry_err);
                            }
                        }
                    } else {
                        self.manager.mark_failure(&selection.provider).await;
                        last_error = Some(proxy_err);
                    }
                    excluded.push(selection.provider);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProxyError::no_provider("fallback attempts exhausted")))
    }

    async fn try_start_stream(
        &self,
        request_id: &str,
        provider: &str,
        model: String,
        client: Arc<dyn clproxy_provider_core::UpstreamClient>,
        request: &CreateChatCompletionRequest,
    ) -> StreamAttempt {
        let mut upstream = match client.complete_stream(request_id, request).await {
            Ok(upstream) => upstream,
            Err(err) => return StreamAttempt::Failed(ProxyError::from(err)),
        };

        match upstream.next().await {
            None => {
                // Upstream closed with no chunks at all; nothing reached the
                // client, so this is still a pre-first-byte failure.
                StreamAttempt::Failed(ProxyError::new(ErrorKind::Upstream, "upstream closed stream with no data"))
            }
            Some(Err(err)) => StreamAttempt::Failed(ProxyError::from(err)),
            Some(Ok(first_chunk)) => {
                self.manager.mark_success(provider).await;
                let translated = translate_stream(self.manager.clone(), provider.to_string(), model, first_chunk, upstream);
                StreamAttempt::Started(translated)
            }
        }
    }
}

enum StreamAttempt {
    Started(std::pin::Pin<Box<dyn Stream<Item = StreamEvent> + Send>>),
    Failed(ProxyError),
}

fn translate_stream(
    manager: Arc<ProviderManager>,
    provider: String,
    model: String,
    first_chunk: clproxy_protocol::openai::create_chat_completions::stream::CreateChatCompletionStreamResponse,
    upstream: clproxy_provider_core::ChatCompletionStream,
) -> std::pin::Pin<Box<dyn Stream<Item = StreamEvent> + Send>> {
    let mut translator = StreamTranslator::new(model);
    let pending: VecDeque<StreamEvent> = translator.transform_chunk(first_chunk).into();
    let state = (translator, upstream, pending, manager, provider, false);

    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        loop {
            let (translator, upstream, queue, manager, provider, done) = &mut state;
            if let Some(event) = queue.pop_front() {
                return Some((event, state));
            }
            if *done {
                return None;
            }

            match upstream.next().await {
                Some(Ok(chunk)) => {
                    queue.extend(translator.transform_chunk(chunk));
                }
                Some(Err(err)) => {
                    tracing::warn!(provider = %provider, error = %err, "stream failed after first byte, closing");
                    manager.mark_failure(provider).await;
                    queue.extend(translator.finish());
                    *done = true;
                }
                None => {
                    queue.extend(translator.finish());
                    *done = true;
                }
            }
        }
    }))
}

fn is_fallback_eligible(err: &ProxyError) -> bool {
    matches!(err.kind, ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::Upstream)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures_util::StreamExt;

    use clproxy_protocol::claude::types::{Message, MessageContent, Role};
    use clproxy_protocol::openai::create_chat_completions::response::{
        ChatCompletionChoice, ChatCompletionObjectType,
    };
    use clproxy_protocol::openai::create_chat_completions::types::{
        ChatCompletionFinishReason, ChatCompletionResponseMessage, ChatCompletionRole, CompletionUsage,
    };
    use clproxy_provider_core::config::{
        CircuitBreakerConfig, FallbackStrategy, ProviderConfig, ProviderModels,
    };
    use clproxy_provider_core::{ProviderError, ProviderResult, UpstreamClient};

    use super::*;

    /// Always fails `complete`/`complete_stream` with the given error,
    /// counting how many times each was invoked.
    struct FailingClient {
        error: fn() -> ProviderError,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamClient for FailingClient {
        async fn complete(&self, _request_id: &str, _request: &CreateChatCompletionRequest) -> ProviderResult<clproxy_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
        async fn complete_stream(&self, _request_id: &str, _request: &CreateChatCompletionRequest) -> ProviderResult<clproxy_provider_core::ChatCompletionStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
        fn cancel(&self, _request_id: &str) {}
    }

    struct SucceedingClient;

    #[async_trait]
    impl UpstreamClient for SucceedingClient {
        async fn complete(&self, _request_id: &str, _request: &CreateChatCompletionRequest) -> ProviderResult<clproxy_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse> {
            Ok(clproxy_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse {
                id: "chatcmpl-1".to_string(),
                object: ChatCompletionObjectType::ChatCompletion,
                created: 0,
                model: "gpt-4o".to_string(),
                choices: vec![ChatCompletionChoice {
                    index: 0,
                    message: ChatCompletionResponseMessage {
                        role: ChatCompletionRole::Assistant,
                        content: Some("hi".to_string()),
                        tool_calls: None,
                    },
                    finish_reason: ChatCompletionFinishReason::Stop,
                }],
                usage: Some(CompletionUsage { prompt_tokens: 1, completion_tokens: 1, total_tokens: 2 }),
            })
        }
        async fn complete_stream(&self, _request_id: &str, _request: &CreateChatCompletionRequest) -> ProviderResult<clproxy_provider_core::ChatCompletionStream> {
            unimplemented!("not exercised by these tests")
        }
        fn cancel(&self, _request_id: &str) {}
    }

    fn provider_config(name: &str, priority: i32) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            enabled: true,
            priority,
            api_key: "sk-test".to_string(),
            base_url: "https://example.invalid".to_string(),
            api_version: None,
            timeout_secs: 30,
            max_retries: 0,
            custom_headers: BTreeMap::new(),
            models: ProviderModels {
                big: vec!["upstream-big".to_string()],
                middle: vec!["upstream-middle".to_string()],
                small: vec!["upstream-small".to_string()],
            },
        }
    }

    fn claude_request(model: &str) -> ClaudeRequest {
        ClaudeRequest {
            model: model.to_string(),
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text("hello".to_string()),
            }],
            max_tokens: 10_000_000,
            system: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: None,
            tools: None,
            tool_choice: None,
        }
    }

    fn never_disconnected() -> bool {
        false
    }

    #[tokio::test]
    async fn exhausts_every_provider_exactly_once_then_surfaces_error() {
        let configs = vec![provider_config("a", 0), provider_config("b", 1)];
        let manager = Arc::new(ProviderManager::new(
            configs,
            CircuitBreakerConfig { failure_threshold: 100, recovery_timeout_secs: 30 },
            FallbackStrategy::Priority,
            3600,
            |_| {
                Arc::new(FailingClient {
                    error: || ProviderError::Upstream("boom".to_string()),
                    calls: AtomicUsize::new(0),
                })
            },
        ));
        let controller = FallbackController::new(manager.clone(), (1, 1_000_000));

        let request = claude_request("claude-sonnet-4");
        let result = controller.handle_unary(&request, &mut never_disconnected).await;

        assert!(result.is_err());
        let snapshot = manager.provider_snapshot().await;
        assert_eq!(snapshot.len(), 2);
        // Every provider must have failed exactly once (spec §8): no
        // provider is retried cross-provider, and `pick_next_in` found no
        // second model to retry within a single-model provider.
        for entry in snapshot {
            assert_eq!(entry.failure_count, 1, "provider {} failed {} times", entry.name, entry.failure_count);
        }
    }

    #[tokio::test]
    async fn clamps_max_tokens_before_dispatch() {
        let configs = vec![provider_config("a", 0)];
        let manager = Arc::new(ProviderManager::new(
            configs,
            CircuitBreakerConfig::default(),
            FallbackStrategy::Priority,
            3600,
            |_| Arc::new(SucceedingClient),
        ));
        let controller = FallbackController::new(manager, (100, 4096));

        let mut request = claude_request("claude-haiku");
        request.max_tokens = 10_000_000;
        let clamped = controller.clamp_max_tokens(&request);
        assert_eq!(clamped.max_tokens, 4096);

        let mut low_request = claude_request("claude-haiku");
        low_request.max_tokens = 1;
        let clamped_low = controller.clamp_max_tokens(&low_request);
        assert_eq!(clamped_low.max_tokens, 100);
    }

    #[tokio::test]
    async fn non_fallback_eligible_error_skips_remaining_providers() {
        let configs = vec![provider_config("a", 0), provider_config("b", 1)];
        let manager = Arc::new(ProviderManager::new(
            configs,
            CircuitBreakerConfig::default(),
            FallbackStrategy::Priority,
            3600,
            |_| {
                Arc::new(FailingClient {
                    error: || ProviderError::Auth("bad key".to_string()),
                    calls: AtomicUsize::new(0),
                })
            },
        ));
        let controller = FallbackController::new(manager.clone(), (1, 1_000_000));

        let request = claude_request("claude-sonnet-4");
        let err = controller.handle_unary(&request, &mut never_disconnected).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Auth);

        // Auth failures are surfaced directly, never fed into mark_failure.
        for entry in manager.provider_snapshot().await {
            assert_eq!(entry.failure_count, 0);
        }
    }

    #[tokio::test]
    async fn client_disconnect_before_dispatch_short_circuits() {
        let configs = vec![provider_config("a", 0)];
        let manager = Arc::new(ProviderManager::new(
            configs,
            CircuitBreakerConfig::default(),
            FallbackStrategy::Priority,
            3600,
            |_| Arc::new(SucceedingClient),
        ));
        let controller = FallbackController::new(manager, (1, 1_000_000));

        let request = claude_request("claude-sonnet-4");
        let err = controller.handle_unary(&request, &mut || true).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ClientDisconnect);
    }

    #[tokio::test]
    async fn successful_stream_emits_message_start_then_stop() {
        let configs = vec![provider_config("a", 0)];
        let manager = Arc::new(ProviderManager::new(
            configs,
            CircuitBreakerConfig::default(),
            FallbackStrategy::Priority,
            3600,
            |_| Arc::new(SingleChunkStreamingClient),
        ));
        let controller = FallbackController::new(manager, (1, 1_000_000));

        let request = claude_request("claude-haiku");
        let stream = controller.handle_stream(&request, &mut never_disconnected).await.unwrap();
        let events: Vec<StreamEvent> = stream.collect().await;

        assert!(matches!(events.first(), Some(StreamEvent::MessageStart { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));
    }

    struct SingleChunkStreamingClient;

    #[async_trait]
    impl UpstreamClient for SingleChunkStreamingClient {
        async fn complete(&self, _request_id: &str, _request: &CreateChatCompletionRequest) -> ProviderResult<clproxy_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse> {
            unimplemented!("not exercised by these tests")
        }
        async fn complete_stream(&self, _request_id: &str, _request: &CreateChatCompletionRequest) -> ProviderResult<clproxy_provider_core::ChatCompletionStream> {
            use clproxy_protocol::openai::create_chat_completions::stream::{
                ChatCompletionChunkObjectType, ChatCompletionStreamChoice, CreateChatCompletionStreamResponse,
            };
            use clproxy_protocol::openai::create_chat_completions::types::ChatCompletionStreamResponseDelta;

            let chunk = CreateChatCompletionStreamResponse {
                id: "chatcmpl-stream-1".to_string(),
                object: ChatCompletionChunkObjectType::ChatCompletionChunk,
                created: 0,
                model: "gpt-4o-mini".to_string(),
                choices: vec![ChatCompletionStreamChoice {
                    index: 0,
                    delta: ChatCompletionStreamResponseDelta {
                        role: Some(ChatCompletionRole::Assistant),
                        content: Some("hi".to_string()),
                        tool_calls: None,
                    },
                    finish_reason: Some(ChatCompletionFinishReason::Stop),
                }],
                usage: Some(CompletionUsage { prompt_tokens: 1, completion_tokens: 1, total_tokens: 2 }),
            };
            Ok(Box::pin(futures_util::stream::iter(vec![Ok(chunk)])))
        }
        fn cancel(&self, _request_id: &str) {}
    }
}
