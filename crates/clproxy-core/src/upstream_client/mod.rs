use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;

use clproxy_protocol::openai::create_chat_completions::request::CreateChatCompletionRequest;
use clproxy_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse;
use clproxy_protocol::openai::create_chat_completions::stream::CreateChatCompletionStreamResponse;
use clproxy_protocol::sse::SseParser;
use clproxy_provider_core::config::ProviderConfig;
use clproxy_provider_core::{ChatCompletionStream, ProviderError, ProviderResult, UpstreamClient};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Talks to one provider's OpenAI-compatible (or Azure-style) endpoint over
/// HTTP (spec §4.1, §6). One instance is owned per [`clproxy_provider_core::ProviderState`].
#[derive(Clone)]
pub struct ReqwestUpstreamClient {
    client: Client,
    config: ProviderConfig,
}

impl ReqwestUpstreamClient {
    pub fn new(config: ProviderConfig) -> reqwest::Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn request_url(&self, model: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match &self.config.api_version {
            Some(api_version) => {
                format!("{base}/openai/deployments/{model}/chat/completions?api-version={api_version}")
            }
            None => format!("{base}/chat/completions"),
        }
    }

    fn build_request(&self, body: &CreateChatCompletionRequest) -> reqwest::RequestBuilder {
        let url = self.request_url(&body.model);
        let mut builder = self.client.post(url).json(body);
        builder = match &self.config.api_version {
            Some(_) => builder.header("api-key", &self.config.api_key),
            None => builder.bearer_auth(&self.config.api_key),
        };
        // Custom headers are applied last so they win on collision (spec §6).
        for (name, value) in &self.config.custom_headers {
            builder = builder.header(name, value);
        }
        builder
    }

    async fn try_complete_once(
        &self,
        request_id: &str,
        body: &CreateChatCompletionRequest,
    ) -> ProviderResult<CreateChatCompletionResponse> {
        let response = self.build_request(body).send().await.map_err(|err| map_reqwest_error(&err))?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|err| map_reqwest_error(&err))?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), String::from_utf8_lossy(&bytes).to_string()));
        }
        serde_json::from_slice(&bytes)
            .map_err(|err| ProviderError::Unknown(format!("decode response for request {request_id}: {err}")))
    }
}

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(4);

/// Only connection/timeout errors are locally retried (spec §4.1) - anything
/// else (4xx/5xx, decode failures) is either not transient or belongs to the
/// cross-provider fallback ladder instead.
fn is_transient(err: &ProviderError) -> bool {
    matches!(err, ProviderError::Timeout(_) | ProviderError::Connection(_))
}

fn retry_backoff(attempt: u32) -> Duration {
    RETRY_BASE_DELAY.saturating_mul(1 << attempt.min(3)).min(RETRY_MAX_DELAY)
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    async fn complete(
        &self,
        request_id: &str,
        request: &CreateChatCompletionRequest,
    ) -> ProviderResult<CreateChatCompletionResponse> {
        let mut body = request.clone();
        body.stream = Some(false);

        let mut attempt = 0;
        loop {
            match self.try_complete_once(request_id, &body).await {
                Ok(response) => return Ok(response),
                Err(err) if attempt < self.config.max_retries && is_transient(&err) => {
                    let backoff = retry_backoff(attempt);
                    tracing::warn!(provider = %self.config.name, attempt, error = %err, "retrying unary call after transient error");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn complete_stream(
        &self,
        request_id: &str,
        request: &CreateChatCompletionRequest,
    ) -> ProviderResult<ChatCompletionStream> {
        let mut body = request.clone();
        body.stream = Some(true);
        let response = self.build_request(&body).send().await.map_err(|err| map_reqwest_error(&err))?;
        let status = response.status();
        if !status.is_success() {
            let bytes = response.bytes().await.map_err(|err| map_reqwest_error(&err))?;
            return Err(ProviderError::from_status(status.as_u16(), String::from_utf8_lossy(&bytes).to_string()));
        }

        let request_id = request_id.to_string();
        let byte_stream = response.bytes_stream();
        let state = (byte_stream, SseParser::new(), VecDeque::new(), false);

        let stream = futures_util::stream::unfold(state, move |mut state| {
            let request_id = request_id.clone();
            async move {
                loop {
                    let (byte_stream, parser, queue, done) = &mut state;
                    if let Some(item) = queue.pop_front() {
                        return Some((item, state));
                    }
                    if *done {
                        return None;
                    }
                    match byte_stream.next().await {
                        Some(Ok(bytes)) => {
                            for event in parser.push_bytes(&bytes) {
                                push_event(queue, done, &request_id, event);
                            }
                        }
                        Some(Err(err)) => {
                            queue.push_back(Err(map_reqwest_error(&err)));
                            *done = true;
                        }
                        None => {
                            for event in parser.finish() {
                                push_event(queue, done, &request_id, event);
                            }
                            *done = true;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    fn cancel(&self, _request_id: &str) {
        // No out-of-band cancellation API; dropping the stream is sufficient.
    }
}

fn push_event(
    queue: &mut VecDeque<ProviderResult<CreateChatCompletionStreamResponse>>,
    done: &mut bool,
    request_id: &str,
    event: clproxy_protocol::sse::SseEvent,
) {
    if event.data == "[DONE]" {
        *done = true;
        return;
    }
    if event.data.is_empty() {
        return;
    }
    let parsed = serde_json::from_str::<CreateChatCompletionStreamResponse>(&event.data)
        .map_err(|err| ProviderError::Unknown(format!("decode stream chunk for request {request_id}: {err}")));
    queue.push_back(parsed);
}

fn map_reqwest_error(err: &reqwest::Error) -> ProviderError {
    let message = err.to_string();
    if err.is_timeout() {
        ProviderError::Timeout(message)
    } else if err.is_connect() {
        ProviderError::Connection(message)
    } else if let Some(status) = err.status() {
        ProviderError::from_status(status.as_u16(), message)
    } else {
        ProviderError::Unknown(message)
    }
}
