use std::pin::Pin;

use async_trait::async_trait;
use clproxy_protocol::openai::create_chat_completions::request::CreateChatCompletionRequest;
use clproxy_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse;
use clproxy_protocol::openai::create_chat_completions::stream::CreateChatCompletionStreamResponse;
use futures_core::Stream;

use crate::errors::ProviderResult;

pub type ChatCompletionStreamItem = ProviderResult<CreateChatCompletionStreamResponse>;
pub type ChatCompletionStream = Pin<Box<dyn Stream<Item = ChatCompletionStreamItem> + Send>>;

/// The transport an upstream provider is reached through (spec §4.1).
///
/// One instance is owned per [`crate::state::ProviderState`]; it carries
/// whatever connection pooling the concrete client needs and is never shared
/// across providers.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn complete(
        &self,
        request_id: &str,
        request: &CreateChatCompletionRequest,
    ) -> ProviderResult<CreateChatCompletionResponse>;

    /// Returns a finite, non-restartable stream of chunks terminated by the
    /// upstream's `[DONE]` sentinel. Dropping the stream before exhaustion is
    /// the cancellation mechanism; `cancel` additionally lets an orchestrator
    /// signal an in-flight request by id when it does not hold the stream.
    async fn complete_stream(
        &self,
        request_id: &str,
        request: &CreateChatCompletionRequest,
    ) -> ProviderResult<ChatCompletionStream>;

    /// Best-effort cancellation of an in-flight request. Implementations that
    /// cannot cancel out-of-band may no-op; dropping the stream is always
    /// sufficient to stop consuming it.
    fn cancel(&self, request_id: &str);
}
