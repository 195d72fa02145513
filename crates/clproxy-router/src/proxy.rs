use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Serialize;

use clproxy_core::error::{ErrorKind, ProxyError};
use clproxy_core::{authenticate, AppState, FallbackController};
use clproxy_protocol::claude::create_message::CreateMessageRequest;
use clproxy_protocol::claude::count_tokens::request::CountTokensRequest;
use clproxy_protocol::claude::count_tokens::response::CountTokensResponse;
use clproxy_protocol::claude::types::{Message, MessageContent, ContentBlock, SystemPrompt, SystemTextBlock};
use clproxy_provider_core::SizeClass;

/// Claude-facing HTTP surface: message creation (unary + streaming), token
/// counting, and the unauthenticated health/diagnostic endpoints (spec §5).
pub fn proxy_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/test-connection", get(test_connection))
        .route("/v1/messages", post(create_message))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .with_state(state)
}

#[derive(Serialize)]
struct RootBody {
    service: &'static str,
    version: &'static str,
    provider_count: usize,
}

async fn root(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let manager = state.manager();
    Json(RootBody {
        service: "clproxy",
        version: env!("CARGO_PKG_VERSION"),
        provider_count: manager.provider_snapshot().await.len(),
    })
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    timestamp: i64,
    providers: Vec<ProviderHealth>,
}

#[derive(Serialize)]
struct ProviderHealth {
    name: String,
    enabled: bool,
    status: clproxy_provider_core::ProviderStatus,
    failure_count: u32,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let manager = state.manager();
    let providers = manager
        .provider_snapshot()
        .await
        .into_iter()
        .map(|snapshot| ProviderHealth {
            name: snapshot.name,
            enabled: snapshot.enabled,
            status: snapshot.status,
            failure_count: snapshot.failure_count,
        })
        .collect();

    Json(HealthBody {
        status: "ok",
        timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
        providers,
    })
}

#[derive(Serialize)]
struct TestConnectionBody {
    status: &'static str,
    provider: String,
    model: String,
}

/// Dispatches a minimal `small`-class completion to confirm at least one
/// provider is reachable, without going through the fallback chain - a
/// single unhealthy provider should not cause this to silently retry.
async fn test_connection(State(state): State<Arc<AppState>>) -> Response {
    let manager = state.manager();
    let Some(selection) = manager.pick(SizeClass::Small, &[]).await else {
        return error_response(&ProxyError::no_provider("no healthy provider available"));
    };

    let probe = CreateMessageRequest {
        model: selection.model.clone(),
        messages: vec![Message {
            role: clproxy_protocol::claude::types::Role::User,
            content: MessageContent::Text("ping".to_string()),
        }],
        max_tokens: 8,
        system: None,
        temperature: None,
        top_p: None,
        top_k: None,
        stop_sequences: None,
        stream: Some(false),
        tools: None,
        tool_choice: None,
    };
    let openai_request = clproxy_transform::generate_content::transform_request(&probe, selection.model.clone());
    let request_id = uuid::Uuid::new_v4().to_string();

    match selection.client.complete(&request_id, &openai_request).await {
        Ok(_) => {
            manager.mark_success(&selection.provider).await;
            Json(TestConnectionBody {
                status: "ok",
                provider: selection.provider,
                model: selection.model,
            })
            .into_response()
        }
        Err(err) => {
            manager.mark_failure(&selection.provider).await;
            error_response(&ProxyError::from(err))
        }
    }
}

async fn count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CountTokensRequest>,
) -> Response {
    if let Err(err) = authenticate(state.anthropic_api_key().as_deref(), &headers) {
        return error_response(&err);
    }

    let chars = system_chars(request.system.as_ref()) + messages_chars(&request.messages);
    let input_tokens = (chars / 4).max(1) as u32;
    Json(CountTokensResponse { input_tokens }).into_response()
}

fn system_chars(system: Option<&SystemPrompt>) -> usize {
    match system {
        None => 0,
        Some(SystemPrompt::Text(text)) => text.len(),
        Some(SystemPrompt::Blocks(blocks)) => blocks.iter().map(|b: &SystemTextBlock| b.text.len()).sum(),
    }
}

fn messages_chars(messages: &[Message]) -> usize {
    messages.iter().map(message_chars).sum()
}

fn message_chars(message: &Message) -> usize {
    match &message.content {
        MessageContent::Text(text) => text.len(),
        MessageContent::Blocks(blocks) => blocks.iter().map(content_block_chars).sum(),
    }
}

fn content_block_chars(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text } => text.len(),
        ContentBlock::Image { .. } => 0,
        ContentBlock::ToolUse { input, .. } => input.to_string().len(),
        ContentBlock::ToolResult { content, .. } => match content {
            None => 0,
            Some(clproxy_protocol::claude::types::ToolResultContent::Text(text)) => text.len(),
            Some(clproxy_protocol::claude::types::ToolResultContent::Blocks(blocks)) => {
                blocks.iter().map(content_block_chars).sum()
            }
        },
    }
}

async fn create_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateMessageRequest>,
) -> Response {
    if let Err(err) = authenticate(state.anthropic_api_key().as_deref(), &headers) {
        return error_response(&err);
    }
    if request.messages.is_empty() {
        return error_response(&ProxyError::invalid_request("messages must not be empty"));
    }

    let controller = FallbackController::new(state.manager(), state.token_bounds());
    let mut disconnected = || false;

    if request.wants_stream() {
        match controller.handle_stream(&request, &mut disconnected).await {
            Ok(stream) => stream_response(stream),
            Err(err) => error_response(&err),
        }
    } else {
        match controller.handle_unary(&request, &mut disconnected).await {
            Ok(response) => Json(response).into_response(),
            Err(err) => error_response(&err),
        }
    }
}

fn stream_response(
    stream: impl futures_util::Stream<Item = clproxy_protocol::claude::create_message::stream::StreamEvent>
        + Send
        + 'static,
) -> Response {
    let body = stream.map(|event| {
        let data = serde_json::to_vec(&event).unwrap_or_default();
        let mut frame = format!("event: {}\ndata: ", event.event_name()).into_bytes();
        frame.extend_from_slice(&data);
        frame.extend_from_slice(b"\n\n");
        Ok::<_, Infallible>(bytes::Bytes::from(frame))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .header(axum::http::header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .expect("static headers are always valid")
}

/// Renders a [`ProxyError`] the way spec §7 requires: JSON `{"type": "error",
/// ...}` regardless of whether the caller asked for streaming, since
/// dispatch failures here all happen before the first upstream byte.
fn error_response(err: &ProxyError) -> Response {
    if err.kind != ErrorKind::Internal {
        tracing::warn!(kind = ?err.kind, message = %err.message, "request failed");
    } else {
        tracing::error!(message = %err.message, "internal error");
    }
    (err.status(), [(axum::http::header::CONTENT_TYPE, "application/json")], err.to_claude_body()).into_response()
}
