use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use clproxy_core::error::ProxyError;
use clproxy_core::AppState;
use clproxy_protocol::claude::create_message::CreateMessageRequest;
use clproxy_protocol::claude::types::{Message, MessageContent, Role};
use clproxy_provider_core::config::{ProviderManagerConfig, SizeClass};

/// Operator-facing config inspection and control surface (spec §4.7): read
/// and replace the full provider document, trigger a reload from
/// `CONFIG_PATH`, probe a single provider, and flip a provider on or off
/// without restarting the process.
pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/config/providers", get(get_providers).put(put_providers))
        .route("/api/config/reload", post(reload))
        .route("/api/providers/{name}/test", post(test_provider))
        .route("/api/providers/{name}/toggle", put(toggle_provider))
        .with_state(state)
}

async fn get_providers(State(state): State<Arc<AppState>>) -> Response {
    let config = state.config.load();
    Json(config.providers.clone()).into_response()
}

/// Whole-document replace (spec §4.7: never a partial merge). The manager is
/// rebuilt from scratch, so env-var resolution and per-provider model lists
/// are re-validated the same way process startup validates them.
async fn put_providers(State(state): State<Arc<AppState>>, Json(document): Json<ProviderManagerConfig>) -> Response {
    let resolved = document
        .providers
        .into_iter()
        .map(|config| config.resolve_env(&|var| std::env::var(var).ok().filter(|v| !v.is_empty())))
        .collect::<Result<Vec<_>, _>>();

    let providers = match resolved {
        Ok(providers) => providers,
        Err(err) => return error_response(&ProxyError::config(err.to_string())),
    };

    state
        .replace_providers(ProviderManagerConfig {
            providers,
            fallback_strategy: document.fallback_strategy,
            health_check_interval_secs: document.health_check_interval_secs,
            circuit_breaker: document.circuit_breaker,
        })
        .await;

    Json(state.config.load().providers.clone()).into_response()
}

/// Re-reads `CONFIG_PATH` (or the legacy env-derived single-provider
/// document) and rebuilds the manager from it, same as process startup.
async fn reload(State(state): State<Arc<AppState>>) -> Response {
    match clproxy_common::load() {
        Ok(config) => {
            state.reload(config).await;
            Json(state.config.load().providers.clone()).into_response()
        }
        Err(err) => error_response(&ProxyError::config(err.to_string())),
    }
}

#[derive(Serialize)]
struct ProviderTestBody {
    provider: String,
    class: SizeClass,
    model: String,
}

/// Walks `small` -> `middle` -> `big`, stopping at the first class the
/// provider both offers and can successfully complete a minimal request on -
/// a failed probe continues on to the next class rather than giving up
/// (spec §4.7). Bypasses the fallback chain entirely - a failure here must
/// be attributable to this one provider, not masked by a retry elsewhere.
async fn test_provider(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    let manager = state.manager();
    let configs = manager.configs().await;
    let Some(config) = configs.iter().find(|c| c.name == name) else {
        return error_response(&ProxyError::invalid_request(format!("unknown provider '{name}'")));
    };

    let mut last_error = None;

    for class in [SizeClass::Small, SizeClass::Middle, SizeClass::Big] {
        if config.models.for_class(class).is_empty() {
            continue;
        }

        let Some(selection) = manager.pick_next_in(&name, class).await else {
            continue;
        };

        let probe = probe_request(&selection.model);
        let request_id = uuid::Uuid::new_v4().to_string();
        let openai_request = clproxy_transform::generate_content::transform_request(&probe, selection.model.clone());

        match selection.client.complete(&request_id, &openai_request).await {
            Ok(_) => {
                manager.mark_success(&name).await;
                return Json(ProviderTestBody { provider: name, class, model: selection.model }).into_response();
            }
            Err(err) => {
                manager.mark_failure(&name).await;
                last_error = Some(ProxyError::from(err));
            }
        }
    }

    match last_error {
        Some(err) => error_response(&err),
        None => error_response(&ProxyError::invalid_request(format!("provider '{name}' has no configured models"))),
    }
}

fn probe_request(model: &str) -> CreateMessageRequest {
    CreateMessageRequest {
        model: model.to_string(),
        messages: vec![Message {
            role: Role::User,
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
    }
}

#[derive(Deserialize)]
struct ToggleBody {
    enabled: bool,
}

async fn toggle_provider(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<ToggleBody>,
) -> Response {
    let manager = state.manager();
    if manager.toggle(&name, body.enabled).await {
        Json(serde_json::json!({ "provider": name, "enabled": body.enabled })).into_response()
    } else {
        error_response(&ProxyError::invalid_request(format!("unknown provider '{name}'")))
    }
}

fn error_response(err: &ProxyError) -> Response {
    (err.status(), [(axum::http::header::CONTENT_TYPE, "application/json")], err.to_claude_body()).into_response()
}
