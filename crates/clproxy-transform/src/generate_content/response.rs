use clproxy_protocol::claude::create_message::CreateMessageResponse as ClaudeResponse;
use clproxy_protocol::claude::create_message::response::MessageObjectType;
use clproxy_protocol::claude::types::{ContentBlock, Role, StopReason, Usage};
use clproxy_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse as OpenAIResponse;
use clproxy_protocol::openai::create_chat_completions::types::{
    ChatCompletionFinishReason, ChatCompletionMessageToolCall, ChatCompletionResponseMessage,
    CompletionUsage,
};

/// Convert an OpenAI chat-completions response into a Claude message response.
pub fn transform_response(response: OpenAIResponse, model: String) -> ClaudeResponse {
    let choice = response.choices.first();

    let (content, stop_reason) = match choice {
        Some(choice) => (
            map_response_message(&choice.message),
            Some(map_finish_reason(choice.finish_reason)),
        ),
        None => (Vec::new(), None),
    };

    ClaudeResponse {
        id: response.id,
        r#type: MessageObjectType::Message,
        role: Role::Assistant,
        model,
        content,
        stop_reason,
        stop_sequence: None,
        usage: map_usage(response.usage),
    }
}

fn map_response_message(message: &ChatCompletionResponseMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();

    if let Some(content) = &message.content
        && !content.is_empty()
    {
        blocks.push(ContentBlock::Text {
            text: content.clone(),
        });
    }

    if let Some(tool_calls) = &message.tool_calls {
        for tool_call in tool_calls {
            blocks.push(map_tool_call(tool_call));
        }
    }

    blocks
}

fn map_tool_call(tool_call: &ChatCompletionMessageToolCall) -> ContentBlock {
    let ChatCompletionMessageToolCall::Function { id, function } = tool_call;
    let input = serde_json::from_str(&function.arguments).unwrap_or_else(|_| {
        tracing::warn!(tool_call_id = %id, tool_name = %function.name, "malformed tool call arguments, defaulting to {{}}");
        serde_json::Value::Object(Default::default())
    });

    ContentBlock::ToolUse {
        id: id.clone(),
        name: function.name.clone(),
        input,
    }
}

fn map_finish_reason(reason: ChatCompletionFinishReason) -> StopReason {
    match reason {
        ChatCompletionFinishReason::Stop => StopReason::EndTurn,
        ChatCompletionFinishReason::Length => StopReason::MaxTokens,
        ChatCompletionFinishReason::ToolCalls => StopReason::ToolUse,
        ChatCompletionFinishReason::ContentFilter => StopReason::EndTurn,
    }
}

fn map_usage(usage: Option<CompletionUsage>) -> Usage {
    match usage {
        Some(usage) => Usage {
            input_tokens: usage.prompt_tokens.max(0) as u32,
            output_tokens: usage.completion_tokens.max(0) as u32,
        },
        None => Usage::default(),
    }
}
