use clproxy_protocol::claude::create_message::CreateMessageRequest as ClaudeRequest;
use clproxy_protocol::claude::types::{
    ContentBlock, Message, MessageContent, Role, SystemPrompt, Tool, ToolChoice, ToolResultContent,
};
use clproxy_protocol::openai::create_chat_completions::request::{
    CreateChatCompletionRequest as OpenAIRequest, StopConfiguration,
};
use clproxy_protocol::openai::create_chat_completions::types::{
    ChatCompletionContent, ChatCompletionContentPart, ChatCompletionFunctionDefinition,
    ChatCompletionImageUrl, ChatCompletionMessageToolCall, ChatCompletionMessageToolCallFunction,
    ChatCompletionRequestMessage, ChatCompletionRole, ChatCompletionToolChoiceFunction,
    ChatCompletionToolChoiceMode, ChatCompletionToolChoiceOption, ChatCompletionToolDefinition,
    ChatCompletionToolType,
};

/// Convert a Claude create-message request into an OpenAI chat-completions request.
pub fn transform_request(request: &ClaudeRequest, model: String) -> OpenAIRequest {
    let mut messages = Vec::new();

    if let Some(system) = map_system_message(request.system.as_ref()) {
        messages.push(system);
    }

    for message in &request.messages {
        messages.extend(map_message(message));
    }

    OpenAIRequest {
        messages,
        model,
        max_tokens: Some(request.max_tokens as i64),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: map_stop_sequences(request.stop_sequences.as_ref()),
        stream: request.stream,
        tools: map_tools(request.tools.as_ref()),
        tool_choice: map_tool_choice(request.tool_choice.as_ref()),
    }
}

fn map_system_message(system: Option<&SystemPrompt>) -> Option<ChatCompletionRequestMessage> {
    let text = match system? {
        SystemPrompt::Text(text) => text.clone(),
        SystemPrompt::Blocks(blocks) => {
            let texts: Vec<String> = blocks.iter().map(|block| block.text.clone()).collect();
            if texts.is_empty() {
                return None;
            }
            texts.join("\n")
        }
    };

    Some(ChatCompletionRequestMessage {
        role: ChatCompletionRole::System,
        content: Some(ChatCompletionContent::Text(text)),
        tool_calls: None,
        tool_call_id: None,
    })
}

fn map_message(message: &Message) -> Vec<ChatCompletionRequestMessage> {
    match message.role {
        Role::User => map_user_message(&message.content),
        Role::Assistant => map_assistant_message(&message.content),
    }
}

fn map_user_message(content: &MessageContent) -> Vec<ChatCompletionRequestMessage> {
    let mut output = Vec::new();
    let mut parts: Vec<ChatCompletionContentPart> = Vec::new();

    let flush = |output: &mut Vec<ChatCompletionRequestMessage>,
                 parts: &mut Vec<ChatCompletionContentPart>| {
        if parts.is_empty() {
            return;
        }
        let content = if parts.len() == 1 {
            match &parts[0] {
                ChatCompletionContentPart::Text { text } => {
                    ChatCompletionContent::Text(text.clone())
                }
                other => ChatCompletionContent::Parts(vec![other.clone()]),
            }
        } else {
            ChatCompletionContent::Parts(std::mem::take(parts))
        };
        output.push(ChatCompletionRequestMessage {
            role: ChatCompletionRole::User,
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        });
        parts.clear();
    };

    match content {
        MessageContent::Text(text) => push_text(&mut parts, text.clone()),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        flush(&mut output, &mut parts);
                        if let Some(message) = map_tool_result(tool_use_id, content.as_ref()) {
                            output.push(message);
                        }
                    }
                    ContentBlock::Text { text } => push_text(&mut parts, text.clone()),
                    ContentBlock::Image { source } => {
                        let mime = source.media_type.clone();
                        let url = format!("data:{};base64,{}", mime, source.data);
                        parts.push(ChatCompletionContentPart::ImageUrl {
                            image_url: ChatCompletionImageUrl { url },
                        });
                    }
                    ContentBlock::ToolUse { .. } => {}
                }
            }
        }
    }

    flush(&mut output, &mut parts);
    output
}

fn push_text(parts: &mut Vec<ChatCompletionContentPart>, text: String) {
    if !text.is_empty() {
        parts.push(ChatCompletionContentPart::Text { text });
    }
}

fn map_tool_result(
    tool_use_id: &str,
    content: Option<&ToolResultContent>,
) -> Option<ChatCompletionRequestMessage> {
    let text = match content? {
        ToolResultContent::Text(text) => text.clone(),
        ToolResultContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<String>>()
            .join("\n"),
    };

    if text.is_empty() {
        return None;
    }

    Some(ChatCompletionRequestMessage {
        role: ChatCompletionRole::Tool,
        content: Some(ChatCompletionContent::Text(text)),
        tool_calls: None,
        tool_call_id: Some(tool_use_id.to_string()),
    })
}

fn map_assistant_message(content: &MessageContent) -> Vec<ChatCompletionRequestMessage> {
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();

    match content {
        MessageContent::Text(text) => texts.push(text.clone()),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => texts.push(text.clone()),
                    ContentBlock::ToolUse { id, name, input } => {
                        let arguments =
                            serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string());
                        tool_calls.push(ChatCompletionMessageToolCall::Function {
                            id: id.clone(),
                            function: ChatCompletionMessageToolCallFunction {
                                name: name.clone(),
                                arguments,
                            },
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    let content = if texts.is_empty() {
        None
    } else {
        Some(ChatCompletionContent::Text(texts.join("\n")))
    };

    let tool_calls = if tool_calls.is_empty() {
        None
    } else {
        Some(tool_calls)
    };

    vec![ChatCompletionRequestMessage {
        role: ChatCompletionRole::Assistant,
        content,
        tool_calls,
        tool_call_id: None,
    }]
}

fn map_tools(tools: Option<&Vec<Tool>>) -> Option<Vec<ChatCompletionToolDefinition>> {
    let tools = tools?;
    if tools.is_empty() {
        return None;
    }

    Some(
        tools
            .iter()
            .map(|tool| ChatCompletionToolDefinition {
                r#type: ChatCompletionToolType::Function,
                function: ChatCompletionFunctionDefinition {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect(),
    )
}

fn map_tool_choice(choice: Option<&ToolChoice>) -> Option<ChatCompletionToolChoiceOption> {
    Some(match choice? {
        ToolChoice::Auto => ChatCompletionToolChoiceOption::Mode(ChatCompletionToolChoiceMode::Auto),
        ToolChoice::Any => ChatCompletionToolChoiceOption::Mode(ChatCompletionToolChoiceMode::Auto),
        ToolChoice::None => ChatCompletionToolChoiceOption::Mode(ChatCompletionToolChoiceMode::None),
        ToolChoice::Tool { name } => ChatCompletionToolChoiceOption::NamedTool {
            r#type: ChatCompletionToolType::Function,
            function: ChatCompletionToolChoiceFunction { name: name.clone() },
        },
    })
}

fn map_stop_sequences(stop_sequences: Option<&Vec<String>>) -> Option<StopConfiguration> {
    let sequences = stop_sequences?;
    if sequences.is_empty() {
        None
    } else if sequences.len() == 1 {
        Some(StopConfiguration::Single(sequences[0].clone()))
    } else {
        Some(StopConfiguration::Many(sequences.clone()))
    }
}
