use std::collections::BTreeMap;

use clproxy_protocol::claude::create_message::stream::{
    StreamContentBlock, StreamContentBlockDelta, StreamEvent, StreamMessage, StreamMessageDelta,
};
use clproxy_protocol::claude::types::{Role, Usage};
use clproxy_protocol::openai::create_chat_completions::stream::CreateChatCompletionStreamResponse;
use clproxy_protocol::openai::create_chat_completions::types::{
    ChatCompletionFinishReason, ChatCompletionMessageToolCallChunk, CompletionUsage,
};

struct ToolBlock {
    block_index: u32,
}

/// Drives the Claude SSE state machine (`message_start` -> interleaved
/// content blocks -> `message_delta` -> `message_stop`) from a sequence of
/// OpenAI chat-completion stream chunks.
pub struct StreamTranslator {
    id: String,
    model: String,
    message_started: bool,
    finish_emitted: bool,
    pending_finish: Option<ChatCompletionFinishReason>,
    next_block_index: u32,
    text_block_index: Option<u32>,
    tool_blocks: BTreeMap<i64, ToolBlock>,
}

impl StreamTranslator {
    pub fn new(model: String) -> Self {
        Self {
            id: String::new(),
            model,
            message_started: false,
            finish_emitted: false,
            pending_finish: None,
            next_block_index: 0,
            text_block_index: None,
            tool_blocks: BTreeMap::new(),
        }
    }

    pub fn transform_chunk(&mut self, chunk: CreateChatCompletionStreamResponse) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if !self.message_started {
            self.id = chunk.id.clone();
            self.message_started = true;
            events.push(StreamEvent::MessageStart {
                message: StreamMessage {
                    id: self.id.clone(),
                    content: Vec::new(),
                    model: self.model.clone(),
                    role: Role::Assistant,
                    stop_reason: None,
                    stop_sequence: None,
                    usage: Usage::default(),
                },
            });
        }

        let choice = chunk.choices.first();

        if let Some(choice) = choice {
            if let Some(content) = &choice.delta.content {
                events.extend(self.emit_text(content));
            }
            if let Some(tool_calls) = &choice.delta.tool_calls {
                for call in tool_calls {
                    events.extend(self.emit_tool_call(call));
                }
            }
        }

        let finish_reason = choice.and_then(|choice| choice.finish_reason);
        if let Some(reason) = finish_reason
            && !self.finish_emitted
        {
            events.extend(self.close_open_blocks());
            self.pending_finish = Some(reason);
        }

        if let Some(usage) = chunk.usage {
            if let Some(reason) = self.pending_finish.take() {
                events.push(StreamEvent::MessageDelta {
                    delta: StreamMessageDelta {
                        stop_reason: Some(map_finish_reason(reason)),
                        stop_sequence: None,
                    },
                    usage: map_usage(usage),
                });
                events.push(StreamEvent::MessageStop);
                self.finish_emitted = true;
            } else {
                events.push(StreamEvent::MessageDelta {
                    delta: StreamMessageDelta {
                        stop_reason: None,
                        stop_sequence: None,
                    },
                    usage: map_usage(usage),
                });
            }
        }

        events
    }

    /// Called once the upstream stream ends; flushes any pending close that
    /// never received a trailing usage-bearing chunk.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.message_started {
            return events;
        }
        if !self.finish_emitted {
            events.extend(self.close_open_blocks());
            let reason = self.pending_finish.take();
            events.push(StreamEvent::MessageDelta {
                delta: StreamMessageDelta {
                    stop_reason: reason.map(map_finish_reason),
                    stop_sequence: None,
                },
                usage: Usage::default(),
            });
            events.push(StreamEvent::MessageStop);
            self.finish_emitted = true;
        }
        events
    }

    fn emit_text(&mut self, text: &str) -> Vec<StreamEvent> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut events = Vec::new();
        let block_index = match self.text_block_index {
            Some(index) => index,
            None => {
                let index = self.next_block_index;
                self.next_block_index += 1;
                self.text_block_index = Some(index);
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: StreamContentBlock::Text {
                        text: String::new(),
                    },
                });
                index
            }
        };

        events.push(StreamEvent::ContentBlockDelta {
            index: block_index,
            delta: StreamContentBlockDelta::TextDelta {
                text: text.to_string(),
            },
        });

        events
    }

    fn emit_tool_call(&mut self, call: &ChatCompletionMessageToolCallChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let index = call.index;

        let info = self.tool_blocks.entry(index).or_insert_with(|| {
            let block_index = self.next_block_index;
            self.next_block_index += 1;
            let id = call
                .id
                .clone()
                .unwrap_or_else(|| format!("toolcall-{}", index));
            let name = call
                .function
                .as_ref()
                .and_then(|function| function.name.clone())
                .unwrap_or_else(|| "tool".to_string());

            events.push(StreamEvent::ContentBlockStart {
                index: block_index,
                content_block: StreamContentBlock::ToolUse {
                    id,
                    name,
                    input: serde_json::Value::Object(Default::default()),
                },
            });

            ToolBlock { block_index }
        });

        if let Some(function) = &call.function
            && let Some(arguments) = &function.arguments
        {
            events.push(StreamEvent::ContentBlockDelta {
                index: info.block_index,
                delta: StreamContentBlockDelta::InputJsonDelta {
                    partial_json: arguments.clone(),
                },
            });
        }

        events
    }

    fn close_open_blocks(&mut self) -> Vec<StreamEvent> {
        let mut indices: Vec<u32> = Vec::new();

        if let Some(index) = self.text_block_index.take() {
            indices.push(index);
        }

        let tool_blocks = std::mem::take(&mut self.tool_blocks);
        indices.extend(tool_blocks.into_values().map(|info| info.block_index));

        indices.sort_unstable();
        indices.into_iter().map(|index| StreamEvent::ContentBlockStop { index }).collect()
    }
}

fn map_finish_reason(reason: ChatCompletionFinishReason) -> clproxy_protocol::claude::types::StopReason {
    use clproxy_protocol::claude::types::StopReason;
    match reason {
        ChatCompletionFinishReason::Stop => StopReason::EndTurn,
        ChatCompletionFinishReason::Length => StopReason::MaxTokens,
        ChatCompletionFinishReason::ToolCalls => StopReason::ToolUse,
        ChatCompletionFinishReason::ContentFilter => StopReason::EndTurn,
    }
}

fn map_usage(usage: CompletionUsage) -> Usage {
    Usage {
        input_tokens: usage.prompt_tokens.max(0) as u32,
        output_tokens: usage.completion_tokens.max(0) as u32,
    }
}
