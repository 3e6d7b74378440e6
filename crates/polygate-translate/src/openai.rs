//! OpenAI-dialect codec: request/response conversion plus the streaming
//! state machines in both directions.

use std::collections::BTreeSet;

use polygate_protocol::openai::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ChatMessage, Choice, ChunkChoice,
    ChunkDelta, ContentPart, FinishReason as WireFinish, FunctionCall, FunctionCallChunk,
    FunctionDef, ImageUrl, InputAudio, MessageContent, NamedFunction, ResponseMessage, Tool,
    ToolCall, ToolCallChunk, ToolCallKind, ToolChoice as WireToolChoice, Usage,
};

use crate::unified::{
    Block, BlockPart, FinishReason, ImageSource, Role, ToolCallDelta, ToolChoice, ToolSpec,
    UnifiedDelta, UnifiedMessage, UnifiedRequest, UnifiedResponse, UnifiedUsage,
};
use crate::{now_epoch_seconds, DropWarning, TranslateError};

pub fn request_to_unified(req: ChatCompletionRequest) -> Result<UnifiedRequest, TranslateError> {
    if req.model.is_empty() {
        return Err(TranslateError::Invalid("missing model".to_string()));
    }

    let mut unified = UnifiedRequest::new(req.model);
    unified.stream = req.stream.unwrap_or(false);
    unified.temperature = req.temperature;
    unified.max_tokens = req.max_tokens.or(req.max_completion_tokens);
    unified.user_id = req.user;
    unified.extra = req.extra;
    unified.tool_choice = req.tool_choice.map(tool_choice_to_unified).transpose()?;

    for tool in req.tools.unwrap_or_default() {
        unified.tools.push(ToolSpec {
            name: tool.function.name,
            description: tool.function.description,
            input_schema: tool
                .function
                .parameters
                .unwrap_or_else(|| serde_json::json!({})),
        });
    }

    for message in req.messages {
        match message {
            ChatMessage::System { content, .. } => {
                unified.system.extend(content_to_blocks(content));
            }
            ChatMessage::User { content, .. } => {
                unified
                    .messages
                    .push(UnifiedMessage::new(Role::User, content_to_blocks(content)));
            }
            ChatMessage::Assistant {
                content,
                reasoning_content,
                tool_calls,
                ..
            } => {
                let mut blocks = Vec::new();
                if let Some(reasoning) = reasoning_content {
                    blocks.push(Block::new(BlockPart::Thinking {
                        text: reasoning,
                        signature: None,
                    }));
                }
                if let Some(content) = content {
                    blocks.extend(content_to_blocks(content));
                }
                for call in tool_calls.unwrap_or_default() {
                    blocks.push(Block::new(BlockPart::ToolUse {
                        id: call.id,
                        name: call.function.name,
                        arguments: call.function.arguments,
                    }));
                }
                unified
                    .messages
                    .push(UnifiedMessage::new(Role::Assistant, blocks));
            }
            ChatMessage::Tool {
                content,
                tool_call_id,
            } => {
                let text = flatten_content(&content);
                let mut message = UnifiedMessage::new(
                    Role::Tool,
                    vec![Block::new(BlockPart::ToolResult {
                        call_id: tool_call_id.clone(),
                        content: text,
                        is_error: false,
                    })],
                );
                message.tool_call_id = Some(tool_call_id);
                unified.messages.push(message);
            }
        }
    }

    Ok(unified)
}

pub fn unified_to_request(
    unified: &UnifiedRequest,
) -> (ChatCompletionRequest, Vec<DropWarning>) {
    let mut warnings = Vec::new();
    let mut messages = Vec::new();

    if !unified.system.is_empty() {
        let text = joined_block_text(&unified.system);
        messages.push(ChatMessage::System {
            content: MessageContent::Text(text),
            name: None,
        });
    }

    for message in &unified.messages {
        match message.role {
            Role::System => messages.push(ChatMessage::System {
                content: MessageContent::Text(message.joined_text()),
                name: None,
            }),
            Role::User => {
                let parts = blocks_to_parts(&message.blocks, &mut warnings);
                messages.push(ChatMessage::User {
                    content: MessageContent::Parts(parts),
                    name: None,
                });
            }
            Role::Assistant => {
                let mut content = String::new();
                let mut reasoning = String::new();
                let mut tool_calls = Vec::new();
                for block in &message.blocks {
                    match &block.part {
                        BlockPart::Text { text } => content.push_str(text),
                        BlockPart::Thinking { text, .. } => reasoning.push_str(text),
                        BlockPart::ToolUse {
                            id,
                            name,
                            arguments,
                        } => tool_calls.push(ToolCall {
                            id: id.clone(),
                            kind: ToolCallKind::Function,
                            function: FunctionCall {
                                name: name.clone(),
                                arguments: arguments.clone(),
                            },
                        }),
                        other => warnings.push(drop_warning(other)),
                    }
                }
                messages.push(ChatMessage::Assistant {
                    content: (!content.is_empty()).then_some(MessageContent::Text(content)),
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    name: None,
                });
            }
            Role::Tool => {
                for block in &message.blocks {
                    match &block.part {
                        BlockPart::ToolResult {
                            call_id, content, ..
                        } => messages.push(ChatMessage::Tool {
                            content: MessageContent::Text(content.clone()),
                            tool_call_id: call_id.clone(),
                        }),
                        other => warnings.push(drop_warning(other)),
                    }
                }
            }
        }
    }

    let tools: Vec<Tool> = unified
        .tools
        .iter()
        .map(|tool| Tool {
            kind: ToolCallKind::Function,
            function: FunctionDef {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: Some(tool.input_schema.clone()),
            },
        })
        .collect();

    let request = ChatCompletionRequest {
        model: unified.model.clone(),
        messages,
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice: unified.tool_choice.as_ref().map(tool_choice_to_wire),
        stream: unified.stream.then_some(true),
        stream_options: None,
        temperature: unified.temperature,
        max_tokens: unified.max_tokens,
        max_completion_tokens: None,
        user: unified.user_id.clone(),
        extra: unified.extra.clone(),
    };
    (request, warnings)
}

pub fn response_to_unified(resp: ChatCompletion) -> Result<UnifiedResponse, TranslateError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| TranslateError::Invalid("response has no choices".to_string()))?;

    let mut blocks = Vec::new();
    if let Some(reasoning) = choice.message.reasoning_content {
        blocks.push(Block::new(BlockPart::Thinking {
            text: reasoning,
            signature: None,
        }));
    }
    if let Some(content) = choice.message.content {
        blocks.push(Block::text(content));
    }
    for call in choice.message.tool_calls.unwrap_or_default() {
        blocks.push(Block::new(BlockPart::ToolUse {
            id: call.id,
            name: call.function.name,
            arguments: call.function.arguments,
        }));
    }

    Ok(UnifiedResponse {
        id: resp.id,
        model: resp.model,
        message: UnifiedMessage::new(Role::Assistant, blocks),
        finish_reason: choice
            .finish_reason
            .map(finish_to_unified)
            .unwrap_or(FinishReason::Stop),
        usage: resp.usage.map(usage_to_unified).unwrap_or_default(),
    })
}

pub fn unified_to_response(resp: &UnifiedResponse) -> ChatCompletion {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in &resp.message.blocks {
        match &block.part {
            BlockPart::Text { text } => content.push_str(text),
            BlockPart::Thinking { text, .. } => reasoning.push_str(text),
            BlockPart::ToolUse {
                id,
                name,
                arguments,
            } => tool_calls.push(ToolCall {
                id: id.clone(),
                kind: ToolCallKind::Function,
                function: FunctionCall {
                    name: name.clone(),
                    arguments: arguments.clone(),
                },
            }),
            _ => {}
        }
    }

    ChatCompletion {
        id: resp.id.clone(),
        object: "chat.completion".to_string(),
        created: now_epoch_seconds(),
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: (!content.is_empty()).then_some(content),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: Some(finish_to_wire(resp.finish_reason)),
        }],
        usage: Some(usage_to_wire(&resp.usage)),
    }
}

/// Upstream OpenAI-style chunk -> unified delta.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    role_seen: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: &str) -> Result<Option<UnifiedDelta>, TranslateError> {
        let chunk: ChatCompletionChunk = serde_json::from_str(payload)
            .map_err(|err| TranslateError::Invalid(format!("bad chunk: {err}")))?;

        let mut delta = UnifiedDelta::default();
        if let Some(usage) = chunk.usage {
            delta.usage = Some(usage_to_unified(usage));
        }
        let Some(choice) = chunk.choices.into_iter().next() else {
            // Usage-only trailer chunk.
            return Ok(delta.usage.is_some().then_some(delta));
        };

        if choice.delta.role.is_some() && !self.role_seen {
            self.role_seen = true;
            delta.role = Some(Role::Assistant);
        }
        delta.content = choice.delta.content.filter(|text| !text.is_empty());
        delta.reasoning = choice.delta.reasoning_content.filter(|text| !text.is_empty());
        for call in choice.delta.tool_calls.unwrap_or_default() {
            delta.tool_calls.push(ToolCallDelta {
                index: call.index,
                id: call.id,
                name: call.function.as_ref().and_then(|f| f.name.clone()),
                arguments: call
                    .function
                    .and_then(|f| f.arguments)
                    .unwrap_or_default(),
            });
        }
        delta.finish_reason = choice.finish_reason.map(finish_to_unified);

        if delta.role.is_none()
            && delta.content.is_none()
            && delta.reasoning.is_none()
            && delta.tool_calls.is_empty()
            && delta.finish_reason.is_none()
            && delta.usage.is_none()
        {
            return Ok(None);
        }
        Ok(Some(delta))
    }
}

/// Unified delta -> OpenAI-style chunk. Emits the synthetic assistant role
/// exactly once and upgrades the terminal reason to `tool_calls` when tool
/// calls were opened on the stream.
#[derive(Debug)]
pub struct StreamEncoder {
    id: String,
    model: String,
    created: i64,
    role_emitted: bool,
    finished: bool,
    announced: BTreeSet<u32>,
}

impl StreamEncoder {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created: now_epoch_seconds(),
            role_emitted: false,
            finished: false,
            announced: BTreeSet::new(),
        }
    }

    pub fn push(&mut self, delta: &UnifiedDelta) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();

        if !self.role_emitted {
            self.role_emitted = true;
            // Synthetic leading role chunk, even when the upstream never sent one.
            out.push(self.chunk(
                ChunkDelta {
                    role: Some("assistant".to_string()),
                    ..ChunkDelta::default()
                },
                None,
                None,
            ));
        }

        let mut body = ChunkDelta::default();
        let mut has_body = false;
        if let Some(content) = &delta.content {
            body.content = Some(content.clone());
            has_body = true;
        }
        if let Some(reasoning) = &delta.reasoning {
            body.reasoning_content = Some(reasoning.clone());
            has_body = true;
        }
        if !delta.tool_calls.is_empty() {
            let mut calls = Vec::new();
            for call in &delta.tool_calls {
                let first = self.announced.insert(call.index);
                calls.push(ToolCallChunk {
                    index: call.index,
                    id: if first { call.id.clone() } else { None },
                    kind: first.then_some(ToolCallKind::Function),
                    function: Some(FunctionCallChunk {
                        name: if first { call.name.clone() } else { None },
                        arguments: (!call.arguments.is_empty())
                            .then(|| call.arguments.clone()),
                    }),
                });
            }
            body.tool_calls = Some(calls);
            has_body = true;
        }

        let finish = delta.finish_reason.map(|reason| {
            if reason == FinishReason::Stop && !self.announced.is_empty() {
                WireFinish::ToolCalls
            } else {
                finish_to_wire(reason)
            }
        });
        if finish.is_some() {
            self.finished = true;
        }

        let usage = delta.usage.as_ref().map(usage_to_wire);
        if has_body || finish.is_some() || usage.is_some() {
            out.push(self.chunk(body, finish, usage));
        }
        out
    }

    fn chunk(
        &self,
        delta: ChunkDelta,
        finish_reason: Option<WireFinish>,
        usage: Option<Usage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

fn content_to_blocks(content: MessageContent) -> Vec<Block> {
    match content {
        MessageContent::Text(text) => vec![Block::text(text)],
        MessageContent::Parts(parts) => parts
            .into_iter()
            .map(|part| match part {
                ContentPart::Text { text } => Block::text(text),
                ContentPart::ImageUrl { image_url } => Block::new(BlockPart::Image {
                    source: parse_image_url(image_url.url),
                }),
                ContentPart::InputAudio { input_audio } => Block::new(BlockPart::InputAudio {
                    data: input_audio.data,
                }),
                ContentPart::File { file } => Block::new(BlockPart::File {
                    data: file.file_data.unwrap_or_default(),
                    name: file.filename,
                }),
            })
            .collect(),
    }
}

fn blocks_to_parts(blocks: &[Block], warnings: &mut Vec<DropWarning>) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    for block in blocks {
        match &block.part {
            BlockPart::Text { text } => parts.push(ContentPart::Text { text: text.clone() }),
            BlockPart::Image { source } => parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: image_source_url(source),
                    detail: None,
                },
            }),
            BlockPart::InputAudio { data } => parts.push(ContentPart::InputAudio {
                input_audio: InputAudio {
                    data: data.clone(),
                    format: None,
                },
            }),
            BlockPart::File { data, name } => parts.push(ContentPart::File {
                file: polygate_protocol::openai::FilePart {
                    file_data: Some(data.clone()),
                    filename: name.clone(),
                },
            }),
            other => warnings.push(drop_warning(other)),
        }
    }
    parts
}

fn parse_image_url(url: String) -> ImageSource {
    // data:<mime>;base64,<payload> urls carry the bytes inline.
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((mime, data)) = rest.split_once(";base64,") {
            return ImageSource::Base64 {
                mime: mime.to_string(),
                data: data.to_string(),
            };
        }
    }
    ImageSource::Url(url)
}

fn image_source_url(source: &ImageSource) -> String {
    match source {
        ImageSource::Url(url) => url.clone(),
        ImageSource::Base64 { mime, data } => format!("data:{mime};base64,{data}"),
    }
}

fn flatten_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => {
            let mut out = String::new();
            for part in parts {
                if let ContentPart::Text { text } = part {
                    out.push_str(text);
                }
            }
            out
        }
    }
}

fn joined_block_text(blocks: &[Block]) -> String {
    let mut out = String::new();
    for block in blocks {
        if let BlockPart::Text { text } = &block.part {
            out.push_str(text);
        }
    }
    out
}

fn drop_warning(part: &BlockPart) -> DropWarning {
    let kind = match part {
        BlockPart::Text { .. } => "text",
        BlockPart::Image { .. } => "image",
        BlockPart::InputAudio { .. } => "input_audio",
        BlockPart::File { .. } => "file",
        BlockPart::Thinking { .. } => "thinking",
        BlockPart::ToolUse { .. } => "tool_use",
        BlockPart::ToolResult { .. } => "tool_result",
    };
    DropWarning(format!(
        "dropped {kind} block not representable in openai dialect"
    ))
}

fn tool_choice_to_unified(choice: WireToolChoice) -> Result<ToolChoice, TranslateError> {
    match choice {
        WireToolChoice::Mode(mode) => match mode.as_str() {
            "auto" => Ok(ToolChoice::Auto),
            "none" => Ok(ToolChoice::None),
            "required" => Ok(ToolChoice::Required),
            other => Err(TranslateError::Invalid(format!(
                "unknown tool_choice {other:?}"
            ))),
        },
        WireToolChoice::Named { function, .. } => Ok(ToolChoice::Tool(function.name)),
    }
}

fn tool_choice_to_wire(choice: &ToolChoice) -> WireToolChoice {
    match choice {
        ToolChoice::Auto => WireToolChoice::Mode("auto".to_string()),
        ToolChoice::None => WireToolChoice::Mode("none".to_string()),
        ToolChoice::Required => WireToolChoice::Mode("required".to_string()),
        ToolChoice::Tool(name) => WireToolChoice::Named {
            kind: ToolCallKind::Function,
            function: NamedFunction { name: name.clone() },
        },
    }
}

fn finish_to_unified(reason: WireFinish) -> FinishReason {
    match reason {
        WireFinish::Stop | WireFinish::ContentFilter => FinishReason::Stop,
        WireFinish::Length => FinishReason::Length,
        WireFinish::ToolCalls => FinishReason::ToolCalls,
        WireFinish::Error => FinishReason::Error,
    }
}

fn finish_to_wire(reason: FinishReason) -> WireFinish {
    match reason {
        FinishReason::Stop => WireFinish::Stop,
        FinishReason::Length => WireFinish::Length,
        FinishReason::ToolCalls => WireFinish::ToolCalls,
        FinishReason::Error => WireFinish::Error,
    }
}

fn usage_to_unified(usage: Usage) -> UnifiedUsage {
    UnifiedUsage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cache_read_input_tokens: usage
            .prompt_tokens_details
            .and_then(|details| details.cached_tokens),
        cache_creation_input_tokens: None,
        reasoning_tokens: None,
    }
}

fn usage_to_wire(usage: &UnifiedUsage) -> Usage {
    Usage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens + usage.output_tokens,
        prompt_tokens_details: usage.cache_read_input_tokens.map(|cached| {
            polygate_protocol::openai::PromptTokensDetails {
                cached_tokens: Some(cached),
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> ChatCompletionRequest {
        serde_json::from_value(serde_json::json!({
            "model": "gpt-test",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "search", "arguments": "{\"q\": \"x\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "42"}
            ],
            "tools": [{"type": "function", "function": {"name": "search",
                "parameters": {"type": "object"}}}],
            "tool_choice": "auto"
        }))
        .unwrap()
    }

    #[test]
    fn request_round_trip_preserves_tool_arguments_verbatim() {
        let unified = request_to_unified(sample_request()).unwrap();
        let (back, warnings) = unified_to_request(&unified);
        assert!(warnings.is_empty());

        let assistant = back
            .messages
            .iter()
            .find_map(|message| match message {
                ChatMessage::Assistant { tool_calls, .. } => tool_calls.as_ref(),
                _ => None,
            })
            .unwrap();
        // The exact original argument text survives, spacing included.
        assert_eq!(assistant[0].function.arguments, "{\"q\": \"x\"}");
        assert_eq!(back.model, "gpt-test");
    }

    #[test]
    fn tool_role_maps_to_tool_result_block() {
        let unified = request_to_unified(sample_request()).unwrap();
        let tool_msg = unified
            .messages
            .iter()
            .find(|message| message.role == Role::Tool)
            .unwrap();
        match &tool_msg.blocks[0].part {
            BlockPart::ToolResult {
                call_id, content, ..
            } => {
                assert_eq!(call_id, "call_1");
                assert_eq!(content, "42");
            }
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn encoder_emits_role_chunk_once() {
        let mut encoder = StreamEncoder::new("c1", "gpt-test");
        let chunks = encoder.push(&UnifiedDelta::content("hello"));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("hello"));

        let more = encoder.push(&UnifiedDelta::content(" world"));
        assert_eq!(more.len(), 1);
        assert!(more[0].choices[0].delta.role.is_none());
    }

    #[test]
    fn encoder_strips_repeat_tool_identity_and_upgrades_finish() {
        let mut encoder = StreamEncoder::new("c1", "gpt-test");
        encoder.push(&UnifiedDelta {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some("call_9".to_string()),
                name: Some("search".to_string()),
                arguments: "{\"q\"".to_string(),
            }],
            ..UnifiedDelta::default()
        });
        let frag = encoder.push(&UnifiedDelta {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some("call_9".to_string()),
                name: Some("search".to_string()),
                arguments: ":1}".to_string(),
            }],
            ..UnifiedDelta::default()
        });
        let calls = frag[0].choices[0].delta.tool_calls.as_ref().unwrap();
        assert!(calls[0].id.is_none());
        assert!(calls[0].function.as_ref().unwrap().name.is_none());

        let done = encoder.push(&UnifiedDelta::finish(FinishReason::Stop));
        assert_eq!(
            done[0].choices[0].finish_reason,
            Some(WireFinish::ToolCalls)
        );
    }

    #[test]
    fn decoder_passes_fields_through() {
        let mut decoder = StreamDecoder::new();
        let delta = decoder
            .push(r#"{"id":"c","object":"chat.completion.chunk","created":0,"model":"m","choices":[{"index":0,"delta":{"role":"assistant","content":"hi"},"finish_reason":null}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(delta.role, Some(Role::Assistant));
        assert_eq!(delta.content.as_deref(), Some("hi"));

        let fin = decoder
            .push(r#"{"id":"c","object":"chat.completion.chunk","created":0,"model":"m","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(fin.finish_reason, Some(FinishReason::Stop));
    }
}
