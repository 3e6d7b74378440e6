//! Anthropic-dialect codec. Block-structured messages map almost one-to-one
//! onto the unified form; the interesting part is the typed stream event
//! machine with its content-block index bookkeeping.

use std::collections::HashMap;

use polygate_protocol::anthropic::{
    BlockDelta, CacheControl, ContentBlock, CountTokensRequest, Message, MessageContent,
    MessageDeltaBody, MessageKind, MessagesRequest, MessagesResponse, Metadata, ResponseRole,
    Role as WireRole, StopReason, StreamEvent, SystemBlock, SystemPrompt, TextBlockKind,
    ToolChoice as WireToolChoice, ToolDef, ToolResultContent, Usage,
};
use polygate_protocol::error::WireErrorDetail;
use serde_json::Value;

use crate::unified::{
    Block, BlockPart, CacheTtl, FinishReason, ImageSource, Role, ToolCallDelta, ToolChoice,
    ToolSpec, UnifiedDelta, UnifiedMessage, UnifiedRequest, UnifiedResponse, UnifiedUsage,
};
use crate::{DropWarning, TranslateError};

/// Dialect B requires max_tokens; used when the unified request leaves it out.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub fn request_to_unified(req: MessagesRequest) -> Result<UnifiedRequest, TranslateError> {
    if req.model.is_empty() {
        return Err(TranslateError::Invalid("missing model".to_string()));
    }

    let mut unified = UnifiedRequest::new(req.model);
    unified.stream = req.stream.unwrap_or(false);
    unified.temperature = req.temperature;
    unified.max_tokens = Some(req.max_tokens);
    unified.user_id = req.metadata.and_then(|meta| meta.user_id);
    unified.extra = req.extra;
    unified.tool_choice = req.tool_choice.map(|choice| match choice {
        WireToolChoice::Auto => ToolChoice::Auto,
        WireToolChoice::None => ToolChoice::None,
        WireToolChoice::Any => ToolChoice::Required,
        WireToolChoice::Tool { name } => ToolChoice::Tool(name),
    });

    match req.system {
        Some(SystemPrompt::Text(text)) => unified.system.push(Block::text(text)),
        Some(SystemPrompt::Blocks(blocks)) => {
            for block in blocks {
                let mut unified_block = Block::text(block.text);
                unified_block.cache_control = block.cache_control.map(ttl_of);
                unified.system.push(unified_block);
            }
        }
        None => {}
    }

    for tool in req.tools.unwrap_or_default() {
        unified.tools.push(ToolSpec {
            name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
        });
    }

    for message in req.messages {
        let role = match message.role {
            WireRole::User => Role::User,
            WireRole::Assistant => Role::Assistant,
        };
        let blocks = match message.content {
            MessageContent::Text(text) => vec![ContentBlock::Text {
                text,
                cache_control: None,
            }],
            MessageContent::Blocks(blocks) => blocks,
        };

        // Tool results become standalone tool-role messages; everything else
        // stays on the original turn.
        let mut plain = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                    ..
                } => {
                    if !plain.is_empty() {
                        unified
                            .messages
                            .push(UnifiedMessage::new(role, std::mem::take(&mut plain)));
                    }
                    let mut message = UnifiedMessage::new(
                        Role::Tool,
                        vec![Block::new(BlockPart::ToolResult {
                            call_id: tool_use_id.clone(),
                            content: tool_result_text(content),
                            is_error: is_error.unwrap_or(false),
                        })],
                    );
                    message.tool_call_id = Some(tool_use_id);
                    unified.messages.push(message);
                }
                other => plain.push(block_to_unified(other)?),
            }
        }
        if !plain.is_empty() {
            unified.messages.push(UnifiedMessage::new(role, plain));
        }
    }

    Ok(unified)
}

pub fn unified_to_request(unified: &UnifiedRequest) -> (MessagesRequest, Vec<DropWarning>) {
    let mut warnings = Vec::new();
    let mut system = Vec::new();
    for block in &unified.system {
        if let BlockPart::Text { text } = &block.part {
            system.push(SystemBlock {
                kind: TextBlockKind::Text,
                text: text.clone(),
                cache_control: block.cache_control.map(marker_of),
            });
        }
    }

    let mut messages: Vec<Message> = Vec::new();
    for message in &unified.messages {
        match message.role {
            Role::System => {
                system.push(SystemBlock {
                    kind: TextBlockKind::Text,
                    text: message.joined_text(),
                    cache_control: None,
                });
            }
            Role::User | Role::Assistant => {
                let wire_role = if message.role == Role::User {
                    WireRole::User
                } else {
                    WireRole::Assistant
                };
                let blocks: Vec<ContentBlock> = message
                    .blocks
                    .iter()
                    .filter_map(|block| block_to_wire(block, &mut warnings))
                    .collect();
                if !blocks.is_empty() {
                    messages.push(Message {
                        role: wire_role,
                        content: MessageContent::Blocks(blocks),
                    });
                }
            }
            Role::Tool => {
                // Tool results ride on a user turn in this dialect.
                let blocks: Vec<ContentBlock> = message
                    .blocks
                    .iter()
                    .filter_map(|block| block_to_wire(block, &mut warnings))
                    .collect();
                if !blocks.is_empty() {
                    messages.push(Message {
                        role: WireRole::User,
                        content: MessageContent::Blocks(blocks),
                    });
                }
            }
        }
    }

    let tools: Vec<ToolDef> = unified
        .tools
        .iter()
        .map(|tool| ToolDef {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
            cache_control: None,
        })
        .collect();

    let request = MessagesRequest {
        model: unified.model.clone(),
        max_tokens: unified.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: (!system.is_empty()).then_some(SystemPrompt::Blocks(system)),
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice: unified.tool_choice.as_ref().map(|choice| match choice {
            ToolChoice::Auto => WireToolChoice::Auto,
            ToolChoice::None => WireToolChoice::None,
            ToolChoice::Required => WireToolChoice::Any,
            ToolChoice::Tool(name) => WireToolChoice::Tool { name: name.clone() },
        }),
        stream: unified.stream.then_some(true),
        temperature: unified.temperature,
        metadata: unified.user_id.clone().map(|user_id| Metadata {
            user_id: Some(user_id),
        }),
        extra: unified.extra.clone(),
    };
    (request, warnings)
}

pub fn count_tokens_to_unified(req: CountTokensRequest) -> Result<UnifiedRequest, TranslateError> {
    request_to_unified(MessagesRequest {
        model: req.model,
        max_tokens: DEFAULT_MAX_TOKENS,
        messages: req.messages,
        system: req.system,
        tools: req.tools,
        tool_choice: None,
        stream: None,
        temperature: None,
        metadata: None,
        extra: serde_json::Map::new(),
    })
}

pub fn response_to_unified(resp: MessagesResponse) -> Result<UnifiedResponse, TranslateError> {
    let mut blocks = Vec::new();
    for block in resp.content {
        blocks.push(block_to_unified(block)?);
    }
    Ok(UnifiedResponse {
        id: resp.id,
        model: resp.model,
        message: UnifiedMessage::new(Role::Assistant, blocks),
        finish_reason: resp
            .stop_reason
            .map(stop_to_unified)
            .unwrap_or(FinishReason::Stop),
        usage: usage_to_unified(&resp.usage),
    })
}

pub fn unified_to_response(resp: &UnifiedResponse) -> MessagesResponse {
    let mut warnings = Vec::new();
    let content: Vec<ContentBlock> = resp
        .message
        .blocks
        .iter()
        .filter_map(|block| block_to_wire(block, &mut warnings))
        .collect();
    MessagesResponse {
        id: resp.id.clone(),
        kind: MessageKind::Message,
        role: ResponseRole::Assistant,
        model: resp.model.clone(),
        content,
        stop_reason: Some(finish_to_stop(resp.finish_reason)),
        stop_sequence: None,
        usage: usage_to_wire(&resp.usage),
    }
}

/// Upstream Anthropic stream event -> unified deltas.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    tool_indexes: HashMap<u32, u32>,
    next_tool_index: u32,
    base_usage: UnifiedUsage,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: &str) -> Result<Vec<UnifiedDelta>, TranslateError> {
        let event: StreamEvent = serde_json::from_str(payload)
            .map_err(|err| TranslateError::Invalid(format!("bad stream event: {err}")))?;
        Ok(self.push_event(event))
    }

    pub fn push_event(&mut self, event: StreamEvent) -> Vec<UnifiedDelta> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.base_usage = usage_to_unified(&message.usage);
                vec![UnifiedDelta::role(Role::Assistant)]
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::Text { text, .. } if !text.is_empty() => {
                    vec![UnifiedDelta::content(text)]
                }
                ContentBlock::Thinking { thinking, .. } if !thinking.is_empty() => {
                    vec![UnifiedDelta::reasoning(thinking)]
                }
                ContentBlock::RedactedThinking { data } if !data.is_empty() => {
                    vec![UnifiedDelta::reasoning(data)]
                }
                ContentBlock::ToolUse {
                    id, name, input, ..
                } => {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_indexes.insert(index, tool_index);
                    let seeded = match &input {
                        Value::Object(map) if map.is_empty() => String::new(),
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    vec![UnifiedDelta {
                        tool_calls: vec![ToolCallDelta {
                            index: tool_index,
                            id: Some(id),
                            name: Some(name),
                            arguments: seeded,
                        }],
                        ..UnifiedDelta::default()
                    }]
                }
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } if !text.is_empty() => {
                    vec![UnifiedDelta::content(text)]
                }
                BlockDelta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                    vec![UnifiedDelta::reasoning(thinking)]
                }
                BlockDelta::InputJsonDelta { partial_json } if !partial_json.is_empty() => {
                    let Some(tool_index) = self.tool_indexes.get(&index).copied() else {
                        return Vec::new();
                    };
                    vec![UnifiedDelta {
                        tool_calls: vec![ToolCallDelta {
                            index: tool_index,
                            id: None,
                            name: None,
                            arguments: partial_json,
                        }],
                        ..UnifiedDelta::default()
                    }]
                }
                _ => Vec::new(),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                let mut merged = self.base_usage;
                if let Some(usage) = usage {
                    merged.output_tokens = usage.output_tokens;
                    if usage.input_tokens > 0 {
                        merged.input_tokens = usage.input_tokens;
                    }
                }
                match delta.stop_reason {
                    Some(stop) => {
                        self.finished = true;
                        vec![UnifiedDelta {
                            finish_reason: Some(stop_to_unified(stop)),
                            usage: Some(merged),
                            ..UnifiedDelta::default()
                        }]
                    }
                    None => vec![UnifiedDelta {
                        usage: Some(merged),
                        ..UnifiedDelta::default()
                    }],
                }
            }
            StreamEvent::MessageStop => {
                if self.finished {
                    Vec::new()
                } else {
                    self.finished = true;
                    vec![UnifiedDelta::finish(FinishReason::Stop)]
                }
            }
            StreamEvent::Error { error } => {
                self.finished = true;
                let _ = error;
                vec![UnifiedDelta::finish(FinishReason::Error)]
            }
            StreamEvent::ContentBlockStop { .. } | StreamEvent::Ping => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    Thinking,
    Tool(u32),
}

/// Unified deltas -> typed Anthropic stream events, with content-block index
/// bookkeeping. Blocks open lazily and close when the channel switches.
#[derive(Debug)]
pub struct StreamEncoder {
    id: String,
    model: String,
    started: bool,
    finished: bool,
    next_index: u32,
    open: Option<OpenBlock>,
    tool_blocks: HashMap<u32, u32>,
    usage: UnifiedUsage,
}

impl StreamEncoder {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            started: false,
            finished: false,
            next_index: 0,
            open: None,
            tool_blocks: HashMap::new(),
            usage: UnifiedUsage::default(),
        }
    }

    pub fn push(&mut self, delta: &UnifiedDelta) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();

        if let Some(usage) = &delta.usage {
            self.merge_usage(usage);
        }
        if !self.started {
            self.started = true;
            out.push(self.message_start());
        }

        if let Some(reasoning) = &delta.reasoning {
            self.ensure_open(OpenBlock::Thinking, &mut out);
            out.push(StreamEvent::ContentBlockDelta {
                index: self.current_index(),
                delta: BlockDelta::ThinkingDelta {
                    thinking: reasoning.clone(),
                },
            });
        }
        if let Some(content) = &delta.content {
            self.ensure_open(OpenBlock::Text, &mut out);
            out.push(StreamEvent::ContentBlockDelta {
                index: self.current_index(),
                delta: BlockDelta::TextDelta {
                    text: content.clone(),
                },
            });
        }
        for call in &delta.tool_calls {
            if let (Some(id), Some(name)) = (&call.id, &call.name) {
                if !self.tool_blocks.contains_key(&call.index) {
                    self.close_open(&mut out);
                    let block_index = self.next_index;
                    self.next_index += 1;
                    self.tool_blocks.insert(call.index, block_index);
                    self.open = Some(OpenBlock::Tool(call.index));
                    out.push(StreamEvent::ContentBlockStart {
                        index: block_index,
                        content_block: ContentBlock::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            input: serde_json::json!({}),
                            cache_control: None,
                        },
                    });
                }
            }
            if !call.arguments.is_empty() {
                if let Some(block_index) = self.tool_blocks.get(&call.index).copied() {
                    out.push(StreamEvent::ContentBlockDelta {
                        index: block_index,
                        delta: BlockDelta::InputJsonDelta {
                            partial_json: call.arguments.clone(),
                        },
                    });
                }
            }
        }

        if let Some(reason) = delta.finish_reason {
            self.finished = true;
            self.close_open(&mut out);
            let reason = if reason == FinishReason::Stop && !self.tool_blocks.is_empty() {
                FinishReason::ToolCalls
            } else {
                reason
            };
            if reason == FinishReason::Error {
                out.push(StreamEvent::Error {
                    error: WireErrorDetail {
                        message: "upstream stream failed".to_string(),
                        kind: "upstream_error".to_string(),
                        code: None,
                    },
                });
            } else {
                out.push(StreamEvent::MessageDelta {
                    delta: MessageDeltaBody {
                        stop_reason: Some(finish_to_stop(reason)),
                        stop_sequence: None,
                    },
                    usage: Some(usage_to_wire(&self.usage)),
                });
            }
            out.push(StreamEvent::MessageStop);
        }

        out
    }

    fn message_start(&self) -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessagesResponse {
                id: self.id.clone(),
                kind: MessageKind::Message,
                role: ResponseRole::Assistant,
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: usage_to_wire(&self.usage),
            },
        }
    }

    fn ensure_open(&mut self, kind: OpenBlock, out: &mut Vec<StreamEvent>) {
        if self.open == Some(kind) {
            return;
        }
        self.close_open(out);
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some(kind);
        let content_block = match kind {
            OpenBlock::Text => ContentBlock::Text {
                text: String::new(),
                cache_control: None,
            },
            OpenBlock::Thinking => ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
            OpenBlock::Tool(_) => unreachable!("tool blocks open via tool_calls"),
        };
        out.push(StreamEvent::ContentBlockStart {
            index,
            content_block,
        });
    }

    fn close_open(&mut self, out: &mut Vec<StreamEvent>) {
        if self.open.take().is_some() {
            out.push(StreamEvent::ContentBlockStop {
                index: self.next_index - 1,
            });
        }
    }

    fn current_index(&self) -> u32 {
        self.next_index - 1
    }

    fn merge_usage(&mut self, usage: &UnifiedUsage) {
        if usage.input_tokens > 0 {
            self.usage.input_tokens = usage.input_tokens;
        }
        if usage.output_tokens > 0 {
            self.usage.output_tokens = usage.output_tokens;
        }
        if usage.cache_read_input_tokens.is_some() {
            self.usage.cache_read_input_tokens = usage.cache_read_input_tokens;
        }
        if usage.cache_creation_input_tokens.is_some() {
            self.usage.cache_creation_input_tokens = usage.cache_creation_input_tokens;
        }
    }
}

fn block_to_unified(block: ContentBlock) -> Result<Block, TranslateError> {
    let unified = match block {
        ContentBlock::Text {
            text,
            cache_control,
        } => Block {
            part: BlockPart::Text { text },
            cache_control: cache_control.map(ttl_of),
        },
        ContentBlock::Image {
            source,
            cache_control,
        } => Block {
            part: BlockPart::Image {
                source: media_to_unified(source),
            },
            cache_control: cache_control.map(ttl_of),
        },
        ContentBlock::Document {
            source,
            cache_control,
        } => Block {
            part: BlockPart::File {
                data: match media_to_unified(source) {
                    ImageSource::Url(url) => url,
                    ImageSource::Base64 { data, .. } => data,
                },
                name: None,
            },
            cache_control: cache_control.map(ttl_of),
        },
        ContentBlock::Thinking {
            thinking,
            signature,
        } => Block::new(BlockPart::Thinking {
            text: thinking,
            signature,
        }),
        ContentBlock::RedactedThinking { data } => Block::new(BlockPart::Thinking {
            text: data,
            signature: None,
        }),
        ContentBlock::ToolUse {
            id,
            name,
            input,
            cache_control,
        } => Block {
            part: BlockPart::ToolUse {
                id,
                name,
                arguments: input.to_string(),
            },
            cache_control: cache_control.map(ttl_of),
        },
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
            ..
        } => Block::new(BlockPart::ToolResult {
            call_id: tool_use_id,
            content: tool_result_text(content),
            is_error: is_error.unwrap_or(false),
        }),
    };
    Ok(unified)
}

fn block_to_wire(block: &Block, warnings: &mut Vec<DropWarning>) -> Option<ContentBlock> {
    let cache_control = block.cache_control.map(marker_of);
    match &block.part {
        BlockPart::Text { text } => Some(ContentBlock::Text {
            text: text.clone(),
            cache_control,
        }),
        BlockPart::Image { source } => Some(ContentBlock::Image {
            source: media_to_wire(source),
            cache_control,
        }),
        BlockPart::Thinking { text, signature } => Some(ContentBlock::Thinking {
            thinking: text.clone(),
            signature: signature.clone(),
        }),
        BlockPart::ToolUse {
            id,
            name,
            arguments,
        } => Some(ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: parse_arguments(arguments),
            cache_control,
        }),
        BlockPart::ToolResult {
            call_id,
            content,
            is_error,
        } => Some(ContentBlock::ToolResult {
            tool_use_id: call_id.clone(),
            content: Some(ToolResultContent::Text(content.clone())),
            is_error: (*is_error).then_some(true),
            cache_control,
        }),
        BlockPart::InputAudio { .. } => {
            warnings.push(DropWarning(
                "dropped input_audio block not representable in anthropic dialect".to_string(),
            ));
            None
        }
        BlockPart::File { data, .. } => Some(ContentBlock::Document {
            source: polygate_protocol::anthropic::MediaSource::Base64 {
                media_type: "application/pdf".to_string(),
                data: data.clone(),
            },
            cache_control,
        }),
    }
}

/// Parses accumulated tool arguments; malformed JSON stays available as a raw
/// string value rather than failing the request.
pub fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(arguments).unwrap_or(Value::String(arguments.to_string()))
}

fn media_to_unified(source: polygate_protocol::anthropic::MediaSource) -> ImageSource {
    match source {
        polygate_protocol::anthropic::MediaSource::Base64 { media_type, data } => {
            ImageSource::Base64 {
                mime: media_type,
                data,
            }
        }
        polygate_protocol::anthropic::MediaSource::Url { url } => ImageSource::Url(url),
    }
}

fn media_to_wire(source: &ImageSource) -> polygate_protocol::anthropic::MediaSource {
    match source {
        ImageSource::Base64 { mime, data } => polygate_protocol::anthropic::MediaSource::Base64 {
            media_type: mime.clone(),
            data: data.clone(),
        },
        ImageSource::Url(url) => polygate_protocol::anthropic::MediaSource::Url { url: url.clone() },
    }
}

fn tool_result_text(content: Option<ToolResultContent>) -> String {
    match content {
        Some(ToolResultContent::Text(text)) => text,
        Some(ToolResultContent::Blocks(blocks)) => {
            let mut out = String::new();
            for block in blocks {
                if let ContentBlock::Text { text, .. } = block {
                    out.push_str(&text);
                }
            }
            out
        }
        None => String::new(),
    }
}

fn ttl_of(control: CacheControl) -> CacheTtl {
    CacheTtl::from_marker(control.ttl.as_deref())
}

fn marker_of(ttl: CacheTtl) -> CacheControl {
    match ttl {
        CacheTtl::FiveMinutes => CacheControl::ephemeral(None),
        CacheTtl::OneHour => CacheControl::ephemeral(Some("1h")),
    }
}

fn stop_to_unified(stop: StopReason) -> FinishReason {
    match stop {
        StopReason::EndTurn | StopReason::StopSequence | StopReason::Refusal => FinishReason::Stop,
        StopReason::MaxTokens => FinishReason::Length,
        StopReason::ToolUse => FinishReason::ToolCalls,
    }
}

fn finish_to_stop(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop | FinishReason::Error => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls => StopReason::ToolUse,
    }
}

fn usage_to_unified(usage: &Usage) -> UnifiedUsage {
    UnifiedUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_input_tokens: usage.cache_read_input_tokens,
        cache_creation_input_tokens: usage.cache_creation_input_tokens,
        reasoning_tokens: None,
    }
}

fn usage_to_wire(usage: &UnifiedUsage) -> Usage {
    Usage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_input_tokens: usage.cache_read_input_tokens,
        cache_creation_input_tokens: usage.cache_creation_input_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_markers_survive_round_trip() {
        let req: MessagesRequest = serde_json::from_value(serde_json::json!({
            "model": "m",
            "max_tokens": 100,
            "system": [{"type": "text", "text": "sys", "cache_control": {"type": "ephemeral", "ttl": "1h"}}],
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "prefix", "cache_control": {"type": "ephemeral"}},
                {"type": "text", "text": "tail"}
            ]}]
        }))
        .unwrap();

        let unified = request_to_unified(req).unwrap();
        assert_eq!(unified.system[0].cache_control, Some(CacheTtl::OneHour));
        assert_eq!(
            unified.messages[0].blocks[0].cache_control,
            Some(CacheTtl::FiveMinutes)
        );
        assert_eq!(unified.messages[0].blocks[1].cache_control, None);

        let (back, warnings) = unified_to_request(&unified);
        assert!(warnings.is_empty());
        let Some(SystemPrompt::Blocks(system)) = back.system else {
            panic!("expected system blocks");
        };
        assert_eq!(system[0].cache_control.as_ref().unwrap().ttl.as_deref(), Some("1h"));
    }

    #[test]
    fn tool_result_blocks_split_into_tool_messages() {
        let req: MessagesRequest = serde_json::from_value(serde_json::json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "found"},
                    {"type": "text", "text": "now summarise"}
                ]}
            ]
        }))
        .unwrap();

        let unified = request_to_unified(req).unwrap();
        assert_eq!(unified.messages.len(), 3);
        assert_eq!(unified.messages[1].role, Role::Tool);
        assert_eq!(unified.messages[2].role, Role::User);
    }

    #[test]
    fn encoder_tracks_block_indexes() {
        let mut encoder = StreamEncoder::new("msg_1", "m");
        let events = encoder.push(&UnifiedDelta::reasoning("hmm"));
        // message_start, content_block_start(thinking), content_block_delta
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(matches!(
            events[1],
            StreamEvent::ContentBlockStart { index: 0, .. }
        ));

        let events = encoder.push(&UnifiedDelta::content("hi"));
        // thinking block closes, text block opens at index 1
        assert!(matches!(
            events[0],
            StreamEvent::ContentBlockStop { index: 0 }
        ));
        assert!(matches!(
            events[1],
            StreamEvent::ContentBlockStart { index: 1, .. }
        ));

        let events = encoder.push(&UnifiedDelta::finish(FinishReason::Stop));
        assert!(matches!(
            events[0],
            StreamEvent::ContentBlockStop { index: 1 }
        ));
        assert!(matches!(events[1], StreamEvent::MessageDelta { .. }));
        assert!(matches!(events[2], StreamEvent::MessageStop));
    }

    #[test]
    fn decoder_maps_tool_use_blocks_to_fragments() {
        let mut decoder = StreamDecoder::new();
        decoder.push_event(StreamEvent::ContentBlockStart {
            index: 1,
            content_block: ContentBlock::ToolUse {
                id: "toolu_1".to_string(),
                name: "search".to_string(),
                input: serde_json::json!({}),
                cache_control: None,
            },
        });
        let deltas = decoder.push_event(StreamEvent::ContentBlockDelta {
            index: 1,
            delta: BlockDelta::InputJsonDelta {
                partial_json: "{\"q\":".to_string(),
            },
        });
        assert_eq!(deltas[0].tool_calls[0].index, 0);
        assert_eq!(deltas[0].tool_calls[0].arguments, "{\"q\":");
        assert!(deltas[0].tool_calls[0].id.is_none());
    }
}
