//! Gemini-dialect codec. This dialect has no tool-call ids and no reasoning
//! channel on the wire, so the codec synthesises call ids on the way in and
//! suppresses (while still counting) thinking tokens on the way out.

use std::collections::{BTreeMap, HashMap};

use polygate_protocol::gemini::{
    Candidate, Content, ContentRole, FunctionCallingConfig, FunctionCallingMode, FunctionDecl,
    GeminiFinishReason, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part,
    ToolConfig, ToolDecl, UsageMetadata,
};
use serde_json::Value;

use crate::anthropic::parse_arguments;
use crate::unified::{
    Block, BlockPart, FinishReason, ImageSource, Role, ToolCallDelta, ToolChoice, ToolSpec,
    UnifiedDelta, UnifiedMessage, UnifiedRequest, UnifiedResponse, UnifiedUsage,
};
use crate::{DropWarning, TranslateError};

pub fn request_to_unified(
    model: &str,
    req: GenerateContentRequest,
) -> Result<UnifiedRequest, TranslateError> {
    if model.is_empty() {
        return Err(TranslateError::Invalid("missing model".to_string()));
    }

    let mut unified = UnifiedRequest::new(model);
    unified.extra = req.extra;
    if let Some(config) = req.generation_config {
        unified.temperature = config.temperature;
        unified.max_tokens = config.max_output_tokens;
    }
    if let Some(system) = req.system_instruction {
        for part in system.parts {
            if let Some(text) = part.text {
                unified.system.push(Block::text(text));
            }
        }
    }
    for decl_group in req.tools.unwrap_or_default() {
        for decl in decl_group.function_declarations {
            unified.tools.push(ToolSpec {
                name: decl.name,
                description: decl.description,
                input_schema: decl.parameters.unwrap_or_else(|| serde_json::json!({})),
            });
        }
    }
    if let Some(config) = req.tool_config {
        let calling = config.function_calling_config;
        unified.tool_choice = Some(match calling.mode {
            FunctionCallingMode::Auto => ToolChoice::Auto,
            FunctionCallingMode::None => ToolChoice::None,
            FunctionCallingMode::Any => match calling
                .allowed_function_names
                .as_deref()
                .and_then(|names| (names.len() == 1).then(|| names[0].clone()))
            {
                Some(name) => ToolChoice::Tool(name),
                None => ToolChoice::Required,
            },
        });
    }

    // Synthesised call ids; functionResponse parts match back by name.
    let mut call_seq = 0u32;
    let mut ids_by_name: HashMap<String, String> = HashMap::new();

    for content in req.contents {
        let role = match content.role {
            Some(ContentRole::Model) => Role::Assistant,
            _ => Role::User,
        };
        let mut blocks = Vec::new();
        let mut tool_results: Vec<UnifiedMessage> = Vec::new();
        for part in content.parts {
            if let Some(text) = part.text {
                blocks.push(Block::text(text));
            } else if let Some(call) = part.function_call {
                let id = format!("call_{call_seq}");
                call_seq += 1;
                ids_by_name.insert(call.name.clone(), id.clone());
                blocks.push(Block::new(BlockPart::ToolUse {
                    id,
                    name: call.name,
                    arguments: call.args.to_string(),
                }));
            } else if let Some(response) = part.function_response {
                let call_id = ids_by_name
                    .get(&response.name)
                    .cloned()
                    .unwrap_or_else(|| format!("call_{}", response.name));
                let mut message = UnifiedMessage::new(
                    Role::Tool,
                    vec![Block::new(BlockPart::ToolResult {
                        call_id: call_id.clone(),
                        content: function_response_text(&response.response),
                        is_error: false,
                    })],
                );
                message.name = Some(response.name);
                message.tool_call_id = Some(call_id);
                tool_results.push(message);
            } else if let Some(inline) = part.inline_data {
                blocks.push(Block::new(BlockPart::Image {
                    source: ImageSource::Base64 {
                        mime: inline.mime_type,
                        data: inline.data,
                    },
                }));
            } else if let Some(file) = part.file_data {
                blocks.push(Block::new(BlockPart::File {
                    data: file.file_uri,
                    name: None,
                }));
            }
        }
        // functionResponse parts precede the rest of the user turn they rode in on.
        unified.messages.extend(tool_results);
        if !blocks.is_empty() {
            unified.messages.push(UnifiedMessage::new(role, blocks));
        }
    }

    Ok(unified)
}

pub fn unified_to_request(
    unified: &UnifiedRequest,
) -> (GenerateContentRequest, Vec<DropWarning>) {
    let mut warnings = Vec::new();
    let mut system_parts = Vec::new();
    for block in &unified.system {
        if let BlockPart::Text { text } = &block.part {
            system_parts.push(Part::text(text.clone()));
        }
    }

    // call id -> tool name, for functionResponse reconstruction.
    let mut names_by_id: HashMap<String, String> = HashMap::new();
    for message in &unified.messages {
        for block in &message.blocks {
            if let BlockPart::ToolUse { id, name, .. } = &block.part {
                names_by_id.insert(id.clone(), name.clone());
            }
        }
    }

    let mut contents: Vec<Content> = Vec::new();
    let mut push_parts = |role: ContentRole, parts: Vec<Part>, contents: &mut Vec<Content>| {
        if parts.is_empty() {
            return;
        }
        // Tool turns fold into the neighbouring user turn.
        if let Some(last) = contents.last_mut() {
            if last.role == Some(role) {
                last.parts.extend(parts);
                return;
            }
        }
        contents.push(Content {
            role: Some(role),
            parts,
        });
    };

    for message in &unified.messages {
        match message.role {
            Role::System => system_parts.push(Part::text(message.joined_text())),
            Role::User | Role::Assistant => {
                let role = if message.role == Role::User {
                    ContentRole::User
                } else {
                    ContentRole::Model
                };
                let mut parts = Vec::new();
                for block in &message.blocks {
                    match &block.part {
                        BlockPart::Text { text } => parts.push(Part::text(text.clone())),
                        BlockPart::ToolUse {
                            name, arguments, ..
                        } => parts.push(Part::function_call(
                            name.clone(),
                            parse_arguments(arguments),
                        )),
                        BlockPart::Image { source } => match source {
                            ImageSource::Base64 { mime, data } => {
                                parts.push(Part::inline_data(mime.clone(), data.clone()))
                            }
                            ImageSource::Url(_) => warnings.push(DropWarning(
                                "dropped url image not representable in gemini dialect"
                                    .to_string(),
                            )),
                        },
                        BlockPart::InputAudio { data } => {
                            parts.push(Part::inline_data("audio/wav", data.clone()))
                        }
                        BlockPart::Thinking { .. } => {
                            // No reasoning channel on this wire; omitted by design of the dialect.
                        }
                        other => warnings.push(gemini_drop_warning(other)),
                    }
                }
                push_parts(role, parts, &mut contents);
            }
            Role::Tool => {
                let mut parts = Vec::new();
                for block in &message.blocks {
                    if let BlockPart::ToolResult {
                        call_id, content, ..
                    } = &block.part
                    {
                        let name = message
                            .name
                            .clone()
                            .or_else(|| names_by_id.get(call_id).cloned())
                            .unwrap_or_else(|| call_id.clone());
                        parts.push(Part::function_response(
                            name,
                            serde_json::json!({ "result": content }),
                        ));
                    }
                }
                push_parts(ContentRole::User, parts, &mut contents);
            }
        }
    }

    let declarations: Vec<FunctionDecl> = unified
        .tools
        .iter()
        .map(|tool| FunctionDecl {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: Some(tool.input_schema.clone()),
        })
        .collect();

    let tool_config = unified.tool_choice.as_ref().map(|choice| ToolConfig {
        function_calling_config: match choice {
            ToolChoice::Auto => FunctionCallingConfig {
                mode: FunctionCallingMode::Auto,
                allowed_function_names: None,
            },
            ToolChoice::None => FunctionCallingConfig {
                mode: FunctionCallingMode::None,
                allowed_function_names: None,
            },
            ToolChoice::Required => FunctionCallingConfig {
                mode: FunctionCallingMode::Any,
                allowed_function_names: None,
            },
            ToolChoice::Tool(name) => FunctionCallingConfig {
                mode: FunctionCallingMode::Any,
                allowed_function_names: Some(vec![name.clone()]),
            },
        },
    });

    let generation_config = (unified.temperature.is_some() || unified.max_tokens.is_some())
        .then_some(GenerationConfig {
            temperature: unified.temperature,
            max_output_tokens: unified.max_tokens,
        });

    let request = GenerateContentRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then_some(Content {
            role: None,
            parts: system_parts,
        }),
        tools: (!declarations.is_empty()).then_some(vec![ToolDecl {
            function_declarations: declarations,
        }]),
        tool_config,
        generation_config,
        extra: unified.extra.clone(),
    };
    (request, warnings)
}

pub fn response_to_unified(
    model: &str,
    resp: GenerateContentResponse,
) -> Result<UnifiedResponse, TranslateError> {
    let id = resp
        .response_id
        .clone()
        .unwrap_or_else(|| format!("gen-{}", uuid::Uuid::new_v4().simple()));
    let usage = resp.usage_metadata.as_ref().map(usage_to_unified).unwrap_or_default();

    let Some(candidate) = resp.candidates.into_iter().next() else {
        return Err(TranslateError::Invalid("response has no candidates".to_string()));
    };

    let mut blocks = Vec::new();
    let mut call_seq = 0u32;
    let mut saw_tool = false;
    for part in candidate.content.parts {
        if let Some(text) = part.text {
            if part.thought == Some(true) {
                blocks.push(Block::new(BlockPart::Thinking {
                    text,
                    signature: None,
                }));
            } else {
                blocks.push(Block::text(text));
            }
        } else if let Some(call) = part.function_call {
            saw_tool = true;
            blocks.push(Block::new(BlockPart::ToolUse {
                id: format!("call_{call_seq}"),
                name: call.name,
                arguments: call.args.to_string(),
            }));
            call_seq += 1;
        }
    }

    let finish_reason = match candidate.finish_reason {
        Some(GeminiFinishReason::MaxTokens) => FinishReason::Length,
        _ if saw_tool => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    };

    Ok(UnifiedResponse {
        id,
        model: model.to_string(),
        message: UnifiedMessage::new(Role::Assistant, blocks),
        finish_reason,
        usage,
    })
}

pub fn unified_to_response(resp: &UnifiedResponse) -> GenerateContentResponse {
    let mut parts = Vec::new();
    for block in &resp.message.blocks {
        match &block.part {
            BlockPart::Text { text } => parts.push(Part::text(text.clone())),
            BlockPart::ToolUse {
                name, arguments, ..
            } => parts.push(Part::function_call(name.clone(), parse_arguments(arguments))),
            _ => {}
        }
    }

    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Content {
                role: Some(ContentRole::Model),
                parts,
            },
            finish_reason: Some(match resp.finish_reason {
                FinishReason::Length => GeminiFinishReason::MaxTokens,
                _ => GeminiFinishReason::Stop,
            }),
            index: Some(0),
        }],
        usage_metadata: Some(usage_to_wire(&resp.usage)),
        model_version: Some(resp.model.clone()),
        response_id: Some(resp.id.clone()),
    }
}

/// Upstream Gemini stream chunk -> unified delta.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    role_sent: bool,
    next_tool_index: u32,
    saw_tool: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: &str) -> Result<Vec<UnifiedDelta>, TranslateError> {
        let chunk: GenerateContentResponse = serde_json::from_str(payload)
            .map_err(|err| TranslateError::Invalid(format!("bad chunk: {err}")))?;

        let mut out = Vec::new();
        if !self.role_sent {
            self.role_sent = true;
            out.push(UnifiedDelta::role(Role::Assistant));
        }

        let usage = chunk.usage_metadata.as_ref().map(usage_to_unified);
        let Some(candidate) = chunk.candidates.into_iter().next() else {
            if let Some(usage) = usage {
                out.push(UnifiedDelta {
                    usage: Some(usage),
                    ..UnifiedDelta::default()
                });
            }
            return Ok(out);
        };

        let mut delta = UnifiedDelta::default();
        for part in candidate.content.parts {
            if let Some(text) = part.text {
                if part.thought == Some(true) {
                    append_field(&mut delta.reasoning, &text);
                } else {
                    append_field(&mut delta.content, &text);
                }
            } else if let Some(call) = part.function_call {
                self.saw_tool = true;
                delta.tool_calls.push(ToolCallDelta {
                    index: self.next_tool_index,
                    id: Some(format!("call_{}", uuid::Uuid::new_v4().simple())),
                    name: Some(call.name),
                    arguments: call.args.to_string(),
                });
                self.next_tool_index += 1;
            }
        }
        delta.usage = usage;
        delta.finish_reason = candidate.finish_reason.map(|reason| match reason {
            GeminiFinishReason::MaxTokens => FinishReason::Length,
            _ if self.saw_tool => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        });

        if delta.content.is_some()
            || delta.reasoning.is_some()
            || !delta.tool_calls.is_empty()
            || delta.finish_reason.is_some()
            || delta.usage.is_some()
        {
            out.push(delta);
        }
        Ok(out)
    }
}

#[derive(Debug, Default)]
struct PendingCall {
    name: Option<String>,
    arguments: String,
}

/// Unified deltas -> Gemini stream chunks. Tool-call argument fragments are
/// buffered until the terminal delta because functionCall parts carry whole
/// argument objects, never increments. Reasoning is suppressed on this wire;
/// its size still lands in thoughtsTokenCount when the upstream did not
/// report one.
#[derive(Debug)]
pub struct StreamEncoder {
    model: String,
    response_id: String,
    pending: BTreeMap<u32, PendingCall>,
    reasoning_chars: usize,
    usage: Option<UnifiedUsage>,
    finished: bool,
}

impl StreamEncoder {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            response_id: id.into(),
            pending: BTreeMap::new(),
            reasoning_chars: 0,
            usage: None,
            finished: false,
        }
    }

    pub fn push(&mut self, delta: &UnifiedDelta) -> Vec<GenerateContentResponse> {
        if self.finished {
            return Vec::new();
        }
        if let Some(usage) = &delta.usage {
            self.usage = Some(*usage);
        }
        if let Some(reasoning) = &delta.reasoning {
            self.reasoning_chars += reasoning.len();
        }
        for call in &delta.tool_calls {
            let entry = self.pending.entry(call.index).or_default();
            if entry.name.is_none() {
                entry.name = call.name.clone();
            }
            entry.arguments.push_str(&call.arguments);
        }

        let mut out = Vec::new();
        if let Some(content) = &delta.content {
            if !content.is_empty() {
                out.push(self.chunk(vec![Part::text(content.clone())], None, None));
            }
        }

        if let Some(reason) = delta.finish_reason {
            self.finished = true;
            let mut parts = Vec::new();
            for call in std::mem::take(&mut self.pending).into_values() {
                let Some(name) = call.name else { continue };
                parts.push(Part::function_call(name, parse_arguments(&call.arguments)));
            }
            let finish = match reason {
                FinishReason::Length => GeminiFinishReason::MaxTokens,
                FinishReason::Error => GeminiFinishReason::Other,
                _ => GeminiFinishReason::Stop,
            };
            let usage = self.final_usage();
            out.push(self.chunk(parts, Some(finish), Some(usage)));
        }
        out
    }

    fn final_usage(&self) -> UsageMetadata {
        let mut usage = self
            .usage
            .as_ref()
            .map(usage_to_wire)
            .unwrap_or_default();
        if usage.thoughts_token_count.is_none() && self.reasoning_chars > 0 {
            usage.thoughts_token_count = Some(self.reasoning_chars.div_ceil(4) as u64);
        }
        usage
    }

    fn chunk(
        &self,
        parts: Vec<Part>,
        finish_reason: Option<GeminiFinishReason>,
        usage: Option<UsageMetadata>,
    ) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content {
                    role: Some(ContentRole::Model),
                    parts,
                },
                finish_reason,
                index: Some(0),
            }],
            usage_metadata: usage,
            model_version: Some(self.model.clone()),
            response_id: Some(self.response_id.clone()),
        }
    }
}

fn append_field(field: &mut Option<String>, text: &str) {
    match field {
        Some(existing) => existing.push_str(text),
        None => *field = Some(text.to_string()),
    }
}

fn function_response_text(response: &Value) -> String {
    if let Some(result) = response.get("result").and_then(|value| value.as_str()) {
        return result.to_string();
    }
    match response {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn gemini_drop_warning(part: &BlockPart) -> DropWarning {
    let kind = match part {
        BlockPart::File { .. } => "file",
        BlockPart::ToolResult { .. } => "tool_result",
        _ => "block",
    };
    DropWarning(format!(
        "dropped {kind} block not representable in gemini dialect"
    ))
}

fn usage_to_unified(usage: &UsageMetadata) -> UnifiedUsage {
    UnifiedUsage {
        input_tokens: usage.prompt_token_count.unwrap_or(0),
        output_tokens: usage.candidates_token_count.unwrap_or(0),
        cache_read_input_tokens: usage.cached_content_token_count,
        cache_creation_input_tokens: None,
        reasoning_tokens: usage.thoughts_token_count,
    }
}

fn usage_to_wire(usage: &UnifiedUsage) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: Some(usage.input_tokens),
        candidates_token_count: Some(usage.output_tokens),
        thoughts_token_count: usage.reasoning_tokens,
        cached_content_token_count: usage.cache_read_input_tokens,
        total_token_count: Some(usage.input_tokens + usage.output_tokens),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_turns_inline_into_user_content() {
        let mut unified = UnifiedRequest::new("gemini-test");
        unified.messages.push(UnifiedMessage::new(
            Role::Assistant,
            vec![Block::new(BlockPart::ToolUse {
                id: "call_0".to_string(),
                name: "lookup".to_string(),
                arguments: "{\"k\":1}".to_string(),
            })],
        ));
        let mut tool = UnifiedMessage::new(
            Role::Tool,
            vec![Block::new(BlockPart::ToolResult {
                call_id: "call_0".to_string(),
                content: "v".to_string(),
                is_error: false,
            })],
        );
        tool.tool_call_id = Some("call_0".to_string());
        unified.messages.push(tool);
        unified
            .messages
            .push(UnifiedMessage::text(Role::User, "summarise"));

        let (req, warnings) = unified_to_request(&unified);
        assert!(warnings.is_empty());
        assert_eq!(req.contents.len(), 2);
        // functionResponse and the trailing text share one user turn.
        let user = &req.contents[1];
        assert_eq!(user.role, Some(ContentRole::User));
        assert!(user.parts[0].function_response.is_some());
        assert_eq!(
            user.parts[0].function_response.as_ref().unwrap().name,
            "lookup"
        );
        assert_eq!(user.parts[1].text.as_deref(), Some("summarise"));
    }

    #[test]
    fn thinking_parts_map_to_reasoning() {
        let mut decoder = StreamDecoder::new();
        let deltas = decoder
            .push(r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"let me think","thought":true},{"text":"answer"}]},"index":0}]}"#)
            .unwrap();
        // role delta + combined body delta
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[1].reasoning.as_deref(), Some("let me think"));
        assert_eq!(deltas[1].content.as_deref(), Some("answer"));
    }

    #[test]
    fn encoder_buffers_tool_arguments_until_finish() {
        let mut encoder = StreamEncoder::new("r1", "gemini-test");
        assert!(encoder
            .push(&UnifiedDelta {
                tool_calls: vec![ToolCallDelta {
                    index: 0,
                    id: Some("call_1".to_string()),
                    name: Some("lookup".to_string()),
                    arguments: "{\"k\"".to_string(),
                }],
                ..UnifiedDelta::default()
            })
            .is_empty());
        assert!(encoder
            .push(&UnifiedDelta {
                tool_calls: vec![ToolCallDelta {
                    index: 0,
                    arguments: ":1}".to_string(),
                    ..ToolCallDelta::default()
                }],
                ..UnifiedDelta::default()
            })
            .is_empty());

        let done = encoder.push(&UnifiedDelta::finish(FinishReason::ToolCalls));
        assert_eq!(done.len(), 1);
        let call = done[0].candidates[0].content.parts[0]
            .function_call
            .as_ref()
            .unwrap();
        assert_eq!(call.name, "lookup");
        assert_eq!(call.args, serde_json::json!({"k": 1}));
    }
}
