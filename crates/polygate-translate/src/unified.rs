//! The internal canonical request/response form. Every dialect converts to
//! and from these types; upstream adapters only ever see them.

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Prompt-cache boundary marker carried on a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    FiveMinutes,
    OneHour,
}

impl CacheTtl {
    pub fn seconds(self) -> u64 {
        match self {
            CacheTtl::FiveMinutes => 300,
            CacheTtl::OneHour => 3600,
        }
    }

    pub fn from_marker(ttl: Option<&str>) -> Self {
        match ttl {
            Some("1h") => CacheTtl::OneHour,
            _ => CacheTtl::FiveMinutes,
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            CacheTtl::FiveMinutes => "5m",
            CacheTtl::OneHour => "1h",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Url(String),
    Base64 { mime: String, data: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockPart {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    InputAudio {
        data: String,
    },
    File {
        data: String,
        name: Option<String>,
    },
    Thinking {
        text: String,
        signature: Option<String>,
    },
    /// `arguments` is the original JSON text, kept verbatim so an A->A
    /// round-trip does not re-serialise it.
    ToolUse {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub part: BlockPart,
    pub cache_control: Option<CacheTtl>,
}

impl Block {
    pub fn new(part: BlockPart) -> Self {
        Self {
            part,
            cache_control: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(BlockPart::Text { text: text.into() })
    }

    pub fn cached(mut self, ttl: CacheTtl) -> Self {
        self.cache_control = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedMessage {
    pub role: Role,
    pub blocks: Vec<Block>,
    /// Tool name, tool-role messages only.
    pub name: Option<String>,
    /// Originating call id, tool-role messages only.
    pub tool_call_id: Option<String>,
}

impl UnifiedMessage {
    pub fn new(role: Role, blocks: Vec<Block>) -> Self {
        Self {
            role,
            blocks,
            name: None,
            tool_call_id: None,
        }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, vec![Block::text(text)])
    }

    /// Concatenated plain text of the message, ignoring non-text blocks.
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            if let BlockPart::Text { text } = &block.part {
                out.push_str(text);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Tool(String),
}

#[derive(Debug, Clone)]
pub struct UnifiedRequest {
    pub model: String,
    pub messages: Vec<UnifiedMessage>,
    /// System prompt as ordered text blocks (may carry cache markers).
    pub system: Vec<Block>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: Option<ToolChoice>,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Caller-supplied user identity, used for cache-session derivation.
    pub user_id: Option<String>,
    /// Provider-opaque extras carried through verbatim.
    pub extra: Map<String, Value>,
}

impl UnifiedRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            system: Vec::new(),
            tools: Vec::new(),
            tool_choice: None,
            stream: false,
            temperature: None,
            max_tokens: None,
            user_id: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnifiedUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct UnifiedResponse {
    pub id: String,
    pub model: String,
    pub message: UnifiedMessage,
    pub finish_reason: FinishReason,
    pub usage: UnifiedUsage,
}

/// Incremental tool-call fragment. `id` and `name` are present only on the
/// first fragment for a given `index`; later fragments carry argument text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// One streaming event in unified form. A terminal delta carries
/// `finish_reason`; nothing follows it on the stream.
#[derive(Debug, Clone, Default)]
pub struct UnifiedDelta {
    pub role: Option<Role>,
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<UnifiedUsage>,
}

impl UnifiedDelta {
    pub fn role(role: Role) -> Self {
        Self {
            role: Some(role),
            ..Self::default()
        }
    }

    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Self::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Fully accumulated tool call, used in terminal deltas and responses.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}
