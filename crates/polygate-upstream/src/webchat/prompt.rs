//! Collapses a unified conversation into the single user message the
//! web-chat backend accepts per turn.

use polygate_translate::unified::{
    BlockPart, ImageSource, Role, ToolChoice, UnifiedMessage, UnifiedRequest,
};

#[derive(Debug, Clone, PartialEq)]
pub struct UploadPart {
    /// Base64 payload.
    pub content: String,
    pub mime_type: String,
    pub file_name: String,
}

#[derive(Debug, Clone)]
pub struct CollapsedPrompt {
    pub prompt: String,
    pub attachments: Vec<UploadPart>,
}

pub fn collapse(request: &UnifiedRequest) -> CollapsedPrompt {
    let mut sections: Vec<String> = Vec::new();
    let mut attachments = Vec::new();
    let mut upload_seq = 0usize;

    if let Some(tool_block) = tool_system_block(request) {
        sections.push(tool_block);
    }
    for block in &request.system {
        if let BlockPart::Text { text } = &block.part {
            if !text.is_empty() {
                sections.push(format!("system: {text}"));
            }
        }
    }

    let last_user = request
        .messages
        .iter()
        .rposition(|message| message.role == Role::User);

    for (position, message) in request.messages.iter().enumerate() {
        let is_final_user = Some(position) == last_user;
        match message.role {
            Role::Tool => {
                // Tool output re-enters the conversation as a labelled user line.
                for block in &message.blocks {
                    if let BlockPart::ToolResult {
                        call_id, content, ..
                    } = &block.part
                    {
                        let name = message.name.as_deref().unwrap_or("tool");
                        sections.push(format!("user: tool ({name}, {call_id}): {content}"));
                    }
                }
            }
            role => {
                let text = message_text(message, &mut attachments, &mut upload_seq);
                if text.is_empty() {
                    continue;
                }
                if is_final_user {
                    // The turn being asked: verbatim, no role prefix.
                    sections.push(text);
                } else {
                    let label = match role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::Tool => unreachable!(),
                    };
                    sections.push(format!("{label}: {text}"));
                }
            }
        }
    }

    CollapsedPrompt {
        prompt: sections.join("\n\n"),
        attachments,
    }
}

fn message_text(
    message: &UnifiedMessage,
    attachments: &mut Vec<UploadPart>,
    upload_seq: &mut usize,
) -> String {
    let mut out = String::new();
    for block in &message.blocks {
        match &block.part {
            BlockPart::Text { text } => out.push_str(text),
            BlockPart::ToolUse {
                name, arguments, ..
            } => {
                // Prior tool calls replay as the markup the model itself emits.
                let arguments = if arguments.trim().is_empty() {
                    "{}"
                } else {
                    arguments.as_str()
                };
                out.push_str(&format!(
                    "<tool_call>{{\"name\":\"{name}\",\"arguments\":{arguments}}}</tool_call>"
                ));
            }
            BlockPart::Image { source } => match source {
                ImageSource::Base64 { mime, data } => {
                    *upload_seq += 1;
                    attachments.push(UploadPart {
                        content: data.clone(),
                        mime_type: mime.clone(),
                        file_name: format!("image-{upload_seq}.{}", extension(mime)),
                    });
                }
                ImageSource::Url(url) => out.push_str(&format!("\n[image: {url}]")),
            },
            BlockPart::File { data, name } => {
                *upload_seq += 1;
                attachments.push(UploadPart {
                    content: data.clone(),
                    mime_type: "application/octet-stream".to_string(),
                    file_name: name
                        .clone()
                        .unwrap_or_else(|| format!("file-{upload_seq}")),
                });
            }
            BlockPart::Thinking { .. } => {}
            BlockPart::InputAudio { data } => {
                *upload_seq += 1;
                attachments.push(UploadPart {
                    content: data.clone(),
                    mime_type: "audio/wav".to_string(),
                    file_name: format!("audio-{upload_seq}.wav"),
                });
            }
            BlockPart::ToolResult { .. } => {}
        }
    }
    out
}

/// Markdown tool catalogue plus tool_choice instructions, prepended as a
/// generated system block.
fn tool_system_block(request: &UnifiedRequest) -> Option<String> {
    if request.tools.is_empty() {
        return None;
    }
    if matches!(request.tool_choice, Some(ToolChoice::None)) {
        return None;
    }

    let mut out = String::from(
        "system: You can call external tools. To call a tool, reply with \
         `<tool_call>{\"name\": ..., \"arguments\": ...}</tool_call>` and nothing else.\n\n\
         ## Available tools\n",
    );
    for tool in &request.tools {
        out.push_str(&format!("\n### {}\n", tool.name));
        if let Some(description) = &tool.description {
            out.push_str(description);
            out.push('\n');
        }
        out.push_str("Input schema:\n```json\n");
        out.push_str(&tool.input_schema.to_string());
        out.push_str("\n```\n");
    }
    match &request.tool_choice {
        Some(ToolChoice::Required) => {
            out.push_str("\nYou must call exactly one of the tools above before answering.\n");
        }
        Some(ToolChoice::Tool(name)) => {
            out.push_str(&format!("\nYou must call the tool `{name}`.\n"));
        }
        _ => {}
    }
    Some(out)
}

fn extension(mime: &str) -> &str {
    match mime {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polygate_translate::unified::{Block, ToolSpec, UnifiedMessage};

    fn request() -> UnifiedRequest {
        let mut req = UnifiedRequest::new("m");
        req.system.push(Block::text("be helpful"));
        req.messages
            .push(UnifiedMessage::text(Role::User, "first question"));
        req.messages.push(UnifiedMessage::new(
            Role::Assistant,
            vec![Block::new(BlockPart::ToolUse {
                id: "call_1".to_string(),
                name: "search".to_string(),
                arguments: "{\"q\":\"x\"}".to_string(),
            })],
        ));
        let mut tool = UnifiedMessage::new(
            Role::Tool,
            vec![Block::new(BlockPart::ToolResult {
                call_id: "call_1".to_string(),
                content: "result text".to_string(),
                is_error: false,
            })],
        );
        tool.name = Some("search".to_string());
        req.messages.push(tool);
        req.messages
            .push(UnifiedMessage::text(Role::User, "final question"));
        req
    }

    #[test]
    fn final_user_message_has_no_role_prefix() {
        let collapsed = collapse(&request());
        let sections: Vec<&str> = collapsed.prompt.split("\n\n").collect();
        assert_eq!(*sections.last().unwrap(), "final question");
        assert!(sections
            .iter()
            .any(|section| section.starts_with("user: first question")));
    }

    #[test]
    fn prior_tool_calls_render_as_markup_and_results_as_labelled_lines() {
        let collapsed = collapse(&request());
        assert!(collapsed.prompt.contains(
            "assistant: <tool_call>{\"name\":\"search\",\"arguments\":{\"q\":\"x\"}}</tool_call>"
        ));
        assert!(collapsed
            .prompt
            .contains("user: tool (search, call_1): result text"));
    }

    #[test]
    fn tool_catalogue_lands_in_leading_system_block() {
        let mut req = request();
        req.tools.push(ToolSpec {
            name: "search".to_string(),
            description: Some("Find things".to_string()),
            input_schema: serde_json::json!({"type": "object"}),
        });
        req.tool_choice = Some(ToolChoice::Tool("search".to_string()));
        let collapsed = collapse(&req);
        assert!(collapsed.prompt.starts_with("system: You can call external tools"));
        assert!(collapsed.prompt.contains("### search"));
        assert!(collapsed.prompt.contains("must call the tool `search`"));
    }

    #[test]
    fn images_become_uploads_not_text() {
        let mut req = UnifiedRequest::new("m");
        req.messages.push(UnifiedMessage::new(
            Role::User,
            vec![
                Block::new(BlockPart::Image {
                    source: ImageSource::Base64 {
                        mime: "image/png".to_string(),
                        data: "QUJD".to_string(),
                    },
                }),
                Block::text("what is this?"),
            ],
        ));
        let collapsed = collapse(&req);
        assert_eq!(collapsed.attachments.len(), 1);
        assert_eq!(collapsed.attachments[0].file_name, "image-1.png");
        assert_eq!(collapsed.prompt, "what is this?");
    }
}
