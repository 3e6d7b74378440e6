use polygate_translate::unified::{
    Block, BlockPart, CacheTtl, Role, ToolChoice, ToolSpec, UnifiedMessage, UnifiedRequest,
};
use polygate_translate::{anthropic, openai};

fn sample_unified() -> UnifiedRequest {
    let mut req = UnifiedRequest::new("test-model");
    req.system.push(Block::text("You are terse."));
    req.max_tokens = Some(256);
    req.temperature = Some(0.3);
    req.tools.push(ToolSpec {
        name: "search".to_string(),
        description: Some("Search the web".to_string()),
        input_schema: serde_json::json!({"type": "object", "properties": {"q": {"type": "string"}}}),
    });
    req.tool_choice = Some(ToolChoice::Auto);

    req.messages
        .push(UnifiedMessage::text(Role::User, "find rust news"));
    req.messages.push(UnifiedMessage::new(
        Role::Assistant,
        vec![Block::new(BlockPart::ToolUse {
            id: "call_7".to_string(),
            name: "search".to_string(),
            arguments: "{\"q\":\"rust news\"}".to_string(),
        })],
    ));
    let mut tool = UnifiedMessage::new(
        Role::Tool,
        vec![Block::new(BlockPart::ToolResult {
            call_id: "call_7".to_string(),
            content: "three articles".to_string(),
            is_error: false,
        })],
    );
    tool.tool_call_id = Some("call_7".to_string());
    req.messages.push(tool);
    req.messages.push(UnifiedMessage::new(
        Role::User,
        vec![
            Block::text("summarise").cached(CacheTtl::FiveMinutes),
            Block::text("briefly"),
        ],
    ));
    req
}

fn roles(req: &UnifiedRequest) -> Vec<Role> {
    req.messages.iter().map(|message| message.role).collect()
}

fn tool_uses(req: &UnifiedRequest) -> Vec<(String, String, String)> {
    let mut out = Vec::new();
    for message in &req.messages {
        for block in &message.blocks {
            if let BlockPart::ToolUse {
                id,
                name,
                arguments,
            } = &block.part
            {
                out.push((id.clone(), name.clone(), arguments.clone()));
            }
        }
    }
    out
}

#[test]
fn openai_round_trip_is_equivalent() {
    let original = sample_unified();
    let (wire, warnings) = openai::unified_to_request(&original);
    assert!(warnings.is_empty());
    let back = openai::request_to_unified(wire).expect("round trip");

    assert_eq!(back.model, original.model);
    assert_eq!(roles(&back), roles(&original));
    assert_eq!(tool_uses(&back), tool_uses(&original));
    assert_eq!(back.tools.len(), 1);
    assert_eq!(back.tools[0].name, "search");
    assert_eq!(back.tool_choice, Some(ToolChoice::Auto));
    assert_eq!(back.max_tokens, original.max_tokens);
    assert_eq!(
        back.messages.last().unwrap().joined_text(),
        "summarisebriefly"
    );
}

#[test]
fn anthropic_round_trip_is_equivalent() {
    let original = sample_unified();
    let (wire, warnings) = anthropic::unified_to_request(&original);
    assert!(warnings.is_empty());
    let back = anthropic::request_to_unified(wire).expect("round trip");

    assert_eq!(back.model, original.model);
    assert_eq!(roles(&back), roles(&original));
    assert_eq!(back.tools.len(), 1);
    assert_eq!(back.tool_choice, Some(ToolChoice::Auto));
    // Cache markers survive the trip.
    let last = back.messages.last().unwrap();
    assert_eq!(last.blocks[0].cache_control, Some(CacheTtl::FiveMinutes));
    assert_eq!(last.blocks[1].cache_control, None);
    // Tool arguments survive as equivalent JSON.
    let args = tool_uses(&back);
    assert_eq!(args.len(), 1);
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&args[0].2).unwrap(),
        serde_json::json!({"q": "rust news"})
    );
}

#[test]
fn anthropic_tool_choice_required_maps_to_any() {
    let mut original = sample_unified();
    original.tool_choice = Some(ToolChoice::Required);
    let (wire, _) = anthropic::unified_to_request(&original);
    assert!(matches!(
        wire.tool_choice,
        Some(polygate_protocol::anthropic::ToolChoice::Any)
    ));
    let back = anthropic::request_to_unified(wire).unwrap();
    assert_eq!(back.tool_choice, Some(ToolChoice::Required));
}
