use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ApiError, Error, Result};
use crate::models::{get_model_family, thinking_enabled, wants_thought_signature};
use crate::translate::claude::{ContentBlock, MessagesRequest, Role};
use crate::translate::gemini::{
    Content, FunctionCall, FunctionCallPart, FunctionCallingConfig, FunctionDeclaration,
    FunctionResponse, FunctionResponsePart, GenerateContentRequest, GenerationConfig, InlineData,
    InlineDataPart, Part, ThinkingConfig, ToolConfig, ToolDeclarations, UpstreamRequest,
};
use crate::translate::schema::clean_json_schema;
use crate::translate::signatures::SignatureCache;

/// Placeholder emitted for redacted thinking blocks.
const REDACTED_THINKING_TEXT: &str = "[思考内容已隐藏]";

/// Stop sequences sent when the client supplies none.
const DEFAULT_STOP_SEQUENCES: &[&str] = &[
    "<|user|>",
    "<|bot|>",
    "<|context_request|>",
    "<|endoftext|>",
    "<|end_of_turn|>",
];

/// Thinking budget requested when thoughts are enabled.
const THINKING_BUDGET: u32 = 1024;

/// One role-merged turn of conversation.
struct Turn {
    role: Role,
    blocks: Vec<ContentBlock>,
}

/// Translate a client Messages request into the upstream envelope.
pub fn build_upstream_request(
    request: &MessagesRequest,
    project_id: &str,
    session_id: &str,
    config: &Config,
    signatures: &SignatureCache,
) -> Result<UpstreamRequest> {
    if request.model.is_empty() {
        return Err(Error::Api(ApiError::InvalidRequest {
            field: "model".into(),
            message: "must not be empty".into(),
        }));
    }
    if request.messages.is_empty() {
        return Err(Error::Api(ApiError::InvalidRequest {
            field: "messages".into(),
            message: "must not be empty".into(),
        }));
    }

    let model = &request.model;
    let mut turns = merge_turns(request);
    recover_signatures(&mut turns, signatures);

    let thinking = thinking_state(model, &turns);

    let mut contents = Vec::with_capacity(turns.len());
    let mut images_seen = 0usize;
    for (index, turn) in turns.iter().enumerate() {
        let parts = convert_turn(turn, &turns[..index], config, &mut images_seen)?;
        if parts.is_empty() {
            debug!(turn = index, "Skipping turn with no convertible parts");
            continue;
        }
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "model",
        };
        let mut content = Content {
            role: role.to_string(),
            parts,
        };
        if turn.role == Role::Assistant {
            place_thought_signature(&mut content, turn, model, signatures);
        }
        contents.push(content);
    }

    if thinking == ThinkingState::Enabled
        && let Some(last_assistant) = contents.iter_mut().rev().find(|c| c.role == "model")
    {
        reorder_thoughts_first(last_assistant);
    }

    let system_text = request
        .system
        .as_ref()
        .map(|s| s.as_text())
        .unwrap_or_else(|| config.generation.system_instruction.clone());
    let system_instruction = Some(Content {
        role: "user".to_string(),
        parts: vec![Part::text(system_text)],
    });

    let (tools, tool_config) = convert_tools(request);

    let generation_config = build_generation_config(request, model, thinking, config);

    Ok(UpstreamRequest {
        project: project_id.to_string(),
        request_id: format!("agent-{}", uuid::Uuid::new_v4()),
        model: model.clone(),
        user_agent: "antigravity".to_string(),
        request: GenerateContentRequest {
            contents,
            system_instruction,
            tools,
            tool_config,
            generation_config,
            session_id: Some(session_id.to_string()),
        },
    })
}

/// Concatenate consecutive same-role messages into single turns.
fn merge_turns(request: &MessagesRequest) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();
    for message in &request.messages {
        let blocks = message.content.blocks();
        match turns.last_mut() {
            Some(turn) if turn.role == message.role => turn.blocks.extend(blocks),
            _ => turns.push(Turn {
                role: message.role,
                blocks,
            }),
        }
    }
    turns
}

/// Fill in signatures the client stripped from assistant thinking blocks,
/// and index client-provided ones for later requests.
fn recover_signatures(turns: &mut [Turn], signatures: &SignatureCache) {
    for turn in turns.iter_mut().filter(|t| t.role == Role::Assistant) {
        for block in &mut turn.blocks {
            if let ContentBlock::Thinking {
                thinking,
                signature,
            } = block
            {
                match signature.as_deref() {
                    Some(sig) if !sig.is_empty() => signatures.record_text(thinking, sig),
                    _ => {
                        if let Some(hit) = signatures.text_signature(thinking) {
                            debug!("Recovered thought signature from text cache");
                            *signature = Some(hit.signature);
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThinkingState {
    Enabled,
    Disabled,
}

/// Model-name gate plus the history override: a single unsigned historical
/// thinking block, or a final assistant turn without thoughts, forces
/// thinking off because the upstream rejects the continuation otherwise.
fn thinking_state(model: &str, turns: &[Turn]) -> ThinkingState {
    if !thinking_enabled(model) {
        return ThinkingState::Disabled;
    }

    let mut last_assistant: Option<&Turn> = None;
    for turn in turns.iter().filter(|t| t.role == Role::Assistant) {
        for block in &turn.blocks {
            if let ContentBlock::Thinking { signature, .. } = block
                && signature.as_deref().filter(|s| !s.is_empty()).is_none()
            {
                debug!("Unsigned historical thinking block, disabling thoughts");
                return ThinkingState::Disabled;
            }
        }
        last_assistant = Some(turn);
    }

    if let Some(turn) = last_assistant {
        let has_thoughts = turn.blocks.iter().any(|b| {
            matches!(
                b,
                ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. }
            )
        });
        if !has_thoughts {
            debug!("Final assistant turn has no thoughts, disabling thoughts");
            return ThinkingState::Disabled;
        }
    }

    ThinkingState::Enabled
}

fn convert_turn(
    turn: &Turn,
    prior_turns: &[Turn],
    config: &Config,
    images_seen: &mut usize,
) -> Result<Vec<Part>> {
    let mut parts = Vec::with_capacity(turn.blocks.len());

    for block in &turn.blocks {
        match block {
            ContentBlock::Text { text, .. } => parts.push(Part::text(text.clone())),
            ContentBlock::Image { source } => {
                if source.source_type == "base64"
                    && let (Some(media_type), Some(data)) = (&source.media_type, &source.data)
                {
                    *images_seen += 1;
                    if *images_seen > config.generation.max_images {
                        warn!(
                            max = config.generation.max_images,
                            "Too many images in request, dropping"
                        );
                        continue;
                    }
                    parts.push(Part::InlineData(InlineDataPart {
                        inline_data: InlineData {
                            mime_type: media_type.clone(),
                            data: data.clone(),
                        },
                    }));
                } else {
                    warn!(
                        source = %source.source_type,
                        "Unsupported image source, dropping block"
                    );
                }
            }
            ContentBlock::Thinking { thinking, .. } => parts.push(Part::thought(thinking.clone())),
            ContentBlock::RedactedThinking { .. } => {
                parts.push(Part::thought(REDACTED_THINKING_TEXT))
            }
            ContentBlock::ToolUse { id, name, input } => {
                parts.push(Part::FunctionCall(FunctionCallPart {
                    function_call: FunctionCall {
                        id: Some(id.clone()),
                        name: name.clone(),
                        args: input.clone(),
                    },
                    thought_signature: None,
                }));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let rendered = content.to_plain_string();
                let response = if is_error.unwrap_or(false) {
                    serde_json::json!({ "error": rendered })
                } else {
                    serde_json::json!({ "result": rendered })
                };
                parts.push(Part::FunctionResponse(FunctionResponsePart {
                    function_response: FunctionResponse {
                        id: Some(tool_use_id.clone()),
                        name: find_tool_name(prior_turns, tool_use_id).unwrap_or_default(),
                        response,
                    },
                }));
            }
        }
    }

    Ok(parts)
}

/// Back-scan earlier assistant turns for the functionCall matching this id.
fn find_tool_name(prior_turns: &[Turn], tool_use_id: &str) -> Option<String> {
    prior_turns
        .iter()
        .rev()
        .filter(|t| t.role == Role::Assistant)
        .flat_map(|t| t.blocks.iter())
        .find_map(|block| match block {
            ContentBlock::ToolUse { id, name, .. } if id == tool_use_id => Some(name.clone()),
            _ => None,
        })
}

/// Attach the turn's signature to exactly one produced part, or strip all
/// signatures for targets that do not consume them (including Claude).
///
/// Turns without any thinking blocks fall back to the tool-call cache, so a
/// pure tool-use turn still echoes the signature the upstream handed out.
fn place_thought_signature(
    content: &mut Content,
    turn: &Turn,
    model: &str,
    signatures: &SignatureCache,
) {
    for part in &mut content.parts {
        part.clear_thought_signature();
    }

    if !wants_thought_signature(model) {
        return;
    }

    let signature = turn
        .blocks
        .iter()
        .find_map(|block| match block {
            ContentBlock::Thinking {
                signature: Some(sig),
                ..
            } if !sig.is_empty() => Some(sig.clone()),
            _ => None,
        })
        .or_else(|| {
            content.parts.iter().find_map(|part| match part {
                Part::FunctionCall(call) => call
                    .function_call
                    .id
                    .as_deref()
                    .and_then(|id| signatures.tool_call_signature(id)),
                _ => None,
            })
        });
    let Some(signature) = signature else { return };

    let target = if let Some(pos) = content.parts.iter().position(Part::is_function_call) {
        Some(pos)
    } else if let Some(pos) = content.parts.iter().rposition(Part::is_plain_text) {
        Some(pos)
    } else {
        content.parts.iter().rposition(Part::is_thought)
    };

    if let Some(pos) = target {
        content.parts[pos].set_thought_signature(signature);
    }
}

/// The upstream requires the final assistant turn to lead with its thoughts.
fn reorder_thoughts_first(content: &mut Content) {
    if content.parts.iter().any(Part::is_thought) && !content.parts[0].is_thought() {
        let (thoughts, rest): (Vec<Part>, Vec<Part>) =
            content.parts.drain(..).partition(|p| p.is_thought());
        content.parts = thoughts;
        content.parts.extend(rest);
    }
}

fn convert_tools(
    request: &MessagesRequest,
) -> (Option<Vec<ToolDeclarations>>, Option<ToolConfig>) {
    let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) else {
        return (None, None);
    };

    let declarations = tools
        .iter()
        .map(|tool| {
            let mut parameters = tool.input_schema.clone();
            clean_json_schema(&mut parameters);
            ToolDeclarations {
                function_declarations: vec![FunctionDeclaration {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters,
                }],
            }
        })
        .collect();

    let tool_config = ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode: "VALIDATED".to_string(),
        },
    };

    (Some(declarations), Some(tool_config))
}

fn build_generation_config(
    request: &MessagesRequest,
    model: &str,
    thinking: ThinkingState,
    config: &Config,
) -> GenerationConfig {
    let thinking_on = thinking == ThinkingState::Enabled;

    // Claude thinking rejects an explicit topP
    let top_p = if thinking_on && get_model_family(model) == "claude" {
        None
    } else {
        request.top_p.or(config.generation.top_p)
    };

    GenerationConfig {
        top_p,
        top_k: request.top_k.or(config.generation.top_k),
        temperature: request.temperature.or(config.generation.temperature),
        candidate_count: 1,
        max_output_tokens: request.effective_max_tokens(config.generation.max_tokens),
        stop_sequences: request.stop_sequences.clone().unwrap_or_else(|| {
            DEFAULT_STOP_SEQUENCES.iter().map(|s| s.to_string()).collect()
        }),
        thinking_config: Some(if thinking_on {
            ThinkingConfig {
                include_thoughts: true,
                thinking_budget: THINKING_BUDGET,
            }
        } else {
            ThinkingConfig {
                include_thoughts: false,
                thinking_budget: 0,
            }
        }),
    }
}
