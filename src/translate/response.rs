use crate::translate::claude::{ContentBlock, MessagesResponse, Role, StopReason, Usage};
use crate::translate::gemini::{GenerateContentResponse, Part};
use crate::translate::signatures::SignatureCache;

/// Convert a buffered upstream response into a client Messages response,
/// recording any thought signatures on the way through.
pub fn convert_response(
    response: &GenerateContentResponse,
    model: &str,
    request_id: &str,
    signatures: &SignatureCache,
) -> MessagesResponse {
    let candidate = response.candidates.as_ref().and_then(|c| c.first());

    let mut content = Vec::new();
    if let Some(parts) = candidate.and_then(|c| c.content.as_ref()).map(|c| &c.parts) {
        for part in parts {
            if let Some(block) = convert_part(part, signatures) {
                content.push(block);
            }
        }
    }

    let stop_reason = candidate
        .and_then(|c| c.finish_reason.as_deref())
        .map(convert_finish_reason)
        .or_else(|| {
            content
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
                .then_some(StopReason::ToolUse)
        });

    let usage = response
        .usage_metadata
        .as_ref()
        .map(|u| Usage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        })
        .unwrap_or_default();

    MessagesResponse {
        id: format!("msg_{request_id}"),
        response_type: "message".to_string(),
        role: Role::Assistant,
        content,
        model: model.to_string(),
        stop_reason,
        stop_sequence: None,
        usage,
    }
}

fn convert_part(part: &Part, signatures: &SignatureCache) -> Option<ContentBlock> {
    match part {
        Part::Text(text) if text.thought == Some(true) => {
            if let Some(signature) = &text.thought_signature {
                signatures.record_text(&text.text, signature);
            }
            Some(ContentBlock::Thinking {
                thinking: text.text.clone(),
                signature: text.thought_signature.clone(),
            })
        }
        Part::Text(text) => Some(ContentBlock::Text {
            text: text.text.clone(),
            cache_control: None,
        }),
        Part::FunctionCall(call) => {
            let id = call
                .function_call
                .id
                .clone()
                .unwrap_or_else(generate_tool_id);
            if let Some(signature) = &call.thought_signature {
                signatures.record_tool_call(&id, signature);
            }
            Some(ContentBlock::ToolUse {
                id,
                name: call.function_call.name.clone(),
                input: call.function_call.args.clone(),
            })
        }
        Part::FunctionResponse(_) | Part::InlineData(_) => None,
    }
}

fn convert_finish_reason(reason: &str) -> StopReason {
    match reason {
        "MAX_TOKENS" => StopReason::MaxTokens,
        "STOP_SEQUENCE" => StopReason::StopSequence,
        "TOOL_CALL" | "FUNCTION_CALL" => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

pub fn generate_tool_id() -> String {
    let mut bytes = [0u8; 12];
    getrandom::fill(&mut bytes).expect("random bytes");
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("toolu_{hex}")
}
