use serde::{Deserialize, Serialize};

/// Outer envelope posted to the Antigravity generate endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamRequest {
    pub project: String,
    pub request_id: String,
    pub model: String,
    pub user_agent: String,
    pub request: GenerateContentRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDeclarations>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

/// One upstream content part.
///
/// Variant order matters: serde tries untagged variants top to bottom, and
/// only `Text` would also match the others' key sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    FunctionCall(FunctionCallPart),
    FunctionResponse(FunctionResponsePart),
    InlineData(InlineDataPart),
    Text(TextPart),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Part {
        Part::Text(TextPart {
            text: text.into(),
            thought: None,
            thought_signature: None,
        })
    }

    pub fn thought(text: impl Into<String>) -> Part {
        Part::Text(TextPart {
            text: text.into(),
            thought: Some(true),
            thought_signature: None,
        })
    }

    pub fn is_thought(&self) -> bool {
        matches!(self, Part::Text(t) if t.thought == Some(true))
    }

    pub fn is_function_call(&self) -> bool {
        matches!(self, Part::FunctionCall(_))
    }

    pub fn is_plain_text(&self) -> bool {
        matches!(self, Part::Text(t) if t.thought != Some(true))
    }

    pub fn thought_signature(&self) -> Option<&str> {
        match self {
            Part::Text(t) => t.thought_signature.as_deref(),
            Part::FunctionCall(f) => f.thought_signature.as_deref(),
            _ => None,
        }
    }

    pub fn set_thought_signature(&mut self, signature: String) {
        match self {
            Part::Text(t) => t.thought_signature = Some(signature),
            Part::FunctionCall(f) => f.thought_signature = Some(signature),
            _ => {}
        }
    }

    pub fn clear_thought_signature(&mut self) {
        match self {
            Part::Text(t) => t.thought_signature = None,
            Part::FunctionCall(f) => f.thought_signature = None,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextPart {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineDataPart {
    pub inline_data: InlineData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallPart {
    pub function_call: FunctionCall,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponsePart {
    pub function_response: FunctionResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub candidate_count: u32,
    pub max_output_tokens: u32,
    pub stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub include_thoughts: bool,
    pub thinking_budget: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclarations {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    pub function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallingConfig {
    pub mode: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Option<Vec<Candidate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UpstreamError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub status: String,
}

/// Streaming responses arrive wrapped as `{"response": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseEnvelope {
    pub response: GenerateContentResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_untagged_deserialize_order() {
        let fc: Part = serde_json::from_str(
            r#"{"functionCall":{"name":"get_weather","args":{"city":"Oslo"}}}"#,
        )
        .unwrap();
        assert!(fc.is_function_call());

        let thought: Part =
            serde_json::from_str(r#"{"text":"hmm","thought":true,"thoughtSignature":"s"}"#)
                .unwrap();
        assert!(thought.is_thought());
        assert_eq!(thought.thought_signature(), Some("s"));

        let plain: Part = serde_json::from_str(r#"{"text":"hello"}"#).unwrap();
        assert!(plain.is_plain_text());
        assert!(!plain.is_thought());
    }

    #[test]
    fn thought_part_serializes_camel_case() {
        let mut part = Part::thought("reasoning");
        part.set_thought_signature("sig".into());
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["thought"], true);
        assert_eq!(json["thoughtSignature"], "sig");
    }

    #[test]
    fn envelope_serializes_camel_case() {
        let request = UpstreamRequest {
            project: "p".into(),
            request_id: "agent-1".into(),
            model: "gemini-3-flash".into(),
            user_agent: "antigravity".into(),
            request: GenerateContentRequest {
                contents: vec![],
                system_instruction: None,
                tools: None,
                tool_config: None,
                generation_config: GenerationConfig {
                    candidate_count: 1,
                    max_output_tokens: 100,
                    ..Default::default()
                },
                session_id: Some("sess".into()),
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["requestId"], "agent-1");
        assert_eq!(json["userAgent"], "antigravity");
        assert_eq!(json["request"]["sessionId"], "sess");
        assert_eq!(json["request"]["generationConfig"]["candidateCount"], 1);
    }

    #[test]
    fn response_envelope_parses() {
        let data = r#"{"response":{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2}}}"#;
        let envelope: ResponseEnvelope = serde_json::from_str(data).unwrap();
        let candidates = envelope.response.candidates.unwrap();
        assert_eq!(candidates[0].finish_reason.as_deref(), Some("STOP"));
    }
}
