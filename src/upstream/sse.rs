use tracing::debug;

use crate::translate::gemini::{GenerateContentResponse, Part, ResponseEnvelope};

/// Incremental parser for the upstream `data:`-framed SSE stream.
///
/// Frames arrive split across arbitrary chunk boundaries with either LF or
/// CRLF framing; the parser buffers until a complete event is present.
pub struct SseFrameParser {
    buffer: String,
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self {
            buffer: String::with_capacity(4096),
        }
    }

    /// Feed a chunk and collect all complete frames it finishes.
    pub fn feed(&mut self, chunk: &str) -> Vec<GenerateContentResponse> {
        self.buffer.push_str(chunk);

        let mut frames = Vec::new();
        loop {
            let boundary = self
                .buffer
                .find("\r\n\r\n")
                .map(|pos| (pos, 4))
                .or_else(|| self.buffer.find("\n\n").map(|pos| (pos, 2)));

            let Some((pos, skip)) = boundary else { break };
            let event = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + skip);

            if let Some(frame) = parse_event(&event) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Parse whatever remains in the buffer as a final unterminated frame.
    pub fn finish(mut self) -> Vec<GenerateContentResponse> {
        let rest = std::mem::take(&mut self.buffer);
        parse_event(rest.trim()).into_iter().collect()
    }
}

impl Default for SseFrameParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_event(event: &str) -> Option<GenerateContentResponse> {
    let data = event
        .lines()
        .find_map(|line| {
            line.strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
        })?
        .trim();

    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    // Streaming frames are wrapped as {"response": ...}; tolerate bare ones
    if let Ok(envelope) = serde_json::from_str::<ResponseEnvelope>(data) {
        return Some(envelope.response);
    }
    match serde_json::from_str::<GenerateContentResponse>(data) {
        Ok(response) => Some(response),
        Err(error) => {
            debug!(
                error = %error,
                data = %data.chars().take(200).collect::<String>(),
                "Unparseable SSE frame"
            );
            None
        }
    }
}

/// A single upstream progress item, flattened out of a response frame.
#[derive(Debug, Clone)]
pub enum UpstreamDelta {
    Thinking {
        text: String,
        signature: Option<String>,
    },
    Text(String),
    ToolCall {
        id: Option<String>,
        name: String,
        args: serde_json::Value,
        signature: Option<String>,
    },
    Usage {
        input_tokens: u32,
        output_tokens: u32,
    },
    Finish(String),
    Error {
        code: i32,
        message: String,
    },
}

/// Flatten one response frame into ordered deltas.
pub fn deltas(response: &GenerateContentResponse) -> Vec<UpstreamDelta> {
    let mut out = Vec::new();

    if let Some(error) = &response.error {
        out.push(UpstreamDelta::Error {
            code: error.code,
            message: error.message.clone(),
        });
        return out;
    }

    let candidate = response.candidates.as_ref().and_then(|c| c.first());

    if let Some(content) = candidate.and_then(|c| c.content.as_ref()) {
        for part in &content.parts {
            match part {
                Part::Text(text) if text.thought == Some(true) => {
                    out.push(UpstreamDelta::Thinking {
                        text: text.text.clone(),
                        signature: text
                            .thought_signature
                            .clone()
                            .filter(|s| !s.is_empty()),
                    });
                }
                Part::Text(text) => {
                    if !text.text.is_empty() {
                        out.push(UpstreamDelta::Text(text.text.clone()));
                    }
                }
                Part::FunctionCall(call) => {
                    out.push(UpstreamDelta::ToolCall {
                        id: call.function_call.id.clone(),
                        name: call.function_call.name.clone(),
                        args: call.function_call.args.clone(),
                        signature: call
                            .thought_signature
                            .clone()
                            .filter(|s| !s.is_empty()),
                    });
                }
                Part::FunctionResponse(_) | Part::InlineData(_) => {}
            }
        }
    }

    if let Some(usage) = &response.usage_metadata {
        out.push(UpstreamDelta::Usage {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
        });
    }

    if let Some(reason) = candidate.and_then(|c| c.finish_reason.as_ref()) {
        out.push(UpstreamDelta::Finish(reason.clone()));
    }

    out
}
