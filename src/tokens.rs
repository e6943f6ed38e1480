use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::translate::claude::{ContentBlock, MessagesRequest};

/// Approximate tokens in a text: one token per four characters, minimum one.
pub fn estimate(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4).max(1)
}

/// Input-token estimate for a request, with the aliases some clients read.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct InputTokens {
    pub input_tokens: u32,
    pub token_count: u32,
    pub tokens: u32,
}

impl InputTokens {
    fn new(count: u32) -> Self {
        Self {
            input_tokens: count,
            token_count: count,
            tokens: count,
        }
    }
}

/// Estimate the input tokens of a full request: every message rendered to
/// plain text, plus the system prompt and the tools JSON.
pub fn count_request(request: &MessagesRequest, system_default: &str) -> InputTokens {
    let mut rendered = String::new();

    for message in &request.messages {
        for block in message.content.blocks() {
            render_block(&block, &mut rendered);
        }
    }

    match &request.system {
        Some(system) => rendered.push_str(&system.as_text()),
        None => rendered.push_str(system_default),
    }

    if let Some(tools) = &request.tools
        && !tools.is_empty()
    {
        rendered.push_str(&serde_json::to_string(tools).unwrap_or_default());
    }

    InputTokens::new(estimate(&rendered))
}

fn render_block(block: &ContentBlock, out: &mut String) {
    match block {
        ContentBlock::Text { text, .. } => out.push_str(text),
        ContentBlock::Thinking { thinking, .. } => out.push_str(thinking),
        ContentBlock::ToolUse { name, input, .. } => {
            let args = serde_json::to_string(input).unwrap_or_default();
            out.push_str(&format!("<invoke name=\"{name}\">{args}</invoke>"));
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } => {
            out.push_str(&format!(
                "<tool_result id=\"{tool_use_id}\">{}</tool_result>",
                content.to_plain_string()
            ));
        }
        ContentBlock::Image { .. } | ContentBlock::RedactedThinking { .. } => {}
    }
}

/// Rolling window the ledger keeps per project.
const LEDGER_WINDOW_SECS: u64 = 3600;

/// Per-project record of recent successful selections, consulted by the
/// selector's hourly cap.
#[derive(Default)]
pub struct UsageLedger {
    entries: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, project_id: &str) {
        self.record_at(project_id, now_secs());
    }

    pub fn recent_count(&self, project_id: &str) -> usize {
        self.recent_count_at(project_id, now_secs())
    }

    fn record_at(&self, project_id: &str, now: u64) {
        let mut entries = self.entries.lock();
        let bucket = entries.entry(project_id.to_string()).or_default();
        prune(bucket, now);
        bucket.push_back(now);
    }

    fn recent_count_at(&self, project_id: &str, now: u64) -> usize {
        let mut entries = self.entries.lock();
        match entries.get_mut(project_id) {
            Some(bucket) => {
                prune(bucket, now);
                bucket.len()
            }
            None => 0,
        }
    }
}

fn prune(bucket: &mut VecDeque<u64>, now: u64) {
    let cutoff = now.saturating_sub(LEDGER_WINDOW_SECS);
    while let Some(&front) = bucket.front() {
        if front <= cutoff {
            bucket.pop_front();
        } else {
            break;
        }
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
