use parking_lot::RwLock;
use std::collections::HashMap;

/// In-process cache of thought signatures seen in upstream responses.
///
/// Reasoning models only accept continued thinking when the signature they
/// emitted is echoed back, but clients routinely strip it from history. Two
/// lookups recover it: by tool-call id for functionCall parts, and by
/// thinking text for thought parts. Loss of the cache (restart) degrades
/// gracefully - the upstream just runs without prior thinking context.
#[derive(Default)]
pub struct SignatureCache {
    by_tool_call: RwLock<HashMap<String, String>>,
    by_text: RwLock<HashMap<String, TextSignature>>,
}

#[derive(Debug, Clone)]
pub struct TextSignature {
    pub signature: String,
    pub original_text: String,
}

impl SignatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tool_call(&self, tool_call_id: &str, signature: &str) {
        if tool_call_id.is_empty() || signature.is_empty() {
            return;
        }
        self.by_tool_call
            .write()
            .insert(tool_call_id.to_string(), signature.to_string());
    }

    pub fn tool_call_signature(&self, tool_call_id: &str) -> Option<String> {
        self.by_tool_call.read().get(tool_call_id).cloned()
    }

    /// Index a thinking text under its raw, trimmed, and normalized forms so
    /// later lookups tolerate client-side whitespace and markdown mangling.
    pub fn record_text(&self, text: &str, signature: &str) {
        if text.is_empty() || signature.is_empty() {
            return;
        }
        let entry = TextSignature {
            signature: signature.to_string(),
            original_text: text.to_string(),
        };
        let mut cache = self.by_text.write();
        cache.insert(text.to_string(), entry.clone());
        cache.insert(text.trim().to_string(), entry.clone());
        cache.insert(normalize_text(text), entry);
    }

    pub fn text_signature(&self, text: &str) -> Option<TextSignature> {
        let cache = self.by_text.read();
        cache
            .get(text)
            .or_else(|| cache.get(text.trim()))
            .or_else(|| cache.get(&normalize_text(text)))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.by_tool_call.read().len() + self.by_text.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collapse whitespace runs and drop markdown decoration characters.
fn normalize_text(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| !matches!(c, '*' | '_' | '`' | '#' | '~'))
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}
