/// Case-insensitive ASCII substring check without allocation.
fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    if needle.len() > haystack.len() {
        return false;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

pub fn get_model_family(model_name: &str) -> &'static str {
    if contains_ignore_case(model_name, "claude") {
        "claude"
    } else if contains_ignore_case(model_name, "gemini") {
        "gemini"
    } else {
        "unknown"
    }
}

/// Reasoning-capable models that stream thoughts without a `-thinking` suffix.
const REASONING_MODELS: &[&str] = &[
    "gemini-3-flash",
    "gemini-3-pro-low",
    "gemini-3-pro-high",
    "gemini-2.5-pro",
];

/// Whether thinking output should be requested for this model.
///
/// Models with a `-thinking` suffix, the enumerated reasoning models, and the
/// whole Claude family run with thoughts enabled.
pub fn thinking_enabled(model_name: &str) -> bool {
    if model_name.ends_with("-thinking") {
        return true;
    }
    if REASONING_MODELS.iter().any(|m| m.eq_ignore_ascii_case(model_name)) {
        return true;
    }
    contains_ignore_case(model_name, "claude")
}

/// Whether the upstream requires a thought signature echoed back on
/// continuation for this model.
pub fn wants_thought_signature(model_name: &str) -> bool {
    contains_ignore_case(model_name, "gemini-3")
}

/// A set of model names believed to share one underlying quota pool.
///
/// True exhaustion of one member exhausts the whole group, so a cooldown
/// installed for a RESOURCE_EXHAUSTED rejection fans out across it.
#[derive(Debug)]
pub struct ModelGroup {
    pub name: &'static str,
    pub models: &'static [&'static str],
}

/// Deployment constant: the quota-sharing partition of known model names.
pub static MODEL_GROUPS: &[ModelGroup] = &[
    ModelGroup {
        name: "Gemini其他",
        models: &[
            "gemini-2.5-pro",
            "gemini-2.5-flash",
            "gemini-2.5-flash-lite",
            "gemini-2.0-flash",
            "gemini-2.0-flash-lite",
        ],
    },
    ModelGroup {
        name: "Gemini 3",
        models: &["gemini-3-flash", "gemini-3-pro-low", "gemini-3-pro-high"],
    },
    ModelGroup {
        name: "Claude",
        models: &[
            "claude-sonnet-4-5",
            "claude-sonnet-4-5-thinking",
            "claude-opus-4-5-thinking",
            "claude-opus-4-6-thinking",
        ],
    },
];

pub fn model_group(model_name: &str) -> Option<&'static ModelGroup> {
    MODEL_GROUPS
        .iter()
        .find(|g| g.models.iter().any(|m| m.eq_ignore_ascii_case(model_name)))
}
