use regex_lite::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::tokens::now_secs;

#[derive(Debug, Deserialize)]
pub struct FetchAvailableModelsResponse {
    pub models: Option<HashMap<String, ModelData>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelData {
    pub quota_info: Option<QuotaInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaInfo {
    pub remaining_fraction: Option<f64>,
    pub reset_time: Option<String>,
}

/// Flatten a fetchAvailableModels response into remaining fractions.
///
/// A model that reports a reset time but no fraction has hit zero; one that
/// reports neither is treated as untouched.
pub fn remaining_fractions(response: &FetchAvailableModelsResponse) -> HashMap<String, f64> {
    let mut fractions = HashMap::new();

    if let Some(models) = &response.models {
        for (model_id, data) in models {
            if let Some(quota) = &data.quota_info {
                let remaining = quota.remaining_fraction.unwrap_or_else(|| {
                    if quota.reset_time.is_some() { 0.0 } else { 1.0 }
                });
                fractions.insert(model_id.clone(), remaining);
            }
        }
    }

    fractions
}

static RESET_TIMESTAMP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)quotaresettimestamp[":\s]+(\d{4}-\d{2}-\d{2}T[\d:.]+Z?)"#)
        .expect("reset timestamp regex")
});

static RETRY_DELAY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:retrydelay|quotaresetdelay)[":\s]+([\d.]+)(ms|s)"#)
        .expect("retry delay regex")
});

/// Pull the quota reset instant out of a 429 error body.
///
/// Returns `(unix_seconds, rfc3339)` when either an absolute timestamp or a
/// relative delay is present.
pub fn parse_reset_time(error_body: &str) -> Option<(u64, String)> {
    if let Some(captures) = RESET_TIMESTAMP_REGEX.captures(error_body) {
        let raw = captures.get(1)?.as_str();
        if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(raw) {
            return Some((parsed.timestamp().max(0) as u64, raw.to_string()));
        }
    }

    if let Some(captures) = RETRY_DELAY_REGEX.captures(error_body) {
        let amount: f64 = captures.get(1)?.as_str().parse().ok()?;
        let millis = match captures.get(2)?.as_str() {
            "ms" => amount,
            _ => amount * 1000.0,
        };
        let reset = now_secs() + (millis / 1000.0).ceil() as u64;
        let rfc3339 = chrono::DateTime::from_timestamp(reset as i64, 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        return Some((reset, rfc3339));
    }

    None
}

/// Whether a rejection body signals true quota exhaustion rather than a
/// transient throttle.
pub fn is_resource_exhausted(error_body: &str) -> bool {
    let lower = error_body.to_lowercase();
    lower.contains("resource_exhausted")
        || lower.contains("quota exceeded")
        || lower.contains("quotaresettimestamp")
        || lower.contains("quotaresetdelay")
        || lower.contains("daily limit")
}
