use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::HttpClient;
use crate::config::get_config;
use crate::error::{AuthError, Error, Result};

#[derive(Debug, Serialize)]
struct LoadCodeAssistRequest {
    metadata: LoadCodeAssistMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadCodeAssistMetadata {
    ide_type: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadCodeAssistResponse {
    #[serde(default)]
    cloudaicompanion_project: Option<CloudAiProject>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CloudAiProject {
    Id(String),
    Object { id: String },
}

impl CloudAiProject {
    fn id(&self) -> &str {
        match self {
            CloudAiProject::Id(id) => id,
            CloudAiProject::Object { id } => id,
        }
    }
}

/// Discover the Cloud AI project id for a credential via loadCodeAssist.
///
/// A response without a project field means the account cannot be used at
/// all - that maps to an auth-dead error so the caller disables it.
pub async fn discover_project(http: &HttpClient, access_token: &str) -> Result<String> {
    let config = get_config();
    let url = format!("{}/v1internal:loadCodeAssist", config.upstream.api_host);

    let body = serde_json::to_vec(&LoadCodeAssistRequest {
        metadata: LoadCodeAssistMetadata {
            ide_type: "ANTIGRAVITY",
        },
    })?;

    let response = http.post_json(&url, access_token, &body).await?;

    if response.status == 400 || response.status == 403 {
        return Err(Error::Auth(AuthError::Rejected {
            status: response.status,
            message: response.body_string().chars().take(200).collect(),
        }));
    }
    if !response.is_success() {
        return Err(Error::Http(format!(
            "loadCodeAssist failed: HTTP {}",
            response.status
        )));
    }

    let parsed: LoadCodeAssistResponse = serde_json::from_slice(&response.body)?;

    match parsed.cloudaicompanion_project {
        Some(project) => {
            debug!(project_id = %project.id(), "Discovered project from loadCodeAssist");
            Ok(project.id().to_string())
        }
        None => {
            warn!("loadCodeAssist response carries no project, account is ineligible");
            Err(Error::Auth(AuthError::Ineligible))
        }
    }
}

/// Synthesize a placeholder project id when discovery is disabled by policy.
pub fn random_project_id() -> String {
    let mut bytes = [0u8; 6];
    getrandom::fill(&mut bytes).expect("random bytes");
    let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("useful-atom-{suffix}")
}
