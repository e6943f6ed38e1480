use serde::Deserialize;

use crate::error::{AuthError, Error, Result};

// Public "installed application" OAuth client. The flow's security rests on
// the refresh token, not on these values.
pub const CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
pub const CLIENT_SECRET: &str = "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";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Exchange a refresh token for a fresh access token.
///
/// HTTP 400/403 means the grant itself is dead; callers disable the
/// credential. Anything else is transient.
pub async fn refresh_access_token(
    http_client: &super::HttpClient,
    refresh_token: &str,
) -> Result<(String, u64)> {
    let body = format!(
        "client_id={CLIENT_ID}&client_secret={CLIENT_SECRET}&refresh_token={refresh_token}&grant_type=refresh_token"
    );

    let response = http_client.post_form(TOKEN_URL, &body).await?;

    if response.status == 400 || response.status == 403 {
        return Err(Error::Auth(AuthError::Rejected {
            status: response.status,
            message: response.body_string().chars().take(200).collect(),
        }));
    }
    if !response.is_success() {
        return Err(Error::Auth(AuthError::RefreshTransient(format!(
            "HTTP {}",
            response.status
        ))));
    }

    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: String,
        expires_in: u64,
    }

    let tokens: TokenResponse = serde_json::from_slice(&response.body)
        .map_err(|e| Error::Auth(AuthError::RefreshTransient(e.to_string())))?;

    Ok((tokens.access_token, tokens.expires_in))
}
