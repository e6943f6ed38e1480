use flate2::read::GzDecoder;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ApiError, Error, Result};
use crate::translate::gemini::{GenerateContentResponse, UpstreamRequest};

use super::quota::{
    FetchAvailableModelsResponse, is_resource_exhausted, parse_reset_time, remaining_fractions,
};

/// HTTP client for the Antigravity generate/quota endpoints.
///
/// Calls are single-shot: rejection handling (cooldowns, credential
/// advancement) lives in the selector loop, not here.
pub struct UpstreamClient {
    client: Client<
        hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
        Full<Bytes>,
    >,
    api_url: String,
    api_no_stream_url: String,
    api_models_url: String,
    user_agent: String,
    timeout: Duration,
    retry_statuses: Vec<u16>,
}

impl UpstreamClient {
    pub fn new(config: &Config) -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_only()
            .enable_http1()
            .enable_http2()
            .build();

        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            api_url: config.upstream.api_url.clone(),
            api_no_stream_url: config.upstream.api_no_stream_url.clone(),
            api_models_url: config.upstream.api_models_url.clone(),
            user_agent: config.upstream.user_agent.clone(),
            timeout: Duration::from_secs(config.upstream.timeout_secs),
            retry_statuses: config.upstream.retry_status_codes.clone(),
        }
    }

    /// Single-shot generateContent call.
    pub async fn generate(
        &self,
        request: &UpstreamRequest,
        access_token: &str,
    ) -> Result<GenerateContentResponse> {
        let body = serde_json::to_vec(request)?;
        let (status, bytes) = self
            .post_buffered(&self.api_no_stream_url, access_token, body)
            .await?;

        if !(200..300).contains(&status) {
            let message = String::from_utf8_lossy(&bytes).to_string();
            return Err(self.classify_status(status, &message, &request.model));
        }

        let response: GenerateContentResponse = serde_json::from_slice(&bytes)?;
        if let Some(error) = &response.error {
            return Err(self.classify_status(
                error.code.max(0) as u16,
                &error.message,
                &request.model,
            ));
        }
        Ok(response)
    }

    /// Open the streaming generate call and hand back the live response.
    ///
    /// The timeout covers connection and response headers; reading the body
    /// is bounded by the caller.
    pub async fn stream_generate(
        &self,
        request: &UpstreamRequest,
        access_token: &str,
    ) -> Result<hyper::Response<hyper::body::Incoming>> {
        let body = serde_json::to_vec(request)?;

        let req = Request::builder()
            .method("POST")
            .uri(&self.api_url)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Content-Type", "application/json")
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Error::Http(e.to_string()))?;

        let response = match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => return Err(Error::Http(error.to_string())),
            Err(_) => return Err(Error::Timeout(self.timeout)),
        };

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let error_body = response
            .into_body()
            .collect()
            .await
            .map(|b| String::from_utf8_lossy(&b.to_bytes()).to_string())
            .unwrap_or_default();

        warn!(
            status = status,
            model = %request.model,
            error = %error_body.chars().take(300).collect::<String>(),
            "Streaming request rejected"
        );
        Err(self.classify_status(status, &error_body, &request.model))
    }

    /// Fetch per-model remaining quota fractions for a credential.
    pub async fn fetch_model_quotas(
        &self,
        access_token: &str,
        project_id: Option<&str>,
    ) -> Result<HashMap<String, f64>> {
        let body = match project_id {
            Some(project) => serde_json::to_vec(&serde_json::json!({ "project": project }))?,
            None => b"{}".to_vec(),
        };

        let (status, bytes) = self
            .post_buffered(&self.api_models_url, access_token, body)
            .await?;

        if !(200..300).contains(&status) {
            let message = String::from_utf8_lossy(&bytes).to_string();
            return Err(self.classify_status(status, &message, "fetchAvailableModels"));
        }

        let response: FetchAvailableModelsResponse = serde_json::from_slice(&bytes)?;
        Ok(remaining_fractions(&response))
    }

    async fn post_buffered(
        &self,
        url: &str,
        access_token: &str,
        body: Vec<u8>,
    ) -> Result<(u16, Vec<u8>)> {
        let req = Request::builder()
            .method("POST")
            .uri(url)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Content-Type", "application/json")
            .header("User-Agent", &self.user_agent)
            .header("Accept-Encoding", "gzip")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Error::Http(e.to_string()))?;

        let response = match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => return Err(Error::Http(error.to_string())),
            Err(_) => return Err(Error::Timeout(self.timeout)),
        };

        let status = response.status().as_u16();
        let gzipped = response
            .headers()
            .get("content-encoding")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);

        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .to_bytes();

        let bytes = if gzipped {
            let mut decoder = GzDecoder::new(bytes.as_ref());
            let mut inflated = Vec::new();
            decoder
                .read_to_end(&mut inflated)
                .map_err(|e| Error::Http(format!("gzip decode failed: {e}")))?;
            inflated
        } else {
            bytes.to_vec()
        };

        debug!(url = %url, status = status, bytes = bytes.len(), "Upstream call finished");
        Ok((status, bytes))
    }

    fn classify_status(&self, status: u16, message: &str, model: &str) -> Error {
        match status {
            429 if is_resource_exhausted(message) => {
                let reset_time = parse_reset_time(message).map(|(_, rfc3339)| rfc3339);
                Error::Api(ApiError::QuotaExhausted {
                    model: model.to_string(),
                    reset_time,
                })
            }
            429 => Error::Api(ApiError::RateLimited {
                retry_after: Duration::from_secs(60),
            }),
            400 => Error::Api(ApiError::InvalidRequest {
                field: "request".to_string(),
                message: message.chars().take(500).collect(),
            }),
            _ if self.retry_statuses.contains(&status) || (500..600).contains(&status) => {
                Error::Api(ApiError::ServerError {
                    status,
                    message: message.chars().take(300).collect(),
                })
            }
            _ => Error::Http(format!("HTTP {status}: {message}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn client() -> UpstreamClient {
        UpstreamClient::new(&Config::from_env())
    }

    #[test]
    fn resource_exhausted_429_maps_to_quota_error() {
        let error = client().classify_status(
            429,
            r#"{"error": {"status": "RESOURCE_EXHAUSTED", "quotaResetTimestamp": "2030-01-01T00:00:00Z"}}"#,
            "gemini-3-flash",
        );
        match error {
            Error::Api(ApiError::QuotaExhausted { model, reset_time }) => {
                assert_eq!(model, "gemini-3-flash");
                assert_eq!(reset_time.as_deref(), Some("2030-01-01T00:00:00Z"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn plain_429_is_rate_limited() {
        let error = client().classify_status(429, "slow down please", "gemini-3-flash");
        assert!(matches!(error, Error::Api(ApiError::RateLimited { .. })));
        assert!(error.is_transient());
    }

    #[test]
    fn server_errors_are_transient() {
        let error = client().classify_status(503, "unavailable", "m");
        assert!(error.is_transient());
    }

    #[test]
    fn bad_request_is_not_transient() {
        let error = client().classify_status(400, "malformed", "m");
        assert!(!error.is_transient());
        assert!(!error.is_auth_dead());
    }
}
