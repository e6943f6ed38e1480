pub mod credentials;
pub mod token;

pub use credentials::{Credential, CredentialStore};

use flate2::read::GzDecoder;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::io::Read;

use crate::config::get_config;
use crate::error::{Error, Result};

/// A buffered upstream reply with its status preserved, so callers can
/// classify 400/403 auth rejections themselves.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Shared HTTPS client for OAuth and JSON API calls.
pub struct HttpClient {
    client: Client<
        hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
        Full<Bytes>,
    >,
}

impl HttpClient {
    pub fn new() -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_only()
            .enable_http1()
            .enable_http2()
            .build();

        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }

    /// POST a form-encoded body (OAuth token endpoint).
    pub async fn post_form(&self, url: &str, body: &str) -> Result<HttpResponse> {
        let req = Request::builder()
            .method("POST")
            .uri(url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("User-Agent", get_config().upstream.user_agent)
            .body(Full::new(Bytes::from(body.to_string())))
            .map_err(|e| Error::Http(e.to_string()))?;

        self.execute(req).await
    }

    /// POST a JSON body with a bearer token and the Antigravity headers.
    pub async fn post_json(
        &self,
        url: &str,
        access_token: &str,
        body: &[u8],
    ) -> Result<HttpResponse> {
        let req = Request::builder()
            .method("POST")
            .uri(url)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Content-Type", "application/json")
            .header("User-Agent", get_config().upstream.user_agent)
            .header("Accept-Encoding", "gzip")
            .body(Full::new(Bytes::from(body.to_vec())))
            .map_err(|e| Error::Http(e.to_string()))?;

        self.execute(req).await
    }

    async fn execute(&self, req: Request<Full<Bytes>>) -> Result<HttpResponse> {
        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let gzipped = response
            .headers()
            .get("content-encoding")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .to_bytes();

        let body = if gzipped {
            let mut decoder = GzDecoder::new(body.as_ref());
            let mut inflated = Vec::new();
            decoder
                .read_to_end(&mut inflated)
                .map_err(|e| Error::Http(format!("gzip decode failed: {e}")))?;
            inflated
        } else {
            body.to_vec()
        };

        Ok(HttpResponse { status, body })
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}
