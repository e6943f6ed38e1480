use http_body_util::{BodyExt, Full, StreamBody, combinators::BoxBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ApiError, AuthError, Error};
use crate::pool::cooldown::CooldownReason;
use crate::pool::{CooldownRegistry, CredentialSelector, QuotaMonitor, SelectedCredential};
use crate::stream::{StreamEmitter, ToolCallEmit};
use crate::tokens;
use crate::translate::claude::MessagesRequest;
use crate::translate::gemini::UpstreamRequest;
use crate::translate::{SignatureCache, build_upstream_request, convert_response};
use crate::upstream::{SseFrameParser, UpstreamClient, UpstreamDelta, deltas};

/// Cooldown applied when a quota rejection carries no parseable reset.
const DEFAULT_COOLDOWN_SECS: u64 = 300;

type ResponseBody = BoxBody<Bytes, Infallible>;

/// Shared state injected into every request handler.
///
/// Constructed in dependency order (store, cooldowns, monitor, selector);
/// nothing here is a process global.
pub struct ServerState {
    pub config: Config,
    pub cooldowns: Arc<CooldownRegistry>,
    pub monitor: Arc<QuotaMonitor>,
    pub selector: Arc<CredentialSelector>,
    pub signatures: Arc<SignatureCache>,
    pub upstream: Arc<UpstreamClient>,
}

pub async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let state = state.clone();
        async move { handle_request(req, state, remote_addr).await }
    });

    http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .await?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
    remote_addr: SocketAddr,
) -> Result<Response<ResponseBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = generate_request_id();

    debug!(
        method = %method,
        path = %path,
        remote = %remote_addr,
        request_id = %request_id,
        "Received request"
    );

    let start = std::time::Instant::now();

    if path.starts_with("/v1/")
        && let Some(expected_key) = &state.config.server.api_key
    {
        let provided = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .or_else(|| req.headers().get("x-api-key").and_then(|v| v.to_str().ok()));

        if provided != Some(expected_key.as_str()) {
            warn!(remote = %remote_addr, request_id = %request_id, "Invalid API key");
            return Ok(json_response(
                StatusCode::UNAUTHORIZED,
                r#"{"type":"error","error":{"type":"authentication_error","message":"Invalid or missing API key"}}"#,
            ));
        }
    }

    let response = match (method.clone(), path.as_str()) {
        (Method::POST, "/v1/messages") | (Method::POST, "/messages") => {
            handle_messages(req, state, &request_id).await
        }

        (Method::GET, "/health") | (Method::GET, "/") => {
            Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#))
        }

        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            r#"{"type":"error","error":{"type":"not_found","message":"Not found"}}"#,
        )),
    };

    let duration = start.elapsed();
    match response {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if status >= 400 {
                warn!(
                    method = %method,
                    path = %path,
                    status = status,
                    duration_ms = duration.as_millis(),
                    request_id = %request_id,
                    "Request failed"
                );
            } else {
                info!(
                    method = %method,
                    path = %path,
                    status = status,
                    duration_ms = duration.as_millis(),
                    request_id = %request_id,
                    "Request completed"
                );
            }
            Ok(resp)
        }
        Err(error) => {
            let resp = error_to_response(&error);
            warn!(
                method = %method,
                path = %path,
                status = resp.status().as_u16(),
                duration_ms = duration.as_millis(),
                request_id = %request_id,
                error = %error,
                "Request error"
            );
            Ok(resp)
        }
    }
}

async fn handle_messages(
    req: Request<Incoming>,
    state: Arc<ServerState>,
    request_id: &str,
) -> Result<Response<ResponseBody>, Error> {
    let content_type = req
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.contains("application/json") {
        return Err(Error::Api(ApiError::InvalidRequest {
            field: "content-type".into(),
            message: "must be application/json".into(),
        }));
    }

    let max_size = state.config.server.max_request_size;
    if let Some(length) = req.headers().get("content-length")
        && let Ok(length) = length.to_str().unwrap_or("").parse::<usize>()
        && length > max_size
    {
        return Err(Error::Api(ApiError::RequestTooLarge {
            size: length,
            max: max_size,
        }));
    }

    let body = read_body_limited(req.into_body(), max_size).await?;
    let messages_request: MessagesRequest =
        serde_json::from_slice(&body).map_err(|e| {
            Error::Api(ApiError::InvalidRequest {
                field: "body".into(),
                message: format!("invalid JSON: {e}"),
            })
        })?;

    debug!(
        model = %messages_request.model,
        streaming = messages_request.stream,
        messages = messages_request.messages.len(),
        request_id = %request_id,
        "Processing messages request"
    );

    execute_with_pool(&messages_request, &state, request_id).await
}

/// The selector loop: pick a credential, translate, dispatch; on quota
/// rejection install a cooldown and reselect, on a dead credential disable
/// it, on transient failures advance, up to the configured attempt cap.
async fn execute_with_pool(
    messages_request: &MessagesRequest,
    state: &Arc<ServerState>,
    request_id: &str,
) -> Result<Response<ResponseBody>, Error> {
    let model = messages_request.model.clone();
    let max_attempts = state.config.upstream.retry_max_attempts.max(1);
    let mut last_error: Option<Error> = None;

    for attempt in 0..max_attempts {
        let selected = match state.selector.select(Some(&model)).await {
            Ok(selected) => selected,
            Err(error) => {
                last_error = Some(error);
                break;
            }
        };

        let upstream_request = build_upstream_request(
            messages_request,
            &selected.project_id,
            &selected.session_id,
            &state.config,
            &state.signatures,
        )?;

        let result = if messages_request.stream {
            dispatch_streaming(messages_request, &upstream_request, &selected, state).await
        } else {
            dispatch_buffered(&upstream_request, &selected, state).await
        };

        match result {
            Ok(response) => return Ok(response),
            Err(error) => {
                let retry = classify_failure(&error, &selected, &model, state).await;
                warn!(
                    attempt = attempt + 1,
                    max_attempts = max_attempts,
                    model = %model,
                    project = %selected.project_id,
                    error = %error,
                    retry = retry,
                    request_id = %request_id,
                    "Upstream dispatch failed"
                );
                last_error = Some(error);
                if !retry {
                    break;
                }
            }
        }
    }

    Err(last_error.unwrap_or(Error::Api(ApiError::PoolExhausted)))
}

/// Mutate pool state according to the failure kind; returns whether the
/// selector loop should try another credential.
async fn classify_failure(
    error: &Error,
    selected: &SelectedCredential,
    model: &str,
    state: &Arc<ServerState>,
) -> bool {
    match error {
        Error::Api(ApiError::QuotaExhausted { reset_time, .. }) => {
            let reset_at = reset_time
                .as_deref()
                .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.timestamp().max(0) as u64)
                .unwrap_or_else(|| tokens::now_secs() + DEFAULT_COOLDOWN_SECS);

            let snapshot = state.monitor.quota_snapshot(&selected.project_id);
            state.cooldowns.put(
                &selected.project_id,
                model,
                reset_at,
                CooldownReason::ResourceExhausted,
                snapshot.as_ref(),
            );
            true
        }
        error if error.is_auth_dead() => {
            if let Err(disable_error) = state.selector.disable(&selected.refresh_token).await {
                warn!(error = %disable_error, "Failed to disable dead credential");
            }
            true
        }
        error => error.is_transient(),
    }
}

async fn dispatch_buffered(
    upstream_request: &UpstreamRequest,
    selected: &SelectedCredential,
    state: &Arc<ServerState>,
) -> Result<Response<ResponseBody>, Error> {
    let response = state
        .upstream
        .generate(upstream_request, &selected.access_token)
        .await?;

    let converted = convert_response(
        &response,
        &upstream_request.model,
        &upstream_request.request_id,
        &state.signatures,
    );

    let body = serde_json::to_vec(&converted)?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(full_body(Bytes::from(body)))
        .unwrap())
}

async fn dispatch_streaming(
    messages_request: &MessagesRequest,
    upstream_request: &UpstreamRequest,
    selected: &SelectedCredential,
    state: &Arc<ServerState>,
) -> Result<Response<ResponseBody>, Error> {
    let upstream_response = state
        .upstream
        .stream_generate(upstream_request, &selected.access_token)
        .await?;

    let estimated_input = tokens::count_request(
        messages_request,
        &state.config.generation.system_instruction,
    )
    .input_tokens;

    let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, Infallible>>(64);
    let mut emitter = StreamEmitter::new(
        tx,
        &upstream_request.request_id,
        &upstream_request.model,
        estimated_input,
    );
    let signatures = state.signatures.clone();

    tokio::spawn(async move {
        emitter.start().await;

        let mut parser = SseFrameParser::new();
        let mut body = upstream_response.into_body();
        let mut usage: Option<(u32, u32)> = None;
        let mut thinking_acc = String::new();

        'read: while let Some(frame) = body.frame().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(error) => {
                    warn!(error = %error, "Upstream stream read failed");
                    emitter.send_error("api_error", "upstream stream interrupted").await;
                    break;
                }
            };
            let Some(data) = frame.data_ref() else { continue };
            let chunk = String::from_utf8_lossy(data);

            for response in parser.feed(&chunk) {
                for delta in deltas(&response) {
                    apply_delta(
                        delta,
                        &mut emitter,
                        &signatures,
                        &mut usage,
                        &mut thinking_acc,
                    )
                    .await;
                }
                if emitter.is_closed() {
                    break 'read;
                }
            }
        }

        for response in parser.finish() {
            for delta in deltas(&response) {
                apply_delta(
                    delta,
                    &mut emitter,
                    &signatures,
                    &mut usage,
                    &mut thinking_acc,
                )
                .await;
            }
        }

        emitter.finish(usage).await;
    });

    let body = StreamBody::new(ReceiverStream::new(rx)).boxed();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(body)
        .unwrap())
}

async fn apply_delta(
    delta: UpstreamDelta,
    emitter: &mut StreamEmitter,
    signatures: &SignatureCache,
    usage: &mut Option<(u32, u32)>,
    thinking_acc: &mut String,
) {
    match delta {
        UpstreamDelta::Thinking { text, signature } => {
            thinking_acc.push_str(&text);
            if let Some(signature) = signature {
                signatures.record_text(thinking_acc, &signature);
            }
            emitter.send_thinking(&text).await;
        }
        UpstreamDelta::Text(text) => {
            emitter.send_text(&text).await;
        }
        UpstreamDelta::ToolCall {
            id,
            name,
            args,
            signature,
        } => {
            let id = id.unwrap_or_else(crate::translate::response::generate_tool_id);
            if let Some(signature) = signature {
                signatures.record_tool_call(&id, &signature);
            }
            let arguments = serde_json::to_string(&args).unwrap_or_else(|_| "{}".to_string());
            emitter
                .send_tool_calls(&[ToolCallEmit {
                    id,
                    name,
                    arguments,
                }])
                .await;
        }
        UpstreamDelta::Usage {
            input_tokens,
            output_tokens,
        } => {
            *usage = Some((input_tokens, output_tokens));
        }
        UpstreamDelta::Finish(_) => {}
        UpstreamDelta::Error { code, message } => {
            warn!(code = code, message = %message, "Upstream error mid-stream");
            emitter.send_error("api_error", &message).await;
        }
    }
}

async fn read_body_limited(body: Incoming, max_size: usize) -> Result<Vec<u8>, Error> {
    let mut collected = Vec::new();
    let mut body = body;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| Error::Http(e.to_string()))?;
        if let Some(data) = frame.data_ref() {
            if collected.len() + data.len() > max_size {
                return Err(Error::Api(ApiError::RequestTooLarge {
                    size: collected.len() + data.len(),
                    max: max_size,
                }));
            }
            collected.extend_from_slice(data);
        }
    }
    Ok(collected)
}

fn generate_request_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("req_{nanos:016x}")
}

fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).boxed()
}

fn json_response(status: StatusCode, body: &'static str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(Bytes::from_static(body.as_bytes())))
        .unwrap()
}

fn json_bytes_response(status: StatusCode, body: Vec<u8>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(Bytes::from(body)))
        .unwrap()
}

fn error_to_response(error: &Error) -> Response<ResponseBody> {
    let (status, error_type) = match error {
        Error::Api(ApiError::InvalidRequest { .. }) => {
            (StatusCode::BAD_REQUEST, "invalid_request_error")
        }
        Error::Api(ApiError::RequestTooLarge { .. }) => {
            (StatusCode::PAYLOAD_TOO_LARGE, "invalid_request_error")
        }
        Error::Api(ApiError::PoolExhausted) => (StatusCode::SERVICE_UNAVAILABLE, "overloaded_error"),
        Error::Api(ApiError::QuotaExhausted { .. }) | Error::Api(ApiError::RateLimited { .. }) => {
            (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error")
        }
        Error::Auth(AuthError::Rejected { .. }) | Error::Auth(AuthError::Ineligible) => {
            (StatusCode::BAD_GATEWAY, "api_error")
        }
        Error::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "api_error"),
        _ => (StatusCode::BAD_GATEWAY, "api_error"),
    };

    let body = serde_json::json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": error.to_string(),
        }
    });

    json_bytes_response(status, serde_json::to_vec(&body).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping_statuses() {
        let resp = error_to_response(&Error::Api(ApiError::PoolExhausted));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = error_to_response(&Error::Api(ApiError::InvalidRequest {
            field: "messages".into(),
            message: "empty".into(),
        }));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = error_to_response(&Error::Api(ApiError::QuotaExhausted {
            model: "m".into(),
            reset_time: None,
        }));
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        let resp = error_to_response(&Error::Timeout(std::time::Duration::from_secs(180)));
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(generate_request_id(), generate_request_id());
    }
}
