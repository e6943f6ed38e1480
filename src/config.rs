use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Default upstream API host (Cloud Code production).
const DEFAULT_API_HOST: &str = "https://cloudcode-pa.googleapis.com";

/// Version string reported to the upstream in the User-Agent header.
pub const UPSTREAM_VERSION: &str = "1.15.8";

/// Global config instance, initialized from the environment.
static GLOBAL_CONFIG: LazyLock<RwLock<Config>> = LazyLock::new(|| RwLock::new(Config::from_env()));

pub fn get_config() -> Config {
    GLOBAL_CONFIG.read().clone()
}

pub fn init_config(config: Config) {
    *GLOBAL_CONFIG.write() = config;
}

/// Proxy configuration, derived entirely from environment variables.
///
/// All fields have defaults; secrets (`PANEL_USER`, `PANEL_PASSWORD`,
/// `API_KEY`) are only ever read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub generation: GenerationDefaults,
    pub pool: PoolConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Maximum accepted request body size in bytes.
    pub max_request_size: usize,
    /// Optional API key required on /v1/* endpoints.
    pub api_key: Option<String>,
    /// Credentials reserved for an external admin dashboard; recognized
    /// from the environment but not served by this process.
    pub panel_user: Option<String>,
    pub panel_password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub api_host: String,
    /// Streaming generate endpoint.
    pub api_url: String,
    /// Non-streaming generate endpoint.
    pub api_no_stream_url: String,
    /// Model/quota listing endpoint.
    pub api_models_url: String,
    pub user_agent: String,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
    /// HTTP statuses treated as transient (advance to the next credential).
    pub retry_status_codes: Vec<u16>,
    /// Attempt cap across credentials for one client request.
    pub retry_max_attempts: u32,
    /// Outbound proxy URL, if any.
    pub proxy: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationDefaults {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_tokens: u32,
    pub system_instruction: String,
    pub max_images: usize,
    pub image_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub credentials_file: PathBuf,
    pub cooldowns_file: PathBuf,
    /// Successful selections allowed per credential per rolling hour.
    pub hourly_limit: usize,
    /// When false, a random placeholder project id is synthesized instead of
    /// calling project discovery.
    pub fetch_project_id: bool,
    /// Models at or below this remaining fraction are disabled by the monitor.
    pub quota_low_threshold: f64,
    /// Quota sweep cadence in seconds.
    pub quota_sweep_interval_secs: u64,
    /// A credential unused this long is eligible for sweep skipping.
    pub recent_use_secs: u64,
    /// Every credential is rechecked at least this often.
    pub recheck_secs: u64,
}

const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You are a helpful assistant. Answer the user's questions accurately and concisely.";

impl Config {
    pub fn from_env() -> Self {
        let api_host = env_str("API_HOST", DEFAULT_API_HOST);

        Config {
            server: ServerConfig {
                port: env_parse("PORT", 8045),
                host: env_str("HOST", "127.0.0.1"),
                max_request_size: env_parse("MAX_REQUEST_SIZE", 50 * 1024 * 1024),
                api_key: env_opt("API_KEY"),
                panel_user: env_opt("PANEL_USER"),
                panel_password: env_opt("PANEL_PASSWORD"),
            },
            upstream: UpstreamConfig {
                api_url: env_str(
                    "API_URL",
                    &format!("{api_host}/v1internal:streamGenerateContent?alt=sse"),
                ),
                api_no_stream_url: env_str(
                    "API_NO_STREAM_URL",
                    &format!("{api_host}/v1internal:generateContent"),
                ),
                api_models_url: env_str(
                    "API_MODELS_URL",
                    &format!("{api_host}/v1internal:fetchAvailableModels"),
                ),
                api_host,
                user_agent: env_str("API_USER_AGENT", &format!("antigravity/{UPSTREAM_VERSION}")),
                timeout_secs: env_parse("TIMEOUT", 180),
                retry_status_codes: env_status_codes("RETRY_STATUS_CODES", &[429, 500, 502, 503, 504]),
                retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 3),
                proxy: env_opt("PROXY"),
            },
            generation: GenerationDefaults {
                temperature: env_opt_parse("DEFAULT_TEMPERATURE"),
                top_p: env_opt_parse("DEFAULT_TOP_P"),
                top_k: env_opt_parse("DEFAULT_TOP_K"),
                max_tokens: env_parse("DEFAULT_MAX_TOKENS", 64000),
                system_instruction: env_str("SYSTEM_INSTRUCTION", DEFAULT_SYSTEM_INSTRUCTION),
                max_images: env_parse("MAX_IMAGES", 8),
                image_base_url: env_opt("IMAGE_BASE_URL"),
            },
            pool: PoolConfig {
                credentials_file: PathBuf::from(env_str("CREDENTIALS_FILE", "credentials.json")),
                cooldowns_file: PathBuf::from(env_str("COOLDOWNS_FILE", "cooldowns.json")),
                hourly_limit: env_parse("CREDENTIAL_MAX_USAGE_PER_HOUR", 20),
                fetch_project_id: env_parse("FETCH_PROJECT_ID", true),
                quota_low_threshold: 0.05,
                quota_sweep_interval_secs: 30 * 60,
                recent_use_secs: 30 * 60,
                recheck_secs: 5 * 60 * 60,
            },
        }
    }

    pub fn with_overrides(mut self, port: Option<u16>, host: Option<String>) -> Self {
        if let Some(p) = port {
            self.server.port = p;
        }
        if let Some(h) = host {
            self.server.host = h;
        }
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_env()
    }
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_status_codes(name: &str, default: &[u16]) -> Vec<u16> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect(),
        _ => default.to_vec(),
    }
}
