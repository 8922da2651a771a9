use std::collections::HashMap;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub stream_idle_timeout_ms: u64,
    pub max_body_bytes: usize,
    pub system_prompt: Option<String>,
    pub backends: BackendUrls,
}

/// Base URLs of the upstream backends known to the provider registry.
#[derive(Debug, Clone)]
pub struct BackendUrls {
    pub gemini: String,
    pub openai: String,
    pub ollama: String,
}

impl Default for BackendUrls {
    fn default() -> Self {
        Self {
            gemini: DEFAULT_GEMINI_BASE_URL.to_string(),
            openai: DEFAULT_OPENAI_BASE_URL.to_string(),
            ollama: DEFAULT_OLLAMA_BASE_URL.to_string(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            metrics_path: "/metrics".to_string(),
            request_timeout_ms: 60_000,
            connect_timeout_ms: 10_000,
            stream_idle_timeout_ms: 60_000,
            max_body_bytes: 10 * 1024 * 1024,
            system_prompt: None,
            backends: BackendUrls::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            listen: get("CHATRELAY_LISTEN").unwrap_or(defaults.listen),
            metrics_path: get("CHATRELAY_METRICS_PATH").unwrap_or(defaults.metrics_path),
            request_timeout_ms: parse_or(
                "CHATRELAY_REQUEST_TIMEOUT_MS",
                get("CHATRELAY_REQUEST_TIMEOUT_MS"),
                defaults.request_timeout_ms,
            ),
            connect_timeout_ms: parse_or(
                "CHATRELAY_CONNECT_TIMEOUT_MS",
                get("CHATRELAY_CONNECT_TIMEOUT_MS"),
                defaults.connect_timeout_ms,
            ),
            stream_idle_timeout_ms: parse_or(
                "CHATRELAY_STREAM_IDLE_TIMEOUT_MS",
                get("CHATRELAY_STREAM_IDLE_TIMEOUT_MS"),
                defaults.stream_idle_timeout_ms,
            ),
            max_body_bytes: parse_or(
                "CHATRELAY_MAX_BODY_BYTES",
                get("CHATRELAY_MAX_BODY_BYTES"),
                defaults.max_body_bytes,
            ),
            system_prompt: get("CHATRELAY_SYSTEM_PROMPT"),
            backends: BackendUrls {
                gemini: get("GEMINI_BASE_URL").unwrap_or(defaults.backends.gemini),
                openai: get("OPENAI_BASE_URL").unwrap_or(defaults.backends.openai),
                ollama: get("OLLAMA_BASE_URL").unwrap_or(defaults.backends.ollama),
            },
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable config value");
            default
        }
    }
}

/// Looks up API keys by backend credential name (`gemini`, `openai`, ...).
pub trait CredentialSource: Send + Sync {
    fn credential(&self, name: &str) -> Option<String>;
}

/// Reads `<NAME>_API_KEY` from the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    pub fn variable_name(name: &str) -> String {
        format!("{}_API_KEY", name.to_ascii_uppercase())
    }
}

impl CredentialSource for EnvCredentials {
    fn credential(&self, name: &str) -> Option<String> {
        std::env::var(Self::variable_name(name))
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    keys: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, key: impl Into<String>) -> Self {
        self.keys.insert(name.into(), key.into());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn credential(&self, name: &str) -> Option<String> {
        self.keys
            .get(name)
            .filter(|v| !v.trim().is_empty())
            .cloned()
    }
}
