pub mod gemini;
pub mod openai_chat;

use crate::chat::UnifiedChatRequest;
use crate::error::ChatError;
use axum::http::Method;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// One upstream HTTP call, built fresh for every request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequestDescriptor {
    pub url: String,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

/// Where and how an adapter should address the selected backend.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamTarget<'a> {
    pub base_url: &'a str,
    pub model: &'a str,
    pub api_key: Option<&'a str>,
    pub system_prompt: Option<&'a str>,
}

/// Wire-format families. Every registered backend speaks one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderAdapter {
    Gemini,
    OpenAiCompatible,
}

impl ProviderAdapter {
    pub fn family(self) -> &'static str {
        match self {
            ProviderAdapter::Gemini => "gemini",
            ProviderAdapter::OpenAiCompatible => "openai_compatible",
        }
    }

    pub fn build_request(
        self,
        req: &UnifiedChatRequest,
        target: &UpstreamTarget<'_>,
    ) -> Result<ProviderRequestDescriptor, ChatError> {
        match self {
            ProviderAdapter::Gemini => gemini::build_request(req, target),
            ProviderAdapter::OpenAiCompatible => openai_chat::build_request(req, target),
        }
    }

    /// Whether the upstream stream already uses the canonical delta frames.
    pub fn is_natively_canonical_stream(self) -> bool {
        matches!(self, ProviderAdapter::OpenAiCompatible)
    }

    pub fn unwrap_reply(self, body: &Value) -> Result<String, ChatError> {
        match self {
            ProviderAdapter::Gemini => gemini::unwrap_reply(body),
            ProviderAdapter::OpenAiCompatible => openai_chat::unwrap_reply(body),
        }
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

pub(crate) fn json_headers() -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    headers
}
