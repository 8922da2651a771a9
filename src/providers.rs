use crate::adapters::{ProviderAdapter, ProviderRequestDescriptor, UpstreamTarget};
use crate::chat::UnifiedChatRequest;
use crate::config::{BackendUrls, CredentialSource};
use crate::error::ChatError;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct Backend {
    pub name: String,
    pub base_url: String,
    /// Name passed to the credential source.
    pub credential: String,
    pub credential_required: bool,
}

/// One row of the registry: a model-name pattern routed to an adapter and backend.
///
/// A `model` named capture group, when present, becomes the upstream model name.
#[derive(Debug, Clone)]
pub struct ProviderRoute {
    pub pattern: Regex,
    pub adapter: ProviderAdapter,
    pub backend: Backend,
}

impl ProviderRoute {
    pub fn new(
        pattern: &str,
        adapter: ProviderAdapter,
        backend: Backend,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            adapter,
            backend,
        })
    }
}

#[derive(Debug)]
pub struct ResolvedProvider<'a> {
    pub adapter: ProviderAdapter,
    pub backend: &'a Backend,
    pub upstream_model: String,
}

/// A fully built upstream call plus what is needed to consume its answer.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub adapter: ProviderAdapter,
    pub backend: String,
    pub upstream_model: String,
    pub descriptor: ProviderRequestDescriptor,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    pub pattern: String,
    pub family: &'static str,
    pub backend: String,
    pub credential_configured: bool,
}

#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    routes: Vec<ProviderRoute>,
}

impl ProviderRegistry {
    pub fn new(routes: Vec<ProviderRoute>) -> Self {
        Self { routes }
    }

    pub fn with_defaults(urls: &BackendUrls) -> Result<Self, regex::Error> {
        let routes = vec![
            ProviderRoute::new(
                r"^(?P<model>gemini-.+)$",
                ProviderAdapter::Gemini,
                Backend {
                    name: "gemini".to_string(),
                    base_url: urls.gemini.clone(),
                    credential: "gemini".to_string(),
                    credential_required: true,
                },
            )?,
            ProviderRoute::new(
                r"^(?P<model>(gpt-|chatgpt-|o1|o3|o4).*)$",
                ProviderAdapter::OpenAiCompatible,
                Backend {
                    name: "openai".to_string(),
                    base_url: urls.openai.clone(),
                    credential: "openai".to_string(),
                    credential_required: true,
                },
            )?,
            ProviderRoute::new(
                r"^ollama/(?P<model>.+)$",
                ProviderAdapter::OpenAiCompatible,
                Backend {
                    name: "ollama".to_string(),
                    base_url: urls.ollama.clone(),
                    credential: "ollama".to_string(),
                    credential_required: false,
                },
            )?,
        ];
        Ok(Self::new(routes))
    }

    /// First matching route wins.
    pub fn resolve(&self, provider_id: &str) -> Result<ResolvedProvider<'_>, ChatError> {
        for route in &self.routes {
            let Some(captures) = route.pattern.captures(provider_id) else {
                continue;
            };
            let upstream_model = captures
                .name("model")
                .map(|m| m.as_str())
                .unwrap_or(provider_id)
                .to_string();
            return Ok(ResolvedProvider {
                adapter: route.adapter,
                backend: &route.backend,
                upstream_model,
            });
        }
        Err(ChatError::UnsupportedProvider(provider_id.to_string()))
    }

    pub fn prepare(
        &self,
        req: &UnifiedChatRequest,
        credentials: &dyn CredentialSource,
        system_prompt: Option<&str>,
    ) -> Result<PreparedCall, ChatError> {
        let resolved = self.resolve(&req.provider_id)?;
        let api_key = credentials.credential(&resolved.backend.credential);
        if api_key.is_none() && resolved.backend.credential_required {
            return Err(ChatError::MissingCredential(resolved.backend.name.clone()));
        }
        let target = UpstreamTarget {
            base_url: &resolved.backend.base_url,
            model: &resolved.upstream_model,
            api_key: api_key.as_deref(),
            system_prompt,
        };
        let descriptor = resolved.adapter.build_request(req, &target)?;
        Ok(PreparedCall {
            adapter: resolved.adapter,
            backend: resolved.backend.name.clone(),
            upstream_model: resolved.upstream_model.clone(),
            descriptor,
        })
    }

    pub fn describe(&self, credentials: &dyn CredentialSource) -> Vec<RouteInfo> {
        self.routes
            .iter()
            .map(|route| RouteInfo {
                pattern: route.pattern.as_str().to_string(),
                family: route.adapter.family(),
                backend: route.backend.name.clone(),
                credential_configured: credentials.credential(&route.backend.credential).is_some(),
            })
            .collect()
    }
}
