use crate::attachment::{ImageAttachment, parse_data_url};
use crate::error::ChatError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: TurnContent,
}

impl ChatTurn {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: TurnContent::Text(text.into()),
        }
    }
}

/// Plain text, or the OpenAI-style list of typed content elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TurnContent {
    /// All text carried by the turn; text elements are joined with newlines.
    pub fn text(&self) -> String {
        match self {
            TurnContent::Text(text) => text.clone(),
            TurnContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn image_urls(&self) -> Vec<&str> {
        match self {
            TurnContent::Text(_) => Vec::new(),
            TurnContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::ImageUrl { image_url } => Some(image_url.url.as_str()),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }
}

/// Inbound `POST /api/chat` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequestBody {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<ChatTurn>>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
}

/// Provider-agnostic request, the sole input of the adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedChatRequest {
    pub provider_id: String,
    pub turns: Vec<ChatTurn>,
    pub attachment: Option<ImageAttachment>,
    pub wants_stream: bool,
}

impl UnifiedChatRequest {
    pub fn last_user_index(&self) -> Option<usize> {
        self.turns.iter().rposition(|turn| turn.role == Role::User)
    }
}

impl TryFrom<ChatRequestBody> for UnifiedChatRequest {
    type Error = ChatError;

    fn try_from(body: ChatRequestBody) -> Result<Self, Self::Error> {
        let provider_id = body
            .model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ChatError::InvalidRequest("model is required".to_string()))?;
        let turns = body.messages.unwrap_or_default();
        if turns.is_empty() {
            return Err(ChatError::InvalidRequest(
                "messages must contain at least one turn".to_string(),
            ));
        }
        let attachment = match body.image.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let parsed = parse_data_url(raw);
                if parsed.is_none() {
                    tracing::warn!(
                        image_len = raw.len(),
                        "image is not a base64 image data URL, sending text only"
                    );
                }
                parsed
            }
        };
        Ok(Self {
            provider_id,
            turns,
            attachment,
            wants_stream: body.stream.unwrap_or(false),
        })
    }
}
