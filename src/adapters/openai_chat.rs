use crate::adapters::{ProviderRequestDescriptor, UpstreamTarget, join_url, json_headers};
use crate::attachment::ImageAttachment;
use crate::chat::{ContentPart, TurnContent, UnifiedChatRequest};
use crate::error::ChatError;
use axum::http::Method;
use serde_json::{Value, json};

pub fn build_request(
    req: &UnifiedChatRequest,
    target: &UpstreamTarget<'_>,
) -> Result<ProviderRequestDescriptor, ChatError> {
    let mut messages = Vec::with_capacity(req.turns.len() + 1);
    if let Some(prompt) = target.system_prompt {
        messages.push(json!({ "role": "system", "content": prompt }));
    }

    let last_user = req.last_user_index();
    if req.attachment.is_some() && last_user.is_none() {
        tracing::warn!("image attachment dropped: conversation has no user turn");
    }
    for (idx, turn) in req.turns.iter().enumerate() {
        let content = match &req.attachment {
            Some(attachment) if Some(idx) == last_user => {
                with_attachment(&turn.content, attachment)
            }
            _ => encode_content(&turn.content),
        };
        messages.push(json!({ "role": turn.role.as_str(), "content": content }));
    }

    let mut headers = json_headers();
    if let Some(key) = target.api_key {
        headers.insert("authorization".to_string(), format!("Bearer {key}"));
    }

    Ok(ProviderRequestDescriptor {
        url: join_url(target.base_url, "chat/completions"),
        method: Method::POST,
        headers,
        body: json!({
            "model": target.model,
            "messages": messages,
            "stream": req.wants_stream,
        }),
    })
}

fn encode_content(content: &TurnContent) -> Value {
    match content {
        TurnContent::Text(text) => Value::String(text.clone()),
        TurnContent::Parts(parts) => Value::Array(parts.iter().map(encode_part).collect()),
    }
}

fn encode_part(part: &ContentPart) -> Value {
    match part {
        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
        ContentPart::ImageUrl { image_url } => {
            let mut inner = json!({ "url": image_url.url });
            if let (Some(detail), Some(obj)) = (&image_url.detail, inner.as_object_mut()) {
                obj.insert("detail".to_string(), Value::String(detail.clone()));
            }
            json!({ "type": "image_url", "image_url": inner })
        }
    }
}

/// Turns the content into a typed list ending with the attachment's image element.
fn with_attachment(content: &TurnContent, attachment: &ImageAttachment) -> Value {
    let image = json!({ "type": "image_url", "image_url": { "url": attachment.data_url() } });
    let mut parts = match content {
        TurnContent::Text(text) => vec![json!({ "type": "text", "text": text })],
        TurnContent::Parts(parts) => parts.iter().map(encode_part).collect(),
    };
    parts.push(image);
    Value::Array(parts)
}

pub fn unwrap_reply(body: &Value) -> Result<String, ChatError> {
    body.get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            ChatError::UnexpectedResponseShape("missing choices[0].message.content".to_string())
        })
}
