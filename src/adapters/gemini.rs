use crate::adapters::{ProviderRequestDescriptor, UpstreamTarget, json_headers};
use crate::attachment::{ImageAttachment, parse_data_url};
use crate::chat::{Role, UnifiedChatRequest};
use crate::error::ChatError;
use crate::history::{self, HistoryTurn};
use axum::http::Method;
use reqwest::Url;
use serde_json::{Map, Value, json};

pub fn build_request(
    req: &UnifiedChatRequest,
    target: &UpstreamTarget<'_>,
) -> Result<ProviderRequestDescriptor, ChatError> {
    let turns = history::repair(collect_turns(req))?;
    let contents: Vec<Value> = turns.iter().map(encode_turn).collect();

    let mut body = Map::new();
    body.insert("contents".to_string(), Value::Array(contents));
    if let Some(prompt) = target.system_prompt {
        body.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": prompt }] }),
        );
    }

    let action = if req.wants_stream {
        "streamGenerateContent"
    } else {
        "generateContent"
    };
    let mut url = Url::parse(target.base_url).map_err(|err| {
        ChatError::UpstreamUnreachable(format!(
            "invalid gemini endpoint {}: {err}",
            target.base_url
        ))
    })?;
    // The model name always stays one escaped path segment.
    url.path_segments_mut()
        .map_err(|_| {
            ChatError::UpstreamUnreachable(format!(
                "gemini endpoint {} cannot carry a path",
                target.base_url
            ))
        })?
        .pop_if_empty()
        .push("models")
        .push(&format!("{}:{}", target.model, action));
    {
        let mut query = url.query_pairs_mut();
        if req.wants_stream {
            query.append_pair("alt", "sse");
        }
        if let Some(key) = target.api_key {
            query.append_pair("key", key);
        }
    }

    Ok(ProviderRequestDescriptor {
        url: url.to_string(),
        method: Method::POST,
        headers: json_headers(),
        body: Value::Object(body),
    })
}

/// Copies the caller's turns into repairable form, splicing the attachment
/// into the last user turn.
fn collect_turns(req: &UnifiedChatRequest) -> Vec<HistoryTurn> {
    let last_user = req.last_user_index();
    req.turns
        .iter()
        .enumerate()
        .map(|(idx, turn)| {
            let mut media: Vec<Value> = turn
                .content
                .image_urls()
                .into_iter()
                .map(encode_image_url)
                .collect();
            if Some(idx) == last_user {
                if let Some(attachment) = &req.attachment {
                    media.push(inline_data(attachment));
                }
            }
            HistoryTurn {
                role: turn.role,
                text: turn.content.text(),
                media,
            }
        })
        .collect()
}

fn encode_turn(turn: &HistoryTurn) -> Value {
    let role = match turn.role {
        Role::Assistant => "model",
        Role::User => "user",
    };
    let mut parts = Vec::with_capacity(turn.media.len() + 1);
    if !turn.text.is_empty() || turn.media.is_empty() {
        parts.push(json!({ "text": turn.text }));
    }
    parts.extend(turn.media.iter().cloned());
    json!({ "role": role, "parts": parts })
}

fn inline_data(attachment: &ImageAttachment) -> Value {
    json!({
        "inlineData": {
            "mimeType": attachment.mime_type,
            "data": attachment.base64_data,
        }
    })
}

fn encode_image_url(url: &str) -> Value {
    match parse_data_url(url) {
        Some(attachment) => inline_data(&attachment),
        None => json!({ "fileData": { "mimeType": "image/*", "fileUri": url } }),
    }
}

/// Text of `candidates[0].content.parts`, skipping thought parts.
///
/// `None` when the candidate carries no text part at all.
pub fn candidate_text(value: &Value) -> Option<String> {
    let parts = value
        .get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let mut out: Option<String> = None;
    for part in parts {
        if part.get("thought").and_then(|v| v.as_bool()) == Some(true) {
            continue;
        }
        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
            out.get_or_insert_with(String::new).push_str(text);
        }
    }
    out
}

pub fn unwrap_reply(body: &Value) -> Result<String, ChatError> {
    if let Some(text) = candidate_text(body) {
        return Ok(text);
    }
    if let Some(reason) = body
        .get("promptFeedback")
        .and_then(|v| v.get("blockReason"))
        .and_then(|v| v.as_str())
    {
        return Err(ChatError::UnexpectedResponseShape(format!(
            "prompt blocked by gemini: {reason}"
        )));
    }
    Err(ChatError::UnexpectedResponseShape(
        "missing candidates[0].content.parts[0].text".to_string(),
    ))
}
