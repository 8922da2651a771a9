use regex::Regex;
use std::sync::OnceLock;

/// An inline image carried as a `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub mime_type: String,
    pub base64_data: String,
}

impl ImageAttachment {
    /// Rebuilds the data URL. Equal to the parsed input since both groups are kept verbatim.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64_data)
    }
}

fn data_url_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| match Regex::new(r"^data:(image/[^;]+);base64,(.+)$") {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                tracing::error!(error = %err, "data url pattern failed to compile");
                None
            }
        })
        .as_ref()
}

/// Splits a `data:image/<subtype>;base64,<payload>` URL.
///
/// Anything else is reported as `None`; callers degrade to a text-only turn.
pub fn parse_data_url(input: &str) -> Option<ImageAttachment> {
    let captures = data_url_pattern()?.captures(input)?;
    let mime_type = captures.get(1)?.as_str();
    let base64_data = captures.get(2)?.as_str();
    Some(ImageAttachment {
        mime_type: mime_type.to_string(),
        base64_data: base64_data.to_string(),
    })
}
