use serde::Serialize;
use serde_json::Value;
use url::Url;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "m4v"];

/// Nested locations where ClickUp comment blocks carry an attachment URL, in
/// lookup order.
const URL_PATHS: &[&[&str]] = &[
    &["image", "url"],
    &["attachment", "url"],
    &["url"],
    &["value", "url"],
    &["file", "url"],
];

/// Type hint declared on a comment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredType {
    Image,
    Video,
    Unknown,
}

impl DeclaredType {
    fn from_block(block: &Value) -> Self {
        match block.get("type").and_then(Value::as_str) {
            Some("image") => Self::Image,
            Some("video") => Self::Video,
            _ => Self::Unknown,
        }
    }
}

/// Attachment URLs of a single message, partitioned by kind in payload order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifiedAttachments {
    pub images: Vec<String>,
    pub videos: Vec<String>,
    pub invalid: Vec<String>,
}

impl ClassifiedAttachments {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.videos.is_empty() && self.invalid.is_empty()
    }
}

/// Partitions the URLs referenced by comment blocks into images, videos and
/// invalid entries. Blocks without a resolvable URL are skipped.
pub fn classify_attachments(blocks: &[Value]) -> ClassifiedAttachments {
    let mut classified = ClassifiedAttachments::default();

    for block in blocks {
        let Some(raw_url) = resolve_url(block) else {
            continue;
        };
        let url = raw_url.to_string();

        if !is_valid_http_url(&url) {
            classified.invalid.push(url);
            continue;
        }

        // Declared images, image extensions and untyped URLs all land in `images`.
        if DeclaredType::from_block(block) == DeclaredType::Video || is_likely_video(&url) {
            classified.videos.push(url);
        } else {
            classified.images.push(url);
        }
    }

    classified
}

fn resolve_url(block: &Value) -> Option<&str> {
    URL_PATHS.iter().find_map(|path| {
        path.iter()
            .try_fold(block, |node, key| node.get(key))
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    })
}

/// Returns `true` for absolute `http`/`https` URLs.
pub fn is_valid_http_url(value: &str) -> bool {
    Url::parse(value)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}

pub fn is_likely_video(value: &str) -> bool {
    has_extension(value, VIDEO_EXTENSIONS)
}

fn has_extension(value: &str, extensions: &[&str]) -> bool {
    let path = match Url::parse(value) {
        Ok(url) => url.path().to_string(),
        Err(_) => value.to_string(),
    };
    path.rsplit_once('.')
        .map(|(_, ext)| extensions.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}
