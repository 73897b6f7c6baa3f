use std::sync::LazyLock;

use regex::Regex;

static MARKDOWN_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("markdown image pattern"));
static MARKDOWN_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("markdown link pattern"));
static HTML_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<img[^>]*>").expect("html image pattern"));
static HTML_ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<a[^>]*>(.*?)</a>").expect("html anchor pattern"));
static MEDIA_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b\S+\.(png|jpe?g|gif|webp|svg|bmp|tiff?|mp4|mov|avi|mkv|webm|m4v)\b")
        .expect("media filename pattern")
});
static HTTP_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)https?://\S+").expect("url pattern"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

/// Reduces ClickUp comment text to the words the author typed.
///
/// Image markup is dropped, links keep their visible text, bare media
/// filenames and URLs are removed and whitespace is collapsed.
pub fn extract_message(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let text = MARKDOWN_IMAGE.replace_all(text, " ");
    let text = MARKDOWN_LINK.replace_all(&text, "$1 ");
    let text = HTML_IMAGE.replace_all(&text, " ");
    let text = HTML_ANCHOR.replace_all(&text, "$1 ");
    let text = MEDIA_FILENAME.replace_all(&text, " ");
    let text = HTTP_URL.replace_all(&text, " ");
    let text = WHITESPACE.replace_all(&text, " ");
    text.trim().to_string()
}
