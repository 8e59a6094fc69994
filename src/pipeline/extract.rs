//! Picks the single body string a pipeline run works on.
//!
//! Plain text is taken as-is. HTML is only a fallback, converted with `html2text`
//! after images and link targets have been stripped so neither shows up in the
//! text handed to the rewriter.

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;

/// Column width used for HTML conversion.
const HTML_WRAP_WIDTH: usize = 80;

static IMG_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<img\b[^>]*>").unwrap());
static ANCHOR_HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)(<a\b[^>]*?)\s+href\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#).unwrap()
});

/// Selects the body of an email.
///
/// An empty `text` counts as missing, the same as an empty `html`. Returns `None`
/// when neither part yields any text.
pub fn extract_body(text: Option<&str>, html: Option<&str>) -> Option<String> {
    if let Some(text) = text.filter(|t| !t.is_empty()) {
        debug!("Using text/plain part ({} bytes)", text.len());
        return Some(text.to_string());
    }

    let html = html.filter(|h| !h.is_empty())?;
    debug!("No text/plain part, converting text/html ({} bytes)", html.len());
    html_to_text(html).filter(|body| !body.is_empty())
}

/// Converts HTML to plain text, keeping link text but not link targets, and
/// dropping images without a placeholder.
pub fn html_to_text(html: &str) -> Option<String> {
    let without_images = IMG_TAG.replace_all(html, "");
    let without_hrefs = ANCHOR_HREF.replace_all(&without_images, "${1}");

    match html2text::from_read(without_hrefs.as_bytes(), HTML_WRAP_WIDTH) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("Failed to convert HTML body to text: {}", e);
            None
        }
    }
}
