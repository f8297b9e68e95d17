//! Preview renditions served by `GET /file?preview=true`.
//!
//! Generators are registered explicitly as `(pattern, generator)` pairs and
//! tried in registration order; the first matching pattern wins.
//!
//! ```text
//! pattern        matches
//! ───────        ───────
//! "text/*"       any mime starting with "text/"
//! "image/png"    exactly that mime
//! "*.md"         names ending in ".md" (case-insensitive)
//! "*"            everything
//! ```

use std::sync::Arc;

use gobox_core::mime::{guess_mime, is_textual, OCTET_STREAM};
use gobox_core::FileNode;

use crate::error::SyncResult;

/// Bytes served by the built-in text preview.
pub const TEXT_PREVIEW_BYTES: usize = 4096;

/// A rendered preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub content_type: String,
    pub body: Vec<u8>,
}

pub type PreviewGenerator = Arc<dyn Fn(&FileNode, &[u8]) -> SyncResult<Preview> + Send + Sync>;

/// Ordered preview generators.
#[derive(Default, Clone)]
pub struct PreviewRegistry {
    entries: Vec<(String, PreviewGenerator)>,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in text preview for textual types.
    pub fn with_builtin() -> Self {
        let text: PreviewGenerator = Arc::new(text_preview);
        let mut registry = Self::new();
        for pattern in [
            "text/*",
            "application/json",
            "application/toml",
            "application/xml",
            "application/yaml",
        ] {
            registry = registry.register(pattern, text.clone());
        }
        registry
    }

    /// Appends a generator; earlier registrations take precedence.
    pub fn register(mut self, pattern: impl Into<String>, generator: PreviewGenerator) -> Self {
        self.entries.push((pattern.into(), generator));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders a preview with the first matching generator, `None` when no
    /// pattern matches.
    pub fn render(&self, node: &FileNode, content: &[u8]) -> Option<SyncResult<Preview>> {
        let mime = mime_of(node);
        self.entries
            .iter()
            .find(|(pattern, _)| matches(pattern, &mime, &node.name))
            .map(|(_, generator)| generator(node, content))
    }
}

/// Stored mime, else one guessed from the name.
pub fn mime_of(node: &FileNode) -> String {
    node.mime
        .clone()
        .or_else(|| guess_mime(&node.name).map(str::to_string))
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

fn matches(pattern: &str, mime: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return name.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase());
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return mime.starts_with(prefix);
    }
    mime == pattern
}

/// First [`TEXT_PREVIEW_BYTES`] of a textual file, cut on a character
/// boundary.
pub fn text_preview(node: &FileNode, content: &[u8]) -> SyncResult<Preview> {
    let limit = content.len().min(TEXT_PREVIEW_BYTES);
    let end = match std::str::from_utf8(&content[..limit]) {
        // Only a character split by the cut: drop its leading bytes.
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        _ => limit,
    };
    let text = String::from_utf8_lossy(&content[..end]);
    let mime = mime_of(node);
    let content_type = if is_textual(&mime) {
        "text/plain; charset=utf-8".to_string()
    } else {
        mime
    };
    Ok(Preview {
        content_type,
        body: text.into_owned().into_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gobox_core::timestamp_now;

    fn file(name: &str) -> FileNode {
        FileNode {
            id: 5,
            parent_id: 0,
            name: name.to_string(),
            is_directory: false,
            visible: true,
            size: 0,
            created_at: timestamp_now(),
            modified_at: timestamp_now(),
            mime: None,
        }
    }

    fn fixed(tag: &'static str) -> PreviewGenerator {
        Arc::new(move |_: &FileNode, _: &[u8]| {
            Ok(Preview {
                content_type: "text/plain".into(),
                body: tag.as_bytes().to_vec(),
            })
        })
    }

    #[test]
    fn test_first_match_wins() {
        let registry = PreviewRegistry::new()
            .register("*.md", fixed("markdown"))
            .register("text/*", fixed("text"));

        let md = registry.render(&file("README.md"), b"# hi").unwrap().unwrap();
        assert_eq!(md.body, b"markdown");
        let txt = registry.render(&file("notes.txt"), b"hi").unwrap().unwrap();
        assert_eq!(txt.body, b"text");
        assert!(registry.render(&file("photo.png"), b"").is_none());
    }

    #[test]
    fn test_builtin_text_preview_is_truncated() {
        let registry = PreviewRegistry::with_builtin();
        let content = "a".repeat(10_000);
        let preview = registry
            .render(&file("big.log"), content.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(preview.body.len(), TEXT_PREVIEW_BYTES);
        assert_eq!(preview.content_type, "text/plain; charset=utf-8");
    }

    #[test]
    fn test_text_preview_respects_char_boundaries() {
        let mut content = "a".repeat(TEXT_PREVIEW_BYTES - 1).into_bytes();
        content.extend("é".as_bytes());
        let preview = text_preview(&file("x.txt"), &content).unwrap();
        assert_eq!(preview.body.len(), TEXT_PREVIEW_BYTES - 1);
    }
}
