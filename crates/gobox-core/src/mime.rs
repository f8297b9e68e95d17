//! Extension based content type guessing.
//!
//! The store records a mime type for files so that previews and downloads
//! can pick a rendition without sniffing bytes.

/// Content type assumed when nothing better is known.
pub const OCTET_STREAM: &str = "application/octet-stream";

const TABLE: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("csv", "text/csv"),
    ("log", "text/plain"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("json", "application/json"),
    ("toml", "application/toml"),
    ("xml", "application/xml"),
    ("yaml", "application/yaml"),
    ("yml", "application/yaml"),
    ("rs", "text/x-rust"),
    ("py", "text/x-python"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
];

/// Guesses a mime type from a file name's extension (case-insensitive).
pub fn guess_mime(name: &str) -> Option<&'static str> {
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    TABLE
        .iter()
        .find(|(candidate, _)| *candidate == ext)
        .map(|(_, mime)| *mime)
}

/// Whether content of this type is human readable text.
pub fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/")
        || matches!(
            mime,
            "application/json" | "application/toml" | "application/xml" | "application/yaml"
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime("report.PDF"), Some("application/pdf"));
        assert_eq!(guess_mime("notes.txt"), Some("text/plain"));
        assert_eq!(guess_mime("Makefile"), None);
        assert_eq!(guess_mime("archive.unknown"), None);
    }

    #[test]
    fn test_is_textual() {
        assert!(is_textual("text/x-rust"));
        assert!(is_textual("application/json"));
        assert!(!is_textual("image/png"));
    }
}
