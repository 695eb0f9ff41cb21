use common::error::AppError;
use dom_smoothie::{Readability, TextMode};
use mime_guess::from_path;
use std::path::Path;
use tracing::debug;

/// Guesses the MIME type from the filename, falling back to octet-stream.
pub fn detect_content_type(filename: &str) -> String {
    from_path(Path::new(filename))
        .first_or(mime::APPLICATION_OCTET_STREAM)
        .to_string()
}

/// Turns an uploaded artifact into plain text, dispatching on the detected
/// content type. Decoded text longer than `max_text_length` is rejected
/// outright rather than silently truncated.
pub fn decode_document(
    filename: &str,
    bytes: &[u8],
    max_text_length: usize,
) -> Result<String, AppError> {
    let content_type = detect_content_type(filename);
    let text = match content_type.as_str() {
        "text/plain" | "text/markdown" | "text/csv" | "application/csv" => utf8_text(bytes)?,
        "text/html" => html_text(bytes)?,
        "application/pdf" => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| AppError::InvalidArgument(format!("pdf decoding failed: {e}")))?,
        other => {
            // Unknown extensions still ingest when the payload is valid UTF-8.
            match std::str::from_utf8(bytes) {
                Ok(text) => text.to_string(),
                Err(_) => {
                    return Err(AppError::InvalidArgument(format!(
                        "unsupported document format: {other}"
                    )))
                }
            }
        }
    };

    let length = text.chars().count();
    if length > max_text_length {
        return Err(AppError::QuotaExceeded(format!(
            "decoded text is {length} characters, limit is {max_text_length}"
        )));
    }

    debug!(filename, %content_type, text_chars = length, "decoded document");
    Ok(text)
}

fn utf8_text(bytes: &[u8]) -> Result<String, AppError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| AppError::InvalidArgument(format!("document is not valid UTF-8: {e}")))
}

fn html_text(bytes: &[u8]) -> Result<String, AppError> {
    let raw = utf8_text(bytes)?;
    let config = dom_smoothie::Config {
        text_mode: TextMode::Markdown,
        ..Default::default()
    };
    let mut readability = Readability::new(raw, None, Some(config))
        .map_err(|e| AppError::InvalidArgument(format!("html parsing failed: {e}")))?;
    let article = readability
        .parse()
        .map_err(|e| AppError::InvalidArgument(format!("html extraction failed: {e}")))?;
    Ok(article.text_content.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_types() {
        assert_eq!(detect_content_type("notes.md"), "text/markdown");
        assert_eq!(detect_content_type("contract.pdf"), "application/pdf");
        assert_eq!(detect_content_type("table.csv"), "text/csv");
        assert_eq!(
            detect_content_type("mystery.bin"),
            "application/octet-stream"
        );
    }

    #[test]
    fn plain_text_roundtrips() {
        let text = decode_document("a.txt", "bonjour".as_bytes(), 1_000).expect("decode");
        assert_eq!(text, "bonjour");
    }

    #[test]
    fn markdown_is_passed_through() {
        let source = "# Article 15\n\nRésiliation sous 30 jours.";
        let text = decode_document("contrat.md", source.as_bytes(), 1_000).expect("decode");
        assert_eq!(text, source);
    }

    #[test]
    fn oversized_text_is_a_quota_error() {
        let big = "x".repeat(100);
        let err = decode_document("big.txt", big.as_bytes(), 99).unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded(_)));
    }

    #[test]
    fn binary_garbage_is_rejected() {
        let err = decode_document("img.docx", &[0xff, 0xfe, 0x00, 0x01], 1_000).unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[test]
    fn html_is_reduced_to_text() {
        let html = "<html><head><title>T</title></head><body><article><h1>Conditions</h1>\
                    <p>La résiliation est possible sous trente jours.</p></article></body></html>";
        let text = decode_document("page.html", html.as_bytes(), 10_000).expect("decode");
        assert!(text.contains("résiliation"), "got: {text}");
    }
}
