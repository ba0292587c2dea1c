//! Content excerpt extraction for classification prompts.
//!
//! Attachments that carry extractable text (PDF, plain text) contribute a
//! bounded excerpt to the classification prompt; everything else
//! contributes none. Extraction never fails the pipeline: any error
//! downgrades to "no excerpt".

pub const MIME_PDF: &str = "application/pdf";

/// Produce a plain-text excerpt of at most `max_chars` characters from an
/// attachment body, or `None` when the content type is not extractable or
/// extraction fails.
pub fn content_excerpt(bytes: &[u8], mime_type: &str, max_chars: usize) -> Option<String> {
    let text = match mime_type {
        MIME_PDF => pdf_extract::extract_text_from_mem(bytes).ok()?,
        t if t.starts_with("text/") => String::from_utf8_lossy(bytes).into_owned(),
        _ => return None,
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    Some(truncate_chars(trimmed, max_chars))
}

/// Truncate on a character boundary, never mid-codepoint.
fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_excerpt() {
        let excerpt = content_excerpt(b"  Total due: $42.00  ", "text/plain", 500).unwrap();
        assert_eq!(excerpt, "Total due: $42.00");
    }

    #[test]
    fn test_excerpt_truncated_to_limit() {
        let body = "x".repeat(1000);
        let excerpt = content_excerpt(body.as_bytes(), "text/plain", 500).unwrap();
        assert_eq!(excerpt.chars().count(), 500);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let body = "é".repeat(10);
        let excerpt = content_excerpt(body.as_bytes(), "text/csv", 4).unwrap();
        assert_eq!(excerpt, "éééé");
    }

    #[test]
    fn test_binary_types_yield_no_excerpt() {
        assert!(content_excerpt(&[0xFF, 0xD8, 0xFF], "image/jpeg", 500).is_none());
        assert!(content_excerpt(b"PK\x03\x04", "application/zip", 500).is_none());
    }

    #[test]
    fn test_invalid_pdf_yields_no_excerpt() {
        assert!(content_excerpt(b"not a pdf at all", MIME_PDF, 500).is_none());
    }

    #[test]
    fn test_empty_text_yields_no_excerpt() {
        assert!(content_excerpt(b"   \n  ", "text/plain", 500).is_none());
    }
}
