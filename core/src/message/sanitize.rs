// Outbound content validation

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message is empty")]
    Empty,
    #[error("Message too long: {len} characters (max {max})")]
    TooLong { len: usize, max: usize },
    #[error("Message contains no displayable characters")]
    NothingLeft,
}

fn is_stripped(c: char) -> bool {
    match c {
        '\n' | '\t' => false,
        // zero-width and word-joiner
        '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}' => true,
        // bidi embedding, override and isolate controls
        '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}' => true,
        c => c.is_control(),
    }
}

/// Remove control, zero-width and bidi-override characters.
pub fn sanitize_message(content: &str) -> String {
    content.chars().filter(|c| !is_stripped(*c)).collect()
}

/// Validate and sanitize user content. Returns the text to send.
pub fn validate_message(content: &str, max_len: usize) -> Result<String, ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let len = content.chars().count();
    if len > max_len {
        return Err(ValidationError::TooLong { len, max: max_len });
    }
    let cleaned = sanitize_message(content);
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(ValidationError::NothingLeft);
    }
    Ok(cleaned.to_string())
}
