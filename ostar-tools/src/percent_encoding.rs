use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Everything but ASCII alphanumerics and `-`, `_`, `.`, `~` gets escaped.
pub const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum UnescapeError {
    #[error("invalid escape sequence {0:?}")]
    InvalidEscape(String),
    #[error("escaped value is not valid utf-8")]
    InvalidUtf8,
}

/// Escape a string for use in a url query, spaces become `+`.
pub fn query_escape(text: &str) -> String {
    // '%' itself is escaped, so "%20" can only originate from a space
    utf8_percent_encode(text, QUERY_ENCODE_SET)
        .to_string()
        .replace("%20", "+")
}

/// Inverse of [`query_escape`]. Rejects truncated or non-hex escapes.
pub fn query_unescape(text: &str) -> Result<String, UnescapeError> {
    let bytes = text.as_bytes();
    for (pos, _) in text.match_indices('%') {
        let valid = bytes.len() > pos + 2
            && bytes[pos + 1].is_ascii_hexdigit()
            && bytes[pos + 2].is_ascii_hexdigit();
        if !valid {
            let end = bytes.len().min(pos + 3);
            return Err(UnescapeError::InvalidEscape(
                String::from_utf8_lossy(&bytes[pos..end]).into_owned(),
            ));
        }
    }

    let text = text.replace('+', " ");
    percent_decode_str(&text)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| UnescapeError::InvalidUtf8)
}
