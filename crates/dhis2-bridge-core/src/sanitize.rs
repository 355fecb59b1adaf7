//! Column-name sanitization.
//!
//! Every maximal run of non-word characters (anything other than a Unicode
//! alphanumeric or `_`) becomes a single underscore, then leading and
//! trailing underscores are stripped:
//!
//! ```text
//! "105-EP01c. Malaria (B/s)"  →  "105_EP01c_Malaria_B_s"
//! "ANC 1st visit"             →  "ANC_1st_visit"
//! ```
//!
//! The mapping depends on the input string only. Dataset metadata, host
//! query references, and result columns are produced on three separate code
//! paths and agree only because each of them calls [`sanitize`].

/// Prefix used for labels that contain no word characters at all.
pub const PLACEHOLDER: &str = "col";

/// Map an arbitrary label to a stable identifier.
///
/// Idempotent: `sanitize(&sanitize(x)) == sanitize(x)`. Returns an empty
/// string when the label has no alphanumeric characters; callers that need
/// a non-empty name use [`sanitize_or_placeholder`].
pub fn sanitize(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut in_separator = false;

    for c in label.chars() {
        if is_word_char(c) {
            out.push(c);
            in_separator = false;
        } else if !in_separator {
            out.push('_');
            in_separator = true;
        }
    }

    out.trim_matches('_').to_string()
}

/// Like [`sanitize`], but never empty.
///
/// Labels without any alphanumeric character map to `col_<position>`.
/// `position` is supplied by the caller; uniqueness of the result is the
/// caller's responsibility.
pub fn sanitize_or_placeholder(label: &str, position: usize) -> String {
    let name = sanitize(label);
    if name.chars().any(char::is_alphanumeric) {
        name
    } else {
        format!("{}_{}", PLACEHOLDER, position)
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
