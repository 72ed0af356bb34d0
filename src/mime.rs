//! Content-Type lookup by file extension

use std::path::Path;

/// Content-Type for a path, guessed from its extension. Text and script
/// types are labelled UTF-8.
pub fn content_type_for(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    let textual = mime.type_() == mime_guess::mime::TEXT
        || mime.subtype().as_str().contains("javascript");
    if textual && mime.get_param(mime_guess::mime::CHARSET).is_none() {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.as_ref().to_string()
    }
}
