//! Built-in dispatchers: header negotiation, body decoding, status.

mod accept;
mod content_type;
mod json;
mod method;
mod status;

pub use accept::AcceptSelector;
pub use content_type::ContentTypeSelector;
pub use json::JsonBody;
pub use method::MethodSelector;
pub use status::StatusDispatcher;

/// Wildcard-tolerant media type matching: a supported entry matches a
/// client preference when one is a prefix of the other, with the
/// supported side truncated at its first `*`.
pub(crate) fn media_matches(supported: &str, client: &str) -> bool {
    supported.starts_with(client)
        || client.starts_with(supported.split('*').next().unwrap_or(""))
}

/// Normalize one media entry from a header: lowercased, parameters and
/// wildcards stripped.
pub(crate) fn normalize_media(entry: &str) -> String {
    let entry = entry.trim().to_ascii_lowercase();
    let entry = entry.split(';').next().unwrap_or("");
    entry.split('*').next().unwrap_or("").to_string()
}
