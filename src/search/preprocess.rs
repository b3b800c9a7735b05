//! Content preprocessing for embedding generation.
//!
//! Prepares a record for embedding:
//! 1. `name` and `alt_name` with commas turned into spaces
//! 2. `notes`
//! 3. Trim, drop empty parts, join with ". "

use sha2::{Digest, Sha256};

use crate::records::Record;

/// Maximum embedding input length (characters, not tokens)
pub const MAX_EMBEDDING_CHARS: usize = 512;

fn clean(part: Option<&str>, strip_commas: bool) -> Option<String> {
    let part = part?;
    let part = if strip_commas {
        part.replace(',', " ")
    } else {
        part.to_string()
    };
    let part = part.split_whitespace().collect::<Vec<_>>().join(" ");

    (!part.is_empty()).then_some(part)
}

/// Text fed to the embedding model for a record.
///
/// Returns `None` when every field is blank.
pub fn embedding_text(record: &Record) -> Option<String> {
    let parts: Vec<String> = [
        clean(Some(&record.name), true),
        clean(record.alt_name.as_deref(), true),
        clean(record.notes.as_deref(), false),
    ]
    .into_iter()
    .flatten()
    .collect();

    if parts.is_empty() {
        return None;
    }

    Some(parts.join(". "))
}

/// Cut text to `MAX_EMBEDDING_CHARS` on a char boundary.
pub fn truncate_for_embedding(text: &str) -> &str {
    match text.char_indices().nth(MAX_EMBEDDING_CHARS) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Stable hash of the embedding text, used to detect records whose stored
/// vector no longer matches their content.
pub fn content_hash(text: &str) -> u64 {
    let digest = Sha256::digest(text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}
