//! Durable record of per-file processing outcomes.

mod base;
pub mod memory;
pub mod postgres;

pub use base::{ClaimOutcome, FileLedger, LedgerEntry, LedgerStatus, MarkOutcome};

/// Truncates `message` to at most `max_chars` characters, on a character boundary.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((index, _)) => message[..index].to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_message("abcdef", 3), "abc");
        assert_eq!(truncate_message("abc", 10), "abc");
        assert_eq!(truncate_message("ééé", 2), "éé");
    }
}
